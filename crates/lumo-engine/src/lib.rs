//! Lumo VM runtime
//!
//! This crate provides the virtual machine runtime including:
//! - Bytecode interpreter with typed-array fast paths
//! - Incremental mark & sweep garbage collector
//! - Hybrid table model (generic tables, integer/float arrays, slices)
//! - Closures with shared upvalue cells
//! - Metamethod dispatch
//! - Cooperative coroutines
//! - The embedder-facing stack API
//!
//! The compiler front end is a separate concern: this crate consumes
//! prototypes built through [`bytecode::ProtoBuilder`] or loaded from a
//! binary dump.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod bytecode;
pub mod gc;
pub mod interp;
pub mod object;
pub mod state;

pub use api::CompareOp;
pub use bytecode::{Constant, ProtoBuilder, UpvalSpec};
pub use gc::{
    CClosureRef, ClosureRef, HeapStats, ProtoRef, StrRef, TableRef, ThreadRef, UpvalRef,
    UserdataRef,
};
pub use interp::ArithOp;
pub use lumo_core::{Status, TypeTag};
pub use object::{CFunction, Continuation, Hook, HookEvent, Unwind, Value};
pub use state::{CoStatus, Vm, VmOptions, MASK_CALL, MASK_COUNT, MASK_LINE, MASK_RET};

/// Errors surfaced to the embedder outside the protected-call channel.
///
/// Protected calls report failures as a [`Status`] plus an error value on
/// the stack; this enum covers the host-facing operations that return a
/// `Result` instead (loading, dumping, API misuse).
#[derive(Debug, thiserror::Error)]
pub enum LumoError {
    /// Runtime error escaping an unprotected entry point
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Malformed or truncated bytecode
    #[error("bad bytecode: {0}")]
    Syntax(String),

    /// Allocation failure or heap ceiling reached
    #[error("not enough memory")]
    Memory,

    /// Error raised while running an error handler
    #[error("error in error handling")]
    Handler,

    /// I/O failure while reading or writing a dump
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl LumoError {
    /// Status code equivalent for this error.
    pub fn status(&self) -> Status {
        match self {
            LumoError::Runtime(_) => Status::ErrRun,
            LumoError::Syntax(_) | LumoError::Io(_) => Status::ErrSyntax,
            LumoError::Memory => Status::ErrMem,
            LumoError::Handler => Status::ErrErr,
        }
    }
}
