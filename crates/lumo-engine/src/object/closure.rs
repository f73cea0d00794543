//! Prototypes, language closures, and upvalue cells

use super::Value;
use crate::gc::{ClosureRef, ProtoRef, StrRef, ThreadRef, UpvalRef};
use lumo_core::{Instr, TypeCode};

/// Description of one upvalue a prototype captures.
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    /// True when the captured variable is a local of the enclosing
    /// function (so the cell aliases a stack slot while open); false when
    /// it is re-captured from the enclosing closure's own upvalues.
    pub in_stack: bool,
    /// Slot or upvalue index in the enclosing function
    pub index: u8,
    /// Static type annotation, enforced by `SETUPVALT`
    pub ty: Option<TypeCode>,
    /// Variable name, kept for diagnostics unless stripped
    pub name: Option<StrRef>,
}

/// Immutable compilation artifact of one function body.
#[derive(Debug)]
pub struct Proto {
    /// Number of fixed parameters
    pub num_params: u8,
    /// Accepts trailing varargs
    pub is_vararg: bool,
    /// Register slots this function needs
    pub max_stack: u8,
    /// Instruction stream
    pub code: Vec<Instr>,
    /// Constant pool
    pub consts: Vec<Value>,
    /// Upvalue descriptors
    pub upvals: Vec<UpvalDesc>,
    /// Nested function prototypes
    pub protos: Vec<ProtoRef>,
    /// Source chunk name, absent when stripped
    pub source: Option<StrRef>,
    /// Line of each instruction, empty when stripped
    pub line_info: Vec<u32>,
    /// Most recently created closure over this prototype; reused when a
    /// new closure would capture the identical cells. Never written while
    /// the prototype is black.
    pub(crate) cache: Option<ClosureRef>,
}

impl Proto {
    /// Rough heap footprint for GC accounting.
    pub(crate) fn approx_size(&self) -> usize {
        std::mem::size_of::<Proto>()
            + self.code.len() * 4
            + self.consts.len() * std::mem::size_of::<Value>()
            + self.upvals.len() * std::mem::size_of::<UpvalDesc>()
            + self.protos.len() * 4
            + self.line_info.len() * 4
    }

    /// Source line of the instruction at `pc`, if debug info is present.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }
}

/// A language closure: prototype plus one cell handle per upvalue.
#[derive(Debug, Clone)]
pub struct LClosure {
    /// The function body
    pub proto: ProtoRef,
    /// Shared upvalue cells, one per descriptor
    pub upvals: Vec<UpvalRef>,
}

/// Where an upvalue cell's storage currently lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Aliases a live stack slot of `thread`
    Open {
        /// Owning thread
        thread: ThreadRef,
        /// Absolute slot index in that thread's stack
        slot: usize,
    },
    /// Owns its value; the originating frame has unwound
    Closed(Value),
}

/// A shared mutable cell referenced by one or more closures.
///
/// Sibling closures capturing the same local share one cell, so writes
/// through either closure are visible through the other. Liveness is the
/// collector's job; there is no separate reference count.
#[derive(Debug, Clone, Copy)]
pub struct Upvalue {
    /// Open or closed storage
    pub state: UpvalueState,
}

impl Upvalue {
    /// A cell aliasing `slot` on `thread`.
    pub fn open(thread: ThreadRef, slot: usize) -> Self {
        Upvalue {
            state: UpvalueState::Open { thread, slot },
        }
    }

    /// A cell owning `value`.
    pub fn closed(value: Value) -> Self {
        Upvalue {
            state: UpvalueState::Closed(value),
        }
    }

    /// Stack slot this cell aliases, if open.
    pub fn open_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open { slot, .. } => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}
