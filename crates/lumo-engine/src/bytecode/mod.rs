//! Bytecode artifacts: prototype construction and binary chunks
//!
//! The compiler front end is external; it hands prototypes to the VM
//! either through [`ProtoBuilder`] or as a binary chunk produced by
//! `dump` and consumed by `load`.

mod builder;
mod dump;
mod load;

pub use builder::{Constant, ProtoBuilder, UpvalSpec};
pub(crate) use builder::ENV_NAME;
pub(crate) use dump::dump_chunk;
pub(crate) use load::load_chunk;
