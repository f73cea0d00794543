//! Heap strings
//!
//! Strings at most [`MAX_SHORT_LEN`](lumo_core::limits::MAX_SHORT_LEN)
//! bytes are interned: equal contents share one handle, so handle equality
//! is value equality and doubles as the "pointer identity" embedders can
//! observe. Longer strings are plain heap objects compared by content.

use std::hash::{Hash, Hasher};

/// A byte string with its hash precomputed at creation.
#[derive(Debug, Clone)]
pub struct LString {
    /// Raw bytes; embedded NULs are ordinary data
    pub bytes: Box<[u8]>,
    /// Content hash, shared with the intern pool and table keys
    pub hash: u64,
    /// True when interned
    pub short: bool,
}

impl LString {
    /// Wrap prepared bytes. The caller supplies the hash so the intern
    /// pool can probe before allocating.
    pub fn new(bytes: Vec<u8>, hash: u64, short: bool) -> Self {
        LString {
            bytes: bytes.into_boxed_slice(),
            hash,
            short,
        }
    }

    /// Content hash for arbitrary bytes.
    pub fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        bytes.hash(&mut hasher);
        hasher.finish()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Is this the empty string?
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy UTF-8 view for messages and debugging.
    pub fn display(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}
