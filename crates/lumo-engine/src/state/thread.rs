//! Per-thread execution state: value stack, call frames, open upvalues

use crate::object::{Continuation, Hook, Value};
use crate::gc::UpvalRef;
use lumo_core::Status;

/// Frame status bit: the frame runs a language closure.
pub(crate) const CIST_LUA: u8 = 1 << 0;
/// Frame status bit: reached by a tail call; intermediate frames are gone.
pub(crate) const CIST_TAIL: u8 = 1 << 2;
/// Frame status bit: running `__lt` to decide a `<=`; the result must be
/// negated when the metamethod finishes, including across a yield.
pub(crate) const CIST_LEQ: u8 = 1 << 3;
/// Frame status bit: yieldable protected call; resume-side errors unwind
/// here and run the continuation.
pub(crate) const CIST_YPCALL: u8 = 1 << 4;
/// Frame status bit: currently running a hook.
pub(crate) const CIST_HOOKED: u8 = 1 << 5;

/// Hook mask bit: function entry.
pub const MASK_CALL: u8 = 1 << 0;
/// Hook mask bit: function return.
pub const MASK_RET: u8 = 1 << 1;
/// Hook mask bit: line transitions.
pub const MASK_LINE: u8 = 1 << 2;
/// Hook mask bit: every `count` instructions.
pub const MASK_COUNT: u8 = 1 << 3;

/// Activation record for one in-progress call.
#[derive(Debug, Clone)]
pub(crate) struct CallInfo {
    /// Stack slot holding the callable
    pub func: usize,
    /// First register of this frame
    pub base: usize,
    /// Frame ceiling: registers live in `base..top`
    pub top: usize,
    /// Next instruction index (language frames)
    pub saved_pc: usize,
    /// Expected result count; -1 means "all"
    pub nresults: i32,
    /// CIST_* bits
    pub status: u8,
    /// Continuation for host frames that may yield
    pub cont: Option<Continuation>,
    /// Context word passed back to the continuation
    pub ctx: i64,
    /// Error-handler stack index saved by a yieldable protected call
    pub saved_errfunc: usize,
}

impl CallInfo {
    pub(crate) fn is_lua(&self) -> bool {
        self.status & CIST_LUA != 0
    }
}

/// One thread of execution: a coroutine or the main thread.
///
/// The stack is a single contiguous vector; slots below `top` are live and
/// visible to the collector. Registers are base-relative offsets into it,
/// so growth can never invalidate a cached register index.
#[derive(Debug)]
pub struct ThreadState {
    pub(crate) stack: Vec<Value>,
    pub(crate) top: usize,
    pub(crate) frames: Vec<CallInfo>,
    /// Open upvalue cells, sorted by stack slot, highest first
    pub(crate) open_upvals: Vec<UpvalRef>,
    pub(crate) status: Status,
    /// Has this coroutine ever been resumed?
    pub(crate) started: bool,
    /// Non-yieldable nesting depth; yielding while positive is an error
    pub(crate) nny: u32,
    /// Native re-entry depth (metamethods, hooks, pcall drivers)
    pub(crate) n_calls: u32,
    /// Number of values sitting at the top after a yield
    pub(crate) n_yield: usize,
    /// Argument count of the resume in progress; a suspended host frame
    /// without a continuation adopts exactly these as its results
    pub(crate) resume_nargs: usize,
    pub(crate) hook: Option<Hook>,
    pub(crate) hook_mask: u8,
    pub(crate) hook_count: u32,
    pub(crate) hook_counter: u32,
    /// Cleared while a hook runs so hooks cannot recurse
    pub(crate) allow_hook: bool,
    /// Last line reported to the line hook
    pub(crate) last_line: u32,
}

/// Initial stack slots for a fresh thread.
pub(crate) const BASIC_STACK_SIZE: usize = 2 * lumo_core::limits::MIN_STACK;

impl ThreadState {
    /// Fresh thread with an empty frame chain. The main thread and
    /// coroutines start identically; a coroutine additionally gets its
    /// function pushed at slot 0 before the first resume.
    pub(crate) fn new() -> Self {
        ThreadState {
            stack: vec![Value::Nil; BASIC_STACK_SIZE],
            top: 0,
            frames: Vec::new(),
            open_upvals: Vec::new(),
            status: Status::Ok,
            started: false,
            nny: 1,
            n_calls: 0,
            n_yield: 0,
            resume_nargs: 0,
            hook: None,
            hook_mask: 0,
            hook_count: 0,
            hook_counter: 0,
            allow_hook: true,
            last_line: 0,
        }
    }

    /// The innermost frame. Callers only ask while at least one exists.
    pub(crate) fn ci(&self) -> &CallInfo {
        self.frames.last().expect("no active frame")
    }

    pub(crate) fn ci_mut(&mut self) -> &mut CallInfo {
        self.frames.last_mut().expect("no active frame")
    }

    /// Bytes of stack this thread contributes to GC accounting.
    pub(crate) fn approx_stack_bytes(&self) -> usize {
        self.stack.capacity() * std::mem::size_of::<Value>()
    }
}
