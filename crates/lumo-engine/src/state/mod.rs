//! Interpreter state: the VM owner type and per-thread machinery
//!
//! One [`Vm`] is one thread group: it owns the heap, the registry, the
//! string intern pool, and every thread. All embedder operations take
//! `&mut Vm`, which is the cooperative single-thread lock the API contract
//! demands, enforced at compile time instead of at runtime.

mod thread;

pub use thread::ThreadState;
pub(crate) use thread::{
    CallInfo, CIST_HOOKED, CIST_LEQ, CIST_LUA, CIST_TAIL, CIST_YPCALL,
};
pub use thread::{MASK_CALL, MASK_COUNT, MASK_LINE, MASK_RET};

use crate::gc::{Heap, StrRef, TableRef, ThreadRef};
use crate::interp::meta::TM_NAMES;
use crate::object::{table, CFunction, LString, Table, Unwind, Value};
use lumo_core::limits::{self, MAX_STACK};
use lumo_core::Status;
use rustc_hash::FxHashMap;

/// Construction-time options.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Heap ceiling in bytes; 0 means unlimited. Breaching it surfaces as
    /// a memory error through the protected-call channel.
    pub max_heap_bytes: usize,
    /// GC pause percentage (how much the heap may grow before the next
    /// cycle starts).
    pub gc_pause: u32,
    /// GC step multiplier percentage.
    pub gc_step_mul: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            max_heap_bytes: 0,
            gc_pause: limits::GC_PAUSE_DEFAULT,
            gc_step_mul: limits::GC_STEP_MUL_DEFAULT,
        }
    }
}

/// Observable coroutine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// Fresh or yielded; can be resumed
    Suspended,
    /// The thread currently executing
    Running,
    /// Alive but resumed another coroutine
    Normal,
    /// Finished or failed; resuming is an error
    Dead,
}

/// A whole interpreter group: heap, registry, threads, and intern pool.
pub struct Vm {
    pub(crate) heap: Heap,
    /// The registry table, root of all embedder anchoring
    pub(crate) registry: TableRef,
    /// Intern pool: content hash -> strings with that hash
    pub(crate) intern: FxHashMap<u64, Vec<StrRef>>,
    /// Interned metamethod names, indexed by `TM as usize`
    pub(crate) tm_names: Vec<StrRef>,
    /// Default metatables per basic type tag
    pub(crate) basic_meta: [Option<TableRef>; 9],
    pub(crate) main: ThreadRef,
    /// Thread all API operations act on
    pub(crate) cur: ThreadRef,
    /// Threads suspended in `resume` below the current one
    pub(crate) resume_chain: Vec<ThreadRef>,
    /// Preallocated message for memory errors
    pub(crate) memerr: StrRef,
    /// Invoked when an error reaches an unprotected boundary
    pub(crate) panic: Option<CFunction>,
}

impl Vm {
    /// Create a fresh interpreter group with default options.
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default())
    }

    /// Create a fresh interpreter group.
    pub fn with_options(opts: VmOptions) -> Vm {
        let mut heap = Heap::new();
        heap.max_bytes = opts.max_heap_bytes;
        heap.pause = opts.gc_pause;
        heap.step_mul = opts.gc_step_mul.max(limits::GC_STEP_MUL_MIN);

        let main = heap.alloc_thread(ThreadState::new());
        let registry = heap.alloc_table(Table::new(limits::RIDX_LAST as usize, 0));
        let globals = heap.alloc_table(Table::new(0, 0));

        let mut vm = Vm {
            heap,
            registry,
            intern: FxHashMap::default(),
            tm_names: Vec::new(),
            basic_meta: [None; 9],
            main,
            cur: main,
            resume_chain: Vec::new(),
            memerr: StrRef(0), // patched below
            panic: None,
        };
        table::raw_seti(
            &mut vm.heap,
            registry,
            limits::RIDX_MAINTHREAD,
            Value::Thread(main),
        )
        .expect("registry init");
        table::raw_seti(
            &mut vm.heap,
            registry,
            limits::RIDX_GLOBALS,
            Value::Table(globals),
        )
        .expect("registry init");

        let tm_names: Vec<StrRef> = TM_NAMES
            .iter()
            .map(|n| vm_intern(&mut vm, n.as_bytes()))
            .collect();
        vm.tm_names = tm_names;
        vm.memerr = vm_intern(&mut vm, b"not enough memory");
        vm
    }

    /// Install a panic handler, returning the previous one.
    pub fn at_panic(&mut self, f: Option<CFunction>) -> Option<CFunction> {
        std::mem::replace(&mut self.panic, f)
    }

    /// Runtime version number.
    pub fn version(&self) -> i64 {
        limits::VERSION_NUM
    }

    // -----------------------------------------------------------------
    // Thread plumbing
    // -----------------------------------------------------------------

    pub(crate) fn th(&self) -> &ThreadState {
        self.heap.threads.get(self.cur.0)
    }

    pub(crate) fn th_mut(&mut self) -> &mut ThreadState {
        self.heap.threads.get_mut(self.cur.0)
    }

    pub(crate) fn thread(&self, r: ThreadRef) -> &ThreadState {
        self.heap.threads.get(r.0)
    }

    pub(crate) fn thread_mut(&mut self, r: ThreadRef) -> &mut ThreadState {
        self.heap.threads.get_mut(r.0)
    }

    /// The main thread handle.
    pub fn main_thread(&self) -> ThreadRef {
        self.main
    }

    /// Status of a coroutine.
    pub fn co_status(&self, co: ThreadRef) -> CoStatus {
        if co == self.cur {
            return CoStatus::Running;
        }
        let t = self.thread(co);
        match t.status {
            Status::Yield => CoStatus::Suspended,
            s if s.is_error() => CoStatus::Dead,
            _ => {
                if !t.started {
                    CoStatus::Suspended
                } else if t.frames.is_empty() {
                    CoStatus::Dead
                } else {
                    CoStatus::Normal
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Stack plumbing (current thread)
    // -----------------------------------------------------------------

    #[inline]
    pub(crate) fn stack_get(&self, i: usize) -> Value {
        self.th().stack[i]
    }

    #[inline]
    pub(crate) fn stack_set(&mut self, i: usize, v: Value) {
        self.th_mut().stack[i] = v;
    }

    #[inline]
    pub(crate) fn top(&self) -> usize {
        self.th().top
    }

    #[inline]
    pub(crate) fn set_top_raw(&mut self, t: usize) {
        self.th_mut().top = t;
    }

    /// Push assuming space was reserved.
    #[inline]
    pub(crate) fn push_raw(&mut self, v: Value) {
        let th = self.th_mut();
        th.stack[th.top] = v;
        th.top += 1;
    }

    #[inline]
    pub(crate) fn pop_raw(&mut self) -> Value {
        let th = self.th_mut();
        th.top -= 1;
        th.stack[th.top]
    }

    /// Ensure `extra` free slots above `top` on the current thread,
    /// growing the stack if needed. Raises a stack-overflow error at the
    /// hard ceiling.
    pub(crate) fn reserve_stack(&mut self, extra: usize) -> Result<(), Unwind> {
        let (top, len) = {
            let th = self.th();
            (th.top, th.stack.len())
        };
        let needed = top + extra;
        if needed <= len {
            return Ok(());
        }
        if needed > MAX_STACK {
            return Err(self.rt_error("stack overflow".to_string()));
        }
        let new_len = (len * 2).max(needed).min(MAX_STACK);
        self.th_mut().stack.resize(new_len, Value::Nil);
        self.heap
            .charge((new_len - len) * std::mem::size_of::<Value>());
        Ok(())
    }

    /// Infallible reservation for host-API pushes; panics at the hard
    /// ceiling, which `checkstack` lets embedders avoid.
    pub(crate) fn reserve_stack_host(&mut self, extra: usize) {
        let (top, len) = {
            let th = self.th();
            (th.top, th.stack.len())
        };
        let needed = top + extra;
        if needed <= len {
            return;
        }
        assert!(needed <= MAX_STACK, "stack overflow (use checkstack)");
        let new_len = (len * 2).max(needed).min(MAX_STACK);
        self.th_mut().stack.resize(new_len, Value::Nil);
        self.heap
            .charge((new_len - len) * std::mem::size_of::<Value>());
    }

    // -----------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------

    /// Intern or allocate a string and return its handle.
    pub(crate) fn new_string(&mut self, bytes: &[u8]) -> StrRef {
        vm_intern(self, bytes)
    }

    /// String bytes by handle.
    pub(crate) fn str_bytes(&self, r: StrRef) -> &[u8] {
        &self.heap.strings.get(r.0).bytes
    }

    // -----------------------------------------------------------------
    // Error construction
    // -----------------------------------------------------------------

    /// Runtime error with a fresh message string.
    pub(crate) fn rt_error(&mut self, msg: String) -> Unwind {
        let s = self.new_string(msg.as_bytes());
        Unwind::Error(Status::ErrRun, Value::Str(s))
    }

    /// Memory error carrying the preallocated message.
    pub(crate) fn mem_error(&self) -> Unwind {
        Unwind::Error(Status::ErrMem, Value::Str(self.memerr))
    }

    /// Conventional "attempt to <op> a <type> value" error.
    pub(crate) fn type_error(&mut self, op: &str, v: Value) -> Unwind {
        let msg = format!("attempt to {} a {} value", op, v.type_name());
        self.rt_error(msg)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

/// Intern pool lookup/insert. Free function so `Vm::with_options` can use
/// it mid-construction.
fn vm_intern(vm: &mut Vm, bytes: &[u8]) -> StrRef {
    let hash = LString::hash_bytes(bytes);
    if bytes.len() <= limits::MAX_SHORT_LEN {
        if let Some(bucket) = vm.intern.get(&hash) {
            for &r in bucket {
                if *vm.heap.strings.get(r.0).bytes == *bytes {
                    // revive a string the sweep has not reached yet
                    vm.heap.revive_string(r);
                    return r;
                }
            }
        }
        let r = vm
            .heap
            .alloc_string(LString::new(bytes.to_vec(), hash, true));
        vm.intern.entry(hash).or_default().push(r);
        r
    } else {
        vm.heap
            .alloc_string(LString::new(bytes.to_vec(), hash, false))
    }
}
