//! GC heap: slab arena, handles, and collection state
//!
//! Every collectable object lives in a slab keyed by a 32-bit handle; a
//! [`Value`](crate::object::Value) holds handles, never pointers, so stack
//! reallocation and object movement can never dangle. The collector is an
//! incremental mark & sweep driven by allocation debt: allocations charge
//! bytes against a debt counter and the interpreter runs collection steps
//! at its GC checkpoints whenever the debt is positive.
//!
//! Colors follow the classic tricolor scheme. Threads are special: their
//! stacks mutate constantly, so traversal leaves them gray and the atomic
//! phase re-traverses every live thread before sweeping begins. Objects
//! allocated during the mark and sweep phases are born black; they die no
//! earlier than the next cycle.

mod collect;

pub use collect::HeapStats;
pub(crate) use collect::finalize_pending;

use crate::object::{CClosure, LClosure, LString, Proto, Table, Upvalue, Userdata};
use crate::state::ThreadState;

macro_rules! define_ref {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

define_ref!(
    /// Handle to an interned or long string
    StrRef
);
define_ref!(
    /// Handle to a table, typed array, or slice
    TableRef
);
define_ref!(
    /// Handle to a function prototype
    ProtoRef
);
define_ref!(
    /// Handle to a language closure
    ClosureRef
);
define_ref!(
    /// Handle to a host closure
    CClosureRef
);
define_ref!(
    /// Handle to a userdata blob
    UserdataRef
);
define_ref!(
    /// Handle to a coroutine / thread
    ThreadRef
);
define_ref!(
    /// Handle to an upvalue cell
    UpvalRef
);

/// Tricolor mark state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    /// Not yet reached this cycle; collected if still white at sweep
    White,
    /// Reached, children pending
    Gray,
    /// Reached, children traversed
    Black,
}

/// Kind-erased handle used on the gray worklist and in barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcId {
    Str(StrRef),
    Table(TableRef),
    Proto(ProtoRef),
    Closure(ClosureRef),
    CClosure(CClosureRef),
    Userdata(UserdataRef),
    Thread(ThreadRef),
    Upval(UpvalRef),
}

struct Entry<T> {
    color: Color,
    value: T,
}

enum Slot<T> {
    Free,
    Live(Entry<T>),
}

/// Typed arena with a free list. Handles are indices and are only ever
/// invalidated by a sweep that proves the object unreachable.
pub(crate) struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Slab<T> {
    fn new() -> Self {
        Slab {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, color: Color, value: T) -> u32 {
        self.live += 1;
        let entry = Entry { color, value };
        match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Slot::Live(entry);
                i
            }
            None => {
                self.slots.push(Slot::Live(entry));
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub(crate) fn get(&self, i: u32) -> &T {
        match &self.slots[i as usize] {
            Slot::Live(e) => &e.value,
            Slot::Free => panic!("stale GC handle"),
        }
    }

    pub(crate) fn get_mut(&mut self, i: u32) -> &mut T {
        match &mut self.slots[i as usize] {
            Slot::Live(e) => &mut e.value,
            Slot::Free => panic!("stale GC handle"),
        }
    }

    fn color(&self, i: u32) -> Color {
        match &self.slots[i as usize] {
            Slot::Live(e) => e.color,
            Slot::Free => panic!("stale GC handle"),
        }
    }

    fn set_color(&mut self, i: u32, c: Color) {
        match &mut self.slots[i as usize] {
            Slot::Live(e) => e.color = c,
            Slot::Free => panic!("stale GC handle"),
        }
    }

    fn remove(&mut self, i: u32) -> T {
        let slot = std::mem::replace(&mut self.slots[i as usize], Slot::Free);
        match slot {
            Slot::Live(e) => {
                self.live -= 1;
                self.free.push(i);
                e.value
            }
            Slot::Free => panic!("double free of GC slot"),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_live(&self, i: u32) -> bool {
        matches!(self.slots[i as usize], Slot::Live(_))
    }

    pub(crate) fn live_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Live(_) => Some(i as u32),
            Slot::Free => None,
        })
    }
}

/// Kind-erased handle of a value's heap object, if it has one.
pub(crate) fn gc_id_of(v: crate::object::Value) -> Option<GcId> {
    use crate::object::Value;
    match v {
        Value::Str(r) => Some(GcId::Str(r)),
        Value::Table(r) => Some(GcId::Table(r)),
        Value::Closure(r) => Some(GcId::Closure(r)),
        Value::CClosure(r) => Some(GcId::CClosure(r)),
        Value::Userdata(r) => Some(GcId::Userdata(r)),
        Value::Thread(r) => Some(GcId::Thread(r)),
        Value::Nil
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::LightFn(_)
        | Value::LightUserdata(_) => None,
    }
}

/// Collection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Between cycles; waiting for debt to accumulate
    Pause,
    /// Propagating marks from the gray worklist
    Mark,
    /// Freeing white objects slab by slab
    Sweep,
}

/// The heap: one slab per object kind plus collector state.
pub struct Heap {
    pub(crate) strings: Slab<LString>,
    pub(crate) tables: Slab<Table>,
    pub(crate) protos: Slab<Proto>,
    pub(crate) closures: Slab<LClosure>,
    pub(crate) cclosures: Slab<CClosure>,
    pub(crate) userdata: Slab<Userdata>,
    pub(crate) threads: Slab<ThreadState>,
    pub(crate) upvals: Slab<Upvalue>,

    pub(crate) phase: Phase,
    pub(crate) gray: Vec<GcId>,
    /// Threads stay gray through the mark phase; the atomic step
    /// re-traverses and blackens them.
    pub(crate) gray_threads: Vec<ThreadRef>,
    /// Total bytes currently attributed to live objects (refreshed each cycle).
    pub(crate) total_bytes: usize,
    /// Live-byte estimate at the end of the last cycle.
    pub(crate) estimate: usize,
    /// Allocation debt; a positive value triggers collection steps.
    pub(crate) debt: i64,
    pub(crate) pause: u32,
    pub(crate) step_mul: u32,
    pub(crate) running: bool,
    /// Heap ceiling in bytes; 0 means unlimited. Exceeding it raises a
    /// memory error through the protected-call channel.
    pub(crate) max_bytes: usize,
    /// Sweep cursor: slab ordinal and slot index.
    pub(crate) sweep_at: (usize, usize),
    /// Objects whose finalizer must run before they can be freed.
    pub(crate) pending_fin: Vec<GcId>,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Heap {
            strings: Slab::new(),
            tables: Slab::new(),
            protos: Slab::new(),
            closures: Slab::new(),
            cclosures: Slab::new(),
            userdata: Slab::new(),
            threads: Slab::new(),
            upvals: Slab::new(),
            phase: Phase::Pause,
            gray: Vec::new(),
            gray_threads: Vec::new(),
            total_bytes: 0,
            estimate: 0,
            debt: -(8 * 1024),
            pause: lumo_core::limits::GC_PAUSE_DEFAULT,
            step_mul: lumo_core::limits::GC_STEP_MUL_DEFAULT,
            running: true,
            max_bytes: 0,
            sweep_at: (0, 0),
            pending_fin: Vec::new(),
        }
    }

    /// Color newborn objects: white between cycles, black while the
    /// collector is mid-cycle so they survive until the next one.
    fn birth_color(&self) -> Color {
        match self.phase {
            Phase::Pause => Color::White,
            Phase::Mark | Phase::Sweep => Color::Black,
        }
    }

    /// Record `bytes` of new allocation against the debt counter.
    pub(crate) fn charge(&mut self, bytes: usize) {
        self.total_bytes += bytes;
        self.debt += bytes as i64;
    }

    /// Nudge the debt counter after a container grew in place. Exact
    /// totals are refreshed at the end of each collection cycle.
    pub(crate) fn charge_growth(&mut self) {
        self.debt += 64;
    }

    /// True when the heap ceiling is configured and breached.
    pub(crate) fn over_limit(&self) -> bool {
        self.max_bytes != 0 && self.total_bytes > self.max_bytes
    }

    pub(crate) fn alloc_string(&mut self, s: LString) -> StrRef {
        let bytes = std::mem::size_of::<LString>() + s.bytes.len();
        self.charge(bytes);
        // strings have no children; born-white strings are marked directly
        // black when reached
        StrRef(self.strings.insert(self.birth_color(), s))
    }

    pub(crate) fn alloc_table(&mut self, t: Table) -> TableRef {
        self.charge(t.approx_size());
        TableRef(self.tables.insert(self.birth_color(), t))
    }

    pub(crate) fn alloc_proto(&mut self, p: Proto) -> ProtoRef {
        self.charge(p.approx_size());
        ProtoRef(self.protos.insert(self.birth_color(), p))
    }

    pub(crate) fn alloc_closure(&mut self, c: LClosure) -> ClosureRef {
        let bytes = std::mem::size_of::<LClosure>() + c.upvals.len() * 4;
        self.charge(bytes);
        ClosureRef(self.closures.insert(self.birth_color(), c))
    }

    pub(crate) fn alloc_cclosure(&mut self, c: CClosure) -> CClosureRef {
        let bytes = std::mem::size_of::<CClosure>() + c.upvals.len() * 16;
        self.charge(bytes);
        CClosureRef(self.cclosures.insert(self.birth_color(), c))
    }

    pub(crate) fn alloc_userdata(&mut self, u: Userdata) -> UserdataRef {
        let bytes = std::mem::size_of::<Userdata>() + u.data.len();
        self.charge(bytes);
        UserdataRef(self.userdata.insert(self.birth_color(), u))
    }

    pub(crate) fn alloc_thread(&mut self, t: ThreadState) -> ThreadRef {
        let bytes = std::mem::size_of::<ThreadState>() + t.stack.len() * 16;
        self.charge(bytes);
        ThreadRef(self.threads.insert(self.birth_color(), t))
    }

    pub(crate) fn alloc_upval(&mut self, u: Upvalue) -> UpvalRef {
        self.charge(std::mem::size_of::<Upvalue>());
        UpvalRef(self.upvals.insert(self.birth_color(), u))
    }

    pub(crate) fn color_of(&self, id: GcId) -> Color {
        match id {
            GcId::Str(r) => self.strings.color(r.0),
            GcId::Table(r) => self.tables.color(r.0),
            GcId::Proto(r) => self.protos.color(r.0),
            GcId::Closure(r) => self.closures.color(r.0),
            GcId::CClosure(r) => self.cclosures.color(r.0),
            GcId::Userdata(r) => self.userdata.color(r.0),
            GcId::Thread(r) => self.threads.color(r.0),
            GcId::Upval(r) => self.upvals.color(r.0),
        }
    }

    pub(crate) fn set_color(&mut self, id: GcId, c: Color) {
        match id {
            GcId::Str(r) => self.strings.set_color(r.0, c),
            GcId::Table(r) => self.tables.set_color(r.0, c),
            GcId::Proto(r) => self.protos.set_color(r.0, c),
            GcId::Closure(r) => self.closures.set_color(r.0, c),
            GcId::CClosure(r) => self.cclosures.set_color(r.0, c),
            GcId::Userdata(r) => self.userdata.set_color(r.0, c),
            GcId::Thread(r) => self.threads.set_color(r.0, c),
            GcId::Upval(r) => self.upvals.set_color(r.0, c),
        }
    }

    /// Forward barrier: keep the invariant "no black object points at a
    /// white object" when `child` is stored into black `parent`.
    pub(crate) fn barrier(&mut self, parent: GcId, child: GcId) {
        if self.phase == Phase::Mark
            && self.color_of(parent) == Color::Black
            && self.color_of(child) == Color::White
        {
            self.set_color(child, Color::Gray);
            self.gray.push(child);
        }
    }

    /// Backward barrier: re-gray a mutated black container so it is
    /// traversed again before sweeping.
    pub(crate) fn barrier_back(&mut self, id: GcId) {
        if self.phase == Phase::Mark && self.color_of(id) == Color::Black {
            self.set_color(id, Color::Gray);
            self.gray.push(id);
        }
    }

    /// Forward barrier taking the child as a value; inline values need no
    /// barrier.
    pub(crate) fn barrier_value(&mut self, parent: GcId, v: crate::object::Value) {
        if let Some(child) = gc_id_of(v) {
            self.barrier(parent, child);
        }
    }

    /// Keep an intern-pool hit alive when the sweep has not reached it
    /// yet. Harmless outside the sweep phase: strings are leaves, so an
    /// early black never hides a reference.
    pub(crate) fn revive_string(&mut self, r: StrRef) {
        if self.phase != Phase::Pause && self.strings.color(r.0) == Color::White {
            self.strings.set_color(r.0, Color::Black);
        }
    }

    /// Split borrow for table operations that must read string contents
    /// while mutating a table.
    pub(crate) fn table_and_strings_mut(
        &mut self,
        t: TableRef,
    ) -> (&mut Table, &Slab<LString>) {
        (self.tables.get_mut(t.0), &self.strings)
    }
}
