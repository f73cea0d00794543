//! Mark & sweep collection
//!
//! The cycle is Pause -> Mark -> (atomic) -> Sweep -> Pause. Steps run at
//! interpreter GC checkpoints whenever allocation debt is positive; each
//! step consumes a budget proportional to the debt and the step
//! multiplier. Thread stacks mutate continuously, so threads stay gray
//! through the mark phase and the atomic step re-traverses them all
//! before sweeping starts.

use super::{Color, GcId, Heap, Phase, TableRef, ThreadRef};
use crate::interp::meta::TM;
use crate::object::{table, Unwind, UpvalueState, Value};
use crate::state::Vm;

/// Slab ordinals for the sweep cursor.
const KIND_COUNT: usize = 8;

impl Heap {
    fn mark_value(&mut self, v: Value) {
        match v {
            Value::Str(r) => self.mark(GcId::Str(r)),
            Value::Table(r) => self.mark(GcId::Table(r)),
            Value::Closure(r) => self.mark(GcId::Closure(r)),
            Value::CClosure(r) => self.mark(GcId::CClosure(r)),
            Value::Userdata(r) => self.mark(GcId::Userdata(r)),
            Value::Thread(r) => self.mark(GcId::Thread(r)),
            Value::Nil
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::LightFn(_)
            | Value::LightUserdata(_) => {}
        }
    }

    /// Mark one object reachable. Leaves go straight to black; containers
    /// join the gray worklist; threads join the dedicated thread list.
    pub(crate) fn mark(&mut self, id: GcId) {
        if self.color_of(id) != Color::White {
            return;
        }
        match id {
            GcId::Str(_) => self.set_color(id, Color::Black),
            GcId::Thread(r) => {
                self.set_color(id, Color::Gray);
                self.gray_threads.push(r);
            }
            _ => {
                self.set_color(id, Color::Gray);
                self.gray.push(id);
            }
        }
    }

    /// Traverse one gray object, blackening it. Returns a rough work cost.
    fn traverse(&mut self, id: GcId) -> usize {
        self.set_color(id, Color::Black);
        match id {
            GcId::Str(_) => 1,
            GcId::Table(r) => {
                // collect children first; Table::trace borrows the slab
                let mut children: Vec<Value> = Vec::new();
                self.tables.get(r.0).trace(|v| children.push(v));
                let cost = children.len() + 1;
                for c in children {
                    self.mark_value(c);
                }
                cost
            }
            GcId::Proto(r) => {
                let (consts, protos, source, upval_names, cache) = {
                    let p = self.protos.get(r.0);
                    (
                        p.consts.clone(),
                        p.protos.clone(),
                        p.source,
                        p.upvals.iter().filter_map(|u| u.name).collect::<Vec<_>>(),
                        p.cache,
                    )
                };
                // a cache entry must not resurrect a dying closure
                if let Some(c) = cache {
                    if self.closures.color(c.0) == Color::White {
                        self.protos.get_mut(r.0).cache = None;
                    }
                }
                let cost = consts.len() + protos.len() + 2;
                for v in consts {
                    self.mark_value(v);
                }
                for p in protos {
                    self.mark(GcId::Proto(p));
                }
                if let Some(s) = source {
                    self.mark(GcId::Str(s));
                }
                for n in upval_names {
                    self.mark(GcId::Str(n));
                }
                cost
            }
            GcId::Closure(r) => {
                let (proto, upvals) = {
                    let c = self.closures.get(r.0);
                    (c.proto, c.upvals.clone())
                };
                self.mark(GcId::Proto(proto));
                for u in &upvals {
                    self.mark(GcId::Upval(*u));
                }
                upvals.len() + 2
            }
            GcId::CClosure(r) => {
                let upvals = self.cclosures.get(r.0).upvals.clone();
                for v in &upvals {
                    self.mark_value(*v);
                }
                upvals.len() + 1
            }
            GcId::Userdata(r) => {
                let (meta, uv) = {
                    let u = self.userdata.get(r.0);
                    (u.meta, u.user_value)
                };
                if let Some(m) = meta {
                    self.mark(GcId::Table(m));
                }
                self.mark_value(uv);
                2
            }
            GcId::Thread(r) => self.traverse_thread(r),
            GcId::Upval(r) => {
                if let UpvalueState::Closed(v) = self.upvals.get(r.0).state {
                    self.mark_value(v);
                }
                1
            }
        }
    }

    /// Mark everything a thread holds: live stack slots, frame callables
    /// (already on the stack), and its open upvalue cells.
    fn traverse_thread(&mut self, r: ThreadRef) -> usize {
        let (values, upvals) = {
            let t = self.threads.get(r.0);
            (t.stack[..t.top].to_vec(), t.open_upvals.clone())
        };
        let cost = values.len() + upvals.len() + 1;
        for v in values {
            self.mark_value(v);
        }
        for u in upvals {
            self.mark(GcId::Upval(u));
        }
        cost
    }
}

impl Vm {
    /// Non-raising GC checkpoint: run collection steps while debt is due.
    pub(crate) fn check_gc(&mut self) {
        if self.heap.running && self.heap.debt > 0 {
            self.gc_step_driver();
        }
    }

    /// Raising GC checkpoint for allocation-heavy opcodes: collects, and
    /// reports a memory error if the heap ceiling stays breached even
    /// after a full collection.
    pub(crate) fn gc_checkpoint(&mut self) -> Result<(), Unwind> {
        self.check_gc();
        if self.heap.over_limit() {
            self.gc_full();
            if self.heap.over_limit() {
                return Err(self.mem_error());
            }
        }
        Ok(())
    }

    fn gc_step_driver(&mut self) {
        let mut budget =
            ((self.heap.debt / 16).max(256)) * (self.heap.step_mul as i64) / 100;
        while budget > 0 {
            match self.heap.phase {
                Phase::Pause => {
                    self.gc_start_cycle();
                    budget -= 64;
                }
                Phase::Mark => {
                    if let Some(id) = self.heap.gray.pop() {
                        budget -= self.heap.traverse(id) as i64;
                    } else {
                        self.gc_atomic();
                        budget -= 256;
                    }
                }
                Phase::Sweep => {
                    let done = self.gc_sweep_some(&mut budget);
                    if done {
                        self.gc_end_cycle();
                        return;
                    }
                }
            }
        }
        // pay off what this step covered
        self.heap.debt = self.heap.debt.min(0);
    }

    /// Run a full collection cycle to completion, finishing any cycle
    /// already in flight first.
    pub(crate) fn gc_full(&mut self) {
        if self.heap.phase != Phase::Pause {
            self.gc_run_to_pause();
        }
        self.gc_start_cycle();
        self.gc_run_to_pause();
    }

    fn gc_run_to_pause(&mut self) {
        loop {
            match self.heap.phase {
                Phase::Pause => return,
                Phase::Mark => {
                    if let Some(id) = self.heap.gray.pop() {
                        self.heap.traverse(id);
                    } else {
                        self.gc_atomic();
                    }
                }
                Phase::Sweep => {
                    let mut budget = i64::MAX / 2;
                    if self.gc_sweep_some(&mut budget) {
                        self.gc_end_cycle();
                        return;
                    }
                }
            }
        }
    }

    fn gc_start_cycle(&mut self) {
        debug_assert_eq!(self.heap.phase, Phase::Pause);
        self.heap.gray.clear();
        self.heap.gray_threads.clear();
        self.heap.phase = Phase::Mark;
        self.gc_mark_roots();
    }

    fn gc_mark_roots(&mut self) {
        self.heap.mark(GcId::Table(self.registry));
        self.heap.mark(GcId::Str(self.memerr));
        let tm_names = self.tm_names.clone();
        for n in tm_names {
            self.heap.mark(GcId::Str(n));
        }
        for m in self.basic_meta.into_iter().flatten() {
            self.heap.mark(GcId::Table(m));
        }
        self.heap.mark(GcId::Thread(self.main));
        self.heap.mark(GcId::Thread(self.cur));
        let chain = self.resume_chain.clone();
        for t in chain {
            self.heap.mark(GcId::Thread(t));
        }
    }

    /// Atomic step: re-mark roots, re-traverse every gray thread, drain
    /// the worklist, and queue unreachable finalizable objects, which are
    /// resurrected for exactly one cycle.
    fn gc_atomic(&mut self) {
        self.gc_mark_roots();
        loop {
            while let Some(id) = self.heap.gray.pop() {
                self.heap.traverse(id);
            }
            match self.heap.gray_threads.pop() {
                Some(t) => {
                    self.heap.set_color(GcId::Thread(t), Color::Black);
                    self.heap.traverse_thread(t);
                }
                None => {
                    if self.heap.gray.is_empty() {
                        break;
                    }
                }
            }
        }
        self.gc_separate_finalizable();
        // resurrection may have regrown the worklist
        while let Some(id) = self.heap.gray.pop() {
            self.heap.traverse(id);
        }
        while let Some(t) = self.heap.gray_threads.pop() {
            self.heap.set_color(GcId::Thread(t), Color::Black);
            self.heap.traverse_thread(t);
        }
        self.heap.phase = Phase::Sweep;
        self.heap.sweep_at = (0, 0);
    }

    /// Find white tables/userdata whose metatable has `__gc` and whose
    /// finalizer has not run, resurrect them, and queue the finalizer.
    fn gc_separate_finalizable(&mut self) {
        let gc_name = self.tm_names[TM::Gc as usize];

        let mut queue: Vec<GcId> = Vec::new();
        let table_ids: Vec<u32> = self.heap.tables.live_indices().collect();
        for i in table_ids {
            let r = TableRef(i);
            if self.heap.tables.color(i) != Color::White {
                continue;
            }
            let t = self.heap.tables.get(i);
            if t.finalized {
                continue;
            }
            let Some(meta) = t.meta else { continue };
            if !table::raw_get(&self.heap, meta, Value::Str(gc_name)).is_nil() {
                queue.push(GcId::Table(r));
            }
        }
        let ud_ids: Vec<u32> = self.heap.userdata.live_indices().collect();
        for i in ud_ids {
            if self.heap.userdata.color(i) != Color::White {
                continue;
            }
            let u = self.heap.userdata.get(i);
            if u.finalized {
                continue;
            }
            let Some(meta) = u.meta else { continue };
            if !table::raw_get(&self.heap, meta, Value::Str(gc_name)).is_nil() {
                queue.push(GcId::Userdata(super::UserdataRef(i)));
            }
        }
        for id in queue {
            self.heap.mark(id);
            self.heap.pending_fin.push(id);
        }
    }

    /// Sweep a bounded number of slots. Returns true when the sweep is
    /// complete.
    fn gc_sweep_some(&mut self, budget: &mut i64) -> bool {
        while *budget > 0 {
            let (kind, at) = self.heap.sweep_at;
            if kind >= KIND_COUNT {
                return true;
            }
            let cap = self.heap.sweep_kind_capacity(kind);
            if at >= cap {
                self.heap.sweep_at = (kind + 1, 0);
                continue;
            }
            let step = ((*budget).max(16) as usize).min(cap - at);
            for i in at..at + step {
                self.gc_sweep_slot(kind, i as u32);
            }
            self.heap.sweep_at = (kind, at + step);
            *budget -= step as i64;
        }
        false
    }

    fn gc_sweep_slot(&mut self, kind: usize, i: u32) {
        let heap = &mut self.heap;
        macro_rules! sweep {
            ($slab:ident) => {{
                if heap.$slab.is_live(i) {
                    match heap.$slab.color(i) {
                        Color::White => {
                            heap.$slab.remove(i);
                        }
                        _ => heap.$slab.set_color(i, Color::White),
                    }
                }
            }};
        }
        match kind {
            0 => {
                // strings additionally leave the intern pool
                if heap.strings.is_live(i) {
                    match heap.strings.color(i) {
                        Color::White => {
                            let s = heap.strings.remove(i);
                            if s.short {
                                if let Some(bucket) = self.intern.get_mut(&s.hash) {
                                    bucket.retain(|r| r.0 != i);
                                    if bucket.is_empty() {
                                        self.intern.remove(&s.hash);
                                    }
                                }
                            }
                        }
                        _ => heap.strings.set_color(i, Color::White),
                    }
                }
            }
            1 => sweep!(tables),
            2 => sweep!(protos),
            3 => sweep!(closures),
            4 => sweep!(cclosures),
            5 => sweep!(userdata),
            6 => sweep!(threads),
            7 => sweep!(upvals),
            _ => unreachable!(),
        }
    }

    /// Close out the cycle: refresh byte accounting and set the debt so
    /// the next cycle starts after the heap grows by `pause` percent.
    fn gc_end_cycle(&mut self) {
        self.heap.phase = Phase::Pause;
        let total = self.heap.recompute_total();
        self.heap.estimate = total;
        let threshold = (total / 100).saturating_mul(self.heap.pause as usize);
        self.heap.debt = total as i64 - threshold.max(total + 1024) as i64;
        // run queued finalizers now that the world is consistent
        if !self.heap.pending_fin.is_empty() {
            self.run_pending_finalizers();
        }
    }

    /// Invoke `__gc` for every queued object, each in a fresh protected,
    /// non-yieldable call. Finalizer errors are swallowed; the object is
    /// flagged so the next cycle can free it for real.
    fn run_pending_finalizers(&mut self) {
        let pending = std::mem::take(&mut self.heap.pending_fin);
        let gc_name = self.tm_names[TM::Gc as usize];
        for id in pending {
            let (obj, meta) = match id {
                GcId::Table(r) => {
                    self.heap.tables.get_mut(r.0).finalized = true;
                    (Value::Table(r), self.heap.tables.get(r.0).meta)
                }
                GcId::Userdata(r) => {
                    self.heap.userdata.get_mut(r.0).finalized = true;
                    (Value::Userdata(r), self.heap.userdata.get(r.0).meta)
                }
                _ => continue,
            };
            let Some(meta) = meta else { continue };
            let handler = table::raw_get(&self.heap, meta, Value::Str(gc_name));
            if handler.is_nil() {
                continue;
            }
            let _ = self.protected_call_values(handler, &[obj]);
        }
    }
}

impl Heap {
    fn sweep_kind_capacity(&self, kind: usize) -> usize {
        match kind {
            0 => self.strings.capacity(),
            1 => self.tables.capacity(),
            2 => self.protos.capacity(),
            3 => self.closures.capacity(),
            4 => self.cclosures.capacity(),
            5 => self.userdata.capacity(),
            6 => self.threads.capacity(),
            7 => self.upvals.capacity(),
            _ => 0,
        }
    }

    /// Exact live-byte recount, run once per cycle.
    fn recompute_total(&mut self) -> usize {
        let mut total = 0usize;
        for i in self.strings.live_indices() {
            let s = self.strings.get(i);
            total += std::mem::size_of_val(s) + s.bytes.len();
        }
        for i in self.tables.live_indices() {
            total += self.tables.get(i).approx_size();
        }
        for i in self.protos.live_indices() {
            total += self.protos.get(i).approx_size();
        }
        for i in self.closures.live_indices() {
            total += 64 + self.closures.get(i).upvals.len() * 4;
        }
        for i in self.cclosures.live_indices() {
            total += 64 + self.cclosures.get(i).upvals.len() * 16;
        }
        for i in self.userdata.live_indices() {
            total += 64 + self.userdata.get(i).data.len();
        }
        for i in self.threads.live_indices() {
            total += 256 + self.threads.get(i).approx_stack_bytes();
        }
        total += self.upvals.len() * 32;
        self.total_bytes = total;
        total
    }
}

// ---------------------------------------------------------------------------
// Embedder GC control
// ---------------------------------------------------------------------------

/// Heap occupancy snapshot for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Live objects across every kind
    pub objects: usize,
    /// Bytes attributed to live objects as of the last refresh
    pub bytes: usize,
    /// Live strings
    pub strings: usize,
    /// Live tables (typed arrays and slices included)
    pub tables: usize,
}

impl Vm {
    /// Current heap occupancy.
    pub fn heap_stats(&self) -> HeapStats {
        let h = &self.heap;
        HeapStats {
            objects: h.strings.len()
                + h.tables.len()
                + h.protos.len()
                + h.closures.len()
                + h.cclosures.len()
                + h.userdata.len()
                + h.threads.len()
                + h.upvals.len(),
            bytes: h.total_bytes,
            strings: h.strings.len(),
            tables: h.tables.len(),
        }
    }
    /// Stop automatic collection.
    pub fn gc_stop(&mut self) {
        self.heap.running = false;
    }

    /// Restart automatic collection.
    pub fn gc_restart(&mut self) {
        self.heap.running = true;
        self.heap.debt = self.heap.debt.min(0);
    }

    /// Run a full garbage-collection cycle immediately.
    pub fn gc_collect(&mut self) {
        self.gc_full();
    }

    /// Run one collection step sized roughly like an allocation of
    /// `kbytes` kilobytes.
    pub fn gc_step(&mut self, kbytes: usize) {
        self.heap.debt += (kbytes.max(1) * 1024) as i64;
        self.gc_step_driver();
    }

    /// Set the collector pause percentage; returns the previous value.
    pub fn gc_set_pause(&mut self, pause: u32) -> u32 {
        std::mem::replace(&mut self.heap.pause, pause)
    }

    /// Set the step multiplier percentage (clamped to the minimum);
    /// returns the previous value.
    pub fn gc_set_step_mul(&mut self, mul: u32) -> u32 {
        std::mem::replace(
            &mut self.heap.step_mul,
            mul.max(lumo_core::limits::GC_STEP_MUL_MIN),
        )
    }

    /// Is automatic collection enabled?
    pub fn gc_is_running(&self) -> bool {
        self.heap.running
    }

    /// Heap size in kilobytes.
    pub fn gc_count(&self) -> usize {
        self.heap.total_bytes / 1024
    }

    /// Remainder of the heap size modulo one kilobyte.
    pub fn gc_count_b(&self) -> usize {
        self.heap.total_bytes % 1024
    }
}

/// Re-exported hook for shutdown paths that must flush finalizers.
pub(crate) fn finalize_pending(vm: &mut Vm) {
    vm.gc_full();
    vm.gc_full();
}
