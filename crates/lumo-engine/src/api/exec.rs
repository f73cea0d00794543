//! Execution-facing embedder API: calls, coroutines, chunks, hooks

use crate::bytecode::{dump_chunk, load_chunk};
use crate::gc::{GcId, ProtoRef, ThreadRef, UpvalRef};
use crate::interp::ArithOp;
use crate::object::{table, Continuation, Hook, LClosure, Unwind, Upvalue, Value};
use crate::state::{ThreadState, Vm, MASK_COUNT};
use crate::LumoError;
use lumo_core::limits::RIDX_GLOBALS;
use lumo_core::Status;

/// Comparison selector for [`Vm::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl Vm {
    /// Call the function at `top - nargs - 1` with the top `nargs`
    /// values. Unprotected: errors route through the panic handler and
    /// come back as host errors.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> Result<(), LumoError> {
        let wm = self.watermark();
        let func_idx = self.top() - nargs - 1;
        self.th_mut().nny += 1;
        let r = self.call_value(func_idx, nresults);
        self.th_mut().nny -= 1;
        r.map_err(|u| self.api_error(u, wm))
    }

    /// Like [`Vm::call`] but usable inside a host function that may be
    /// suspended: on a yield the unwind must be returned onward, and
    /// `cont` finishes the call after resume.
    pub fn callk(
        &mut self,
        nargs: usize,
        nresults: i32,
        ctx: i64,
        cont: Continuation,
    ) -> Result<(), Unwind> {
        let func_idx = self.top() - nargs - 1;
        {
            let ci = self.th_mut().ci_mut();
            ci.cont = Some(cont);
            ci.ctx = ctx;
        }
        self.call_value(func_idx, nresults)
    }

    /// Protected call; the error value (if any) replaces the function
    /// and its arguments on the stack. `errfunc` is the stack index of
    /// an error handler, or 0 for none.
    pub fn pcall(&mut self, nargs: usize, nresults: i32, errfunc: i64) -> Status {
        let frames = self.th().frames.len();
        let func_idx = self.top() - nargs - 1;
        let errfunc_idx = if errfunc == 0 {
            0
        } else {
            self.index2slot(errfunc).expect("invalid errfunc index") + 1
        };
        match self.protected_call(func_idx, nresults, errfunc_idx) {
            Ok(st) => st,
            Err(u) => {
                // a yield cannot cross a plain pcall; anything else is a
                // driver bug surfaced as a runtime failure
                let _ = self.api_error(u, (frames, func_idx));
                Status::ErrRun
            }
        }
    }

    /// Yieldable protected call, for use inside host functions.
    pub fn pcallk(
        &mut self,
        nargs: usize,
        nresults: i32,
        errfunc: i64,
        ctx: i64,
        cont: Continuation,
    ) -> Result<Status, Unwind> {
        let func_idx = self.top() - nargs - 1;
        let errfunc_idx = if errfunc == 0 {
            0
        } else {
            self.index2slot(errfunc).expect("invalid errfunc index") + 1
        };
        self.protected_callk(func_idx, nresults, errfunc_idx, cont, ctx)
    }

    /// Raise an error with the popped top value. Host functions return
    /// the unwind.
    pub fn error_value(&mut self) -> Unwind {
        let v = self.pop_raw();
        Unwind::Error(Status::ErrRun, v)
    }

    /// Raise a runtime error with a message.
    pub fn raise_runtime(&mut self, msg: &str) -> Unwind {
        self.rt_error(msg.to_string())
    }

    // -----------------------------------------------------------------
    // Operator access
    // -----------------------------------------------------------------

    /// Apply an arithmetic or bitwise operator to the top two values
    /// (one for unary operators), honoring metamethods; operands are
    /// replaced by the result.
    pub fn arith(&mut self, op: ArithOp) -> Result<(), LumoError> {
        let wm = self.watermark();
        let (a, b) = if op.is_unary() {
            let a = self.pop_raw();
            (a, a)
        } else {
            let b = self.pop_raw();
            let a = self.pop_raw();
            (a, b)
        };
        match self.arith_event(op, a, b) {
            Ok(v) => {
                self.reserve_stack_host(1);
                self.push_raw(v);
                Ok(())
            }
            Err(u) => Err(self.api_error(u, wm)),
        }
    }

    /// Metamethod-aware comparison of two indices.
    pub fn compare(&mut self, i1: i64, i2: i64, op: CompareOp) -> Result<bool, LumoError> {
        let wm = self.watermark();
        let (Some(a), Some(b)) = (self.index_value(i1), self.index_value(i2)) else {
            return Ok(false);
        };
        let r = match op {
            CompareOp::Eq => self.equals_event(a, b),
            CompareOp::Lt => self.less_than(a, b),
            CompareOp::Le => self.less_equal(a, b),
        };
        r.map_err(|u| self.api_error(u, wm))
    }

    /// Concatenate the top `n` values into one. `n == 0` pushes the
    /// empty string.
    pub fn concat(&mut self, n: usize) -> Result<(), LumoError> {
        match n {
            0 => {
                self.push_bytes(b"");
                Ok(())
            }
            1 => Ok(()),
            _ => {
                let wm = self.watermark();
                self.check_gc();
                self.concat_range(n).map_err(|u| self.api_error(u, wm))
            }
        }
    }

    /// Push the length of the value at `idx`, honoring `__len`.
    pub fn len(&mut self, idx: i64) -> Result<(), LumoError> {
        let wm = self.watermark();
        let v = self.index_value(idx).unwrap_or(Value::Nil);
        match self.length_event(v) {
            Ok(l) => {
                self.reserve_stack_host(1);
                self.push_raw(l);
                Ok(())
            }
            Err(u) => Err(self.api_error(u, wm)),
        }
    }

    /// Table traversal: pop a key, push the next key/value pair.
    /// Returns false (nothing pushed) at the end.
    pub fn next(&mut self, idx: i64) -> Result<bool, LumoError> {
        let t = match self.index_value(idx) {
            Some(Value::Table(t)) => t,
            _ => return Err(LumoError::Runtime("'next' needs a table".to_string())),
        };
        let k = self.pop_raw();
        match table::table_next(&self.heap, t, k) {
            Ok(table::IterStep::Pair(k, v)) => {
                self.reserve_stack_host(2);
                self.push_raw(k);
                self.push_raw(v);
                Ok(true)
            }
            Ok(table::IterStep::Done) => Ok(false),
            Err(e) => Err(LumoError::Runtime(e.message())),
        }
    }

    // -----------------------------------------------------------------
    // Closure reflection
    // -----------------------------------------------------------------

    /// Push the `n`-th (1-based) upvalue of the closure at `func_idx`;
    /// false when out of range.
    pub fn get_upvalue(&mut self, func_idx: i64, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        let v = match self.index_value(func_idx) {
            Some(Value::Closure(c)) => {
                let cl = self.heap.closures.get(c.0);
                match cl.upvals.get(n - 1) {
                    Some(&u) => self.upval_get(u),
                    None => return false,
                }
            }
            Some(Value::CClosure(c)) => match self.heap.cclosures.get(c.0).upvals.get(n - 1) {
                Some(&v) => v,
                None => return false,
            },
            _ => return false,
        };
        self.reserve_stack_host(1);
        self.push_raw(v);
        true
    }

    /// Pop the top into the `n`-th upvalue of the closure at `func_idx`;
    /// false (value left in place) when out of range.
    pub fn set_upvalue(&mut self, func_idx: i64, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        match self.index_value(func_idx) {
            Some(Value::Closure(c)) => {
                let cell: Option<UpvalRef> =
                    self.heap.closures.get(c.0).upvals.get(n - 1).copied();
                match cell {
                    Some(u) => {
                        let v = self.pop_raw();
                        self.upval_set(u, v);
                        true
                    }
                    None => false,
                }
            }
            Some(Value::CClosure(c)) => {
                if n == 0 || n > self.heap.cclosures.get(c.0).upvals.len() {
                    return false;
                }
                let v = self.pop_raw();
                self.heap.cclosures.get_mut(c.0).upvals[n - 1] = v;
                self.heap.barrier_value(GcId::CClosure(c), v);
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------

    /// Load a binary chunk and push the resulting closure. On failure
    /// the error message is pushed instead and the status says why.
    pub fn load(&mut self, reader: &mut dyn std::io::Read, _chunk_name: &str) -> Status {
        let mut bytes = Vec::new();
        if let Err(e) = reader.read_to_end(&mut bytes) {
            self.push_string(&format!("read error: {}", e));
            return Status::ErrSyntax;
        }
        match load_chunk(self, &bytes) {
            Ok(p) => {
                self.push_proto_closure(p);
                Status::Ok
            }
            Err(e) => {
                self.push_string(&e.to_string());
                Status::ErrSyntax
            }
        }
    }

    /// Serialize the function on top of the stack into a binary chunk.
    pub fn dump(&mut self, writer: &mut dyn std::io::Write, strip: bool) -> Result<(), LumoError> {
        let top = self.top();
        let proto = match self.stack_get(top - 1) {
            Value::Closure(c) => self.heap.closures.get(c.0).proto,
            _ => {
                return Err(LumoError::Runtime(
                    "dump needs a language function on top".to_string(),
                ))
            }
        };
        let bytes = dump_chunk(self, proto, strip);
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Instantiate a prototype as a closure and push it. Each upvalue
    /// descriptor gets a fresh closed cell holding nil, except a first
    /// upvalue named `_ENV`, which receives the globals table.
    pub fn push_proto_closure(&mut self, proto: ProtoRef) {
        self.check_gc();
        let descs = self.heap.protos.get(proto.0).upvals.clone();
        let mut upvals = Vec::with_capacity(descs.len());
        for (i, d) in descs.iter().enumerate() {
            let init = if i == 0
                && d.name
                    .map(|n| self.str_bytes(n) == crate::bytecode::ENV_NAME)
                    .unwrap_or(false)
            {
                table::raw_geti(&self.heap, self.registry, RIDX_GLOBALS)
            } else {
                Value::Nil
            };
            upvals.push(self.heap.alloc_upval(Upvalue::closed(init)));
        }
        let c = self.heap.alloc_closure(LClosure { proto, upvals });
        self.reserve_stack_host(1);
        self.push_raw(Value::Closure(c));
    }

    // -----------------------------------------------------------------
    // Coroutines
    // -----------------------------------------------------------------

    /// Create a coroutine, push its thread object, and return its
    /// handle. Push its function onto it (via [`Vm::xmove`]) before the
    /// first resume.
    pub fn create_thread(&mut self) -> ThreadRef {
        self.check_gc();
        let t = self.heap.alloc_thread(ThreadState::new());
        self.reserve_stack_host(1);
        self.push_raw(Value::Thread(t));
        t
    }

    /// Resume a coroutine with the top `nargs` values as arguments.
    /// Returns the status and how many result values were pushed onto
    /// this thread.
    pub fn resume(&mut self, co: ThreadRef, nargs: usize) -> (Status, usize) {
        let mut n = 0;
        let st = self.resume_thread(co, nargs, &mut n);
        (st, n)
    }

    /// Yield the top `nresults` values to the resumer. Host functions
    /// must return the unwind; the function body does not continue after
    /// a resume (use [`Vm::yieldk`] for that).
    pub fn yield_values(&mut self, nresults: usize) -> Unwind {
        self.do_yield(nresults, None)
    }

    /// Yield with a continuation to run when the coroutine is resumed.
    pub fn yieldk(&mut self, nresults: usize, ctx: i64, cont: Continuation) -> Unwind {
        self.do_yield(nresults, Some((cont, ctx)))
    }

    // -----------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------

    /// Install a debug hook on the current thread. `count` is the
    /// instruction period for [`MASK_COUNT`]; a zero mask removes the
    /// hook.
    pub fn set_hook(&mut self, hook: Option<Hook>, mask: u8, count: u32) {
        let th = self.th_mut();
        if hook.is_none() || mask == 0 {
            th.hook = None;
            th.hook_mask = 0;
            th.hook_count = 0;
            return;
        }
        debug_assert!(mask & MASK_COUNT == 0 || count > 0, "count hook needs a period");
        th.hook = hook;
        th.hook_mask = mask;
        th.hook_count = count;
        th.hook_counter = count.max(1);
    }

    /// Current hook mask of this thread.
    pub fn hook_mask(&self) -> u8 {
        self.th().hook_mask
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Run all pending finalizers and release the interpreter group.
    /// Dropping the VM without calling this skips `__gc` handlers.
    pub fn close(mut self) {
        crate::gc::finalize_pending(&mut self);
    }
}
