//! Call machinery: frame entry/exit, protected calls, coroutines, hooks
//!
//! Language calls never recurse natively: the dispatch loop re-enters the
//! new frame. Native recursion only happens at host boundaries
//! (metamethods, hooks, the pcall driver) and is bounded by
//! [`MAX_HOST_CALLS`](lumo_core::limits::MAX_HOST_CALLS).

use super::meta::TM;
use crate::gc::{GcId, ThreadRef, UpvalRef};
use crate::object::{
    Continuation, HookEvent, Unwind, Upvalue, UpvalueState, Value,
};
use crate::state::{
    CallInfo, CIST_HOOKED, CIST_LEQ, CIST_LUA, CIST_YPCALL, MASK_CALL, MASK_RET,
};
use crate::state::Vm;
use lumo_core::limits::{MAX_HOST_CALLS, MIN_STACK};
use lumo_core::{OpCode, Status};

/// What `precall` did with the callable.
pub(crate) enum Called {
    /// A host function ran to completion; results are in place.
    Native,
    /// A language frame was pushed; the dispatch loop must enter it.
    Frame,
}

impl Vm {
    /// Prepare a call to `stack[func_idx]` with arguments above it.
    pub(crate) fn precall(&mut self, func_idx: usize, nresults: i32) -> Result<Called, Unwind> {
        let mut func_idx = func_idx;
        for _ in 0..MAX_HOST_CALLS {
            let callee = self.stack_get(func_idx);
            match callee {
                Value::LightFn(f) => {
                    return self.call_native(func_idx, nresults, f);
                }
                Value::CClosure(c) => {
                    let f = self.heap.cclosures.get(c.0).func;
                    return self.call_native(func_idx, nresults, f);
                }
                Value::Closure(c) => {
                    let proto_ref = self.heap.closures.get(c.0).proto;
                    let (num_params, is_vararg, max_stack) = {
                        let p = self.heap.protos.get(proto_ref.0);
                        (p.num_params as usize, p.is_vararg, p.max_stack as usize)
                    };
                    let actual = self.top() - func_idx - 1;
                    self.reserve_stack(max_stack + num_params + 2)?;
                    let base = if is_vararg {
                        // fixed parameters move above the varargs
                        let new_base = self.top();
                        for i in 0..num_params {
                            let v = if i < actual {
                                let v = self.stack_get(func_idx + 1 + i);
                                self.stack_set(func_idx + 1 + i, Value::Nil);
                                v
                            } else {
                                Value::Nil
                            };
                            self.push_raw(v);
                        }
                        new_base
                    } else {
                        for _ in actual..num_params {
                            self.push_raw(Value::Nil);
                        }
                        func_idx + 1
                    };
                    // registers above the arguments start out nil
                    let frame_top = base + max_stack;
                    for i in self.top()..frame_top {
                        self.stack_set(i, Value::Nil);
                    }
                    self.set_top_raw(frame_top);
                    self.th_mut().frames.push(CallInfo {
                        func: func_idx,
                        base,
                        top: frame_top,
                        saved_pc: 0,
                        nresults,
                        status: CIST_LUA,
                        cont: None,
                        ctx: 0,
                        saved_errfunc: 0,
                    });
                    if self.th().hook_mask & MASK_CALL != 0 {
                        self.call_hook(HookEvent::Call)?;
                    }
                    return Ok(Called::Frame);
                }
                not_callable => {
                    // __call: shift arguments up and put the handler first
                    let tm = self.get_metamethod(not_callable, TM::Call);
                    if tm.is_nil() {
                        return Err(self.type_error("call", not_callable));
                    }
                    self.reserve_stack(1)?;
                    let top = self.top();
                    let mut i = top;
                    while i > func_idx {
                        let v = self.stack_get(i - 1);
                        self.stack_set(i, v);
                        i -= 1;
                    }
                    self.stack_set(func_idx, tm);
                    self.set_top_raw(top + 1);
                    // loop retries with the handler as the callee
                }
            }
        }
        Err(self.rt_error("'__call' chain too long".to_string()))
    }

    fn call_native(
        &mut self,
        func_idx: usize,
        nresults: i32,
        f: crate::object::CFunction,
    ) -> Result<Called, Unwind> {
        self.reserve_stack(MIN_STACK)?;
        let frame_top = self.top() + MIN_STACK;
        self.th_mut().frames.push(CallInfo {
            func: func_idx,
            base: func_idx + 1,
            top: frame_top,
            saved_pc: 0,
            nresults,
            status: 0,
            cont: None,
            ctx: 0,
            saved_errfunc: 0,
        });
        if self.th().hook_mask & MASK_CALL != 0 {
            self.call_hook(HookEvent::Call)?;
        }
        let n = f(self)?;
        let first = self.top() - n;
        self.poscall(first, n)?;
        Ok(Called::Native)
    }

    /// Move `nres` results into the caller's slots, pad or truncate to
    /// the caller's expectation, and pop the frame. Returns true when the
    /// caller asked for a fixed count.
    pub(crate) fn poscall(&mut self, first_result: usize, nres: usize) -> Result<bool, Unwind> {
        if self.th().hook_mask & MASK_RET != 0 {
            self.call_hook(HookEvent::Return)?;
        }
        let ci = self.th_mut().frames.pop().expect("poscall without a frame");
        let func = ci.func;
        let wanted = ci.nresults;
        if wanted < 0 {
            for i in 0..nres {
                let v = self.stack_get(first_result + i);
                self.stack_set(func + i, v);
            }
            self.set_top_raw(func + nres);
            Ok(false)
        } else {
            let wanted = wanted as usize;
            for i in 0..wanted.min(nres) {
                let v = self.stack_get(first_result + i);
                self.stack_set(func + i, v);
            }
            for i in nres..wanted {
                self.stack_set(func + i, Value::Nil);
            }
            self.set_top_raw(func + wanted);
            Ok(true)
        }
    }

    /// Call `stack[func_idx]` to completion. This is the native re-entry
    /// point used by metamethods, iterators invoked from host code, and
    /// the protected-call driver.
    pub(crate) fn call_value(&mut self, func_idx: usize, nresults: i32) -> Result<(), Unwind> {
        {
            let th = self.th_mut();
            th.n_calls += 1;
            if th.n_calls as usize > MAX_HOST_CALLS {
                th.n_calls -= 1;
                return Err(self.rt_error("native call depth overflow".to_string()));
            }
        }
        let r = match self.precall(func_idx, nresults) {
            Err(e) => Err(e),
            Ok(Called::Native) => Ok(()),
            Ok(Called::Frame) => {
                let floor = self.th().frames.len() - 1;
                self.execute(floor)
            }
        };
        self.th_mut().n_calls -= 1;
        r
    }

    /// Like [`Vm::call_value`] but forbids yields for the duration.
    pub(crate) fn call_value_noyield(
        &mut self,
        func_idx: usize,
        nresults: i32,
    ) -> Result<(), Unwind> {
        self.th_mut().nny += 1;
        let r = self.call_value(func_idx, nresults);
        self.th_mut().nny -= 1;
        r
    }

    // -----------------------------------------------------------------
    // Protected calls
    // -----------------------------------------------------------------

    /// Protected call of `stack[func_idx]`; non-yieldable. On error the
    /// stack and frames are unwound to `func_idx`, the (possibly
    /// handler-transformed) error value replaces the function, and the
    /// error status is returned as a normal value.
    ///
    /// `errfunc` is one-based: 0 means no handler, `n` means the handler
    /// sits in stack slot `n - 1`.
    pub(crate) fn protected_call(
        &mut self,
        func_idx: usize,
        nresults: i32,
        errfunc: usize,
    ) -> Result<Status, Unwind> {
        let saved_frames = self.th().frames.len();
        let r = self.call_value_noyield(func_idx, nresults);
        match r {
            Ok(()) => Ok(Status::Ok),
            Err(Unwind::Yield) => Err(Unwind::Yield),
            Err(Unwind::Error(status, value)) => {
                let (status, value) = self.apply_errfunc(status, value, errfunc);
                self.unwind_to(saved_frames, func_idx);
                self.stack_set(func_idx, value);
                self.set_top_raw(func_idx + 1);
                Ok(status)
            }
        }
    }

    /// Yieldable protected call: marks the current host frame so that a
    /// yield can cross it and a later error still finds its handler and
    /// continuation.
    pub(crate) fn protected_callk(
        &mut self,
        func_idx: usize,
        nresults: i32,
        errfunc: usize,
        cont: Continuation,
        ctx: i64,
    ) -> Result<Status, Unwind> {
        let saved_frames = self.th().frames.len();
        {
            let ci = self.th_mut().ci_mut();
            ci.status |= CIST_YPCALL;
            ci.cont = Some(cont);
            ci.ctx = ctx;
            ci.saved_errfunc = errfunc;
        }
        let r = self.call_value(func_idx, nresults);
        match r {
            // on a yield the frame keeps its marks for the resume side
            Err(Unwind::Yield) => Err(Unwind::Yield),
            Ok(()) => {
                let ci = self.th_mut().ci_mut();
                ci.status &= !CIST_YPCALL;
                ci.cont = None;
                Ok(Status::Ok)
            }
            Err(Unwind::Error(status, value)) => {
                let (status, value) = self.apply_errfunc(status, value, errfunc);
                // drop the failed chain first; only then is the top frame
                // ours again
                self.unwind_to(saved_frames, func_idx);
                let ci = self.th_mut().ci_mut();
                ci.status &= !CIST_YPCALL;
                ci.cont = None;
                self.stack_set(func_idx, value);
                self.set_top_raw(func_idx + 1);
                Ok(status)
            }
        }
    }

    /// Convenience protected call used by finalizers and internal
    /// drivers: pushes `f` and `args`, calls, drops any results.
    pub(crate) fn protected_call_values(&mut self, f: Value, args: &[Value]) -> Status {
        self.reserve_stack_host(args.len() + 1);
        let at = self.top();
        self.push_raw(f);
        for &a in args {
            self.push_raw(a);
        }
        match self.protected_call(at, 0, 0) {
            Ok(st) => {
                self.set_top_raw(at);
                st
            }
            Err(_) => {
                self.set_top_raw(at);
                Status::ErrRun
            }
        }
    }

    /// Run the error handler, if any, over the error value. Errors inside
    /// the handler collapse to `ErrErr`; memory errors skip the handler.
    /// `errfunc` is the one-based encoding of [`Vm::protected_call`].
    fn apply_errfunc(&mut self, status: Status, value: Value, errfunc: usize) -> (Status, Value) {
        if errfunc == 0 || status == Status::ErrMem || status == Status::ErrErr {
            return (status, value);
        }
        let handler = self.stack_get(errfunc - 1);
        self.reserve_stack_host(2);
        let at = self.top();
        self.push_raw(handler);
        self.push_raw(value);
        match self.call_value_noyield(at, 1) {
            Ok(()) => {
                let v = self.stack_get(at);
                self.set_top_raw(at);
                (status, v)
            }
            Err(_) => {
                self.set_top_raw(at);
                let msg = self.new_string(b"error in error handling");
                (Status::ErrErr, Value::Str(msg))
            }
        }
    }

    /// Unwind frames and close upvalues down to a stack position.
    pub(crate) fn unwind_to(&mut self, frame_count: usize, stack_level: usize) {
        self.close_upvalues(self.cur, stack_level);
        self.th_mut().frames.truncate(frame_count);
        self.th_mut().n_yield = 0;
    }

    // -----------------------------------------------------------------
    // Coroutines
    // -----------------------------------------------------------------

    /// Resume `co`, passing it the top `nargs` values of the current
    /// thread. Returns the coroutine's status; its results (yielded or
    /// returned values, or the error value) are pushed onto the current
    /// thread's stack. The count is written to `nresults_out`.
    pub(crate) fn resume_thread(
        &mut self,
        co: ThreadRef,
        nargs: usize,
        nresults_out: &mut usize,
    ) -> Status {
        *nresults_out = 0;
        // pre-flight checks deliver an error without entering the coroutine
        let precheck = {
            let status = self.co_status(co);
            match status {
                crate::state::CoStatus::Suspended => None,
                crate::state::CoStatus::Dead => Some("cannot resume dead coroutine"),
                crate::state::CoStatus::Running => Some("cannot resume non-suspended coroutine"),
                crate::state::CoStatus::Normal => Some("cannot resume non-suspended coroutine"),
            }
        };
        if let Some(msg) = precheck {
            // drop the arguments, deliver the message
            let new_top = self.top() - nargs;
            self.set_top_raw(new_top);
            let m = self.new_string(msg.as_bytes());
            self.reserve_stack_host(1);
            self.push_raw(Value::Str(m));
            *nresults_out = 1;
            return Status::ErrRun;
        }

        let caller = self.cur;
        let was_fresh = !self.thread(co).started;
        self.move_between(caller, co, nargs);
        self.resume_chain.push(caller);
        self.cur = co;
        {
            let t = self.th_mut();
            t.started = true;
            t.nny = 0;
            t.status = Status::Ok;
            t.resume_nargs = nargs;
        }

        let outcome = self.resume_body(was_fresh);

        let (status, nres) = match outcome {
            Ok(()) => {
                // finished: everything on the stack is a result
                let t = self.th_mut();
                t.status = Status::Ok;
                t.nny = 1;
                (Status::Ok, self.top())
            }
            Err(Unwind::Yield) => {
                let n = self.th().n_yield;
                self.th_mut().status = Status::Yield;
                (Status::Yield, n)
            }
            Err(Unwind::Error(st, v)) => {
                // the coroutine dies; its stack is cleared down to the
                // error value
                self.close_upvalues(co, 0);
                {
                    let t = self.th_mut();
                    t.frames.clear();
                    t.status = st;
                    t.top = 0;
                    t.nny = 1;
                }
                self.reserve_stack_host(1);
                self.push_raw(v);
                (st, 1)
            }
        };

        self.cur = self.resume_chain.pop().expect("resume chain underflow");
        debug_assert_eq!(self.cur, caller);
        self.move_between(co, caller, nres);
        *nresults_out = nres;
        status
    }

    fn resume_body(&mut self, fresh: bool) -> Result<(), Unwind> {
        let mut pending: Option<Unwind> = if fresh {
            // function sits at slot 0 with its arguments above
            match self.precall(0, -1) {
                Ok(Called::Native) => return Ok(()),
                Ok(Called::Frame) => self.execute(0).err(),
                Err(e) => Some(e),
            }
        } else {
            self.unroll().err()
        };
        // yieldable protected calls can intercept resume-side errors
        while let Some(Unwind::Error(st, v)) = pending {
            let Some(idx) = self.find_ypcall_frame() else {
                return Err(Unwind::Error(st, v));
            };
            pending = self.recover_ypcall(idx, st, v).err();
        }
        match pending {
            None => Ok(()),
            Some(u) => Err(u),
        }
    }

    /// Continue a suspended frame chain, frame by frame from the top:
    /// a language frame finishes its interrupted instruction and runs to
    /// completion; a host frame finishes through its continuation (or,
    /// without one, adopts the resume values as its results).
    fn unroll(&mut self) -> Result<(), Unwind> {
        loop {
            if self.th().frames.is_empty() {
                return Ok(());
            }
            if self.th().ci().is_lua() {
                self.finish_op()?;
                let floor = self.th().frames.len() - 1;
                self.execute(floor)?;
            } else {
                let (cont, ctx) = {
                    let ci = self.th().ci();
                    (ci.cont, ci.ctx)
                };
                let n = match cont {
                    Some(k) => k(self, Status::Yield, ctx)?,
                    // without a continuation, the resume arguments are
                    // the suspended call's results
                    None => self.th().resume_nargs,
                };
                let first = self.top() - n;
                self.poscall(first, n)?;
            }
        }
    }

    fn find_ypcall_frame(&self) -> Option<usize> {
        self.th()
            .frames
            .iter()
            .rposition(|ci| ci.status & CIST_YPCALL != 0)
    }

    /// Unwind a resume-side error into the nearest yieldable protected
    /// call and hand it to the continuation, then keep unrolling.
    fn recover_ypcall(&mut self, frame_idx: usize, status: Status, value: Value) -> Result<(), Unwind> {
        let (func, errfunc, cont, ctx) = {
            let ci = &self.th().frames[frame_idx];
            (ci.func, ci.saved_errfunc, ci.cont, ci.ctx)
        };
        let (status, value) = self.apply_errfunc(status, value, errfunc);
        self.unwind_to(frame_idx + 1, func + 1);
        {
            let ci = self.th_mut().ci_mut();
            ci.status &= !CIST_YPCALL;
            ci.cont = None;
        }
        self.reserve_stack_host(1);
        self.set_top_raw(func + 1);
        self.push_raw(value);
        let k = cont.expect("yieldable pcall without continuation");
        let n = k(self, status, ctx)?;
        let first = self.top() - n;
        self.poscall(first, n)?;
        self.unroll()
    }

    /// Yield the top `nresults` values. The returned unwind must be
    /// propagated (host functions simply return it).
    pub(crate) fn do_yield(
        &mut self,
        nresults: usize,
        cont: Option<(Continuation, i64)>,
    ) -> Unwind {
        if self.th().nny > 0 {
            return if self.cur == self.main {
                self.rt_error("attempt to yield from outside a coroutine".to_string())
            } else {
                self.rt_error("attempt to yield across a native call boundary".to_string())
            };
        }
        if let Some((k, ctx)) = cont {
            if !self.th().frames.is_empty() {
                let ci = self.th_mut().ci_mut();
                ci.cont = Some(k);
                ci.ctx = ctx;
            }
        }
        self.th_mut().n_yield = nresults;
        Unwind::Yield
    }

    /// Move `n` values from the top of one thread to the top of another.
    pub(crate) fn move_between(&mut self, from: ThreadRef, to: ThreadRef, n: usize) {
        if n == 0 {
            return;
        }
        let vals: Vec<Value> = {
            let f = self.thread_mut(from);
            let start = f.top - n;
            let v = f.stack[start..f.top].to_vec();
            f.top = start;
            v
        };
        let t = self.thread_mut(to);
        let needed = t.top + n;
        if needed > t.stack.len() {
            t.stack.resize(needed.max(t.stack.len() * 2), Value::Nil);
        }
        for v in vals {
            t.stack[t.top] = v;
            t.top += 1;
        }
    }

    // -----------------------------------------------------------------
    // Upvalues
    // -----------------------------------------------------------------

    /// Return the existing open cell for `slot`, or insert a new one.
    /// The per-thread list is ordered by slot, highest first.
    pub(crate) fn find_or_open_upval(&mut self, thread: ThreadRef, slot: usize) -> UpvalRef {
        let mut insert_at = None;
        {
            let th = self.thread(thread);
            for (i, &u) in th.open_upvals.iter().enumerate() {
                let uslot = self
                    .heap
                    .upvals
                    .get(u.0)
                    .open_slot()
                    .expect("closed cell on the open list");
                if uslot == slot {
                    return u;
                }
                if uslot < slot {
                    insert_at = Some(i);
                    break;
                }
            }
        }
        let u = self.heap.alloc_upval(Upvalue::open(thread, slot));
        let th = self.thread_mut(thread);
        match insert_at {
            Some(i) => th.open_upvals.insert(i, u),
            None => th.open_upvals.push(u),
        }
        u
    }

    /// Close every open cell at or above `level`: copy the stack slot
    /// into the cell and unlink it.
    pub(crate) fn close_upvalues(&mut self, thread: ThreadRef, level: usize) {
        loop {
            let (u, slot) = {
                let th = self.thread(thread);
                match th.open_upvals.first() {
                    Some(&u) => {
                        let slot = self
                            .heap
                            .upvals
                            .get(u.0)
                            .open_slot()
                            .expect("closed cell on the open list");
                        if slot < level {
                            return;
                        }
                        (u, slot)
                    }
                    None => return,
                }
            };
            let v = self.thread(thread).stack[slot];
            self.heap.upvals.get_mut(u.0).state = UpvalueState::Closed(v);
            self.heap.barrier_value(GcId::Upval(u), v);
            self.thread_mut(thread).open_upvals.remove(0);
        }
    }

    /// Current value of a cell, open or closed.
    pub(crate) fn upval_get(&self, u: UpvalRef) -> Value {
        match self.heap.upvals.get(u.0).state {
            UpvalueState::Open { thread, slot } => self.thread(thread).stack[slot],
            UpvalueState::Closed(v) => v,
        }
    }

    /// Store through a cell, open or closed.
    pub(crate) fn upval_set(&mut self, u: UpvalRef, v: Value) {
        match self.heap.upvals.get(u.0).state {
            UpvalueState::Open { thread, slot } => {
                self.thread_mut(thread).stack[slot] = v;
            }
            UpvalueState::Closed(_) => {
                self.heap.upvals.get_mut(u.0).state = UpvalueState::Closed(v);
                self.heap.barrier_value(GcId::Upval(u), v);
            }
        }
    }

    // -----------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------

    /// Deliver one hook event, shielding against recursion. Hook errors
    /// surface as runtime errors at the hooked instruction.
    pub(crate) fn call_hook(&mut self, event: HookEvent) -> Result<(), Unwind> {
        let Some(hook) = self.th().hook else {
            return Ok(());
        };
        if !self.th().allow_hook {
            return Ok(());
        }
        let saved_top = self.top();
        {
            let th = self.th_mut();
            th.allow_hook = false;
            if let Some(ci) = th.frames.last_mut() {
                ci.status |= CIST_HOOKED;
            }
        }
        self.reserve_stack_host(MIN_STACK);
        let r = hook(self, event);
        {
            let th = self.th_mut();
            th.allow_hook = true;
            if let Some(ci) = th.frames.last_mut() {
                ci.status &= !CIST_HOOKED;
            }
        }
        self.set_top_raw(saved_top);
        r.map_err(|e| {
            let msg = format!("error in debug hook: {}", e);
            self.rt_error(msg)
        })
    }

    // -----------------------------------------------------------------
    // Resuming an interrupted opcode
    // -----------------------------------------------------------------

    /// Complete the instruction that was suspended inside a metamethod.
    /// The metamethod's result (when one is due) sits on top of the
    /// stack, exactly where the finished frame left it.
    pub(crate) fn finish_op(&mut self) -> Result<(), Unwind> {
        let (base, pc, status) = {
            let ci = self.th().ci();
            (ci.base, ci.saved_pc, ci.status)
        };
        let proto = self.current_proto();
        let instr = self.heap.protos.get(proto.0).code[pc - 1];
        let Some(op) = instr.opcode() else {
            return Ok(());
        };
        match op {
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Div
            | OpCode::IDiv
            | OpCode::BAnd
            | OpCode::BOr
            | OpCode::BXor
            | OpCode::Shl
            | OpCode::Shr
            | OpCode::Unm
            | OpCode::BNot
            | OpCode::Len
            | OpCode::GetTable
            | OpCode::GetTabUp
            | OpCode::GetField
            | OpCode::SelfOp => {
                let v = self.pop_raw();
                self.stack_set(base + instr.a() as usize, v);
            }
            OpCode::Eq | OpCode::Lt | OpCode::Le => {
                let mut res = self.pop_raw().is_truthy();
                if status & CIST_LEQ != 0 {
                    self.th_mut().ci_mut().status &= !CIST_LEQ;
                    res = !res;
                }
                if res != (instr.a() != 0) {
                    // condition failed: skip the controlled jump
                    self.th_mut().ci_mut().saved_pc += 1;
                }
            }
            OpCode::SetTable | OpCode::SetTabUp => {
                // nothing to place
            }
            OpCode::Call | OpCode::TailCall | OpCode::TForCall => {
                if op == OpCode::Call && instr.c() != 0 {
                    let t = self.th().ci().top;
                    self.set_top_raw(t);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Prototype of the closure running in the current frame.
    pub(crate) fn current_proto(&self) -> crate::gc::ProtoRef {
        let ci = self.th().ci();
        match self.stack_get(ci.func) {
            Value::Closure(c) => self.heap.closures.get(c.0).proto,
            _ => panic!("current frame is not a language frame"),
        }
    }
}
