//! The bytecode interpreter
//!
//! One `execute` invocation drives the current thread's innermost frame
//! until that frame (the "floor") returns. Language-to-language calls
//! never recurse natively: CALL pushes a frame and the loop re-enters it.
//! Native recursion happens only at host boundaries and is bounded.
//!
//! Register pointers do not exist here: registers are `base + index`
//! offsets into the thread's stack vector, so any operation that grows
//! the stack or runs user code leaves them valid. The frame's `saved_pc`
//! is kept current before every operation that can raise, call, or
//! suspend, which is what lets a yield inside a metamethod resume
//! mid-instruction.

pub(crate) mod arith;
pub(crate) mod call;
pub(crate) mod meta;

pub use arith::ArithOp;
pub(crate) use call::Called;

use crate::gc::{ClosureRef, GcId, ProtoRef, UpvalRef};
use crate::object::{table, HookEvent, LClosure, Table, Unwind, Value};
use crate::state::{Vm, CIST_TAIL, MASK_COUNT, MASK_LINE};
use lumo_core::instr::{is_k, rk_index};
use lumo_core::limits::FIELDS_PER_FLUSH;
use lumo_core::{Instr, OpCode, TypeCode};

impl Vm {
    #[inline]
    pub(crate) fn r(&self, base: usize, i: u32) -> Value {
        self.th().stack[base + i as usize]
    }

    #[inline]
    pub(crate) fn set_r(&mut self, base: usize, i: u32, v: Value) {
        let th = self.th_mut();
        th.stack[base + i as usize] = v;
    }

    #[inline]
    pub(crate) fn k(&self, p: ProtoRef, i: usize) -> Value {
        self.heap.protos.get(p.0).consts[i]
    }

    /// RK operand: high bit selects the constant pool.
    #[inline]
    pub(crate) fn rk(&self, p: ProtoRef, base: usize, x: u32) -> Value {
        if is_k(x) {
            self.k(p, rk_index(x))
        } else {
            self.r(base, x)
        }
    }

    #[inline]
    fn code_at(&self, p: ProtoRef, pc: usize) -> Instr {
        self.heap.protos.get(p.0).code[pc]
    }

    fn cl_upval(&self, c: ClosureRef, i: usize) -> UpvalRef {
        self.heap.closures.get(c.0).upvals[i]
    }

    /// Run the interpreter until the frame at index `floor` returns.
    /// The current frame must be a language frame at or above the floor.
    pub(crate) fn execute(&mut self, floor: usize) -> Result<(), Unwind> {
        'reentry: loop {
            let (mut pc, base, cl) = {
                let ci = self.th().ci();
                let cl = match self.stack_get(ci.func) {
                    Value::Closure(c) => c,
                    other => panic!("language frame holds {}", other.type_name()),
                };
                (ci.saved_pc, ci.base, cl)
            };
            let proto = self.heap.closures.get(cl.0).proto;

            loop {
                if self.th().hook_mask & (MASK_COUNT | MASK_LINE) != 0 {
                    self.th_mut().ci_mut().saved_pc = pc;
                    self.instruction_hooks(proto, pc)?;
                }
                let instr = self.code_at(proto, pc);
                pc += 1;
                // keep the frame resumable and the error position honest
                self.th_mut().ci_mut().saved_pc = pc;

                let op = match instr.opcode() {
                    Some(op) => op,
                    None => {
                        return Err(
                            self.rt_error(format!("invalid opcode {:#04x}", instr.opcode_byte()))
                        )
                    }
                };
                let a = instr.a();

                match op {
                    // ===== Data movement =====
                    OpCode::Move => {
                        let v = self.r(base, instr.b());
                        self.set_r(base, a, v);
                    }
                    OpCode::LoadK => {
                        let v = self.k(proto, instr.bx() as usize);
                        self.set_r(base, a, v);
                    }
                    OpCode::LoadKx => {
                        let extra = self.code_at(proto, pc);
                        pc += 1;
                        self.th_mut().ci_mut().saved_pc = pc;
                        let v = self.k(proto, extra.ax_arg() as usize);
                        self.set_r(base, a, v);
                    }
                    OpCode::LoadBool => {
                        self.set_r(base, a, Value::Bool(instr.b() != 0));
                        if instr.c() != 0 {
                            pc += 1;
                        }
                    }
                    OpCode::LoadNil => {
                        for i in 0..=instr.b() {
                            self.set_r(base, a + i, Value::Nil);
                        }
                    }
                    OpCode::GetUpval => {
                        let u = self.cl_upval(cl, instr.b() as usize);
                        let v = self.upval_get(u);
                        self.set_r(base, a, v);
                    }
                    OpCode::SetUpval => {
                        let u = self.cl_upval(cl, instr.b() as usize);
                        let v = self.r(base, a);
                        self.upval_set(u, v);
                    }

                    // ===== Table access =====
                    OpCode::GetTabUp => {
                        let u = self.cl_upval(cl, instr.b() as usize);
                        let t = self.upval_get(u);
                        let k = self.rk(proto, base, instr.c());
                        let v = self.index_get(t, k)?;
                        self.set_r(base, a, v);
                    }
                    OpCode::GetTable => {
                        let t = self.r(base, instr.b());
                        let k = self.rk(proto, base, instr.c());
                        let v = self.index_get(t, k)?;
                        self.set_r(base, a, v);
                    }
                    OpCode::GetField => {
                        let t = self.r(base, instr.b());
                        let k = self.k(proto, instr.c() as usize);
                        debug_assert!(matches!(k, Value::Str(_)));
                        let v = self.index_get(t, k)?;
                        self.set_r(base, a, v);
                    }
                    OpCode::SetTabUp => {
                        let u = self.cl_upval(cl, a as usize);
                        let t = self.upval_get(u);
                        let k = self.rk(proto, base, instr.b());
                        let v = self.rk(proto, base, instr.c());
                        self.index_set(t, k, v)?;
                    }
                    OpCode::SetTable => {
                        let t = self.r(base, a);
                        let k = self.rk(proto, base, instr.b());
                        let v = self.rk(proto, base, instr.c());
                        self.index_set(t, k, v)?;
                    }
                    OpCode::NewTable => {
                        self.gc_checkpoint()?;
                        let narray = table::fb_to_int(instr.b());
                        let nhash = table::fb_to_int(instr.c());
                        let t = self.heap.alloc_table(Table::new(narray, nhash));
                        self.set_r(base, a, Value::Table(t));
                    }
                    OpCode::SelfOp => {
                        let t = self.r(base, instr.b());
                        self.set_r(base, a + 1, t);
                        let k = self.rk(proto, base, instr.c());
                        let v = self.index_get(t, k)?;
                        self.set_r(base, a, v);
                    }

                    // ===== Arithmetic, bitwise, unary =====
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
                    | OpCode::Shr => {
                        let x = self.rk(proto, base, instr.b());
                        let y = self.rk(proto, base, instr.c());
                        let v = self.arith_event(binop_of(op), x, y)?;
                        self.set_r(base, a, v);
                    }
                    OpCode::Unm => {
                        let x = self.rk(proto, base, instr.b());
                        let v = self.arith_event(ArithOp::Unm, x, x)?;
                        self.set_r(base, a, v);
                    }
                    OpCode::BNot => {
                        let x = self.rk(proto, base, instr.b());
                        let v = self.arith_event(ArithOp::BNot, x, x)?;
                        self.set_r(base, a, v);
                    }
                    OpCode::Not => {
                        let x = self.r(base, instr.b());
                        self.set_r(base, a, Value::Bool(!x.is_truthy()));
                    }
                    OpCode::Len => {
                        let x = self.r(base, instr.b());
                        let v = self.length_event(x)?;
                        self.set_r(base, a, v);
                    }
                    OpCode::Concat => {
                        let b = instr.b() as usize;
                        let c = instr.c() as usize;
                        self.gc_checkpoint()?;
                        self.set_top_raw(base + c + 1);
                        self.concat_range(c - b + 1)?;
                        let v = self.stack_get(base + b);
                        self.set_r(base, a, v);
                        let t = self.th().ci().top;
                        self.set_top_raw(t);
                    }

                    // ===== Comparisons and branches =====
                    OpCode::Jmp => {
                        pc = (pc as i64 + instr.sbx() as i64) as usize;
                        if a != 0 {
                            self.close_upvalues(self.cur, base + a as usize - 1);
                        }
                    }
                    OpCode::Eq | OpCode::Lt | OpCode::Le => {
                        let x = self.rk(proto, base, instr.b());
                        let y = self.rk(proto, base, instr.c());
                        let cond = match op {
                            OpCode::Eq => self.equals_event(x, y)?,
                            OpCode::Lt => self.less_than(x, y)?,
                            _ => self.less_equal(x, y)?,
                        };
                        if cond != (a != 0) {
                            pc += 1; // skip the controlled jump
                        }
                    }
                    OpCode::Test => {
                        let x = self.r(base, a);
                        if x.is_truthy() != (instr.c() != 0) {
                            pc += 1;
                        }
                    }
                    OpCode::TestSet => {
                        let x = self.r(base, instr.b());
                        if x.is_truthy() != (instr.c() != 0) {
                            pc += 1;
                        } else {
                            self.set_r(base, a, x);
                        }
                    }

                    // ===== Calls and returns =====
                    OpCode::Call => {
                        let b = instr.b();
                        let c = instr.c();
                        let func_idx = base + a as usize;
                        if b != 0 {
                            self.set_top_raw(func_idx + b as usize);
                        }
                        match self.precall(func_idx, c as i32 - 1)? {
                            Called::Native => {
                                if c != 0 {
                                    let t = self.th().ci().top;
                                    self.set_top_raw(t);
                                }
                            }
                            Called::Frame => continue 'reentry,
                        }
                    }
                    OpCode::TailCall => {
                        let b = instr.b();
                        let func_idx = base + a as usize;
                        if b != 0 {
                            self.set_top_raw(func_idx + b as usize);
                        }
                        let callee = self.stack_get(func_idx);
                        if matches!(callee, Value::Closure(_)) {
                            // reuse the caller's frame slot
                            self.close_upvalues(self.cur, base);
                            let (frame_func, nresults) = {
                                let ci = self.th().ci();
                                (ci.func, ci.nresults)
                            };
                            let nargs = self.top() - func_idx - 1;
                            for i in 0..=nargs {
                                let v = self.stack_get(func_idx + i);
                                self.stack_set(frame_func + i, v);
                            }
                            self.set_top_raw(frame_func + 1 + nargs);
                            self.th_mut().frames.pop();
                            match self.precall(frame_func, nresults)? {
                                Called::Frame => {
                                    self.th_mut().ci_mut().status |= CIST_TAIL;
                                    continue 'reentry;
                                }
                                Called::Native => unreachable!("checked callable kind"),
                            }
                        } else {
                            // native callees complete in place; the
                            // following RETURN ships the results
                            self.close_upvalues(self.cur, base);
                            match self.precall(func_idx, -1)? {
                                Called::Native => {}
                                Called::Frame => unreachable!("checked callable kind"),
                            }
                        }
                    }
                    OpCode::Return => {
                        let b = instr.b();
                        let first = base + a as usize;
                        let has_children = !self.heap.protos.get(proto.0).protos.is_empty();
                        if has_children {
                            self.close_upvalues(self.cur, base);
                        }
                        let nres = if b == 0 {
                            self.top() - first
                        } else {
                            b as usize - 1
                        };
                        let fixed = self.poscall(first, nres)?;
                        if self.th().frames.len() <= floor {
                            return Ok(());
                        }
                        if !self.th().ci().is_lua() {
                            // an unrolled chain has reached a suspended
                            // host frame; hand control back
                            return Ok(());
                        }
                        if fixed {
                            let t = self.th().ci().top;
                            self.set_top_raw(t);
                        }
                        continue 'reentry;
                    }

                    // ===== Numeric for-loop =====
                    OpCode::ForPrep => {
                        let ra = base + a as usize;
                        self.for_prep(ra)?;
                        pc = (pc as i64 + instr.sbx() as i64) as usize;
                    }
                    OpCode::ForLoop => {
                        let ra = base + a as usize;
                        if self.for_loop_step(ra)? {
                            pc = (pc as i64 + instr.sbx() as i64) as usize;
                        }
                    }

                    // ===== Generic for-loop =====
                    OpCode::TForCall => {
                        let ra = base + a as usize;
                        let cb = ra + 3; // call window
                        self.reserve_stack(3)?;
                        for i in 0..3 {
                            let v = self.stack_get(ra + i);
                            self.stack_set(cb + i, v);
                        }
                        self.set_top_raw(cb + 3);
                        match self.precall(cb, instr.c() as i32)? {
                            Called::Native => {
                                let t = self.th().ci().top;
                                self.set_top_raw(t);
                            }
                            Called::Frame => continue 'reentry,
                        }
                    }
                    OpCode::TForLoop => {
                        let ra = base + a as usize;
                        let ctrl = self.stack_get(ra + 1);
                        if !ctrl.is_nil() {
                            self.stack_set(ra, ctrl);
                            pc = (pc as i64 + instr.sbx() as i64) as usize;
                        }
                    }

                    // ===== Aggregates and closures =====
                    OpCode::SetList => {
                        let b = instr.b();
                        let mut c = instr.c();
                        if c == 0 {
                            let extra = self.code_at(proto, pc);
                            pc += 1;
                            self.th_mut().ci_mut().saved_pc = pc;
                            c = extra.ax_arg();
                        }
                        let ra = base + a as usize;
                        let n = if b == 0 {
                            self.top() - ra - 1
                        } else {
                            b as usize
                        };
                        let t = match self.stack_get(ra) {
                            Value::Table(t) => t,
                            other => {
                                return Err(self.type_error("set list on", other));
                            }
                        };
                        let start = (c as usize - 1) * FIELDS_PER_FLUSH;
                        for i in 1..=n {
                            let v = self.stack_get(ra + i);
                            self.raw_set_or_raise(t, Value::Int((start + i) as i64), v)?;
                        }
                        let top = self.th().ci().top;
                        self.set_top_raw(top);
                    }
                    OpCode::Closure => {
                        self.gc_checkpoint()?;
                        let child = self.heap.protos.get(proto.0).protos[instr.bx() as usize];
                        let v = self.make_closure(child, cl, base)?;
                        self.set_r(base, a, v);
                    }
                    OpCode::Vararg => {
                        let b = instr.b();
                        let ra = base + a as usize;
                        let (func, num_params) = {
                            let ci = self.th().ci();
                            let np = self.heap.protos.get(proto.0).num_params as usize;
                            (ci.func, np)
                        };
                        let n = (base - func - 1).saturating_sub(num_params);
                        if b == 0 {
                            self.reserve_stack(n)?;
                            for i in 0..n {
                                let v = self.stack_get(func + 1 + num_params + i);
                                self.stack_set(ra + i, v);
                            }
                            self.set_top_raw(ra + n);
                        } else {
                            let wanted = b as usize - 1;
                            for i in 0..wanted {
                                let v = if i < n {
                                    self.stack_get(func + 1 + num_params + i)
                                } else {
                                    Value::Nil
                                };
                                self.stack_set(ra + i, v);
                            }
                        }
                    }
                    OpCode::ExtraArg => {
                        return Err(self.rt_error("stray EXTRAARG".to_string()));
                    }

                    // ===== Typed fast paths =====
                    OpCode::AddII => {
                        let (x, y) = self.typed_int_pair(base, instr)?;
                        self.set_r(base, a, Value::Int(x.wrapping_add(y)));
                    }
                    OpCode::MulII => {
                        let (x, y) = self.typed_int_pair(base, instr)?;
                        self.set_r(base, a, Value::Int(x.wrapping_mul(y)));
                    }
                    OpCode::AddFF => {
                        let (x, y) = self.typed_float_pair(base, instr)?;
                        self.set_r(base, a, Value::Float(x + y));
                    }
                    OpCode::GetAI | OpCode::GetAF => {
                        let t = self.typed_array_reg(base, instr.b(), op == OpCode::GetAF)?;
                        let i = match self.r(base, instr.c()) {
                            Value::Int(i) => i,
                            other => return Err(self.typed_mismatch("integer", other)),
                        };
                        let len = table::raw_len(&self.heap, t);
                        if i < 1 || i > len {
                            return Err(self.rt_error(format!(
                                "array index {} out of range (length {})",
                                i, len
                            )));
                        }
                        let v = table::raw_geti(&self.heap, t, i);
                        self.set_r(base, a, v);
                    }
                    OpCode::SetAI | OpCode::SetAF => {
                        let t = self.typed_array_reg(base, a, op == OpCode::SetAF)?;
                        let i = match self.r(base, instr.b()) {
                            Value::Int(i) => i,
                            other => return Err(self.typed_mismatch("integer", other)),
                        };
                        let v = self.rk(proto, base, instr.c());
                        table::raw_seti(&mut self.heap, t, i, v)
                            .map_err(|e| self.rt_error(e.message()))?;
                    }
                    OpCode::ForPrepII => {
                        let ra = base + a as usize;
                        let (init, step) = match (self.stack_get(ra), self.stack_get(ra + 2)) {
                            (Value::Int(i), Value::Int(s)) => (i, s),
                            _ => {
                                return Err(
                                    self.rt_error("integer 'for' loop on non-integer".to_string())
                                )
                            }
                        };
                        if !matches!(self.stack_get(ra + 1), Value::Int(_)) {
                            return Err(
                                self.rt_error("integer 'for' loop on non-integer".to_string())
                            );
                        }
                        self.stack_set(ra, Value::Int(init.wrapping_sub(step)));
                        pc = (pc as i64 + instr.sbx() as i64) as usize;
                    }
                    OpCode::ForLoopII => {
                        let ra = base + a as usize;
                        let (i, limit, step) = match (
                            self.stack_get(ra),
                            self.stack_get(ra + 1),
                            self.stack_get(ra + 2),
                        ) {
                            (Value::Int(i), Value::Int(l), Value::Int(s)) => (i, l, s),
                            _ => {
                                return Err(
                                    self.rt_error("integer 'for' loop on non-integer".to_string())
                                )
                            }
                        };
                        let next = i.wrapping_add(step);
                        let proceed = if step > 0 { next <= limit } else { limit <= next };
                        if proceed {
                            self.stack_set(ra, Value::Int(next));
                            self.stack_set(ra + 3, Value::Int(next));
                            pc = (pc as i64 + instr.sbx() as i64) as usize;
                        }
                    }
                    OpCode::MoveI => {
                        let v = self.r(base, instr.b());
                        if !matches!(v, Value::Int(_)) {
                            return Err(self.typed_mismatch("integer", v));
                        }
                        self.set_r(base, a, v);
                    }
                    OpCode::MoveF => {
                        let v = self.r(base, instr.b());
                        if !matches!(v, Value::Float(_)) {
                            return Err(self.typed_mismatch("number", v));
                        }
                        self.set_r(base, a, v);
                    }
                    OpCode::MoveAI | OpCode::MoveAF => {
                        let v = self.r(base, instr.b());
                        let want_float = op == OpCode::MoveAF;
                        let ok = matches!(v, Value::Table(t) if {
                            let tb = self.heap.tables.get(t.0);
                            if want_float { tb.is_float_array() } else { tb.is_int_array() }
                        });
                        if !ok {
                            return Err(self.typed_mismatch(
                                if want_float { "number[]" } else { "integer[]" },
                                v,
                            ));
                        }
                        self.set_r(base, a, v);
                    }
                    OpCode::MoveTab => {
                        let v = self.r(base, instr.b());
                        let ok = matches!(v, Value::Table(t)
                            if !self.heap.tables.get(t.0).is_typed_array());
                        if !ok {
                            return Err(self.typed_mismatch("table", v));
                        }
                        self.set_r(base, a, v);
                    }
                    OpCode::SetUpvalT => {
                        let v = self.r(base, a);
                        let code = TypeCode::from_operand(instr.c())
                            .ok_or_else(|| self.rt_error("bad type code".to_string()))?;
                        if !self.value_matches_code(v, code) {
                            return Err(self.typed_mismatch(code.name(), v));
                        }
                        let u = self.cl_upval(cl, instr.b() as usize);
                        self.upval_set(u, v);
                    }
                    OpCode::ToType => {
                        let v = self.r(base, instr.b());
                        let code = TypeCode::from_operand(instr.c())
                            .ok_or_else(|| self.rt_error("bad type code".to_string()))?;
                        let out = match code {
                            TypeCode::Int => match v {
                                Value::Int(_) => v,
                                Value::Float(f) => match lumo_core::num::float_to_int(f) {
                                    Some(i) => Value::Int(i),
                                    None => return Err(self.typed_mismatch("integer", v)),
                                },
                                _ => return Err(self.typed_mismatch("integer", v)),
                            },
                            TypeCode::Float => match v {
                                Value::Float(_) => v,
                                Value::Int(i) => Value::Float(i as f64),
                                _ => return Err(self.typed_mismatch("number", v)),
                            },
                            TypeCode::IntArray | TypeCode::FloatArray | TypeCode::Table => {
                                if !self.value_matches_code(v, code) {
                                    return Err(self.typed_mismatch(code.name(), v));
                                }
                                v
                            }
                        };
                        self.set_r(base, a, out);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Opcode helpers
    // -----------------------------------------------------------------

    fn typed_int_pair(&mut self, base: usize, instr: Instr) -> Result<(i64, i64), Unwind> {
        let x = match self.r(base, instr.b()) {
            Value::Int(x) => x,
            other => return Err(self.typed_mismatch("integer", other)),
        };
        let y = match self.r(base, instr.c()) {
            Value::Int(y) => y,
            other => return Err(self.typed_mismatch("integer", other)),
        };
        Ok((x, y))
    }

    fn typed_float_pair(&mut self, base: usize, instr: Instr) -> Result<(f64, f64), Unwind> {
        let x = match self.r(base, instr.b()) {
            Value::Float(x) => x,
            other => return Err(self.typed_mismatch("number", other)),
        };
        let y = match self.r(base, instr.c()) {
            Value::Float(y) => y,
            other => return Err(self.typed_mismatch("number", other)),
        };
        Ok((x, y))
    }

    fn typed_array_reg(
        &mut self,
        base: usize,
        reg: u32,
        want_float: bool,
    ) -> Result<crate::gc::TableRef, Unwind> {
        match self.r(base, reg) {
            Value::Table(t) => {
                let tb = self.heap.tables.get(t.0);
                let ok = if want_float {
                    tb.is_float_array()
                } else {
                    tb.is_int_array()
                };
                if ok {
                    Ok(t)
                } else {
                    let v = Value::Table(t);
                    Err(self.typed_mismatch(
                        if want_float { "number[]" } else { "integer[]" },
                        v,
                    ))
                }
            }
            other => Err(self.typed_mismatch(
                if want_float { "number[]" } else { "integer[]" },
                other,
            )),
        }
    }

    fn value_matches_code(&self, v: Value, code: TypeCode) -> bool {
        match code {
            TypeCode::Int => matches!(v, Value::Int(_)),
            TypeCode::Float => matches!(v, Value::Float(_)),
            TypeCode::IntArray => {
                matches!(v, Value::Table(t) if self.heap.tables.get(t.0).is_int_array())
            }
            TypeCode::FloatArray => {
                matches!(v, Value::Table(t) if self.heap.tables.get(t.0).is_float_array())
            }
            TypeCode::Table => {
                matches!(v, Value::Table(t) if !self.heap.tables.get(t.0).is_typed_array())
            }
        }
    }

    pub(crate) fn typed_mismatch(&mut self, expected: &str, got: Value) -> Unwind {
        let msg = format!("type check failed: expected {}, got {}", expected, got.type_name());
        self.rt_error(msg)
    }

    /// FORPREP: choose the integer or float loop form, coerce the three
    /// control values, and pre-subtract the step.
    fn for_prep(&mut self, ra: usize) -> Result<(), Unwind> {
        let init = self.stack_get(ra);
        let limit = self.stack_get(ra + 1);
        let step = self.stack_get(ra + 2);
        if let (Value::Int(i), Value::Int(s)) = (init, step) {
            if s == 0 {
                return Err(self.rt_error("'for' step is zero".to_string()));
            }
            if let Some((ilimit, skip)) = for_int_limit(limit, s) {
                let start = if skip { ilimit.wrapping_add(s) } else { i };
                self.stack_set(ra, Value::Int(start.wrapping_sub(s)));
                self.stack_set(ra + 1, Value::Int(ilimit));
                return Ok(());
            }
        }
        // float form: all three must be numbers
        let fi = require_number(init).ok_or_else(|| {
            self.rt_error("'for' initial value must be a number".to_string())
        })?;
        let fl = require_number(limit)
            .ok_or_else(|| self.rt_error("'for' limit must be a number".to_string()))?;
        let fs = require_number(step)
            .ok_or_else(|| self.rt_error("'for' step must be a number".to_string()))?;
        if fs == 0.0 {
            return Err(self.rt_error("'for' step is zero".to_string()));
        }
        self.stack_set(ra, Value::Float(fi - fs));
        self.stack_set(ra + 1, Value::Float(fl));
        self.stack_set(ra + 2, Value::Float(fs));
        Ok(())
    }

    /// FORLOOP: add the step, test against the limit, and refresh both
    /// the hidden control slot and the user-visible variable. Returns
    /// whether the loop continues.
    fn for_loop_step(&mut self, ra: usize) -> Result<bool, Unwind> {
        match self.stack_get(ra) {
            Value::Int(i) => {
                let step = match self.stack_get(ra + 2) {
                    Value::Int(s) => s,
                    _ => unreachable!("FORPREP fixed the loop kind"),
                };
                let limit = match self.stack_get(ra + 1) {
                    Value::Int(l) => l,
                    _ => unreachable!("FORPREP fixed the loop kind"),
                };
                let next = i.wrapping_add(step);
                let proceed = if step > 0 { next <= limit } else { limit <= next };
                if proceed {
                    self.stack_set(ra, Value::Int(next));
                    self.stack_set(ra + 3, Value::Int(next));
                }
                Ok(proceed)
            }
            Value::Float(f) => {
                let step = match self.stack_get(ra + 2) {
                    Value::Float(s) => s,
                    _ => unreachable!("FORPREP fixed the loop kind"),
                };
                let limit = match self.stack_get(ra + 1) {
                    Value::Float(l) => l,
                    _ => unreachable!("FORPREP fixed the loop kind"),
                };
                let next = f + step;
                let proceed = if step > 0.0 { next <= limit } else { limit <= next };
                if proceed {
                    self.stack_set(ra, Value::Float(next));
                    self.stack_set(ra + 3, Value::Float(next));
                }
                Ok(proceed)
            }
            _ => Err(self.rt_error("'for' control variable corrupted".to_string())),
        }
    }

    /// CLOSURE: reuse the prototype's cached closure when every upvalue
    /// would resolve to the same cell, otherwise build a new closure and
    /// (unless the prototype is black) cache it.
    fn make_closure(
        &mut self,
        child: ProtoRef,
        parent_cl: ClosureRef,
        base: usize,
    ) -> Result<Value, Unwind> {
        if let Some(cached) = self.heap.protos.get(child.0).cache {
            if self.closure_cache_valid(cached, child, parent_cl, base) {
                return Ok(Value::Closure(cached));
            }
        }
        let descs = self.heap.protos.get(child.0).upvals.clone();
        let mut upvals = Vec::with_capacity(descs.len());
        for d in &descs {
            let cell = if d.in_stack {
                self.find_or_open_upval(self.cur, base + d.index as usize)
            } else {
                self.cl_upval(parent_cl, d.index as usize)
            };
            upvals.push(cell);
        }
        let c = self.heap.alloc_closure(LClosure {
            proto: child,
            upvals,
        });
        // never create a fresh reference inside a black prototype
        if self.heap.color_of(GcId::Proto(child)) != crate::gc::Color::Black {
            self.heap.protos.get_mut(child.0).cache = Some(c);
        }
        Ok(Value::Closure(c))
    }

    fn closure_cache_valid(
        &self,
        cached: ClosureRef,
        child: ProtoRef,
        parent_cl: ClosureRef,
        base: usize,
    ) -> bool {
        let descs = &self.heap.protos.get(child.0).upvals;
        let cached_upvals = &self.heap.closures.get(cached.0).upvals;
        if descs.len() != cached_upvals.len() {
            return false;
        }
        descs.iter().zip(cached_upvals).all(|(d, &cell)| {
            if d.in_stack {
                match self.heap.upvals.get(cell.0).state {
                    crate::object::UpvalueState::Open { thread, slot } => {
                        thread == self.cur && slot == base + d.index as usize
                    }
                    crate::object::UpvalueState::Closed(_) => false,
                }
            } else {
                cell == self.heap.closures.get(parent_cl.0).upvals[d.index as usize]
            }
        })
    }

    /// Per-instruction count and line hooks.
    fn instruction_hooks(&mut self, proto: ProtoRef, pc: usize) -> Result<(), Unwind> {
        if self.th().hook_mask & MASK_COUNT != 0 {
            let fire = {
                let th = self.th_mut();
                if th.hook_counter > 1 {
                    th.hook_counter -= 1;
                    false
                } else {
                    th.hook_counter = th.hook_count.max(1);
                    true
                }
            };
            if fire {
                self.call_hook(HookEvent::Count)?;
            }
        }
        if self.th().hook_mask & MASK_LINE != 0 {
            if let Some(line) = self.heap.protos.get(proto.0).line_at(pc) {
                if line != self.th().last_line {
                    self.th_mut().last_line = line;
                    self.call_hook(HookEvent::Line(line))?;
                }
            }
        }
        Ok(())
    }
}

fn binop_of(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Mod => ArithOp::Mod,
        OpCode::Pow => ArithOp::Pow,
        OpCode::Div => ArithOp::Div,
        OpCode::IDiv => ArithOp::IDiv,
        OpCode::BAnd => ArithOp::BAnd,
        OpCode::BOr => ArithOp::BOr,
        OpCode::BXor => ArithOp::BXor,
        OpCode::Shl => ArithOp::Shl,
        OpCode::Shr => ArithOp::Shr,
        _ => unreachable!("not a binary arithmetic opcode"),
    }
}

fn require_number(v: Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(i as f64),
        Value::Float(f) => Some(f),
        _ => None,
    }
}

/// Integer bound for an integer for-loop: a float limit rounds toward
/// the loop interior, limits beyond the integer range clamp (or mark the
/// loop statically empty). `None` selects the float form.
fn for_int_limit(limit: Value, step: i64) -> Option<(i64, bool)> {
    match limit {
        Value::Int(l) => Some((l, false)),
        Value::Float(f) => {
            if f.is_nan() {
                return Some((0, true));
            }
            let rounded = if step > 0 { f.floor() } else { f.ceil() };
            match lumo_core::num::float_to_int(rounded) {
                Some(l) => Some((l, false)),
                // above every integer: saturate upward loops, skip
                // downward ones
                None if rounded > 0.0 => Some((i64::MAX, step < 0)),
                // below every integer: the mirror case
                None => Some((i64::MIN, step > 0)),
            }
        }
        _ => None,
    }
}
