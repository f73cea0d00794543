//! The embedder stack API
//!
//! Host code manipulates the current thread's stack through integer
//! indices: positive indices count from the frame base, negative ones
//! from the top, and two pseudo-index ranges address the registry and
//! the running host closure's upvalues. `&mut Vm` receivers are the
//! cooperative lock the contract demands: recursive entry cannot
//! compile.

mod exec;
mod table_api;

pub use exec::CompareOp;

use crate::gc::{StrRef, ThreadRef};
use crate::object::{CClosure, CFunction, Unwind, Value};
use crate::state::Vm;
use crate::interp::arith;
use crate::LumoError;
use lumo_core::limits::{MAX_STACK, MAX_UPVALUES, REGISTRY_INDEX};
use lumo_core::TypeTag;

impl Vm {
    /// First stack slot visible to the embedder (slot of index 1).
    pub(crate) fn stack_bottom(&self) -> usize {
        match self.th().frames.last() {
            Some(ci) => ci.func + 1,
            None => 0,
        }
    }

    /// Absolute stack slot of an index, when it names a real slot.
    pub(crate) fn index2slot(&self, idx: i64) -> Option<usize> {
        let bottom = self.stack_bottom() as i64;
        let top = self.top() as i64;
        if idx > 0 {
            let slot = bottom + idx - 1;
            if slot < top {
                Some(slot as usize)
            } else {
                None
            }
        } else if idx > REGISTRY_INDEX && idx < 0 {
            let slot = top + idx;
            if slot >= bottom {
                Some(slot as usize)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Value at an index, pseudo-indices included. `None` is the
    /// "no value" of an invalid index.
    pub(crate) fn index_value(&self, idx: i64) -> Option<Value> {
        if idx == REGISTRY_INDEX {
            return Some(Value::Table(self.registry));
        }
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx) as usize; // 1-based upvalue
            let ci = self.th().frames.last()?;
            if let Value::CClosure(c) = self.stack_get(ci.func) {
                return self.heap.cclosures.get(c.0).upvals.get(n - 1).copied();
            }
            return None;
        }
        self.index2slot(idx).map(|s| self.stack_get(s))
    }

    /// Store into an index, pseudo-indices included.
    pub(crate) fn set_index_value(&mut self, idx: i64, v: Value) {
        if idx == REGISTRY_INDEX {
            panic!("the registry pseudo-index is not writable");
        }
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx) as usize;
            let ci_func = self.th().frames.last().expect("no running function").func;
            if let Value::CClosure(c) = self.stack_get(ci_func) {
                self.heap.cclosures.get_mut(c.0).upvals[n - 1] = v;
                self.heap
                    .barrier_value(crate::gc::GcId::CClosure(c), v);
                return;
            }
            panic!("upvalue pseudo-index outside a host closure");
        }
        let slot = self.index2slot(idx).expect("invalid stack index");
        self.stack_set(slot, v);
    }

    // -----------------------------------------------------------------
    // Stack shape
    // -----------------------------------------------------------------

    /// Convert a relative index into an absolute one.
    pub fn abs_index(&self, idx: i64) -> i64 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            self.gettop() as i64 + idx + 1
        }
    }

    /// Number of values on the current frame's stack.
    pub fn gettop(&self) -> usize {
        self.top() - self.stack_bottom()
    }

    /// Set the top: growing nil-fills, shrinking drops.
    pub fn settop(&mut self, idx: i64) {
        let bottom = self.stack_bottom();
        let new_top = if idx >= 0 {
            bottom + idx as usize
        } else {
            let t = self.top() as i64 + idx + 1;
            assert!(t >= bottom as i64, "settop below the frame base");
            t as usize
        };
        let old_top = self.top();
        if new_top > old_top {
            self.reserve_stack_host(new_top - old_top);
            for i in old_top..new_top {
                self.stack_set(i, Value::Nil);
            }
        }
        self.set_top_raw(new_top);
    }

    /// Pop `n` values.
    pub fn pop(&mut self, n: usize) {
        let t = self.top() - n;
        assert!(t >= self.stack_bottom(), "pop past the frame base");
        self.set_top_raw(t);
    }

    /// Ensure space for `n` more pushes. Returns false instead of
    /// raising when the hard ceiling makes that impossible.
    pub fn checkstack(&mut self, n: usize) -> bool {
        let th = self.th();
        let needed = th.top + n;
        if needed <= th.stack.len() {
            return true;
        }
        if needed > MAX_STACK {
            return false;
        }
        self.reserve_stack_host(n);
        true
    }

    /// Rotate the segment between `idx` and the top by `n` positions
    /// (toward the top when positive), as three reversals.
    pub fn rotate(&mut self, idx: i64, n: i64) {
        let lo = self.index2slot(idx).expect("invalid rotate index");
        let hi = self.top();
        let len = hi - lo;
        if len == 0 {
            return;
        }
        let n = n.rem_euclid(len as i64) as usize;
        let th = self.th_mut();
        let seg = &mut th.stack[lo..hi];
        seg.reverse();
        seg[..n].reverse();
        seg[n..].reverse();
    }

    /// Copy the value at `from` over the slot at `to`.
    pub fn copy(&mut self, from: i64, to: i64) {
        let v = self.index_value(from).expect("invalid source index");
        self.set_index_value(to, v);
    }

    /// Move the top value into position `idx`, shifting up.
    pub fn insert(&mut self, idx: i64) {
        self.rotate(idx, 1);
    }

    /// Remove the value at `idx`, shifting down.
    pub fn remove(&mut self, idx: i64) {
        self.rotate(idx, -1);
        self.pop(1);
    }

    /// Replace the value at `idx` with the popped top.
    pub fn replace(&mut self, idx: i64) {
        let v = self.pop_raw();
        self.set_index_value(idx, v);
    }

    /// Move `n` values from this thread's top to another thread of the
    /// same group.
    pub fn xmove(&mut self, to: ThreadRef, n: usize) {
        assert!(self.gettop() >= n, "xmove without enough values");
        let from = self.cur;
        self.move_between(from, to, n);
    }

    // -----------------------------------------------------------------
    // Push family
    // -----------------------------------------------------------------

    /// Push nil.
    pub fn push_nil(&mut self) {
        self.reserve_stack_host(1);
        self.push_raw(Value::Nil);
    }

    /// Push a boolean.
    pub fn push_boolean(&mut self, b: bool) {
        self.reserve_stack_host(1);
        self.push_raw(Value::Bool(b));
    }

    /// Push an integer.
    pub fn push_integer(&mut self, i: i64) {
        self.reserve_stack_host(1);
        self.push_raw(Value::Int(i));
    }

    /// Push a float.
    pub fn push_number(&mut self, f: f64) {
        self.reserve_stack_host(1);
        self.push_raw(Value::Float(f));
    }

    /// Push a (interned if short) string.
    pub fn push_string(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Push a byte string.
    pub fn push_bytes(&mut self, b: &[u8]) {
        self.check_gc();
        let s = self.new_string(b);
        self.reserve_stack_host(1);
        self.push_raw(Value::Str(s));
    }

    /// Push formatted text.
    pub fn push_fstring(&mut self, args: std::fmt::Arguments<'_>) {
        let s = std::fmt::format(args);
        self.push_string(&s);
    }

    /// Push a bare host function.
    pub fn push_cfunction(&mut self, f: CFunction) {
        self.reserve_stack_host(1);
        self.push_raw(Value::LightFn(f));
    }

    /// Push a host closure capturing the top `nup` values.
    pub fn push_cclosure(&mut self, f: CFunction, nup: usize) {
        assert!(nup <= MAX_UPVALUES, "too many upvalues");
        if nup == 0 {
            self.push_cfunction(f);
            return;
        }
        self.check_gc();
        let top = self.top();
        let upvals: Vec<Value> = (top - nup..top).map(|i| self.stack_get(i)).collect();
        let c = self.heap.alloc_cclosure(CClosure { func: f, upvals });
        self.set_top_raw(top - nup);
        self.reserve_stack_host(1);
        self.push_raw(Value::CClosure(c));
    }

    /// Push a bare host pointer.
    pub fn push_light_userdata(&mut self, p: *mut std::ffi::c_void) {
        self.reserve_stack_host(1);
        self.push_raw(Value::LightUserdata(p));
    }

    /// Push the current thread; returns true when it is the main thread.
    pub fn push_thread(&mut self) -> bool {
        self.reserve_stack_host(1);
        let cur = self.cur;
        self.push_raw(Value::Thread(cur));
        cur == self.main
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&mut self, idx: i64) {
        let v = self.index_value(idx).unwrap_or(Value::Nil);
        self.reserve_stack_host(1);
        self.push_raw(v);
    }

    // -----------------------------------------------------------------
    // Access family
    // -----------------------------------------------------------------

    /// Type tag at an index; `TypeTag::None` for invalid indices.
    pub fn type_of(&self, idx: i64) -> TypeTag {
        match self.index_value(idx) {
            Some(v) => v.type_tag(),
            None => TypeTag::None,
        }
    }

    /// Is the value nil?
    pub fn is_nil(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(Value::Nil))
    }

    /// Is the index invalid?
    pub fn is_none(&self, idx: i64) -> bool {
        self.index_value(idx).is_none()
    }

    /// Invalid index or nil?
    pub fn is_none_or_nil(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), None | Some(Value::Nil))
    }

    /// Is the value a boolean?
    pub fn is_boolean(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(Value::Bool(_)))
    }

    /// Is the value a number (integer or float)?
    pub fn is_number(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(v) if v.is_number())
    }

    /// Is the value an integer proper?
    pub fn is_integer(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(Value::Int(_)))
    }

    /// Is the value a string or a number (which always converts)?
    pub fn is_string(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(v) if matches!(v, Value::Str(_)) || v.is_number())
    }

    /// Is the value any table, typed arrays included?
    pub fn is_table(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(Value::Table(_)))
    }

    /// Is the value an integer array or integer slice?
    pub fn is_integer_array(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(Value::Table(t))
            if self.heap.tables.get(t.0).is_int_array())
    }

    /// Is the value a float array or float slice?
    pub fn is_number_array(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(Value::Table(t))
            if self.heap.tables.get(t.0).is_float_array())
    }

    /// Is the value callable?
    pub fn is_function(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(v) if v.is_function())
    }

    /// Is the value a bare host function?
    pub fn is_cfunction(&self, idx: i64) -> bool {
        matches!(
            self.index_value(idx),
            Some(Value::LightFn(_)) | Some(Value::CClosure(_))
        )
    }

    /// Is the value a full or light userdata?
    pub fn is_userdata(&self, idx: i64) -> bool {
        matches!(
            self.index_value(idx),
            Some(Value::Userdata(_)) | Some(Value::LightUserdata(_))
        )
    }

    /// Is the value a thread?
    pub fn is_thread(&self, idx: i64) -> bool {
        matches!(self.index_value(idx), Some(Value::Thread(_)))
    }

    /// Truthiness; invalid indices read as false.
    pub fn to_boolean(&self, idx: i64) -> bool {
        self.index_value(idx).map(|v| v.is_truthy()).unwrap_or(false)
    }

    /// Integer conversion with string coercion.
    pub fn to_integer(&self, idx: i64) -> Option<i64> {
        arith::to_integer(self, self.index_value(idx)?)
    }

    /// Float conversion with string coercion.
    pub fn to_number(&self, idx: i64) -> Option<f64> {
        arith::to_number(self, self.index_value(idx)?)
    }

    /// String contents. Numbers convert to their canonical text and the
    /// stack slot is replaced with the resulting string, matching the
    /// reference behavior of string access.
    pub fn to_lstring(&mut self, idx: i64) -> Option<Vec<u8>> {
        match self.index_value(idx)? {
            Value::Str(s) => Some(self.str_bytes(s).to_vec()),
            v if v.is_number() => {
                let text = arith::number_to_display(v).expect("checked number");
                let s = self.new_string(text.as_bytes());
                if let Some(slot) = self.index2slot(idx) {
                    self.stack_set(slot, Value::Str(s));
                }
                Some(text.into_bytes())
            }
            _ => None,
        }
    }

    /// String handle at an index, without conversion.
    pub fn to_str_ref(&self, idx: i64) -> Option<StrRef> {
        match self.index_value(idx)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Bytes of a string handle.
    pub fn string_bytes(&self, s: StrRef) -> &[u8] {
        self.str_bytes(s)
    }

    /// The host function at an index, if it is one.
    pub fn to_cfunction(&self, idx: i64) -> Option<CFunction> {
        match self.index_value(idx)? {
            Value::LightFn(f) => Some(f),
            Value::CClosure(c) => Some(self.heap.cclosures.get(c.0).func),
            _ => None,
        }
    }

    /// The thread at an index, if it is one.
    pub fn to_thread(&self, idx: i64) -> Option<ThreadRef> {
        match self.index_value(idx)? {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// A stable identity for heap values: equal exactly when the values
    /// are the same object. Inline values yield 0.
    pub fn to_pointer(&self, idx: i64) -> usize {
        match self.index_value(idx) {
            Some(Value::Str(r)) => 0x1_0000_0000 | r.0 as usize,
            Some(Value::Table(r)) => 0x2_0000_0000 | r.0 as usize,
            Some(Value::Closure(r)) => 0x3_0000_0000 | r.0 as usize,
            Some(Value::CClosure(r)) => 0x4_0000_0000 | r.0 as usize,
            Some(Value::Userdata(r)) => 0x5_0000_0000 | r.0 as usize,
            Some(Value::Thread(r)) => 0x6_0000_0000 | r.0 as usize,
            Some(Value::LightUserdata(p)) => p as usize,
            Some(Value::LightFn(f)) => f as usize,
            _ => 0,
        }
    }

    /// Raw length: string bytes, table border or array length, userdata
    /// size; 0 otherwise.
    pub fn rawlen(&self, idx: i64) -> usize {
        match self.index_value(idx) {
            Some(Value::Str(s)) => self.str_bytes(s).len(),
            Some(Value::Table(t)) => crate::object::table::raw_len(&self.heap, t) as usize,
            Some(Value::Userdata(u)) => self.heap.userdata.get(u.0).data.len(),
            _ => 0,
        }
    }

    /// Raw (metamethod-free) equality of two indices.
    pub fn raw_equal(&self, i1: i64, i2: i64) -> bool {
        match (self.index_value(i1), self.index_value(i2)) {
            (Some(a), Some(b)) => arith::raw_equal(self, a, b),
            _ => false,
        }
    }

    /// Parse a numeral and push it; false (and nothing pushed) when the
    /// bytes are not a numeral.
    pub fn string_to_number(&mut self, bytes: &[u8]) -> bool {
        match arith::str_to_number_value(bytes) {
            Some(v) => {
                self.reserve_stack_host(1);
                self.push_raw(v);
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------
    // Unprotected-boundary plumbing
    // -----------------------------------------------------------------

    /// Frame and top watermark taken before an API operation that may
    /// run user code.
    #[inline]
    pub(crate) fn watermark(&self) -> (usize, usize) {
        (self.th().frames.len(), self.top())
    }

    /// Unwind an error that escaped an unprotected API operation: drop
    /// the frames and stack the failed chain left behind, then report.
    /// The VM stays usable, unlike the reference's panic-and-abort.
    pub(crate) fn api_error(&mut self, u: Unwind, watermark: (usize, usize)) -> LumoError {
        let (frames, top) = watermark;
        self.close_upvalues(self.cur, top);
        self.th_mut().frames.truncate(frames);
        self.set_top_raw(top);
        self.api_unwind(u)
    }

    /// Convert an unwind that escaped an unprotected API entry into a
    /// host error, routing through the panic handler first.
    pub(crate) fn api_unwind(&mut self, u: Unwind) -> LumoError {
        match u {
            Unwind::Yield => LumoError::Runtime("attempt to yield across an API call".to_string()),
            Unwind::Error(status, value) => {
                self.reserve_stack_host(1);
                self.push_raw(value);
                if let Some(p) = self.panic {
                    let _ = p(self);
                }
                let text = match value {
                    Value::Str(s) => String::from_utf8_lossy(self.str_bytes(s)).into_owned(),
                    other => format!("(error object is a {} value)", other.type_name()),
                };
                self.pop(1);
                match status {
                    lumo_core::Status::ErrMem => LumoError::Memory,
                    lumo_core::Status::ErrErr => LumoError::Handler,
                    _ => LumoError::Runtime(text),
                }
            }
        }
    }
}
