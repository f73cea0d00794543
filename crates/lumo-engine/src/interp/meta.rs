//! Metamethod lookup and dispatch
//!
//! Each metatable carries an absent-bits cache for the hot metamethods:
//! a set bit guarantees the method is missing, so the common
//! no-metamethod path costs one byte read. Any store into a table clears
//! that table's bits, which over-invalidates but can never lie.

use super::arith::{self, ArithOp, RawArith};
use crate::gc::TableRef;
use crate::object::{table, Unwind, Value};
use crate::state::{Vm, CIST_LEQ};
use lumo_core::limits::MAX_META_CHAIN;
use lumo_core::TypeTag;

/// Metamethod identifiers. The first [`TM::CACHED`] entries participate
/// in the absent-bits cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TM {
    Index = 0,
    NewIndex,
    Gc,
    Len,
    Eq,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
}

impl TM {
    /// How many metamethods the absent-bits cache covers.
    pub(crate) const CACHED: u8 = 5;
}

/// Metamethod key strings, interned at state creation in `TM` order.
pub(crate) const TM_NAMES: [&str; 23] = [
    "__index",
    "__newindex",
    "__gc",
    "__len",
    "__eq",
    "__add",
    "__sub",
    "__mul",
    "__mod",
    "__pow",
    "__div",
    "__idiv",
    "__band",
    "__bor",
    "__bxor",
    "__shl",
    "__shr",
    "__unm",
    "__bnot",
    "__lt",
    "__le",
    "__concat",
    "__call",
];

impl ArithOp {
    fn tm(self) -> TM {
        match self {
            ArithOp::Add => TM::Add,
            ArithOp::Sub => TM::Sub,
            ArithOp::Mul => TM::Mul,
            ArithOp::Mod => TM::Mod,
            ArithOp::Pow => TM::Pow,
            ArithOp::Div => TM::Div,
            ArithOp::IDiv => TM::IDiv,
            ArithOp::BAnd => TM::BAnd,
            ArithOp::BOr => TM::BOr,
            ArithOp::BXor => TM::BXor,
            ArithOp::Shl => TM::Shl,
            ArithOp::Shr => TM::Shr,
            ArithOp::Unm => TM::Unm,
            ArithOp::BNot => TM::BNot,
        }
    }

    fn event_name(self) -> &'static str {
        if self.is_bitwise() {
            "perform bitwise operation on"
        } else {
            "perform arithmetic on"
        }
    }
}

impl Vm {
    /// Metatable of any value: tables and userdata carry their own,
    /// other types share a per-type default.
    pub(crate) fn metatable_of(&self, v: Value) -> Option<TableRef> {
        match v {
            Value::Table(t) => self.heap.tables.get(t.0).meta,
            Value::Userdata(u) => self.heap.userdata.get(u.0).meta,
            other => self.basic_meta[(other.type_tag() as i8 + 1) as usize - 1],
        }
    }

    /// Look up a metamethod, consulting and maintaining the absent-bits
    /// cache for the hot entries.
    pub(crate) fn get_metamethod(&mut self, v: Value, tm: TM) -> Value {
        let Some(mt) = self.metatable_of(v) else {
            return Value::Nil;
        };
        let cached = (tm as u8) < TM::CACHED;
        if cached {
            let bit = 1u8 << (tm as u8);
            if self.heap.tables.get(mt.0).absent & bit != 0 {
                return Value::Nil;
            }
        }
        let name = self.tm_names[tm as usize];
        let found = table::raw_get(&self.heap, mt, Value::Str(name));
        if found.is_nil() && cached {
            let bit = 1u8 << (tm as u8);
            self.heap.tables.get_mut(mt.0).absent |= bit;
        }
        found
    }

    /// Call a two-argument metamethod and return its single result.
    pub(crate) fn call_tm2(&mut self, f: Value, a: Value, b: Value) -> Result<Value, Unwind> {
        self.reserve_stack(4)?;
        let at = self.top();
        self.push_raw(f);
        self.push_raw(a);
        self.push_raw(b);
        self.call_value(at, 1)?;
        let r = self.stack_get(at);
        self.set_top_raw(at);
        Ok(r)
    }

    /// Call a three-argument metamethod, discarding results
    /// (`__newindex` protocol).
    pub(crate) fn call_tm3(
        &mut self,
        f: Value,
        a: Value,
        b: Value,
        c: Value,
    ) -> Result<(), Unwind> {
        self.reserve_stack(5)?;
        let at = self.top();
        self.push_raw(f);
        self.push_raw(a);
        self.push_raw(b);
        self.push_raw(c);
        self.call_value(at, 0)?;
        self.set_top_raw(at);
        Ok(())
    }

    /// Indexing with metamethod delegation: `t[k]`.
    ///
    /// The delegation chain is bounded; exceeding the bound reports a
    /// probable cycle.
    pub(crate) fn index_get(&mut self, t: Value, k: Value) -> Result<Value, Unwind> {
        let mut cur = t;
        for _ in 0..MAX_META_CHAIN {
            let handler = if let Value::Table(tr) = cur {
                let raw = table::raw_get(&self.heap, tr, k);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let h = self.get_metamethod(cur, TM::Index);
                if h.is_nil() {
                    return Ok(Value::Nil);
                }
                h
            } else {
                let h = self.get_metamethod(cur, TM::Index);
                if h.is_nil() {
                    return Err(self.type_error("index", cur));
                }
                h
            };
            if handler.is_function() {
                return self.call_tm2(handler, cur, k);
            }
            cur = handler; // a table (or indexable) to retry on
        }
        Err(self.rt_error("'__index' chain too long; possible loop".to_string()))
    }

    /// Index assignment with metamethod delegation: `t[k] = v`.
    pub(crate) fn index_set(&mut self, t: Value, k: Value, v: Value) -> Result<(), Unwind> {
        let mut cur = t;
        for _ in 0..MAX_META_CHAIN {
            let handler = if let Value::Table(tr) = cur {
                let present = !table::raw_get(&self.heap, tr, k).is_nil();
                if present {
                    return self.raw_set_or_raise(tr, k, v);
                }
                let h = self.get_metamethod(cur, TM::NewIndex);
                if h.is_nil() {
                    return self.raw_set_or_raise(tr, k, v);
                }
                h
            } else {
                let h = self.get_metamethod(cur, TM::NewIndex);
                if h.is_nil() {
                    return Err(self.type_error("index", cur));
                }
                h
            };
            if handler.is_function() {
                return self.call_tm3(handler, cur, k, v);
            }
            cur = handler;
        }
        Err(self.rt_error("'__newindex' chain too long; possible loop".to_string()))
    }

    /// Raw table store, converting table-layer failures into runtime
    /// errors.
    pub(crate) fn raw_set_or_raise(
        &mut self,
        t: TableRef,
        k: Value,
        v: Value,
    ) -> Result<(), Unwind> {
        table::raw_set(&mut self.heap, t, k, v).map_err(|e| self.rt_error(e.message()))
    }

    /// Arithmetic with metamethod fallback.
    pub(crate) fn arith_event(
        &mut self,
        op: ArithOp,
        a: Value,
        b: Value,
    ) -> Result<Value, Unwind> {
        match arith::raw_arith(self, op, a, b) {
            Some(RawArith::Ok(v)) => Ok(v),
            Some(RawArith::ZeroDivide(what)) => {
                Err(self.rt_error(format!("attempt to {}", what)))
            }
            None => {
                let tm = self.get_metamethod(a, op.tm());
                let tm = if tm.is_nil() {
                    self.get_metamethod(b, op.tm())
                } else {
                    tm
                };
                if tm.is_nil() {
                    // blame the operand that does not convert
                    let culprit = if op.is_unary() || arith::to_number(self, a).is_none() {
                        a
                    } else {
                        b
                    };
                    let msg =
                        format!("attempt to {} a {} value", op.event_name(), culprit.type_name());
                    return Err(self.rt_error(msg));
                }
                self.call_tm2(tm, a, b)
            }
        }
    }

    /// Language equality with `__eq` fallback. The metamethod only runs
    /// when both sides are the same kind (table or userdata) and raw
    /// identity already failed.
    pub(crate) fn equals_event(&mut self, a: Value, b: Value) -> Result<bool, Unwind> {
        if arith::raw_equal(self, a, b) {
            return Ok(true);
        }
        let same_kind = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
        );
        if !same_kind {
            return Ok(false);
        }
        let tm = self.get_metamethod(a, TM::Eq);
        let tm = if tm.is_nil() {
            self.get_metamethod(b, TM::Eq)
        } else {
            tm
        };
        if tm.is_nil() {
            return Ok(false);
        }
        Ok(self.call_tm2(tm, a, b)?.is_truthy())
    }

    /// `a < b` with `__lt` fallback.
    pub(crate) fn less_than(&mut self, a: Value, b: Value) -> Result<bool, Unwind> {
        if a.is_number() && b.is_number() {
            return Ok(arith::num_lt(a, b));
        }
        if let (Value::Str(x), Value::Str(y)) = (a, b) {
            return Ok(arith::str_lt(self, x, y));
        }
        let tm = self.get_metamethod(a, TM::Lt);
        let tm = if tm.is_nil() {
            self.get_metamethod(b, TM::Lt)
        } else {
            tm
        };
        if tm.is_nil() {
            return Err(self.order_error(a, b));
        }
        Ok(self.call_tm2(tm, a, b)?.is_truthy())
    }

    /// `a <= b` with `__le` fallback, then the documented `__lt`
    /// fallback: `a <= b` as `not (b < a)`. The frame is flagged while
    /// the borrowed `__lt` runs so a yield resumes with the negation
    /// intact.
    pub(crate) fn less_equal(&mut self, a: Value, b: Value) -> Result<bool, Unwind> {
        if a.is_number() && b.is_number() {
            return Ok(arith::num_le(a, b));
        }
        if let (Value::Str(x), Value::Str(y)) = (a, b) {
            return Ok(arith::str_le(self, x, y));
        }
        let tm = self.get_metamethod(a, TM::Le);
        let tm = if tm.is_nil() {
            self.get_metamethod(b, TM::Le)
        } else {
            tm
        };
        if !tm.is_nil() {
            return Ok(self.call_tm2(tm, a, b)?.is_truthy());
        }
        let lt = self.get_metamethod(b, TM::Lt);
        let lt = if lt.is_nil() {
            self.get_metamethod(a, TM::Lt)
        } else {
            lt
        };
        if lt.is_nil() {
            return Err(self.order_error(a, b));
        }
        if !self.th().frames.is_empty() {
            self.th_mut().ci_mut().status |= CIST_LEQ;
        }
        // on a yield the flag must survive so resumption still negates;
        // it is consumed either here or by the instruction finisher
        match self.call_tm2(lt, b, a) {
            Ok(v) => {
                if !self.th().frames.is_empty() {
                    self.th_mut().ci_mut().status &= !CIST_LEQ;
                }
                Ok(!v.is_truthy())
            }
            Err(u) => Err(u),
        }
    }

    fn order_error(&mut self, a: Value, b: Value) -> Unwind {
        let (ta, tb) = (a.type_name(), b.type_name());
        let msg = if ta == tb {
            format!("attempt to compare two {} values", ta)
        } else {
            format!("attempt to compare {} with {}", ta, tb)
        };
        self.rt_error(msg)
    }

    /// `#v` with `__len` fallback; tables without it use the border.
    pub(crate) fn length_event(&mut self, v: Value) -> Result<Value, Unwind> {
        if let Value::Str(s) = v {
            return Ok(Value::Int(self.str_bytes(s).len() as i64));
        }
        if let Value::Table(t) = v {
            let tm = self.get_metamethod(v, TM::Len);
            if tm.is_nil() {
                return Ok(Value::Int(table::raw_len(&self.heap, t)));
            }
            return self.call_tm2(tm, v, v);
        }
        let tm = self.get_metamethod(v, TM::Len);
        if tm.is_nil() {
            return Err(self.type_error("get length of", v));
        }
        self.call_tm2(tm, v, v)
    }

    /// Concatenate the top `total` stack values right to left, greedily
    /// coalescing runs of strings and numbers into single allocations.
    /// The single result is left where the bottom operand was.
    ///
    /// `__concat` metamethods run non-yieldable here: a concatenation is
    /// not a suspension point.
    pub(crate) fn concat_range(&mut self, total: usize) -> Result<(), Unwind> {
        debug_assert!(total >= 1);
        let mut remaining = total;
        while remaining > 1 {
            let top = self.top();
            let v1 = self.stack_get(top - 2);
            let v2 = self.stack_get(top - 1);
            if concat_coercible(v1) && concat_coercible(v2) {
                // coalesce the longest convertible run ending at v2
                let mut n = 2;
                while n < remaining && concat_coercible(self.stack_get(top - n - 1)) {
                    n += 1;
                }
                let mut parts: Vec<Vec<u8>> = Vec::with_capacity(n);
                let mut len: usize = 0;
                for i in 0..n {
                    let piece = self.value_to_bytes(self.stack_get(top - n + i));
                    len = len
                        .checked_add(piece.len())
                        .ok_or_else(|| self.rt_error("string length overflow".to_string()))?;
                    parts.push(piece);
                }
                if len > isize::MAX as usize / 2 {
                    return Err(self.rt_error("string length overflow".to_string()));
                }
                let mut bytes = Vec::with_capacity(len);
                for p in &parts {
                    bytes.extend_from_slice(p);
                }
                let s = self.new_string(&bytes);
                self.set_top_raw(top - n);
                self.push_raw(Value::Str(s));
                remaining -= n - 1;
            } else {
                let tm = self.get_metamethod(v1, TM::Concat);
                let tm = if tm.is_nil() {
                    self.get_metamethod(v2, TM::Concat)
                } else {
                    tm
                };
                if tm.is_nil() {
                    let culprit = if concat_coercible(v1) { v2 } else { v1 };
                    return Err(self.type_error("concatenate", culprit));
                }
                self.th_mut().nny += 1;
                let r = self.call_tm2(tm, v1, v2);
                self.th_mut().nny -= 1;
                let v = r?;
                self.set_top_raw(top - 2);
                self.push_raw(v);
                remaining -= 1;
            }
        }
        Ok(())
    }

    /// Bytes of a value already known concat-coercible. Empty operands
    /// contribute nothing to the final allocation.
    fn value_to_bytes(&self, v: Value) -> Vec<u8> {
        match v {
            Value::Str(s) => self.str_bytes(s).to_vec(),
            other => arith::number_to_display(other)
                .expect("caller checked coercibility")
                .into_bytes(),
        }
    }

    /// Default metatable for a basic type, used by the embedder API.
    pub(crate) fn basic_meta_slot(&self, tag: TypeTag) -> usize {
        (tag as i8 + 1) as usize - 1
    }
}

fn concat_coercible(v: Value) -> bool {
    matches!(v, Value::Str(_) | Value::Int(_) | Value::Float(_))
}
