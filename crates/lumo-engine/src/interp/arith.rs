//! Numeric coercions and raw operator semantics
//!
//! "Raw" here means metamethod-free: these helpers either produce a value
//! or report that the operands are out of their domain, and the caller
//! falls back to metamethod dispatch.

use crate::object::Value;
use crate::state::Vm;
use lumo_core::num::{self, Numeral};

/// Arithmetic and bitwise operators, shared by the interpreter and the
/// embedder's `arith` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// binary `-`
    Sub,
    /// `*`
    Mul,
    /// `%` (floor modulus)
    Mod,
    /// `^` (always float)
    Pow,
    /// `/` (always float)
    Div,
    /// `//` (floor division)
    IDiv,
    /// `&`
    BAnd,
    /// `|`
    BOr,
    /// `~` binary
    BXor,
    /// `<<`
    Shl,
    /// `>>` (logical)
    Shr,
    /// unary `-`
    Unm,
    /// unary `~`
    BNot,
}

impl ArithOp {
    /// Does this operator work on integers only?
    pub(crate) fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot
        )
    }

    /// Is this a unary operator?
    pub(crate) fn is_unary(self) -> bool {
        matches!(self, ArithOp::Unm | ArithOp::BNot)
    }
}

/// Convert to a float: numbers directly, numeral strings by parsing.
pub(crate) fn to_number(vm: &Vm, v: Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(i as f64),
        Value::Float(f) => Some(f),
        Value::Str(s) => match num::str_to_numeral(vm.str_bytes(s))? {
            Numeral::Int(i) => Some(i as f64),
            Numeral::Float(f) => Some(f),
        },
        _ => None,
    }
}

/// Convert to an integer: exact floats and exactly-integral numeral
/// strings qualify; everything else fails.
pub(crate) fn to_integer(vm: &Vm, v: Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i),
        Value::Float(f) => num::float_to_int(f),
        Value::Str(s) => match num::str_to_numeral(vm.str_bytes(s))? {
            Numeral::Int(i) => Some(i),
            Numeral::Float(f) => num::float_to_int(f),
        },
        _ => None,
    }
}

/// Numeral-string conversion preserving the integer/float distinction,
/// used by the embedder's `stringtonumber`.
pub(crate) fn str_to_number_value(bytes: &[u8]) -> Option<Value> {
    match num::str_to_numeral(bytes)? {
        Numeral::Int(i) => Some(Value::Int(i)),
        Numeral::Float(f) => Some(Value::Float(f)),
    }
}

/// Canonical text of a number.
pub(crate) fn number_to_display(v: Value) -> Option<String> {
    match v {
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(num::float_to_display(f)),
        _ => None,
    }
}

/// Raw arithmetic following the dispatch policy: integer op integer stays
/// integer (wrapping), everything else converts to float; bitwise wants
/// exact integers; `/` and `^` are always float. `None` means "consult
/// the metamethod".
pub(crate) fn raw_arith(vm: &Vm, op: ArithOp, a: Value, b: Value) -> Option<RawArith> {
    if op.is_bitwise() {
        let x = to_integer(vm, a)?;
        if op == ArithOp::BNot {
            return Some(RawArith::Ok(Value::Int(!x)));
        }
        let y = to_integer(vm, b)?;
        let r = match op {
            ArithOp::BAnd => x & y,
            ArithOp::BOr => x | y,
            ArithOp::BXor => x ^ y,
            ArithOp::Shl => num::int_shl(x, y),
            ArithOp::Shr => num::int_shr(x, y),
            _ => unreachable!(),
        };
        return Some(RawArith::Ok(Value::Int(r)));
    }
    if op == ArithOp::Unm {
        return match a {
            Value::Int(i) => Some(RawArith::Ok(Value::Int(i.wrapping_neg()))),
            Value::Float(f) => Some(RawArith::Ok(Value::Float(-f))),
            _ => to_number(vm, a).map(|f| RawArith::Ok(Value::Float(-f))),
        };
    }
    // integer pairs stay integers except for / and ^
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        match op {
            ArithOp::Add => return Some(RawArith::Ok(Value::Int(x.wrapping_add(y)))),
            ArithOp::Sub => return Some(RawArith::Ok(Value::Int(x.wrapping_sub(y)))),
            ArithOp::Mul => return Some(RawArith::Ok(Value::Int(x.wrapping_mul(y)))),
            ArithOp::Mod => {
                if y == 0 {
                    return Some(RawArith::ZeroDivide("perform 'n%0'"));
                }
                return Some(RawArith::Ok(Value::Int(num::int_floor_mod(x, y))));
            }
            ArithOp::IDiv => {
                if y == 0 {
                    return Some(RawArith::ZeroDivide("perform 'n//0'"));
                }
                return Some(RawArith::Ok(Value::Int(num::int_floor_div(x, y))));
            }
            ArithOp::Div | ArithOp::Pow => {} // fall through to float
            _ => unreachable!(),
        }
    }
    let x = to_number(vm, a)?;
    let y = to_number(vm, b)?;
    let r = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Mod => num::float_floor_mod(x, y),
        ArithOp::Pow => x.powf(y),
        ArithOp::Div => x / y,
        ArithOp::IDiv => num::float_floor_div(x, y),
        _ => unreachable!(),
    };
    Some(RawArith::Ok(Value::Float(r)))
}

/// Outcome of a raw arithmetic attempt.
pub(crate) enum RawArith {
    /// Computed
    Ok(Value),
    /// Integer division or modulus by zero; the message names the op
    ZeroDivide(&'static str),
}

/// Language equality without metamethods: numbers compare across the
/// int/float divide, strings by content, everything else by identity.
pub(crate) fn raw_equal(vm: &Vm, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) => num::int_eq_float(x, y),
        (Value::Float(x), Value::Int(y)) => num::int_eq_float(y, x),
        (Value::Str(x), Value::Str(y)) => {
            if x == y {
                true
            } else {
                let sx = vm.heap.strings.get(x.0);
                let sy = vm.heap.strings.get(y.0);
                !sx.short && !sy.short && sx.hash == sy.hash && sx.bytes == sy.bytes
            }
        }
        _ => a == b,
    }
}

/// `a < b` for two numbers, exact across representations.
pub(crate) fn num_lt(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x < y,
        (Value::Float(x), Value::Float(y)) => x < y,
        (Value::Int(x), Value::Float(y)) => num::int_lt_float(x, y),
        (Value::Float(x), Value::Int(y)) => num::float_lt_int(x, y),
        _ => unreachable!("num_lt wants numbers"),
    }
}

/// `a <= b` for two numbers, exact across representations.
pub(crate) fn num_le(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x <= y,
        (Value::Float(x), Value::Float(y)) => x <= y,
        (Value::Int(x), Value::Float(y)) => num::int_le_float(x, y),
        (Value::Float(x), Value::Int(y)) => num::float_le_int(x, y),
        _ => unreachable!("num_le wants numbers"),
    }
}

/// Byte-wise string ordering; embedded NULs are ordinary bytes.
pub(crate) fn str_lt(vm: &Vm, a: crate::gc::StrRef, b: crate::gc::StrRef) -> bool {
    vm.heap.strings.get(a.0).bytes < vm.heap.strings.get(b.0).bytes
}

/// Byte-wise `<=`.
pub(crate) fn str_le(vm: &Vm, a: crate::gc::StrRef, b: crate::gc::StrRef) -> bool {
    vm.heap.strings.get(a.0).bytes <= vm.heap.strings.get(b.0).bytes
}
