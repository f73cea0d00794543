//! Binary chunk reader
//!
//! Validates the header probes and the trailing crc32, then rebuilds the
//! prototype tree, interning strings into the receiving VM. Any mismatch
//! is a syntax error; a chunk never panics the VM.

use super::dump::{
    CHECK_INT, CHECK_NUM, FORMAT, SIGNATURE, TAG_FALSE, TAG_FLOAT, TAG_INT, TAG_NIL, TAG_STR,
    TAG_TRUE, TAIL, VERSION,
};
use crate::gc::ProtoRef;
use crate::object::{Proto, UpvalDesc, Value};
use crate::state::Vm;
use crate::LumoError;
use lumo_core::{Instr, TypeCode};

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn fail<T>(&self, what: &str) -> Result<T, LumoError> {
        Err(LumoError::Syntax(format!(
            "{} (at byte {})",
            what, self.pos
        )))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LumoError> {
        if self.pos + n > self.buf.len() {
            return Err(LumoError::Syntax("truncated chunk".to_string()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, LumoError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, LumoError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, LumoError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("sized take")))
    }

    fn f64(&mut self) -> Result<f64, LumoError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().expect("sized take")))
    }

    fn bytes_with_len(&mut self) -> Result<&'a [u8], LumoError> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    fn opt_str(&mut self) -> Result<Option<&'a [u8]>, LumoError> {
        let n = self.u32()? as usize;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(self.take(n - 1)?))
        }
    }
}

fn load_proto(vm: &mut Vm, r: &mut Reader<'_>) -> Result<ProtoRef, LumoError> {
    let source = match r.opt_str()? {
        Some(b) => {
            let b = b.to_vec();
            Some(vm.new_string(&b))
        }
        None => None,
    };
    let num_params = r.u8()?;
    let is_vararg = match r.u8()? {
        0 => false,
        1 => true,
        _ => return r.fail("bad vararg flag"),
    };
    let max_stack = r.u8()?;

    let ncode = r.u32()? as usize;
    if ncode == 0 {
        return r.fail("empty code array");
    }
    let mut code = Vec::with_capacity(ncode);
    for _ in 0..ncode {
        let word = Instr(r.u32()?);
        if word.opcode().is_none() {
            return r.fail("invalid opcode");
        }
        code.push(word);
    }

    let nconsts = r.u32()? as usize;
    let mut consts = Vec::with_capacity(nconsts);
    for _ in 0..nconsts {
        let v = match r.u8()? {
            TAG_NIL => Value::Nil,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_INT => Value::Int(r.i64()?),
            TAG_FLOAT => Value::Float(r.f64()?),
            TAG_STR => {
                let b = r.bytes_with_len()?.to_vec();
                Value::Str(vm.new_string(&b))
            }
            _ => return r.fail("bad constant tag"),
        };
        consts.push(v);
    }

    let nupvals = r.u32()? as usize;
    let mut upvals = Vec::with_capacity(nupvals);
    for _ in 0..nupvals {
        let in_stack = r.u8()? != 0;
        let index = r.u8()?;
        let ty = match r.u8()? {
            0xFF => None,
            t => match TypeCode::from_operand(t as u32) {
                Some(c) => Some(c),
                None => return r.fail("bad upvalue type code"),
            },
        };
        let name = match r.opt_str()? {
            Some(b) => {
                let b = b.to_vec();
                Some(vm.new_string(&b))
            }
            None => None,
        };
        upvals.push(UpvalDesc {
            in_stack,
            index,
            ty,
            name,
        });
    }

    let nprotos = r.u32()? as usize;
    let mut protos = Vec::with_capacity(nprotos);
    for _ in 0..nprotos {
        protos.push(load_proto(vm, r)?);
    }

    let nlines = r.u32()? as usize;
    let mut line_info = Vec::with_capacity(nlines);
    for _ in 0..nlines {
        line_info.push(r.u32()?);
    }

    Ok(vm.heap.alloc_proto(Proto {
        num_params,
        is_vararg,
        max_stack,
        code,
        consts,
        upvals,
        protos,
        source,
        line_info,
        cache: None,
    }))
}

/// Parse a checksummed binary chunk into a prototype tree.
pub(crate) fn load_chunk(vm: &mut Vm, bytes: &[u8]) -> Result<ProtoRef, LumoError> {
    if bytes.len() < SIGNATURE.len() + 2 + TAIL.len() + 3 + 16 + 4 {
        return Err(LumoError::Syntax("chunk too short".to_string()));
    }
    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().expect("split of 4"));
    if crc32fast::hash(payload) != stored {
        return Err(LumoError::Syntax("checksum mismatch".to_string()));
    }

    let mut r = Reader {
        buf: payload,
        pos: 0,
    };
    if r.take(SIGNATURE.len())? != SIGNATURE {
        return Err(LumoError::Syntax("bad signature".to_string()));
    }
    if r.u8()? != VERSION {
        return Err(LumoError::Syntax("version mismatch".to_string()));
    }
    if r.u8()? != FORMAT {
        return Err(LumoError::Syntax("format mismatch".to_string()));
    }
    if r.take(TAIL.len())? != TAIL {
        return Err(LumoError::Syntax("corrupted chunk".to_string()));
    }
    if r.u8()? != 4 || r.u8()? != 8 || r.u8()? != 8 {
        return Err(LumoError::Syntax("field width mismatch".to_string()));
    }
    if r.i64()? != CHECK_INT {
        return Err(LumoError::Syntax("integer format mismatch".to_string()));
    }
    if r.f64()? != CHECK_NUM {
        return Err(LumoError::Syntax("float format mismatch".to_string()));
    }
    let p = load_proto(vm, &mut r)?;
    if r.pos != r.buf.len() {
        return Err(LumoError::Syntax("trailing garbage".to_string()));
    }
    Ok(p)
}
