//! Binary chunk writer
//!
//! Layout: a fixed header carrying format probes (field widths,
//! endianness check words), the recursively encoded prototype tree, and
//! a trailing crc32 of everything before it. Stripping omits source
//! names, line tables, and upvalue names.

use crate::gc::ProtoRef;
use crate::state::Vm;
use crate::object::Value;

/// Chunk signature.
pub(crate) const SIGNATURE: &[u8; 5] = b"\x1bLumo";
/// Format version.
pub(crate) const VERSION: u8 = 0x53;
/// Format number; 0 is the reference format.
pub(crate) const FORMAT: u8 = 0;
/// Corruption tripwire, as conventional for binary chunks.
pub(crate) const TAIL: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
/// Integer probe value.
pub(crate) const CHECK_INT: i64 = 0x5678;
/// Float probe value.
pub(crate) const CHECK_NUM: f64 = 370.5;

/// Constant tags in dumped pools.
pub(crate) const TAG_NIL: u8 = 0x00;
pub(crate) const TAG_FALSE: u8 = 0x01;
pub(crate) const TAG_TRUE: u8 = 0x02;
pub(crate) const TAG_INT: u8 = 0x03;
pub(crate) const TAG_FLOAT: u8 = 0x04;
pub(crate) const TAG_STR: u8 = 0x05;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes_with_len(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }
    /// Optional string: length 0 marks absence, payload lengths are
    /// stored off by one.
    fn opt_str(&mut self, b: Option<&[u8]>) {
        match b {
            None => self.u32(0),
            Some(b) => {
                self.u32(b.len() as u32 + 1);
                self.buf.extend_from_slice(b);
            }
        }
    }
}

fn dump_proto(vm: &Vm, w: &mut Writer, p: ProtoRef, strip: bool) {
    let proto = vm.heap.protos.get(p.0);
    if strip {
        w.opt_str(None);
    } else {
        w.opt_str(proto.source.map(|s| vm.str_bytes(s)));
    }
    w.u8(proto.num_params);
    w.u8(proto.is_vararg as u8);
    w.u8(proto.max_stack);

    w.u32(proto.code.len() as u32);
    for i in &proto.code {
        w.u32(i.0);
    }

    w.u32(proto.consts.len() as u32);
    for c in &proto.consts {
        match c {
            Value::Nil => w.u8(TAG_NIL),
            Value::Bool(false) => w.u8(TAG_FALSE),
            Value::Bool(true) => w.u8(TAG_TRUE),
            Value::Int(i) => {
                w.u8(TAG_INT);
                w.i64(*i);
            }
            Value::Float(f) => {
                w.u8(TAG_FLOAT);
                w.f64(*f);
            }
            Value::Str(s) => {
                w.u8(TAG_STR);
                w.bytes_with_len(vm.str_bytes(*s));
            }
            other => unreachable!("{} in a constant pool", other.type_name()),
        }
    }

    w.u32(proto.upvals.len() as u32);
    for u in &proto.upvals {
        w.u8(u.in_stack as u8);
        w.u8(u.index);
        w.u8(u.ty.map(|t| t as u8).unwrap_or(0xFF));
        if strip {
            w.opt_str(None);
        } else {
            w.opt_str(u.name.map(|n| vm.str_bytes(n)));
        }
    }

    w.u32(proto.protos.len() as u32);
    for child in proto.protos.clone() {
        dump_proto(vm, w, child, strip);
    }

    if strip {
        w.u32(0);
    } else {
        w.u32(proto.line_info.len() as u32);
        for l in &proto.line_info {
            w.u32(*l);
        }
    }
}

/// Serialize a prototype tree into a checksummed binary chunk.
pub(crate) fn dump_chunk(vm: &Vm, p: ProtoRef, strip: bool) -> Vec<u8> {
    let mut w = Writer { buf: Vec::new() };
    w.buf.extend_from_slice(SIGNATURE);
    w.u8(VERSION);
    w.u8(FORMAT);
    w.buf.extend_from_slice(TAIL);
    w.u8(4); // instruction width
    w.u8(8); // integer width
    w.u8(8); // float width
    w.i64(CHECK_INT);
    w.f64(CHECK_NUM);
    dump_proto(vm, &mut w, p, strip);
    let crc = crc32fast::hash(&w.buf);
    w.u32(crc);
    w.buf
}
