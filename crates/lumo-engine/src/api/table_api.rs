//! Table, metatable, and userdata operations of the embedder API

use crate::gc::GcId;
use crate::object::{table, Table, TableKind, Unwind, Userdata, Value};
use crate::state::Vm;
use crate::LumoError;
use lumo_core::limits::RIDX_GLOBALS;
use lumo_core::TypeTag;

impl Vm {
    fn table_at(&self, idx: i64) -> crate::gc::TableRef {
        match self.index_value(idx) {
            Some(Value::Table(t)) => t,
            other => panic!(
                "expected a table at index {}, found {}",
                idx,
                other.map(|v| v.type_name()).unwrap_or("no value")
            ),
        }
    }

    /// Push a fresh generic table with size hints.
    pub fn create_table(&mut self, narray: usize, nrec: usize) {
        self.check_gc();
        let t = self.heap.alloc_table(Table::new(narray, nrec));
        self.reserve_stack_host(1);
        self.push_raw(Value::Table(t));
    }

    /// Push a fresh empty table.
    pub fn new_table(&mut self) {
        self.create_table(0, 0);
    }

    /// Push a fresh integer array of `n` elements, all `init`.
    pub fn create_integer_array(&mut self, n: usize, init: i64) {
        self.check_gc();
        let t = self.heap.alloc_table(Table::new_int_array(n, init));
        self.reserve_stack_host(1);
        self.push_raw(Value::Table(t));
    }

    /// Push a fresh float array of `n` elements, all `init`.
    pub fn create_number_array(&mut self, n: usize, init: f64) {
        self.check_gc();
        let t = self.heap.alloc_table(Table::new_float_array(n, init));
        self.reserve_stack_host(1);
        self.push_raw(Value::Table(t));
    }

    /// Push a slice of the typed array at `parent_idx` covering
    /// `start..start+len` (1-based, inclusive start). The slice anchors
    /// its parent for its whole lifetime.
    pub fn create_slice(
        &mut self,
        parent_idx: i64,
        start: usize,
        len: usize,
    ) -> Result<(), LumoError> {
        let parent = self.table_at(parent_idx);
        let (float, parent_len) = {
            let t = self.heap.tables.get(parent.0);
            match &t.kind {
                TableKind::IntArray(v) => (false, v.len()),
                TableKind::FloatArray(v) => (true, v.len()),
                _ => {
                    return Err(LumoError::Runtime(
                        "slice parent must be a typed array".to_string(),
                    ))
                }
            }
        };
        if start < 1 || len == 0 || start + len - 1 > parent_len {
            return Err(LumoError::Runtime(format!(
                "slice [{}, {}] outside array of length {}",
                start,
                start + len - 1,
                parent_len
            )));
        }
        self.check_gc();
        let t = self.heap.alloc_table(Table {
            kind: TableKind::Slice {
                parent,
                start: start - 1,
                len,
                float,
            },
            meta: None,
            absent: 0,
            finalized: false,
        });
        self.reserve_stack_host(1);
        self.push_raw(Value::Table(t));
        Ok(())
    }

    /// Window metadata of a slice: parent is pushed, `(start, len)`
    /// returned. 1-based start.
    pub fn slice_info(&mut self, idx: i64) -> Option<(usize, usize)> {
        let t = self.table_at(idx);
        match self.heap.tables.get(t.0).kind {
            TableKind::Slice {
                parent, start, len, ..
            } => {
                self.reserve_stack_host(1);
                self.push_raw(Value::Table(parent));
                Some((start + 1, len))
            }
            _ => None,
        }
    }

    // -----------------------------------------------------------------
    // Metamethod-aware access
    // -----------------------------------------------------------------

    /// `t[k]` where `t` is at `idx` and `k` is the popped top; the
    /// result is pushed. May run `__index`.
    pub fn get_table(&mut self, idx: i64) -> Result<TypeTag, LumoError> {
        let t = self.index_value(idx).unwrap_or(Value::Nil);
        let k = self.pop_raw();
        let wm = self.watermark();
        let r = self.index_get(t, k);
        self.finish_get(r, wm)
    }

    /// `t[name]`, pushing the result.
    pub fn get_field(&mut self, idx: i64, name: &str) -> Result<TypeTag, LumoError> {
        let t = self.index_value(idx).unwrap_or(Value::Nil);
        let k = Value::Str(self.new_string(name.as_bytes()));
        let wm = self.watermark();
        let r = self.index_get(t, k);
        self.finish_get(r, wm)
    }

    /// `t[i]`, pushing the result; typed arrays answer directly.
    pub fn get_i(&mut self, idx: i64, i: i64) -> Result<TypeTag, LumoError> {
        let t = self.index_value(idx).unwrap_or(Value::Nil);
        if let Value::Table(tr) = t {
            let tb = self.heap.tables.get(tr.0);
            if tb.is_typed_array() && tb.meta.is_none() {
                let v = table::raw_geti(&self.heap, tr, i);
                self.reserve_stack_host(1);
                self.push_raw(v);
                return Ok(v.type_tag());
            }
        }
        let wm = self.watermark();
        let r = self.index_get(t, Value::Int(i));
        self.finish_get(r, wm)
    }

    fn finish_get(
        &mut self,
        r: Result<Value, Unwind>,
        wm: (usize, usize),
    ) -> Result<TypeTag, LumoError> {
        match r {
            Ok(v) => {
                self.reserve_stack_host(1);
                self.push_raw(v);
                Ok(v.type_tag())
            }
            Err(u) => Err(self.api_error(u, wm)),
        }
    }

    /// `t[k] = v` with the key and value popped from the top. May run
    /// `__newindex`.
    pub fn set_table(&mut self, idx: i64) -> Result<(), LumoError> {
        let t = self.index_value(idx).unwrap_or(Value::Nil);
        let v = self.pop_raw();
        let k = self.pop_raw();
        let wm = self.watermark();
        self.index_set(t, k, v).map_err(|u| self.api_error(u, wm))
    }

    /// `t[name] = v` with the value popped.
    pub fn set_field(&mut self, idx: i64, name: &str) -> Result<(), LumoError> {
        let t = self.index_value(idx).unwrap_or(Value::Nil);
        let v = self.pop_raw();
        let k = Value::Str(self.new_string(name.as_bytes()));
        let wm = self.watermark();
        self.index_set(t, k, v).map_err(|u| self.api_error(u, wm))
    }

    /// `t[i] = v` with the value popped; typed arrays answer directly.
    pub fn set_i(&mut self, idx: i64, i: i64) -> Result<(), LumoError> {
        let t = self.index_value(idx).unwrap_or(Value::Nil);
        let v = self.pop_raw();
        if let Value::Table(tr) = t {
            let tb = self.heap.tables.get(tr.0);
            if tb.is_typed_array() && tb.meta.is_none() {
                return table::raw_seti(&mut self.heap, tr, i, v)
                    .map_err(|e| LumoError::Runtime(e.message()));
            }
        }
        let wm = self.watermark();
        self.index_set(t, Value::Int(i), v)
            .map_err(|u| self.api_error(u, wm))
    }

    /// Push the global `name`.
    pub fn get_global(&mut self, name: &str) -> Result<TypeTag, LumoError> {
        let g = table::raw_geti(&self.heap, self.registry, RIDX_GLOBALS);
        let k = Value::Str(self.new_string(name.as_bytes()));
        let wm = self.watermark();
        let r = self.index_get(g, k);
        self.finish_get(r, wm)
    }

    /// Pop the top into the global `name`.
    pub fn set_global(&mut self, name: &str) -> Result<(), LumoError> {
        let g = table::raw_geti(&self.heap, self.registry, RIDX_GLOBALS);
        let v = self.pop_raw();
        let k = Value::Str(self.new_string(name.as_bytes()));
        let wm = self.watermark();
        self.index_set(g, k, v).map_err(|u| self.api_error(u, wm))
    }

    /// Push the globals table itself.
    pub fn push_globals_table(&mut self) {
        let g = table::raw_geti(&self.heap, self.registry, RIDX_GLOBALS);
        self.reserve_stack_host(1);
        self.push_raw(g);
    }

    // -----------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------

    /// Raw `t[k]` with the key popped; result pushed.
    pub fn raw_get(&mut self, idx: i64) -> TypeTag {
        let t = self.table_at(idx);
        let k = self.pop_raw();
        let v = table::raw_get(&self.heap, t, k);
        self.reserve_stack_host(1);
        self.push_raw(v);
        v.type_tag()
    }

    /// Raw `t[i]`; result pushed.
    pub fn raw_geti(&mut self, idx: i64, i: i64) -> TypeTag {
        let t = self.table_at(idx);
        let v = table::raw_geti(&self.heap, t, i);
        self.reserve_stack_host(1);
        self.push_raw(v);
        v.type_tag()
    }

    /// Raw `t[p]` keyed by a light-userdata pointer; result pushed.
    pub fn raw_getp(&mut self, idx: i64, p: *mut std::ffi::c_void) -> TypeTag {
        let t = self.table_at(idx);
        let v = table::raw_get(&self.heap, t, Value::LightUserdata(p));
        self.reserve_stack_host(1);
        self.push_raw(v);
        v.type_tag()
    }

    /// Raw `t[k] = v` with key and value popped.
    pub fn raw_set(&mut self, idx: i64) -> Result<(), LumoError> {
        let t = self.table_at(idx);
        let v = self.pop_raw();
        let k = self.pop_raw();
        table::raw_set(&mut self.heap, t, k, v).map_err(|e| LumoError::Runtime(e.message()))
    }

    /// Raw `t[i] = v` with the value popped.
    pub fn raw_seti(&mut self, idx: i64, i: i64) -> Result<(), LumoError> {
        let t = self.table_at(idx);
        let v = self.pop_raw();
        table::raw_seti(&mut self.heap, t, i, v).map_err(|e| LumoError::Runtime(e.message()))
    }

    /// Raw `t[p] = v` keyed by a light-userdata pointer.
    pub fn raw_setp(&mut self, idx: i64, p: *mut std::ffi::c_void) -> Result<(), LumoError> {
        let t = self.table_at(idx);
        let v = self.pop_raw();
        table::raw_set(&mut self.heap, t, Value::LightUserdata(p), v)
            .map_err(|e| LumoError::Runtime(e.message()))
    }

    /// Typed fast path: element of an integer array.
    pub fn int_array_get(&self, idx: i64, i: i64) -> Option<i64> {
        let t = self.table_at(idx);
        match table::raw_geti(&self.heap, t, i) {
            Value::Int(v) if self.heap.tables.get(t.0).is_int_array() => Some(v),
            _ => None,
        }
    }

    /// Typed fast path: store into an integer array.
    pub fn int_array_set(&mut self, idx: i64, i: i64, v: i64) -> Result<(), LumoError> {
        let t = self.table_at(idx);
        table::raw_seti(&mut self.heap, t, i, Value::Int(v))
            .map_err(|e| LumoError::Runtime(e.message()))
    }

    /// Typed fast path: element of a float array.
    pub fn number_array_get(&self, idx: i64, i: i64) -> Option<f64> {
        let t = self.table_at(idx);
        match table::raw_geti(&self.heap, t, i) {
            Value::Float(v) if self.heap.tables.get(t.0).is_float_array() => Some(v),
            _ => None,
        }
    }

    /// Typed fast path: store into a float array.
    pub fn number_array_set(&mut self, idx: i64, i: i64, v: f64) -> Result<(), LumoError> {
        let t = self.table_at(idx);
        table::raw_seti(&mut self.heap, t, i, Value::Float(v))
            .map_err(|e| LumoError::Runtime(e.message()))
    }

    // -----------------------------------------------------------------
    // Metatables and userdata
    // -----------------------------------------------------------------

    /// Push the metatable of the value at `idx`; false (nothing pushed)
    /// when it has none.
    pub fn get_metatable(&mut self, idx: i64) -> bool {
        let v = self.index_value(idx).unwrap_or(Value::Nil);
        match self.metatable_of(v) {
            Some(m) => {
                self.reserve_stack_host(1);
                self.push_raw(Value::Table(m));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and install it as the metatable of the value
    /// at `idx`. Non-table, non-userdata values share one metatable per
    /// type.
    pub fn set_metatable(&mut self, idx: i64) {
        let v = self.index_value(idx).expect("invalid index");
        let m = match self.pop_raw() {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            other => panic!("metatable must be a table, found {}", other.type_name()),
        };
        match v {
            Value::Table(t) => {
                let tb = self.heap.tables.get_mut(t.0);
                tb.meta = m;
                tb.invalidate_tm_cache();
                if let Some(m) = m {
                    self.heap.barrier(GcId::Table(t), GcId::Table(m));
                }
            }
            Value::Userdata(u) => {
                self.heap.userdata.get_mut(u.0).meta = m;
                if let Some(m) = m {
                    self.heap.barrier(GcId::Userdata(u), GcId::Table(m));
                }
            }
            other => {
                let slot = self.basic_meta_slot(other.type_tag());
                self.basic_meta[slot] = m;
            }
        }
    }

    /// Allocate a zeroed userdata blob and push it.
    pub fn new_userdata(&mut self, size: usize) {
        self.check_gc();
        let u = self.heap.alloc_userdata(Userdata::new(size));
        self.reserve_stack_host(1);
        self.push_raw(Value::Userdata(u));
    }

    /// Bytes of the userdata at `idx`.
    pub fn userdata_bytes(&self, idx: i64) -> Option<&[u8]> {
        match self.index_value(idx)? {
            Value::Userdata(u) => Some(&self.heap.userdata.get(u.0).data),
            _ => None,
        }
    }

    /// Mutable bytes of the userdata at `idx`.
    pub fn userdata_bytes_mut(&mut self, idx: i64) -> Option<&mut [u8]> {
        match self.index_value(idx)? {
            Value::Userdata(u) => Some(&mut self.heap.userdata.get_mut(u.0).data),
            _ => None,
        }
    }

    /// Push the user value associated with the userdata at `idx`.
    pub fn get_uservalue(&mut self, idx: i64) -> TypeTag {
        let v = match self.index_value(idx) {
            Some(Value::Userdata(u)) => self.heap.userdata.get(u.0).user_value,
            _ => panic!("get_uservalue on a non-userdata"),
        };
        self.reserve_stack_host(1);
        self.push_raw(v);
        v.type_tag()
    }

    /// Pop the top into the user value of the userdata at `idx`.
    pub fn set_uservalue(&mut self, idx: i64) {
        let v = self.pop_raw();
        match self.index_value(idx) {
            Some(Value::Userdata(u)) => {
                self.heap.userdata.get_mut(u.0).user_value = v;
                self.heap.barrier_value(GcId::Userdata(u), v);
            }
            _ => panic!("set_uservalue on a non-userdata"),
        }
    }
}
