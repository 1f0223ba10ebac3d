// Indexing with metamethod resolution. Both loops are bounded: a chain
// of `__index`/`__newindex` tables longer than MAX_TAG_LOOP raises
// rather than spinning.

use crate::lua_value::LuaValue;
use crate::lua_vm::limits::MAX_TAG_LOOP;
use crate::lua_vm::{LuaResult, LuaVm, TmKind};

impl LuaVm {
    /// `t[key]` with metamethods.
    pub fn vm_gettable(&mut self, t: &LuaValue, key: &LuaValue) -> LuaResult<LuaValue> {
        let mut t = *t;
        for _ in 0..MAX_TAG_LOOP {
            let tm = if let LuaValue::Table(tid) = t {
                let v = self.raw_get(tid, key);
                if !v.is_nil() {
                    return Ok(v);
                }
                let tm = match self.pool.table(tid).metatable {
                    Some(mt) => self.get_tm_from_mt(mt, TmKind::Index),
                    None => LuaValue::Nil,
                };
                if tm.is_nil() {
                    return Ok(LuaValue::Nil);
                }
                tm
            } else {
                let tm = self.get_tm(&t, TmKind::Index);
                if tm.is_nil() {
                    return Err(self.type_error(&t, "index"));
                }
                tm
            };
            if matches!(tm, LuaValue::Function(_)) {
                return self.call_tm_res(tm, &[t, *key]);
            }
            t = tm; // table (or anything indexable): retry on it
        }
        Err(self.error("loop in gettable"))
    }

    /// `t[key] = val` with metamethods.
    pub fn vm_settable(&mut self, t: &LuaValue, key: &LuaValue, val: &LuaValue) -> LuaResult<()> {
        let mut t = *t;
        for _ in 0..MAX_TAG_LOOP {
            let tm = if let LuaValue::Table(tid) = t {
                let existing = self.raw_get(tid, key);
                if !existing.is_nil() {
                    // the key pre-exists: plain raw write
                    return self.raw_set(tid, *key, *val);
                }
                let tm = match self.pool.table(tid).metatable {
                    Some(mt) => self.get_tm_from_mt(mt, TmKind::NewIndex),
                    None => LuaValue::Nil,
                };
                if tm.is_nil() {
                    return self.raw_set(tid, *key, *val);
                }
                tm
            } else {
                let tm = self.get_tm(&t, TmKind::NewIndex);
                if tm.is_nil() {
                    return Err(self.type_error(&t, "index"));
                }
                tm
            };
            if matches!(tm, LuaValue::Function(_)) {
                return self.call_tm_effect(tm, &[t, *key, *val]);
            }
            t = tm;
        }
        Err(self.error("loop in settable"))
    }

    /// The `#` operator: primitive on strings and tables, `__len` for
    /// userdata.
    pub fn vm_length(&mut self, v: &LuaValue) -> LuaResult<LuaValue> {
        match v {
            LuaValue::String(id) => Ok(LuaValue::Number(self.pool.string(*id).len() as f64)),
            LuaValue::Table(tid) => {
                let n = self.pool.table(*tid).length(&self.pool.strings);
                Ok(LuaValue::Number(n as f64))
            }
            _ => {
                let tm = self.get_tm(v, TmKind::Len);
                if tm.is_nil() {
                    return Err(self.type_error(v, "get length of"));
                }
                self.call_tm_res(tm, &[*v])
            }
        }
    }
}
