// Equality and ordering. Numbers compare numerically, strings compare
// bytewise; anything else goes through the comparison metamethods.
// Equality between two tables or two userdata consults `__eq` only when
// both operands resolve to the *same* handler.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVm, TmKind};

impl LuaVm {
    fn str_bytes(&self, v: &LuaValue) -> Option<&[u8]> {
        match v {
            LuaValue::String(id) => Some(self.pool.string(*id).as_bytes()),
            _ => None,
        }
    }

    pub(crate) fn equal_values(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
        if a.type_tag() != b.type_tag() {
            return Ok(false);
        }
        if a.raw_equal(b) {
            return Ok(true);
        }
        // identity failed: only tables and userdata get a second chance
        let same_handler = match (a, b) {
            (LuaValue::Table(_), LuaValue::Table(_))
            | (LuaValue::Userdata(_), LuaValue::Userdata(_)) => {
                let h1 = self.get_tm(a, TmKind::Eq);
                if h1.is_nil() {
                    return Ok(false);
                }
                let h2 = self.get_tm(b, TmKind::Eq);
                if h1.raw_equal(&h2) { Some(h1) } else { None }
            }
            _ => None,
        };
        match same_handler {
            Some(h) => {
                let r = self.call_tm_res(h, &[*a, *b])?;
                Ok(r.is_truthy())
            }
            None => Ok(false),
        }
    }

    pub(crate) fn less_than(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
        if let (LuaValue::Number(x), LuaValue::Number(y)) = (a, b) {
            return Ok(x < y);
        }
        if let (Some(x), Some(y)) = (self.str_bytes(a), self.str_bytes(b)) {
            return Ok(x < y);
        }
        let mut tm = self.get_tm(a, TmKind::Lt);
        if tm.is_nil() {
            tm = self.get_tm(b, TmKind::Lt);
        }
        if tm.is_nil() {
            return Err(self.compare_error(a, b));
        }
        let r = self.call_tm_res(tm, &[*a, *b])?;
        Ok(r.is_truthy())
    }

    pub(crate) fn less_equal(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
        if let (LuaValue::Number(x), LuaValue::Number(y)) = (a, b) {
            return Ok(x <= y);
        }
        if let (Some(x), Some(y)) = (self.str_bytes(a), self.str_bytes(b)) {
            return Ok(x <= y);
        }
        let mut tm = self.get_tm(a, TmKind::Le);
        if tm.is_nil() {
            tm = self.get_tm(b, TmKind::Le);
        }
        if !tm.is_nil() {
            let r = self.call_tm_res(tm, &[*a, *b])?;
            return Ok(r.is_truthy());
        }
        // a <= b as not (b < a)
        let mut lt = self.get_tm(a, TmKind::Lt);
        if lt.is_nil() {
            lt = self.get_tm(b, TmKind::Lt);
        }
        if lt.is_nil() {
            return Err(self.compare_error(a, b));
        }
        let r = self.call_tm_res(lt, &[*b, *a])?;
        Ok(!r.is_truthy())
    }

    fn compare_error(&mut self, a: &LuaValue, b: &LuaValue) -> crate::lua_vm::LuaError {
        let (t1, t2) = (a.type_name(), b.type_name());
        if t1 == t2 {
            self.error(format!("attempt to compare two {t1} values"))
        } else {
            self.error(format!("attempt to compare {t1} with {t2}"))
        }
    }
}
