// Concatenation over a stack segment, right to left. Runs of values
// that are already strings or numbers coalesce into a single buffer
// build (one allocation for the whole run); anything else goes through
// `__concat` pairwise.

use crate::aux::number_to_str;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVm, TmKind};

impl LuaVm {
    #[inline]
    fn concatable(v: &LuaValue) -> bool {
        matches!(v, LuaValue::String(_) | LuaValue::Number(_))
    }

    /// Concatenate the `total` values ending at the current top; the
    /// result replaces them at the segment's first slot.
    pub(crate) fn vm_concat(&mut self, mut total: usize) -> LuaResult<()> {
        while total > 1 {
            let top = self.thr().top;
            let a = self.stack_get(top - 2);
            let b = self.stack_get(top - 1);

            if Self::concatable(&a) && Self::concatable(&b) {
                // walk left across the whole coalescable run
                let mut n = 2;
                while n < total && Self::concatable(&self.stack_get(top - n - 1)) {
                    n += 1;
                }
                let mut buf = std::mem::take(&mut self.buffer);
                buf.clear();
                for i in 0..n {
                    let v = self.stack_get(top - n + i);
                    match v {
                        LuaValue::String(id) => buf.push_bytes(self.pool.string(id).as_bytes()),
                        LuaValue::Number(x) => buf.push_bytes(number_to_str(x).as_bytes()),
                        _ => unreachable!(),
                    }
                }
                let joined = self.new_bytes_value(buf.as_bytes());
                self.buffer = buf;
                self.stack_set(top - n, joined);
                self.thr_mut().top = top - n + 1;
                total -= n - 1;
            } else {
                // metamethod on either operand, mirroring arithmetic
                let mut tm = self.get_tm(&a, TmKind::Concat);
                if tm.is_nil() {
                    tm = self.get_tm(&b, TmKind::Concat);
                }
                if tm.is_nil() {
                    let bad = if Self::concatable(&a) { b } else { a };
                    return Err(self.type_error(&bad, "concatenate"));
                }
                let r = self.call_tm_res(tm, &[a, b])?;
                self.stack_set(top - 2, r);
                self.thr_mut().top = top - 1;
                total -= 1;
            }
        }
        Ok(())
    }
}
