// Arithmetic fallback path: the dispatch loop handles the two-numbers
// fast case inline and lands here otherwise. Operands are coerced
// through the string->number routine first; failing that, the operator
// metamethod of either operand runs; failing that, it is a type error
// naming the offending operand.

use crate::aux::str_to_number;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVm, TmKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
}

impl ArithOp {
    pub fn event(self) -> TmKind {
        match self {
            ArithOp::Add => TmKind::Add,
            ArithOp::Sub => TmKind::Sub,
            ArithOp::Mul => TmKind::Mul,
            ArithOp::Div => TmKind::Div,
            ArithOp::Mod => TmKind::Mod,
            ArithOp::Pow => TmKind::Pow,
            ArithOp::Unm => TmKind::Unm,
        }
    }

    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            // a - floor(a/b)*b, the sign follows the divisor
            ArithOp::Mod => a - (a / b).floor() * b,
            ArithOp::Pow => a.powf(b),
            ArithOp::Unm => -a,
        }
    }
}

impl LuaVm {
    /// Number view of a value for arithmetic: numbers as-is, strings
    /// through the parser.
    pub(crate) fn to_number_coerce(&self, v: &LuaValue) -> Option<f64> {
        match v {
            LuaValue::Number(n) => Some(*n),
            LuaValue::String(id) => {
                let s = self.pool.string(*id);
                str_to_number(std::str::from_utf8(s.as_bytes()).ok()?)
            }
            _ => None,
        }
    }

    pub(crate) fn arith_event(
        &mut self,
        op: ArithOp,
        a: LuaValue,
        b: LuaValue,
    ) -> LuaResult<LuaValue> {
        if let (Some(x), Some(y)) = (self.to_number_coerce(&a), self.to_number_coerce(&b)) {
            return Ok(LuaValue::Number(op.apply(x, y)));
        }
        let mut tm = self.get_tm(&a, op.event());
        if tm.is_nil() {
            tm = self.get_tm(&b, op.event());
        }
        if tm.is_nil() {
            // report whichever operand is not numeric
            let bad = if self.to_number_coerce(&a).is_none() { a } else { b };
            return Err(self.type_error(&bad, "perform arithmetic on"));
        }
        self.call_tm_res(tm, &[a, b])
    }
}
