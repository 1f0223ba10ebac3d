// Minimal proto assembler for tests.

use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::{LuaValue, Proto};
use crate::lua_vm::{Instruction, OpCode};

pub struct ProtoBuilder {
    p: Proto,
}

impl ProtoBuilder {
    pub fn new(num_params: u8, max_stack: u8) -> Self {
        let mut p = Proto::new();
        p.num_params = num_params;
        p.max_stack_size = max_stack;
        p.source = SmolStr::new_static("=test");
        ProtoBuilder { p }
    }

    pub fn vararg(mut self) -> Self {
        self.p.is_vararg = true;
        self
    }

    pub fn nups(mut self, n: u8) -> Self {
        self.p.nups = n;
        self
    }

    /// Add a constant, returning its pool index.
    pub fn k(&mut self, v: LuaValue) -> u32 {
        self.p.constants.push(v);
        (self.p.constants.len() - 1) as u32
    }

    pub fn knum(&mut self, n: f64) -> u32 {
        self.k(LuaValue::Number(n))
    }

    /// Add a nested proto, returning its index for CLOSURE.
    pub fn child(&mut self, child: Rc<Proto>) -> u32 {
        self.p.protos.push(child);
        (self.p.protos.len() - 1) as u32
    }

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> &mut Self {
        self.p.code.push(Instruction::abc(op, a, b, c).0);
        self
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> &mut Self {
        self.p.code.push(Instruction::abx(op, a, bx).0);
        self
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> &mut Self {
        self.p.code.push(Instruction::asbx(op, a, sbx).0);
        self
    }

    /// Raw word (SETLIST overflow blocks).
    pub fn word(&mut self, w: u32) -> &mut Self {
        self.p.code.push(w);
        self
    }

    pub fn build(self) -> Rc<Proto> {
        Rc::new(self.p)
    }
}
