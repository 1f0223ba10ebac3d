// Function objects: the immutable compiled template (`Proto`) and the
// runtime binding of one (`Closure`). Protos are produced outside this
// crate (compiler or chunk loader) and shared by every closure
// instantiated from them.

use std::rc::Rc;

use smol_str::SmolStr;

use crate::gc::{TableId, ThreadId, UpvalueId};
use crate::lua_value::LuaValue;
use crate::lua_vm::CFunction;

/// Captured cell. OPEN while the owning stack slot is alive (the value
/// lives on that thread's stack), CLOSED afterwards (the value moved
/// inline, independent of any stack).
pub enum Upvalue {
    Open { thread: ThreadId, index: usize },
    Closed(LuaValue),
}

impl Upvalue {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open { .. })
    }

    #[inline]
    pub fn open_slot(&self) -> Option<(ThreadId, usize)> {
        match self {
            Upvalue::Open { thread, index } => Some((*thread, *index)),
            Upvalue::Closed(_) => None,
        }
    }

    #[inline]
    pub fn closed_value(&self) -> Option<LuaValue> {
        match self {
            Upvalue::Closed(v) => Some(*v),
            Upvalue::Open { .. } => None,
        }
    }
}

/// Upvalue binding directive for CLOSURE: capture an enclosing local
/// (`in_stack`) or share one of the enclosing closure's upvalues.
#[derive(Debug, Clone, Copy)]
pub struct UpvalDesc {
    pub in_stack: bool,
    pub index: u8,
}

/// Debug record for one local variable's live range.
#[derive(Debug, Clone)]
pub struct LocVar {
    pub name: SmolStr,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Immutable compiler output for one function.
#[derive(Debug, Clone)]
pub struct Proto {
    pub code: Vec<u32>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub nups: u8,
    pub source: SmolStr,
    pub line_defined: u32,
    pub last_line_defined: u32,
    /// Source line for each instruction; may be stripped.
    pub line_info: Vec<u32>,
    pub loc_vars: Vec<LocVar>,
    pub upvalue_names: Vec<SmolStr>,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2,
            nups: 0,
            source: SmolStr::new_static("?"),
            line_defined: 0,
            last_line_defined: 0,
            line_info: Vec::new(),
            loc_vars: Vec::new(),
            upvalue_names: Vec::new(),
        }
    }

    /// Source line of an instruction, 0 when debug info was stripped.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }
}

impl Default for Proto {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvals: Vec<UpvalueId>,
    pub env: TableId,
}

pub struct NativeClosure {
    pub f: CFunction,
    pub upvals: Vec<LuaValue>,
    pub env: TableId,
}

/// Runtime function object: a Lua closure binding a proto, or a native
/// function with inline upvalues. Both carry an environment table.
pub enum Closure {
    Lua(LuaClosure),
    Native(NativeClosure),
}

impl Closure {
    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        matches!(self, Closure::Lua(_))
    }

    #[inline(always)]
    pub fn as_lua(&self) -> Option<&LuaClosure> {
        match self {
            Closure::Lua(c) => Some(c),
            Closure::Native(_) => None,
        }
    }

    #[inline(always)]
    pub fn as_native(&self) -> Option<&NativeClosure> {
        match self {
            Closure::Native(c) => Some(c),
            Closure::Lua(_) => None,
        }
    }

    #[inline(always)]
    pub fn env(&self) -> TableId {
        match self {
            Closure::Lua(c) => c.env,
            Closure::Native(c) => c.env,
        }
    }

    pub fn set_env(&mut self, env: TableId) {
        match self {
            Closure::Lua(c) => c.env = env,
            Closure::Native(c) => c.env = env,
        }
    }
}
