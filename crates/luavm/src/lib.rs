// Lua 5.1 runtime core
// Register-based bytecode VM, incremental tri-color GC, and the shared
// value/object system. The compiler is an external collaborator: this
// crate consumes `Proto` objects (hand-assembled or loaded from a
// precompiled chunk) and executes them.

#[cfg(test)]
mod test;

pub mod aux;
pub mod gc;
pub mod lua_value;
pub mod lua_vm;
pub mod lualib;

pub use gc::{ClosureId, GcRef, ObjectPool, StringId, TableId, ThreadId, UpvalueId, UserdataId};
pub use lua_value::{Closure, LuaStr, LuaTable, LuaValue, Proto};
pub use lua_vm::{
    CFunction, Instruction, LuaError, LuaFullError, LuaResult, LuaVm, OpCode, VmOptions,
};
