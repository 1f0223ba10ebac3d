// Integration suite. The compiler lives outside this crate, so these
// tests hand-assemble protos through the builder in `asm` and drive
// them end to end through the executor.

mod asm;
mod test_coroutine;
mod test_dump;
mod test_gc;
mod test_metamethods;

use crate::lua_vm::{LuaVm, VmOptions};
use crate::lualib;

/// Fresh state with the base and coroutine libraries installed.
pub fn new_vm() -> LuaVm {
    let mut vm = LuaVm::new(VmOptions::default());
    lualib::open_libs(&mut vm);
    vm
}
