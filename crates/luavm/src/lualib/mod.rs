// Libraries implemented against the host API. Only the two the core
// cannot be exercised without: the base functions and coroutines.

mod base;
mod coroutine;

use crate::lua_value::LuaValue;
use crate::lua_vm::{CFunction, LuaResult, LuaVm};

/// Install the base functions and the coroutine table into the globals.
pub fn open_libs(vm: &mut LuaVm) {
    base::open(vm);
    coroutine::open(vm);
}

pub(crate) fn register(vm: &mut LuaVm, name: &str, f: CFunction) {
    let env = vm.globals();
    let cid = vm.new_native_closure(f, Vec::new(), env);
    vm.set_global(name, LuaValue::Function(cid));
}

/// Number of arguments the running native function received.
pub(crate) fn nargs(vm: &LuaVm) -> usize {
    let base = vm.thr().current_ci().base;
    vm.thr().top - base
}

/// 1-based argument access, nil when missing.
pub(crate) fn arg(vm: &LuaVm, i: usize) -> LuaValue {
    let base = vm.thr().current_ci().base;
    if i >= 1 && base + i - 1 < vm.thr().top {
        vm.thr().stack[base + i - 1]
    } else {
        LuaValue::Nil
    }
}

pub(crate) fn arg_error(vm: &mut LuaVm, i: usize, fname: &str, expected: &str) -> crate::LuaError {
    let got = arg(vm, i).type_name();
    vm.error(format!(
        "bad argument #{i} to '{fname}' ({expected} expected, got {got})"
    ))
}

/// Push one result, growing the stack as needed.
pub(crate) fn push(vm: &mut LuaVm, v: LuaValue) -> LuaResult<()> {
    vm.api_push(v)
}
