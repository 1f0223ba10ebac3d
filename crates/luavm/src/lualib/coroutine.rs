// Coroutine library over the do-layer's resume/yield.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVm, Resume, ThreadStatus};
use crate::lualib::{arg, arg_error, nargs, push};

pub fn open(vm: &mut LuaVm) {
    let co_table = vm.new_table(0, 8);
    let env = vm.globals();

    let entries: &[(&str, crate::lua_vm::CFunction)] = &[
        ("create", co_create),
        ("resume", co_resume),
        ("yield", co_yield),
        ("status", co_status),
        ("running", co_running),
        ("wrap", co_wrap),
    ];
    for &(name, f) in entries {
        let key = vm.new_string_value(name);
        let cid = vm.new_native_closure(f, Vec::new(), env);
        let _ = vm.raw_set(co_table, key, LuaValue::Function(cid));
    }
    vm.set_global("coroutine", LuaValue::Table(co_table));
}

fn check_function(vm: &mut LuaVm, i: usize, fname: &str) -> LuaResult<LuaValue> {
    let f = arg(vm, i);
    if matches!(f, LuaValue::Function(_)) {
        Ok(f)
    } else {
        Err(arg_error(vm, i, fname, "function"))
    }
}

fn co_create(vm: &mut LuaVm) -> LuaResult<usize> {
    let f = check_function(vm, 1, "create")?;
    let co = vm.coroutine_create(f);
    push(vm, LuaValue::Thread(co))?;
    Ok(1)
}

fn resume_args(vm: &LuaVm) -> Vec<LuaValue> {
    let n = nargs(vm);
    (2..=n).map(|i| arg(vm, i)).collect()
}

fn co_resume(vm: &mut LuaVm) -> LuaResult<usize> {
    let LuaValue::Thread(co) = arg(vm, 1) else {
        return Err(arg_error(vm, 1, "resume", "coroutine"));
    };
    let args = resume_args(vm);
    match vm.resume(co, &args) {
        Ok(Resume::Yield(vals)) | Ok(Resume::Return(vals)) => {
            push(vm, LuaValue::Boolean(true))?;
            let n = vals.len();
            for v in vals {
                push(vm, v)?;
            }
            Ok(1 + n)
        }
        Err(_) => {
            let err = vm.take_error_value();
            push(vm, LuaValue::Boolean(false))?;
            push(vm, err)?;
            Ok(2)
        }
    }
}

fn co_yield(vm: &mut LuaVm) -> LuaResult<usize> {
    Err(vm.do_yield())
}

fn co_status(vm: &mut LuaVm) -> LuaResult<usize> {
    let LuaValue::Thread(co) = arg(vm, 1) else {
        return Err(arg_error(vm, 1, "status", "coroutine"));
    };
    let name = match vm.coroutine_status(co) {
        ThreadStatus::Running => {
            if co == vm.current_thread() {
                "running"
            } else {
                "normal"
            }
        }
        ThreadStatus::Normal => "normal",
        ThreadStatus::Suspended => "suspended",
        ThreadStatus::Dead => "dead",
    };
    let v = vm.new_string_value(name);
    push(vm, v)?;
    Ok(1)
}

fn co_running(vm: &mut LuaVm) -> LuaResult<usize> {
    if vm.current_thread() == vm.main_thread() {
        push(vm, LuaValue::Nil)?;
    } else {
        let co = vm.current_thread();
        push(vm, LuaValue::Thread(co))?;
    }
    Ok(1)
}

fn co_wrap(vm: &mut LuaVm) -> LuaResult<usize> {
    let f = check_function(vm, 1, "wrap")?;
    let co = vm.coroutine_create(f);
    let env = vm.globals();
    let wrapper = vm.new_native_closure(wrap_call, vec![LuaValue::Thread(co)], env);
    push(vm, LuaValue::Function(wrapper))?;
    Ok(1)
}

/// Body of a wrapped coroutine: resume with the call's arguments,
/// re-raising any error in the caller.
fn wrap_call(vm: &mut LuaVm) -> LuaResult<usize> {
    let LuaValue::Thread(co) = vm.native_upvalue(0) else {
        return Err(vm.error("corrupt coroutine wrapper"));
    };
    let n = nargs(vm);
    let args: Vec<LuaValue> = (1..=n).map(|i| arg(vm, i)).collect();
    match vm.resume(co, &args) {
        Ok(Resume::Yield(vals)) | Ok(Resume::Return(vals)) => {
            let n = vals.len();
            for v in vals {
                push(vm, v)?;
            }
            Ok(n)
        }
        Err(kind) => Err(kind),
    }
}
