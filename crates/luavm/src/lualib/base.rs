// Base library: the language-level entry points over the do-layer and
// the table engine.

use crate::lua_value::LuaValue;
use crate::lua_vm::{CallStatus, LuaError, LuaResult, LuaVm};
use crate::lualib::{arg, arg_error, nargs, push, register};

pub fn open(vm: &mut LuaVm) {
    register(vm, "assert", base_assert);
    register(vm, "collectgarbage", base_collectgarbage);
    register(vm, "error", base_error);
    register(vm, "getmetatable", base_getmetatable);
    register(vm, "next", base_next);
    register(vm, "pcall", base_pcall);
    register(vm, "print", base_print);
    register(vm, "rawequal", base_rawequal);
    register(vm, "rawget", base_rawget);
    register(vm, "rawset", base_rawset);
    register(vm, "select", base_select);
    register(vm, "setmetatable", base_setmetatable);
    register(vm, "tonumber", base_tonumber);
    register(vm, "tostring", base_tostring);
    register(vm, "type", base_type);
    register(vm, "unpack", base_unpack);
    register(vm, "xpcall", base_xpcall);

    // pairs/ipairs close over their iterator functions
    let env = vm.globals();
    let next_fn = LuaValue::Function(vm.new_native_closure(base_next, Vec::new(), env));
    let pairs_fn = vm.new_native_closure(base_pairs, vec![next_fn], env);
    vm.set_global("pairs", LuaValue::Function(pairs_fn));
    let inext_fn = LuaValue::Function(vm.new_native_closure(ipairs_iter, Vec::new(), env));
    let ipairs_fn = vm.new_native_closure(base_ipairs, vec![inext_fn], env);
    vm.set_global("ipairs", LuaValue::Function(ipairs_fn));
}

fn base_type(vm: &mut LuaVm) -> LuaResult<usize> {
    if nargs(vm) == 0 {
        return Err(arg_error(vm, 1, "type", "value"));
    }
    let name = arg(vm, 1).type_name();
    let v = vm.new_string_value(name);
    push(vm, v)?;
    Ok(1)
}

fn base_tostring(vm: &mut LuaVm) -> LuaResult<usize> {
    let v = arg(vm, 1);
    let s = vm.tostring_value(&v)?;
    push(vm, s)?;
    Ok(1)
}

fn base_tonumber(vm: &mut LuaVm) -> LuaResult<usize> {
    let v = arg(vm, 1);
    let base_arg = arg(vm, 2);
    let result = if base_arg.is_nil() {
        match vm.to_number_coerce(&v) {
            Some(n) => LuaValue::Number(n),
            None => LuaValue::Nil,
        }
    } else {
        let radix = base_arg.as_exact_int().unwrap_or(10);
        if !(2..=36).contains(&radix) {
            return Err(arg_error(vm, 2, "tonumber", "base out of range"));
        }
        match v {
            LuaValue::String(id) => {
                let text = vm.pool.string(id).to_display().trim().to_lowercase();
                match i64::from_str_radix(&text, radix as u32) {
                    Ok(n) => LuaValue::Number(n as f64),
                    Err(_) => LuaValue::Nil,
                }
            }
            _ => return Err(arg_error(vm, 1, "tonumber", "string")),
        }
    };
    push(vm, result)?;
    Ok(1)
}

fn base_print(vm: &mut LuaVm) -> LuaResult<usize> {
    let n = nargs(vm);
    let mut line = String::new();
    for i in 1..=n {
        let v = arg(vm, i);
        let s = vm.tostring_value(&v)?;
        if i > 1 {
            line.push('\t');
        }
        line.push_str(&vm.display_value(&s));
    }
    println!("{line}");
    Ok(0)
}

fn base_assert(vm: &mut LuaVm) -> LuaResult<usize> {
    let n = nargs(vm);
    if n == 0 {
        return Err(arg_error(vm, 1, "assert", "value"));
    }
    if !arg(vm, 1).is_truthy() {
        let msg = arg(vm, 2);
        if msg.is_nil() {
            return Err(vm.error("assertion failed!"));
        }
        return Err(vm.raise_value(msg));
    }
    // assertion holds: every argument passes through
    Ok(n)
}

fn base_error(vm: &mut LuaVm) -> LuaResult<usize> {
    let v = arg(vm, 1);
    let level = arg(vm, 2).as_number().unwrap_or(1.0);
    match v {
        LuaValue::String(id) if level > 0.0 => {
            let msg = vm.pool.string(id).to_display().into_owned();
            Err(vm.error(msg))
        }
        _ => Err(vm.raise_value(v)),
    }
}

fn base_pcall(vm: &mut LuaVm) -> LuaResult<usize> {
    // this frame's index: a yield below must flag it, not the frame the
    // yield happens to suspend in
    let self_idx = vm.thr().ci_depth - 1;
    let base = vm.thr().current_ci().base;
    if nargs(vm) == 0 {
        return Err(arg_error(vm, 1, "pcall", "value"));
    }
    match vm.pcall_at(base, 0) {
        Ok((ok, nres)) => deliver_status(vm, base, ok, nres),
        Err(LuaError::Yield) => {
            let ci = &mut vm.thr_mut().ci[self_idx];
            ci.status.insert(CallStatus::YPCALL);
            ci.errfunc = 0;
            Err(LuaError::Yield)
        }
        Err(e) => Err(e),
    }
}

fn base_xpcall(vm: &mut LuaVm) -> LuaResult<usize> {
    let self_idx = vm.thr().ci_depth - 1;
    let base = vm.thr().current_ci().base;
    if nargs(vm) < 2 {
        return Err(arg_error(vm, 2, "xpcall", "value"));
    }
    // swap so the handler sits below the protected function and
    // survives the callee frame
    {
        let th = vm.thr_mut();
        th.stack.swap(base, base + 1);
        th.top = base + 2;
    }
    match vm.pcall_at(base + 1, base) {
        Ok((ok, nres)) => deliver_status(vm, base + 1, ok, nres),
        Err(LuaError::Yield) => {
            let ci = &mut vm.thr_mut().ci[self_idx];
            ci.status.insert(CallStatus::YPCALL);
            ci.errfunc = base;
            Err(LuaError::Yield)
        }
        Err(e) => Err(e),
    }
}

/// Shift `nres` results at `at` up one slot and precede them with a
/// status boolean; returns the native result count.
fn deliver_status(vm: &mut LuaVm, at: usize, ok: bool, nres: usize) -> LuaResult<usize> {
    vm.ensure_stack(at + nres + 1)?;
    let th = vm.thr_mut();
    let mut i = at + nres;
    while i > at {
        th.stack[i] = th.stack[i - 1];
        i -= 1;
    }
    th.stack[at] = LuaValue::Boolean(ok);
    th.top = at + nres + 1;
    Ok(nres + 1)
}

fn base_select(vm: &mut LuaVm) -> LuaResult<usize> {
    let n = nargs(vm);
    let sel = arg(vm, 1);
    if let LuaValue::String(id) = sel {
        if vm.pool.string(id).as_bytes() == b"#" {
            push(vm, LuaValue::Number((n - 1) as f64))?;
            return Ok(1);
        }
    }
    let Some(i) = sel.as_exact_int() else {
        return Err(arg_error(vm, 1, "select", "number"));
    };
    if i < 1 {
        return Err(arg_error(vm, 1, "select", "index out of range"));
    }
    let mut out = 0;
    for j in (i as usize + 1)..=n {
        let v = arg(vm, j);
        push(vm, v)?;
        out += 1;
    }
    Ok(out)
}

fn base_unpack(vm: &mut LuaVm) -> LuaResult<usize> {
    let LuaValue::Table(tid) = arg(vm, 1) else {
        return Err(arg_error(vm, 1, "unpack", "table"));
    };
    let i = arg(vm, 2).as_exact_int().unwrap_or(1);
    let j = match arg(vm, 3) {
        LuaValue::Nil => vm.pool.table(tid).length(&vm.pool.strings),
        v => v
            .as_exact_int()
            .ok_or_else(|| arg_error(vm, 3, "unpack", "number"))?,
    };
    let mut out = 0;
    for idx in i..=j {
        let v = vm.raw_geti(tid, idx);
        push(vm, v)?;
        out += 1;
    }
    Ok(out)
}

fn base_next(vm: &mut LuaVm) -> LuaResult<usize> {
    let LuaValue::Table(tid) = arg(vm, 1) else {
        return Err(arg_error(vm, 1, "next", "table"));
    };
    let key = arg(vm, 2);
    match vm.next_entry(tid, &key)? {
        Some((k, v)) => {
            push(vm, k)?;
            push(vm, v)?;
            Ok(2)
        }
        None => {
            push(vm, LuaValue::Nil)?;
            Ok(1)
        }
    }
}

fn base_pairs(vm: &mut LuaVm) -> LuaResult<usize> {
    let t = arg(vm, 1);
    if !matches!(t, LuaValue::Table(_)) {
        return Err(arg_error(vm, 1, "pairs", "table"));
    }
    let iter = vm.native_upvalue(0);
    push(vm, iter)?;
    push(vm, t)?;
    push(vm, LuaValue::Nil)?;
    Ok(3)
}

fn ipairs_iter(vm: &mut LuaVm) -> LuaResult<usize> {
    let LuaValue::Table(tid) = arg(vm, 1) else {
        return Err(arg_error(vm, 1, "ipairs", "table"));
    };
    let i = arg(vm, 2).as_exact_int().unwrap_or(0) + 1;
    let v = vm.raw_geti(tid, i);
    if v.is_nil() {
        push(vm, LuaValue::Nil)?;
        Ok(1)
    } else {
        push(vm, LuaValue::Number(i as f64))?;
        push(vm, v)?;
        Ok(2)
    }
}

fn base_ipairs(vm: &mut LuaVm) -> LuaResult<usize> {
    let t = arg(vm, 1);
    if !matches!(t, LuaValue::Table(_)) {
        return Err(arg_error(vm, 1, "ipairs", "table"));
    }
    let iter = vm.native_upvalue(0);
    push(vm, iter)?;
    push(vm, t)?;
    push(vm, LuaValue::Number(0.0))?;
    Ok(2 + 1)
}

fn base_rawget(vm: &mut LuaVm) -> LuaResult<usize> {
    let LuaValue::Table(tid) = arg(vm, 1) else {
        return Err(arg_error(vm, 1, "rawget", "table"));
    };
    let k = arg(vm, 2);
    let v = vm.raw_get(tid, &k);
    push(vm, v)?;
    Ok(1)
}

fn base_rawset(vm: &mut LuaVm) -> LuaResult<usize> {
    let t = arg(vm, 1);
    let LuaValue::Table(tid) = t else {
        return Err(arg_error(vm, 1, "rawset", "table"));
    };
    let k = arg(vm, 2);
    let v = arg(vm, 3);
    vm.raw_set(tid, k, v)?;
    push(vm, t)?;
    Ok(1)
}

fn base_rawequal(vm: &mut LuaVm) -> LuaResult<usize> {
    let eq = arg(vm, 1).raw_equal(&arg(vm, 2));
    push(vm, LuaValue::Boolean(eq))?;
    Ok(1)
}

fn base_setmetatable(vm: &mut LuaVm) -> LuaResult<usize> {
    let t = arg(vm, 1);
    let LuaValue::Table(_) = t else {
        return Err(arg_error(vm, 1, "setmetatable", "table"));
    };
    let mt = match arg(vm, 2) {
        LuaValue::Nil => None,
        LuaValue::Table(mid) => Some(mid),
        _ => return Err(arg_error(vm, 2, "setmetatable", "nil or table")),
    };
    // a protected metatable cannot be replaced
    if let Some(cur) = vm.get_metatable_of(&t) {
        let guard_key = vm.new_string_value("__metatable");
        if !vm.raw_get(cur, &guard_key).is_nil() {
            return Err(vm.error("cannot change a protected metatable"));
        }
    }
    vm.set_metatable_value(&t, mt);
    push(vm, t)?;
    Ok(1)
}

fn base_getmetatable(vm: &mut LuaVm) -> LuaResult<usize> {
    let v = arg(vm, 1);
    let mt = vm.protected_metatable(&v);
    push(vm, mt)?;
    Ok(1)
}

fn base_collectgarbage(vm: &mut LuaVm) -> LuaResult<usize> {
    let opt = match arg(vm, 1) {
        LuaValue::Nil => "collect".to_string(),
        LuaValue::String(id) => vm.pool.string(id).to_display().into_owned(),
        _ => return Err(arg_error(vm, 1, "collectgarbage", "string")),
    };
    let result = match opt.as_str() {
        "collect" => {
            vm.gc_collect();
            0.0
        }
        "count" => vm.gc_count_kb(),
        "stop" => {
            vm.gc_stop();
            0.0
        }
        "restart" => {
            vm.gc_restart();
            0.0
        }
        "step" => {
            vm.gc_step();
            0.0
        }
        "setpause" => {
            let p = arg(vm, 2).as_exact_int().unwrap_or(200) as i32;
            vm.gc_set_pause(p) as f64
        }
        "setstepmul" => {
            let m = arg(vm, 2).as_exact_int().unwrap_or(200) as i32;
            vm.gc_set_step_mul(m) as f64
        }
        _ => return Err(arg_error(vm, 1, "collectgarbage", "valid option")),
    };
    push(vm, LuaValue::Number(result))?;
    Ok(1)
}
