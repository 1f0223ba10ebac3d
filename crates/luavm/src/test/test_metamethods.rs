// Metamethod dispatch: operators, index chains, call rewriting,
// equality handlers, loop bounds.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVm, OpCode, rk_as_k};
use crate::test::asm::ProtoBuilder;
use crate::test::new_vm;

fn num(n: f64) -> LuaValue {
    LuaValue::Number(n)
}

#[test]
fn add_metamethod_on_tables() {
    // mt.__add builds {x = a.x + b.x}; return (p + q).x
    let mut vm = new_vm();

    let mut add = ProtoBuilder::new(2, 6);
    let kx = add.k(vm.new_string_value("x"));
    add.abc(OpCode::NewTable, 2, 0, 1);
    add.abc(OpCode::GetTable, 3, 0, rk_as_k(kx));
    add.abc(OpCode::GetTable, 4, 1, rk_as_k(kx));
    add.abc(OpCode::Add, 3, 3, 4);
    add.abc(OpCode::SetTable, 2, rk_as_k(kx), 3);
    add.abc(OpCode::Return, 2, 2, 0);
    let add_fn = vm.proto_closure(add.build());

    let mt = vm.new_table(0, 1);
    let add_key = vm.new_string_value("__add");
    vm.raw_set(mt, add_key, add_fn).unwrap();

    let x_key = vm.new_string_value("x");
    let p = vm.new_table(0, 1);
    vm.raw_set(p, x_key, num(3.0)).unwrap();
    vm.set_metatable_value(&LuaValue::Table(p), Some(mt));
    let q = vm.new_table(0, 1);
    vm.raw_set(q, x_key, num(4.0)).unwrap();
    vm.set_metatable_value(&LuaValue::Table(q), Some(mt));

    let mut main = ProtoBuilder::new(2, 4);
    let kx = main.k(x_key);
    main.abc(OpCode::Add, 2, 0, 1);
    main.abc(OpCode::GetTable, 2, 2, rk_as_k(kx));
    main.abc(OpCode::Return, 2, 2, 0);
    let results = vm
        .call_proto(main.build(), &[LuaValue::Table(p), LuaValue::Table(q)])
        .unwrap();
    assert_eq!(results, vec![num(7.0)]);
}

#[test]
fn index_fallback_through_table() {
    let mut vm = new_vm();
    let defaults = vm.new_table(0, 1);
    let key = vm.new_string_value("answer");
    vm.raw_set(defaults, key, num(42.0)).unwrap();

    let mt = vm.new_table(0, 1);
    let index_key = vm.new_string_value("__index");
    vm.raw_set(mt, index_key, LuaValue::Table(defaults)).unwrap();

    let t = vm.new_table(0, 0);
    vm.set_metatable_value(&LuaValue::Table(t), Some(mt));

    let v = vm.vm_gettable(&LuaValue::Table(t), &key).unwrap();
    assert_eq!(v, num(42.0));

    // raw access does not follow the chain
    assert!(vm.raw_get(t, &key).is_nil());
}

#[test]
fn index_function_receives_table_and_key() {
    fn index_fn(vm: &mut LuaVm) -> LuaResult<usize> {
        // returns the key it was asked for
        let key = crate::lualib::arg(vm, 2);
        crate::lualib::push(vm, key)?;
        Ok(1)
    }
    let mut vm = new_vm();
    let env = vm.globals();
    let f = LuaValue::Function(vm.new_native_closure(index_fn, Vec::new(), env));
    let mt = vm.new_table(0, 1);
    let index_key = vm.new_string_value("__index");
    vm.raw_set(mt, index_key, f).unwrap();
    let t = vm.new_table(0, 0);
    vm.set_metatable_value(&LuaValue::Table(t), Some(mt));

    let key = vm.new_string_value("echo");
    let v = vm.vm_gettable(&LuaValue::Table(t), &key).unwrap();
    assert_eq!(v, key);
}

#[test]
fn newindex_redirects_writes() {
    let mut vm = new_vm();
    let log = vm.new_table(0, 1);
    let mt = vm.new_table(0, 1);
    let newindex_key = vm.new_string_value("__newindex");
    vm.raw_set(mt, newindex_key, LuaValue::Table(log)).unwrap();
    let t = vm.new_table(0, 0);
    vm.set_metatable_value(&LuaValue::Table(t), Some(mt));

    let key = vm.new_string_value("k");
    vm.vm_settable(&LuaValue::Table(t), &key, &num(1.0)).unwrap();
    // write landed in the redirect target, not the receiver
    assert!(vm.raw_get(t, &key).is_nil());
    assert_eq!(vm.raw_get(log, &key), num(1.0));

    // existing keys bypass __newindex
    vm.raw_set(t, key, num(5.0)).unwrap();
    vm.vm_settable(&LuaValue::Table(t), &key, &num(6.0)).unwrap();
    assert_eq!(vm.raw_get(t, &key), num(6.0));
}

#[test]
fn index_chain_loop_is_bounded() {
    let mut vm = new_vm();
    let t1 = vm.new_table(0, 0);
    let t2 = vm.new_table(0, 0);
    let index_key = vm.new_string_value("__index");

    let mt1 = vm.new_table(0, 1);
    vm.raw_set(mt1, index_key, LuaValue::Table(t2)).unwrap();
    let mt2 = vm.new_table(0, 1);
    vm.raw_set(mt2, index_key, LuaValue::Table(t1)).unwrap();
    vm.set_metatable_value(&LuaValue::Table(t1), Some(mt1));
    vm.set_metatable_value(&LuaValue::Table(t2), Some(mt2));

    let key = vm.new_string_value("missing");
    let err = vm.vm_gettable(&LuaValue::Table(t1), &key).unwrap_err();
    let full = vm.into_full_error(err);
    assert!(full.message.contains("loop in gettable"), "{}", full.message);
}

#[test]
fn call_metamethod_inserts_receiver() {
    fn callee(vm: &mut LuaVm) -> LuaResult<usize> {
        // receives the callable table plus the explicit arguments
        let n = crate::lualib::nargs(vm);
        let first_is_table = matches!(crate::lualib::arg(vm, 1), LuaValue::Table(_));
        crate::lualib::push(vm, LuaValue::Number(n as f64))?;
        crate::lualib::push(vm, LuaValue::Boolean(first_is_table))?;
        Ok(2)
    }
    let mut vm = new_vm();
    let env = vm.globals();
    let f = LuaValue::Function(vm.new_native_closure(callee, Vec::new(), env));
    let mt = vm.new_table(0, 1);
    let call_key = vm.new_string_value("__call");
    vm.raw_set(mt, call_key, f).unwrap();
    let t = vm.new_table(0, 0);
    vm.set_metatable_value(&LuaValue::Table(t), Some(mt));

    let results = vm
        .call_value(LuaValue::Table(t), &[num(1.0), num(2.0)])
        .unwrap();
    assert_eq!(results, vec![num(3.0), LuaValue::Boolean(true)]);
}

#[test]
fn eq_requires_the_same_handler() {
    fn always_true(vm: &mut LuaVm) -> LuaResult<usize> {
        crate::lualib::push(vm, LuaValue::Boolean(true))?;
        Ok(1)
    }
    fn also_true(vm: &mut LuaVm) -> LuaResult<usize> {
        crate::lualib::push(vm, LuaValue::Boolean(true))?;
        Ok(1)
    }
    let mut vm = new_vm();
    let env = vm.globals();
    let eq_key = vm.new_string_value("__eq");

    let h1 = LuaValue::Function(vm.new_native_closure(always_true, Vec::new(), env));
    let mt_shared = vm.new_table(0, 1);
    vm.raw_set(mt_shared, eq_key, h1).unwrap();

    let a = vm.new_table(0, 0);
    let b = vm.new_table(0, 0);
    vm.set_metatable_value(&LuaValue::Table(a), Some(mt_shared));
    vm.set_metatable_value(&LuaValue::Table(b), Some(mt_shared));
    assert!(vm
        .equal_values(&LuaValue::Table(a), &LuaValue::Table(b))
        .unwrap());

    // same behavior, different handler value: identity comparison wins
    let h2 = LuaValue::Function(vm.new_native_closure(also_true, Vec::new(), env));
    let mt_other = vm.new_table(0, 1);
    vm.raw_set(mt_other, eq_key, h2).unwrap();
    let c = vm.new_table(0, 0);
    vm.set_metatable_value(&LuaValue::Table(c), Some(mt_other));
    assert!(!vm
        .equal_values(&LuaValue::Table(a), &LuaValue::Table(c))
        .unwrap());

    // different types never consult handlers
    assert!(!vm.equal_values(&LuaValue::Table(a), &num(1.0)).unwrap());
}

#[test]
fn le_falls_back_to_negated_lt() {
    fn lt(vm: &mut LuaVm) -> LuaResult<usize> {
        let x_key = vm.new_string_value("v");
        let a = crate::lualib::arg(vm, 1);
        let b = crate::lualib::arg(vm, 2);
        let av = vm.vm_gettable(&a, &x_key)?.as_number().unwrap_or(0.0);
        let bv = vm.vm_gettable(&b, &x_key)?.as_number().unwrap_or(0.0);
        crate::lualib::push(vm, LuaValue::Boolean(av < bv))?;
        Ok(1)
    }
    let mut vm = new_vm();
    let env = vm.globals();
    let lt_fn = LuaValue::Function(vm.new_native_closure(lt, Vec::new(), env));
    let mt = vm.new_table(0, 1);
    let lt_key = vm.new_string_value("__lt");
    vm.raw_set(mt, lt_key, lt_fn).unwrap();

    let v_key = vm.new_string_value("v");
    let a = vm.new_table(0, 1);
    vm.raw_set(a, v_key, num(1.0)).unwrap();
    vm.set_metatable_value(&LuaValue::Table(a), Some(mt));
    let b = vm.new_table(0, 1);
    vm.raw_set(b, v_key, num(2.0)).unwrap();
    vm.set_metatable_value(&LuaValue::Table(b), Some(mt));

    // a <= b computed as not (b < a)
    assert!(vm
        .less_equal(&LuaValue::Table(a), &LuaValue::Table(b))
        .unwrap());
    assert!(!vm
        .less_equal(&LuaValue::Table(b), &LuaValue::Table(a))
        .unwrap());
}

#[test]
fn metamethod_absence_cache_invalidated_on_set() {
    let mut vm = new_vm();
    let mt = vm.new_table(0, 1);
    let t = vm.new_table(0, 0);
    vm.set_metatable_value(&LuaValue::Table(t), Some(mt));

    let key = vm.new_string_value("k");
    // first lookup caches "no __index"
    assert!(vm.vm_gettable(&LuaValue::Table(t), &key).unwrap().is_nil());

    // installing __index afterwards must be visible
    let defaults = vm.new_table(0, 1);
    vm.raw_set(defaults, key, num(9.0)).unwrap();
    let index_key = vm.new_string_value("__index");
    vm.raw_set(mt, index_key, LuaValue::Table(defaults)).unwrap();
    assert_eq!(vm.vm_gettable(&LuaValue::Table(t), &key).unwrap(), num(9.0));
}

#[test]
fn comparing_mismatched_types_errors() {
    let mut vm = new_vm();
    let s = vm.new_string_value("a");
    let err = vm.less_than(&num(1.0), &s).unwrap_err();
    let full = vm.into_full_error(err);
    assert!(
        full.message.contains("attempt to compare"),
        "{}",
        full.message
    );
}
