// Precompiled chunk round trips and header validation.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, OpCode, dump_proto, load_chunk, rk_as_k, verify_header};
use crate::test::asm::ProtoBuilder;
use crate::test::new_vm;

fn num(n: f64) -> LuaValue {
    LuaValue::Number(n)
}

fn fib_proto(vm: &mut crate::lua_vm::LuaVm) -> std::rc::Rc<crate::lua_value::Proto> {
    let mut fib = ProtoBuilder::new(1, 8);
    let k0 = fib.knum(0.0);
    let k1 = fib.knum(1.0);
    let _marker = fib.k(vm.new_string_value("fib"));
    fib.abx(OpCode::LoadK, 1, k0);
    fib.abx(OpCode::LoadK, 2, k1);
    fib.abx(OpCode::LoadK, 3, k1);
    fib.abc(OpCode::Move, 4, 0, 0);
    fib.abx(OpCode::LoadK, 5, k1);
    fib.asbx(OpCode::ForPrep, 3, 4);
    fib.abc(OpCode::Move, 6, 2, 0);
    fib.abc(OpCode::Add, 7, 1, 2);
    fib.abc(OpCode::Move, 1, 6, 0);
    fib.abc(OpCode::Move, 2, 7, 0);
    fib.asbx(OpCode::ForLoop, 3, -5);
    fib.abc(OpCode::Return, 1, 2, 0);
    fib.build()
}

#[test]
fn dump_then_load_runs_identically() {
    let mut vm = new_vm();
    let original = fib_proto(&mut vm);
    let direct = vm.call_proto(original.clone(), &[num(20.0)]).unwrap();

    let bytes = dump_proto(&vm, &original, false);
    let loaded = load_chunk(&mut vm, &bytes).unwrap();
    let reloaded = vm.call_proto(loaded, &[num(20.0)]).unwrap();

    assert_eq!(direct, reloaded);
    assert_eq!(direct, vec![num(6765.0)]);
}

#[test]
fn nested_protos_round_trip() {
    let mut vm = new_vm();
    let mut inner = ProtoBuilder::new(1, 2);
    let k2 = inner.knum(2.0);
    inner.abc(OpCode::Mul, 0, 0, rk_as_k(k2));
    inner.abc(OpCode::Return, 0, 2, 0);
    let inner = inner.build();

    let mut main = ProtoBuilder::new(0, 3);
    let p0 = main.child(inner);
    let k21 = main.knum(21.0);
    main.abx(OpCode::Closure, 0, p0);
    main.abx(OpCode::LoadK, 1, k21);
    main.abc(OpCode::Call, 0, 2, 2);
    main.abc(OpCode::Return, 0, 2, 0);
    let main = main.build();

    let bytes = dump_proto(&vm, &main, false);
    let loaded = load_chunk(&mut vm, &bytes).unwrap();
    assert_eq!(loaded.protos.len(), 1);
    let r = vm.call_proto(loaded, &[]).unwrap();
    assert_eq!(r, vec![num(42.0)]);
}

#[test]
fn string_constants_are_reinterned() {
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 2);
    let ks = b.k(vm.new_string_value("shared"));
    b.abx(OpCode::LoadK, 0, ks);
    b.abc(OpCode::Return, 0, 2, 0);
    let bytes = dump_proto(&vm, &b.build(), false);
    let loaded = load_chunk(&mut vm, &bytes).unwrap();
    let r = vm.call_proto(loaded, &[]).unwrap();
    // interning makes the loaded constant identical to a fresh string
    assert_eq!(r, vec![vm.new_string_value("shared")]);
}

#[test]
fn header_must_match_exactly() {
    let mut vm = new_vm();
    let proto = fib_proto(&mut vm);
    let bytes = dump_proto(&vm, &proto, false);

    assert!(verify_header(&bytes).is_ok());

    // wrong signature
    let mut bad = bytes.clone();
    bad[0] = b'L';
    assert_eq!(load_chunk(&mut vm, &bad).unwrap_err(), LuaError::Syntax);

    // wrong version
    let mut bad = bytes.clone();
    bad[4] = 0x52;
    assert_eq!(load_chunk(&mut vm, &bad).unwrap_err(), LuaError::Syntax);

    // wrong declared number width
    let mut bad = bytes.clone();
    bad[10] = 4;
    assert_eq!(load_chunk(&mut vm, &bad).unwrap_err(), LuaError::Syntax);

    // truncation inside the function body
    let bad = &bytes[..bytes.len() / 2];
    assert_eq!(load_chunk(&mut vm, bad).unwrap_err(), LuaError::Syntax);
}

#[test]
fn stripped_chunks_still_run() {
    let mut vm = new_vm();
    let original = fib_proto(&mut vm);
    let bytes = dump_proto(&vm, &original, true);
    let loaded = load_chunk(&mut vm, &bytes).unwrap();
    assert!(loaded.line_info.is_empty());
    let r = vm.call_proto(loaded, &[num(10.0)]).unwrap();
    assert_eq!(r, vec![num(55.0)]);
}
