// Coroutines: transfer of values, status transitions, yield
// restrictions, protected calls across yields.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, OpCode, Resume, ThreadStatus, rk_as_k};
use crate::test::asm::ProtoBuilder;
use crate::test::new_vm;

fn num(n: f64) -> LuaValue {
    LuaValue::Number(n)
}

/// Body: yield(1); yield(2); return 3
fn yielder_proto(vm: &mut crate::lua_vm::LuaVm) -> std::rc::Rc<crate::lua_value::Proto> {
    let mut b = ProtoBuilder::new(0, 3);
    let kco = b.k(vm.new_string_value("coroutine"));
    let kyield = b.k(vm.new_string_value("yield"));
    let k1 = b.knum(1.0);
    let k2 = b.knum(2.0);
    let k3 = b.knum(3.0);
    b.abx(OpCode::GetGlobal, 0, kco);
    b.abc(OpCode::GetTable, 0, 0, rk_as_k(kyield));
    b.abx(OpCode::LoadK, 1, k1);
    b.abc(OpCode::Call, 0, 2, 1);
    b.abx(OpCode::GetGlobal, 0, kco);
    b.abc(OpCode::GetTable, 0, 0, rk_as_k(kyield));
    b.abx(OpCode::LoadK, 1, k2);
    b.abc(OpCode::Call, 0, 2, 1);
    b.abx(OpCode::LoadK, 0, k3);
    b.abc(OpCode::Return, 0, 2, 0);
    b.build()
}

#[test]
fn yield_and_return_values_in_order() {
    let mut vm = new_vm();
    let p = yielder_proto(&mut vm);
    let f = vm.proto_closure(p);
    let co = vm.coroutine_create(f);

    match vm.resume(co, &[]).unwrap() {
        Resume::Yield(vals) => assert_eq!(vals, vec![num(1.0)]),
        Resume::Return(_) => panic!("expected a yield"),
    }
    assert_eq!(vm.coroutine_status(co), ThreadStatus::Suspended);
    match vm.resume(co, &[]).unwrap() {
        Resume::Yield(vals) => assert_eq!(vals, vec![num(2.0)]),
        Resume::Return(_) => panic!("expected a yield"),
    }
    match vm.resume(co, &[]).unwrap() {
        Resume::Return(vals) => assert_eq!(vals, vec![num(3.0)]),
        Resume::Yield(_) => panic!("expected completion"),
    }
    assert_eq!(vm.coroutine_status(co), ThreadStatus::Dead);
}

#[test]
fn resume_arguments_become_yield_results() {
    // body: return yield(5) + 10
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 3);
    let kco = b.k(vm.new_string_value("coroutine"));
    let kyield = b.k(vm.new_string_value("yield"));
    let k5 = b.knum(5.0);
    let k10 = b.knum(10.0);
    b.abx(OpCode::GetGlobal, 0, kco);
    b.abc(OpCode::GetTable, 0, 0, rk_as_k(kyield));
    b.abx(OpCode::LoadK, 1, k5);
    b.abc(OpCode::Call, 0, 2, 2); // one result
    b.abc(OpCode::Add, 0, 0, rk_as_k(k10));
    b.abc(OpCode::Return, 0, 2, 0);
    let f = vm.proto_closure(b.build());
    let co = vm.coroutine_create(f);

    match vm.resume(co, &[]).unwrap() {
        Resume::Yield(vals) => assert_eq!(vals, vec![num(5.0)]),
        Resume::Return(_) => panic!("expected a yield"),
    }
    match vm.resume(co, &[num(32.0)]).unwrap() {
        Resume::Return(vals) => assert_eq!(vals, vec![num(42.0)]),
        Resume::Yield(_) => panic!("expected completion"),
    }
}

#[test]
fn dead_coroutine_cannot_be_resumed() {
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 2);
    let k1 = b.knum(1.0);
    b.abx(OpCode::LoadK, 0, k1);
    b.abc(OpCode::Return, 0, 2, 0);
    let f = vm.proto_closure(b.build());
    let co = vm.coroutine_create(f);

    assert!(matches!(
        vm.resume(co, &[]).unwrap(),
        Resume::Return(_)
    ));
    let err = vm.resume(co, &[]).unwrap_err();
    assert_eq!(err, LuaError::Runtime);
    let full = vm.into_full_error(err);
    assert!(
        full.message.contains("cannot resume dead coroutine"),
        "{}",
        full.message
    );
}

#[test]
fn error_in_coroutine_kills_it_and_reports() {
    // body indexes nil
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 2);
    let kx = b.k(vm.new_string_value("x"));
    b.abc(OpCode::LoadNil, 0, 0, 0);
    b.abc(OpCode::GetTable, 1, 0, rk_as_k(kx));
    b.abc(OpCode::Return, 1, 2, 0);
    let f = vm.proto_closure(b.build());
    let co = vm.coroutine_create(f);

    let err = vm.resume(co, &[]).unwrap_err();
    assert_eq!(err, LuaError::Runtime);
    assert_eq!(vm.coroutine_status(co), ThreadStatus::Dead);
    let full = vm.into_full_error(err);
    assert!(full.message.contains("index"), "{}", full.message);
}

#[test]
fn yield_across_metamethod_boundary_is_an_error() {
    // body: {} + {} where __add yields
    let mut vm = new_vm();

    let mut y = ProtoBuilder::new(2, 4);
    let kco = y.k(vm.new_string_value("coroutine"));
    let kyield = y.k(vm.new_string_value("yield"));
    y.abx(OpCode::GetGlobal, 2, kco);
    y.abc(OpCode::GetTable, 2, 2, rk_as_k(kyield));
    y.abc(OpCode::Call, 2, 1, 1);
    y.abc(OpCode::Return, 2, 2, 0);
    let add_fn = vm.proto_closure(y.build());

    let mt = vm.new_table(0, 1);
    let add_key = vm.new_string_value("__add");
    vm.raw_set(mt, add_key, add_fn).unwrap();

    let a = vm.new_table(0, 0);
    let b = vm.new_table(0, 0);
    vm.set_metatable_value(&LuaValue::Table(a), Some(mt));
    vm.set_metatable_value(&LuaValue::Table(b), Some(mt));

    let mut body = ProtoBuilder::new(2, 3);
    body.abc(OpCode::Add, 2, 0, 1);
    body.abc(OpCode::Return, 2, 2, 0);
    let f = vm.proto_closure(body.build());
    let co = vm.coroutine_create(f);

    let err = vm.resume(co, &[LuaValue::Table(a), LuaValue::Table(b)]).unwrap_err();
    assert_eq!(err, LuaError::Runtime);
    let full = vm.into_full_error(err);
    assert!(
        full.message.contains("yield across"),
        "{}",
        full.message
    );
}

#[test]
fn pcall_propagates_yield_and_finishes_after_resume() {
    // body: return pcall(function() return yield(5) end)
    let mut vm = new_vm();

    let mut inner = ProtoBuilder::new(0, 3);
    let kco = inner.k(vm.new_string_value("coroutine"));
    let kyield = inner.k(vm.new_string_value("yield"));
    let k5 = inner.knum(5.0);
    inner.abx(OpCode::GetGlobal, 0, kco);
    inner.abc(OpCode::GetTable, 0, 0, rk_as_k(kyield));
    inner.abx(OpCode::LoadK, 1, k5);
    inner.abc(OpCode::Call, 0, 2, 0);
    inner.abc(OpCode::Return, 0, 0, 0);
    let inner = inner.build();

    let mut body = ProtoBuilder::new(0, 3);
    let kpcall = body.k(vm.new_string_value("pcall"));
    let p0 = body.child(inner);
    body.abx(OpCode::GetGlobal, 0, kpcall);
    body.abx(OpCode::Closure, 1, p0);
    body.abc(OpCode::Call, 0, 2, 0);
    body.abc(OpCode::Return, 0, 0, 0);
    let f = vm.proto_closure(body.build());
    let co = vm.coroutine_create(f);

    // the yield inside pcall reaches the resume, not an error
    match vm.resume(co, &[]).unwrap() {
        Resume::Yield(vals) => assert_eq!(vals, vec![num(5.0)]),
        Resume::Return(_) => panic!("yield should pass through pcall"),
    }
    // finishing delivers pcall's (true, results...) shape
    match vm.resume(co, &[num(99.0)]).unwrap() {
        Resume::Return(vals) => {
            assert_eq!(vals, vec![LuaValue::Boolean(true), num(99.0)]);
        }
        Resume::Yield(_) => panic!("expected completion"),
    }
}

#[test]
fn error_after_resumed_pcall_is_still_caught() {
    // body: return pcall(function() yield(); local t = nil; return t.x end)
    let mut vm = new_vm();

    let mut inner = ProtoBuilder::new(0, 3);
    let kco = inner.k(vm.new_string_value("coroutine"));
    let kyield = inner.k(vm.new_string_value("yield"));
    let kx = inner.k(vm.new_string_value("x"));
    inner.abx(OpCode::GetGlobal, 0, kco);
    inner.abc(OpCode::GetTable, 0, 0, rk_as_k(kyield));
    inner.abc(OpCode::Call, 0, 1, 1);
    inner.abc(OpCode::LoadNil, 0, 0, 0);
    inner.abc(OpCode::GetTable, 1, 0, rk_as_k(kx));
    inner.abc(OpCode::Return, 1, 2, 0);
    let inner = inner.build();

    let mut body = ProtoBuilder::new(0, 3);
    let kpcall = body.k(vm.new_string_value("pcall"));
    let p0 = body.child(inner);
    body.abx(OpCode::GetGlobal, 0, kpcall);
    body.abx(OpCode::Closure, 1, p0);
    body.abc(OpCode::Call, 0, 2, 0);
    body.abc(OpCode::Return, 0, 0, 0);
    let f = vm.proto_closure(body.build());
    let co = vm.coroutine_create(f);

    assert!(matches!(vm.resume(co, &[]).unwrap(), Resume::Yield(_)));
    // the pcall frame was orphaned by the yield; the error after the
    // resume must still unwind into it, not kill the coroutine
    match vm.resume(co, &[]).unwrap() {
        Resume::Return(vals) => {
            assert_eq!(vals[0], LuaValue::Boolean(false));
            let msg = vm.display_value(&vals[1]);
            assert!(msg.contains("index"), "{msg}");
        }
        Resume::Yield(_) => panic!("expected completion"),
    }
}

#[test]
fn coroutine_statuses_follow_the_lifecycle() {
    let mut vm = new_vm();
    let p = yielder_proto(&mut vm);
    let f = vm.proto_closure(p);
    let co = vm.coroutine_create(f);
    assert_eq!(vm.coroutine_status(co), ThreadStatus::Suspended);
    let _ = vm.resume(co, &[]).unwrap();
    assert_eq!(vm.coroutine_status(co), ThreadStatus::Suspended);
    let _ = vm.resume(co, &[]).unwrap();
    let _ = vm.resume(co, &[]).unwrap();
    assert_eq!(vm.coroutine_status(co), ThreadStatus::Dead);
}
