// Collector behavior: reachability, incremental stepping, weak tables,
// finalizers, string interning across cycles.

use crate::gc::GcState;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVm, OpCode, rk_as_k};
use crate::test::asm::ProtoBuilder;
use crate::test::new_vm;

fn num(n: f64) -> LuaValue {
    LuaValue::Number(n)
}

#[test]
fn unreachable_objects_are_collected() {
    let mut vm = new_vm();
    vm.gc_full();
    let before = vm.pool.tables.live_count();
    for _ in 0..10 {
        vm.new_table(4, 4);
    }
    assert_eq!(vm.pool.tables.live_count(), before + 10);
    vm.gc_full();
    assert_eq!(vm.pool.tables.live_count(), before);
}

#[test]
fn rooted_objects_survive() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 1);
    let key = vm.new_string_value("k");
    vm.raw_set(t, key, num(7.0)).unwrap();
    vm.set_global("keep", LuaValue::Table(t));
    vm.gc_full();
    vm.gc_full();
    let kept = vm.get_global("keep");
    assert_eq!(kept, LuaValue::Table(t));
    assert_eq!(vm.raw_get(t, &key), num(7.0));
}

#[test]
fn full_collection_is_idempotent_on_quiescent_heap() {
    let mut vm = new_vm();
    vm.gc_full();
    let once = vm.gc.total_bytes;
    vm.gc_full();
    assert_eq!(vm.gc.total_bytes, once);
    assert_eq!(vm.gc.state, GcState::Pause);
}

#[test]
fn dead_strings_leave_the_intern_table() {
    let mut vm = new_vm();
    vm.gc_full();
    let id = vm.intern(b"ephemeral-string-for-collection");
    assert!(vm.pool.strings.contains(id.index()));
    vm.gc_full();
    assert!(!vm.pool.strings.contains(id.index()));
    // fixed metamethod names never go away
    vm.gc_full();
    let gc_name = vm.intern(b"__gc");
    assert!(vm.pool.strings.contains(gc_name.index()));
}

#[test]
fn interning_after_collection_still_dedups() {
    let mut vm = new_vm();
    let a = vm.intern(b"sticky");
    vm.set_global("s", LuaValue::String(a));
    vm.gc_full();
    let b = vm.intern(b"sticky");
    assert_eq!(a, b);
}

#[test]
fn incremental_steps_interleave_with_allocation() {
    // for _ = 1, 200 do local t = {}; t[1] = "x" end, with the collector
    // stepping at every allocation site
    let mut vm = new_vm();
    let mut b = ProtoBuilder::new(0, 6);
    let k1 = b.knum(1.0);
    let klim = b.knum(200.0);
    let kx = b.k(vm.new_string_value("x"));
    b.abx(OpCode::LoadK, 0, k1);
    b.abx(OpCode::LoadK, 1, klim);
    b.abx(OpCode::LoadK, 2, k1);
    b.asbx(OpCode::ForPrep, 0, 2);
    b.abc(OpCode::NewTable, 4, 0, 0);
    b.abc(OpCode::SetTable, 4, rk_as_k(k1), rk_as_k(kx));
    b.asbx(OpCode::ForLoop, 0, -3);
    b.abx(OpCode::LoadK, 0, k1);
    b.abc(OpCode::Return, 0, 2, 0);

    vm.gc.threshold = 0; // every check site runs a step
    let baseline = vm.pool.tables.live_count();
    let results = vm.call_proto(b.build(), &[]).unwrap();
    assert_eq!(results, vec![num(1.0)]);
    vm.gc_full();
    vm.gc_full();
    assert_eq!(vm.pool.tables.live_count(), baseline);
}

#[test]
fn weak_value_table_drops_dead_entries() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 1);
    let mt = vm.new_table(0, 1);
    let mode_key = vm.new_string_value("__mode");
    let mode_v = vm.new_string_value("v");
    vm.raw_set(mt, mode_key, mode_v).unwrap();
    vm.set_metatable_value(&LuaValue::Table(t), Some(mt));
    vm.set_global("weak", LuaValue::Table(t));

    let inner = vm.new_table(0, 0);
    vm.raw_seti(t, 1, LuaValue::Table(inner));
    assert!(!vm.raw_geti(t, 1).is_nil());

    vm.gc_full();
    assert!(vm.raw_geti(t, 1).is_nil());
    assert!(!vm.pool.tables.contains(inner.index()));
}

#[test]
fn weak_table_keeps_strongly_referenced_values() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 1);
    let mt = vm.new_table(0, 1);
    let mode_key = vm.new_string_value("__mode");
    let mode_v = vm.new_string_value("v");
    vm.raw_set(mt, mode_key, mode_v).unwrap();
    vm.set_metatable_value(&LuaValue::Table(t), Some(mt));
    vm.set_global("weak", LuaValue::Table(t));

    let inner = vm.new_table(0, 0);
    vm.raw_seti(t, 1, LuaValue::Table(inner));
    vm.set_global("strong", LuaValue::Table(inner)); // second, strong path

    vm.gc_full();
    assert_eq!(vm.raw_geti(t, 1), LuaValue::Table(inner));
}

#[test]
fn weak_tables_never_drop_strings() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 1);
    let mt = vm.new_table(0, 1);
    let mode_key = vm.new_string_value("__mode");
    let mode_kv = vm.new_string_value("kv");
    vm.raw_set(mt, mode_key, mode_kv).unwrap();
    vm.set_metatable_value(&LuaValue::Table(t), Some(mt));
    vm.set_global("weak", LuaValue::Table(t));

    let s = vm.new_string_value("weakly-held-string");
    vm.raw_seti(t, 1, s);
    vm.gc_full();
    assert_eq!(vm.raw_geti(t, 1), s);
}

#[test]
fn finalizer_runs_once_then_object_is_freed() {
    fn finalizer(vm: &mut LuaVm) -> LuaResult<usize> {
        let n = vm.get_global("finalized").as_number().unwrap_or(0.0);
        vm.set_global("finalized", LuaValue::Number(n + 1.0));
        Ok(0)
    }

    let mut vm = new_vm();
    vm.set_global("finalized", num(0.0));
    let env = vm.globals();
    let f = LuaValue::Function(vm.new_native_closure(finalizer, Vec::new(), env));
    let mt = vm.new_table(0, 1);
    let gc_key = vm.new_string_value("__gc");
    vm.raw_set(mt, gc_key, f).unwrap();
    vm.set_global("mt", LuaValue::Table(mt)); // keep the metatable alive

    let ud = vm.new_userdata(16, env);
    vm.pool.userdata_mut(ud).metatable = Some(mt);
    // no root holds the userdata

    vm.gc_full();
    // resurrected for one cycle so __gc could run
    assert_eq!(vm.get_global("finalized"), num(1.0));
    assert!(vm.pool.userdata.contains(ud.index()));

    vm.gc_full();
    // second cycle reclaims it without re-finalizing
    assert_eq!(vm.get_global("finalized"), num(1.0));
    assert!(!vm.pool.userdata.contains(ud.index()));
}

#[test]
fn collection_preserves_open_upvalues_of_live_closures() {
    // counter survives a full collection between calls
    let mut vm = new_vm();
    let mut inc = ProtoBuilder::new(0, 2);
    let k1 = inc.knum(1.0);
    inc.abc(OpCode::GetUpval, 0, 0, 0);
    inc.abc(OpCode::Add, 0, 0, rk_as_k(k1));
    inc.abc(OpCode::SetUpval, 0, 0, 0);
    inc.abc(OpCode::Return, 0, 2, 0);
    let inc = inc.nups(1).build();

    let mut mk = ProtoBuilder::new(0, 2);
    let k0 = mk.knum(0.0);
    let p0 = mk.child(inc);
    mk.abx(OpCode::LoadK, 0, k0);
    mk.abx(OpCode::Closure, 1, p0);
    mk.abc(OpCode::Move, 0, 0, 0);
    mk.abc(OpCode::Return, 1, 2, 0);

    let counter = vm.call_proto(mk.build(), &[]).unwrap()[0];
    vm.set_global("counter", counter);

    let r = vm.call_value(counter, &[]).unwrap();
    assert_eq!(r, vec![num(1.0)]);
    vm.gc_full();
    vm.gc_full();
    let r = vm.call_value(counter, &[]).unwrap();
    assert_eq!(r, vec![num(2.0)]);
}

#[test]
fn dead_thread_sweep_closes_its_upvalues() {
    // a coroutine yields while a closure captures one of its locals;
    // the closure escapes, the coroutine is dropped and collected
    let mut vm = new_vm();

    let mut getter = ProtoBuilder::new(0, 2);
    getter.abc(OpCode::GetUpval, 0, 0, 0);
    getter.abc(OpCode::Return, 0, 2, 0);
    let getter = getter.nups(1).build();

    // body: local v = 77; yield(function() return v end); return 0
    let mut body = ProtoBuilder::new(0, 4);
    let k77 = body.knum(77.0);
    let kco = body.k(vm.new_string_value("coroutine"));
    let kyield = body.k(vm.new_string_value("yield"));
    let k0 = body.knum(0.0);
    let p0 = body.child(getter);
    body.abx(OpCode::LoadK, 0, k77);
    body.abx(OpCode::GetGlobal, 1, kco);
    body.abc(OpCode::GetTable, 1, 1, rk_as_k(kyield));
    body.abx(OpCode::Closure, 2, p0);
    body.abc(OpCode::Move, 0, 0, 0); // capture local R0
    body.abc(OpCode::Call, 1, 2, 1);
    body.abx(OpCode::LoadK, 0, k0);
    body.abc(OpCode::Return, 0, 2, 0);

    let f = vm.proto_closure(body.build());
    let co = vm.coroutine_create(f);
    let escaped = match vm.resume(co, &[]).unwrap() {
        crate::lua_vm::Resume::Yield(vals) => vals[0],
        _ => panic!("expected a yield"),
    };
    vm.set_global("escaped", escaped);

    // the suspended thread is unreachable from any root now
    vm.gc_full();
    vm.gc_full();
    assert!(!vm.pool.threads.contains(co.index()));

    // the captured value survived by being closed into the upvalue
    let r = vm.call_value(escaped, &[]).unwrap();
    assert_eq!(r, vec![num(77.0)]);
}

#[test]
fn gc_count_reports_kilobytes() {
    let vm = new_vm();
    assert!(vm.gc_count_kb() > 0.0);
}
