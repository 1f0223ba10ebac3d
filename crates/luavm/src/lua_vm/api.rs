// Stack-based host surface: everything a library or embedder needs is a
// thin wrapper over the table engine, the do-layer and the collector.
// Indices follow the usual convention: positive counts from the bottom
// of the current thread's stack, negative from its top.

use std::rc::Rc;

use crate::gc::{GcRef, ObjectPool, TableId, ThreadId};
use crate::lua_value::{LuaValue, Proto, TmAbsent};
use crate::lua_vm::execute::Resume;
use crate::lua_vm::thread::{HookFn, HookMask};
use crate::lua_vm::{CFunction, LuaResult, LuaVm};

impl LuaVm {
    // ---- stack primitives ----

    pub fn api_top(&self) -> usize {
        self.thr().top
    }

    pub fn api_set_top(&mut self, top: usize) {
        let th = self.thr_mut();
        for i in th.top..top.min(th.stack.len()) {
            th.stack[i] = LuaValue::Nil;
        }
        th.top = top;
    }

    fn resolve(&self, idx: i64) -> usize {
        if idx > 0 {
            (idx - 1) as usize
        } else {
            (self.thr().top as i64 + idx) as usize
        }
    }

    pub fn api_push(&mut self, v: LuaValue) -> LuaResult<()> {
        let top = self.thr().top;
        self.ensure_stack(top + 1)?;
        self.thr_mut().push(v);
        Ok(())
    }

    pub fn api_get(&self, idx: i64) -> LuaValue {
        let i = self.resolve(idx);
        if i < self.thr().top {
            self.thr().stack[i]
        } else {
            LuaValue::Nil
        }
    }

    pub fn api_pop(&mut self, n: usize) {
        let th = self.thr_mut();
        th.top = th.top.saturating_sub(n);
    }

    // ---- typed pushes ----

    pub fn push_nil(&mut self) -> LuaResult<()> {
        self.api_push(LuaValue::Nil)
    }

    pub fn push_boolean(&mut self, b: bool) -> LuaResult<()> {
        self.api_push(LuaValue::Boolean(b))
    }

    pub fn push_number(&mut self, n: f64) -> LuaResult<()> {
        self.api_push(LuaValue::Number(n))
    }

    pub fn push_string(&mut self, s: &str) -> LuaResult<()> {
        let v = self.new_string_value(s);
        self.api_push(v)
    }

    /// A native function closed over `upvals`, environment = globals.
    pub fn push_cfunction(&mut self, f: CFunction, upvals: Vec<LuaValue>) -> LuaResult<()> {
        let env = self.globals;
        let cid = self.new_native_closure(f, upvals, env);
        self.api_push(LuaValue::Function(cid))
    }

    // ---- conversions ----

    pub fn to_number(&self, idx: i64) -> Option<f64> {
        self.to_number_coerce(&self.api_get(idx))
    }

    pub fn to_bool(&self, idx: i64) -> bool {
        self.api_get(idx).is_truthy()
    }

    // ---- table access ----

    /// `t[k]` honoring metamethods.
    pub fn get_field(&mut self, t: LuaValue, name: &str) -> LuaResult<LuaValue> {
        let key = self.new_string_value(name);
        self.vm_gettable(&t, &key)
    }

    /// `t[k] = v` honoring metamethods.
    pub fn set_field(&mut self, t: LuaValue, name: &str, v: LuaValue) -> LuaResult<()> {
        let key = self.new_string_value(name);
        self.vm_settable(&t, &key, &v)
    }

    /// Metatable assignment with the write barrier appropriate to the
    /// receiver; non-table, non-userdata values share one metatable per
    /// type class.
    pub fn set_metatable_value(&mut self, v: &LuaValue, mt: Option<TableId>) {
        match v {
            LuaValue::Table(tid) => {
                {
                    let t = self.pool.table_mut(*tid);
                    t.metatable = mt;
                    t.flags = TmAbsent::empty();
                }
                if mt.is_some() {
                    self.gc.barrier_back(*tid, &mut self.pool);
                }
            }
            LuaValue::Userdata(uid) => {
                self.pool.userdata_mut(*uid).metatable = mt;
                if let Some(m) = mt {
                    let mv = LuaValue::Table(m);
                    self.forward_barrier(GcRef::Userdata(*uid), &mv);
                }
            }
            other => {
                self.set_type_metatable(other.type_tag(), mt);
            }
        }
    }

    /// Environment table of a function, userdata or thread.
    pub fn get_environment(&self, v: &LuaValue) -> Option<TableId> {
        match v {
            LuaValue::Function(id) => Some(self.pool.closure(*id).env()),
            LuaValue::Userdata(id) => Some(self.pool.userdata_ref(*id).env),
            LuaValue::Thread(id) => Some(self.pool.thread(*id).env),
            _ => None,
        }
    }

    pub fn set_environment(&mut self, v: &LuaValue, env: TableId) {
        match v {
            LuaValue::Function(id) => {
                self.pool.closure_mut(*id).set_env(env);
                let ev = LuaValue::Table(env);
                self.forward_barrier(GcRef::Closure(*id), &ev);
            }
            LuaValue::Userdata(id) => {
                self.pool.userdata_mut(*id).env = env;
                let ev = LuaValue::Table(env);
                self.forward_barrier(GcRef::Userdata(*id), &ev);
            }
            LuaValue::Thread(id) => {
                self.pool.thread_mut(*id).env = env;
            }
            _ => {}
        }
    }

    /// Table iteration for `next`: the successor of `key`, or None at
    /// the end.
    pub fn next_entry(
        &mut self,
        t: TableId,
        key: &LuaValue,
    ) -> LuaResult<Option<(LuaValue, LuaValue)>> {
        let r = self.pool.table(t).next(key, &self.pool.strings);
        match r {
            Ok(pair) => Ok(pair),
            Err(_) => Err(self.error("invalid key to 'next'")),
        }
    }

    // ---- calls ----

    /// Protected call with values, the host-facing pcall.
    pub fn pcall_values(
        &mut self,
        f: LuaValue,
        args: &[LuaValue],
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        let top = self.thr().top;
        self.ensure_stack(top + 1 + args.len())?;
        {
            let th = self.thr_mut();
            th.push(f);
            for a in args {
                th.push(*a);
            }
        }
        let (ok, n) = self.pcall_at(top, 0)?;
        let results = self.thr().stack[top..top + n].to_vec();
        self.thr_mut().top = top;
        Ok((ok, results))
    }

    /// Run a compiled chunk on the current thread. An error reaching
    /// this boundary escaped every protected frame, so the panic hook
    /// sees it before the host does.
    pub fn call_proto(&mut self, proto: Rc<Proto>, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        let f = self.proto_closure(proto);
        match self.call_value(f, args) {
            Err(e) if e != crate::lua_vm::LuaError::Yield => {
                if let Some(p) = self.panic {
                    p(&self.error_value);
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Coroutine entry point for embedders.
    pub fn resume_thread(&mut self, co: ThreadId, args: &[LuaValue]) -> LuaResult<Resume> {
        self.resume(co, args)
    }

    // ---- GC control ----

    pub fn gc_stop(&mut self) {
        self.gc.running = false;
    }

    pub fn gc_restart(&mut self) {
        self.gc.running = true;
        self.gc.threshold = self.gc.total_bytes;
    }

    pub fn gc_collect(&mut self) {
        self.gc_full();
    }

    /// Heap size in kilobytes, the `collectgarbage("count")` number.
    pub fn gc_count_kb(&self) -> f64 {
        self.gc.total_bytes as f64 / 1024.0
    }

    pub fn gc_set_pause(&mut self, pause: i32) -> i32 {
        std::mem::replace(&mut self.gc.pause, pause)
    }

    pub fn gc_set_step_mul(&mut self, mul: i32) -> i32 {
        std::mem::replace(&mut self.gc.step_mul, mul)
    }

    // ---- debug hooks ----

    pub fn set_hook(&mut self, hook: Option<HookFn>, mask: HookMask, count: i32) {
        let th = self.thr_mut();
        th.hook = hook;
        th.hook_mask = if hook.is_some() {
            mask
        } else {
            HookMask::empty()
        };
        th.base_hook_count = count;
        th.hook_count = count;
    }

    // ---- introspection used by libraries ----

    /// `tostring` semantics including `__tostring`.
    pub fn tostring_value(&mut self, v: &LuaValue) -> LuaResult<LuaValue> {
        let tm_name = self.new_string_value("__tostring");
        if let Some(mt) = self.get_metatable_of(v) {
            let tm = self.raw_get(mt, &tm_name);
            if !tm.is_nil() {
                return self.call_tm_res(tm, &[*v]);
            }
        }
        let rendered = self.display_value(v);
        Ok(self.new_string_value(&rendered))
    }

    /// The `getmetatable` the language exposes: honors `__metatable`.
    pub fn protected_metatable(&mut self, v: &LuaValue) -> LuaValue {
        match self.get_metatable_of(v) {
            None => LuaValue::Nil,
            Some(mt) => {
                let guard_key = self.new_string_value("__metatable");
                let guard = self.raw_get(mt, &guard_key);
                if guard.is_nil() {
                    LuaValue::Table(mt)
                } else {
                    guard
                }
            }
        }
    }

    /// Upvalue of the running native closure (its own closed state).
    pub fn native_upvalue(&self, i: usize) -> LuaValue {
        let ci = self.thr().current_ci();
        if let LuaValue::Function(cid) = self.thr().stack[ci.func] {
            if let Some(nc) = self.pool.closure(cid).as_native() {
                return nc.upvals.get(i).copied().unwrap_or(LuaValue::Nil);
            }
        }
        LuaValue::Nil
    }

    /// Pin a string for the lifetime of the state (reserved words,
    /// event names): the sweep will never reclaim it.
    pub fn fix_string(&mut self, id: crate::gc::StringId) {
        self.pool.strings.header_mut(id.index()).set_fixed();
    }

    /// Liveness probe mirroring the stack-write assertion, for hosts
    /// that cache ids across collections.
    pub fn is_live(&self, v: &LuaValue) -> bool {
        match ObjectPool::value_ref(v) {
            None => true,
            Some(GcRef::String(id)) => self.pool.strings.contains(id.index()),
            Some(GcRef::Table(id)) => self.pool.tables.contains(id.index()),
            Some(GcRef::Closure(id)) => self.pool.closures.contains(id.index()),
            Some(GcRef::Upvalue(id)) => self.pool.upvalues.contains(id.index()),
            Some(GcRef::Userdata(id)) => self.pool.userdata.contains(id.index()),
            Some(GcRef::Thread(id)) => self.pool.threads.contains(id.index()),
        }
    }
}
