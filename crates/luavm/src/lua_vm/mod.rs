// Global state: the object pool, the collector, the shared tables and
// caches, and the identity of the running thread. One `LuaVm` is owned
// by exactly one OS thread; coroutines multiplex on it cooperatively.

mod api;
mod call_info;
mod dump;
mod error;
mod execute;
pub mod limits;
mod opcode;
mod thread;
mod undump;

pub use call_info::{CallInfo, CallStatus};
pub use dump::dump_proto;
pub use error::{LuaError, LuaFullError, LuaResult, PanicFn};
pub use execute::metamethod::TmKind;
pub use execute::{Precall, Resume};
pub use limits::VmOptions;
pub use opcode::{Instruction, OpCode, is_k, index_k, rk_as_k};
pub use thread::{HookEvent, HookFn, HookMask, LuaThread, ThreadStatus};
pub use undump::{load_chunk, verify_header};

use std::rc::Rc;

use tracing::debug;

use crate::aux::{MBuffer, chunk_id, number_to_str};
use crate::gc::{
    Gc, GcRef, GcRoots, GcState, ObjectPool, StepWork, StringId, TableId, ThreadId, UpvalueId,
    UserdataId, ClosureId,
};
use crate::lua_value::{
    Closure, LuaClosure, LuaTable, LuaValue, NativeClosure, Proto, TableError, Upvalue, Userdata,
    NUM_TYPES,
};
use limits::{GC_FINALIZE_COST, GC_STEP_SIZE};

/// Native function callable from Lua. Arguments are the top of the
/// current thread's stack; the function pushes its results and returns
/// how many it pushed.
pub type CFunction = fn(&mut LuaVm) -> LuaResult<usize>;

pub struct LuaVm {
    pub pool: ObjectPool,
    pub gc: Gc,

    pub(crate) main: ThreadId,
    pub(crate) current: ThreadId,

    pub(crate) globals: TableId,
    pub(crate) registry: TableId,

    /// Per-type-class metatables for values that have no slot of their
    /// own (everything but tables and userdata).
    pub(crate) type_mts: [Option<TableId>; NUM_TYPES],
    /// Pre-interned metamethod names, indexed by `TmKind`.
    pub(crate) tm_names: Vec<StringId>,

    pub(crate) buffer: MBuffer,

    /// Current error object; meaningful while a `LuaError` unwinds.
    pub(crate) error_value: LuaValue,
    pub(crate) panic: Option<PanicFn>,

    /// Nested native re-entries of the executor.
    pub(crate) n_ccalls: usize,
    /// Non-yieldable nesting (metamethods, iterators, finalizers).
    pub(crate) nny: usize,

    pub(crate) options: VmOptions,
}

impl LuaVm {
    pub fn new(options: VmOptions) -> Self {
        let mut gc = Gc::new();
        gc.pause = options.gc_pause;
        gc.step_mul = options.gc_step_mul;

        let mut vm = LuaVm {
            pool: ObjectPool::new(),
            gc,
            main: ThreadId(0),
            current: ThreadId(0),
            globals: TableId(0),
            registry: TableId(0),
            type_mts: [None; NUM_TYPES],
            tm_names: Vec::new(),
            buffer: MBuffer::new(),
            error_value: LuaValue::Nil,
            panic: None,
            n_ccalls: 0,
            nny: 0,
            options,
        };

        vm.globals = vm.new_table(0, 16);
        vm.registry = vm.new_table(0, 8);

        // metamethod names never go away
        vm.tm_names = TmKind::ALL
            .iter()
            .map(|tm| {
                let id = vm.intern(tm.name().as_bytes());
                vm.pool.strings.header_mut(id.index()).set_fixed();
                id
            })
            .collect();
        vm.gc.tm_gc = Some(vm.tm_names[TmKind::Gc as usize]);
        vm.gc.tm_mode = Some(vm.tm_names[TmKind::Mode as usize]);

        let globals = vm.globals;
        let main_idx = vm
            .pool
            .threads
            .alloc(LuaThread::new(globals), vm.gc.current_white, 1024);
        vm.gc.track_allocation(1024);
        vm.main = ThreadId(main_idx);
        vm.current = vm.main;
        vm.pool.threads.header_mut(main_idx).set_super_fixed();
        vm.pool.thread_mut(vm.main).status = ThreadStatus::Running;

        // _G points at the globals table itself
        let g = vm.new_string_value("_G");
        let globals_value = LuaValue::Table(vm.globals);
        let _ = vm.raw_set(globals, g, globals_value);

        vm
    }

    // ---- allocation ----

    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        let (id, created) = self.pool.intern(bytes, self.gc.current_white);
        if created > 0 {
            self.gc.track_allocation(created);
        }
        id
    }

    pub fn new_string_value(&mut self, s: &str) -> LuaValue {
        LuaValue::String(self.intern(s.as_bytes()))
    }

    pub fn new_bytes_value(&mut self, bytes: &[u8]) -> LuaValue {
        LuaValue::String(self.intern(bytes))
    }

    pub fn new_table(&mut self, narray: usize, nhash: usize) -> TableId {
        let size = (64 + narray * 16 + nhash * 48) as u32;
        let idx = self
            .pool
            .tables
            .alloc(LuaTable::new(narray, nhash), self.gc.current_white, size);
        self.gc.track_allocation(size as usize);
        TableId(idx)
    }

    pub fn new_lua_closure(
        &mut self,
        proto: Rc<Proto>,
        upvals: Vec<UpvalueId>,
        env: TableId,
    ) -> ClosureId {
        let size = (64 + upvals.len() * 8) as u32;
        let idx = self.pool.closures.alloc(
            Closure::Lua(LuaClosure { proto, upvals, env }),
            self.gc.current_white,
            size,
        );
        self.gc.track_allocation(size as usize);
        ClosureId(idx)
    }

    pub fn new_native_closure(
        &mut self,
        f: CFunction,
        upvals: Vec<LuaValue>,
        env: TableId,
    ) -> ClosureId {
        let size = (64 + upvals.len() * 16) as u32;
        let idx = self.pool.closures.alloc(
            Closure::Native(NativeClosure { f, upvals, env }),
            self.gc.current_white,
            size,
        );
        self.gc.track_allocation(size as usize);
        ClosureId(idx)
    }

    pub fn new_userdata(&mut self, len: usize, env: TableId) -> UserdataId {
        let size = (64 + len) as u32;
        let idx = self
            .pool
            .userdata
            .alloc(Userdata::new(len, env), self.gc.current_white, size);
        self.gc.track_allocation(size as usize);
        UserdataId(idx)
    }

    pub fn new_thread(&mut self) -> ThreadId {
        let env = self.pool.thread(self.current).env;
        let idx = self
            .pool
            .threads
            .alloc(LuaThread::new(env), self.gc.current_white, 1024);
        self.gc.track_allocation(1024);
        ThreadId(idx)
    }

    /// Wrap a compiled proto in a closure ready to call, environment set
    /// to the current thread's globals.
    pub fn proto_closure(&mut self, proto: Rc<Proto>) -> LuaValue {
        let env = self.pool.thread(self.current).env;
        LuaValue::Function(self.new_lua_closure(proto, Vec::new(), env))
    }

    // ---- current thread access ----

    #[inline(always)]
    pub fn thr(&self) -> &LuaThread {
        self.pool.thread(self.current)
    }

    #[inline(always)]
    pub fn thr_mut(&mut self) -> &mut LuaThread {
        self.pool.thread_mut(self.current)
    }

    #[inline(always)]
    pub fn main_thread(&self) -> ThreadId {
        self.main
    }

    #[inline(always)]
    pub fn current_thread(&self) -> ThreadId {
        self.current
    }

    #[inline(always)]
    pub fn stack_get(&self, i: usize) -> LuaValue {
        self.thr().stack[i]
    }

    #[inline(always)]
    pub fn stack_set(&mut self, i: usize, v: LuaValue) {
        #[cfg(debug_assertions)]
        {
            let ow = crate::gc::other_white(self.gc.current_white);
            debug_assert!(
                self.pool.check_liveness(&v, ow),
                "dead value written to stack slot {i}"
            );
        }
        self.thr_mut().stack[i] = v;
    }

    /// Grow the current thread's stack or fail with "stack overflow".
    pub fn ensure_stack(&mut self, needed: usize) -> LuaResult<()> {
        let max = self.options.max_stack;
        if self.thr_mut().ensure_stack(needed, max) {
            Ok(())
        } else {
            Err(self.error("stack overflow"))
        }
    }

    // ---- upvalues ----

    pub fn find_or_create_upvalue(&mut self, index: usize) -> UpvalueId {
        let (id, created) = self
            .pool
            .find_or_create_upvalue(self.current, index, self.gc.current_white);
        if created > 0 {
            self.gc.track_allocation(created);
        }
        id
    }

    /// Close every open upvalue of the current thread at or above
    /// `level`: the captured value moves inline and the cell becomes
    /// independent of the stack.
    pub fn close_upvalues(&mut self, level: usize) {
        let co = self.current;
        let taken = self.pool.thread_mut(co).take_open_upvalues_from(level);
        for (index, uv) in taken {
            let v = self.pool.thread(co).stack[index];
            *self.pool.upvalue_mut(uv) = Upvalue::Closed(v);
            self.forward_barrier(GcRef::Upvalue(uv), &v);
        }
    }

    // ---- raw table access with barriers ----

    pub fn raw_get(&self, t: TableId, key: &LuaValue) -> LuaValue {
        self.pool.table(t).get(key, &self.pool.strings)
    }

    pub fn raw_geti(&self, t: TableId, i: i64) -> LuaValue {
        self.pool.table(t).get_int(i, &self.pool.strings)
    }

    pub fn raw_set(&mut self, t: TableId, key: LuaValue, val: LuaValue) -> LuaResult<()> {
        let (tbl, strs) = self.pool.table_and_strings(t);
        match tbl.set(key, val, strs) {
            Ok(()) => {
                self.gc.barrier_back(t, &mut self.pool);
                Ok(())
            }
            Err(TableError::NilKey) => Err(self.error("table index is nil")),
            Err(TableError::NanKey) => Err(self.error("table index is NaN")),
            Err(TableError::InvalidNext) => Err(self.error("invalid key to 'next'")),
        }
    }

    pub fn raw_seti(&mut self, t: TableId, i: i64, val: LuaValue) {
        let (tbl, strs) = self.pool.table_and_strings(t);
        tbl.set_int(i, val, strs);
        self.gc.barrier_back(t, &mut self.pool);
    }

    pub fn globals(&self) -> TableId {
        self.globals
    }

    pub fn registry(&self) -> TableId {
        self.registry
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        let key = self.new_string_value(name);
        let globals = self.globals;
        let _ = self.raw_set(globals, key, value);
    }

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = self.new_string_value(name);
        self.raw_get(self.globals, &key)
    }

    // ---- barriers ----

    pub fn forward_barrier(&mut self, parent: GcRef, child: &LuaValue) {
        if let Some(c) = ObjectPool::value_ref(child) {
            self.gc.barrier_forward(parent, c, &mut self.pool);
        }
    }

    // ---- errors ----

    /// Position prefix "source:line:" of the innermost Lua frame.
    pub(crate) fn where_prefix(&self) -> String {
        let th = self.thr();
        for depth in (0..th.ci_depth).rev() {
            let ci = &th.ci[depth];
            if !ci.is_lua() {
                continue;
            }
            if let LuaValue::Function(cid) = th.stack[ci.func] {
                if let Closure::Lua(lc) = self.pool.closure(cid) {
                    let pc = ci.saved_pc.saturating_sub(1) as usize;
                    let line = lc.proto.line_at(pc);
                    return format!("{}:{}: ", chunk_id(&lc.proto.source), line);
                }
            }
            break;
        }
        String::new()
    }

    /// Raise a runtime error with a located message. Used as
    /// `return Err(self.error(...))` so control flow stays visible.
    pub fn error(&mut self, msg: impl AsRef<str>) -> LuaError {
        let full = format!("{}{}", self.where_prefix(), msg.as_ref());
        debug!(message = %full, "runtime error");
        self.error_value = self.new_string_value(&full);
        LuaError::Runtime
    }

    /// Raise with an arbitrary error object, no message decoration.
    pub fn raise_value(&mut self, v: LuaValue) -> LuaError {
        self.error_value = v;
        LuaError::Runtime
    }

    pub fn type_error(&mut self, v: &LuaValue, op: &str) -> LuaError {
        let tn = v.type_name();
        self.error(format!("attempt to {op} a {tn} value"))
    }

    /// Take the in-flight error object, leaving nil behind.
    pub fn take_error_value(&mut self) -> LuaValue {
        std::mem::replace(&mut self.error_value, LuaValue::Nil)
    }

    pub fn set_panic(&mut self, f: Option<PanicFn>) {
        self.panic = f;
    }

    /// Render a value the way error reporting does, without invoking
    /// metamethods.
    pub fn display_value(&self, v: &LuaValue) -> String {
        match v {
            LuaValue::Nil => "nil".to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            LuaValue::Number(n) => number_to_str(*n),
            LuaValue::String(id) => self.pool.string(*id).to_display().into_owned(),
            LuaValue::Table(id) => format!("table: 0x{:08x}", id.index()),
            LuaValue::Function(id) => format!("function: 0x{:08x}", id.index()),
            LuaValue::Userdata(id) => format!("userdata: 0x{:08x}", id.index()),
            LuaValue::Thread(id) => format!("thread: 0x{:08x}", id.index()),
            LuaValue::LightUserdata(p) => format!("userdata: 0x{:08x}", p),
        }
    }

    /// Convert a caught error kind into the host-facing error carrying
    /// the rendered error object.
    pub fn into_full_error(&mut self, kind: LuaError) -> LuaFullError {
        let obj = self.take_error_value();
        LuaFullError {
            kind,
            message: self.display_value(&obj),
        }
    }

    // ---- collector driving ----

    fn gc_roots(&self) -> GcRoots {
        let mut values = vec![
            LuaValue::Table(self.globals),
            LuaValue::Table(self.registry),
            LuaValue::Thread(self.main),
            LuaValue::Thread(self.current),
        ];
        for mt in self.type_mts.iter().flatten() {
            values.push(LuaValue::Table(*mt));
        }
        GcRoots { values }
    }

    /// Allocation-site check: run a step once the pacing debt is due.
    #[inline]
    pub fn check_gc(&mut self) {
        if self.gc.should_step() {
            self.gc_step();
        }
    }

    /// One increment of collection, sized by the step multiplier.
    pub fn gc_step(&mut self) {
        let mut lim = (GC_STEP_SIZE / 100) * self.gc.step_mul.max(1) as usize;
        self.gc.dept += self.gc.total_bytes.saturating_sub(self.gc.threshold);
        loop {
            let roots = self.gc_roots();
            match self.gc.single_step(&roots, &mut self.pool) {
                StepWork::Work(w) | StepWork::Atomic(w) => {
                    lim = lim.saturating_sub(w);
                }
                StepWork::NeedFinalizer(id) => {
                    self.run_finalizer(id);
                    lim = lim.saturating_sub(GC_FINALIZE_COST);
                }
                StepWork::Paused => {
                    self.buffer.reset();
                    return;
                }
            }
            if lim == 0 {
                break;
            }
        }
        // cycle unfinished: push the threshold forward, paying down debt
        if self.gc.dept < GC_STEP_SIZE {
            self.gc.threshold = self.gc.total_bytes + GC_STEP_SIZE;
        } else {
            self.gc.dept -= GC_STEP_SIZE;
            self.gc.threshold = self.gc.total_bytes;
        }
    }

    fn run_to_pause(&mut self) {
        loop {
            let roots = self.gc_roots();
            match self.gc.single_step(&roots, &mut self.pool) {
                StepWork::NeedFinalizer(id) => self.run_finalizer(id),
                StepWork::Paused => {
                    self.buffer.reset();
                    return;
                }
                _ => {}
            }
        }
    }

    /// Run the machine through to the next PAUSE: finish any cycle in
    /// flight, then one complete fresh cycle.
    pub fn gc_full(&mut self) {
        if self.gc.state != GcState::Pause {
            self.run_to_pause();
        }
        self.run_to_pause();
    }

    /// Invoke `__gc` on a resurrected userdata. Errors are swallowed
    /// (the collector must keep making progress) and nested collection
    /// is disabled for the duration.
    fn run_finalizer(&mut self, id: UserdataId) {
        let Some(mt) = self.pool.userdata_ref(id).metatable else {
            return;
        };
        let gc_name = LuaValue::String(self.tm_names[TmKind::Gc as usize]);
        let handler = self.raw_get(mt, &gc_name);
        if handler.is_nil() {
            return;
        }
        let was_running = self.gc.running;
        self.gc.running = false;
        self.nny += 1;

        let top = self.thr().top;
        let result = self
            .ensure_stack(top + 2)
            .and_then(|_| {
                let th = self.thr_mut();
                th.push(handler);
                th.push(LuaValue::Userdata(id));
                self.d_call(top, 0)
            });
        if let Err(e) = result {
            let obj = self.take_error_value();
            debug!(kind = ?e, object = %self.display_value(&obj), "error in __gc finalizer");
        }
        self.thr_mut().top = top;

        self.nny -= 1;
        self.gc.running = was_running;
    }

    // ---- type metatables ----

    pub fn type_metatable(&self, tag: u8) -> Option<TableId> {
        self.type_mts[tag as usize]
    }

    pub fn set_type_metatable(&mut self, tag: u8, mt: Option<TableId>) {
        self.type_mts[tag as usize] = mt;
    }
}
