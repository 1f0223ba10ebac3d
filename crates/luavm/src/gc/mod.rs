// Incremental tri-color mark-and-sweep collector.
//
// State machine, one full cycle:
//
//   Pause -> Propagate -> (atomic) -> SweepString -> Sweep -> Finalize -> Pause
//
// Marking runs interleaved with the mutator in bounded steps; the atomic
// transition between marking and sweeping re-scans everything the
// mutator may have touched (thread stacks, barrier-backed tables, open
// upvalues), separates finalizable userdata, clears weak-table entries
// and flips the current white. Sweeping then walks the arenas behind a
// cursor, freeing objects that still carry the old white.
//
// Invariant maintained everywhere outside the atomic step: a black
// object never references a white one. Two write barriers protect it:
// a forward barrier for single-slot containers (upvalues, closures,
// userdata) that marks the stored child, and a backward barrier for
// tables that re-grays the table and queues it for the atomic re-scan.

mod header;
mod pool;
mod string_table;

pub use header::{GcHeader, Mark, other_white, white_bit};
pub use pool::{
    Arena, ClosureId, GcBox, GcRef, ObjectPool, StringId, TableId, ThreadId, UpvalueId, UserdataId,
};
pub use string_table::StringTable;

use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::lua_value::{Closure, LuaValue, Proto, Upvalue};
use crate::lua_vm::limits::{GC_SWEEP_MAX, GC_PAUSE, GC_STEP_MUL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    SweepString,
    Sweep,
    Finalize,
}

/// What one unit of collector work did, for the pacing loop.
pub enum StepWork {
    Work(usize),
    /// The atomic step ran; marking is complete.
    Atomic(usize),
    /// A finalizable userdata is ready; the caller must run its `__gc`
    /// (the collector cannot re-enter the interpreter itself).
    NeedFinalizer(UserdataId),
    /// Cycle complete.
    Paused,
}

/// Root set snapshot handed to every step.
pub struct GcRoots {
    pub values: Vec<LuaValue>,
}

pub struct Gc {
    pub state: GcState,
    pub current_white: u8,

    gray: Vec<GcRef>,
    grayagain: Vec<GcRef>,
    /// Weak tables found during marking, visited after the atomic mark.
    weak: Vec<TableId>,
    /// Userdata awaiting finalization, FIFO.
    tmudata: VecDeque<UserdataId>,

    /// Bytes currently charged to the allocator.
    pub total_bytes: usize,
    /// Allocation level that triggers the next step.
    pub threshold: usize,
    /// Live-byte estimate taken at the atomic step.
    pub estimate: usize,
    /// Accumulated debt: bytes allocated past the threshold.
    pub dept: usize,
    pub pause: i32,
    pub step_mul: i32,
    pub running: bool,

    sweep_str: usize,
    sweep_kind: usize,
    sweep_idx: usize,

    /// Pre-interned "__gc" and "__mode", fixed for the state's lifetime.
    pub tm_gc: Option<StringId>,
    pub tm_mode: Option<StringId>,
}

impl Gc {
    pub fn new() -> Self {
        Gc {
            state: GcState::Pause,
            current_white: 0,
            gray: Vec::with_capacity(64),
            grayagain: Vec::with_capacity(16),
            weak: Vec::new(),
            tmudata: VecDeque::new(),
            total_bytes: 0,
            threshold: 4 * 1024,
            estimate: 0,
            dept: 0,
            pause: GC_PAUSE,
            step_mul: GC_STEP_MUL,
            running: true,
            sweep_str: 0,
            sweep_kind: 0,
            sweep_idx: 0,
            tm_gc: None,
            tm_mode: None,
        }
    }

    // ---- allocation accounting ----

    #[inline]
    pub fn track_allocation(&mut self, size: usize) {
        self.total_bytes += size;
    }

    #[inline]
    pub fn note_free(&mut self, size: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(size);
    }

    #[inline]
    pub fn should_step(&self) -> bool {
        self.running && self.total_bytes >= self.threshold
    }

    /// True while marking: barriers must fix the child, not the parent.
    #[inline]
    pub fn keep_invariant(&self) -> bool {
        self.state == GcState::Propagate
    }

    pub fn take_finalizable(&mut self) -> Option<UserdataId> {
        self.tmudata.pop_front()
    }

    pub fn has_pending_finalizers(&self) -> bool {
        !self.tmudata.is_empty()
    }

    // ---- marking ----

    pub fn mark_value(&mut self, v: &LuaValue, pool: &mut ObjectPool) {
        if let Some(r) = ObjectPool::value_ref(v) {
            self.mark_ref(r, pool);
        }
    }

    pub fn mark_ref(&mut self, r: GcRef, pool: &mut ObjectPool) {
        let header = pool.header_of_mut(r);
        if !header.is_white() {
            return;
        }
        match r {
            GcRef::String(_) => {
                // leaves: no deferred children
                header.make_black();
            }
            GcRef::Userdata(id) => {
                header.make_black();
                let (mt, env) = {
                    let ud = pool.userdata_ref(id);
                    (ud.metatable, ud.env)
                };
                if let Some(mt) = mt {
                    self.mark_ref(GcRef::Table(mt), pool);
                }
                self.mark_ref(GcRef::Table(env), pool);
            }
            _ => {
                header.make_gray();
                self.gray.push(r);
            }
        }
    }

    fn propagate_one(&mut self, pool: &mut ObjectPool) -> usize {
        match self.gray.pop() {
            Some(r) => self.traverse_ref(r, pool),
            None => 0,
        }
    }

    fn propagate_all(&mut self, pool: &mut ObjectPool) {
        while !self.gray.is_empty() {
            self.propagate_one(pool);
        }
    }

    fn traverse_ref(&mut self, r: GcRef, pool: &mut ObjectPool) -> usize {
        let work = pool.header_of(r).size as usize;
        match r {
            GcRef::Table(id) => self.traverse_table(id, pool),
            GcRef::Closure(id) => self.traverse_closure(id, pool),
            GcRef::Upvalue(id) => self.traverse_upvalue(id, pool),
            GcRef::Thread(id) => self.traverse_thread(id, pool),
            // strings and userdata never enter the gray list
            GcRef::String(_) | GcRef::Userdata(_) => {}
        }
        work
    }

    fn traverse_table(&mut self, id: TableId, pool: &mut ObjectPool) {
        let (mt, entries) = {
            let t = pool.table(id);
            (t.metatable, t.gc_entries())
        };

        // weakness comes from the metatable's __mode string, latched on
        // the header for the cleanup pass
        let mut weak_k = false;
        let mut weak_v = false;
        if let (Some(mt_id), Some(mode_key)) = (mt, self.tm_mode) {
            let mode = pool
                .table(mt_id)
                .get(&LuaValue::String(mode_key), &pool.strings);
            if let LuaValue::String(s) = mode {
                let bytes = pool.string(s).as_bytes();
                weak_k = bytes.contains(&b'k');
                weak_v = bytes.contains(&b'v');
            }
        }
        {
            let h = pool.tables.header_mut(id.index());
            h.clear_weak_bits();
            if weak_k {
                h.marked.insert(Mark::WEAKKEY);
            }
            if weak_v {
                h.marked.insert(Mark::WEAKVALUE);
            }
            h.make_black();
        }
        if (weak_k || weak_v) && !self.weak.contains(&id) {
            self.weak.push(id);
        }

        if let Some(mt_id) = mt {
            self.mark_ref(GcRef::Table(mt_id), pool);
        }
        if weak_k && weak_v {
            return; // ephemeral content: nothing keeps anything alive
        }
        for (k, v) in &entries {
            if !weak_k {
                self.mark_value(k, pool);
            }
            if !weak_v {
                self.mark_value(v, pool);
            }
        }
    }

    fn traverse_closure(&mut self, id: ClosureId, pool: &mut ObjectPool) {
        enum Parts {
            Lua(crate::gc::TableId, Vec<UpvalueId>, std::rc::Rc<Proto>),
            Native(crate::gc::TableId, Vec<LuaValue>),
        }
        let parts = match pool.closure(id) {
            Closure::Lua(c) => Parts::Lua(c.env, c.upvals.clone(), c.proto.clone()),
            Closure::Native(c) => Parts::Native(c.env, c.upvals.clone()),
        };
        pool.closures.header_mut(id.index()).make_black();
        match parts {
            Parts::Lua(env, upvals, proto) => {
                self.mark_ref(GcRef::Table(env), pool);
                for uv in upvals {
                    self.mark_ref(GcRef::Upvalue(uv), pool);
                }
                self.mark_proto(&proto, pool);
            }
            Parts::Native(env, upvals) => {
                self.mark_ref(GcRef::Table(env), pool);
                for v in &upvals {
                    self.mark_value(v, pool);
                }
            }
        }
    }

    /// Protos are shared behind `Rc` and reached only through closures;
    /// their string constants still have to be kept alive.
    fn mark_proto(&mut self, proto: &Proto, pool: &mut ObjectPool) {
        for k in &proto.constants {
            self.mark_value(k, pool);
        }
        for child in &proto.protos {
            self.mark_proto(child, pool);
        }
    }

    fn traverse_upvalue(&mut self, id: UpvalueId, pool: &mut ObjectPool) {
        let closed = match pool.upvalue(id) {
            Upvalue::Open { .. } => None,
            Upvalue::Closed(v) => Some(*v),
        };
        match closed {
            Some(v) => {
                pool.upvalues.header_mut(id.index()).make_black();
                self.mark_value(&v, pool);
            }
            None => {
                // stays gray: the referenced value lives on a stack the
                // mutator keeps writing; the atomic remark catches it
            }
        }
    }

    fn traverse_thread(&mut self, id: ThreadId, pool: &mut ObjectPool) {
        let (values, env, upvals, lim, top) = {
            let th = pool.thread(id);
            let mut lim = th.top;
            for i in 0..th.ci_depth {
                lim = lim.max(th.ci[i].top);
            }
            let values: Vec<LuaValue> = th.stack[..th.top].to_vec();
            let upvals: Vec<UpvalueId> = th.open_upvals.iter().map(|&(_, id)| id).collect();
            (values, th.env, upvals, lim, th.top)
        };
        for v in &values {
            self.mark_value(v, pool);
        }
        self.mark_ref(GcRef::Table(env), pool);
        for uv in upvals {
            self.mark_ref(GcRef::Upvalue(uv), pool);
        }
        {
            // clear the dead zone between the logical top and the frame
            // limit so stale slots cannot leak old references
            let th = pool.thread_mut(id);
            let end = lim.min(th.stack.len());
            for slot in &mut th.stack[top..end] {
                *slot = LuaValue::Nil;
            }
        }
        pool.threads.header_mut(id.index()).make_black();
        if self.state == GcState::Propagate {
            // stacks mutate between steps with no barrier: re-scan at
            // the atomic step
            self.grayagain.push(GcRef::Thread(id));
        }
    }

    // ---- cycle driver ----

    fn restart_collection(&mut self, roots: &GcRoots, pool: &mut ObjectPool) {
        trace!(total_bytes = self.total_bytes, "gc cycle start");
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        for v in &roots.values {
            self.mark_value(v, pool);
        }
        self.state = GcState::Propagate;
    }

    fn atomic(&mut self, roots: &GcRoots, pool: &mut ObjectPool) -> usize {
        let mut work = 0usize;
        for v in &roots.values {
            self.mark_value(v, pool);
        }
        work += self.remark_open_upvalues(pool);
        self.propagate_all(pool);

        // everything the mutator touched since its first scan
        let again = std::mem::take(&mut self.grayagain);
        work += again.len();
        for r in again {
            self.traverse_ref(r, pool);
        }
        self.propagate_all(pool);

        work += self.separate_finalizable(pool);
        self.propagate_all(pool);

        work += self.clear_weak_tables(pool);

        self.current_white = other_white(self.current_white);
        self.estimate = self.total_bytes;
        self.sweep_str = 0;
        self.sweep_kind = 0;
        self.sweep_idx = 0;
        self.state = GcState::SweepString;
        debug!(
            estimate = self.estimate,
            finalizable = self.tmudata.len(),
            "gc atomic complete"
        );
        work
    }

    /// An open upvalue that survives marking refers into some thread's
    /// stack; if that thread is dead its stack was never traversed, so
    /// the referenced value must be marked here.
    fn remark_open_upvalues(&mut self, pool: &mut ObjectPool) -> usize {
        let mut slots: Vec<(ThreadId, usize)> = Vec::new();
        for (_, boxed) in pool.upvalues.iter() {
            if !boxed.header.is_white() {
                if let Upvalue::Open { thread, index } = boxed.data {
                    slots.push((thread, index));
                }
            }
        }
        let n = slots.len();
        for (thread, index) in slots {
            if pool.threads.contains(thread.index()) {
                let v = pool.thread(thread).stack.get(index).copied();
                if let Some(v) = v {
                    self.mark_value(&v, pool);
                }
            }
        }
        n
    }

    /// Move every white userdata with a `__gc` metamethod into the
    /// finalization queue and resurrect it for this cycle.
    fn separate_finalizable(&mut self, pool: &mut ObjectPool) -> usize {
        let Some(tm_gc) = self.tm_gc else { return 0 };
        let mut pending: Vec<UserdataId> = Vec::new();
        for (idx, boxed) in pool.userdata.iter() {
            if boxed.header.is_white() && !boxed.header.is_finalized() {
                if let Some(mt) = boxed.data.metatable {
                    let has_gc = !pool
                        .table(mt)
                        .get(&LuaValue::String(tm_gc), &pool.strings)
                        .is_nil();
                    if has_gc {
                        pending.push(UserdataId(idx));
                    }
                }
            }
        }
        let n = pending.len();
        for id in pending {
            pool.userdata.header_mut(id.index()).set_finalized();
            self.tmudata.push_back(id);
            self.mark_ref(GcRef::Userdata(id), pool);
        }
        n
    }

    /// Is a weak-table entry's referent gone? Strings are never weak
    /// (they are remarked instead); finalized userdata counts as gone in
    /// value position but not in key position.
    fn entry_cleared(&mut self, v: &LuaValue, is_key: bool, pool: &mut ObjectPool) -> bool {
        let Some(r) = ObjectPool::value_ref(v) else {
            return false;
        };
        match r {
            GcRef::String(_) => {
                self.mark_ref(r, pool);
                false
            }
            GcRef::Userdata(_) => {
                let h = pool.header_of(r);
                h.is_white() || (h.is_finalized() && !is_key)
            }
            _ => pool.header_of(r).is_white(),
        }
    }

    fn clear_weak_tables(&mut self, pool: &mut ObjectPool) -> usize {
        let weak = std::mem::take(&mut self.weak);
        let mut work = 0usize;
        for tid in weak {
            if !pool.tables.contains(tid.index()) {
                continue;
            }
            let h = pool.tables.header(tid.index());
            let (weak_k, weak_v) = (h.is_key_weak(), h.is_value_weak());

            if weak_v {
                let alen = pool.table(tid).array_len();
                for i in 0..alen {
                    let v = pool.table(tid).array_value(i);
                    if !v.is_nil() && self.entry_cleared(&v, false, pool) {
                        pool.table_mut(tid).clear_array_slot(i);
                    }
                    work += 1;
                }
            }
            let nlen = pool.table(tid).node_len();
            for pos in 0..nlen {
                let entry = pool.table(tid).node_entry(pos);
                if let Some((k, v)) = entry {
                    let kill = (weak_k && self.entry_cleared(&k, true, pool))
                        || (weak_v && self.entry_cleared(&v, false, pool));
                    if kill {
                        pool.table_mut(tid).clear_node_entry(pos);
                    }
                }
                work += 1;
            }
        }
        work
    }

    fn sweep_strings_step(&mut self, pool: &mut ObjectPool) -> usize {
        let ow = other_white(self.current_white);
        let total = pool.strings.slot_count();
        let end = (self.sweep_str + GC_SWEEP_MAX).min(total);
        let mut swept = 0;
        for idx in self.sweep_str..end {
            if !pool.strings.contains(idx as u32) {
                continue;
            }
            let h = pool.strings.header(idx as u32);
            if h.is_dead(ow) && !h.is_fixed() {
                let freed = pool.remove_string(StringId(idx as u32));
                self.note_free(freed);
            } else {
                pool.strings
                    .header_mut(idx as u32)
                    .make_white(self.current_white);
            }
            swept += 1;
        }
        self.sweep_str = end;
        if self.sweep_str >= total {
            self.state = GcState::Sweep;
            self.sweep_kind = 0;
            self.sweep_idx = 0;
        }
        swept
    }

    fn sweep_step(&mut self, pool: &mut ObjectPool) -> usize {
        let ow = other_white(self.current_white);
        let cw = self.current_white;
        let mut budget = GC_SWEEP_MAX;

        while budget > 0 {
            let total = match self.sweep_kind {
                0 => pool.tables.slot_count(),
                1 => pool.closures.slot_count(),
                2 => pool.upvalues.slot_count(),
                3 => pool.userdata.slot_count(),
                4 => pool.threads.slot_count(),
                _ => {
                    self.state = GcState::Finalize;
                    return GC_SWEEP_MAX - budget;
                }
            };
            if self.sweep_idx >= total {
                self.sweep_kind += 1;
                self.sweep_idx = 0;
                continue;
            }
            let idx = self.sweep_idx as u32;
            self.sweep_idx += 1;
            budget -= 1;

            let freed = match self.sweep_kind {
                0 => Self::sweep_slot(&mut pool.tables, idx, ow, cw),
                1 => Self::sweep_slot(&mut pool.closures, idx, ow, cw),
                2 => Self::sweep_slot(&mut pool.upvalues, idx, ow, cw),
                3 => Self::sweep_slot(&mut pool.userdata, idx, ow, cw),
                4 => {
                    // a dying thread closes every upvalue it still owns
                    if pool.threads.contains(idx) {
                        let h = pool.threads.header(idx);
                        if h.is_dead(ow) && !h.is_fixed() {
                            self.close_thread_upvalues(ThreadId(idx), pool);
                        }
                    }
                    Self::sweep_slot(&mut pool.threads, idx, ow, cw)
                }
                _ => 0,
            };
            self.note_free(freed);
        }
        GC_SWEEP_MAX
    }

    fn sweep_slot<T>(arena: &mut Arena<T>, idx: u32, ow: u8, cw: u8) -> usize {
        if !arena.contains(idx) {
            return 0;
        }
        let h = arena.header(idx);
        if h.is_dead(ow) && !h.is_fixed() {
            arena.free(idx)
        } else {
            arena.header_mut(idx).make_white(cw);
            0
        }
    }

    /// Close the open upvalues of a thread about to be freed, copying
    /// the stack values inline so surviving closures keep working.
    fn close_thread_upvalues(&mut self, id: ThreadId, pool: &mut ObjectPool) {
        let taken = pool.thread_mut(id).take_open_upvalues_from(0);
        for (index, uv) in taken {
            let v = pool
                .thread(id)
                .stack
                .get(index)
                .copied()
                .unwrap_or(LuaValue::Nil);
            if pool.upvalues.contains(uv.index()) {
                *pool.upvalue_mut(uv) = Upvalue::Closed(v);
            }
        }
    }

    /// One bounded unit of collection. Finalizers are reported, not run:
    /// the interpreter must call them.
    pub fn single_step(&mut self, roots: &GcRoots, pool: &mut ObjectPool) -> StepWork {
        match self.state {
            GcState::Pause => {
                self.restart_collection(roots, pool);
                StepWork::Work(1)
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    let w = self.atomic(roots, pool);
                    StepWork::Atomic(w)
                } else {
                    StepWork::Work(self.propagate_one(pool))
                }
            }
            GcState::SweepString => StepWork::Work(self.sweep_strings_step(pool)),
            GcState::Sweep => StepWork::Work(self.sweep_step(pool)),
            GcState::Finalize => match self.tmudata.pop_front() {
                Some(id) => {
                    // resurrected for exactly this cycle: back to the
                    // live white, finalized bit stays set
                    if pool.userdata.contains(id.index()) {
                        pool.userdata
                            .header_mut(id.index())
                            .make_white(self.current_white);
                        StepWork::NeedFinalizer(id)
                    } else {
                        StepWork::Work(1)
                    }
                }
                None => {
                    self.state = GcState::Pause;
                    self.set_pause_threshold();
                    trace!(
                        total_bytes = self.total_bytes,
                        threshold = self.threshold,
                        "gc cycle end"
                    );
                    StepWork::Paused
                }
            },
        }
    }

    /// Next cycle starts when allocations reach `estimate * pause%`.
    pub fn set_pause_threshold(&mut self) {
        let base = self.estimate.max(1024);
        self.threshold = base / 100 * self.pause.max(10) as usize;
    }

    // ---- write barriers ----

    /// Forward barrier for non-table containers: never let a black
    /// parent point at a white child.
    pub fn barrier_forward(&mut self, parent: GcRef, child: GcRef, pool: &mut ObjectPool) {
        if !pool.header_of(parent).is_black() || !pool.header_of(child).is_white() {
            return;
        }
        if self.keep_invariant() {
            self.mark_ref(child, pool);
        } else {
            // sweeping: cheaper to make the parent collectable-looking
            // again than to chase the child
            pool.header_of_mut(parent).make_white(self.current_white);
        }
    }

    /// Backward barrier for tables: one table can take many stores per
    /// step, so re-gray it once and re-scan it at the atomic step.
    pub fn barrier_back(&mut self, t: TableId, pool: &mut ObjectPool) {
        let h = pool.tables.header_mut(t.index());
        if !h.is_black() {
            return;
        }
        h.make_gray();
        let r = GcRef::Table(t);
        if !self.grayagain.contains(&r) {
            self.grayagain.push(r);
        }
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}
