// Thread (coroutine) execution state: an independent value stack and
// CallInfo array sharing the global state with every other thread.

use ahash::RandomState;
use bitflags::bitflags;
use std::collections::HashMap;

use crate::gc::{TableId, UpvalueId};
use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::CallInfo;
use crate::lua_vm::limits::{BASIC_CI_SIZE, BASIC_STACK_SIZE, EXTRA_STACK};
use crate::lua_vm::{LuaResult, LuaVm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Currently executing.
    Running,
    /// Not started, or stopped at a yield.
    Suspended,
    /// Resumed another coroutine and is waiting for it.
    Normal,
    /// Finished or died with an error; cannot be resumed.
    Dead,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HookMask: u8 {
        const CALL  = 1 << 0;
        const RET   = 1 << 1;
        const LINE  = 1 << 2;
        const COUNT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    TailReturn,
    Line(u32),
    Count,
}

/// Host-registered debug hook. A hook may raise `LuaError::Yield`; the
/// executor saves its position first, so the thread resumes at the next
/// instruction.
pub type HookFn = fn(&mut LuaVm, HookEvent) -> LuaResult<()>;

pub struct LuaThread {
    /// Value stack. Physically grown on demand, logically delimited by
    /// `top`; slots above `top` are dead and may hold stale bits.
    pub stack: Vec<LuaValue>,
    /// One past the last live slot.
    pub top: usize,
    /// Frame records; `ci_depth` is the number of active entries and
    /// entries above it are reusable garbage.
    pub ci: Vec<CallInfo>,
    pub ci_depth: usize,
    pub status: ThreadStatus,
    /// Globals table for chunks started on this thread.
    pub env: TableId,
    /// Open upvalues pointing into this stack as (stack index, id),
    /// sorted by descending stack index so closing a suffix is a prefix
    /// traversal.
    pub open_upvals: Vec<(usize, UpvalueId)>,
    /// Stack index -> open upvalue, for O(1) find.
    pub open_map: HashMap<usize, UpvalueId, RandomState>,

    pub hook_mask: HookMask,
    pub hook: Option<HookFn>,
    pub hook_count: i32,
    pub base_hook_count: i32,
    /// Last line reported to the line hook.
    pub last_hook_line: u32,
}

impl LuaThread {
    pub fn new(env: TableId) -> Self {
        LuaThread {
            stack: vec![LuaValue::Nil; BASIC_STACK_SIZE],
            top: 0,
            ci: Vec::with_capacity(BASIC_CI_SIZE),
            ci_depth: 0,
            status: ThreadStatus::Suspended,
            env,
            open_upvals: Vec::new(),
            open_map: HashMap::with_hasher(RandomState::new()),
            hook_mask: HookMask::empty(),
            hook: None,
            hook_count: 0,
            base_hook_count: 0,
            last_hook_line: 0,
        }
    }

    /// Grow the physical stack so `needed` slots are addressable, plus
    /// reserved headroom. Returns false at the hard ceiling.
    #[must_use]
    pub fn ensure_stack(&mut self, needed: usize, max: usize) -> bool {
        let wanted = needed + EXTRA_STACK;
        if wanted <= self.stack.len() {
            return true;
        }
        if needed > max {
            return false;
        }
        // double on demand, clamped to the ceiling plus headroom
        let mut new_len = (self.stack.len() * 2).max(wanted);
        new_len = new_len.min(max + EXTRA_STACK);
        self.stack.resize(new_len, LuaValue::Nil);
        true
    }

    #[inline(always)]
    pub fn current_ci(&self) -> &CallInfo {
        &self.ci[self.ci_depth - 1]
    }

    #[inline(always)]
    pub fn current_ci_mut(&mut self) -> &mut CallInfo {
        &mut self.ci[self.ci_depth - 1]
    }

    /// Push a frame, reusing a dead entry when one exists.
    pub fn push_frame(&mut self, frame: CallInfo) {
        if self.ci_depth < self.ci.len() {
            self.ci[self.ci_depth] = frame;
        } else {
            self.ci.push(frame);
        }
        self.ci_depth += 1;
    }

    #[inline]
    pub fn pop_frame(&mut self) {
        debug_assert!(self.ci_depth > 0);
        self.ci_depth -= 1;
    }

    #[inline]
    pub fn push(&mut self, v: LuaValue) {
        self.stack[self.top] = v;
        self.top += 1;
    }

    /// Record a new open upvalue for `index`, keeping the list sorted by
    /// descending stack index. At most one open upvalue exists per slot.
    pub fn link_open_upvalue(&mut self, index: usize, id: UpvalueId) {
        debug_assert!(!self.open_map.contains_key(&index));
        let pos = self.open_upvals.partition_point(|&(i, _)| i > index);
        self.open_upvals.insert(pos, (index, id));
        self.open_map.insert(index, id);
    }

    #[inline]
    pub fn find_open_upvalue(&self, index: usize) -> Option<UpvalueId> {
        self.open_map.get(&index).copied()
    }

    /// Unlink every open upvalue at `level` or above, returning them in
    /// descending stack order for the caller to close.
    pub fn take_open_upvalues_from(&mut self, level: usize) -> Vec<(usize, UpvalueId)> {
        let mut taken = Vec::new();
        while let Some(&(index, id)) = self.open_upvals.first() {
            if index < level {
                break;
            }
            self.open_upvals.remove(0);
            self.open_map.remove(&index);
            taken.push((index, id));
        }
        taken
    }
}
