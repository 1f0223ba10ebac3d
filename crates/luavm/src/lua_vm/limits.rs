// Runtime limits and tuning constants.

/// Hard ceiling on a thread's value stack, in slots.
pub const MAX_STACK: usize = 15000;

/// Headroom kept above the stack top for metamethod argument marshaling.
pub const EXTRA_STACK: usize = 5;

/// Minimum register space guaranteed to a native function.
pub const MIN_STACK: usize = 20;

/// Initial stack size of a fresh thread.
pub const BASIC_STACK_SIZE: usize = 40;

/// Initial CallInfo capacity of a fresh thread.
pub const BASIC_CI_SIZE: usize = 8;

/// Ceiling on nested native re-entries of the executor.
pub const MAX_C_CALLS: usize = 200;

/// Bound on chained `__index`/`__newindex` hops.
pub const MAX_TAG_LOOP: usize = 100;

/// SETLIST batch size: elements flushed to the array part per block.
pub const FIELDS_PER_FLUSH: usize = 50;

/// "All results" marker for calls.
pub const MULTRET: i32 = -1;

// Collector tuning, percentages except the step size (bytes).
pub const GC_PAUSE: i32 = 200;
pub const GC_STEP_MUL: i32 = 200;
pub const GC_STEP_SIZE: usize = 1024;
pub const GC_SWEEP_MAX: usize = 40;
pub const GC_SWEEP_COST: usize = 10;
pub const GC_FINALIZE_COST: usize = 100;

/// Maximum length of a chunk id in error messages.
pub const ID_SIZE: usize = 60;

/// Configuration handed to [`crate::LuaVm::new`].
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub max_stack: usize,
    pub max_c_calls: usize,
    pub gc_pause: i32,
    pub gc_step_mul: i32,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            max_stack: MAX_STACK,
            max_c_calls: MAX_C_CALLS,
            gc_pause: GC_PAUSE,
            gc_step_mul: GC_STEP_MUL,
        }
    }
}
