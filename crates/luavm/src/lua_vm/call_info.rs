// Per-frame call record. One entry per active function on a thread;
// entries are reused in place as the call depth moves up and down.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallStatus: u8 {
        /// Frame runs bytecode.
        const LUA = 1 << 0;
        /// Frame belongs to a native function.
        const NATIVE = 1 << 1;
        /// Frame was reused by at least one tail call.
        const TAIL = 1 << 2;
        /// Protected native frame (pcall/xpcall) that a yield passed
        /// through; the executor finishes it when the callee returns or
        /// recovers into it when an error unwinds.
        const YPCALL = 1 << 3;
        /// Native frame suspended by a yield; resume delivers its results.
        const YIELDED = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CallInfo {
    /// Absolute stack index of the function slot.
    pub func: usize,
    /// Absolute stack index of register 0.
    pub base: usize,
    /// One past the frame's register window.
    pub top: usize,
    /// Resume point for Lua frames.
    pub saved_pc: u32,
    /// Results the caller expects, or MULTRET.
    pub nresults: i32,
    /// Extra arguments beyond the declared parameters.
    pub n_varargs: usize,
    /// Tail calls that reused this frame (lost frames for tracebacks).
    pub tailcalls: u32,
    pub status: CallStatus,
    /// Absolute stack index of the xpcall handler, 0 = none.
    pub errfunc: usize,
}

impl CallInfo {
    pub fn is_lua(&self) -> bool {
        self.status.contains(CallStatus::LUA)
    }

    pub fn is_native(&self) -> bool {
        self.status.contains(CallStatus::NATIVE)
    }
}

impl Default for CallInfo {
    fn default() -> Self {
        CallInfo {
            func: 0,
            base: 0,
            top: 0,
            saved_pc: 0,
            nresults: 0,
            n_varargs: 0,
            tailcalls: 0,
            status: CallStatus::empty(),
            errfunc: 0,
        }
    }
}
