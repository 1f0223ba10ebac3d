// The do-layer: frame setup and teardown, protected calls, coroutine
// transfer. Calls into Lua functions never recurse in Rust; they push a
// frame and let the dispatch loop switch context. Native functions run
// inline. Errors unwind as `Err`; the protected-call sites rebuild the
// thread state from saved depths.

use tracing::trace;

use crate::gc::ThreadId;
use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::{CallInfo, CallStatus};
use crate::lua_vm::limits::{MIN_STACK, MULTRET};
use crate::lua_vm::thread::{HookEvent, HookMask, ThreadStatus};
use crate::lua_vm::{LuaError, LuaResult, LuaVm, TmKind};

/// What `precall` did with the callee.
pub enum Precall {
    /// A Lua frame was pushed; the dispatch loop must enter it.
    Lua,
    /// A native function ran to completion, results already in place.
    Native,
}

/// A finished resume: the coroutine either stopped at a yield or
/// returned from its body.
#[derive(Debug)]
pub enum Resume {
    Yield(Vec<LuaValue>),
    Return(Vec<LuaValue>),
}

impl LuaVm {
    /// Prepare a call to the value at `func_idx` with the arguments
    /// between it and the current top.
    pub(crate) fn precall(&mut self, func_idx: usize, nresults: i32) -> LuaResult<Precall> {
        let mut func = self.stack_get(func_idx);

        if !matches!(func, LuaValue::Function(_)) {
            // __call: the original callee becomes argument 0 and the
            // handler is retried as the callee, one level only
            let tm = self.get_tm(&func, TmKind::Call);
            if !matches!(tm, LuaValue::Function(_)) {
                return Err(self.type_error(&func, "call"));
            }
            let top = self.thr().top;
            self.ensure_stack(top + 1)?;
            {
                let th = self.thr_mut();
                let mut i = top;
                while i > func_idx {
                    th.stack[i] = th.stack[i - 1];
                    i -= 1;
                }
                th.top = top + 1;
            }
            self.stack_set(func_idx, tm);
            func = tm;
        }

        let cid = match func {
            LuaValue::Function(id) => id,
            _ => unreachable!(),
        };

        if self.pool.closure(cid).is_lua() {
            let (num_params, is_vararg, max_stack) = {
                let lc = self
                    .pool
                    .closure(cid)
                    .as_lua()
                    .expect("lua closure");
                (
                    lc.proto.num_params as usize,
                    lc.proto.is_vararg,
                    lc.proto.max_stack_size as usize,
                )
            };
            let nargs = self.thr().top - func_idx - 1;

            let base = if is_vararg {
                // fixed parameters move above the arguments; the extras
                // stay behind, addressable through VARARG
                let top = self.thr().top;
                self.ensure_stack(top + num_params.max(1) + max_stack)?;
                let th = self.thr_mut();
                let first_arg = func_idx + 1;
                for i in 0..num_params {
                    th.stack[top + i] = if i < nargs {
                        let v = th.stack[first_arg + i];
                        th.stack[first_arg + i] = LuaValue::Nil;
                        v
                    } else {
                        LuaValue::Nil
                    };
                }
                th.top = top + num_params;
                top
            } else {
                let base = func_idx + 1;
                self.ensure_stack(base + max_stack)?;
                base
            };

            let frame_top = base + max_stack;
            {
                let th = self.thr_mut();
                for i in th.top..frame_top {
                    th.stack[i] = LuaValue::Nil;
                }
                th.top = frame_top;
                let n_varargs = if is_vararg && nargs > num_params {
                    nargs - num_params
                } else {
                    0
                };
                th.push_frame(CallInfo {
                    func: func_idx,
                    base,
                    top: frame_top,
                    saved_pc: 0,
                    nresults,
                    n_varargs,
                    tailcalls: 0,
                    status: CallStatus::LUA,
                    errfunc: 0,
                });
            }
            if self.thr().hook_mask.contains(HookMask::CALL) {
                self.fire_hook(HookEvent::Call)?;
            }
            Ok(Precall::Lua)
        } else {
            let base = func_idx + 1;
            let nargs = self.thr().top - base;
            self.ensure_stack(self.thr().top + MIN_STACK)?;
            self.thr_mut().push_frame(CallInfo {
                func: func_idx,
                base,
                top: base + nargs + MIN_STACK,
                saved_pc: 0,
                nresults,
                n_varargs: 0,
                tailcalls: 0,
                status: CallStatus::NATIVE,
                errfunc: 0,
            });
            let f = self
                .pool
                .closure(cid)
                .as_native()
                .expect("native closure")
                .f;
            // on error (or yield) the frame is left in place for the
            // unwinder (or the resume) to find
            let n = f(self)?;
            let first = self.thr().top - n;
            self.finish_native_return(first, n);
            Ok(Precall::Native)
        }
    }

    /// Pop the finished native frame and deliver its results.
    pub(crate) fn finish_native_return(&mut self, first: usize, n: usize) {
        let (func_idx, want) = {
            let ci = self.thr().current_ci();
            (ci.func, ci.nresults)
        };
        self.thr_mut().pop_frame();
        self.move_results(func_idx, first, n, want);
    }

    /// Move `n` results from `first` down to `dst`, padding or
    /// truncating to `want` unless all results were requested.
    pub(crate) fn move_results(&mut self, dst: usize, first: usize, n: usize, want: i32) {
        let th = self.thr_mut();
        if want == MULTRET {
            for i in 0..n {
                th.stack[dst + i] = th.stack[first + i];
            }
            th.top = dst + n;
        } else {
            let want = want as usize;
            let copy = n.min(want);
            for i in 0..copy {
                th.stack[dst + i] = th.stack[first + i];
            }
            for i in copy..want {
                th.stack[dst + i] = LuaValue::Nil;
            }
            th.top = dst + want;
        }
    }

    /// Full call from native context. Re-entrant: counts against the
    /// C-call ceiling and forbids yields across itself.
    pub fn d_call(&mut self, func_idx: usize, nresults: i32) -> LuaResult<()> {
        self.nny += 1;
        let r = self.d_call_yieldable(func_idx, nresults);
        self.nny -= 1;
        r
    }

    /// Call without the yield fence: only the protected-call and resume
    /// paths may use this, because only they can reconstruct the
    /// suspended state.
    pub(crate) fn d_call_yieldable(&mut self, func_idx: usize, nresults: i32) -> LuaResult<()> {
        self.n_ccalls += 1;
        if self.n_ccalls >= self.options.max_c_calls {
            self.n_ccalls -= 1;
            return Err(self.error("C stack overflow"));
        }
        let target = self.thr().ci_depth;
        let r = match self.precall(func_idx, nresults) {
            Ok(Precall::Lua) => self.execute(target),
            Ok(Precall::Native) => Ok(()),
            Err(e) => Err(e),
        };
        self.n_ccalls -= 1;
        r
    }

    /// Protected call: the function at `func_idx` with the arguments
    /// above it. On success, results sit at `func_idx`. On a caught
    /// error the thread is rebuilt and the error object placed at
    /// `func_idx` instead: the return is `(succeeded, result count)`.
    /// Yields pass through untouched.
    pub fn pcall_at(&mut self, func_idx: usize, errfunc: usize) -> LuaResult<(bool, usize)> {
        let saved_depth = self.thr().ci_depth;
        let saved_nny = self.nny;
        let saved_ccalls = self.n_ccalls;
        match self.d_call_yieldable(func_idx, MULTRET) {
            Ok(()) => Ok((true, self.thr().top - func_idx)),
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(kind) => {
                self.nny = saved_nny;
                self.n_ccalls = saved_ccalls;
                let errobj = self.run_errfunc(errfunc, kind);
                self.close_upvalues(func_idx);
                let th = self.thr_mut();
                th.ci_depth = saved_depth;
                th.stack[func_idx] = errobj;
                th.top = func_idx + 1;
                Ok((false, 1))
            }
        }
    }

    /// Apply the xpcall handler to the in-flight error object. Handler
    /// failures degrade to the error-in-error-handling object.
    pub(crate) fn run_errfunc(&mut self, errfunc: usize, kind: LuaError) -> LuaValue {
        let obj = match kind {
            LuaError::Memory => {
                let _ = self.take_error_value();
                self.new_string_value("not enough memory")
            }
            _ => self.take_error_value(),
        };
        if errfunc == 0 || kind == LuaError::ErrErr {
            return obj;
        }
        let handler = self.stack_get(errfunc);
        match self.call_tm_res(handler, &[obj]) {
            Ok(v) => v,
            Err(_) => {
                let _ = self.take_error_value();
                self.new_string_value("error in error handling")
            }
        }
    }

    // ---- coroutines ----

    /// Start or continue a coroutine, handing it `args`. The entry
    /// function must already sit at the bottom of its stack (see
    /// [`LuaVm::coroutine_create`]).
    pub fn resume(&mut self, co: ThreadId, args: &[LuaValue]) -> LuaResult<Resume> {
        if co == self.current {
            return Err(self.error("cannot resume non-suspended coroutine"));
        }
        match self.pool.thread(co).status {
            ThreadStatus::Dead => return Err(self.error("cannot resume dead coroutine")),
            ThreadStatus::Running | ThreadStatus::Normal => {
                return Err(self.error("cannot resume non-suspended coroutine"));
            }
            ThreadStatus::Suspended => {}
        }

        let prev = self.current;
        self.pool.thread_mut(prev).status = ThreadStatus::Normal;
        self.pool.thread_mut(co).status = ThreadStatus::Running;
        self.current = co;
        let saved_nny = self.nny;
        let saved_ccalls = self.n_ccalls;
        self.nny = 0;

        let first_time = self.thr().ci_depth == 0;
        trace!(first_time, thread = co.index(), "resume");
        let run: LuaResult<()> = if first_time {
            if self.thr().top == 0 {
                Err(self.error("cannot resume dead coroutine"))
            } else {
                self.ensure_stack(1 + args.len()).and_then(|_| {
                    for &a in args {
                        self.thr_mut().push(a);
                    }
                    self.d_call_yieldable(0, MULTRET)
                })
            }
        } else if self
            .thr()
            .current_ci()
            .status
            .contains(CallStatus::YIELDED)
        {
            // the resume arguments become the results of the suspended
            // yield call
            self.ensure_stack(self.thr().top + args.len()).and_then(|_| {
                for &a in args {
                    self.thr_mut().push(a);
                }
                let first = self.thr().top - args.len();
                self.thr_mut()
                    .current_ci_mut()
                    .status
                    .remove(CallStatus::YIELDED);
                self.finish_native_return(first, args.len());
                if self.thr().ci_depth > 0 {
                    self.execute(0)
                } else {
                    Ok(())
                }
            })
        } else {
            // suspended inside a hook: the resume arguments are dropped
            self.execute(0)
        };

        self.nny = saved_nny;
        self.n_ccalls = saved_ccalls;

        let outcome = match run {
            Ok(()) => {
                // body returned: results were moved to the stack bottom
                let th = self.pool.thread(co);
                let results = th.stack[..th.top].to_vec();
                self.pool.thread_mut(co).status = ThreadStatus::Dead;
                Ok(Resume::Return(results))
            }
            Err(LuaError::Yield) => {
                self.pool.thread_mut(co).status = ThreadStatus::Suspended;
                let th = self.pool.thread(co);
                let vals = if th.ci_depth > 0
                    && th.current_ci().status.contains(CallStatus::YIELDED)
                {
                    th.stack[th.current_ci().base..th.top].to_vec()
                } else {
                    Vec::new()
                };
                Ok(Resume::Yield(vals))
            }
            Err(e) => {
                self.pool.thread_mut(co).status = ThreadStatus::Dead;
                Err(e)
            }
        };

        self.current = prev;
        self.pool.thread_mut(prev).status = ThreadStatus::Running;
        outcome
    }

    /// Suspend the running coroutine. Must be returned immediately from
    /// the calling native function: `return Err(vm.do_yield())`. The
    /// values being yielded are the native frame's arguments.
    pub fn do_yield(&mut self) -> LuaError {
        if self.current == self.main {
            return self.error("attempt to yield from outside a coroutine");
        }
        if self.nny > 0 {
            return self.error("attempt to yield across metamethod/C-call boundary");
        }
        self.thr_mut()
            .current_ci_mut()
            .status
            .insert(CallStatus::YIELDED);
        LuaError::Yield
    }

    /// Allocate a coroutine whose body is `func`.
    pub fn coroutine_create(&mut self, func: LuaValue) -> ThreadId {
        let co = self.new_thread();
        let th = self.pool.thread_mut(co);
        th.stack[0] = func;
        th.top = 1;
        co
    }

    pub fn coroutine_status(&self, co: ThreadId) -> ThreadStatus {
        self.pool.thread(co).status
    }

    // ---- error recovery inside the dispatch loop ----

    /// Unwind to the nearest protected frame that survived a yield.
    /// Returns Ok if recovery happened (the caller re-enters the loop);
    /// re-raises otherwise.
    pub(crate) fn try_recover(&mut self, err: LuaError, target_depth: usize) -> LuaResult<()> {
        if err == LuaError::Yield {
            return Err(err);
        }
        let found = {
            let th = self.thr();
            (target_depth..th.ci_depth)
                .rev()
                .find(|&d| th.ci[d].status.contains(CallStatus::YPCALL))
        };
        let Some(d) = found else {
            return Err(err);
        };
        let (pfunc, want, errfunc) = {
            let ci = &self.thr().ci[d];
            (ci.func, ci.nresults, ci.errfunc)
        };
        trace!(depth = d, "recovering into protected frame");
        let errobj = self.run_errfunc(errfunc, err);
        self.close_upvalues(pfunc);
        {
            let th = self.thr_mut();
            th.ci_depth = d; // pops the protected frame and everything above
            th.stack[pfunc] = LuaValue::Boolean(false);
            th.stack[pfunc + 1] = errobj;
        }
        self.move_results(pfunc, pfunc, 2, want);
        Ok(())
    }

    /// A protected native frame whose Rust activation is long gone
    /// (a yield passed through it): the callee has returned, so insert
    /// the success flag and return from the frame.
    pub(crate) fn finish_ypcall(&mut self) -> LuaResult<()> {
        let (pfunc, pbase, want) = {
            let ci = self.thr().current_ci();
            (ci.func, ci.base, ci.nresults)
        };
        let n = self.thr().top - pbase;
        self.ensure_stack(pbase + n + 1)?;
        {
            let th = self.thr_mut();
            let mut i = pbase + n;
            while i > pbase {
                th.stack[i] = th.stack[i - 1];
                i -= 1;
            }
            th.stack[pbase] = LuaValue::Boolean(true);
            th.top = pbase + n + 1;
        }
        self.thr_mut().pop_frame();
        self.move_results(pfunc, pbase, n + 1, want);
        Ok(())
    }

    /// Fire a debug hook. The position was saved by the caller, so a
    /// hook that yields resumes cleanly.
    pub(crate) fn fire_hook(&mut self, event: HookEvent) -> LuaResult<()> {
        if let Some(hook) = self.thr().hook {
            hook(self, event)?;
        }
        Ok(())
    }
}
