// The executor: one labeled context-switch loop ('startfunc) wrapping a
// fetch-decode-dispatch loop. Lua-to-Lua calls and returns never recurse
// in Rust: they adjust the CallInfo stack and jump back to 'startfunc,
// which reloads the frame context (pc, base, closure, constants).
//
// Positions are absolute stack indices, so stack growth never
// invalidates them; the only cached state is the pc and the `Rc` of the
// running proto. Any operation that can re-enter the control layer
// (calls, metamethods, errors, hooks) saves the pc first, and any error
// is offered to `try_recover` so a protected frame that survived a
// yield can catch it in place.

mod arith;
pub(crate) mod call;
mod compare;
mod concat;
pub mod metamethod;
mod table_ops;

pub use call::{Precall, Resume};
pub(crate) use arith::ArithOp;

use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::CallStatus;
use crate::lua_vm::limits::{FIELDS_PER_FLUSH, MULTRET};
use crate::lua_vm::opcode::{Instruction, OpCode, index_k, is_k};
use crate::lua_vm::thread::{HookEvent, HookMask};
use crate::lua_vm::{LuaResult, LuaVm};
use crate::gc::GcRef;
use crate::lua_value::Proto;

/// Size hints in NEWTABLE are "floating point bytes": eeeeexxx meaning
/// (1xxx) << (eeeee-1) when the exponent is non-zero.
#[inline]
fn fb2int(x: usize) -> usize {
    if x < 8 { x } else { ((x & 7) + 8) << ((x >> 3) - 1) }
}

/// Outcome of OP_TAILCALL.
enum TailAction {
    /// Frame context changed; go back to 'startfunc.
    Reentry,
    /// A native callee already ran; the following RETURN ships results.
    InFrame,
}

impl LuaVm {
    /// Run bytecode until the call depth drops back to `target_depth`.
    pub(crate) fn execute(&mut self, target_depth: usize) -> LuaResult<()> {
        'startfunc: loop {
            let depth = self.thr().ci_depth;
            if depth <= target_depth {
                return Ok(());
            }
            let frame_idx = depth - 1;

            if self.thr().ci[frame_idx].is_native() {
                // only a protected frame orphaned by a yield may appear
                // here; its callee just returned, so finish it
                if self.thr().ci[frame_idx].status.contains(CallStatus::YPCALL) {
                    if let Err(e) = self.finish_ypcall() {
                        self.try_recover(e, target_depth)?;
                    }
                    continue 'startfunc;
                }
                return Err(self.error("attempt to resume across a native frame"));
            }

            // stale slots between the logical top and the frame window
            // would otherwise keep dead objects reachable
            {
                let (top, ci_top) = {
                    let th = self.thr();
                    (th.top, th.ci[frame_idx].top)
                };
                if top < ci_top {
                    let th = self.thr_mut();
                    for i in top..ci_top {
                        th.stack[i] = LuaValue::Nil;
                    }
                }
            }

            // ---- load frame context ----
            let (mut pc, base, cl_id) = {
                let th = self.thr();
                let ci = &th.ci[frame_idx];
                let cl_id = match th.stack[ci.func] {
                    LuaValue::Function(id) => id,
                    _ => return Err(self.error("frame function slot corrupted")),
                };
                (ci.saved_pc as usize, ci.base, cl_id)
            };
            let (proto, env) = {
                let lc = self
                    .pool
                    .closure(cl_id)
                    .as_lua()
                    .expect("lua frame holds a lua closure");
                (lc.proto.clone(), lc.env)
            };
            let code = &proto.code;
            let k = &proto.constants;

            macro_rules! save_pc {
                () => {
                    self.thr_mut().ci[frame_idx].saved_pc = pc as u32;
                };
            }
            // offer an error to a yielded-through protected frame; if
            // none catches, it propagates out of execute
            macro_rules! vmtry {
                ($e:expr) => {
                    match $e {
                        Ok(v) => v,
                        Err(err) => {
                            self.try_recover(err, target_depth)?;
                            continue 'startfunc;
                        }
                    }
                };
            }
            macro_rules! rk {
                ($f:expr) => {{
                    let f = $f;
                    if is_k(f) {
                        k[index_k(f)]
                    } else {
                        self.stack_get(base + f as usize)
                    }
                }};
            }

            // ---- dispatch ----
            loop {
                if !self.thr().hook_mask.is_empty() {
                    save_pc!();
                    vmtry!(self.instruction_hook(&proto, pc));
                }
                let inst = Instruction(code[pc]);
                pc += 1;
                let Some(op) = inst.opcode() else {
                    save_pc!();
                    let e = self.error("invalid opcode in bytecode");
                    vmtry!(Err::<(), _>(e));
                    unreachable!();
                };
                let a = inst.a() as usize;

                match op {
                    OpCode::Move => {
                        let v = self.stack_get(base + inst.b() as usize);
                        self.stack_set(base + a, v);
                    }
                    OpCode::LoadK => {
                        self.stack_set(base + a, k[inst.bx() as usize]);
                    }
                    OpCode::LoadBool => {
                        self.stack_set(base + a, LuaValue::Boolean(inst.b() != 0));
                        if inst.c() != 0 {
                            pc += 1;
                        }
                    }
                    OpCode::LoadNil => {
                        for r in a..=inst.b() as usize {
                            self.stack_set(base + r, LuaValue::Nil);
                        }
                    }
                    OpCode::GetUpval => {
                        let v = self.read_upvalue(cl_id, inst.b() as usize);
                        self.stack_set(base + a, v);
                    }
                    OpCode::SetUpval => {
                        let v = self.stack_get(base + a);
                        self.write_upvalue(cl_id, inst.b() as usize, v);
                    }
                    OpCode::GetGlobal => {
                        save_pc!();
                        let key = k[inst.bx() as usize];
                        let t = LuaValue::Table(env);
                        let v = vmtry!(self.vm_gettable(&t, &key));
                        self.stack_set(base + a, v);
                    }
                    OpCode::SetGlobal => {
                        save_pc!();
                        let key = k[inst.bx() as usize];
                        let t = LuaValue::Table(env);
                        let v = self.stack_get(base + a);
                        vmtry!(self.vm_settable(&t, &key, &v));
                    }
                    OpCode::GetTable => {
                        save_pc!();
                        let t = self.stack_get(base + inst.b() as usize);
                        let key = rk!(inst.c());
                        let v = vmtry!(self.vm_gettable(&t, &key));
                        self.stack_set(base + a, v);
                    }
                    OpCode::SetTable => {
                        save_pc!();
                        let t = self.stack_get(base + a);
                        let key = rk!(inst.b());
                        let v = rk!(inst.c());
                        vmtry!(self.vm_settable(&t, &key, &v));
                    }
                    OpCode::NewTable => {
                        save_pc!();
                        let na = fb2int(inst.b() as usize);
                        let nh = fb2int(inst.c() as usize);
                        let tid = self.new_table(na, nh);
                        self.stack_set(base + a, LuaValue::Table(tid));
                        self.check_gc();
                    }
                    OpCode::SelfOp => {
                        save_pc!();
                        let t = self.stack_get(base + inst.b() as usize);
                        self.stack_set(base + a + 1, t);
                        let key = rk!(inst.c());
                        let v = vmtry!(self.vm_gettable(&t, &key));
                        self.stack_set(base + a, v);
                    }
                    OpCode::Add
                    | OpCode::Sub
                    | OpCode::Mul
                    | OpCode::Div
                    | OpCode::Mod
                    | OpCode::Pow => {
                        let vb = rk!(inst.b());
                        let vc = rk!(inst.c());
                        let aop = match op {
                            OpCode::Add => ArithOp::Add,
                            OpCode::Sub => ArithOp::Sub,
                            OpCode::Mul => ArithOp::Mul,
                            OpCode::Div => ArithOp::Div,
                            OpCode::Mod => ArithOp::Mod,
                            _ => ArithOp::Pow,
                        };
                        let r = if let (LuaValue::Number(x), LuaValue::Number(y)) = (vb, vc) {
                            LuaValue::Number(aop.apply(x, y))
                        } else {
                            save_pc!();
                            vmtry!(self.arith_event(aop, vb, vc))
                        };
                        self.stack_set(base + a, r);
                    }
                    OpCode::Unm => {
                        let v = self.stack_get(base + inst.b() as usize);
                        let r = if let LuaValue::Number(n) = v {
                            LuaValue::Number(-n)
                        } else {
                            save_pc!();
                            vmtry!(self.arith_event(ArithOp::Unm, v, v))
                        };
                        self.stack_set(base + a, r);
                    }
                    OpCode::Not => {
                        let v = self.stack_get(base + inst.b() as usize);
                        self.stack_set(base + a, LuaValue::Boolean(!v.is_truthy()));
                    }
                    OpCode::Len => {
                        save_pc!();
                        let v = self.stack_get(base + inst.b() as usize);
                        let r = vmtry!(self.vm_length(&v));
                        self.stack_set(base + a, r);
                    }
                    OpCode::Concat => {
                        let b = inst.b() as usize;
                        let c = inst.c() as usize;
                        save_pc!();
                        self.thr_mut().top = base + c + 1;
                        vmtry!(self.vm_concat(c - b + 1));
                        let v = self.stack_get(base + b);
                        let frame_top = self.thr().ci[frame_idx].top;
                        self.thr_mut().top = frame_top;
                        self.stack_set(base + a, v);
                        self.check_gc();
                    }
                    OpCode::Jmp => {
                        pc = (pc as i64 + inst.sbx() as i64) as usize;
                    }
                    OpCode::Eq | OpCode::Lt | OpCode::Le => {
                        save_pc!();
                        let vb = rk!(inst.b());
                        let vc = rk!(inst.c());
                        let cond = vmtry!(match op {
                            OpCode::Eq => self.equal_values(&vb, &vc),
                            OpCode::Lt => self.less_than(&vb, &vc),
                            _ => self.less_equal(&vb, &vc),
                        });
                        if cond == (a != 0) {
                            let j = Instruction(code[pc]);
                            pc = (pc as i64 + 1 + j.sbx() as i64) as usize;
                        } else {
                            pc += 1;
                        }
                    }
                    OpCode::Test => {
                        let cond = self.stack_get(base + a).is_truthy();
                        if cond == (inst.c() != 0) {
                            let j = Instruction(code[pc]);
                            pc = (pc as i64 + 1 + j.sbx() as i64) as usize;
                        } else {
                            pc += 1;
                        }
                    }
                    OpCode::TestSet => {
                        let vb = self.stack_get(base + inst.b() as usize);
                        if vb.is_truthy() == (inst.c() != 0) {
                            self.stack_set(base + a, vb);
                            let j = Instruction(code[pc]);
                            pc = (pc as i64 + 1 + j.sbx() as i64) as usize;
                        } else {
                            pc += 1;
                        }
                    }
                    OpCode::Call => {
                        let b = inst.b() as usize;
                        let c = inst.c() as usize;
                        let func_idx = base + a;
                        save_pc!();
                        if b != 0 {
                            self.thr_mut().top = func_idx + b;
                        }
                        let nres = if c == 0 { MULTRET } else { (c - 1) as i32 };
                        match vmtry!(self.precall(func_idx, nres)) {
                            Precall::Lua => continue 'startfunc,
                            Precall::Native => {
                                if c != 0 {
                                    let frame_top = self.thr().ci[frame_idx].top;
                                    self.thr_mut().top = frame_top;
                                }
                            }
                        }
                    }
                    OpCode::TailCall => {
                        let b = inst.b() as usize;
                        let func_idx = base + a;
                        save_pc!();
                        if b != 0 {
                            self.thr_mut().top = func_idx + b;
                        }
                        match vmtry!(self.tailcall(frame_idx, func_idx)) {
                            TailAction::Reentry => continue 'startfunc,
                            TailAction::InFrame => {}
                        }
                    }
                    OpCode::Return => {
                        let b = inst.b() as usize;
                        save_pc!();
                        let first = base + a;
                        let n = if b == 0 {
                            self.thr().top - first
                        } else {
                            b - 1
                        };
                        self.close_upvalues(base);
                        if self.thr().hook_mask.contains(HookMask::RET) {
                            vmtry!(self.fire_hook(HookEvent::Return));
                        }
                        let (func_idx, want) = {
                            let ci = &self.thr().ci[frame_idx];
                            (ci.func, ci.nresults)
                        };
                        self.thr_mut().pop_frame();
                        self.move_results(func_idx, first, n, want);
                        if self.thr().ci_depth <= target_depth {
                            return Ok(());
                        }
                        if want != MULTRET {
                            let th = self.thr();
                            if th.current_ci().is_lua() {
                                let t = th.current_ci().top;
                                self.thr_mut().top = t;
                            }
                        }
                        continue 'startfunc;
                    }
                    OpCode::ForPrep => {
                        save_pc!();
                        let init = self.stack_get(base + a);
                        let limit = self.stack_get(base + a + 1);
                        let step = self.stack_get(base + a + 2);
                        let Some(init) = self.to_number_coerce(&init) else {
                            let e = self.error("'for' initial value must be a number");
                            vmtry!(Err::<(), _>(e));
                            unreachable!();
                        };
                        let Some(limit) = self.to_number_coerce(&limit) else {
                            let e = self.error("'for' limit must be a number");
                            vmtry!(Err::<(), _>(e));
                            unreachable!();
                        };
                        let Some(step) = self.to_number_coerce(&step) else {
                            let e = self.error("'for' step must be a number");
                            vmtry!(Err::<(), _>(e));
                            unreachable!();
                        };
                        if step == 0.0 {
                            let e = self.error("'for' step is zero");
                            vmtry!(Err::<(), _>(e));
                            unreachable!();
                        }
                        self.stack_set(base + a, LuaValue::Number(init - step));
                        self.stack_set(base + a + 1, LuaValue::Number(limit));
                        self.stack_set(base + a + 2, LuaValue::Number(step));
                        pc = (pc as i64 + inst.sbx() as i64) as usize;
                    }
                    OpCode::ForLoop => {
                        let step = self
                            .stack_get(base + a + 2)
                            .as_number()
                            .unwrap_or(f64::NAN);
                        let idx = self.stack_get(base + a).as_number().unwrap_or(f64::NAN) + step;
                        let limit = self
                            .stack_get(base + a + 1)
                            .as_number()
                            .unwrap_or(f64::NAN);
                        let cont = if step > 0.0 { idx <= limit } else { limit <= idx };
                        if cont {
                            pc = (pc as i64 + inst.sbx() as i64) as usize;
                            self.stack_set(base + a, LuaValue::Number(idx));
                            self.stack_set(base + a + 3, LuaValue::Number(idx));
                        }
                    }
                    OpCode::TForLoop => {
                        let c = inst.c() as usize;
                        save_pc!();
                        let cb = base + a + 3;
                        let f = self.stack_get(base + a);
                        let s = self.stack_get(base + a + 1);
                        let ctl = self.stack_get(base + a + 2);
                        vmtry!(self.ensure_stack(cb + 3));
                        self.stack_set(cb, f);
                        self.stack_set(cb + 1, s);
                        self.stack_set(cb + 2, ctl);
                        self.thr_mut().top = cb + 3;
                        vmtry!(self.d_call(cb, c as i32));
                        let frame_top = self.thr().ci[frame_idx].top;
                        self.thr_mut().top = frame_top;
                        let first = self.stack_get(cb);
                        if !first.is_nil() {
                            self.stack_set(cb - 1, first);
                            let j = Instruction(code[pc]);
                            pc = (pc as i64 + 1 + j.sbx() as i64) as usize;
                        } else {
                            pc += 1;
                        }
                    }
                    OpCode::SetList => {
                        let mut n = inst.b() as usize;
                        let mut c = inst.c() as usize;
                        save_pc!();
                        if n == 0 {
                            n = self.thr().top - (base + a) - 1;
                        }
                        if c == 0 {
                            // the real block index occupies the next word
                            c = code[pc] as usize;
                            pc += 1;
                        }
                        let LuaValue::Table(tid) = self.stack_get(base + a) else {
                            let e = self.error("SETLIST target is not a table");
                            vmtry!(Err::<(), _>(e));
                            unreachable!();
                        };
                        let start = (c - 1) * FIELDS_PER_FLUSH;
                        // bulk fill: pre-size the array part once
                        {
                            let (tbl, strs) = self.pool.table_and_strings(tid);
                            if tbl.array_len() < start + n {
                                tbl.resize_array(start + n, strs);
                            }
                        }
                        for j in 1..=n {
                            let v = self.stack_get(base + a + j);
                            self.raw_seti(tid, (start + j) as i64, v);
                        }
                        let frame_top = self.thr().ci[frame_idx].top;
                        self.thr_mut().top = frame_top;
                    }
                    OpCode::Close => {
                        self.close_upvalues(base + a);
                    }
                    OpCode::Closure => {
                        save_pc!();
                        let bx = inst.bx() as usize;
                        let sub = proto.protos[bx].clone();
                        let nups = sub.nups as usize;
                        let mut upvals = Vec::with_capacity(nups);
                        for j in 0..nups {
                            let pseudo = Instruction(code[pc + j]);
                            match pseudo.opcode() {
                                Some(OpCode::Move) => {
                                    upvals
                                        .push(self.find_or_create_upvalue(base + pseudo.b() as usize));
                                }
                                Some(OpCode::GetUpval) => {
                                    let parent = self
                                        .pool
                                        .closure(cl_id)
                                        .as_lua()
                                        .expect("lua frame holds a lua closure")
                                        .upvals[pseudo.b() as usize];
                                    upvals.push(parent);
                                }
                                _ => {
                                    let e = self.error("malformed closure capture");
                                    vmtry!(Err::<(), _>(e));
                                    unreachable!();
                                }
                            }
                        }
                        pc += nups;
                        let cid = self.new_lua_closure(sub, upvals, env);
                        self.stack_set(base + a, LuaValue::Function(cid));
                        self.check_gc();
                    }
                    OpCode::Vararg => {
                        let b = inst.b() as usize;
                        let n_varargs = self.thr().ci[frame_idx].n_varargs;
                        let varstart = base - n_varargs;
                        if b == 0 {
                            save_pc!();
                            vmtry!(self.ensure_stack(base + a + n_varargs));
                            for j in 0..n_varargs {
                                let v = self.stack_get(varstart + j);
                                self.stack_set(base + a + j, v);
                            }
                            self.thr_mut().top = base + a + n_varargs;
                        } else {
                            for j in 0..b - 1 {
                                let v = if j < n_varargs {
                                    self.stack_get(varstart + j)
                                } else {
                                    LuaValue::Nil
                                };
                                self.stack_set(base + a + j, v);
                            }
                        }
                    }
                }
            }
        }
    }

    // ---- tail calls ----

    fn tailcall(&mut self, frame_idx: usize, func_idx: usize) -> LuaResult<TailAction> {
        let func = self.stack_get(func_idx);
        let is_lua_target = matches!(
            func,
            LuaValue::Function(id) if self.pool.closure(id).is_lua()
        );
        if !is_lua_target {
            // native target (or __call rewrite): run it as a plain call;
            // the RETURN that follows ships whatever it produced
            return match self.precall(func_idx, MULTRET)? {
                Precall::Lua => Ok(TailAction::Reentry),
                Precall::Native => Ok(TailAction::InFrame),
            };
        }

        // genuine tail call: the callee takes over this frame in place
        let (old_func, want, base, tailcalls) = {
            let ci = &self.thr().ci[frame_idx];
            (ci.func, ci.nresults, ci.base, ci.tailcalls)
        };
        self.close_upvalues(base);
        let top = self.thr().top;
        let n_move = top - func_idx;
        {
            let th = self.thr_mut();
            for i in 0..n_move {
                th.stack[old_func + i] = th.stack[func_idx + i];
            }
            th.top = old_func + n_move;
        }
        self.thr_mut().pop_frame();
        match self.precall(old_func, want)? {
            Precall::Lua => {
                let ci = self.thr_mut().current_ci_mut();
                ci.status.insert(CallStatus::TAIL);
                ci.tailcalls = tailcalls + 1;
                Ok(TailAction::Reentry)
            }
            Precall::Native => Ok(TailAction::InFrame),
        }
    }

    // ---- upvalue access ----

    fn read_upvalue(&self, cl_id: crate::gc::ClosureId, idx: usize) -> LuaValue {
        let uv = self
            .pool
            .closure(cl_id)
            .as_lua()
            .expect("lua frame holds a lua closure")
            .upvals[idx];
        match self.pool.upvalue(uv) {
            crate::lua_value::Upvalue::Open { thread, index } => {
                self.pool.thread(*thread).stack[*index]
            }
            crate::lua_value::Upvalue::Closed(v) => *v,
        }
    }

    fn write_upvalue(&mut self, cl_id: crate::gc::ClosureId, idx: usize, v: LuaValue) {
        let uv = self
            .pool
            .closure(cl_id)
            .as_lua()
            .expect("lua frame holds a lua closure")
            .upvals[idx];
        match self.pool.upvalue_mut(uv) {
            crate::lua_value::Upvalue::Open { thread, index } => {
                let (t, i) = (*thread, *index);
                self.pool.thread_mut(t).stack[i] = v;
            }
            crate::lua_value::Upvalue::Closed(slot) => {
                *slot = v;
            }
        }
        self.forward_barrier(GcRef::Upvalue(uv), &v);
    }

    // ---- hooks ----

    /// Count and line hooks, checked between instructions. The pc was
    /// already saved, so a hook that yields resumes at this instruction
    /// without re-firing.
    fn instruction_hook(&mut self, proto: &Proto, pc: usize) -> LuaResult<()> {
        let mask = self.thr().hook_mask;
        if mask.contains(HookMask::COUNT) {
            let fire = {
                let th = self.thr_mut();
                th.hook_count -= 1;
                if th.hook_count <= 0 {
                    th.hook_count = th.base_hook_count;
                    true
                } else {
                    false
                }
            };
            if fire {
                self.fire_hook(HookEvent::Count)?;
            }
        }
        if mask.contains(HookMask::LINE) {
            let line = proto.line_at(pc);
            if line != 0 && line != self.thr().last_hook_line {
                self.thr_mut().last_hook_line = line;
                self.fire_hook(HookEvent::Line(line))?;
            }
        }
        Ok(())
    }
}
