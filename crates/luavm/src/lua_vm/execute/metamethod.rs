// Metamethod resolution. Tables and userdata carry their own metatable;
// every other kind shares a per-type metatable in the global state.
// Event names are interned once at startup and fixed, so lookup is a
// raw table get; the table's absence-cache bits short-circuit the
// common no-metamethod case for the fast events.

use crate::gc::TableId;
use crate::lua_value::{LuaValue, TmAbsent};
use crate::lua_vm::limits::MULTRET;
use crate::lua_vm::{LuaResult, LuaVm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Lt,
    Le,
    Concat,
    Call,
}

impl TmKind {
    pub const ALL: [TmKind; 17] = [
        TmKind::Index,
        TmKind::NewIndex,
        TmKind::Gc,
        TmKind::Mode,
        TmKind::Eq,
        TmKind::Add,
        TmKind::Sub,
        TmKind::Mul,
        TmKind::Div,
        TmKind::Mod,
        TmKind::Pow,
        TmKind::Unm,
        TmKind::Len,
        TmKind::Lt,
        TmKind::Le,
        TmKind::Concat,
        TmKind::Call,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Gc => "__gc",
            TmKind::Mode => "__mode",
            TmKind::Eq => "__eq",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::Len => "__len",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Concat => "__concat",
            TmKind::Call => "__call",
        }
    }

    /// Events whose absence is cached on the metatable.
    fn absent_flag(self) -> Option<TmAbsent> {
        match self {
            TmKind::Index => Some(TmAbsent::INDEX),
            TmKind::NewIndex => Some(TmAbsent::NEWINDEX),
            TmKind::Gc => Some(TmAbsent::GC),
            TmKind::Mode => Some(TmAbsent::MODE),
            TmKind::Eq => Some(TmAbsent::EQ),
            _ => None,
        }
    }
}

impl LuaVm {
    /// The metatable governing a value, per-object or per-type-class.
    pub fn get_metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        match v {
            LuaValue::Table(id) => self.pool.table(*id).metatable,
            LuaValue::Userdata(id) => self.pool.userdata_ref(*id).metatable,
            other => self.type_metatable(other.type_tag()),
        }
    }

    /// Raw event lookup in a metatable, maintaining the absence cache.
    pub fn get_tm_from_mt(&mut self, mt: TableId, ev: TmKind) -> LuaValue {
        if let Some(flag) = ev.absent_flag() {
            if self.pool.table(mt).flags.contains(flag) {
                return LuaValue::Nil;
            }
        }
        let name = LuaValue::String(self.tm_names[ev as usize]);
        let v = self.raw_get(mt, &name);
        if v.is_nil() {
            if let Some(flag) = ev.absent_flag() {
                self.pool.table_mut(mt).flags.insert(flag);
            }
        }
        v
    }

    /// Event handler of a value, nil when absent.
    pub fn get_tm(&mut self, v: &LuaValue, ev: TmKind) -> LuaValue {
        match self.get_metatable_of(v) {
            Some(mt) => self.get_tm_from_mt(mt, ev),
            None => LuaValue::Nil,
        }
    }

    /// Call a metamethod expecting one result. The arguments are
    /// marshaled above the current top, inside the reserved headroom.
    pub fn call_tm_res(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<LuaValue> {
        let top = self.thr().top;
        self.ensure_stack(top + 1 + args.len())?;
        {
            let th = self.thr_mut();
            th.push(f);
            for a in args {
                th.push(*a);
            }
        }
        self.d_call(top, 1)?;
        let res = self.stack_get(top);
        self.thr_mut().top = top;
        Ok(res)
    }

    /// Call a metamethod for effect only (`__newindex` with a function).
    pub fn call_tm_effect(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<()> {
        let top = self.thr().top;
        self.ensure_stack(top + 1 + args.len())?;
        {
            let th = self.thr_mut();
            th.push(f);
            for a in args {
                th.push(*a);
            }
        }
        self.d_call(top, 0)?;
        self.thr_mut().top = top;
        Ok(())
    }

    /// Call an arbitrary function value with arguments, collecting all
    /// results (host API surface and libraries). On an uncaught error
    /// the thread is restored to its pre-call shape so the state stays
    /// usable; the error object remains available.
    pub fn call_value(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        let top = self.thr().top;
        let depth = self.thr().ci_depth;
        self.ensure_stack(top + 1 + args.len())?;
        {
            let th = self.thr_mut();
            th.push(f);
            for a in args {
                th.push(*a);
            }
        }
        match self.d_call(top, MULTRET) {
            Ok(()) => {
                let new_top = self.thr().top;
                let results = self.thr().stack[top..new_top].to_vec();
                self.thr_mut().top = top;
                Ok(results)
            }
            Err(e) => {
                if e != crate::lua_vm::LuaError::Yield {
                    self.close_upvalues(top);
                    let th = self.thr_mut();
                    th.ci_depth = depth;
                    th.top = top;
                }
                Err(e)
            }
        }
    }
}
