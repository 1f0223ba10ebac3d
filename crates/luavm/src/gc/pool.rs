// Typed arenas for every collectable kind.
//
// Objects are addressed by 32-bit ids instead of pointers: the collector
// can free a slot without leaving anything dangling, the write barrier is
// an index-plus-color check, and the sweep phase walks a stable cursor
// over the slot vector. Freed slots go on a free list and are reused.

use crate::gc::header::GcHeader;
use crate::gc::string_table::StringTable;
use crate::lua_value::{Closure, LuaStr, LuaTable, LuaValue, Upvalue, Userdata};
use crate::lua_vm::LuaThread;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            #[inline(always)]
            pub fn index(self) -> u32 {
                self.0
            }
        }
    };
}

define_id!(StringId);
define_id!(TableId);
define_id!(ClosureId);
define_id!(UpvalueId);
define_id!(UserdataId);
define_id!(ThreadId);

/// Reference to any collectable object, the unit of the gray lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRef {
    String(StringId),
    Table(TableId),
    Closure(ClosureId),
    Upvalue(UpvalueId),
    Userdata(UserdataId),
    Thread(ThreadId),
}

pub struct GcBox<T> {
    pub header: GcHeader,
    pub data: T,
}

/// Slot vector + free list. Slot indices are stable for the lifetime of
/// the object, which is what makes ids usable as references.
pub struct Arena<T> {
    slots: Vec<Option<GcBox<T>>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, data: T, current_white: u8, size: u32) -> u32 {
        self.live += 1;
        let boxed = GcBox {
            header: GcHeader::with_white(current_white, size),
            data,
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(boxed);
            idx
        } else {
            self.slots.push(Some(boxed));
            (self.slots.len() - 1) as u32
        }
    }

    #[inline(always)]
    pub fn get(&self, idx: u32) -> Option<&GcBox<T>> {
        self.slots.get(idx as usize).and_then(|s| s.as_ref())
    }

    #[inline(always)]
    pub fn get_mut(&mut self, idx: u32) -> Option<&mut GcBox<T>> {
        self.slots.get_mut(idx as usize).and_then(|s| s.as_mut())
    }

    /// Direct data access. Ids are only produced by `alloc` and only
    /// invalidated by the sweep, which never frees a reachable object,
    /// so a held id is always valid.
    #[inline(always)]
    pub fn data(&self, idx: u32) -> &T {
        &self.slots[idx as usize]
            .as_ref()
            .expect("dangling gc id")
            .data
    }

    #[inline(always)]
    pub fn data_mut(&mut self, idx: u32) -> &mut T {
        &mut self.slots[idx as usize]
            .as_mut()
            .expect("dangling gc id")
            .data
    }

    #[inline(always)]
    pub fn header(&self, idx: u32) -> &GcHeader {
        &self.slots[idx as usize]
            .as_ref()
            .expect("dangling gc id")
            .header
    }

    #[inline(always)]
    pub fn header_mut(&mut self, idx: u32) -> &mut GcHeader {
        &mut self.slots[idx as usize]
            .as_mut()
            .expect("dangling gc id")
            .header
    }

    #[inline(always)]
    pub fn contains(&self, idx: u32) -> bool {
        self.slots
            .get(idx as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Free a slot, returning the byte estimate charged at allocation.
    pub fn free(&mut self, idx: u32) -> usize {
        if let Some(slot) = self.slots.get_mut(idx as usize) {
            if let Some(boxed) = slot.take() {
                self.free.push(idx);
                self.live -= 1;
                return boxed.header.size as usize;
            }
        }
        0
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots the sweep cursor must visit (live or not).
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &GcBox<T>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|b| (i as u32, b)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut GcBox<T>)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|b| (i as u32, b)))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Every collectable object in the state, one arena per kind.
pub struct ObjectPool {
    pub strings: Arena<LuaStr>,
    pub tables: Arena<LuaTable>,
    pub closures: Arena<Closure>,
    pub upvalues: Arena<Upvalue>,
    pub userdata: Arena<Userdata>,
    pub threads: Arena<LuaThread>,
    pub string_table: StringTable,
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            strings: Arena::new(),
            tables: Arena::new(),
            closures: Arena::new(),
            upvalues: Arena::new(),
            userdata: Arena::new(),
            threads: Arena::new(),
            string_table: StringTable::new(),
        }
    }

    /// Intern a byte string; returns the id and the bytes newly charged
    /// to the allocator (0 when the string already existed).
    pub fn intern(&mut self, bytes: &[u8], current_white: u8) -> (StringId, usize) {
        self.string_table
            .intern(&mut self.strings, bytes, current_white)
    }

    /// Free a dead string: unlink it from the interner, then release the
    /// arena slot. Returns the refunded byte estimate.
    pub fn remove_string(&mut self, id: StringId) -> usize {
        self.string_table.remove(&self.strings, id);
        self.strings.free(id.0)
    }

    #[inline(always)]
    pub fn string(&self, id: StringId) -> &LuaStr {
        self.strings.data(id.0)
    }

    #[inline(always)]
    pub fn table(&self, id: TableId) -> &LuaTable {
        self.tables.data(id.0)
    }

    #[inline(always)]
    pub fn table_mut(&mut self, id: TableId) -> &mut LuaTable {
        self.tables.data_mut(id.0)
    }

    /// Split borrow for table mutation that needs string hashes.
    #[inline(always)]
    pub fn table_and_strings(&mut self, id: TableId) -> (&mut LuaTable, &Arena<LuaStr>) {
        (self.tables.data_mut(id.0), &self.strings)
    }

    #[inline(always)]
    pub fn closure(&self, id: ClosureId) -> &Closure {
        self.closures.data(id.0)
    }

    #[inline(always)]
    pub fn closure_mut(&mut self, id: ClosureId) -> &mut Closure {
        self.closures.data_mut(id.0)
    }

    #[inline(always)]
    pub fn upvalue(&self, id: UpvalueId) -> &Upvalue {
        self.upvalues.data(id.0)
    }

    #[inline(always)]
    pub fn upvalue_mut(&mut self, id: UpvalueId) -> &mut Upvalue {
        self.upvalues.data_mut(id.0)
    }

    #[inline(always)]
    pub fn userdata_ref(&self, id: UserdataId) -> &Userdata {
        self.userdata.data(id.0)
    }

    #[inline(always)]
    pub fn userdata_mut(&mut self, id: UserdataId) -> &mut Userdata {
        self.userdata.data_mut(id.0)
    }

    #[inline(always)]
    pub fn thread(&self, id: ThreadId) -> &LuaThread {
        self.threads.data(id.0)
    }

    #[inline(always)]
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut LuaThread {
        self.threads.data_mut(id.0)
    }

    /// One open upvalue per (thread, slot): return the existing one or
    /// allocate and splice a new one into the thread's ordered list.
    /// The second component is the byte cost of a fresh allocation.
    pub fn find_or_create_upvalue(
        &mut self,
        thread: ThreadId,
        index: usize,
        current_white: u8,
    ) -> (UpvalueId, usize) {
        if let Some(id) = self.threads.data(thread.0).find_open_upvalue(index) {
            return (id, 0);
        }
        let size = (std::mem::size_of::<Upvalue>() + 16) as u32;
        let idx = self
            .upvalues
            .alloc(Upvalue::Open { thread, index }, current_white, size);
        let id = UpvalueId(idx);
        self.threads.data_mut(thread.0).link_open_upvalue(index, id);
        (id, size as usize)
    }

    pub fn header_of(&self, r: GcRef) -> &GcHeader {
        match r {
            GcRef::String(id) => self.strings.header(id.0),
            GcRef::Table(id) => self.tables.header(id.0),
            GcRef::Closure(id) => self.closures.header(id.0),
            GcRef::Upvalue(id) => self.upvalues.header(id.0),
            GcRef::Userdata(id) => self.userdata.header(id.0),
            GcRef::Thread(id) => self.threads.header(id.0),
        }
    }

    pub fn header_of_mut(&mut self, r: GcRef) -> &mut GcHeader {
        match r {
            GcRef::String(id) => self.strings.header_mut(id.0),
            GcRef::Table(id) => self.tables.header_mut(id.0),
            GcRef::Closure(id) => self.closures.header_mut(id.0),
            GcRef::Upvalue(id) => self.upvalues.header_mut(id.0),
            GcRef::Userdata(id) => self.userdata.header_mut(id.0),
            GcRef::Thread(id) => self.threads.header_mut(id.0),
        }
    }

    /// GcRef of a value, if it is collectable.
    pub fn value_ref(v: &LuaValue) -> Option<GcRef> {
        match *v {
            LuaValue::String(id) => Some(GcRef::String(id)),
            LuaValue::Table(id) => Some(GcRef::Table(id)),
            LuaValue::Function(id) => Some(GcRef::Closure(id)),
            LuaValue::Userdata(id) => Some(GcRef::Userdata(id)),
            LuaValue::Thread(id) => Some(GcRef::Thread(id)),
            _ => None,
        }
    }

    /// Liveness check backing the stack-write assertion: a collectable
    /// value must refer to an occupied slot that is not condemned.
    #[cfg(debug_assertions)]
    pub fn check_liveness(&self, v: &LuaValue, other_white: u8) -> bool {
        match Self::value_ref(v) {
            Some(r) => {
                let occupied = match r {
                    GcRef::String(id) => self.strings.contains(id.0),
                    GcRef::Table(id) => self.tables.contains(id.0),
                    GcRef::Closure(id) => self.closures.contains(id.0),
                    GcRef::Upvalue(id) => self.upvalues.contains(id.0),
                    GcRef::Userdata(id) => self.userdata.contains(id.0),
                    GcRef::Thread(id) => self.threads.contains(id.0),
                };
                occupied && !self.header_of(r).is_dead(other_white)
            }
            None => true,
        }
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}
