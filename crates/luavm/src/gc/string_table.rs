// Global string interner. Every string in the state goes through here,
// so two live strings with equal bytes are always the same id and
// equality degenerates to id comparison.
//
// Buckets are keyed by the sampled content hash; a bucket holds every
// live string with that hash. The sweep phase removes dead strings from
// their bucket before freeing the arena slot.

use ahash::RandomState;
use std::collections::HashMap;

use crate::gc::header::other_white;
use crate::gc::pool::{Arena, StringId};
use crate::lua_value::{LuaStr, str_hash};

pub struct StringTable {
    buckets: HashMap<u32, Vec<StringId>, RandomState>,
    nuse: usize,
}

impl StringTable {
    pub fn new() -> Self {
        StringTable {
            buckets: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            nuse: 0,
        }
    }

    /// Find or create the interned string for `bytes`. Returns the id
    /// and the number of bytes newly allocated (0 on a hit). A hit on a
    /// condemned string resurrects it into the current white.
    pub fn intern(
        &mut self,
        strings: &mut Arena<LuaStr>,
        bytes: &[u8],
        current_white: u8,
    ) -> (StringId, usize) {
        let hash = str_hash(bytes);
        if let Some(ids) = self.buckets.get(&hash) {
            for &id in ids {
                let boxed = strings.get(id.0).expect("interner holds dead slot");
                if boxed.data.len() == bytes.len() && boxed.data.as_bytes() == bytes {
                    let header = strings.header_mut(id.0);
                    if header.is_dead(other_white(current_white)) {
                        header.change_white(current_white);
                    }
                    return (id, 0);
                }
            }
        }
        let size = (std::mem::size_of::<LuaStr>() + bytes.len()) as u32;
        let idx = strings.alloc(LuaStr::new(bytes), current_white, size);
        let id = StringId(idx);
        self.buckets.entry(hash).or_default().push(id);
        self.nuse += 1;
        (id, size as usize)
    }

    /// Called by the sweep before the arena slot is freed.
    pub fn remove(&mut self, strings: &Arena<LuaStr>, id: StringId) {
        let hash = strings.data(id.0).hash();
        if let Some(ids) = self.buckets.get_mut(&hash) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.buckets.remove(&hash);
            }
        }
        self.nuse -= 1;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nuse
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nuse == 0
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_share_one_id() {
        let mut arena = Arena::new();
        let mut tab = StringTable::new();
        let (a, created_a) = tab.intern(&mut arena, b"hello", 0);
        let (b, created_b) = tab.intern(&mut arena, b"hello", 0);
        assert_eq!(a, b);
        assert!(created_a > 0);
        assert_eq!(created_b, 0);
        assert_eq!(tab.len(), 1);
    }

    #[test]
    fn distinct_bytes_get_distinct_ids() {
        let mut arena = Arena::new();
        let mut tab = StringTable::new();
        let (a, _) = tab.intern(&mut arena, b"foo", 0);
        let (b, _) = tab.intern(&mut arena, b"bar", 0);
        assert_ne!(a, b);
        assert_eq!(tab.len(), 2);
    }

    #[test]
    fn interning_resurrects_condemned_strings() {
        let mut arena = Arena::new();
        let mut tab = StringTable::new();
        let (a, _) = tab.intern(&mut arena, b"zombie", 0);
        // flip of current white condemns white-0 objects
        let (b, created) = tab.intern(&mut arena, b"zombie", 1);
        assert_eq!(a, b);
        assert_eq!(created, 0);
        assert!(!arena.header(a.0).is_dead(other_white(1)));
    }

    #[test]
    fn remove_unlinks_from_bucket() {
        let mut arena = Arena::new();
        let mut tab = StringTable::new();
        let (a, _) = tab.intern(&mut arena, b"gone", 0);
        tab.remove(&arena, a);
        arena.free(a.0);
        assert_eq!(tab.len(), 0);
        let (b, created) = tab.intern(&mut arena, b"gone", 0);
        assert!(created > 0);
        // slot reuse may hand back the same index; it must be a live slot
        assert!(arena.contains(b.0));
    }
}
