// Hybrid array + hash table.
//
// Integer keys 1..=array.len() live in the dense array part; everything
// else lives in a power-of-two node array using main-position chaining
// with Brent-style eviction: a colliding key that is not in its own main
// position is moved out of the way, so every chain starts at the main
// position of its first key. Free nodes are found by a `lastfree` cursor
// that only moves down; when it hits the bottom the table rehashes,
// re-splitting keys between array and hash by an integer-key census.

use bitflags::bitflags;

use crate::gc::{Arena, TableId};
use crate::lua_value::{LuaStr, LuaValue};

bitflags! {
    /// Cache of "this metamethod is definitely absent" bits, one per
    /// fast event. Any store into the table invalidates the cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TmAbsent: u8 {
        const INDEX    = 1 << 0;
        const NEWINDEX = 1 << 1;
        const GC       = 1 << 2;
        const MODE     = 1 << 3;
        const EQ       = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeKey {
    /// Never used, or cleared by a rehash. Free for insertion.
    Empty,
    /// Removed collectable key: invisible to lookups, but the node stays
    /// in its chain so collisions behind it remain reachable.
    Dead(LuaValue),
    Key(LuaValue),
}

#[derive(Debug, Clone, Copy)]
struct Node {
    key: NodeKey,
    val: LuaValue,
    /// Next node index in the collision chain, -1 for end.
    next: i32,
}

const EMPTY_NODE: Node = Node {
    key: NodeKey::Empty,
    val: LuaValue::Nil,
    next: -1,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    NilKey,
    NanKey,
    InvalidNext,
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    nodes: Vec<Node>,
    /// Free-slot candidates live strictly below this index.
    lastfree: usize,
    pub metatable: Option<TableId>,
    pub flags: TmAbsent,
}

/// Type-specific key hash. String hashes are cached in the pool; object
/// keys hash their id salted with the kind so ids of different kinds do
/// not collide systematically.
fn key_hash(key: &LuaValue, strs: &Arena<LuaStr>) -> u32 {
    match key {
        LuaValue::Number(n) => {
            let n = if *n == 0.0 { 0.0 } else { *n };
            let bits = n.to_bits();
            (bits >> 32) as u32 ^ bits as u32
        }
        LuaValue::String(id) => strs.data(id.index()).hash(),
        LuaValue::Boolean(b) => *b as u32,
        LuaValue::LightUserdata(p) => (*p as u32) ^ ((*p >> 32) as u32),
        LuaValue::Table(id) => id.index().wrapping_mul(0x9E37_79B9) ^ 0x05,
        LuaValue::Function(id) => id.index().wrapping_mul(0x9E37_79B9) ^ 0x06,
        LuaValue::Userdata(id) => id.index().wrapping_mul(0x9E37_79B9) ^ 0x07,
        LuaValue::Thread(id) => id.index().wrapping_mul(0x9E37_79B9) ^ 0x08,
        LuaValue::Nil => 0,
    }
}

/// Array-part index for a key: an exact integer in 1..=asize.
#[inline]
fn array_index(key: &LuaValue, asize: usize) -> Option<usize> {
    let i = key.as_exact_int()?;
    if i >= 1 && (i as u64) <= asize as u64 {
        Some((i - 1) as usize)
    } else {
        None
    }
}

#[inline]
fn ceil_log2(mut n: usize) -> usize {
    debug_assert!(n > 0);
    n -= 1;
    (usize::BITS - n.leading_zeros()) as usize
}

impl LuaTable {
    pub fn new(narray: usize, nhash: usize) -> Self {
        let mut t = LuaTable {
            array: Vec::new(),
            nodes: Vec::new(),
            lastfree: 0,
            metatable: None,
            flags: TmAbsent::empty(),
        };
        if narray > 0 {
            t.array = vec![LuaValue::Nil; narray];
        }
        if nhash > 0 {
            t.set_node_size(nhash.next_power_of_two());
        }
        t
    }

    fn set_node_size(&mut self, size: usize) {
        self.nodes = vec![EMPTY_NODE; size];
        self.lastfree = size;
    }

    #[inline]
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    #[inline]
    pub fn node_len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    fn main_position(&self, key: &LuaValue, strs: &Arena<LuaStr>) -> usize {
        debug_assert!(!self.nodes.is_empty());
        key_hash(key, strs) as usize & (self.nodes.len() - 1)
    }

    fn node_key_value(key: &NodeKey) -> Option<&LuaValue> {
        match key {
            NodeKey::Key(v) => Some(v),
            _ => None,
        }
    }

    /// Main position of whatever occupies a node, dead keys included
    /// (their stored value still hashes).
    fn node_main_position(&self, pos: usize, strs: &Arena<LuaStr>) -> usize {
        match &self.nodes[pos].key {
            NodeKey::Key(v) | NodeKey::Dead(v) => self.main_position(v, strs),
            NodeKey::Empty => pos,
        }
    }

    // ---- raw get ----

    pub fn get(&self, key: &LuaValue, strs: &Arena<LuaStr>) -> LuaValue {
        if let Some(i) = array_index(key, self.array.len()) {
            return self.array[i];
        }
        if key.is_nil() {
            return LuaValue::Nil;
        }
        self.hash_get(key, strs)
    }

    pub fn get_int(&self, i: i64, strs: &Arena<LuaStr>) -> LuaValue {
        if i >= 1 && (i as u64) <= self.array.len() as u64 {
            return self.array[(i - 1) as usize];
        }
        self.hash_get(&LuaValue::Number(i as f64), strs)
    }

    fn hash_get(&self, key: &LuaValue, strs: &Arena<LuaStr>) -> LuaValue {
        if self.nodes.is_empty() {
            return LuaValue::Nil;
        }
        let mut pos = self.main_position(key, strs);
        loop {
            let node = &self.nodes[pos];
            if let Some(k) = Self::node_key_value(&node.key) {
                if k.raw_equal(key) {
                    return node.val;
                }
            }
            if node.next < 0 {
                return LuaValue::Nil;
            }
            pos = node.next as usize;
        }
    }

    // ---- raw set ----

    pub fn set(
        &mut self,
        key: LuaValue,
        val: LuaValue,
        strs: &Arena<LuaStr>,
    ) -> Result<(), TableError> {
        self.flags = TmAbsent::empty();
        match &key {
            LuaValue::Nil => return Err(TableError::NilKey),
            LuaValue::Number(n) if n.is_nan() => return Err(TableError::NanKey),
            _ => {}
        }
        if let Some(i) = array_index(&key, self.array.len()) {
            self.array[i] = val;
            return Ok(());
        }
        self.hash_set(key, val, strs);
        Ok(())
    }

    pub fn set_int(&mut self, i: i64, val: LuaValue, strs: &Arena<LuaStr>) {
        self.flags = TmAbsent::empty();
        if i >= 1 && (i as u64) <= self.array.len() as u64 {
            self.array[(i - 1) as usize] = val;
            return;
        }
        self.hash_set(LuaValue::Number(i as f64), val, strs);
    }

    fn hash_set(&mut self, key: LuaValue, val: LuaValue, strs: &Arena<LuaStr>) {
        // in-place write when the key already has a node
        if !self.nodes.is_empty() {
            let mut pos = self.main_position(&key, strs);
            loop {
                let node = &self.nodes[pos];
                if let Some(k) = Self::node_key_value(&node.key) {
                    if k.raw_equal(&key) {
                        self.nodes[pos].val = val;
                        if val.is_nil() && key.is_collectable() {
                            // deleted entry: hide the key from lookups but
                            // keep the node chained
                            self.nodes[pos].key = NodeKey::Dead(key);
                        }
                        return;
                    }
                }
                if node.next < 0 {
                    break;
                }
                pos = node.next as usize;
            }
        }
        if val.is_nil() {
            return; // absent key assigned nil: nothing to record
        }
        self.new_key(key, val, strs);
    }

    fn free_pos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if matches!(self.nodes[self.lastfree].key, NodeKey::Empty) {
                return Some(self.lastfree);
            }
        }
        None
    }

    fn new_key(&mut self, key: LuaValue, val: LuaValue, strs: &Arena<LuaStr>) {
        if self.nodes.is_empty() {
            self.rehash(Some(&key), strs);
            if let Some(i) = array_index(&key, self.array.len()) {
                self.array[i] = val;
            } else {
                self.hash_set(key, val, strs);
            }
            return;
        }
        let mp = self.main_position(&key, strs);
        if !matches!(self.nodes[mp].key, NodeKey::Empty) {
            let Some(f) = self.free_pos() else {
                self.rehash(Some(&key), strs);
                // the rehash may have widened the array part far enough
                // to take this key directly
                if let Some(i) = array_index(&key, self.array.len()) {
                    self.array[i] = val;
                } else {
                    self.hash_set(key, val, strs);
                }
                return;
            };
            let other_main = self.node_main_position(mp, strs);
            if other_main != mp {
                // the occupant is a squatter: relink its predecessor and
                // move it to the free node, then claim the main position
                let mut prev = other_main;
                while self.nodes[prev].next != mp as i32 {
                    debug_assert!(self.nodes[prev].next >= 0);
                    prev = self.nodes[prev].next as usize;
                }
                self.nodes[prev].next = f as i32;
                self.nodes[f] = self.nodes[mp];
                self.nodes[mp] = Node {
                    key: NodeKey::Key(key),
                    val,
                    next: -1,
                };
            } else {
                // the occupant owns this position: new key goes to the
                // free node, spliced right after the main position
                self.nodes[f] = Node {
                    key: NodeKey::Key(key),
                    val,
                    next: self.nodes[mp].next,
                };
                self.nodes[mp].next = f as i32;
            }
        } else {
            self.nodes[mp] = Node {
                key: NodeKey::Key(key),
                val,
                next: -1,
            };
        }
    }

    // ---- rehash ----

    /// Census of integer keys: `nums[i]` counts live keys in
    /// (2^(i-1), 2^i]. The new array size is the largest 2^i such that
    /// more than half of [1..2^i] would be occupied.
    fn rehash(&mut self, extra: Option<&LuaValue>, strs: &Arena<LuaStr>) {
        let mut nums = [0usize; usize::BITS as usize + 1];
        let mut total_int = 0usize;
        let mut total = 0usize;

        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                nums[ceil_log2(i + 1)] += 1;
                total_int += 1;
                total += 1;
            }
        }
        for node in &self.nodes {
            if let NodeKey::Key(k) = &node.key {
                if !node.val.is_nil() {
                    total += 1;
                    if let Some(i) = k.as_exact_int() {
                        if i >= 1 {
                            nums[ceil_log2(i as usize)] += 1;
                            total_int += 1;
                        }
                    }
                }
            }
        }
        if let Some(k) = extra {
            total += 1;
            if let Some(i) = k.as_exact_int() {
                if i >= 1 {
                    nums[ceil_log2(i as usize)] += 1;
                    total_int += 1;
                }
            }
        }

        let (asize, into_array) = Self::compute_sizes(&nums, total_int);
        self.resize(asize, total - into_array, strs);
    }

    fn compute_sizes(nums: &[usize], total_int: usize) -> (usize, usize) {
        let mut asize = 0usize;
        let mut into_array = 0usize;
        let mut accumulated = 0usize;
        let mut two_to_i = 1usize;
        let mut i = 0usize;
        while two_to_i / 2 < total_int {
            accumulated += nums[i];
            if accumulated > two_to_i / 2 {
                asize = two_to_i;
                into_array = accumulated;
            }
            if two_to_i > usize::MAX / 2 {
                break;
            }
            two_to_i *= 2;
            i += 1;
        }
        (asize, into_array)
    }

    pub fn resize(&mut self, nasize: usize, nhsize: usize, strs: &Arena<LuaStr>) {
        let old_array = std::mem::take(&mut self.array);
        let old_nodes = std::mem::take(&mut self.nodes);
        self.lastfree = 0;

        self.array = vec![LuaValue::Nil; nasize];
        if nhsize > 0 {
            self.set_node_size(nhsize.next_power_of_two());
        }

        // keep the surviving array prefix, spill the rest into the hash
        for (i, v) in old_array.into_iter().enumerate() {
            if v.is_nil() {
                continue;
            }
            if i < nasize {
                self.array[i] = v;
            } else {
                self.hash_set(LuaValue::Number((i + 1) as f64), v, strs);
            }
        }
        for node in old_nodes {
            if let NodeKey::Key(k) = node.key {
                if !node.val.is_nil() {
                    if let Some(i) = array_index(&k, self.array.len()) {
                        self.array[i] = node.val;
                    } else {
                        self.hash_set(k, node.val, strs);
                    }
                }
            }
        }
    }

    /// Grow or shrink only the array part, keeping the hash population.
    pub fn resize_array(&mut self, nasize: usize, strs: &Arena<LuaStr>) {
        let live_hash = self
            .nodes
            .iter()
            .filter(|n| matches!(n.key, NodeKey::Key(_)) && !n.val.is_nil())
            .count();
        self.resize(nasize, live_hash, strs);
    }

    // ---- length ----

    /// A boundary: some i with t[i] ~= nil and t[i+1] == nil. For a
    /// sequence this is its cardinality; sparse tables get one valid
    /// boundary, not necessarily the largest index.
    pub fn length(&self, strs: &Arena<LuaStr>) -> i64 {
        let alen = self.array.len();
        if alen > 0 && self.array[alen - 1].is_nil() {
            // boundary is inside the array: binary search
            let mut i = 0usize;
            let mut j = alen;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i as i64;
        }
        if self.nodes.is_empty() {
            return alen as i64;
        }
        self.unbound_search(alen as i64, strs)
    }

    fn unbound_search(&self, mut i: i64, strs: &Arena<LuaStr>) -> i64 {
        let mut j = i.saturating_add(1);
        while !self.get_int(j, strs).is_nil() {
            i = j;
            if j > i64::MAX / 2 {
                // pathological table: fall back to a linear scan
                let mut k = 1;
                while !self.get_int(k, strs).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m, strs).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ---- iteration ----

    /// Generic-for iteration order: array part, then hash part. Dead
    /// keys are matched (so iteration can continue past a deleted
    /// entry) but never produced.
    pub fn next(
        &self,
        key: &LuaValue,
        strs: &Arena<LuaStr>,
    ) -> Result<Option<(LuaValue, LuaValue)>, TableError> {
        let alen = self.array.len();
        let start = self.find_iter_index(key, strs)?;
        for i in start..alen {
            if !self.array[i].is_nil() {
                return Ok(Some((LuaValue::Number((i + 1) as f64), self.array[i])));
            }
        }
        let hstart = start.saturating_sub(alen);
        for pos in hstart..self.nodes.len() {
            let node = &self.nodes[pos];
            if let NodeKey::Key(k) = &node.key {
                if !node.val.is_nil() {
                    return Ok(Some((*k, node.val)));
                }
            }
        }
        Ok(None)
    }

    /// Position after `key` in iteration space: array slots first (index
    /// i), hash nodes after (index alen + pos).
    fn find_iter_index(&self, key: &LuaValue, strs: &Arena<LuaStr>) -> Result<usize, TableError> {
        if key.is_nil() {
            return Ok(0);
        }
        let alen = self.array.len();
        if let Some(i) = array_index(key, alen) {
            return Ok(i + 1);
        }
        if self.nodes.is_empty() {
            return Err(TableError::InvalidNext);
        }
        let mut pos = self.main_position(key, strs);
        loop {
            let node = &self.nodes[pos];
            let matched = match &node.key {
                NodeKey::Key(k) | NodeKey::Dead(k) => k.raw_equal(key),
                NodeKey::Empty => false,
            };
            if matched {
                return Ok(alen + pos + 1);
            }
            if node.next < 0 {
                return Err(TableError::InvalidNext);
            }
            pos = node.next as usize;
        }
    }

    // ---- GC access ----

    /// All live (key, value) pairs, array part included, for traversal.
    pub fn gc_entries(&self) -> Vec<(LuaValue, LuaValue)> {
        let mut out = Vec::new();
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                out.push((LuaValue::Number((i + 1) as f64), *v));
            }
        }
        for node in &self.nodes {
            if let NodeKey::Key(k) = &node.key {
                if !node.val.is_nil() {
                    out.push((*k, node.val));
                }
            }
        }
        out
    }

    /// Weak-table cleanup support: array slots by index.
    pub fn array_value(&self, i: usize) -> LuaValue {
        self.array[i]
    }

    pub fn clear_array_slot(&mut self, i: usize) {
        self.array[i] = LuaValue::Nil;
    }

    /// Weak-table cleanup support: node entries by position.
    pub fn node_entry(&self, pos: usize) -> Option<(LuaValue, LuaValue)> {
        let node = &self.nodes[pos];
        match &node.key {
            NodeKey::Key(k) if !node.val.is_nil() => Some((*k, node.val)),
            _ => None,
        }
    }

    /// Remove a node entry the GC proved unreachable: value goes nil,
    /// a collectable key turns into a dead sentinel.
    pub fn clear_node_entry(&mut self, pos: usize) {
        let node = &mut self.nodes[pos];
        node.val = LuaValue::Nil;
        if let NodeKey::Key(k) = node.key {
            if k.is_collectable() {
                node.key = NodeKey::Dead(k);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs() -> Arena<LuaStr> {
        Arena::new()
    }

    fn num(n: f64) -> LuaValue {
        LuaValue::Number(n)
    }

    #[test]
    fn array_fast_path_and_hash_agree() {
        let a = strs();
        let mut t = LuaTable::new(4, 0);
        for i in 1..=10 {
            t.set_int(i, num(i as f64 * 10.0), &a);
        }
        for i in 1..=10 {
            assert_eq!(t.get_int(i, &a), num(i as f64 * 10.0));
            // same lookup through the generic path
            assert_eq!(t.get(&num(i as f64), &a), num(i as f64 * 10.0));
        }
    }

    #[test]
    fn sequence_length() {
        let a = strs();
        let mut t = LuaTable::new(0, 0);
        for i in 1..=3 {
            t.set_int(i, num(1.0), &a);
        }
        assert_eq!(t.length(&a), 3);
    }

    #[test]
    fn boundary_with_hole_is_valid() {
        let a = strs();
        let mut t = LuaTable::new(0, 0);
        // {1,2,3,nil,5}
        for i in [1i64, 2, 3, 5] {
            t.set_int(i, num(i as f64), &a);
        }
        let n = t.length(&a);
        assert!(n == 3 || n == 5, "got {}", n);
        assert!(!t.get_int(n, &a).is_nil());
        assert!(t.get_int(n + 1, &a).is_nil());
    }

    #[test]
    fn deleting_keeps_chains_walkable() {
        let a = strs();
        let mut t = LuaTable::new(0, 4);
        let k1 = LuaValue::Table(TableId(100));
        let k2 = LuaValue::Table(TableId(101));
        t.set(k1, num(1.0), &a).unwrap();
        t.set(k2, num(2.0), &a).unwrap();
        t.set(k1, LuaValue::Nil, &a).unwrap();
        assert!(t.get(&k1, &a).is_nil());
        assert_eq!(t.get(&k2, &a), num(2.0));
    }

    #[test]
    fn next_iterates_everything_once() {
        let a = strs();
        let mut t = LuaTable::new(2, 2);
        t.set_int(1, num(10.0), &a);
        t.set_int(2, num(20.0), &a);
        t.set(LuaValue::Boolean(true), num(30.0), &a).unwrap();
        t.set(num(0.5), num(40.0), &a).unwrap();

        let mut seen = 0;
        let mut key = LuaValue::Nil;
        while let Some((k, _v)) = t.next(&key, &a).unwrap() {
            seen += 1;
            key = k;
            assert!(seen <= 4, "iteration did not terminate");
        }
        assert_eq!(seen, 4);
    }

    #[test]
    fn next_continues_past_deleted_entry() {
        let a = strs();
        let mut t = LuaTable::new(0, 4);
        let k1 = LuaValue::Table(TableId(7));
        t.set(k1, num(1.0), &a).unwrap();
        t.set(num(2.5), num(2.0), &a).unwrap();
        // start iterating, delete the current key, keep going
        let (first, _) = t.next(&LuaValue::Nil, &a).unwrap().unwrap();
        t.set(first, LuaValue::Nil, &a).unwrap();
        // continuing from the deleted key must not error
        let rest = t.next(&first, &a).unwrap();
        if let Some((k, _)) = rest {
            assert!(!k.raw_equal(&first));
        }
    }

    #[test]
    fn rehash_grows_array_for_dense_int_keys() {
        let a = strs();
        let mut t = LuaTable::new(0, 0);
        for i in 1..=64 {
            t.set_int(i, num(i as f64), &a);
        }
        assert!(t.array_len() >= 32, "array part {} too small", t.array_len());
        for i in 1..=64 {
            assert_eq!(t.get_int(i, &a), num(i as f64));
        }
    }

    #[test]
    fn nil_key_and_nan_key_are_rejected() {
        let a = strs();
        let mut t = LuaTable::new(0, 0);
        assert_eq!(
            t.set(LuaValue::Nil, num(1.0), &a),
            Err(TableError::NilKey)
        );
        assert_eq!(
            t.set(num(f64::NAN), num(1.0), &a),
            Err(TableError::NanKey)
        );
    }

    #[test]
    fn eviction_preserves_all_entries() {
        let a = strs();
        let mut t = LuaTable::new(0, 1);
        // plenty of non-integer keys to force collisions and rehashes
        for i in 0..200 {
            t.set(num(i as f64 + 0.5), num(i as f64), &a).unwrap();
        }
        for i in 0..200 {
            assert_eq!(t.get(&num(i as f64 + 0.5), &a), num(i as f64));
        }
    }
}
