// GC object header: color and flag bits shared by every collectable kind.
//
// Two white bits implement the two-generation white scheme: at any moment
// one of them is the "current" white (live, not yet marked this cycle) and
// the other is the "dead" white (condemned, sweepable). The collector
// flips which one is current at the mark/sweep boundary, so sweeping can
// distinguish objects created after the flip from true garbage.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mark: u8 {
        const WHITE0    = 1 << 0;
        const WHITE1    = 1 << 1;
        /// Fully scanned: the object and all its outgoing references are marked.
        const BLACK     = 1 << 2;
        /// Already queued for (or past) finalization; never re-queued.
        const FINALIZED = 1 << 3;
        /// Never collected (reserved words, metamethod names).
        const FIXED     = 1 << 4;
        /// Never collected, not even on state teardown (main thread).
        const SFIXED    = 1 << 5;
        /// Table keys do not keep their referents alive.
        const WEAKKEY   = 1 << 6;
        /// Table values do not keep their referents alive.
        const WEAKVALUE = 1 << 7;
    }
}

impl Mark {
    pub const WHITES: Mark = Mark::WHITE0.union(Mark::WHITE1);
    pub const COLORS: Mark = Mark::WHITES.union(Mark::BLACK);
    pub const WEAKBITS: Mark = Mark::WEAKKEY.union(Mark::WEAKVALUE);
}

/// The white bit selected by a 0/1 index.
#[inline(always)]
pub fn white_bit(white: u8) -> Mark {
    if white == 0 { Mark::WHITE0 } else { Mark::WHITE1 }
}

/// Header embedded in every arena slot. `size` is the byte estimate
/// charged to the allocator when the object was created; the sweep
/// refunds exactly this amount.
#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    pub marked: Mark,
    pub size: u32,
}

impl GcHeader {
    /// New objects are always born in the current white.
    #[inline]
    pub fn with_white(current_white: u8, size: u32) -> Self {
        GcHeader {
            marked: white_bit(current_white),
            size,
        }
    }

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        self.marked.intersects(Mark::WHITES)
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        self.marked.contains(Mark::BLACK)
    }

    /// Gray = neither white nor black (reachable, children pending).
    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        !self.marked.intersects(Mark::COLORS)
    }

    /// Dead means "carries the non-current white": it was not reached
    /// during the mark phase that just ended.
    #[inline(always)]
    pub fn is_dead(&self, other_white: u8) -> bool {
        self.marked.contains(white_bit(other_white))
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        self.marked.intersects(Mark::FIXED | Mark::SFIXED)
    }

    #[inline(always)]
    pub fn is_finalized(&self) -> bool {
        self.marked.contains(Mark::FINALIZED)
    }

    #[inline(always)]
    pub fn make_white(&mut self, current_white: u8) {
        self.marked.remove(Mark::COLORS);
        self.marked.insert(white_bit(current_white));
    }

    #[inline(always)]
    pub fn make_gray(&mut self) {
        self.marked.remove(Mark::COLORS);
    }

    #[inline(always)]
    pub fn make_black(&mut self) {
        self.marked.remove(Mark::WHITES);
        self.marked.insert(Mark::BLACK);
    }

    /// Move a condemned object back to the live white (string
    /// resurrection in the interner).
    #[inline(always)]
    pub fn change_white(&mut self, current_white: u8) {
        self.marked.remove(Mark::WHITES);
        self.marked.insert(white_bit(current_white));
    }

    #[inline(always)]
    pub fn set_fixed(&mut self) {
        self.marked.insert(Mark::FIXED);
    }

    #[inline(always)]
    pub fn set_super_fixed(&mut self) {
        self.marked.insert(Mark::SFIXED);
    }

    #[inline(always)]
    pub fn set_finalized(&mut self) {
        self.marked.insert(Mark::FINALIZED);
    }

    #[inline(always)]
    pub fn clear_weak_bits(&mut self) {
        self.marked.remove(Mark::WEAKBITS);
    }

    #[inline(always)]
    pub fn is_key_weak(&self) -> bool {
        self.marked.contains(Mark::WEAKKEY)
    }

    #[inline(always)]
    pub fn is_value_weak(&self) -> bool {
        self.marked.contains(Mark::WEAKVALUE)
    }
}

#[inline(always)]
pub fn other_white(current_white: u8) -> u8 {
    current_white ^ 1
}
