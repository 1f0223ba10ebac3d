// Growable scratch byte buffer shared per global state: concatenation,
// number formatting and message assembly all borrow it. Reset to a
// small size at the end of each collection cycle so a one-off huge
// concat does not pin memory forever.

const RESET_SIZE: usize = 32;

pub struct MBuffer {
    data: Vec<u8>,
}

impl MBuffer {
    pub fn new() -> Self {
        MBuffer {
            data: Vec::with_capacity(RESET_SIZE),
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// End-of-cycle shrink; contents are discarded.
    pub fn reset(&mut self) {
        self.data = Vec::with_capacity(RESET_SIZE);
    }

    /// Take the accumulated bytes, leaving the buffer empty but keeping
    /// its capacity.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Default for MBuffer {
    fn default() -> Self {
        Self::new()
    }
}
