//! Reusable byte buffers handed between the engine, log nodes and recovery.

/// Default size of a single log buffer (16 KB).
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 16 * 1024;

/// Default number of buffers in a set.
pub const DEFAULT_LOG_BUFFER_COUNT: usize = 2;

/// A set of byte buffers.
///
/// Log nodes keep one as staging memory for encoding frames; recovery
/// borrows one from the caller as scratch space for decoding them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSet {
    buffers: Vec<Vec<u8>>,
}

impl BufferSet {
    /// Allocates `count` empty buffers with `size` bytes of capacity each.
    pub fn with_capacity(count: usize, size: usize) -> Self {
        Self {
            buffers: (0..count).map(|_| Vec::with_capacity(size)).collect(),
        }
    }

    /// Number of buffers in the set.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true if the set holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total capacity across all buffers, in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.buffers.iter().map(Vec::capacity).sum()
    }

    /// Returns the first buffer, adding one if the set is empty.
    pub fn primary(&mut self) -> &mut Vec<u8> {
        if self.buffers.is_empty() {
            self.buffers.push(Vec::with_capacity(DEFAULT_LOG_BUFFER_SIZE));
        }
        &mut self.buffers[0]
    }

    /// Returns the buffer at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Vec<u8>> {
        self.buffers.get_mut(index)
    }

    /// Empties every buffer while keeping its allocation.
    pub fn clear(&mut self) {
        self.buffers.iter_mut().for_each(Vec::clear);
    }

    /// Consumes the set, returning the raw buffers.
    pub fn into_inner(self) -> Vec<Vec<u8>> {
        self.buffers
    }
}

impl From<Vec<Vec<u8>>> for BufferSet {
    fn from(buffers: Vec<Vec<u8>>) -> Self {
        Self { buffers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_capacity() {
        let set = BufferSet::with_capacity(3, 128);
        assert_eq!(set.len(), 3);
        assert!(set.capacity_bytes() >= 3 * 128);
    }

    #[test]
    fn test_primary_on_empty_set() {
        let mut set = BufferSet::default();
        assert!(set.is_empty());
        set.primary().extend_from_slice(b"abc");
        assert_eq!(set.len(), 1);
        assert_eq!(set.get_mut(0).unwrap().as_slice(), b"abc");
    }

    #[test]
    fn test_clear_keeps_buffers() {
        let mut set = BufferSet::with_capacity(2, 16);
        set.primary().extend_from_slice(b"data");
        set.clear();
        assert_eq!(set.len(), 2);
        assert!(set.primary().is_empty());
        assert_eq!(set.into_inner().len(), 2);
    }
}
