use std::ops::Range;

/// Integer ceiling of log2(n). Returns 0 for n <= 1.
pub(crate) fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        return 0;
    }
    u32::BITS - (n - 1).leading_zeros()
}

/// Split of `count` elements into `parts` contiguous chunks.
///
/// The first `count % parts` chunks hold one extra element, so chunk sizes
/// differ by at most one. Chunks may be empty when `count < parts`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkLayout {
    base: usize,
    remainder: usize,
}

impl ChunkLayout {
    pub(crate) fn new(count: usize, parts: usize) -> Self {
        debug_assert!(parts > 0);
        Self {
            base: count / parts,
            remainder: count % parts,
        }
    }

    /// Element range of chunk `i`.
    pub(crate) fn range(&self, i: usize) -> Range<usize> {
        let start = i * self.base + i.min(self.remainder);
        let len = self.base + usize::from(i < self.remainder);
        start..start + len
    }
}
