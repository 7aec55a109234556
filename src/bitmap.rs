//! An array of [`BitmapChunk`]s sized to cover one arena's block count.
//!
//! Every per-block tracking set an [`crate::descriptor::ArenaDescriptor`]
//! owns (free, committed, purge, dirty, abandoned-per-bin) is one of
//! these. The only state this level adds over a raw chunk array is the
//! thread-sharded search cursor that spreads concurrent claims across
//! chunks instead of funnelling them all through chunk 0.

use std::sync::atomic::{AtomicUsize, Ordering::*};

use crate::bitmap_chunk::{BitmapChunk, CHUNK_BITS};
use crate::cache_line::CacheAligned;

/// Which state a [`Bitmap::xset_range`] call is writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Set,
    Clear,
}

pub struct Bitmap {
    chunks: Box<[BitmapChunk]>,
    /// Rotates on every find-and-clear attempt so back-to-back calls
    /// from the same thread don't all retry the same contended chunk.
    cursor: CacheAligned<AtomicUsize>,
}

impl Bitmap {
    /// Builds a bitmap covering at least `bit_count` bits (rounded up to
    /// a whole number of chunks), every bit initialized to `all_set`.
    pub fn new(bit_count: usize, all_set: bool) -> Self {
        let chunk_count = ((bit_count + CHUNK_BITS - 1) / CHUNK_BITS).max(1);
        let chunks = (0..chunk_count)
            .map(|_| BitmapChunk::new(all_set))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Bitmap {
            chunks,
            cursor: CacheAligned::new(AtomicUsize::new(0)),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn bit_capacity(&self) -> usize {
        self.chunks.len() * CHUNK_BITS
    }

    fn for_each_chunk_range<T>(
        &self,
        start: usize,
        n: usize,
        mut f: impl FnMut(&BitmapChunk, usize, usize) -> T,
        fold: impl Fn(T, T) -> T,
        init: T,
    ) -> T {
        let mut bit = start;
        let mut remaining = n;
        let mut acc = init;
        while remaining > 0 {
            let chunk_idx = bit / CHUNK_BITS;
            let offset = bit % CHUNK_BITS;
            let take = remaining.min(CHUNK_BITS - offset);
            acc = fold(acc, f(&self.chunks[chunk_idx], offset, take));
            bit += take;
            remaining -= take;
        }
        acc
    }

    /// True iff every bit in `[start, start+n)` is set.
    pub fn is_range_set(&self, start: usize, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        self.for_each_chunk_range(
            start,
            n,
            |chunk, off, take| chunk.is_range_set(off, take),
            |a, b| a && b,
            true,
        )
    }

    /// True iff every bit in `[start, start+n)` is clear.
    pub fn is_range_clear(&self, start: usize, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        self.for_each_chunk_range(
            start,
            n,
            |chunk, off, take| chunk.is_range_clear(off, take),
            |a, b| a && b,
            true,
        )
    }

    /// Writes `[start, start+n)` to `toggle`'s state across as many
    /// chunks as it spans. Returns `(all_were_already_in_state,
    /// all_were_in_opposite_state)`, ANDed per chunk — see
    /// [`BitmapChunk::xset_range`] for why both come back from one pass.
    pub fn xset_range(&self, toggle: Toggle, start: usize, n: usize) -> (bool, bool) {
        if n == 0 {
            return (true, true);
        }
        let set = toggle == Toggle::Set;
        self.for_each_chunk_range(
            start,
            n,
            |chunk, off, take| chunk.xset_range(off, take, set),
            |a: (bool, bool), b: (bool, bool)| (a.0 && b.0, a.1 && b.1),
            (true, true),
        )
    }

    /// Re-claims an exact, already-known range from this bitmap
    /// (treated as a free set): succeeds only if every bit in
    /// `[start, start+n)` was free, with no partial effect otherwise.
    /// Chunks are claimed left to right; a conflict partway through
    /// rolls back every chunk already claimed by this call before
    /// returning `false`, since nothing else can have legitimately
    /// claimed those bits while this call held them cleared.
    pub(crate) fn try_clear_exact_range(&self, start: usize, n: usize) -> bool {
        let mut bit = start;
        let mut remaining = n;
        let mut claimed: Vec<(usize, usize, usize)> = Vec::new();

        while remaining > 0 {
            let chunk_idx = bit / CHUNK_BITS;
            let offset = bit % CHUNK_BITS;
            let take = remaining.min(CHUNK_BITS - offset);

            if self.chunks[chunk_idx].try_claim_exact(offset, take) {
                claimed.push((chunk_idx, offset, take));
                bit += take;
                remaining -= take;
            } else {
                for (idx, off, t) in claimed {
                    self.chunks[idx].set_range(off, t);
                }
                return false;
            }
        }
        true
    }

    /// Searches for `n` consecutive free bits, starting the scan at a
    /// chunk derived from `tseq` (the caller's thread sequence number)
    /// plus an internal rotating cursor. Cannot span chunks: `n` must be
    /// `<= CHUNK_BITS`.
    pub fn try_find_and_clear_n(&self, tseq: usize, n: usize) -> Option<usize> {
        if n == 0 || n > CHUNK_BITS {
            return None;
        }
        let chunk_count = self.chunks.len();
        let rotation = self.cursor.fetch_add(1, Relaxed);
        let start_chunk = tseq.wrapping_add(rotation) % chunk_count;

        for i in 0..chunk_count {
            let idx = (start_chunk + i) % chunk_count;
            if let Some(local) = self.chunks[idx].try_find_and_clear_n(n, 0) {
                return Some(idx * CHUNK_BITS + local);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_multiple_chunks() {
        let bm = Bitmap::new(CHUNK_BITS * 3, true);
        assert_eq!(bm.chunk_count(), 3);
        assert!(bm.is_range_set(0, CHUNK_BITS * 3));

        let (all_already_clear, _) = bm.xset_range(Toggle::Clear, CHUNK_BITS - 4, 8);
        assert!(!all_already_clear);
        assert!(bm.is_range_clear(CHUNK_BITS - 4, 8));
    }

    #[test]
    fn find_and_clear_cannot_span_a_chunk() {
        let bm = Bitmap::new(CHUNK_BITS * 2, true);
        assert_eq!(bm.try_find_and_clear_n(0, CHUNK_BITS + 1), None);
    }

    #[test]
    fn different_tseq_values_spread_the_scan() {
        let bm = Bitmap::new(CHUNK_BITS * 4, true);
        let a = bm.try_find_and_clear_n(0, 4).unwrap();
        let b = bm.try_find_and_clear_n(1, 4).unwrap();
        // Both succeed; which chunk they land in depends on tseq/cursor,
        // but neither should silently fail on an otherwise-empty bitmap.
        assert!(a < bm.bit_capacity());
        assert!(b < bm.bit_capacity());
    }

    #[test]
    fn falls_through_to_next_chunk_when_first_is_full() {
        let bm = Bitmap::new(CHUNK_BITS * 2, false);
        // Only the second chunk has free bits.
        bm.xset_range(Toggle::Set, CHUNK_BITS, CHUNK_BITS);
        let start = bm.try_find_and_clear_n(0, 4).unwrap();
        assert!(start >= CHUNK_BITS);
    }

    #[test]
    fn try_clear_exact_range_spanning_chunks_succeeds_when_all_free() {
        let bm = Bitmap::new(CHUNK_BITS * 2, true);
        let span = CHUNK_BITS - 4..CHUNK_BITS + 4;
        assert!(bm.try_clear_exact_range(span.start, span.len()));
        assert!(bm.is_range_clear(span.start, span.len()));
    }

    #[test]
    fn try_clear_exact_range_rolls_back_on_partial_conflict() {
        let bm = Bitmap::new(CHUNK_BITS * 2, true);
        // Pre-claim one bit in the second chunk so the spanning attempt fails there.
        bm.xset_range(Toggle::Clear, CHUNK_BITS + 2, 1);

        let span_start = CHUNK_BITS - 4;
        let span_len = 8;
        assert!(!bm.try_clear_exact_range(span_start, span_len));
        // The first chunk's portion must have been rolled back to free.
        assert!(bm.is_range_set(span_start, CHUNK_BITS - span_start));
    }
}
