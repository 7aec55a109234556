//! The atomic bit-field backing a fixed-width slice of a [`crate::bitmap::Bitmap`].
//!
//! A chunk never knows about the arena it belongs to; it only knows how
//! to set, clear, probe and "find-and-clear N" within its own
//! `CHUNK_BITS`-wide window. Runs may not straddle a chunk boundary —
//! that constraint is what bounds `MAX_OBJ_SIZE` (see `constants.rs`).

use std::sync::atomic::{AtomicU64, Ordering::*};

use crossbeam_utils::Backoff;

use crate::constants::{BITS_PER_CHUNK, WORDS_PER_CHUNK};

pub const CHUNK_BITS: usize = BITS_PER_CHUNK;

/// `WORDS_PER_CHUNK` atomic 64-bit words, i.e. `CHUNK_BITS` independently
/// addressable bits.
pub struct BitmapChunk {
    words: [AtomicU64; WORDS_PER_CHUNK],
}

fn word_mask(offset_in_word: u32, n: u32) -> u64 {
    if n >= 64 {
        !0
    } else {
        ((1u64 << n) - 1) << offset_in_word
    }
}

impl BitmapChunk {
    pub fn new(all_set: bool) -> Self {
        let fill = if all_set { !0u64 } else { 0u64 };
        BitmapChunk {
            words: std::array::from_fn(|_| AtomicU64::new(fill)),
        }
    }

    /// Atomically sets `[start, start+n)`. Returns true iff every bit in
    /// the range was already set beforehand.
    pub fn set_range(&self, start: usize, n: usize) -> bool {
        self.xset_range(start, n, true).0
    }

    /// Atomically clears `[start, start+n)`. Returns true iff every bit
    /// in the range was already clear beforehand.
    pub fn clear_range(&self, start: usize, n: usize) -> bool {
        self.xset_range(start, n, false).1
    }

    /// Writes `[start, start+n)` to `set`, walking the words it touches.
    /// Returns `(all_were_already_set, all_were_already_clear)` computed
    /// from the state observed immediately before each word's write —
    /// both facts fall out of the same pass, so callers needing either
    /// polarity (double-free detection wants the first, dirty/zero
    /// tracking wants the second) never need a separate, racy pre-probe.
    pub(crate) fn xset_range(&self, start: usize, n: usize, set: bool) -> (bool, bool) {
        debug_assert!(start + n <= CHUNK_BITS);
        let mut all_set = true;
        let mut all_clear = true;
        let mut bit = start;
        let mut remaining = n;

        while remaining > 0 {
            let word_idx = bit / 64;
            let in_word = (bit % 64) as u32;
            let take = remaining.min(64 - in_word as usize) as u32;
            let mask = word_mask(in_word, take);

            let prev = if set {
                self.words[word_idx].fetch_or(mask, AcqRel)
            } else {
                self.words[word_idx].fetch_and(!mask, AcqRel)
            };

            if prev & mask != mask {
                all_set = false;
            }
            if prev & mask != 0 {
                all_clear = false;
            }

            bit += take as usize;
            remaining -= take as usize;
        }

        (all_set, all_clear)
    }

    /// Non-mutating probe: true iff every bit in `[start, start+n)` is set.
    pub fn is_range_set(&self, start: usize, n: usize) -> bool {
        debug_assert!(start + n <= CHUNK_BITS);
        let mut bit = start;
        let mut remaining = n;
        while remaining > 0 {
            let word_idx = bit / 64;
            let in_word = (bit % 64) as u32;
            let take = remaining.min(64 - in_word as usize) as u32;
            let mask = word_mask(in_word, take);
            if self.words[word_idx].load(Acquire) & mask != mask {
                return false;
            }
            bit += take as usize;
            remaining -= take as usize;
        }
        true
    }

    /// Non-mutating probe: true iff every bit in `[start, start+n)` is clear.
    pub fn is_range_clear(&self, start: usize, n: usize) -> bool {
        debug_assert!(start + n <= CHUNK_BITS);
        let mut bit = start;
        let mut remaining = n;
        while remaining > 0 {
            let word_idx = bit / 64;
            let in_word = (bit % 64) as u32;
            let take = remaining.min(64 - in_word as usize) as u32;
            let mask = word_mask(in_word, take);
            if self.words[word_idx].load(Acquire) & mask != 0 {
                return false;
            }
            bit += take as usize;
            remaining -= take as usize;
        }
        true
    }

    /// Locates `n` consecutive set bits at or after `hint` and clears
    /// them in what looks to other threads like a single step: the
    /// words touched are claimed with per-word CAS, and a conflicting
    /// claim on any word rolls back the words already cleared and
    /// resumes the search just past the conflict, rather than giving up.
    /// Bounded by `Backoff`; never spins forever.
    pub fn try_find_and_clear_n(&self, n: usize, hint: usize) -> Option<usize> {
        if n == 0 || n > CHUNK_BITS || hint + n > CHUNK_BITS {
            return None;
        }

        let mut start = hint;
        let backoff = Backoff::new();

        loop {
            if start + n > CHUNK_BITS {
                return None;
            }

            match self.probe_and_claim(start, n) {
                Ok(()) => return Some(start),
                Err(next) => {
                    if next <= start {
                        return None;
                    }
                    start = next;
                    if backoff.is_completed() {
                        return None;
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Attempts to claim exactly `[start, start+n)`, succeeding only if
    /// every targeted bit was free beforehand; no partial effect on
    /// failure. Used by the purge collect pass to re-claim a
    /// purge-marked run from `blocks_free` without disturbing bits
    /// outside the run on conflict.
    pub(crate) fn try_claim_exact(&self, start: usize, n: usize) -> bool {
        self.probe_and_claim(start, n).is_ok()
    }

    /// Attempts to claim `[start, start+n)` as a unit. On conflict,
    /// undoes any words it already cleared and returns the index just
    /// past the first bit that was not free, so the caller can resume
    /// scanning from there.
    fn probe_and_claim(&self, start: usize, n: usize) -> Result<(), usize> {
        if !self.is_range_set(start, n) {
            return Err(self.first_clear_after(start, n));
        }

        let mut cleared: [(usize, u64); WORDS_PER_CHUNK] = [(0, 0); WORDS_PER_CHUNK];
        let mut cleared_count = 0;
        let mut bit = start;
        let mut remaining = n;

        while remaining > 0 {
            let word_idx = bit / 64;
            let in_word = (bit % 64) as u32;
            let take = remaining.min(64 - in_word as usize) as u32;
            let mask = word_mask(in_word, take);

            let prev = self.words[word_idx].fetch_and(!mask, AcqRel);
            if prev & mask != mask {
                // A concurrent claimer beat us to part of this word.
                // Restore exactly the bits we cleared, then unwind.
                let restore = prev & mask;
                if restore != 0 {
                    self.words[word_idx].fetch_or(restore, Release);
                }
                for &(idx, m) in &cleared[..cleared_count] {
                    self.words[idx].fetch_or(m, Release);
                }
                return Err(bit + take as usize);
            }

            cleared[cleared_count] = (word_idx, mask);
            cleared_count += 1;
            bit += take as usize;
            remaining -= take as usize;
        }

        Ok(())
    }

    /// Index one past the first bit in `[start, start+n)` that reads as
    /// clear, used to resume a search after a losing probe.
    fn first_clear_after(&self, start: usize, n: usize) -> usize {
        let mut bit = start;
        let mut remaining = n;
        while remaining > 0 {
            let word_idx = bit / 64;
            let in_word = (bit % 64) as u32;
            let take = remaining.min(64 - in_word as usize) as u32;
            let mask = word_mask(in_word, take);
            let word = self.words[word_idx].load(Acquire);
            if word & mask != mask {
                let clear_bits = !word & mask;
                let first_clear = clear_bits.trailing_zeros() as usize;
                return word_idx * 64 + first_clear + 1;
            }
            bit += take as usize;
            remaining -= take as usize;
        }
        start + n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_chunk_all_set_or_clear() {
        let all_free = BitmapChunk::new(true);
        assert!(all_free.is_range_set(0, CHUNK_BITS));

        let all_used = BitmapChunk::new(false);
        assert!(all_used.is_range_clear(0, CHUNK_BITS));
    }

    #[test]
    fn set_then_clear_round_trips() {
        let chunk = BitmapChunk::new(false);
        assert!(chunk.clear_range(10, 5)); // already clear
        let (all_already_set, _) = chunk.xset_range(10, 5, true);
        assert!(!all_already_set); // genuine 0 -> 1 transition
        assert!(chunk.is_range_set(10, 5));
        assert!(!chunk.clear_range(10, 5)); // were set, not clear
        assert!(chunk.is_range_clear(10, 5));
    }

    #[test]
    fn find_and_clear_bounded() {
        let chunk = BitmapChunk::new(true);
        let start = chunk.try_find_and_clear_n(8, 0).unwrap();
        assert_eq!(start, 0);
        assert!(chunk.is_range_clear(0, 8));
        assert!(chunk.is_range_set(8, CHUNK_BITS - 8));
    }

    #[test]
    fn find_and_clear_respects_hint() {
        let chunk = BitmapChunk::new(true);
        let start = chunk.try_find_and_clear_n(4, 64).unwrap();
        assert_eq!(start, 64);
    }

    #[test]
    fn find_and_clear_fails_when_exhausted() {
        let chunk = BitmapChunk::new(false);
        assert_eq!(chunk.try_find_and_clear_n(1, 0), None);
    }

    #[test]
    fn find_and_clear_skips_used_bits() {
        let chunk = BitmapChunk::new(true);
        chunk.clear_range(0, 10); // blocks [0,10) now in-use
        let start = chunk.try_find_and_clear_n(5, 0).unwrap();
        assert_eq!(start, 10);
    }

    #[test]
    fn straddles_a_single_word_boundary() {
        let chunk = BitmapChunk::new(true);
        // A run starting at bit 60 for 8 bits spans words 0 and 1.
        let start = chunk.try_find_and_clear_n(8, 60).unwrap();
        assert_eq!(start, 60);
        assert!(chunk.is_range_clear(60, 8));
    }

    #[test]
    fn cannot_request_more_than_chunk_bits() {
        let chunk = BitmapChunk::new(true);
        assert_eq!(chunk.try_find_and_clear_n(CHUNK_BITS + 1, 0), None);
    }
}
