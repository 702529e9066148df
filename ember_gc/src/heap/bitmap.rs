//! Fixed-size atomic bit vectors.
//!
//! Every per-atom table in the heap (allocation bits, mark bits, cell-set
//! membership bits) is an `AtomicBitmap`. Bits are packed 64 to a word and
//! every mutation is a single atomic read-modify-write on the owning word, so
//! writers on different bits never interfere and two writers racing on the same
//! bit observe exactly one transition between them.

use std::collections::TryReserveError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bits per storage word.
pub const BITS_PER_WORD: usize = u64::BITS as usize;

/// A fixed-length bit vector with lock-free per-bit updates.
pub struct AtomicBitmap {
    /// Packed bit words.
    words: Box<[AtomicU64]>,
    /// Number of addressable bits.
    bits: usize,
}

impl AtomicBitmap {
    /// Create a cleared bitmap holding `bits` bits.
    pub fn new(bits: usize) -> Self {
        let words: Vec<AtomicU64> = (0..word_count(bits)).map(|_| AtomicU64::new(0)).collect();
        Self {
            words: words.into_boxed_slice(),
            bits,
        }
    }

    /// Create a cleared bitmap, reporting allocation failure instead of aborting.
    ///
    /// This is the constructor used on mutator paths where running out of memory
    /// must surface as an error to the caller.
    pub fn try_new(bits: usize) -> Result<Self, TryReserveError> {
        let count = word_count(bits);
        let mut words: Vec<AtomicU64> = Vec::new();
        words.try_reserve_exact(count)?;
        words.extend((0..count).map(|_| AtomicU64::new(0)));
        Ok(Self {
            words: words.into_boxed_slice(),
            bits,
        })
    }

    #[inline]
    fn split(&self, index: usize) -> (&AtomicU64, u64) {
        debug_assert!(index < self.bits, "bit {} out of range {}", index, self.bits);
        (&self.words[index / BITS_PER_WORD], 1u64 << (index % BITS_PER_WORD))
    }

    /// Read one bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        let (word, mask) = self.split(index);
        word.load(Ordering::Acquire) & mask != 0
    }

    /// Set one bit, returning its previous value.
    #[inline]
    pub fn test_and_set(&self, index: usize) -> bool {
        let (word, mask) = self.split(index);
        word.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clear one bit, returning its previous value.
    #[inline]
    pub fn test_and_clear(&self, index: usize) -> bool {
        let (word, mask) = self.split(index);
        word.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Set one bit.
    #[inline]
    pub fn set(&self, index: usize) {
        self.test_and_set(index);
    }

    /// Clear one bit.
    #[inline]
    pub fn clear(&self, index: usize) {
        self.test_and_clear(index);
    }

    /// Clear every bit.
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Keep only the bits that are also set in `other` (`self &= other`).
    ///
    /// Each word is filtered atomically; bits set concurrently in `self` while the
    /// filter runs survive only if `other` also has them.
    pub fn filter(&self, other: &AtomicBitmap) {
        debug_assert_eq!(self.bits, other.bits);
        for (word, mask) in self.words.iter().zip(other.words.iter()) {
            word.fetch_and(mask.load(Ordering::Acquire), Ordering::AcqRel);
        }
    }

    /// True if no bit is set.
    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Call `f` with the index of every set bit, in ascending order.
    pub fn for_each_set_bit<F>(&self, mut f: F)
    where
        F: FnMut(usize),
    {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                f(word_index * BITS_PER_WORD + bit);
                bits &= bits - 1;
            }
        }
    }

    /// Index of the first clear bit at or after `start`, if any.
    pub fn find_clear_from(&self, start: usize) -> Option<usize> {
        let mut index = start;
        while index < self.bits {
            let word = self.words[index / BITS_PER_WORD].load(Ordering::Acquire);
            let shifted = !word >> (index % BITS_PER_WORD);
            if shifted == 0 {
                index = (index / BITS_PER_WORD + 1) * BITS_PER_WORD;
                continue;
            }
            let found = index + shifted.trailing_zeros() as usize;
            return (found < self.bits).then_some(found);
        }
        None
    }

    /// Number of addressable bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.bits
    }

    /// True if the bitmap addresses no bits at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

impl std::fmt::Debug for AtomicBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBitmap")
            .field("bits", &self.bits)
            .field("set", &self.count())
            .finish()
    }
}

#[inline]
const fn word_count(bits: usize) -> usize {
    (bits + BITS_PER_WORD - 1) / BITS_PER_WORD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_creation() {
        let bitmap = AtomicBitmap::new(130);
        assert_eq!(bitmap.len(), 130);
        assert!(bitmap.is_clear());
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_test_and_set_reports_previous() {
        let bitmap = AtomicBitmap::new(64);
        assert!(!bitmap.test_and_set(5));
        assert!(bitmap.test_and_set(5));
        assert!(bitmap.get(5));
        assert!(!bitmap.get(4));
    }

    #[test]
    fn test_test_and_clear_reports_previous() {
        let bitmap = AtomicBitmap::new(64);
        assert!(!bitmap.test_and_clear(7));
        bitmap.set(7);
        assert!(bitmap.test_and_clear(7));
        assert!(!bitmap.get(7));
    }

    #[test]
    fn test_word_boundaries() {
        let bitmap = AtomicBitmap::new(200);
        bitmap.set(63);
        bitmap.set(64);
        bitmap.set(199);
        assert!(bitmap.get(63));
        assert!(bitmap.get(64));
        assert!(bitmap.get(199));
        assert_eq!(bitmap.count(), 3);
    }

    #[test]
    fn test_for_each_set_bit_ascending() {
        let bitmap = AtomicBitmap::new(256);
        for i in [200, 3, 64, 65, 128] {
            bitmap.set(i);
        }
        let mut seen = Vec::new();
        bitmap.for_each_set_bit(|i| seen.push(i));
        assert_eq!(seen, vec![3, 64, 65, 128, 200]);
    }

    #[test]
    fn test_filter() {
        let members = AtomicBitmap::new(128);
        let marks = AtomicBitmap::new(128);
        members.set(1);
        members.set(70);
        members.set(100);
        marks.set(70);
        marks.set(2);

        members.filter(&marks);
        assert!(!members.get(1));
        assert!(members.get(70));
        assert!(!members.get(100));
        assert!(!members.get(2));
    }

    #[test]
    fn test_find_clear_from() {
        let bitmap = AtomicBitmap::new(130);
        for i in 0..128 {
            bitmap.set(i);
        }
        assert_eq!(bitmap.find_clear_from(0), Some(128));
        bitmap.set(128);
        bitmap.set(129);
        assert_eq!(bitmap.find_clear_from(0), None);
        bitmap.clear(5);
        assert_eq!(bitmap.find_clear_from(0), Some(5));
        assert_eq!(bitmap.find_clear_from(6), None);
    }

    #[test]
    fn test_clear_all() {
        let bitmap = AtomicBitmap::new(100);
        for i in (0..100).step_by(7) {
            bitmap.set(i);
        }
        assert!(!bitmap.is_clear());
        bitmap.clear_all();
        assert!(bitmap.is_clear());
    }

    #[test]
    fn test_try_new() {
        let bitmap = AtomicBitmap::try_new(512).expect("small bitmap should allocate");
        assert_eq!(bitmap.len(), 512);
        assert!(bitmap.is_clear());
    }

    #[test]
    fn test_concurrent_same_bit_single_winner() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;
        use std::thread;

        let bitmap = Arc::new(AtomicBitmap::new(64));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if !bitmap.test_and_set(17) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::Relaxed), 1);
    }
}
