//! Fixed size atomic bitmap indexed by slot number. Spans keep two of these:
//! one for allocated slots and one for marked slots.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::globals::BITS_PER_WORD;

pub struct AtomicBitmap {
    words: Box<[AtomicUsize]>,
    len: usize,
}

impl AtomicBitmap {
    pub fn new(len: usize) -> Self {
        let nwords = (len + BITS_PER_WORD - 1) / BITS_PER_WORD;
        Self {
            words: (0..nwords.max(1)).map(|_| AtomicUsize::new(0)).collect(),
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    fn locate(&self, index: usize) -> (&AtomicUsize, usize) {
        debug_assert!(index < self.len, "bit {} out of range {}", index, self.len);
        (
            &self.words[index / BITS_PER_WORD],
            1 << (index % BITS_PER_WORD),
        )
    }

    #[inline]
    pub fn test(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.load(Ordering::Acquire) & mask != 0
    }

    /// Set the bit. Returns the previous value.
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clear the bit. Returns the previous value.
    #[inline]
    pub fn clear(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Returns `true` if the bit was already set. Racing markers see exactly one
    /// `false` per bit.
    #[inline]
    pub fn test_and_set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        let mut old_word = word.load(Ordering::Relaxed);
        loop {
            if old_word & mask != 0 {
                return true;
            }
            match word.compare_exchange_weak(
                old_word,
                old_word | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(current) => old_word = current,
            }
        }
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// First clear bit at or after `from`, or `None` when the tail is full.
    pub fn find_first_zero(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }
        let mut index = from / BITS_PER_WORD;
        let mut word = !self.words[index].load(Ordering::Relaxed) & (!0usize << (from % BITS_PER_WORD));
        loop {
            if word != 0 {
                let bit = index * BITS_PER_WORD + word.trailing_zeros() as usize;
                return if bit < self.len { Some(bit) } else { None };
            }
            index += 1;
            if index >= self.words.len() {
                return None;
            }
            word = !self.words[index].load(Ordering::Relaxed);
        }
    }

    /// Visit set bits. Each word is loaded once so bits may be changed by
    /// the visitor.
    pub fn for_each_set(&self, mut visitor: impl FnMut(usize)) {
        for (index, word) in self.words.iter().enumerate() {
            let mut w = word.load(Ordering::Acquire);
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                let bit = index * BITS_PER_WORD + shift;
                if bit >= self.len {
                    return;
                }
                visitor(bit);
                w ^= 1 << shift;
            }
        }
    }

    /// Words of `self & !other`, used by the sweeper to find garbage slots.
    pub fn for_each_set_not_in(&self, other: &AtomicBitmap, mut visitor: impl FnMut(usize)) {
        debug_assert_eq!(self.len, other.len);
        for (index, (a, b)) in self.words.iter().zip(other.words.iter()).enumerate() {
            let mut w = a.load(Ordering::Acquire) & !b.load(Ordering::Acquire);
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                let bit = index * BITS_PER_WORD + shift;
                if bit >= self.len {
                    return;
                }
                visitor(bit);
                w ^= 1 << shift;
            }
        }
    }
}
