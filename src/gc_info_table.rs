//! Capability tables describing which words of an object or a stack frame hold
//! pointers. Entries are immutable once registered and looked up by index at
//! scan time.

use std::sync::atomic::{AtomicU32, Ordering};

use bit_vec::BitVec;
use once_cell::sync::OnceCell;

use crate::{
    error::GcError,
    globals::{MAX_FRAMES, MAX_TYPES, WORD},
};

/// Bit per word, set when the word holds a heap pointer. Objects larger than
/// the mask (arrays of the type) repeat it.
#[derive(Clone, Debug)]
pub struct PointerMask {
    bits: BitVec,
}

impl PointerMask {
    pub fn new(words: usize, pointers: &[usize]) -> Result<Self, GcError> {
        let mut bits = BitVec::from_elem(words, false);
        for &index in pointers {
            if index >= words {
                return Err(GcError::InvalidLayout(format!(
                    "pointer word {} outside of {} words",
                    index, words
                )));
            }
            bits.set(index, true);
        }
        Ok(Self { bits })
    }

    #[inline]
    pub fn words(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn has_pointers(&self) -> bool {
        self.bits.any()
    }

    #[inline]
    pub fn is_pointer(&self, word: usize) -> bool {
        let len = self.bits.len();
        len != 0 && self.bits[word % len]
    }

    /// Word offsets of pointer fields inside an object of `words` words.
    pub fn pointer_words(&self, words: usize) -> impl Iterator<Item = usize> + '_ {
        (0..words).filter(move |&w| self.is_pointer(w))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIndex(pub(crate) u32);

impl TypeIndex {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub(crate) u32);

impl FrameId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Type descriptor handed to the allocator.
#[derive(Debug)]
pub struct GcInfo {
    pub name: String,
    /// Size of one element in bytes, rounded up to words.
    pub size: usize,
    pub mask: PointerMask,
    /// False for leaf objects, which are marked without being scanned.
    pub has_pointers: bool,
}

/// Stack map of one frame layout.
#[derive(Debug)]
pub struct FrameInfo {
    pub name: String,
    pub slots: usize,
    pub mask: PointerMask,
}

/// Append-only table. Index 0 is never handed out so it can mark empty slots.
struct DescriptorTable<T> {
    what: &'static str,
    entries: Box<[OnceCell<Box<T>>]>,
    next: AtomicU32,
}

impl<T> DescriptorTable<T> {
    const MIN_INDEX: u32 = 1;

    fn new(what: &'static str, capacity: usize) -> Self {
        Self {
            what,
            entries: (0..capacity).map(|_| OnceCell::new()).collect(),
            next: AtomicU32::new(Self::MIN_INDEX),
        }
    }

    fn add(&self, info: T) -> Result<u32, GcError> {
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        if index as usize >= self.entries.len() {
            self.next.store(self.entries.len() as u32, Ordering::Relaxed);
            return Err(GcError::TableFull(self.what));
        }
        if self.entries[index as usize].set(Box::new(info)).is_err() {
            unreachable!("descriptor slot {} handed out twice", index);
        }
        Ok(index)
    }

    #[inline]
    fn get(&self, index: u32) -> Option<&T> {
        self.entries.get(index as usize)?.get().map(|b| &**b)
    }
}

pub struct GcInfoTable {
    types: DescriptorTable<GcInfo>,
    frames: DescriptorTable<FrameInfo>,
}

impl GcInfoTable {
    pub fn new() -> Self {
        Self {
            types: DescriptorTable::new("type", MAX_TYPES),
            frames: DescriptorTable::new("frame", MAX_FRAMES),
        }
    }

    pub fn add_gc_info(
        &self,
        name: &str,
        size: usize,
        pointer_words: &[usize],
    ) -> Result<TypeIndex, GcError> {
        if size == 0 {
            return Err(GcError::InvalidLayout(format!("type {} has zero size", name)));
        }
        let words = (size + WORD - 1) / WORD;
        let mask = PointerMask::new(words, pointer_words)?;
        let index = self.types.add(GcInfo {
            name: name.to_string(),
            size: words * WORD,
            has_pointers: mask.has_pointers(),
            mask,
        })?;
        Ok(TypeIndex(index))
    }

    pub fn add_frame_info(
        &self,
        name: &str,
        slots: usize,
        pointer_slots: &[usize],
    ) -> Result<FrameId, GcError> {
        let mask = PointerMask::new(slots, pointer_slots)?;
        let index = self.frames.add(FrameInfo {
            name: name.to_string(),
            slots,
            mask,
        })?;
        Ok(FrameId(index))
    }

    #[inline]
    pub fn get_gc_info(&self, index: TypeIndex) -> Option<&GcInfo> {
        self.types.get(index.0)
    }

    /// Lookup used while scanning. An index that was never registered means
    /// the slot's type word was overwritten.
    #[inline]
    pub fn gc_info_for_scan(&self, index: u32) -> &GcInfo {
        match self.types.get(index) {
            Some(info) => info,
            None => crate::heap_corruption!("object with unregistered type index {}", index),
        }
    }

    #[inline]
    pub fn get_frame_info(&self, id: FrameId) -> Option<&FrameInfo> {
        self.frames.get(id.0)
    }

    pub fn for_each_type(&self, mut f: impl FnMut(TypeIndex, &GcInfo)) {
        for index in DescriptorTable::<GcInfo>::MIN_INDEX..self.types.next.load(Ordering::Acquire) {
            if let Some(info) = self.types.get(index) {
                f(TypeIndex(index), info);
            }
        }
    }
}

impl Default for GcInfoTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_type() {
        let table = GcInfoTable::new();
        let node = table.add_gc_info("Node", 24, &[0, 1]).unwrap();
        assert_eq!(node.as_u32(), 1);
        let info = table.get_gc_info(node).unwrap();
        assert_eq!(info.size, 24);
        assert!(info.mask.is_pointer(0));
        assert!(info.mask.is_pointer(1));
        assert!(!info.mask.is_pointer(2));
        // arrays repeat the mask
        assert!(info.mask.is_pointer(3));
        assert_eq!(info.mask.pointer_words(6).collect::<Vec<_>>(), vec![0, 1, 3, 4]);
        assert!(info.has_pointers);
        assert!(table.get_gc_info(TypeIndex(99)).is_none());
        let leaf = table.add_gc_info("Bytes", 8, &[]).unwrap();
        assert!(!table.get_gc_info(leaf).unwrap().has_pointers);
    }

    #[test]
    fn test_invalid_layout() {
        let table = GcInfoTable::new();
        assert!(matches!(
            table.add_gc_info("Bad", 16, &[2]),
            Err(GcError::InvalidLayout(_))
        ));
        assert!(table.add_gc_info("Empty", 0, &[]).is_err());
        assert!(table.add_frame_info("f", 2, &[5]).is_err());
    }

    #[test]
    fn test_frame_info() {
        let table = GcInfoTable::new();
        let id = table.add_frame_info("main", 4, &[1, 3]).unwrap();
        let frame = table.get_frame_info(id).unwrap();
        assert_eq!(frame.slots, 4);
        assert_eq!(frame.mask.pointer_words(4).collect::<Vec<_>>(), vec![1, 3]);
    }
}
