//! Size class table. Small requests are rounded up to one of a fixed set of
//! sizes; each class also fixes how many pages a span of that class spans.

use crate::globals::{align_up, PAGE_SIZE, ATOM_SIZE, MAX_SMALL_SIZE, PRECISE_CUTOFF};

/// Class id reserved for spans holding a single large object.
pub const LARGE_CLASS: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    pub size: usize,
    pub npages: usize,
}

impl SizeClass {
    pub const fn span_bytes(&self) -> usize {
        self.npages * PAGE_SIZE
    }

    pub const fn objects_per_span(&self) -> usize {
        self.span_bytes() / self.size
    }
}

/// Smallest page count whose tail waste stays under 1/8 of the span.
fn pages_for_class(size: usize) -> usize {
    let mut bytes = PAGE_SIZE;
    while bytes < size || bytes % size > bytes / 8 {
        bytes += PAGE_SIZE;
    }
    bytes / PAGE_SIZE
}

pub fn size_classes(progression: f64, dump: bool) -> Vec<usize> {
    let mut result = Vec::new();
    let mut size = ATOM_SIZE;
    while size < PRECISE_CUTOFF {
        result.push(size);
        size += ATOM_SIZE;
    }

    for i in 0i32.. {
        let approximate_size = (PRECISE_CUTOFF as f64 * progression.powi(i)) as usize;
        if approximate_size > MAX_SMALL_SIZE {
            break;
        }
        let size_class = align_up(approximate_size, ATOM_SIZE);
        let span_bytes = pages_for_class(size_class) * PAGE_SIZE;

        // Stretch the class to eat the tail waste when that keeps the same
        // number of objects per span.
        let objects_per_span = span_bytes / size_class;
        let possibly_better = (span_bytes / objects_per_span) & !(ATOM_SIZE - 1);
        let better = if possibly_better <= MAX_SMALL_SIZE {
            possibly_better
        } else {
            size_class
        };

        if Some(better) == result.last().copied() {
            continue;
        }
        result.push(better);
    }
    result.push(MAX_SMALL_SIZE);
    result.sort_unstable();
    result.dedup();
    if dump {
        eprintln!("[gc] size classes: {:?}", result);
    }
    result
}

pub struct SizeClasses {
    /// Index 0 is the large object pseudo class.
    classes: Vec<SizeClass>,
    /// Maps `(size + ATOM_SIZE - 1) / ATOM_SIZE` to a class id.
    lookup: Box<[u8]>,
}

impl SizeClasses {
    pub fn new(progression: f64, dump: bool) -> Self {
        let mut classes = vec![SizeClass { size: 0, npages: 0 }];
        for size in size_classes(progression, dump) {
            classes.push(SizeClass {
                size,
                npages: pages_for_class(size),
            });
        }
        assert!(classes.len() <= u8::MAX as usize);
        let steps = MAX_SMALL_SIZE / ATOM_SIZE + 1;
        let mut lookup = vec![0u8; steps].into_boxed_slice();
        let mut class = 1;
        for (step, entry) in lookup.iter_mut().enumerate() {
            let size = step * ATOM_SIZE;
            while classes[class].size < size {
                class += 1;
            }
            *entry = class as u8;
        }
        Self { classes, lookup }
    }

    /// Class id serving `size` bytes, or [LARGE_CLASS] above the small limit.
    #[inline]
    pub fn class_for(&self, size: usize) -> u8 {
        if size > MAX_SMALL_SIZE {
            return LARGE_CLASS;
        }
        self.lookup[(size + ATOM_SIZE - 1) / ATOM_SIZE]
    }

    #[inline]
    pub fn get(&self, class: u8) -> SizeClass {
        self.classes[class as usize]
    }

    /// Number of small classes. Ids run from 1 to `len()` inclusive.
    pub fn len(&self) -> usize {
        self.classes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, SizeClass)> + '_ {
        self.classes
            .iter()
            .enumerate()
            .skip(1)
            .map(|(id, class)| (id as u8, *class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_are_sorted_and_bounded() {
        let sizes = size_classes(1.4, false);
        assert_eq!(sizes[0], ATOM_SIZE);
        assert_eq!(*sizes.last().unwrap(), MAX_SMALL_SIZE);
        for pair in sizes.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for size in sizes {
            assert_eq!(size % ATOM_SIZE, 0);
        }
    }

    #[test]
    fn test_lookup_covers_every_size() {
        let classes = SizeClasses::new(1.4, false);
        for size in 1..=MAX_SMALL_SIZE {
            let id = classes.class_for(size);
            assert_ne!(id, LARGE_CLASS, "size {}", size);
            let class = classes.get(id);
            assert!(class.size >= size);
            if id > 1 {
                assert!(classes.get(id - 1).size < size);
            }
        }
        assert_eq!(classes.class_for(MAX_SMALL_SIZE + 1), LARGE_CLASS);
    }

    #[test]
    fn test_span_waste() {
        let classes = SizeClasses::new(1.4, false);
        for (_, class) in classes.iter() {
            let bytes = class.span_bytes();
            assert!(class.objects_per_span() >= 1);
            assert!(bytes % class.size <= bytes / 8);
        }
    }
}
