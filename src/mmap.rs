use memmap2::MmapMut;

use crate::globals::{align_up, PAGE_SIZE};

/// Anonymous memory reservation backing one arena.
pub struct Mmap {
    map: MmapMut,
    start: usize,
    size: usize,
}

impl Mmap {
    /// Map `size` bytes whose start is aligned to [PAGE_SIZE]. Returns `None`
    /// when the OS refuses the mapping.
    pub fn new(size: usize) -> Option<Self> {
        let mut map = MmapMut::map_anon(size + PAGE_SIZE).ok()?;
        let raw = map.as_mut_ptr() as usize;
        let start = align_up(raw, PAGE_SIZE);
        Some(Self { map, start, size })
    }

    /// Return a `PAGE_SIZE` aligned pointer to the mmap'ed region.
    pub fn aligned(&self) -> *mut u8 {
        self.start as *mut u8
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn mapped_len(&self) -> usize {
        self.map.len()
    }

    /// Give the physical pages of `[page, page+size)` back to the OS. The
    /// range stays mapped and reads back as zeroes.
    pub fn dontneed(&self, page: usize, size: usize) {
        debug_assert!(page >= self.start && page + size <= self.end());
        #[cfg(unix)]
        unsafe {
            libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
        }
        #[cfg(not(unix))]
        unsafe {
            std::ptr::write_bytes(page as *mut u8, 0, size);
        }
    }

    pub fn commit(&self, page: usize, size: usize) {
        #[cfg(unix)]
        unsafe {
            libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
        }
        #[cfg(not(unix))]
        {
            let _ = (page, size);
        }
    }
}
