use std::sync::atomic::AtomicUsize;

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

/// View a heap word as an atomic.
///
/// # Safety
/// `addr` must be word aligned and point into memory that stays mapped for `'a`.
#[inline(always)]
pub unsafe fn word_at<'a>(addr: usize) -> &'a AtomicUsize {
    &*(addr as *const AtomicUsize)
}

pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_size() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2048).to_string(), "2.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
        assert_eq!(formatted_size(5 * 1024 * 1024 * 1024).to_string(), "5.0G");
    }
}
