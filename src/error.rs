use std::fmt;

use crate::util::formatted_size;

/// Recoverable failures surfaced to the embedder.
///
/// Heap corruption is never represented here: it goes through
/// [heap_corruption!](crate::heap_corruption) and terminates the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// The span allocator could not map more memory.
    OutOfMemory { requested: usize, heap_limit: usize },
    /// A type index that was never registered.
    InvalidType(u32),
    /// Type or frame table has no free entries left.
    TableFull(&'static str),
    /// Pointer mask does not fit the described layout.
    InvalidLayout(String),
    InvalidConfig(String),
    /// A collector thread could not be started.
    Spawn(String),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory {
                requested,
                heap_limit,
            } => {
                write!(f, "out of memory: failed to allocate {}", formatted_size(*requested))?;
                if *heap_limit != 0 {
                    write!(f, " (heap limit {})", formatted_size(*heap_limit))?;
                }
                Ok(())
            }
            GcError::InvalidType(index) => write!(f, "invalid type index {}", index),
            GcError::TableFull(table) => write!(f, "{} table is full", table),
            GcError::InvalidLayout(msg) => write!(f, "invalid layout: {}", msg),
            GcError::InvalidConfig(msg) => write!(f, "invalid gc config: {}", msg),
            GcError::Spawn(msg) => write!(f, "failed to start gc thread: {}", msg),
        }
    }
}

impl std::error::Error for GcError {}

/// Print the diagnostic with a backtrace and abort. Continuing after a broken
/// heap invariant would corrupt unrelated objects.
#[cold]
#[inline(never)]
pub fn fatal(msg: fmt::Arguments<'_>) -> ! {
    eprintln!("fatal error: {}", msg);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort()
}

#[cold]
pub fn oom_abort(err: &GcError) -> ! {
    eprintln!("OutOfMemory: {}", err);
    std::process::abort()
}

#[macro_export]
macro_rules! heap_corruption {
    ($($t:tt)*) => {
        $crate::error::fatal(format_args!("heap corruption: {}", format_args!($($t)*)))
    };
}
