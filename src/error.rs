use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;

/// Failures of the allocation layer. All of them are terminal: nothing here
/// is retried, and the caller is expected to abort whatever it was doing.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// `n_elem * elem_size` does not fit in a `usize`. Detected before any
    /// system call.
    #[error("requested size is too large: {n_elem} elements of {elem_size} bytes")]
    SizeOverflow { n_elem: usize, elem_size: usize },

    /// The backend (heap or mapping) did not produce a buffer.
    #[error("out of memory: {backend} could not provide {bytes} bytes")]
    OutOfMemory {
        bytes: usize,
        backend: &'static str,
        #[source]
        source: Option<io::Error>,
    },

    /// The backing file of a mapped buffer could not be created, zero-filled
    /// or reopened.
    #[error("unable to prepare backing file {}", .path.display())]
    BackingFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `munmap` reported failure while releasing a mapped buffer.
    #[error("unable to unmap {len} bytes")]
    UnmapFailed {
        len: usize,
        #[source]
        source: io::Error,
    },
}

impl MemoryError {
    pub(crate) fn out_of_memory(bytes: usize, backend: &'static str) -> MemoryError {
        MemoryError::OutOfMemory {
            bytes,
            backend,
            source: None,
        }
    }

    pub(crate) fn backing_file(path: impl Into<PathBuf>, source: io::Error) -> MemoryError {
        MemoryError::BackingFile {
            path: path.into(),
            source,
        }
    }
}
