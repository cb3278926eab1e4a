//! Error types.

use std::io;

use thiserror::Error;

/// Failure to build a heap.
#[derive(Debug, Error)]
pub enum HeapError {
    /// A configuration option is out of range or inconsistent.
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),
    /// The address range for the heap could not be reserved.
    #[error("failed to reserve {bytes} bytes of address space")]
    Reserve {
        /// Size of the attempted reservation.
        bytes: usize,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// The initial heap could not be committed.
    #[error("failed to commit {bytes} bytes of initial heap")]
    Commit {
        /// Size of the attempted commit.
        bytes: usize,
        /// OS error.
        #[source]
        source: io::Error,
    },
}

/// Failure of a mutator allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No space could be found even after collecting and expanding.
    #[error("out of memory allocating {word_size} words")]
    OutOfMemory {
        /// Requested size in words.
        word_size: usize,
    },
}
