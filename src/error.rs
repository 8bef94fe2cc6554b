//! Error types for camstream

use thiserror::Error;

/// Result type alias for camstream operations
pub type Result<T> = std::result::Result<T, Error>;

/// camstream error type
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was attempted on a buffer in the wrong ownership state,
    /// e.g. retaining a buffer that is currently queued to the kernel.
    #[error("{name}: buffer is in the wrong ownership state: {reason}")]
    InvalidState { name: String, reason: &'static str },

    /// An ioctl against a video node failed.
    #[error("{name}: {op} failed: {source}")]
    Kernel {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A frame did not fit into the destination slot during an mmap copy.
    #[error("{name}: frame of {used} bytes exceeds slot capacity of {capacity} bytes")]
    CapacityExceeded {
        name: String,
        used: usize,
        capacity: usize,
    },

    /// The kernel reported POLLHUP or POLLERR on a device descriptor.
    #[error("{0}: device disconnected")]
    Disconnected(String),

    /// Invalid format or graph combination detected at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is isolated to a single buffer.
    ///
    /// Recoverable errors are logged by the scheduler and the affected
    /// references released; the loop keeps running. Everything else tears
    /// the stream down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. }
                | Error::InvalidState { .. }
                | Error::Kernel {
                    op: "VIDIOC_QBUF",
                    ..
                }
        )
    }

    /// Check if this error is an interrupted syscall (EINTR).
    pub fn is_interrupted(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            Error::Kernel { source, .. } => source.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}
