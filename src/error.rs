//! Error taxonomy shared by the device layer and the workload wrappers.
//!
//! Device-layer variants end the run: a failed device call leaves the
//! context in an unknown state and nothing is retried. I/O, parse and
//! configuration errors are ordinary failures reported by the caller.

use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file could not be opened, read or written.
    #[error("cannot access '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed grid, corpus or hash input.
    #[error("{origin}: {message}")]
    Parse { origin: String, message: String },

    /// No adapter satisfying the device requirements could be enumerated.
    #[error("no usable compute device: {0}")]
    DeviceUnavailable(String),

    /// A device call reported failure; `message` is the driver's own text.
    #[error("device error during {op}: {message}")]
    Device { op: &'static str, message: String },

    /// Kernel source failed to compile or lacks the requested entry point.
    #[error("kernel '{entry}' from '{}' failed to build\n{log}", .path.display())]
    Compile {
        path: PathBuf,
        entry: String,
        log: String,
    },

    /// Kernel argument descriptor disagrees with itself, the kernel, or the
    /// buffers handed to it.
    #[error("kernel '{entry}' argument contract violated: {detail}")]
    Binding { entry: String, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn parse(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn device(op: &'static str, message: impl ToString) -> Self {
        Self::Device {
            op,
            message: message.to_string(),
        }
    }

    pub fn binding(entry: &str, detail: impl Into<String>) -> Self {
        Self::Binding {
            entry: entry.to_string(),
            detail: detail.into(),
        }
    }

    /// True for device-layer failures, which abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_)
                | Self::Device { .. }
                | Self::Compile { .. }
                | Self::Binding { .. }
        )
    }
}
