//! Crate-wide error type.
//!
//! Variants follow the errno taxonomy the host driver understands. `errno()` gives the
//! negative value that ends up in an IPC reply.

use thiserror::Error;

/// Errors returned by schedulers, buffers, modules and pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A memory zone could not satisfy an allocation.
    #[error("out of memory in {zone} zone")]
    NoMemory {
        /// Name of the exhausted zone.
        zone: &'static str,
    },

    /// The object was already initialised or the slot is taken.
    #[error("already exists")]
    Exists,

    /// Invalid argument or protocol violation.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Operation not supported for this object's declared type.
    #[error("operation not supported")]
    NotSupported,

    /// Resource is busy.
    #[error("resource busy")]
    Busy,

    /// Not enough input data.
    #[error("no data available")]
    NoData,

    /// Not enough output space.
    #[error("no space available")]
    NoSpace,

    /// No such device or channel.
    #[error("no such device")]
    NoDevice,

    /// Stream xrun.
    #[error("broken pipe (xrun)")]
    Pipe,

    /// I/O failure outside the real-time path.
    #[error("i/o error: {0}")]
    Io(String),

    /// Configuration could not be parsed or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Negative errno value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoMemory { .. } => -12,
            Error::Exists => -17,
            Error::Invalid(_) => -22,
            Error::NotSupported => -95,
            Error::Busy => -16,
            Error::NoData => -61,
            Error::NoSpace => -28,
            Error::NoDevice => -19,
            Error::Pipe => -32,
            Error::Io(_) => -5,
            Error::Config(_) => -22,
        }
    }

    /// True for conditions that mean "nothing to do this tick" rather than failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NoData | Error::NoSpace)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<hound::Error> for Error {
    fn from(e: hound::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_linux() {
        assert_eq!(Error::NoMemory { zone: "runtime" }.errno(), -12);
        assert_eq!(Error::Exists.errno(), -17);
        assert_eq!(Error::Invalid("x").errno(), -22);
        assert_eq!(Error::NotSupported.errno(), -95);
        assert_eq!(Error::Pipe.errno(), -32);
    }

    #[test]
    fn transient_errors() {
        assert!(Error::NoData.is_transient());
        assert!(Error::NoSpace.is_transient());
        assert!(!Error::Busy.is_transient());
    }

    #[test]
    fn display_carries_context() {
        let e = Error::NoMemory { zone: "buffer" };
        assert_eq!(e.to_string(), "out of memory in buffer zone");
    }
}
