use std::fmt::{self, Display, Formatter};

/// Device memory is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutOfDeviceMemory;

impl Display for OutOfDeviceMemory {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str("device memory is exhausted")
    }
}

impl std::error::Error for OutOfDeviceMemory {}

/// Host memory is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutOfHostMemory;

impl Display for OutOfHostMemory {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str("host memory is exhausted")
    }
}

impl std::error::Error for OutOfHostMemory {}

/// Raw failure surfaced from the driver entry points (allocate, bind, map,
/// flush, invalidate, query).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverError {
    OutOfDeviceMemory,
    OutOfHostMemory,
    TooManyObjects,
    /// Any other driver result code, surfaced verbatim.
    Other(i32),
}

impl Display for DriverError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::OutOfDeviceMemory => {
                fmt.write_str("driver reported out-of-device-memory")
            }
            DriverError::OutOfHostMemory => {
                fmt.write_str("driver reported out-of-host-memory")
            }
            DriverError::TooManyObjects => {
                fmt.write_str("driver reported too many memory objects")
            }
            DriverError::Other(code) => {
                write!(fmt, "driver call failed with code {}", code)
            }
        }
    }
}

impl std::error::Error for DriverError {}

/// Errors returned by allocator operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    InvalidArgument(&'static str),

    #[error("{source}")]
    OutOfDeviceMemory {
        #[from]
        source: OutOfDeviceMemory,
    },

    #[error("{source}")]
    OutOfHostMemory {
        #[from]
        source: OutOfHostMemory,
    },

    #[error("no memory type satisfies the requested usage and flags")]
    FeatureNotPresent,

    #[error("{source}")]
    Driver { source: DriverError },

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("operation is not implemented: {0}")]
    Unsupported(&'static str),
}

impl Error {
    pub(crate) fn invalid_argument(msg: &'static str) -> Self {
        Error::InvalidArgument(msg)
    }

    pub(crate) fn invalid_state(msg: &'static str) -> Self {
        Error::InvalidState(msg)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::OutOfDeviceMemory => OutOfDeviceMemory.into(),
            DriverError::OutOfHostMemory => OutOfHostMemory.into(),
            DriverError::TooManyObjects => Error::Driver { source: err },
            DriverError::Other(_) => Error::Driver { source: err },
        }
    }
}
