use alloc::string::String;
use arrayvec::CapacityError;
use core::num::TryFromIntError;
use num_enum::{TryFromPrimitive, TryFromPrimitiveError};

#[derive(Debug, PartialEq)]
pub enum Error {
    MissingConfig(String),
    MissingDevice(String),
    NotSupported,
    NotFound,
    Exists,
    Exhausted,
    /// The operation cannot make progress right now; the caller may retry
    /// or accept the loss (virq-slot exhaustion, duplicate pINTID).
    TryAgain,
    InvalidValue(String),
    InvalidDevice(String),
    DeviceError(String),
}

impl<T: TryFromPrimitive> From<TryFromPrimitiveError<T>> for Error {
    fn from(error: TryFromPrimitiveError<T>) -> Error {
        Error::InvalidValue(format!("{}", error))
    }
}

impl From<TryFromIntError> for Error {
    fn from(error: TryFromIntError) -> Error {
        Error::InvalidValue(format!("{}", error))
    }
}

impl From<core::str::Utf8Error> for Error {
    fn from(error: core::str::Utf8Error) -> Error {
        Error::InvalidValue(format!("{}", error))
    }
}

impl<T> From<CapacityError<T>> for Error {
    fn from(_error: CapacityError<T>) -> Error {
        Error::Exhausted
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::MissingConfig(format!("{}", error))
    }
}

pub type Result<T> = core::result::Result<T, Error>;
