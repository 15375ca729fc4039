//! Customized unified error type for daemon-internal failures.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for checkpointd runtime errors. Client-visible
/// failures are carried separately as `CkptError` codes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CheckpointdError(pub(crate) String);

impl CheckpointdError {
    pub fn msg(msg: impl ToString) -> Self {
        CheckpointdError(msg.to_string())
    }
}

impl fmt::Display for CheckpointdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for CheckpointdError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `CheckpointdError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for CheckpointdError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                CheckpointdError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `CheckpointdError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for CheckpointdError {
            fn from(e: $error) -> CheckpointdError {
                CheckpointdError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(base64::DecodeError);
impl_from_error!(toml::de::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(ctrlc::Error);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = CheckpointdError("replica of 'c' is gone".into());
        assert_eq!(e.to_string(), "replica of 'c' is gone");
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "no such peer");
        let e = CheckpointdError::from(io_error);
        assert!(e.0.contains("no such peer"));
    }

    #[test]
    fn from_decode_error() {
        let bad: &[u8] = &[0xc1]; // reserved msgpack marker
        let res: Result<u32, _> = rmp_serde::decode::from_slice(bad);
        let e = CheckpointdError::from(res.unwrap_err());
        assert!(!e.0.is_empty());
    }

    #[test]
    fn from_try_recv_error() {
        let (_tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u8>();
        let e = CheckpointdError::from(rx.try_recv().unwrap_err());
        assert_eq!(e.0, "receiving on an empty channel");
    }

    #[test]
    fn from_toml_ser_error() {
        // a bare scalar cannot be a top-level toml document
        let e = CheckpointdError::from(toml::to_string(&7u8).unwrap_err());
        assert!(!e.0.is_empty());
    }
}
