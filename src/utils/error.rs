//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;

/// Customized error type for clusterbench.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ClusterBenchError(pub(crate) String);

impl ClusterBenchError {
    pub fn msg(msg: impl ToString) -> Self {
        ClusterBenchError(msg.to_string())
    }
}

impl fmt::Display for ClusterBenchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for ClusterBenchError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ClusterBenchError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ClusterBenchError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ClusterBenchError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ClusterBenchError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ClusterBenchError {
            fn from(e: $error) -> ClusterBenchError {
                ClusterBenchError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::watch::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(std::sync::PoisonError<T>);
