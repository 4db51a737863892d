//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;

/// Customized error type for Tailsim.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TailsimError(pub String);

impl TailsimError {
    pub fn msg(msg: impl ToString) -> Self {
        TailsimError(msg.to_string())
    }
}

impl fmt::Display for TailsimError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for TailsimError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `TailsimError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for TailsimError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                TailsimError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::ParseFloatError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);
