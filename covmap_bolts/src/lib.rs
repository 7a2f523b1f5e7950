/*!
Bolts are no conceptual fuzzing elements, but they keep the harness together.

This crate holds the coverage map shared with instrumented targets, the
cleanup registry making sure the map never outlives this process, and the
crate-wide [`Error`] type.
*/
#![allow(clippy::module_name_repetitions)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]

#[cfg(unix)]
pub mod os;
#[cfg(unix)]
pub mod shmem;

use core::{
    fmt::{self, Display},
    num::{ParseIntError, TryFromIntError},
};
use std::{env::VarError, io};

#[cfg(feature = "errors_backtrace")]
/// Error Backtrace type when `errors_backtrace` feature is enabled (== [`backtrace::Backtrace`])
pub type ErrorBacktrace = backtrace::Backtrace;

#[cfg(not(feature = "errors_backtrace"))]
#[derive(Debug, Default)]
/// Empty struct to use when `errors_backtrace` is disabled
pub struct ErrorBacktrace {}
#[cfg(not(feature = "errors_backtrace"))]
impl ErrorBacktrace {
    /// Nop
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }
}

#[cfg(feature = "errors_backtrace")]
fn display_error_backtrace(f: &mut fmt::Formatter, err: &ErrorBacktrace) -> fmt::Result {
    write!(f, "\nBacktrace: {err:?}")
}
#[cfg(not(feature = "errors_backtrace"))]
#[allow(clippy::unnecessary_wraps)]
fn display_error_backtrace(_f: &mut fmt::Formatter, _err: &ErrorBacktrace) -> fmt::Result {
    fmt::Result::Ok(())
}

/// Main error struct for covmap
#[derive(Debug)]
pub enum Error {
    /// The coverage map could not be created or mapped. The owner is unusable afterwards.
    Resource(String, ErrorBacktrace),
    /// The target process could not be started
    Launch(String, io::Error, ErrorBacktrace),
    /// File related error, including writes to the target's input pipe
    File(io::Error, ErrorBacktrace),
    /// Serialization error
    Serialize(String, ErrorBacktrace),
    /// You're holding it wrong
    IllegalState(String, ErrorBacktrace),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String, ErrorBacktrace),
    /// Something else happened
    Unknown(String, ErrorBacktrace),
}

impl Error {
    /// The coverage map could not be created or mapped
    #[must_use]
    pub fn resource<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Resource(arg.into(), ErrorBacktrace::new())
    }
    /// The target could not be spawned
    #[must_use]
    pub fn launch<S>(arg: S, err: io::Error) -> Self
    where
        S: Into<String>,
    {
        Error::Launch(arg.into(), err, ErrorBacktrace::new())
    }
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg, ErrorBacktrace::new())
    }
    /// Serialization error
    #[must_use]
    pub fn serialize<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Serialize(arg.into(), ErrorBacktrace::new())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into(), ErrorBacktrace::new())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into(), ErrorBacktrace::new())
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into(), ErrorBacktrace::new())
    }

    /// A [`Error::Resource`] carrying the last OS error (errno) alongside `msg`.
    #[must_use]
    pub fn last_os_error<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        let err = io::Error::last_os_error();
        Error::Resource(format!("{}: {err}", msg.into()), ErrorBacktrace::new())
    }

    /// Returns `true` if nothing useful can happen after this error.
    ///
    /// Only a broken coverage map is fatal; launch and input errors concern a single execution.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Resource(..))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Resource(s, b) => {
                write!(f, "Coverage map unavailable: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Launch(s, err, b) => {
                write!(f, "Failed to launch `{0}`: {err}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::File(err, b) => {
                write!(f, "File IO failed: {:?}", &err)?;
                display_error_backtrace(f, b)
            }
            Self::Serialize(s, b) => {
                write!(f, "Error in Serialization: `{0}`", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalState(s, b) => {
                write!(f, "Illegal state: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalArgument(s, b) => {
                write!(f, "Illegal argument: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Unknown(s, b) => {
                write!(f, "Unknown error: {0}", &s)?;
                display_error_backtrace(f, b)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Launch(_, err, _) | Self::File(err, _) => Some(err),
            _ => None,
        }
    }
}

/// Stringify the json serializer error
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::unknown(format!("Unix error: {err:?}"))
    }
}

/// Create a covmap Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

impl From<VarError> for Error {
    #[allow(unused_variables)]
    fn from(err: VarError) -> Self {
        Self::illegal_state(format!("Could not get env var: {err:?}"))
    }
}

impl From<ParseIntError> for Error {
    #[allow(unused_variables)]
    fn from(err: ParseIntError) -> Self {
        Self::illegal_argument(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<TryFromIntError> for Error {
    #[allow(unused_variables)]
    fn from(err: TryFromIntError) -> Self {
        Self::illegal_state(format!("Expected conversion failed: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use crate::Error;

    #[test]
    fn only_resource_errors_are_fatal() {
        assert!(Error::resource("shmget").is_fatal());
        assert!(!Error::launch("/nonexistent", io::ErrorKind::NotFound.into()).is_fatal());
        assert!(!Error::file(io::ErrorKind::BrokenPipe.into()).is_fatal());
    }

    #[test]
    fn launch_error_keeps_the_io_source() {
        let err = Error::launch("/nonexistent", io::ErrorKind::NotFound.into());
        let source = std::error::Error::source(&err)
            .and_then(|s| s.downcast_ref::<io::Error>())
            .map(io::Error::kind);
        assert_eq!(source, Some(io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("Failed to launch `/nonexistent`"));
    }
}
