//! Inputs, and the request describing a single execution of the target.

use core::time::Duration;
use std::{
    ffi::{OsStr, OsString},
    os::fd::{AsFd, BorrowedFd},
    process::Stdio,
};

use crate::Error;

/// How to deliver input to the target's stdin
///
/// The caller decides; nothing is inferred from the type of the input.
#[derive(Debug, Clone, Copy)]
pub enum InputSource<'a> {
    /// Forward this descriptor as the target's stdin, without any copying.
    ///
    /// The descriptor is duplicated for the child, which shares its file offset.
    /// To replay the same file twice, rewind it in between.
    Descriptor(BorrowedFd<'a>),
    /// Write these bytes into a pipe connected to the target's stdin, then close the pipe.
    Bytes(&'a [u8]),
}

impl<'a> InputSource<'a> {
    /// Forward anything that has a file descriptor: a [`std::fs::File`], [`std::io::Stdin`], ...
    #[must_use]
    pub fn from_fd<F>(fd: &'a F) -> Self
    where
        F: AsFd + ?Sized,
    {
        Self::Descriptor(fd.as_fd())
    }

    /// Pipe an in-memory buffer to the target
    #[must_use]
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self::Bytes(bytes)
    }

    /// The [`Stdio`] to spawn the child with, and the bytes still to be written to it, if any.
    pub(crate) fn stdio(&self) -> Result<(Stdio, Option<&'a [u8]>), Error> {
        match self {
            Self::Descriptor(fd) => Ok((Stdio::from(fd.try_clone_to_owned()?), None)),
            Self::Bytes(bytes) => Ok((Stdio::piped(), Some(*bytes))),
        }
    }
}

/// Everything needed to run the target once
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    command: Vec<OsString>,
    input: InputSource<'a>,
    timeout: Option<Duration>,
}

impl<'a> ExecutionRequest<'a> {
    /// A request to run `command` (program first, then its arguments) with `input` on stdin.
    ///
    /// Without a timeout, the harness waits for the target indefinitely.
    pub fn new<IT, O>(command: IT, input: InputSource<'a>) -> Result<Self, Error>
    where
        IT: IntoIterator<Item = O>,
        O: AsRef<OsStr>,
    {
        let command: Vec<OsString> = command
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();
        if command.is_empty() {
            return Err(Error::illegal_argument(
                "The command must contain at least the program to execute",
            ));
        }
        Ok(Self {
            command,
            input,
            timeout: None,
        })
    }

    /// Kill the target if it is still running after `timeout`
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set or clear the timeout
    #[must_use]
    pub fn with_optional_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The program to execute
    #[must_use]
    pub fn program(&self) -> &OsStr {
        &self.command[0]
    }

    /// The arguments passed to the program
    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.command[1..]
    }

    /// The input for this execution
    #[must_use]
    pub fn input(&self) -> &InputSource<'a> {
        &self.input
    }

    /// The timeout for this execution, if any
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
