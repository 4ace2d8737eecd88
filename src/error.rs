// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error")]
    IoError(#[from] io::Error),
    #[error("nix error")]
    NixError(#[from] nix::Error),
    #[error("json error")]
    JsonError(#[from] serde_json::Error),
    #[error("could not prepare {}: {source}", path.display())]
    Bootstrap { path: PathBuf, source: io::Error },
    #[error("failed to start {}: {source}", program.display())]
    WorkerLaunch { program: PathBuf, source: io::Error },
    #[error("command failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("command still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: Box<Error> },
    #[error("failed to terminate process {pid}: {source}")]
    Termination { pid: libc::pid_t, source: nix::Error },
    #[error("worker not ready after {waited:?}")]
    WorkerNotReady { waited: Duration },
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Errors that must stop startup before anything binds a port
    pub fn is_fatal(&self) -> bool {
        match self.0 {
            ErrorKind::Bootstrap { .. }
            | ErrorKind::CommandFailed { .. }
            | ErrorKind::RetriesExhausted { .. } => true,
            ErrorKind::WorkerLaunch { .. }
            | ErrorKind::Termination { .. }
            | ErrorKind::WorkerNotReady { .. } => false,
            _ => true,
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_and_termination_failures_are_not_fatal() {
        let launch = Error::from(ErrorKind::WorkerLaunch {
            program: PathBuf::from("node"),
            source: io::Error::from(io::ErrorKind::NotFound),
        });
        assert!(!launch.is_fatal());

        let term = Error::from(ErrorKind::Termination {
            pid: 42,
            source: nix::Error::EPERM,
        });
        assert!(!term.is_fatal());
    }

    #[test]
    fn bootstrap_and_migration_failures_are_fatal() {
        let boot = Error::from(ErrorKind::Bootstrap {
            path: PathBuf::from("/data"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        });
        assert!(boot.is_fatal());

        let cmd = Error::from(ErrorKind::CommandFailed {
            exit_code: Some(1),
            stderr: "no such table".to_string(),
        });
        assert!(cmd.is_fatal());
        assert!(cmd.to_string().contains("no such table"));
    }
}
