/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The single error type shared by the whole engine.

use core::fmt;

use syscalls::Errno;
use thiserror::Error;

/// A specialized result type for engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// An engine failure.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    /// A kernel interface call failed. The errno is preserved verbatim.
    #[error("{context}: {errno}")]
    Os {
        /// Which call failed.
        context: &'static str,
        /// The raw OS error.
        errno: Errno,
    },

    /// The engine was asked to do something it cannot do, e.g. look up an
    /// unknown register or arm a fifth hardware stop-point.
    #[error("{0}")]
    Usage(String),

    /// The forked child failed before `execvp` replaced it. The failing step
    /// and its errno were shipped back across the launch pipe.
    #[error("could not launch tracee: {step}: {errno}")]
    Launch {
        /// Which step of the launch sequence failed in the child.
        step: LaunchStep,
        /// The raw OS error reported by the child.
        errno: Errno,
    },
}

impl Error {
    pub(crate) fn usage<S: Into<String>>(msg: S) -> Self {
        Self::Usage(msg.into())
    }

    /// The OS error behind this failure, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Os { errno, .. } | Self::Launch { errno, .. } => Some(*errno),
            Self::Usage(_) => None,
        }
    }
}

/// Which step of the launch sequence failed inside the child.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum LaunchStep {
    /// Moving the child into its own process group failed.
    SetPgid,
    /// Disabling address-space randomization failed.
    DisableAslr,
    /// Redirecting stdout to the replacement descriptor failed.
    RedirectStdout,
    /// `PTRACE_TRACEME` failed.
    TraceMe,
    /// `execvp` failed.
    Exec,
}

impl LaunchStep {
    /// Returns a string representation of the failed step.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetPgid => "setpgid failed",
            Self::DisableAslr => "disabling ASLR failed",
            Self::RedirectStdout => "stdout redirection failed",
            Self::TraceMe => "PTRACE_TRACEME failed",
            Self::Exec => "exec failed",
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::SetPgid,
            1 => Self::DisableAslr,
            2 => Self::RedirectStdout,
            3 => Self::TraceMe,
            _ => Self::Exec,
        }
    }
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Write::write_str(f, self.as_str())
    }
}

/// A launch failure as it travels over the pipe: a fixed eight-byte record so
/// the child-side write stays well below PIPE_BUF and is therefore atomic.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct LaunchError {
    pub step: LaunchStep,
    pub errno: Errno,
}

impl LaunchError {
    pub(crate) fn new(step: LaunchStep, errno: Errno) -> Self {
        Self { step, errno }
    }

    pub(crate) fn into_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&(self.step as u32).to_le_bytes());
        bytes[4..].copy_from_slice(&self.errno.into_raw().to_le_bytes());
        bytes
    }

    pub(crate) fn from_bytes(bytes: [u8; 8]) -> Self {
        let step = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let errno = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            step: LaunchStep::from_raw(step),
            errno: Errno::new(errno),
        }
    }
}

impl From<LaunchError> for Error {
    fn from(err: LaunchError) -> Self {
        Self::Launch {
            step: err.step,
            errno: err.errno,
        }
    }
}

/// Attaches kernel-call context to raw errno results.
pub(crate) trait Context<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> Context<T> for core::result::Result<T, Errno> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|errno| Error::Os { context, errno })
    }
}

impl<T> Context<T> for core::result::Result<T, nix::errno::Errno> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|errno| Error::Os {
            context,
            errno: Errno::new(errno as i32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_record_round_trip() {
        let err = LaunchError::new(LaunchStep::Exec, Errno::ENOENT);
        assert_eq!(LaunchError::from_bytes(err.into_bytes()), err);

        let err = LaunchError::new(LaunchStep::SetPgid, Errno::EPERM);
        assert_eq!(LaunchError::from_bytes(err.into_bytes()), err);
    }

    #[test]
    fn errno_is_preserved() {
        let err = Error::Os {
            context: "waitpid",
            errno: Errno::ECHILD,
        };
        assert_eq!(err.errno(), Some(Errno::ECHILD));
        assert_eq!(Error::usage("nope").errno(), None);
    }
}
