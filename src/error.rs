// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Error classification utilities.
//!
//! Errors in this crate implement [ScopedError], which classifies an
//! error according to what it affects.  This tells callers what has
//! been compromised by the error, and thus what needs to be torn down
//! or retried.  Additionally, this module provides [AuthCredError]:
//! the error type surfaced to RPC callers by the credential and
//! upcall machinery, corresponding one-for-one to the errno values
//! the daemon protocol speaks.
use std::fmt::Display;
use std::fmt::Error;
use std::fmt::Formatter;

/// Classification of errors by what they affect.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorScope {
    /// Errors that do not represent a failure condition.
    ///
    /// These can be retried immediately.
    Retryable,
    /// Errors originating from an external collaborator (the daemon,
    /// or the server).
    ///
    /// These are not a malfunction of this subsystem.
    External,
    /// Errors that compromise the current session.
    Session,
    /// Errors affecting the whole process or host.
    System,
    /// Errors indicating an orderly shutdown.
    Shutdown,
    /// Errors from which no recovery is possible.
    Unrecoverable
}

/// Trait for errors that can report their [ErrorScope].
pub trait ScopedError {
    /// Get the scope affected by this error.
    fn scope(&self) -> ErrorScope;
}

/// Error indicating that a mutex was poisoned.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MutexPoison;

/// Errors surfaced to RPC callers by credential acquisition and
/// refresh.
///
/// Each variant corresponds to one row of the error policy table:
/// the daemon protocol and the credential machinery communicate in
/// these terms, and the RPC runtime decides whether to retry or fail
/// the call based on the variant.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AuthCredError {
    /// The daemon is absent, or a transient resource shortage
    /// occurred on the send path.
    ///
    /// Callers retry after a bounded wait.
    Retry,
    /// The daemon refused the request, or no daemon appeared within
    /// the timeout.
    ///
    /// Surfaced to the RPC caller without retry.
    Denied,
    /// The daemon reported that the underlying key material has
    /// expired.
    ///
    /// The credential is marked negative for a cooling-off window.
    KeyExpired,
    /// The daemon detached while the request was pending.
    PipeClosed,
    /// A synchronous waiter was killed before the daemon replied.
    ///
    /// The upcall continues in the background.
    Interrupted,
    /// A provider MIC, wrap, or unwrap operation failed for a reason
    /// other than context expiry.
    Crypto,
    /// A mutex was poisoned.
    MutexPoison
}

impl ScopedError for MutexPoison {
    #[inline]
    fn scope(&self) -> ErrorScope {
        ErrorScope::Unrecoverable
    }
}

impl ScopedError for AuthCredError {
    fn scope(&self) -> ErrorScope {
        match self {
            AuthCredError::Retry => ErrorScope::Retryable,
            AuthCredError::Denied => ErrorScope::External,
            AuthCredError::KeyExpired => ErrorScope::External,
            AuthCredError::PipeClosed => ErrorScope::Session,
            AuthCredError::Interrupted => ErrorScope::Shutdown,
            AuthCredError::Crypto => ErrorScope::Session,
            AuthCredError::MutexPoison => ErrorScope::Unrecoverable
        }
    }
}

impl Display for MutexPoison {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        write!(f, "mutex poisoned")
    }
}

impl Display for AuthCredError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        match self {
            AuthCredError::Retry => write!(f, "temporarily unavailable"),
            AuthCredError::Denied => write!(f, "permission denied"),
            AuthCredError::KeyExpired => write!(f, "key has expired"),
            AuthCredError::PipeClosed => write!(f, "upcall pipe closed"),
            AuthCredError::Interrupted => write!(f, "interrupted"),
            AuthCredError::Crypto => {
                write!(f, "security transform failed")
            }
            AuthCredError::MutexPoison => write!(f, "mutex poisoned")
        }
    }
}
