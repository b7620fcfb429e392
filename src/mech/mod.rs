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

//! GSS mechanism provider interface.
//!
//! The credential machinery never computes cryptography itself; it
//! consumes a mechanism provider through the [GssMechanism] and
//! [GssSecContext] traits.  A provider imports the opaque context
//! blob handed down by the daemon into a live security context, and
//! that context then produces and checks integrity tags and wraps
//! and unwraps call bodies in place.
//!
//! Every per-message operation reports one of three outcomes:
//! success, context expiry, or failure.  Context expiry is never a
//! hard error at this layer; the caller clears the credential's
//! up-to-date flag and lets renewal take over.
//!
//! Mechanisms are looked up by *pseudo-flavor*: an integer in the
//! RPC auth-flavor namespace that encodes a (mechanism, service)
//! pair.  The [MechRegistry] maps pseudo-flavors to registered
//! providers.
//!
//! A Kerberos 5 provider backed by `libgssapi` is available behind
//! the `krb5` feature in the [krb5] module.
use std::fmt::Display;
use std::fmt::Error;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::RwLock;

use log::debug;
use log::trace;

use crate::error::ErrorScope;
use crate::error::MutexPoison;
use crate::error::ScopedError;
use crate::xdr::XdrBuf;

#[cfg(feature = "krb5")]
pub mod krb5;
#[cfg(test)]
pub(crate) mod loopback;

/// Security services a context can provide for a call body.
///
/// The numeric values are the RPCSEC_GSS wire encoding.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum GssService {
    /// Authentication of the header only; plaintext body.
    None = 1,
    /// Integrity protection of the body via a MIC.
    Integrity = 2,
    /// Encryption of the body.
    Privacy = 3
}

/// Errors reported by per-message provider operations.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum GssCryptError {
    /// The security context has expired.
    ///
    /// Callers clear the credential's up-to-date flag and continue;
    /// renewal is driven elsewhere.
    ContextExpired,
    /// Any other provider failure.
    Failure {
        /// Provider-specific major status code.
        code: u32
    }
}

/// Errors importing a daemon context blob.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum GssImportError {
    /// The blob was malformed.
    Invalid,
    /// The blob refers to something this provider cannot produce.
    Unsupported
}

/// A live GSS security context.
///
/// Implementations are shared across concurrent calls and must be
/// internally synchronized.
pub trait GssSecContext: Send + Sync {
    /// Compute a MIC over `data`.
    fn mic(
        &self,
        data: &[u8]
    ) -> Result<Vec<u8>, GssCryptError>;

    /// Verify `mic` against `data`.
    fn verify_mic(
        &self,
        data: &[u8],
        mic: &[u8]
    ) -> Result<(), GssCryptError>;

    /// Wrap the byte range `[offset..]` of `buf` in place.
    fn wrap(
        &self,
        offset: usize,
        buf: &mut XdrBuf
    ) -> Result<(), GssCryptError>;

    /// Unwrap the byte range `[offset..]` of `buf` in place.
    fn unwrap(
        &self,
        offset: usize,
        buf: &mut XdrBuf
    ) -> Result<(), GssCryptError>;
}

/// Pseudo-flavor table entry.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pseudoflavor {
    /// The RPC auth-flavor number.
    pub flavor: u32,
    /// The service this flavor selects.
    pub service: GssService
}

/// A GSS mechanism provider.
pub trait GssMechanism: Send + Sync {
    /// Get the mechanism name, as used in upcall requests and pipe
    /// names (e.g. `"krb5"`).
    fn name(&self) -> &str;

    /// Get the encryption-type list advertised to the daemon, if
    /// the mechanism has one.
    fn upcall_enctypes(&self) -> Option<&str>;

    /// Get the pseudo-flavor table for this mechanism.
    fn pseudoflavors(&self) -> &[Pseudoflavor];

    /// Import a serialized context blob, as received from the
    /// daemon, into a live context.
    fn import_context(
        &self,
        blob: &[u8]
    ) -> Result<Box<dyn GssSecContext>, GssImportError>;
}

/// Registry of mechanism providers, indexed by name and
/// pseudo-flavor.
pub struct MechRegistry {
    mechs: RwLock<Vec<Arc<dyn GssMechanism>>>
}

impl MechRegistry {
    /// Create an empty registry.
    #[inline]
    pub fn new() -> Self {
        MechRegistry {
            mechs: RwLock::new(Vec::new())
        }
    }

    /// Register a mechanism provider.
    pub fn register(
        &self,
        mech: Arc<dyn GssMechanism>
    ) -> Result<(), MutexPoison> {
        debug!(target: "gss-mech",
               "registering mechanism \"{}\"",
               mech.name());

        match self.mechs.write() {
            Ok(mut guard) => {
                guard.push(mech);

                Ok(())
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Look up a mechanism by name.
    pub fn by_name(
        &self,
        name: &str
    ) -> Result<Option<Arc<dyn GssMechanism>>, MutexPoison> {
        match self.mechs.read() {
            Ok(guard) => {
                Ok(guard.iter().find(|m| m.name() == name).cloned())
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Look up the (mechanism, service) pair a pseudo-flavor
    /// encodes.
    pub fn by_pseudoflavor(
        &self,
        flavor: u32
    ) -> Result<Option<(Arc<dyn GssMechanism>, GssService)>, MutexPoison>
    {
        match self.mechs.read() {
            Ok(guard) => {
                for mech in guard.iter() {
                    for pf in mech.pseudoflavors() {
                        if pf.flavor == flavor {
                            trace!(target: "gss-mech",
                                   "pseudo-flavor {} is {}/{:?}",
                                   flavor, mech.name(), pf.service);

                            return Ok(Some((mech.clone(), pf.service)));
                        }
                    }
                }

                Ok(None)
            }
            Err(_) => Err(MutexPoison)
        }
    }
}

impl Default for MechRegistry {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ScopedError for GssCryptError {
    fn scope(&self) -> ErrorScope {
        match self {
            GssCryptError::ContextExpired => ErrorScope::Retryable,
            GssCryptError::Failure { .. } => ErrorScope::Session
        }
    }
}

impl ScopedError for GssImportError {
    fn scope(&self) -> ErrorScope {
        match self {
            GssImportError::Invalid => ErrorScope::External,
            GssImportError::Unsupported => ErrorScope::External
        }
    }
}

impl Display for GssService {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        match self {
            GssService::None => write!(f, "none"),
            GssService::Integrity => write!(f, "integrity"),
            GssService::Privacy => write!(f, "privacy")
        }
    }
}

impl Display for GssCryptError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        match self {
            GssCryptError::ContextExpired => {
                write!(f, "security context expired")
            }
            GssCryptError::Failure { code } => {
                write!(f, "provider failure (0x{:08x})", code)
            }
        }
    }
}

impl Display for GssImportError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        match self {
            GssImportError::Invalid => write!(f, "malformed context blob"),
            GssImportError::Unsupported => {
                write!(f, "unsupported context blob")
            }
        }
    }
}

#[cfg(test)]
use crate::init;

#[test]
fn test_registry_by_name() {
    init();

    let registry = MechRegistry::new();
    let mech = Arc::new(loopback::LoopbackMechanism::new());

    registry.register(mech).unwrap();

    assert!(registry.by_name("loopback").unwrap().is_some());
    assert!(registry.by_name("krb5-missing").unwrap().is_none());
}

#[test]
fn test_registry_by_pseudoflavor() {
    init();

    let registry = MechRegistry::new();
    let mech = Arc::new(loopback::LoopbackMechanism::new());

    registry.register(mech).unwrap();

    let (mech, service) = registry
        .by_pseudoflavor(loopback::LOOPBACK_FLAVOR_INTEGRITY)
        .unwrap()
        .expect("expected a match");

    assert_eq!(mech.name(), "loopback");
    assert_eq!(service, GssService::Integrity);

    let (_, service) = registry
        .by_pseudoflavor(loopback::LOOPBACK_FLAVOR_NONE)
        .unwrap()
        .expect("expected a match");

    assert_eq!(service, GssService::None);
    assert!(registry.by_pseudoflavor(999999).unwrap().is_none());
}
