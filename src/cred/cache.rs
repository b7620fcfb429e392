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

//! The credential cache.
//!
//! Credentials are cached per (uid, principal) so that every call by
//! the same user reuses the same long-lived credential and its
//! context.  The cache owns its credentials; everything else holds
//! plain references.  Lookup misses run a caller-supplied create
//! callback, so the cache itself stays agnostic of how credentials
//! are born.
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Instant;

use log::debug;
use log::trace;

use crate::cred::GssCredential;
use crate::error::MutexPoison;

/// A lookup request: the identity a caller wants a credential for.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AuthCred {
    /// The requesting user.
    pub uid: u32,
    /// Principal to authenticate as, for machine credentials.
    pub principal: Option<String>,
    /// Whether this is a machine credential request; only then is
    /// the principal bound into the credential.
    pub machine_cred: bool
}

/// Credential cache indexed by uid.
///
/// Buckets are scanned with [GssCredential::matches], which encodes
/// the staleness rules: `NEW` credentials always match their
/// identity, settled ones must also be up to date and unexpired.
pub struct CredCache {
    table: RwLock<HashMap<u32, Vec<Arc<GssCredential>>>>
}

impl AuthCred {
    /// Create a plain user lookup.
    #[inline]
    pub fn user(uid: u32) -> Self {
        AuthCred {
            uid: uid,
            principal: None,
            machine_cred: false
        }
    }

    /// Create a machine credential lookup.
    #[inline]
    pub fn machine(
        uid: u32,
        principal: &str
    ) -> Self {
        AuthCred {
            uid: uid,
            principal: Some(String::from(principal)),
            machine_cred: true
        }
    }
}

impl CredCache {
    /// Create an empty cache.
    #[inline]
    pub fn new() -> Self {
        CredCache {
            table: RwLock::new(HashMap::new())
        }
    }

    /// Look up a credential for `acred`, creating one with `create`
    /// on a miss.
    ///
    /// Concurrent lookups for the same identity race benignly: the
    /// read pass is lock-shared, and the write pass re-scans before
    /// inserting, so exactly one credential wins.
    pub fn lookup<C>(
        &self,
        acred: &AuthCred,
        create: C
    ) -> Result<Arc<GssCredential>, MutexPoison>
    where
        C: FnOnce(&AuthCred) -> Arc<GssCredential> {
        let now = Instant::now();

        trace!(target: "gss-credcache",
               "looking up credential for uid {}",
               acred.uid);

        // Try to get a result from read-only operations.
        let out = match self.table.read() {
            Ok(read) => Ok(read.get(&acred.uid).and_then(|bucket| {
                bucket
                    .iter()
                    .find(|cred| {
                        cred.matches(
                            acred.uid,
                            acred.principal.as_deref(),
                            now
                        )
                    })
                    .cloned()
            })),
            Err(_) => Err(MutexPoison)
        }?;

        match out {
            Some(out) => {
                trace!(target: "gss-credcache",
                       "found cached credential for uid {}",
                       acred.uid);

                Ok(out)
            }
            None => match self.table.write() {
                Ok(mut write) => match write.entry(acred.uid) {
                    Entry::Occupied(mut ent) => {
                        // Someone might have created one before we
                        // took the write lock.
                        match ent.get().iter().find(|cred| {
                            cred.matches(
                                acred.uid,
                                acred.principal.as_deref(),
                                now
                            )
                        }) {
                            Some(cred) => Ok(cred.clone()),
                            None => {
                                let cred = create(acred);

                                debug!(target: "gss-credcache",
                                       "created credential for uid {}",
                                       acred.uid);

                                ent.get_mut().push(cred.clone());

                                Ok(cred)
                            }
                        }
                    }
                    Entry::Vacant(ent) => {
                        let cred = create(acred);

                        debug!(target: "gss-credcache",
                               "created credential for uid {}",
                               acred.uid);

                        ent.insert(vec![cred.clone()]);

                        Ok(cred)
                    }
                },
                Err(_) => Err(MutexPoison)
            }
        }
    }

    /// Remove settled, stale credentials that nothing else holds,
    /// returning them for destruction.
    pub fn sweep(
        &self
    ) -> Result<Vec<Arc<GssCredential>>, MutexPoison> {
        let now = Instant::now();

        match self.table.write() {
            Ok(mut write) => {
                let mut swept = Vec::new();

                for bucket in write.values_mut() {
                    let mut keep = Vec::with_capacity(bucket.len());

                    for cred in bucket.drain(..) {
                        let stale = !cred.is_new() &&
                            !cred.matches(
                                cred.uid(),
                                cred.principal(),
                                now
                            );

                        if stale && Arc::strong_count(&cred) == 1 {
                            swept.push(cred);
                        } else {
                            keep.push(cred);
                        }
                    }

                    *bucket = keep;
                }

                write.retain(|_, bucket| !bucket.is_empty());

                if !swept.is_empty() {
                    debug!(target: "gss-credcache",
                           "swept {} stale credential(s)",
                           swept.len());
                }

                Ok(swept)
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Empty the cache, returning every credential for destruction.
    pub fn clear(
        &self
    ) -> Result<Vec<Arc<GssCredential>>, MutexPoison> {
        match self.table.write() {
            Ok(mut write) => {
                let mut out = Vec::new();

                for (_, mut bucket) in write.drain() {
                    out.append(&mut bucket);
                }

                debug!(target: "gss-credcache",
                       "cleared {} credential(s)",
                       out.len());

                Ok(out)
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Get the number of cached credentials.
    pub fn len(&self) -> Result<usize, MutexPoison> {
        match self.table.read() {
            Ok(read) => {
                Ok(read.values().map(|bucket| bucket.len()).sum())
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Check whether the cache is empty.
    #[inline]
    pub fn is_empty(&self) -> Result<bool, MutexPoison> {
        Ok(self.len()? == 0)
    }
}

impl Default for CredCache {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
use std::sync::Weak;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::cred::test_context;
#[cfg(test)]
use crate::mech::GssService;

#[cfg(test)]
fn make_cred(acred: &AuthCred) -> Arc<GssCredential> {
    let principal = if acred.machine_cred {
        acred.principal.clone()
    } else {
        None
    };

    GssCredential::new(
        acred.uid,
        principal,
        GssService::Integrity,
        Weak::new()
    )
}

#[test]
fn test_lookup_creates_once() {
    init();

    let cache = CredCache::new();
    let acred = AuthCred::user(1000);
    let first = cache.lookup(&acred, make_cred).unwrap();
    let second = cache.lookup(&acred, make_cred).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len().unwrap(), 1);
}

#[test]
fn test_lookup_separates_uids() {
    init();

    let cache = CredCache::new();
    let first = cache.lookup(&AuthCred::user(1000), make_cred).unwrap();
    let second = cache.lookup(&AuthCred::user(1001), make_cred).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len().unwrap(), 2);
}

#[test]
fn test_lookup_stale_creates_fresh() {
    init();

    let cache = CredCache::new();
    let acred = AuthCred::user(1000);
    let first = cache.lookup(&acred, make_cred).unwrap();

    // Install a context, then invalidate it; the credential is now
    // settled and stale, so a new lookup must not return it.
    first.set_ctx(&test_context(1)).unwrap();
    first.clear_uptodate();

    let second = cache.lookup(&acred, make_cred).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_new());
}

#[test]
fn test_sweep_removes_stale_unreferenced() {
    init();

    let cache = CredCache::new();
    let acred = AuthCred::user(1000);
    let cred = cache.lookup(&acred, make_cred).unwrap();

    cred.set_ctx(&test_context(1)).unwrap();
    cred.clear_uptodate();
    drop(cred);

    let swept = cache.sweep().unwrap();

    assert_eq!(swept.len(), 1);
    assert!(cache.is_empty().unwrap());
}

#[test]
fn test_machine_cred_keyed_by_principal() {
    init();

    let cache = CredCache::new();
    let machine = AuthCred::machine(0, "host/a@REALM");
    let first = cache.lookup(&machine, make_cred).unwrap();
    let second = cache.lookup(&machine, make_cred).unwrap();
    let plain = cache.lookup(&AuthCred::user(0), make_cred).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &plain));
}
