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

//! Deterministic loopback mechanism for tests.
//!
//! This provider computes reversible, key-dependent transforms with
//! no real cryptography, so tests can check the marshalling pipeline
//! byte for byte and drive the context-expired paths on demand.
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::mech::GssCryptError;
use crate::mech::GssImportError;
use crate::mech::GssMechanism;
use crate::mech::GssSecContext;
use crate::mech::GssService;
use crate::mech::Pseudoflavor;
use crate::xdr::XdrBuf;

pub(crate) const LOOPBACK_FLAVOR_NONE: u32 = 900001;
pub(crate) const LOOPBACK_FLAVOR_INTEGRITY: u32 = 900002;
pub(crate) const LOOPBACK_FLAVOR_PRIVACY: u32 = 900003;

const MIC_TAG: [u8; 3] = *b"MIC";
const WRAP_TAG: [u8; 3] = *b"WRP";

/// A blob beginning with this byte imports as
/// [GssImportError::Unsupported].
pub(crate) const REJECT_KEY: u8 = 0xff;

pub(crate) struct LoopbackMechanism {
    flavors: [Pseudoflavor; 3]
}

pub(crate) struct LoopbackContext {
    /// XOR key, taken from the first blob byte.
    key: u8,
    /// When set, every operation reports context expiry.
    expired: Arc<AtomicBool>
}

impl LoopbackMechanism {
    pub(crate) fn new() -> Self {
        LoopbackMechanism {
            flavors: [
                Pseudoflavor {
                    flavor: LOOPBACK_FLAVOR_NONE,
                    service: GssService::None
                },
                Pseudoflavor {
                    flavor: LOOPBACK_FLAVOR_INTEGRITY,
                    service: GssService::Integrity
                },
                Pseudoflavor {
                    flavor: LOOPBACK_FLAVOR_PRIVACY,
                    service: GssService::Privacy
                }
            ]
        }
    }
}

impl LoopbackContext {
    /// Create a context with the given key, returning the shared
    /// expiry switch alongside it.
    pub(crate) fn new(key: u8) -> (Self, Arc<AtomicBool>) {
        let expired = Arc::new(AtomicBool::new(false));
        let ctx = LoopbackContext {
            key: key,
            expired: expired.clone()
        };

        (ctx, expired)
    }

    fn check_expired(&self) -> Result<(), GssCryptError> {
        if self.expired.load(Ordering::Acquire) {
            Err(GssCryptError::ContextExpired)
        } else {
            Ok(())
        }
    }

    fn checksum(
        &self,
        data: &[u8]
    ) -> u32 {
        data.iter().fold(self.key as u32, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(*b as u32)
        })
    }
}

impl GssMechanism for LoopbackMechanism {
    fn name(&self) -> &str {
        "loopback"
    }

    fn upcall_enctypes(&self) -> Option<&str> {
        None
    }

    fn pseudoflavors(&self) -> &[Pseudoflavor] {
        &self.flavors
    }

    fn import_context(
        &self,
        blob: &[u8]
    ) -> Result<Box<dyn GssSecContext>, GssImportError> {
        match blob.first() {
            Some(key) if *key == REJECT_KEY => {
                Err(GssImportError::Unsupported)
            }
            Some(key) => {
                let (ctx, _) = LoopbackContext::new(*key);

                Ok(Box::new(ctx))
            }
            None => Err(GssImportError::Invalid)
        }
    }
}

impl GssSecContext for LoopbackContext {
    fn mic(
        &self,
        data: &[u8]
    ) -> Result<Vec<u8>, GssCryptError> {
        self.check_expired()?;

        let mut mic = Vec::with_capacity(8);

        mic.extend_from_slice(&MIC_TAG);
        mic.push(self.key);
        mic.extend_from_slice(&self.checksum(data).to_be_bytes());

        Ok(mic)
    }

    fn verify_mic(
        &self,
        data: &[u8],
        mic: &[u8]
    ) -> Result<(), GssCryptError> {
        self.check_expired()?;

        let expected = self.mic(data)?;

        if expected == mic {
            Ok(())
        } else {
            Err(GssCryptError::Failure { code: 1 })
        }
    }

    fn wrap(
        &self,
        offset: usize,
        buf: &mut XdrBuf
    ) -> Result<(), GssCryptError> {
        self.check_expired()?;

        let len = buf.len() - offset;
        let region = buf
            .bytes_at(offset, len)
            .map_err(|_| GssCryptError::Failure { code: 2 })?;
        let mut wrapped = Vec::with_capacity(len + 8);

        wrapped.extend_from_slice(&WRAP_TAG);
        wrapped.push(self.key);
        wrapped.extend_from_slice(&(len as u32).to_be_bytes());
        wrapped.extend(region.iter().map(|b| b ^ self.key));

        buf.replace_from(offset, &wrapped)
            .map_err(|_| GssCryptError::Failure { code: 2 })
    }

    fn unwrap(
        &self,
        offset: usize,
        buf: &mut XdrBuf
    ) -> Result<(), GssCryptError> {
        self.check_expired()?;

        let len = buf.len() - offset;
        let region = buf
            .bytes_at(offset, len)
            .map_err(|_| GssCryptError::Failure { code: 2 })?;

        if len < 8 || region[..3] != WRAP_TAG || region[3] != self.key {
            return Err(GssCryptError::Failure { code: 3 });
        }

        let inner_len = u32::from_be_bytes([
            region[4], region[5], region[6], region[7]
        ]) as usize;

        if inner_len + 8 > len {
            return Err(GssCryptError::Failure { code: 3 });
        }

        let plain: Vec<u8> = region[8..8 + inner_len]
            .iter()
            .map(|b| b ^ self.key)
            .collect();

        buf.replace_from(offset, &plain)
            .map_err(|_| GssCryptError::Failure { code: 2 })
    }
}

#[cfg(test)]
use crate::init;

#[test]
fn test_mic_round_trip() {
    init();

    let (ctx, _) = LoopbackContext::new(0x5a);
    let mic = ctx.mic(b"hello").unwrap();

    assert!(ctx.verify_mic(b"hello", &mic).is_ok());
    assert!(ctx.verify_mic(b"hellp", &mic).is_err());
}

#[test]
fn test_wrap_round_trip() {
    init();

    let (ctx, _) = LoopbackContext::new(0x21);
    let mut buf = XdrBuf::new(256);

    buf.append_head(&[1, 2, 3, 4]).unwrap();
    buf.append_head(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
    ctx.wrap(4, &mut buf).unwrap();

    assert_ne!(buf.bytes_at(4, 4).unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);

    ctx.unwrap(4, &mut buf).unwrap();

    assert_eq!(buf.len(), 8);
    assert_eq!(buf.bytes_at(0, 8).unwrap(),
               vec![1, 2, 3, 4, 0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn test_expired_switch() {
    init();

    let (ctx, expired) = LoopbackContext::new(0x10);

    expired.store(true, Ordering::Release);

    assert_eq!(ctx.mic(b"x"), Err(GssCryptError::ContextExpired));
}

#[test]
fn test_import_rejects() {
    init();

    let mech = LoopbackMechanism::new();

    assert!(mech.import_context(&[]).is_err());
    assert!(mech.import_context(&[REJECT_KEY, 0]).is_err());
    assert!(mech.import_context(&[0x42]).is_ok());
}
