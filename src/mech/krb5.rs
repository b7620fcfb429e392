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

//! Kerberos 5 mechanism provider.
//!
//! This provider is backed by the system GSSAPI library through
//! `libgssapi`.  The library offers no way to deserialize a context
//! that another process established, so the handover from the helper
//! daemon works by adoption: the daemon-side code negotiates a
//! [ClientCtx] in the usual way (see
//! [step](libgssapi::context::ClientCtx::step)), registers it here
//! with [Krb5Mechanism::adopt], and places the returned handle bytes
//! in the downcall's security blob.  Import then redeems the handle
//! for the live context.
//!
//! Contexts produced this way are internally synchronized and can be
//! shared across concurrent calls.
use std::collections::HashMap;
use std::sync::Mutex;

use libgssapi::context::ClientCtx;
use libgssapi::context::SecurityContext;
use libgssapi::error::MajorFlags;
use log::debug;
use log::warn;

use crate::mech::GssCryptError;
use crate::mech::GssImportError;
use crate::mech::GssMechanism;
use crate::mech::GssSecContext;
use crate::mech::GssService;
use crate::mech::Pseudoflavor;
use crate::xdr::XdrBuf;

/// Pseudo-flavor for krb5 with header authentication only.
pub const RPC_AUTH_GSS_KRB5: u32 = 390003;
/// Pseudo-flavor for krb5 with body integrity.
pub const RPC_AUTH_GSS_KRB5I: u32 = 390004;
/// Pseudo-flavor for krb5 with body privacy.
pub const RPC_AUTH_GSS_KRB5P: u32 = 390005;

/// Encryption types advertised to the daemon.
const KRB5_ENCTYPES: &str = "18,17,16,23,3,1,2";

/// The Kerberos 5 mechanism.
pub struct Krb5Mechanism {
    flavors: [Pseudoflavor; 3],
    /// Contexts adopted from the daemon side, awaiting import.
    adopted: Mutex<Adopted>
}

struct Adopted {
    table: HashMap<u32, ClientCtx>,
    next: u32
}

/// A live krb5 context.
pub struct Krb5Context {
    ctx: Mutex<ClientCtx>
}

impl Krb5Mechanism {
    /// Create the mechanism with an empty adoption table.
    pub fn new() -> Self {
        Krb5Mechanism {
            flavors: [
                Pseudoflavor {
                    flavor: RPC_AUTH_GSS_KRB5,
                    service: GssService::None
                },
                Pseudoflavor {
                    flavor: RPC_AUTH_GSS_KRB5I,
                    service: GssService::Integrity
                },
                Pseudoflavor {
                    flavor: RPC_AUTH_GSS_KRB5P,
                    service: GssService::Privacy
                }
            ],
            adopted: Mutex::new(Adopted {
                table: HashMap::new(),
                next: 1
            })
        }
    }

    /// Register a negotiated context and mint the handle bytes the
    /// daemon places in its downcall.
    pub fn adopt(
        &self,
        ctx: ClientCtx
    ) -> Option<Vec<u8>> {
        match self.adopted.lock() {
            Ok(mut guard) => {
                let handle = guard.next;

                guard.next += 1;
                guard.table.insert(handle, ctx);

                debug!(target: "gss-krb5",
                       "adopted negotiated context as handle {}",
                       handle);

                Some(handle.to_ne_bytes().to_vec())
            }
            Err(_) => None
        }
    }
}

impl Default for Krb5Mechanism {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

fn crypt_error(err: libgssapi::error::Error) -> GssCryptError {
    if err.major.contains(MajorFlags::GSS_S_CONTEXT_EXPIRED) {
        GssCryptError::ContextExpired
    } else {
        warn!(target: "gss-krb5",
              "GSSAPI operation failed: {}",
              err);

        GssCryptError::Failure {
            code: err.major.bits()
        }
    }
}

impl GssMechanism for Krb5Mechanism {
    fn name(&self) -> &str {
        "krb5"
    }

    fn upcall_enctypes(&self) -> Option<&str> {
        Some(KRB5_ENCTYPES)
    }

    fn pseudoflavors(&self) -> &[Pseudoflavor] {
        &self.flavors
    }

    fn import_context(
        &self,
        blob: &[u8]
    ) -> Result<Box<dyn GssSecContext>, GssImportError> {
        if blob.len() != 4 {
            return Err(GssImportError::Invalid);
        }

        let handle =
            u32::from_ne_bytes([blob[0], blob[1], blob[2], blob[3]]);
        let ctx = match self.adopted.lock() {
            Ok(mut guard) => guard.table.remove(&handle),
            Err(_) => None
        };

        match ctx {
            Some(ctx) => Ok(Box::new(Krb5Context {
                ctx: Mutex::new(ctx)
            })),
            None => {
                warn!(target: "gss-krb5",
                      "no adopted context for handle {}",
                      handle);

                Err(GssImportError::Invalid)
            }
        }
    }
}

impl GssSecContext for Krb5Context {
    fn mic(
        &self,
        data: &[u8]
    ) -> Result<Vec<u8>, GssCryptError> {
        match self.ctx.lock() {
            Ok(mut guard) => match guard.get_mic(data) {
                Ok(mic) => Ok(mic.as_ref().to_vec()),
                Err(err) => Err(crypt_error(err))
            },
            Err(_) => Err(GssCryptError::Failure { code: 0 })
        }
    }

    fn verify_mic(
        &self,
        data: &[u8],
        mic: &[u8]
    ) -> Result<(), GssCryptError> {
        match self.ctx.lock() {
            Ok(mut guard) => {
                guard.verify_mic(data, mic).map_err(crypt_error)
            }
            Err(_) => Err(GssCryptError::Failure { code: 0 })
        }
    }

    fn wrap(
        &self,
        offset: usize,
        buf: &mut XdrBuf
    ) -> Result<(), GssCryptError> {
        let len = buf.len() - offset;
        let region = buf
            .bytes_at(offset, len)
            .map_err(|_| GssCryptError::Failure { code: 0 })?;
        let wrapped = match self.ctx.lock() {
            Ok(mut guard) => {
                guard.wrap(true, &region).map_err(crypt_error)?
            }
            Err(_) => return Err(GssCryptError::Failure { code: 0 })
        };

        buf.replace_from(offset, wrapped.as_ref())
            .map_err(|_| GssCryptError::Failure { code: 0 })
    }

    fn unwrap(
        &self,
        offset: usize,
        buf: &mut XdrBuf
    ) -> Result<(), GssCryptError> {
        let len = buf.len() - offset;
        let region = buf
            .bytes_at(offset, len)
            .map_err(|_| GssCryptError::Failure { code: 0 })?;
        let plain = match self.ctx.lock() {
            Ok(mut guard) => {
                guard.unwrap(&region).map_err(crypt_error)?
            }
            Err(_) => return Err(GssCryptError::Failure { code: 0 })
        };

        buf.replace_from(offset, plain.as_ref())
            .map_err(|_| GssCryptError::Failure { code: 0 })
    }
}
