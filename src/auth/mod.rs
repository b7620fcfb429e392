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

//! The RPCSEC_GSS authenticator.
//!
//! A [GssAuthenticator] implements the runtime's auth-flavor
//! contract for one client: it stamps outbound calls with a
//! credential block and a MIC verifier, checks the verifier on
//! replies, applies the selected security service to call bodies,
//! and keeps the credentials behind all of that fresh.
//!
//! # Call paths
//!
//! On the send side, [refresh](GssAuthenticator::refresh) runs
//! first and acquires or renews the task's credential, then
//! [marshal](GssAuthenticator::marshal) emits the credential block
//! and verifier, and [wrap_req](GssAuthenticator::wrap_req) encodes
//! the body, wrapping it according to the service.  On the receive
//! side, [validate](GssAuthenticator::validate) checks the reply
//! verifier and [unwrap_resp](GssAuthenticator::unwrap_resp)
//! reverses the body transform.  None of the four marshalling
//! operations ever sleeps; they run in the transport's send and
//! receive paths.
//!
//! # Acquisition
//!
//! A missing or stale credential is filled by an upcall to the
//! user-space daemon.  Synchronous callers use
//! [create_context](GssAuthenticator::create_context), which blocks
//! killably; RPC tasks use `refresh`, which never blocks and
//! instead parks the task for the scheduler to re-drive.  Both
//! paths funnel through a single de-duplicated [UpcallMessage] per
//! (pipe, uid).
use std::fmt::Display;
use std::fmt::Error;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Instant;

use log::debug;
use log::trace;
use log::warn;

use crate::config::CredTimeouts;
use crate::cred::GssContext;
use crate::cred::GssCredential;
use crate::cred::GssProc;
use crate::cred::cache::AuthCred;
use crate::cred::cache::CredCache;
use crate::error::AuthCredError;
use crate::error::ErrorScope;
use crate::error::MutexPoison;
use crate::error::ScopedError;
use crate::mech::GssCryptError;
use crate::mech::GssMechanism;
use crate::mech::GssService;
use crate::mech::MechRegistry;
use crate::pipe::DaemonWait;
use crate::pipe::DowncallError;
use crate::pipe::DowncallSink;
use crate::pipe::GssPipe;
use crate::pipe::PipeError;
use crate::pipe::VersionLatch;
use crate::rpc::Interrupt;
use crate::rpc::RpcClient;
use crate::rpc::RpcRequest;
use crate::rpc::RpcTask;
use crate::rpc::RPC_MAX_AUTH_SIZE;
use crate::upcall::UpcallMessage;
use crate::upcall::UpcallWake;
use crate::upcall::encode_v0_msg;
use crate::upcall::encode_v1_msg;
use crate::upcall::handle_downcall_result;
use crate::upcall::pipe_downcall;
use crate::xdr::XdrBuf;
use crate::xdr::XdrError;

/// The RPCSEC_GSS auth flavor number.
pub const RPC_AUTH_GSS: u32 = 6;

/// RPCSEC_GSS protocol version.
pub const RPC_GSS_VERSION: u32 = 1;

/// Send-side slack reserved per call for the credential, verifier,
/// and wrap growth.
pub const GSS_CRED_SLACK: usize = RPC_MAX_AUTH_SIZE * 2;

/// Reply-side slack: a krb5 verifier plus the two integers
/// integrity places before the arguments.
pub const GSS_VERF_SLACK: usize = 100;

/// Errors that can occur creating an authenticator.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AuthCreateError {
    /// No registered mechanism covers the requested pseudo-flavor.
    UnknownFlavor {
        /// The flavor that failed to resolve.
        flavor: u32
    },
    /// A mutex was poisoned.
    MutexPoison
}

/// Encoder for a call body.
///
/// The authenticator controls where the body lands in the send
/// buffer (after the wrap preamble, when one applies); the encoder
/// only appends the body itself.
pub trait WrapEncode {
    /// Append the body to `buf`.
    fn encode(
        &self,
        buf: &mut XdrBuf
    ) -> Result<(), XdrError>;
}

/// Decoder for a reply body.
pub trait WrapDecode {
    /// Decode the body from `buf` starting at `pos`.
    fn decode(
        &mut self,
        buf: &XdrBuf,
        pos: usize
    ) -> Result<(), XdrError>;
}

/// Outcome of trying to attach a task to an in-flight upcall.
enum UpcallPark {
    /// The task parked; the scheduler re-drives it on wake.
    Parked,
    /// The upcall had already completed; its message is returned.
    Complete(Arc<UpcallMessage>)
}

/// An RPCSEC_GSS authenticator bound to one RPC client.
pub struct GssAuthenticator {
    /// The mechanism in use.
    mech: Arc<dyn GssMechanism>,
    /// Security service applied to call bodies.
    service: GssService,
    /// The pseudo-flavor this authenticator was created for.
    flavor: u32,
    /// The owning client.
    client: Arc<dyn RpcClient>,
    /// Legacy binary pipe, named after the mechanism.
    pipe_v0: Arc<GssPipe>,
    /// Textual pipe, named "gssd".
    pipe_v1: Arc<GssPipe>,
    /// The process-wide pipe version latch.
    latch: Arc<VersionLatch>,
    /// Cached credentials.
    credcache: CredCache,
    /// Timing tunables.
    timeouts: CredTimeouts,
    /// Reply verifier footprint in quad-words, updated by validate.
    verfsize: AtomicU32,
    /// Reply-side slack in quad-words, updated by unwrap.
    rslack: AtomicU32
}

#[inline]
fn quadlen(nbytes: usize) -> u32 {
    ((nbytes + 3) / 4) as u32
}

#[inline]
fn xdr_to_auth(err: XdrError) -> AuthCredError {
    match err {
        // An overflow on the send path means the slack reservation
        // could not absorb the call; retry like an allocation
        // failure.
        XdrError::Overflow { .. } => AuthCredError::Retry,
        XdrError::OutOfRange { .. } => AuthCredError::Crypto
    }
}

impl GssAuthenticator {
    /// Create an authenticator for `flavor` on behalf of `client`.
    ///
    /// The textual pipe is created before the legacy one, so a
    /// daemon examining the namespace never concludes that only the
    /// legacy pipe is supported.
    pub fn new(
        client: Arc<dyn RpcClient>,
        registry: &MechRegistry,
        flavor: u32,
        latch: Arc<VersionLatch>,
        timeouts: CredTimeouts
    ) -> Result<Arc<Self>, AuthCreateError> {
        let (mech, service) = registry
            .by_pseudoflavor(flavor)
            .map_err(|_| AuthCreateError::MutexPoison)?
            .ok_or(AuthCreateError::UnknownFlavor { flavor: flavor })?;

        debug!(target: "gss-auth",
               "creating authenticator, mechanism \"{}\", service {}",
               mech.name(), service);

        Ok(Arc::new_cyclic(|weak: &std::sync::Weak<GssAuthenticator>| {
            let pipe_v1: Arc<GssPipe> =
                GssPipe::new("gssd", 1, latch.clone(), weak.clone());
            let pipe_v0: Arc<GssPipe> =
                GssPipe::new(mech.name(), 0, latch.clone(), weak.clone());

            GssAuthenticator {
                mech: mech,
                service: service,
                flavor: flavor,
                client: client,
                pipe_v0: pipe_v0,
                pipe_v1: pipe_v1,
                latch: latch,
                credcache: CredCache::new(),
                timeouts: timeouts,
                verfsize: AtomicU32::new(quadlen(GSS_VERF_SLACK)),
                rslack: AtomicU32::new(quadlen(GSS_VERF_SLACK))
            }
        }))
    }

    /// Get the mechanism in use.
    #[inline]
    pub fn mech(&self) -> &Arc<dyn GssMechanism> {
        &self.mech
    }

    /// Get the security service applied to call bodies.
    #[inline]
    pub fn service(&self) -> GssService {
        self.service
    }

    /// Get the pseudo-flavor this authenticator serves.
    #[inline]
    pub fn flavor(&self) -> u32 {
        self.flavor
    }

    /// Get the legacy binary pipe.
    #[inline]
    pub fn pipe_v0(&self) -> &Arc<GssPipe> {
        &self.pipe_v0
    }

    /// Get the textual pipe.
    #[inline]
    pub fn pipe_v1(&self) -> &Arc<GssPipe> {
        &self.pipe_v1
    }

    /// Get the credential cache.
    #[inline]
    pub fn credcache(&self) -> &CredCache {
        &self.credcache
    }

    /// Get the send-side slack, in quad-words.
    #[inline]
    pub fn cslack(&self) -> u32 {
        quadlen(GSS_CRED_SLACK)
    }

    /// Get the reply-side slack, in quad-words.
    #[inline]
    pub fn rslack(&self) -> u32 {
        self.rslack.load(Ordering::Acquire)
    }

    /// Get the reply verifier footprint, in quad-words.
    #[inline]
    pub fn verfsize(&self) -> u32 {
        self.verfsize.load(Ordering::Acquire)
    }

    /// Look up (or create) the credential for `acred`.
    ///
    /// Settled credentials that have gone stale with no remaining
    /// holders are destroyed on the way.
    pub fn lookup_cred(
        self: &Arc<Self>,
        acred: &AuthCred
    ) -> Result<Arc<GssCredential>, AuthCredError> {
        let swept = self
            .credcache
            .sweep()
            .map_err(|_| AuthCredError::MutexPoison)?;

        for cred in swept {
            self.destroy_cred(&cred);
        }

        self.credcache
            .lookup(acred, |acred| {
                let principal = if acred.machine_cred {
                    acred.principal.clone()
                } else {
                    None
                };

                GssCredential::new(
                    acred.uid,
                    principal,
                    self.service,
                    Arc::downgrade(self)
                )
            })
            .map_err(|_| AuthCredError::MutexPoison)
    }

    /// Construct an upcall for `cred` and enqueue it, collapsing
    /// onto an already-pending request for the same uid.
    fn setup_upcall(
        self: &Arc<Self>,
        cred: &Arc<GssCredential>
    ) -> Result<Arc<UpcallMessage>, AuthCredError> {
        let vers = match self
            .latch
            .get_version()
            .map_err(|_| AuthCredError::MutexPoison)?
        {
            Some(vers) => vers,
            None => return Err(AuthCredError::Retry)
        };

        let pipe = if vers == 0 {
            &self.pipe_v0
        } else {
            &self.pipe_v1
        };

        let buf = if vers == 0 {
            Ok(encode_v0_msg(cred.uid()))
        } else {
            encode_v1_msg(
                &self.mech,
                cred.uid(),
                self.client.principal(),
                cred.principal()
            )
        };
        let buf = match buf {
            Ok(buf) => buf,
            Err(err) => {
                // The version reference was taken above; hand it
                // back since no message will own it.
                let _ = self.latch.put_version();

                return Err(err);
            }
        };

        let msg = UpcallMessage::new(
            cred.uid(),
            buf,
            pipe.clone(),
            self.latch.clone()
        );
        let cur = pipe
            .add_upcall(msg.clone())
            .map_err(|_| AuthCredError::MutexPoison)?;

        if Arc::ptr_eq(&cur, &msg) {
            if let Err(err) = pipe.queue_upcall(msg.clone()) {
                let _ = pipe.unhash_upcall(&msg);

                return Err(match err {
                    PipeError::Closed => AuthCredError::PipeClosed,
                    PipeError::Busy { .. } => AuthCredError::Retry,
                    PipeError::MutexPoison => {
                        AuthCredError::MutexPoison
                    }
                });
            }

            trace!(target: "gss-auth",
                   "issued upcall for uid {} on \"{}\"",
                   cred.uid(), pipe.name());
        }

        Ok(cur)
    }

    /// Synchronously acquire a context for `cred`, retrying
    /// transient failures until a hard result arrives.
    ///
    /// This is the cold-path entry used when a credential is first
    /// bound; the wait is killable through `interrupt`.
    pub fn create_context(
        self: &Arc<Self>,
        cred: &Arc<GssCredential>,
        interrupt: &Interrupt
    ) -> Result<(), AuthCredError> {
        loop {
            match self.create_upcall(cred, interrupt) {
                Err(AuthCredError::Retry) => continue,
                out => return out
            }
        }
    }

    fn create_upcall(
        self: &Arc<Self>,
        cred: &Arc<GssCredential>,
        interrupt: &Interrupt
    ) -> Result<(), AuthCredError> {
        debug!(target: "gss-auth",
               "synchronous context acquisition for uid {}",
               cred.uid());

        loop {
            // A short probe interval once the daemon is known to be
            // absent keeps repeated failures cheap.
            let timeout = if self
                .latch
                .daemon_running()
                .map_err(|_| AuthCredError::MutexPoison)?
            {
                self.timeouts.upcall_timeout()
            } else {
                self.timeouts.downed_daemon_retry()
            };

            let msg = match self.setup_upcall(cred) {
                Ok(msg) => msg,
                Err(AuthCredError::Retry) => {
                    match self
                        .latch
                        .wait_for_daemon(timeout, interrupt)
                        .map_err(|_| AuthCredError::MutexPoison)?
                    {
                        DaemonWait::Present => continue,
                        DaemonWait::Interrupted => {
                            return Err(AuthCredError::Interrupted)
                        }
                        DaemonWait::TimedOut => {
                            self.latch
                                .set_daemon_down()
                                .map_err(|_| {
                                    AuthCredError::MutexPoison
                                })?;
                            self.latch.warn_daemon_absent();

                            return Err(AuthCredError::Denied);
                        }
                    }
                }
                Err(err) => return Err(err)
            };

            return match msg.wait_sync(interrupt) {
                Ok(ctx) => {
                    cred.set_ctx(&ctx)
                        .map_err(|_| AuthCredError::MutexPoison)?;

                    Ok(())
                }
                Err(err) => Err(err)
            };
        }
    }

    /// Renew or acquire the credential for `task` without blocking.
    ///
    /// [AuthCredError::Retry] means the task has been parked and
    /// will be woken when there is something new to try; any other
    /// error completes the call.
    pub fn refresh(
        self: &Arc<Self>,
        task: &Arc<RpcTask>
    ) -> Result<(), AuthCredError> {
        let mut cred =
            task.cred().map_err(|_| AuthCredError::MutexPoison)?;

        // The null ops table never refreshes; it exists only to
        // carry the final context-destruction call.
        if cred.is_nullops() {
            return Err(AuthCredError::Denied);
        }

        if cred
            .is_negative_entry(
                self.timeouts.expired_cred_retry_delay(),
                Instant::now()
            )
            .map_err(|_| AuthCredError::MutexPoison)?
        {
            return Err(AuthCredError::KeyExpired);
        }

        if !cred.is_new() && !cred.is_uptodate() {
            // The context went stale: rebind the task to a fresh
            // credential rather than mutate the old one in place.
            let acred = AuthCred {
                uid: cred.uid(),
                principal: cred.principal().map(String::from),
                machine_cred: cred.principal().is_some()
            };

            trace!(target: "gss-auth",
                   "rebinding stale credential for uid {}",
                   cred.uid());

            let fresh = self.lookup_cred(&acred)?;

            task.rebind_cred(fresh.clone())
                .map_err(|_| AuthCredError::MutexPoison)?;
            cred = fresh;
        }

        if cred.is_new() {
            self.refresh_upcall(task, &cred)
        } else {
            Ok(())
        }
    }

    fn refresh_upcall(
        self: &Arc<Self>,
        task: &Arc<RpcTask>,
        cred: &Arc<GssCredential>
    ) -> Result<(), AuthCredError> {
        let msg = match self.setup_upcall(cred) {
            Ok(msg) => msg,
            Err(AuthCredError::Retry) => {
                // No daemon yet; park the task on the version latch
                // so its arrival re-drives us.
                self.latch.warn_daemon_absent();
                self.latch
                    .rpc_waitqueue()
                    .sleep_on(task, None)
                    .map_err(|_| AuthCredError::MutexPoison)?;

                return Err(AuthCredError::Retry);
            }
            Err(err) => return Err(err)
        };

        let outcome = cred
            .with_upcall_slot(|slot| -> Result<UpcallPark, MutexPoison> { match &slot.msg {
                // Another task already drives this upcall; pile
                // onto its queue.
                Some(cur) => {
                    if cur.park_task(task, None)? {
                        Ok(UpcallPark::Parked)
                    } else {
                        Ok(UpcallPark::Complete(cur.clone()))
                    }
                }
                None => {
                    let callback = Arc::new(UpcallWake::new(
                        cred.clone(),
                        msg.clone()
                    ));

                    if msg.park_task(task, Some(callback))? {
                        slot.msg = Some(msg.clone());

                        Ok(UpcallPark::Parked)
                    } else {
                        Ok(UpcallPark::Complete(msg.clone()))
                    }
                }
            }})
            .map_err(|_| AuthCredError::MutexPoison)?
            .map_err(|_| AuthCredError::MutexPoison)?;

        match outcome {
            UpcallPark::Parked => Err(AuthCredError::Retry),
            UpcallPark::Complete(msg) => {
                handle_downcall_result(cred, &msg)
                    .map_err(|_| AuthCredError::MutexPoison)?;

                msg.status()
            }
        }
    }

    /// Drive `refresh` to a hard result, waiting for wakes in
    /// between.
    ///
    /// This is the scheduler's re-drive loop, condensed for callers
    /// that own the thread anyway.
    pub fn refresh_sync(
        self: &Arc<Self>,
        task: &Arc<RpcTask>
    ) -> Result<(), AuthCredError> {
        loop {
            match self.refresh(task) {
                Ok(()) => return Ok(()),
                Err(AuthCredError::Retry) => {
                    match task
                        .wait_woken()
                        .map_err(|_| AuthCredError::MutexPoison)?
                    {
                        Ok(()) | Err(AuthCredError::Retry) => {}
                        Err(err) => return Err(err)
                    }
                }
                Err(err) => return Err(err)
            }
        }
    }

    /// Emit the credential block and verifier for `task`'s call.
    ///
    /// The verifier MIC covers the bytes from the XID through the
    /// end of the credential block.  The sequence number is
    /// allocated here, under the context's sequence lock.
    pub fn marshal(
        &self,
        task: &Arc<RpcTask>
    ) -> Result<(), AuthCredError> {
        let cred =
            task.cred().map_err(|_| AuthCredError::MutexPoison)?;
        let ctx = match cred.get_ctx() {
            Some(ctx) => ctx,
            None => return Err(AuthCredError::Retry)
        };
        let seqno = ctx
            .next_seqno()
            .map_err(|_| AuthCredError::MutexPoison)?;

        task.with_req(|req| -> Result<(), AuthCredError> {
            req.set_seqno(seqno);

            let base = req.header_base();
            let buf = req.snd_buf_mut();

            buf.append_u32(RPC_AUTH_GSS).map_err(xdr_to_auth)?;

            let cred_len_pos =
                buf.append_u32(0).map_err(xdr_to_auth)?;

            buf.append_u32(RPC_GSS_VERSION).map_err(xdr_to_auth)?;
            buf.append_u32(ctx.proc() as u32).map_err(xdr_to_auth)?;
            buf.append_u32(seqno).map_err(xdr_to_auth)?;
            buf.append_u32(cred.service() as u32)
                .map_err(xdr_to_auth)?;
            buf.append_opaque(ctx.wire_ctx()).map_err(xdr_to_auth)?;

            let cred_len = buf.head().len() - (cred_len_pos + 4);

            buf.set_u32(cred_len_pos, cred_len as u32)
                .map_err(xdr_to_auth)?;

            // MIC from the XID through the end of the credential.
            let data = buf
                .bytes_at(base, buf.head().len() - base)
                .map_err(xdr_to_auth)?;

            buf.append_u32(RPC_AUTH_GSS).map_err(xdr_to_auth)?;

            let mic = match ctx.mech_ctx().mic(&data) {
                Ok(mic) => mic,
                Err(GssCryptError::ContextExpired) => {
                    // Send anyway; the server's rejection drives
                    // renewal.
                    cred.clear_uptodate();

                    Vec::new()
                }
                Err(err) => {
                    warn!(target: "gss-auth",
                          "verifier MIC failed: {}",
                          err);

                    return Err(AuthCredError::Crypto);
                }
            };

            buf.append_opaque(&mic).map_err(xdr_to_auth)?;

            Ok(())
        })
        .map_err(|_| AuthCredError::MutexPoison)?
    }

    /// Check the verifier on `task`'s reply.
    ///
    /// The server's MIC covers the call's sequence number as a
    /// big-endian integer.
    pub fn validate(
        &self,
        task: &Arc<RpcTask>
    ) -> Result<(), AuthCredError> {
        let cred =
            task.cred().map_err(|_| AuthCredError::MutexPoison)?;
        let ctx = match cred.get_ctx() {
            Some(ctx) => ctx,
            None => return Err(AuthCredError::Retry)
        };

        let out = task
            .with_req(|req| -> Result<(), AuthCredError> {
                let pos = req.rcv_pos();
                let buf = req.rcv_buf();
                let flavor = buf.u32_at(pos).map_err(xdr_to_auth)?;
                let len =
                    buf.u32_at(pos + 4).map_err(xdr_to_auth)? as usize;

                if len > RPC_MAX_AUTH_SIZE {
                    return Err(AuthCredError::Crypto);
                }

                if flavor != RPC_AUTH_GSS {
                    return Err(AuthCredError::Crypto);
                }

                let (mic, consumed) =
                    buf.opaque_at(pos + 4).map_err(xdr_to_auth)?;
                let seq = req.seqno().to_be_bytes();

                match ctx.mech_ctx().verify_mic(&seq, &mic) {
                    Ok(()) => {}
                    Err(GssCryptError::ContextExpired) => {
                        cred.clear_uptodate();

                        return Err(AuthCredError::Crypto);
                    }
                    Err(err) => {
                        warn!(target: "gss-auth",
                              "reply verifier rejected: {}",
                              err);

                        return Err(AuthCredError::Crypto);
                    }
                }

                self.verfsize
                    .store(quadlen(len) + 2, Ordering::Release);
                req.set_rcv_pos(pos + 4 + consumed);

                Ok(())
            })
            .map_err(|_| AuthCredError::MutexPoison)?;

        out
    }

    /// Encode `task`'s call body, applying the configured security
    /// service.
    ///
    /// Control calls (any procedure other than data) always go out
    /// in plaintext.
    pub fn wrap_req(
        &self,
        task: &Arc<RpcTask>,
        encode: &dyn WrapEncode
    ) -> Result<(), AuthCredError> {
        let cred =
            task.cred().map_err(|_| AuthCredError::MutexPoison)?;
        let ctx = match cred.get_ctx() {
            Some(ctx) => ctx,
            None => return Err(AuthCredError::Retry)
        };

        task.with_req(|req| -> Result<(), AuthCredError> {
            if ctx.proc() != GssProc::Data {
                return encode
                    .encode(req.snd_buf_mut())
                    .map_err(xdr_to_auth);
            }

            match cred.service() {
                GssService::None => encode
                    .encode(req.snd_buf_mut())
                    .map_err(xdr_to_auth),
                GssService::Integrity => {
                    Self::wrap_req_integ(&cred, &ctx, req, encode)
                }
                GssService::Privacy => {
                    Self::wrap_req_priv(&cred, &ctx, req, encode)
                }
            }
        })
        .map_err(|_| AuthCredError::MutexPoison)?
    }

    fn wrap_req_integ(
        cred: &Arc<GssCredential>,
        ctx: &Arc<GssContext>,
        req: &mut RpcRequest,
        encode: &dyn WrapEncode
    ) -> Result<(), AuthCredError> {
        let seqno = req.seqno();
        let buf = req.snd_buf_mut();
        let integ_len_pos = buf.append_u32(0).map_err(xdr_to_auth)?;
        let offset = buf.head().len();

        buf.append_u32(seqno).map_err(xdr_to_auth)?;
        encode.encode(buf).map_err(xdr_to_auth)?;

        let integ_len = buf.len() - offset;

        buf.set_u32(integ_len_pos, integ_len as u32)
            .map_err(xdr_to_auth)?;

        let data = buf
            .bytes_at(offset, integ_len)
            .map_err(xdr_to_auth)?;
        let mic = match ctx.mech_ctx().mic(&data) {
            Ok(mic) => mic,
            Err(GssCryptError::ContextExpired) => {
                cred.clear_uptodate();

                Vec::new()
            }
            Err(err) => {
                warn!(target: "gss-auth",
                      "integrity MIC failed: {}",
                      err);

                return Err(AuthCredError::Crypto);
            }
        };

        buf.append_opaque(&mic).map_err(xdr_to_auth)
    }

    fn wrap_req_priv(
        cred: &Arc<GssCredential>,
        ctx: &Arc<GssContext>,
        req: &mut RpcRequest,
        encode: &dyn WrapEncode
    ) -> Result<(), AuthCredError> {
        let seqno = req.seqno();
        let buf = req.snd_buf_mut();
        let opaque_len_pos =
            buf.append_u32(0).map_err(xdr_to_auth)?;
        let offset = buf.head().len();

        buf.append_u32(seqno).map_err(xdr_to_auth)?;
        encode.encode(buf).map_err(xdr_to_auth)?;

        // Encrypt into a page set of our own: fresh copies of the
        // body pages, with the tail moved onto its own page so the
        // in-place wrap has head-room.
        let pages = buf.pages().to_vec();

        buf.swap_pages(pages);
        buf.tail_to_page();

        match ctx.mech_ctx().wrap(offset, buf) {
            Ok(()) => {}
            Err(GssCryptError::ContextExpired) => {
                // The encryption was performed regardless, so the
                // request is safe to put on the wire.
                cred.clear_uptodate();
            }
            Err(err) => {
                warn!(target: "gss-auth",
                      "privacy wrap failed: {}",
                      err);

                return Err(AuthCredError::Crypto);
            }
        }

        let opaque_len = buf.len() - offset;

        buf.set_u32(opaque_len_pos, opaque_len as u32)
            .map_err(xdr_to_auth)?;

        let pad = 3 - ((opaque_len - 1) & 3);

        buf.append_pad(pad).map_err(xdr_to_auth)
    }

    /// Decode `task`'s reply body, reversing the security service
    /// transform.
    pub fn unwrap_resp(
        &self,
        task: &Arc<RpcTask>,
        decode: &mut dyn WrapDecode
    ) -> Result<(), AuthCredError> {
        let cred =
            task.cred().map_err(|_| AuthCredError::MutexPoison)?;
        let ctx = match cred.get_ctx() {
            Some(ctx) => ctx,
            None => return Err(AuthCredError::Retry)
        };

        task.with_req(|req| -> Result<(), AuthCredError> {
            if ctx.proc() != GssProc::Data {
                let pos = req.rcv_pos();

                return decode
                    .decode(req.rcv_buf(), pos)
                    .map_err(xdr_to_auth);
            }

            let saved_pos = req.rcv_pos();
            let saved_head = req.rcv_buf().head().len();

            match cred.service() {
                GssService::None => {}
                GssService::Integrity => {
                    Self::unwrap_resp_integ(&cred, &ctx, req)?
                }
                GssService::Privacy => {
                    Self::unwrap_resp_priv(&cred, &ctx, req)?
                }
            }

            // Account for the bytes the service consumed ahead of
            // the arguments, so the runtime sizes reply buffers
            // correctly.
            let consumed = req.rcv_pos() - saved_pos;
            let shrink = saved_head
                .saturating_sub(req.rcv_buf().head().len());

            self.rslack.store(
                self.verfsize.load(Ordering::Acquire) +
                    quadlen(consumed) +
                    quadlen(shrink),
                Ordering::Release
            );

            let pos = req.rcv_pos();

            decode.decode(req.rcv_buf(), pos).map_err(xdr_to_auth)
        })
        .map_err(|_| AuthCredError::MutexPoison)?
    }

    fn unwrap_resp_integ(
        cred: &Arc<GssCredential>,
        ctx: &Arc<GssContext>,
        req: &mut RpcRequest
    ) -> Result<(), AuthCredError> {
        let pos = req.rcv_pos();
        let seqno = req.seqno();
        let buf = req.rcv_buf();
        let integ_len =
            buf.u32_at(pos).map_err(xdr_to_auth)? as usize;

        if integ_len & 3 != 0 {
            return Err(AuthCredError::Crypto);
        }

        let data_offset = pos + 4;
        let mic_offset = data_offset + integ_len;

        if mic_offset > buf.len() {
            return Err(AuthCredError::Crypto);
        }

        if buf.u32_at(data_offset).map_err(xdr_to_auth)? != seqno {
            return Err(AuthCredError::Crypto);
        }

        let data = buf
            .bytes_at(data_offset, integ_len)
            .map_err(xdr_to_auth)?;
        let (mic, _) =
            buf.opaque_at(mic_offset).map_err(xdr_to_auth)?;

        match ctx.mech_ctx().verify_mic(&data, &mic) {
            Ok(()) => {}
            Err(GssCryptError::ContextExpired) => {
                cred.clear_uptodate();

                return Err(AuthCredError::Crypto);
            }
            Err(err) => {
                warn!(target: "gss-auth",
                      "integrity check failed: {}",
                      err);

                return Err(AuthCredError::Crypto);
            }
        }

        // Arguments continue right after the sequence number.
        req.set_rcv_pos(data_offset + 4);

        Ok(())
    }

    fn unwrap_resp_priv(
        cred: &Arc<GssCredential>,
        ctx: &Arc<GssContext>,
        req: &mut RpcRequest
    ) -> Result<(), AuthCredError> {
        let pos = req.rcv_pos();
        let seqno = req.seqno();
        let buf = req.rcv_buf_mut();
        let opaque_len =
            buf.u32_at(pos).map_err(xdr_to_auth)? as usize;
        let offset = pos + 4;

        if offset + opaque_len > buf.len() {
            return Err(AuthCredError::Crypto);
        }

        // Strip the padding before unwrapping in place.
        buf.truncate(offset + opaque_len);

        match ctx.mech_ctx().unwrap(offset, buf) {
            Ok(()) => {}
            Err(GssCryptError::ContextExpired) => {
                cred.clear_uptodate();

                return Err(AuthCredError::Crypto);
            }
            Err(err) => {
                warn!(target: "gss-auth",
                      "privacy unwrap failed: {}",
                      err);

                return Err(AuthCredError::Crypto);
            }
        }

        if buf.u32_at(offset).map_err(xdr_to_auth)? != seqno {
            return Err(AuthCredError::Crypto);
        }

        req.set_rcv_pos(offset + 4);

        Ok(())
    }

    /// Destroy a credential.
    ///
    /// If an up-to-date context is installed, its procedure is
    /// rewritten to the destroy code, the credential is switched to
    /// the null ops table, and a best-effort NULL call tells the
    /// server to drop its state.  The context pointer is cleared
    /// afterward either way.
    pub fn destroy_cred(
        &self,
        cred: &Arc<GssCredential>
    ) {
        match cred.get_ctx() {
            Some(ctx) if cred.is_uptodate() => {
                debug!(target: "gss-auth",
                       "destroying context for uid {}",
                       cred.uid());

                ctx.set_destroy();
                cred.set_nullops();
                self.client.call_null(cred);
            }
            _ => {}
        }

        cred.clear_ctx();
    }

    /// Tear the authenticator down: destroy every cached
    /// credential, then the pipes.
    pub fn destroy(&self) {
        debug!(target: "gss-auth",
               "destroying authenticator for flavor {}",
               self.flavor);

        match self.credcache.clear() {
            Ok(creds) => {
                for cred in creds {
                    self.destroy_cred(&cred);
                }
            }
            Err(_) => {
                warn!(target: "gss-auth",
                      "credential cache poisoned during teardown");
            }
        }

        if self.pipe_v0.destroy().is_err() ||
            self.pipe_v1.destroy().is_err()
        {
            warn!(target: "gss-auth",
                  "pipe lock poisoned during teardown");
        }
    }
}

impl DowncallSink for GssAuthenticator {
    fn downcall(
        &self,
        pipe: &Arc<GssPipe>,
        buf: &[u8]
    ) -> Result<usize, DowncallError> {
        pipe_downcall(&self.mech, pipe, buf)
    }
}

impl ScopedError for AuthCreateError {
    fn scope(&self) -> ErrorScope {
        match self {
            AuthCreateError::UnknownFlavor { .. } => {
                ErrorScope::Unrecoverable
            }
            AuthCreateError::MutexPoison => ErrorScope::Unrecoverable
        }
    }
}

impl Display for AuthCreateError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        match self {
            AuthCreateError::UnknownFlavor { flavor } => {
                write!(f, "no mechanism for pseudo-flavor {}", flavor)
            }
            AuthCreateError::MutexPoison => write!(f, "mutex poisoned")
        }
    }
}

#[cfg(test)]
use std::sync::Barrier;
#[cfg(test)]
use std::sync::Mutex;
#[cfg(test)]
use std::thread::sleep;
#[cfg(test)]
use std::thread::spawn;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::cred::test_context;
#[cfg(test)]
use crate::mech::loopback::LoopbackMechanism;
#[cfg(test)]
use crate::mech::loopback::LOOPBACK_FLAVOR_INTEGRITY;
#[cfg(test)]
use crate::mech::loopback::LOOPBACK_FLAVOR_PRIVACY;
#[cfg(test)]
use crate::pipe::DaemonHandle;

#[cfg(test)]
struct TestClient {
    principal: Option<String>,
    destroys: Mutex<Vec<u32>>
}

#[cfg(test)]
impl TestClient {
    fn new() -> Arc<Self> {
        Arc::new(TestClient {
            principal: None,
            destroys: Mutex::new(Vec::new())
        })
    }

    fn destroyed(&self) -> Vec<u32> {
        self.destroys.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl RpcClient for TestClient {
    fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    fn call_null(
        &self,
        cred: &Arc<GssCredential>
    ) {
        self.destroys.lock().unwrap().push(cred.uid());
    }
}

#[cfg(test)]
fn test_auth(
    flavor: u32,
    timeouts: CredTimeouts
) -> (Arc<GssAuthenticator>, Arc<TestClient>) {
    let registry = MechRegistry::new();

    registry
        .register(Arc::new(LoopbackMechanism::new()))
        .unwrap();

    let client = TestClient::new();
    let auth = GssAuthenticator::new(
        client.clone(),
        &registry,
        flavor,
        VersionLatch::new(),
        timeouts
    )
    .expect("expected success");

    (auth, client)
}

#[cfg(test)]
fn downcall_ok(
    uid: u32,
    timeout: u32,
    window: u32,
    wire: &[u8],
    blob: &[u8]
) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(&uid.to_ne_bytes());
    out.extend_from_slice(&timeout.to_ne_bytes());
    out.extend_from_slice(&window.to_ne_bytes());
    out.extend_from_slice(&(wire.len() as u32).to_ne_bytes());
    out.extend_from_slice(wire);
    out.extend_from_slice(&(blob.len() as u32).to_ne_bytes());
    out.extend_from_slice(blob);

    out
}

#[cfg(test)]
fn downcall_err(
    uid: u32,
    errno: i32
) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(&uid.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out.extend_from_slice(&(errno as u32).to_ne_bytes());

    out
}

#[cfg(test)]
fn recv_upcall(
    handle: &DaemonHandle,
    timeout: Duration
) -> Option<Vec<u8>> {
    let deadline = Instant::now() + timeout;

    loop {
        match handle.recv().unwrap() {
            Some(bytes) => return Some(bytes),
            None => {}
        }

        if Instant::now() >= deadline {
            return None;
        }

        sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
struct BodyEncoder {
    value: u32
}

#[cfg(test)]
impl WrapEncode for BodyEncoder {
    fn encode(
        &self,
        buf: &mut XdrBuf
    ) -> Result<(), XdrError> {
        buf.append_u32(self.value)?;

        Ok(())
    }
}

#[cfg(test)]
struct BodyDecoder {
    value: Option<u32>
}

#[cfg(test)]
impl WrapDecode for BodyDecoder {
    fn decode(
        &mut self,
        buf: &XdrBuf,
        pos: usize
    ) -> Result<(), XdrError> {
        self.value = Some(buf.u32_at(pos)?);

        Ok(())
    }
}

#[test]
fn test_cold_start_and_first_marshal() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(5, 1, 100)
    );
    let handle = auth.pipe_v1().open().expect("expected success");
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();

    assert!(cred.is_new());

    let creator_auth = auth.clone();
    let creator_cred = cred.clone();
    let creator = spawn(move || {
        creator_auth.create_context(&creator_cred, &Interrupt::new())
    });

    let request =
        recv_upcall(&handle, Duration::from_secs(5)).expect("expected upcall");

    assert_eq!(request, b"mech=loopback uid=1000 \n".to_vec());

    let reply = downcall_ok(1000, 3600, 128, b"AA", &[0x42]);

    assert_eq!(handle.downcall(&reply).unwrap(), reply.len());
    creator.join().unwrap().expect("expected success");

    assert!(cred.is_uptodate());
    assert!(!cred.is_new());

    let ctx = cred.get_ctx().expect("expected a context");

    assert_eq!(ctx.window(), 128);
    assert_eq!(ctx.wire_ctx(), b"AA");

    // First call under the fresh context: seqno 1, and the wire
    // context appears verbatim as a netobj in the credential block.
    let task = RpcTask::new(cred, 4096);

    auth.marshal(&task).expect("expected success");

    task.with_req(|req| {
        assert_eq!(req.seqno(), 1);

        let buf = req.snd_buf();

        assert_eq!(buf.u32_at(0).unwrap(), RPC_AUTH_GSS);
        assert_eq!(buf.u32_at(4).unwrap(), 24);
        assert_eq!(buf.u32_at(8).unwrap(), RPC_GSS_VERSION);
        assert_eq!(buf.u32_at(12).unwrap(), GssProc::Data as u32);
        assert_eq!(buf.u32_at(16).unwrap(), 1);
        assert_eq!(buf.u32_at(20).unwrap(), GssService::Integrity as u32);
        assert_eq!(
            buf.bytes_at(24, 8).unwrap(),
            vec![0x00, 0x00, 0x00, 0x02, b'A', b'A', 0x00, 0x00]
        );
        assert_eq!(buf.u32_at(32).unwrap(), RPC_AUTH_GSS);
    })
    .unwrap();
}

#[test]
fn test_marshal_seqnos_strictly_increasing() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::default()
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();

    cred.set_ctx(&test_context(0x42)).unwrap();

    for expected in 1..=8u32 {
        let task = RpcTask::new(cred.clone(), 4096);

        auth.marshal(&task).expect("expected success");

        let seqno = task.with_req(|req| req.seqno()).unwrap();

        assert_eq!(seqno, expected);
    }
}

#[test]
fn test_integrity_round_trip() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::default()
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let ctx = test_context(0x42);

    cred.set_ctx(&ctx).unwrap();

    let task = RpcTask::new(cred, 4096);

    auth.marshal(&task).expect("expected success");
    auth.wrap_req(&task, &BodyEncoder { value: 0xdeadbeef })
        .expect("expected success");

    let seqno = task.with_req(|req| req.seqno()).unwrap();

    assert_eq!(seqno, 1);

    // Construct the server's reply: a verifier MIC over the seqno,
    // then the integrity-wrapped result body.
    let verf_mic = ctx.mech_ctx().mic(&seqno.to_be_bytes()).unwrap();
    let mut body = XdrBuf::new(256);

    body.append_u32(seqno).unwrap();
    body.append_u32(0xdeadbeef).unwrap();

    let body_mic = ctx
        .mech_ctx()
        .mic(&body.bytes_at(0, body.len()).unwrap())
        .unwrap();

    task.with_req(|req| {
        let buf = req.rcv_buf_mut();

        buf.append_u32(RPC_AUTH_GSS).unwrap();
        buf.append_opaque(&verf_mic).unwrap();
        buf.append_u32(8).unwrap();
        buf.append_u32(seqno).unwrap();
        buf.append_u32(0xdeadbeef).unwrap();
        buf.append_opaque(&body_mic).unwrap();
        req.set_rcv_pos(0);
    })
    .unwrap();

    auth.validate(&task).expect("expected success");

    let mut decoder = BodyDecoder { value: None };

    auth.unwrap_resp(&task, &mut decoder).expect("expected success");

    assert_eq!(decoder.value, Some(0xdeadbeef));
    assert!(auth.rslack() > 0);
}

#[test]
fn test_privacy_round_trip() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_PRIVACY,
        CredTimeouts::default()
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let ctx = test_context(0x21);

    cred.set_ctx(&ctx).unwrap();

    let task = RpcTask::new(cred, 4096);

    auth.marshal(&task).expect("expected success");
    auth.wrap_req(&task, &BodyEncoder { value: 0xdeadbeef })
        .expect("expected success");

    let seqno = task.with_req(|req| req.seqno()).unwrap();

    // The argument bytes must not appear in the clear after the
    // opaque length word.
    task.with_req(|req| {
        let buf = req.snd_buf();
        let total = buf.len();
        let all = buf.bytes_at(0, total).unwrap();

        assert!(!all
            .windows(4)
            .any(|w| w == [0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(total & 3, 0);
    })
    .unwrap();

    // Server side of the reply: wrap the seqno and result in place.
    let mut body = XdrBuf::new(256);

    body.append_u32(seqno).unwrap();
    body.append_u32(0xdeadbeef).unwrap();
    ctx.mech_ctx().wrap(0, &mut body).unwrap();

    let wrapped = body.bytes_at(0, body.len()).unwrap();

    task.with_req(|req| {
        let buf = req.rcv_buf_mut();

        buf.append_u32(wrapped.len() as u32).unwrap();
        buf.append_head(&wrapped).unwrap();
        buf.append_pad((4 - (wrapped.len() & 3)) & 3).unwrap();
        req.set_rcv_pos(0);
    })
    .unwrap();

    let mut decoder = BodyDecoder { value: None };

    auth.unwrap_resp(&task, &mut decoder).expect("expected success");

    assert_eq!(decoder.value, Some(0xdeadbeef));

    let reply_seqno = task
        .with_req(|req| req.rcv_buf().u32_at(4).unwrap())
        .unwrap();

    assert_eq!(reply_seqno, seqno);
}

#[test]
fn test_concurrent_refresh_single_upcall() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(5, 1, 100)
    );
    let handle = auth.pipe_v1().open().expect("expected success");
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let barrier = Arc::new(Barrier::new(65));
    let mut tasks = Vec::new();

    for _ in 0..64 {
        let thread_auth = auth.clone();
        let thread_cred = cred.clone();
        let thread_barrier = barrier.clone();

        tasks.push(spawn(move || {
            let task = RpcTask::new(thread_cred, 4096);

            thread_barrier.wait();
            thread_auth.refresh_sync(&task).expect("expected success");

            let cred = task.cred().unwrap();

            cred.get_ctx().expect("expected a context")
        }));
    }

    barrier.wait();

    let request =
        recv_upcall(&handle, Duration::from_secs(5)).expect("expected upcall");

    assert!(request.starts_with(b"mech=loopback uid=1000 "));

    // Let the remaining tasks pile onto the pending message before
    // answering, then check the pipe saw exactly one write.
    sleep(Duration::from_millis(100));

    assert!(handle.recv().unwrap().is_none());

    let reply = downcall_ok(1000, 3600, 128, b"AA", &[0x42]);

    assert_eq!(handle.downcall(&reply).unwrap(), reply.len());

    let mut ctxs = Vec::new();

    for task in tasks {
        ctxs.push(task.join().unwrap());
    }

    for ctx in ctxs.iter() {
        assert!(Arc::ptr_eq(ctx, &ctxs[0]));
    }

    assert!(handle.recv().unwrap().is_none());
}

#[test]
fn test_daemon_down_times_out() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(5, 1, 100)
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let interrupt = Interrupt::new();

    let start = Instant::now();
    let err = auth.create_context(&cred, &interrupt).unwrap_err();

    assert_eq!(err, AuthCredError::Denied);
    assert!(start.elapsed() >= Duration::from_secs(1));

    // The daemon is now known to be down; the next attempt fails on
    // the short probe interval.
    let start = Instant::now();
    let err = auth.create_context(&cred, &interrupt).unwrap_err();

    assert_eq!(err, AuthCredError::Denied);
    assert!(start.elapsed() < Duration::from_millis(600));
}

#[test]
fn test_expired_key_cooling_off() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(1, 1, 100)
    );
    let handle = auth.pipe_v1().open().expect("expected success");
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();

    let refresh_auth = auth.clone();
    let refresh_cred = cred.clone();
    let refresher = spawn(move || {
        let task = RpcTask::new(refresh_cred, 4096);

        refresh_auth.refresh_sync(&task)
    });

    recv_upcall(&handle, Duration::from_secs(5)).expect("expected upcall");

    let reply = downcall_err(1000, -127);

    assert_eq!(handle.downcall(&reply).unwrap(), reply.len());
    assert_eq!(
        refresher.join().unwrap(),
        Err(AuthCredError::KeyExpired)
    );
    assert!(cred.is_negative());

    // Inside the cooling-off window: fail immediately, without
    // contacting the daemon.
    let task = RpcTask::new(cred.clone(), 4096);

    assert_eq!(auth.refresh(&task), Err(AuthCredError::KeyExpired));
    assert!(handle.recv().unwrap().is_none());

    // After the window, a new upcall goes out.
    sleep(Duration::from_millis(1100));

    let task = RpcTask::new(cred, 4096);

    assert_eq!(auth.refresh(&task), Err(AuthCredError::Retry));
    assert!(recv_upcall(&handle, Duration::from_secs(1)).is_some());
}

#[test]
fn test_version_conflict() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::default()
    );

    let handle_v0 = auth.pipe_v0().open().expect("expected success");

    match auth.pipe_v1().open() {
        Err(PipeError::Busy { latched }) => assert_eq!(latched, 0),
        _ => panic!("expected busy")
    }

    drop(handle_v0);

    let _handle_v1 = auth.pipe_v1().open().expect("expected success");
}

#[test]
fn test_daemon_detach_fails_pending() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(5, 1, 100)
    );
    let handle = auth.pipe_v1().open().expect("expected success");
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let task = RpcTask::new(cred, 4096);

    assert_eq!(auth.refresh(&task), Err(AuthCredError::Retry));
    assert!(recv_upcall(&handle, Duration::from_secs(1)).is_some());

    drop(handle);

    assert_eq!(
        task.wait_woken().unwrap(),
        Err(AuthCredError::PipeClosed)
    );

    // The latch is clear again; a v0 daemon can now attach.
    let _handle_v0 = auth.pipe_v0().open().expect("expected success");
}

#[test]
fn test_bad_downcall_retries() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(5, 1, 100)
    );
    let handle = auth.pipe_v1().open().expect("expected success");
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();

    let refresh_auth = auth.clone();
    let refresh_cred = cred.clone();
    let refresher = spawn(move || {
        let task = RpcTask::new(refresh_cred, 4096);

        refresh_auth.refresh_sync(&task)
    });

    recv_upcall(&handle, Duration::from_secs(5)).expect("expected upcall");

    // A downcall whose security blob length overruns the message
    // completes the upcall with a retry and fails the write.
    let mut bad = Vec::new();

    bad.extend_from_slice(&1000u32.to_ne_bytes());
    bad.extend_from_slice(&3600u32.to_ne_bytes());
    bad.extend_from_slice(&128u32.to_ne_bytes());
    bad.extend_from_slice(&2u32.to_ne_bytes());
    bad.extend_from_slice(b"AA");
    bad.extend_from_slice(&64u32.to_ne_bytes());
    bad.extend_from_slice(&[0x42]);

    assert_eq!(handle.downcall(&bad), Err(DowncallError::Fault));

    // The task retries with a fresh upcall; answer it properly.
    let second =
        recv_upcall(&handle, Duration::from_secs(5)).expect("expected retry");

    assert!(second.starts_with(b"mech=loopback uid=1000 "));

    let reply = downcall_ok(1000, 3600, 128, b"AA", &[0x42]);

    assert_eq!(handle.downcall(&reply).unwrap(), reply.len());
    refresher.join().unwrap().expect("expected success");
}

#[test]
fn test_rejected_import_maps_to_retry() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(5, 1, 100)
    );
    let handle = auth.pipe_v1().open().expect("expected success");
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let task = RpcTask::new(cred, 4096);

    assert_eq!(auth.refresh(&task), Err(AuthCredError::Retry));
    recv_upcall(&handle, Duration::from_secs(1)).expect("expected upcall");

    // Blob the provider refuses to import: the daemon's write fails
    // and the waiter observes a retry, not a poisoned credential.
    let reply = downcall_ok(1000, 3600, 128, b"AA", &[0xff, 0x00]);

    assert_eq!(
        handle.downcall(&reply),
        Err(DowncallError::Unsupported)
    );
    assert_eq!(
        task.wait_woken().unwrap(),
        Err(AuthCredError::Retry)
    );

    let cred = task.cred().unwrap();

    assert!(cred.is_new());
    assert!(!cred.is_negative());
}

#[test]
fn test_validate_rejects_oversize_verifier() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::default()
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();

    cred.set_ctx(&test_context(0x42)).unwrap();

    let task = RpcTask::new(cred.clone(), 4096);

    auth.marshal(&task).expect("expected success");

    task.with_req(|req| {
        let buf = req.rcv_buf_mut();

        buf.append_u32(RPC_AUTH_GSS).unwrap();
        buf.append_u32((RPC_MAX_AUTH_SIZE + 1) as u32).unwrap();
        req.set_rcv_pos(0);
    })
    .unwrap();

    assert_eq!(auth.validate(&task), Err(AuthCredError::Crypto));

    // No credential state was harmed.
    assert!(cred.is_uptodate());
}

#[test]
fn test_control_proc_goes_plaintext() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::default()
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let ctx = test_context(0x42);

    cred.set_ctx(&ctx).unwrap();
    ctx.set_destroy();

    let task = RpcTask::new(cred, 4096);

    task.with_req(|req| req.set_seqno(1)).unwrap();
    auth.wrap_req(&task, &BodyEncoder { value: 0xdeadbeef })
        .expect("expected success");

    // Context destruction requests are not wrapped.
    task.with_req(|req| {
        let buf = req.snd_buf();

        assert_eq!(buf.len(), 4);
        assert_eq!(buf.u32_at(0).unwrap(), 0xdeadbeef);
    })
    .unwrap();
}

#[test]
fn test_destroy_cred_sends_destroy() {
    init();

    let (auth, client) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::default()
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let ctx = test_context(0x42);

    cred.set_ctx(&ctx).unwrap();
    auth.destroy_cred(&cred);

    assert_eq!(client.destroyed(), vec![1000]);
    assert_eq!(ctx.proc(), GssProc::Destroy);
    assert!(cred.get_ctx().is_none());
    assert!(cred.is_nullops());

    // The null ops table never refreshes.
    let task = RpcTask::new(cred, 4096);

    assert_eq!(auth.refresh(&task), Err(AuthCredError::Denied));
}

#[test]
fn test_stale_cred_rebinds_task() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(5, 1, 100)
    );
    let handle = auth.pipe_v1().open().expect("expected success");
    let old = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let old_ctx = test_context(0x42);

    old.set_ctx(&old_ctx).unwrap();
    old.clear_uptodate();

    let task = RpcTask::new(old.clone(), 4096);

    assert_eq!(auth.refresh(&task), Err(AuthCredError::Retry));

    // The task now drives a fresh credential; the stale one was
    // never mutated in place.
    let fresh = task.cred().unwrap();

    assert!(!Arc::ptr_eq(&fresh, &old));
    assert!(fresh.is_new());
    assert!(Arc::ptr_eq(
        &old.get_ctx().expect("expected a context"),
        &old_ctx
    ));

    recv_upcall(&handle, Duration::from_secs(1)).expect("expected upcall");

    let reply = downcall_ok(1000, 3600, 64, b"BB", &[0x17]);

    assert_eq!(handle.downcall(&reply).unwrap(), reply.len());
    assert_eq!(task.wait_woken().unwrap(), Ok(()));
    assert!(fresh.is_uptodate());
}

#[test]
fn test_create_context_killable() {
    init();

    let (auth, _) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::new(5, 2, 100)
    );
    let handle = auth.pipe_v1().open().expect("expected success");
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();
    let interrupt = Interrupt::new();

    let creator_auth = auth.clone();
    let creator_cred = cred.clone();
    let creator_interrupt = interrupt.clone();
    let creator = spawn(move || {
        creator_auth.create_context(&creator_cred, &creator_interrupt)
    });

    recv_upcall(&handle, Duration::from_secs(5)).expect("expected upcall");
    interrupt.raise();

    assert_eq!(
        creator.join().unwrap(),
        Err(AuthCredError::Interrupted)
    );

    // The upcall is still live; the daemon's late reply is absorbed
    // without anyone waiting on it.
    let reply = downcall_ok(1000, 3600, 128, b"AA", &[0x42]);

    assert_eq!(handle.downcall(&reply).unwrap(), reply.len());
}

#[test]
fn test_authenticator_teardown() {
    init();

    let (auth, client) = test_auth(
        LOOPBACK_FLAVOR_INTEGRITY,
        CredTimeouts::default()
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();

    cred.set_ctx(&test_context(0x42)).unwrap();
    drop(cred);
    auth.destroy();

    assert_eq!(client.destroyed(), vec![1000]);
    assert!(auth.credcache().is_empty().unwrap());
}

#[test]
fn test_unknown_pseudoflavor() {
    init();

    let registry = MechRegistry::new();
    let client = TestClient::new();

    match GssAuthenticator::new(
        client,
        &registry,
        999,
        VersionLatch::new(),
        CredTimeouts::default()
    ) {
        Err(AuthCreateError::UnknownFlavor { flavor }) => {
            assert_eq!(flavor, 999)
        }
        _ => panic!("expected failure")
    }
}

#[test]
fn test_none_service_round_trip() {
    init();

    let (auth, _) = test_auth(
        crate::mech::loopback::LOOPBACK_FLAVOR_NONE,
        CredTimeouts::default()
    );
    let cred = auth.lookup_cred(&AuthCred::user(1000)).unwrap();

    cred.set_ctx(&test_context(0x42)).unwrap();

    let task = RpcTask::new(cred, 4096);

    auth.marshal(&task).expect("expected success");

    let before = task.with_req(|req| req.snd_buf().len()).unwrap();

    auth.wrap_req(&task, &BodyEncoder { value: 0xdeadbeef })
        .expect("expected success");

    // No wrapping: the body goes out as-is.
    task.with_req(|req| {
        let buf = req.snd_buf();

        assert_eq!(buf.len(), before + 4);
        assert_eq!(buf.u32_at(before).unwrap(), 0xdeadbeef);
    })
    .unwrap();

    task.with_req(|req| {
        req.rcv_buf_mut().append_u32(0xdeadbeef).unwrap();
        req.set_rcv_pos(0);
    })
    .unwrap();

    let mut decoder = BodyDecoder { value: None };

    auth.unwrap_resp(&task, &mut decoder).expect("expected success");

    assert_eq!(decoder.value, Some(0xdeadbeef));
}
