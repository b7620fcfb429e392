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

//! Credentials and security contexts.
//!
//! A [GssCredential] binds a user (and optionally a principal) to a
//! shared [GssContext].  The context pointer is read on every
//! outbound call, so reads are lock-free: the pointer is published
//! with release ordering through an epoch-protected cell, and the
//! displaced cell is reclaimed only after a grace period.  A reader
//! therefore sees either the old pointer, whose context is kept
//! alive by the `Arc` it clones under the epoch guard, or the new
//! pointer fully initialised.
//!
//! Credentials move through a small flag lifecycle: born `NEW` with
//! no context, `UPTODATE` once an upcall installs one, and possibly
//! `NEGATIVE` for a cooling-off window after the daemon reports an
//! expired key.  A context is immutable once published, except for
//! its sequence counter and its procedure code, which teardown
//! rewrites to the destroy procedure as the final act of the
//! credential's life.
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use std::time::Duration;
use std::time::Instant;

use crossbeam_epoch::Atomic;
use crossbeam_epoch::Owned;
use crossbeam_epoch::Shared;
use crossbeam_epoch::pin;
use crossbeam_epoch::unprotected;
use log::trace;

use crate::auth::GssAuthenticator;
use crate::error::MutexPoison;
use crate::mech::GssSecContext;
use crate::mech::GssService;
use crate::upcall::UpcallMessage;

pub mod cache;

/// RPCSEC_GSS control procedures, as encoded on the wire.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum GssProc {
    /// An ordinary data call.
    Data = 0,
    /// Context initiation.
    Init = 1,
    /// Continued context initiation.
    ContinueInit = 2,
    /// Context destruction.
    Destroy = 3
}

const CRED_NEW: u32 = 1 << 0;
const CRED_UPTODATE: u32 = 1 << 1;
const CRED_NEGATIVE: u32 = 1 << 2;
/// Set once teardown has switched the credential to the null ops
/// table; refresh always fails from then on.
const CRED_NULLOPS: u32 = 1 << 3;

/// A GSS security context shared across calls.
pub struct GssContext {
    /// The provider's live context.
    mech_ctx: Box<dyn GssSecContext>,
    /// The opaque handle the server expects verbatim in every
    /// credential block.
    wire_ctx: Vec<u8>,
    /// When the context stops being usable.
    expiry: Instant,
    /// Sequence window advertised by the daemon.  Informational.
    window: u32,
    /// Control procedure stamped on calls under this context.
    proc: AtomicU32,
    /// Next sequence number.  Starts at 1; some servers reject 0.
    seq: Mutex<u32>
}

/// In-flight upcall state of a credential.
pub(crate) struct UpcallSlot {
    /// The refresh upcall currently owned by this credential, if
    /// any.
    pub(crate) msg: Option<Arc<UpcallMessage>>,
    /// When the last upcall for this credential finished.
    pub(crate) timestamp: Option<Instant>
}

/// A cached per-user credential.
pub struct GssCredential {
    /// User this credential authenticates.
    uid: u32,
    /// Principal, for machine credentials.
    principal: Option<String>,
    /// Security service applied to call bodies.
    service: GssService,
    /// The owning authenticator.  Non-owning; the credential cache
    /// holds credentials and the authenticator holds the cache.
    auth: Weak<GssAuthenticator>,
    /// Lifecycle flags.
    flags: AtomicU32,
    /// The current context.  Readers never block; see the module
    /// documentation.
    ctx: Atomic<Arc<GssContext>>,
    /// In-flight upcall state.
    upcall: Mutex<UpcallSlot>
}

impl GssContext {
    /// Create a context around an imported provider context.
    ///
    /// The procedure starts at [GssProc::Data] and the sequence
    /// counter at 1.
    pub fn new(
        mech_ctx: Box<dyn GssSecContext>,
        wire_ctx: Vec<u8>,
        expiry: Instant,
        window: u32
    ) -> Self {
        GssContext {
            mech_ctx: mech_ctx,
            wire_ctx: wire_ctx,
            expiry: expiry,
            window: window,
            proc: AtomicU32::new(GssProc::Data as u32),
            seq: Mutex::new(1)
        }
    }

    /// Get the provider context.
    #[inline]
    pub fn mech_ctx(&self) -> &dyn GssSecContext {
        self.mech_ctx.as_ref()
    }

    /// Get the opaque wire handle.
    #[inline]
    pub fn wire_ctx(&self) -> &[u8] {
        &self.wire_ctx
    }

    /// Get the expiry time.
    #[inline]
    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// Get the sequence window.
    #[inline]
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Get the control procedure stamped on calls.
    pub fn proc(&self) -> GssProc {
        match self.proc.load(Ordering::Acquire) {
            p if p == GssProc::Destroy as u32 => GssProc::Destroy,
            p if p == GssProc::Init as u32 => GssProc::Init,
            p if p == GssProc::ContinueInit as u32 => {
                GssProc::ContinueInit
            }
            _ => GssProc::Data
        }
    }

    /// Rewrite the procedure to [GssProc::Destroy].
    ///
    /// Only teardown calls this, once no other holder of the
    /// credential remains.
    pub(crate) fn set_destroy(&self) {
        self.proc
            .store(GssProc::Destroy as u32, Ordering::Release);
    }

    /// Allocate the next sequence number.
    ///
    /// Numbers from one context are strictly monotonic, never
    /// reused, and start at 1.
    pub fn next_seqno(&self) -> Result<u32, MutexPoison> {
        match self.seq.lock() {
            Ok(mut guard) => {
                let seqno = *guard;

                *guard += 1;

                Ok(seqno)
            }
            Err(_) => Err(MutexPoison)
        }
    }
}

impl GssCredential {
    /// Create a credential with `NEW` set and no context.
    ///
    /// The principal is retained only for machine credentials, and
    /// the service comes from the owning authenticator.
    pub fn new(
        uid: u32,
        principal: Option<String>,
        service: GssService,
        auth: Weak<GssAuthenticator>
    ) -> Arc<Self> {
        Arc::new(GssCredential {
            uid: uid,
            principal: principal,
            service: service,
            auth: auth,
            flags: AtomicU32::new(CRED_NEW),
            ctx: Atomic::null(),
            upcall: Mutex::new(UpcallSlot {
                msg: None,
                timestamp: None
            })
        })
    }

    /// Get the uid this credential authenticates.
    #[inline]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Get the principal, if this is a machine credential.
    #[inline]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Get the security service applied to call bodies.
    #[inline]
    pub fn service(&self) -> GssService {
        self.service
    }

    /// Get the owning authenticator, if it is still alive.
    #[inline]
    pub fn auth(&self) -> Option<Arc<GssAuthenticator>> {
        self.auth.upgrade()
    }

    #[inline]
    fn test_flag(
        &self,
        flag: u32
    ) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Check whether the credential is newborn and context-less.
    #[inline]
    pub fn is_new(&self) -> bool {
        self.test_flag(CRED_NEW)
    }

    /// Check whether an unexpired context is installed.
    #[inline]
    pub fn is_uptodate(&self) -> bool {
        self.test_flag(CRED_UPTODATE)
    }

    /// Check whether the daemon reported an expired key for this
    /// credential.
    #[inline]
    pub fn is_negative(&self) -> bool {
        self.test_flag(CRED_NEGATIVE)
    }

    /// Clear the up-to-date flag.
    ///
    /// Called when a provider operation reports context expiry; the
    /// next refresh rebinds.
    #[inline]
    pub fn clear_uptodate(&self) {
        self.flags.fetch_and(!CRED_UPTODATE, Ordering::Release);
    }

    /// Mark the credential negative.
    #[inline]
    pub(crate) fn set_negative(&self) {
        self.flags.fetch_or(CRED_NEGATIVE, Ordering::Release);
    }

    /// Clear the negative mark.
    #[inline]
    pub(crate) fn clear_negative(&self) {
        self.flags.fetch_and(!CRED_NEGATIVE, Ordering::Release);
    }

    /// Switch the credential to the null ops table.
    #[inline]
    pub(crate) fn set_nullops(&self) {
        self.flags.fetch_or(CRED_NULLOPS, Ordering::Release);
    }

    /// Check whether the credential is on the null ops table.
    #[inline]
    pub fn is_nullops(&self) -> bool {
        self.test_flag(CRED_NULLOPS)
    }

    /// Publish `ctx` as this credential's context.
    ///
    /// This is a no-op unless `NEW` is set.  The pointer is stored
    /// with release ordering before `UPTODATE` is set, and `NEW` is
    /// cleared only after a further release barrier, so any reader
    /// that observes the flags also observes a fully initialised
    /// context.
    pub fn set_ctx(
        &self,
        ctx: &Arc<GssContext>
    ) -> Result<(), MutexPoison> {
        if !self.is_new() {
            return Ok(());
        }

        trace!(target: "gss-cred",
               "installing context for uid {}",
               self.uid);

        {
            let guard = pin();
            let old = self.ctx.swap(
                Owned::new(ctx.clone()),
                Ordering::Release,
                &guard
            );

            if !old.is_null() {
                // Readers may still hold the displaced cell; it is
                // reclaimed after the current epoch's grace period.
                unsafe {
                    guard.defer_destroy(old);
                }
            }
        }

        self.flags.fetch_or(CRED_UPTODATE, Ordering::Release);
        fence(Ordering::SeqCst);
        self.flags.fetch_and(!CRED_NEW, Ordering::Release);

        Ok(())
    }

    /// Read the current context without blocking.
    ///
    /// The returned `Arc` keeps the context alive for as long as the
    /// caller holds it, independent of any later swap.
    pub fn get_ctx(&self) -> Option<Arc<GssContext>> {
        let guard = pin();
        let shared = self.ctx.load(Ordering::Acquire, &guard);

        // The cell is freed strictly after a grace period, and this
        // thread's epoch is pinned, so the reference is valid here.
        unsafe { shared.as_ref() }.cloned()
    }

    /// Drop the context pointer, leaving the credential context-less.
    pub(crate) fn clear_ctx(&self) {
        let guard = pin();
        let old =
            self.ctx
                .swap(Shared::null(), Ordering::Release, &guard);

        if !old.is_null() {
            unsafe {
                guard.defer_destroy(old);
            }
        }
    }

    /// Run `f` over the in-flight upcall state.
    pub(crate) fn with_upcall_slot<T, F>(
        &self,
        f: F
    ) -> Result<T, MutexPoison>
    where
        F: FnOnce(&mut UpcallSlot) -> T {
        match self.upcall.lock() {
            Ok(mut guard) => Ok(f(&mut guard)),
            Err(_) => Err(MutexPoison)
        }
    }

    /// Record the end of an upcall: stamp the time and clear the
    /// in-flight slot.
    pub(crate) fn finish_upcall(
        &self,
        now: Instant
    ) -> Result<(), MutexPoison> {
        self.with_upcall_slot(|slot| {
            slot.timestamp = Some(now);
            slot.msg = None;
        })
    }

    /// Check whether the credential is inside its negative
    /// cooling-off window.
    ///
    /// The window is `[t, t + retry_delay)` where `t` is the last
    /// upcall timestamp; inside it, refresh fails immediately with
    /// a key-expired error rather than contacting the daemon.
    pub fn is_negative_entry(
        &self,
        retry_delay: Duration,
        now: Instant
    ) -> Result<bool, MutexPoison> {
        if !self.is_negative() {
            return Ok(false);
        }

        self.with_upcall_slot(|slot| match slot.timestamp {
            Some(begin) => now >= begin && now < begin + retry_delay,
            None => false
        })
    }

    /// Check whether this credential satisfies a lookup for
    /// (`uid`, `principal`).
    ///
    /// `NEW` credentials always match on identity alone; settled
    /// credentials additionally require `UPTODATE` and an unexpired
    /// context.  A lookup carrying a principal matches on the
    /// principal string; one without requires the credential to be
    /// principal-less.
    pub fn matches(
        &self,
        uid: u32,
        principal: Option<&str>,
        now: Instant
    ) -> bool {
        if !self.is_new() {
            match self.get_ctx() {
                Some(ctx) => {
                    // Don't match credentials whose context has
                    // expired.
                    if now >= ctx.expiry() {
                        return false;
                    }
                }
                None => return false
            }

            if !self.is_uptodate() {
                return false;
            }
        }

        match principal {
            Some(principal) => match &self.principal {
                Some(ours) => principal == ours,
                None => false
            },
            None => {
                if self.principal.is_some() {
                    return false;
                }

                self.uid == uid
            }
        }
    }
}

impl Drop for GssCredential {
    fn drop(&mut self) {
        // No readers can exist at this point; reclaim the context
        // cell directly.
        let guard = unsafe { unprotected() };
        let old =
            self.ctx
                .swap(Shared::null(), Ordering::AcqRel, guard);

        if !old.is_null() {
            unsafe {
                drop(old.into_owned());
            }
        }
    }
}

#[cfg(test)]
use std::sync::Barrier;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::mech::loopback::LoopbackContext;

#[cfg(test)]
pub(crate) fn test_context(key: u8) -> Arc<GssContext> {
    let (ctx, _) = LoopbackContext::new(key);

    Arc::new(GssContext::new(
        Box::new(ctx),
        vec![b'A', b'A'],
        Instant::now() + Duration::from_secs(3600),
        128
    ))
}

#[cfg(test)]
fn test_cred(uid: u32) -> Arc<GssCredential> {
    GssCredential::new(uid, None, GssService::Integrity, Weak::new())
}

#[test]
fn test_seqno_starts_at_one() {
    init();

    let ctx = test_context(1);

    assert_eq!(ctx.next_seqno().unwrap(), 1);
    assert_eq!(ctx.next_seqno().unwrap(), 2);
    assert_eq!(ctx.next_seqno().unwrap(), 3);
}

#[test]
fn test_set_ctx_publishes() {
    init();

    let cred = test_cred(1000);

    assert!(cred.is_new());
    assert!(cred.get_ctx().is_none());

    let ctx = test_context(1);

    cred.set_ctx(&ctx).unwrap();

    assert!(!cred.is_new());
    assert!(cred.is_uptodate());

    let got = cred.get_ctx().expect("expected a context");

    assert!(Arc::ptr_eq(&got, &ctx));
}

#[test]
fn test_set_ctx_noop_without_new() {
    init();

    let cred = test_cred(1000);
    let first = test_context(1);
    let second = test_context(2);

    cred.set_ctx(&first).unwrap();
    cred.set_ctx(&second).unwrap();

    let got = cred.get_ctx().expect("expected a context");

    assert!(Arc::ptr_eq(&got, &first));
    assert!(cred.is_uptodate());
}

#[test]
fn test_get_ctx_concurrent_with_set() {
    init();

    for _ in 0..64 {
        let cred = test_cred(1000);
        let ctx = test_context(1);
        let barrier = Arc::new(Barrier::new(2));

        let reader_cred = cred.clone();
        let reader_barrier = barrier.clone();
        let reader = spawn(move || {
            reader_barrier.wait();

            match reader_cred.get_ctx() {
                // The Arc we cloned keeps the context alive
                // regardless of what happens to the credential.
                Some(ctx) => {
                    assert_eq!(ctx.window(), 128);
                }
                None => {}
            }
        });

        let writer_barrier = barrier;
        let writer = spawn(move || {
            writer_barrier.wait();
            cred.set_ctx(&ctx).unwrap();
        });

        reader.join().unwrap();
        writer.join().unwrap();
    }
}

#[test]
fn test_negative_entry_window() {
    init();

    let cred = test_cred(1000);
    let now = Instant::now();

    cred.set_negative();
    cred.finish_upcall(now).unwrap();

    let delay = Duration::from_secs(5);

    assert!(cred.is_negative_entry(delay, now).unwrap());
    assert!(cred
        .is_negative_entry(delay, now + Duration::from_secs(4))
        .unwrap());
    assert!(!cred
        .is_negative_entry(delay, now + Duration::from_secs(5))
        .unwrap());

    cred.clear_negative();

    assert!(!cred.is_negative_entry(delay, now).unwrap());
}

#[test]
fn test_matches_lifecycle() {
    init();

    let cred = test_cred(1000);
    let now = Instant::now();

    // NEW credentials match on identity alone.
    assert!(cred.matches(1000, None, now));
    assert!(!cred.matches(1001, None, now));
    assert!(!cred.matches(1000, Some("host/a@REALM"), now));

    let ctx = test_context(1);

    cred.set_ctx(&ctx).unwrap();

    assert!(cred.matches(1000, None, now));

    // An expired context stops matching.
    assert!(!cred.matches(1000, None, now + Duration::from_secs(7200)));

    cred.clear_uptodate();

    assert!(!cred.matches(1000, None, now));
}

#[test]
fn test_matches_principal() {
    init();

    let cred = GssCredential::new(
        0,
        Some(String::from("host/a@REALM")),
        GssService::None,
        Weak::new()
    );
    let now = Instant::now();

    assert!(cred.matches(0, Some("host/a@REALM"), now));
    assert!(!cred.matches(0, Some("host/b@REALM"), now));
    assert!(!cred.matches(0, None, now));
}
