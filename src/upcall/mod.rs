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

//! Upcall coordination.
//!
//! One [UpcallMessage] stands for one outstanding request to the
//! daemon.  Concurrent requests by the same user on the same pipe
//! collapse onto a single message (the pipe's pending set is keyed
//! by uid), and one message serves two kinds of waiter at once:
//! synchronous threads block on its condition variable, and
//! asynchronous RPC tasks park on its wait queue with a completion
//! callback.  When the downcall arrives, the message is removed from
//! the pending set first and both waiter populations are woken
//! afterward, so nobody can observe a completed message still
//! pending.
//!
//! This module also owns the wire forms: the v0 (binary) and v1
//! (textual) upcall encodings, and the downcall parser, including
//! the policy that collapses daemon-side parse failures to a retry
//! rather than poisoning a credential.
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::trace;
use log::warn;

use crate::cred::GssContext;
use crate::cred::GssCredential;
use crate::error::AuthCredError;
use crate::error::MutexPoison;
use crate::mech::GssImportError;
use crate::mech::GssMechanism;
use crate::pipe::DowncallError;
use crate::pipe::GssPipe;
use crate::pipe::DOWNCALL_MAXSIZE;
use crate::pipe::VersionLatch;
use crate::rpc::Interrupt;
use crate::rpc::RpcTask;
use crate::rpc::RpcWaitQueue;
use crate::rpc::WakeCallback;

/// Largest encoded upcall request.
pub const UPCALL_BUF_LEN: usize = 128;

/// Minimum context lifetime, applied when the daemon reports zero.
const GSSD_MIN_TIMEOUT: u64 = 60 * 60;

/// The errno value daemons use for an expired key.
const EKEYEXPIRED: i32 = 127;

/// Granularity of killable waits.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// State a message carries between enqueue and completion.
struct UpcallState {
    /// Context built from a successful downcall.
    ctx: Option<Arc<GssContext>>,
    /// Failure posted instead of a context.
    error: Option<AuthCredError>
}

/// One outstanding request to the daemon.
///
/// The message is reference-counted; the pending set, the pipe
/// queue, the credential's in-flight slot, and every waiter may each
/// hold a reference, and completion fan-out must work no matter
/// which of them is the last to let go.
pub struct UpcallMessage {
    /// User the request is for.
    uid: u32,
    /// Encoded request bytes.
    buf: Vec<u8>,
    /// Pipe the request was issued on.
    pipe: Arc<GssPipe>,
    /// Latch reference backing this message's pipe-version user
    /// count.
    latch: Arc<VersionLatch>,
    /// Whether the message is in the pipe's pending set.
    hashed: AtomicBool,
    /// Completion state.
    state: Mutex<UpcallState>,
    /// Wakes synchronous waiters.
    cond: Condvar,
    /// Parks asynchronous RPC tasks.
    rpc_waitqueue: RpcWaitQueue
}

/// Completion callback for the task driving a refresh upcall.
///
/// Exactly one task per credential registers this; it copies the
/// downcall result into the credential before completing the task.
pub(crate) struct UpcallWake {
    cred: Arc<GssCredential>,
    msg: Arc<UpcallMessage>
}

/// Downcall parse outcomes that complete the pending message.
enum FillError {
    /// The daemon refused; the caller sees this exact error and the
    /// daemon's write succeeds.
    Daemon(AuthCredError),
    /// The payload was unusable; the caller retries and the daemon's
    /// write fails with the given error.
    Retry(DowncallError)
}

impl UpcallMessage {
    /// Create a message for `uid` carrying the encoded bytes `buf`.
    ///
    /// The message takes over one pipe-version user reference, which
    /// it returns when dropped.
    pub(crate) fn new(
        uid: u32,
        buf: Vec<u8>,
        pipe: Arc<GssPipe>,
        latch: Arc<VersionLatch>
    ) -> Arc<Self> {
        Arc::new(UpcallMessage {
            uid: uid,
            buf: buf,
            pipe: pipe,
            latch: latch,
            hashed: AtomicBool::new(false),
            state: Mutex::new(UpcallState {
                ctx: None,
                error: None
            }),
            cond: Condvar::new(),
            rpc_waitqueue: RpcWaitQueue::new("RPCSEC_GSS upcall")
        })
    }

    /// Get the uid this request is for.
    #[inline]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Get the encoded request bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Record pending-set membership.
    #[inline]
    pub(crate) fn set_hashed(
        &self,
        hashed: bool
    ) {
        self.hashed.store(hashed, Ordering::Release);
    }

    /// Check pending-set membership.
    #[inline]
    pub(crate) fn is_hashed(&self) -> bool {
        self.hashed.load(Ordering::Acquire)
    }

    /// Get the completion result, if the message has completed.
    pub fn result(
        &self
    ) -> Option<Result<Arc<GssContext>, AuthCredError>> {
        match self.state.lock() {
            Ok(guard) => match (&guard.ctx, &guard.error) {
                (Some(ctx), _) => Some(Ok(ctx.clone())),
                (None, Some(err)) => Some(Err(*err)),
                (None, None) => None
            },
            Err(_) => Some(Err(AuthCredError::MutexPoison))
        }
    }

    /// Park `task` on the message's RPC wait queue, unless the
    /// message has already completed.
    ///
    /// Returns whether the task was parked.  The completeness check
    /// and the registration are atomic with respect to completion,
    /// so a parked task is always woken.
    pub(crate) fn park_task(
        &self,
        task: &Arc<RpcTask>,
        callback: Option<Arc<dyn WakeCallback>>
    ) -> Result<bool, MutexPoison> {
        match self.state.lock() {
            Ok(guard) => {
                if guard.ctx.is_some() || guard.error.is_some() {
                    return Ok(false);
                }

                self.rpc_waitqueue.sleep_on(task, callback)?;

                Ok(true)
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Block a synchronous waiter until the message completes or the
    /// waiter is killed.
    ///
    /// A kill returns [AuthCredError::Interrupted]; the upcall keeps
    /// running in the background and its eventual result is absorbed
    /// silently.
    pub(crate) fn wait_sync(
        &self,
        interrupt: &Interrupt
    ) -> Result<Arc<GssContext>, AuthCredError> {
        match self.state.lock() {
            Ok(guard) => {
                let mut guard = guard;

                loop {
                    match (&guard.ctx, &guard.error) {
                        (Some(ctx), _) => return Ok(ctx.clone()),
                        (None, Some(err)) => return Err(*err),
                        (None, None) => {}
                    }

                    if interrupt.is_raised() {
                        debug!(target: "gss-upcall",
                               "waiter for uid {} killed",
                               self.uid);

                        return Err(AuthCredError::Interrupted);
                    }

                    guard = self
                        .cond
                        .wait_timeout(guard, WAIT_SLICE)
                        .map(|(guard, _)| guard)
                        .map_err(|_| AuthCredError::MutexPoison)?;
                }
            }
            Err(_) => Err(AuthCredError::MutexPoison)
        }
    }

    /// Complete the message and fan out wakes to both waiter
    /// populations.
    ///
    /// Only the first completion takes effect.
    pub(crate) fn finish(
        &self,
        result: Result<Arc<GssContext>, AuthCredError>
    ) {
        match self.state.lock() {
            Ok(mut guard) => {
                if guard.ctx.is_some() || guard.error.is_some() {
                    return;
                }

                match result {
                    Ok(ctx) => guard.ctx = Some(ctx),
                    Err(err) => guard.error = Some(err)
                }

                self.cond.notify_all();
            }
            Err(_) => return
        }

        // The RPC wake runs callbacks, which read this message's
        // state; it must happen outside the state lock.
        let status = self.status();

        if self.rpc_waitqueue.wake_up_status(status).is_err() {
            warn!(target: "gss-upcall",
                  "wait queue poisoned completing upcall for uid {}",
                  self.uid);
        }
    }

    /// Complete the message with a failure.
    #[inline]
    pub(crate) fn fail(
        &self,
        err: AuthCredError
    ) {
        trace!(target: "gss-upcall",
               "failing upcall for uid {}: {}",
               self.uid, err);

        self.finish(Err(err));
    }

    /// Get the completion status as a wake status.
    ///
    /// An incomplete message reads as [AuthCredError::Retry].
    pub(crate) fn status(&self) -> Result<(), AuthCredError> {
        match self.result() {
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => Err(err),
            None => Err(AuthCredError::Retry)
        }
    }
}

impl Drop for UpcallMessage {
    fn drop(&mut self) {
        if self.latch.put_version().is_err() {
            warn!(target: "gss-upcall",
                  "version latch poisoned releasing upcall for uid {}",
                  self.uid);
        }
    }
}

impl UpcallWake {
    pub(crate) fn new(
        cred: Arc<GssCredential>,
        msg: Arc<UpcallMessage>
    ) -> Self {
        UpcallWake {
            cred: cred,
            msg: msg
        }
    }
}

impl WakeCallback for UpcallWake {
    fn wake(
        &self,
        task: &Arc<RpcTask>,
        _status: Result<(), AuthCredError>
    ) {
        if handle_downcall_result(&self.cred, &self.msg).is_err() {
            task.complete(Err(AuthCredError::MutexPoison));

            return;
        }

        task.complete(self.msg.status());
    }
}

/// Copy a completed upcall's result into its credential.
///
/// A context installs (and clears any negative mark); a key-expired
/// failure marks the credential negative.  Either way the upcall
/// timestamp is taken and the in-flight slot cleared.
pub(crate) fn handle_downcall_result(
    cred: &Arc<GssCredential>,
    msg: &Arc<UpcallMessage>
) -> Result<(), MutexPoison> {
    match msg.result() {
        Some(Ok(ctx)) => {
            cred.clear_negative();
            cred.set_ctx(&ctx)?;
        }
        Some(Err(AuthCredError::KeyExpired)) => {
            cred.set_negative();
        }
        _ => {}
    }

    cred.finish_upcall(Instant::now())
}

/// Encode a v0 (binary) upcall request: the uid in native byte
/// order.
pub(crate) fn encode_v0_msg(uid: u32) -> Vec<u8> {
    uid.to_ne_bytes().to_vec()
}

/// Encode a v1 (textual) upcall request.
///
/// The line has the form
/// `mech=<name> uid=<n> [target=<principal>] [service=<name>]
/// [enctypes=<list>] \n` and may not exceed [UPCALL_BUF_LEN] bytes.
pub(crate) fn encode_v1_msg(
    mech: &Arc<dyn GssMechanism>,
    uid: u32,
    target: Option<&str>,
    service_name: Option<&str>
) -> Result<Vec<u8>, AuthCredError> {
    let mut line = format!("mech={} uid={} ", mech.name(), uid);

    if let Some(target) = target {
        line.push_str(&format!("target={} ", target));
    }

    if let Some(service_name) = service_name {
        line.push_str(&format!("service={} ", service_name));
    }

    if let Some(enctypes) = mech.upcall_enctypes() {
        line.push_str(&format!("enctypes={} ", enctypes));
    }

    line.push('\n');

    if line.len() > UPCALL_BUF_LEN {
        warn!(target: "gss-upcall",
              "encoded upcall request too long ({} bytes)",
              line.len());

        return Err(AuthCredError::Denied);
    }

    Ok(line.into_bytes())
}

#[inline]
fn get_u32_ne(
    buf: &[u8],
    pos: &mut usize
) -> Option<u32> {
    let end = pos.checked_add(4)?;

    if end > buf.len() {
        return None;
    }

    let val = u32::from_ne_bytes([
        buf[*pos],
        buf[*pos + 1],
        buf[*pos + 2],
        buf[*pos + 3]
    ]);

    *pos = end;

    Some(val)
}

#[inline]
fn get_bytes<'a>(
    buf: &'a [u8],
    pos: &mut usize,
    len: usize
) -> Option<&'a [u8]> {
    let end = pos.checked_add(len)?;

    if end > buf.len() {
        return None;
    }

    let out = &buf[*pos..end];

    *pos = end;

    Some(out)
}

/// Parse the variable part of a downcall into a fresh context.
///
/// The layout is `timeout:u32 | window:u32 | [errno:i32] |
/// [wire_ctx:netobj | seclen:u32 | blob]`, all host-endian.
fn fill_context(
    mech: &Arc<dyn GssMechanism>,
    buf: &[u8],
    pos: &mut usize
) -> Result<GssContext, FillError> {
    // Remaining lifetime of the underlying credential, in seconds.
    let timeout = match get_u32_ne(buf, pos) {
        Some(0) => GSSD_MIN_TIMEOUT,
        Some(timeout) => timeout as u64,
        None => return Err(FillError::Retry(DowncallError::Fault))
    };

    // The daemon signals an error by sending a zero window, followed
    // by a signed errno.  Anything but an expired key reads as a
    // refusal.
    let window = match get_u32_ne(buf, pos) {
        Some(window) => window,
        None => return Err(FillError::Retry(DowncallError::Fault))
    };

    if window == 0 {
        let errno = match get_u32_ne(buf, pos) {
            Some(raw) => raw as i32,
            None => return Err(FillError::Retry(DowncallError::Fault))
        };

        let err = if errno == -EKEYEXPIRED {
            AuthCredError::KeyExpired
        } else {
            AuthCredError::Denied
        };

        debug!(target: "gss-upcall",
               "daemon reported error {} -> {}",
               errno, err);

        return Err(FillError::Daemon(err));
    }

    let wire_len = match get_u32_ne(buf, pos) {
        Some(len) => len as usize,
        None => return Err(FillError::Retry(DowncallError::Fault))
    };
    let wire_ctx = match get_bytes(buf, pos, wire_len) {
        Some(bytes) => bytes.to_vec(),
        None => return Err(FillError::Retry(DowncallError::Fault))
    };

    let seclen = match get_u32_ne(buf, pos) {
        Some(len) => len as usize,
        None => return Err(FillError::Retry(DowncallError::Fault))
    };
    let blob = match get_bytes(buf, pos, seclen) {
        Some(bytes) => bytes,
        None => return Err(FillError::Retry(DowncallError::Fault))
    };

    let mech_ctx = match mech.import_context(blob) {
        Ok(ctx) => ctx,
        Err(GssImportError::Invalid) => {
            return Err(FillError::Retry(DowncallError::Invalid))
        }
        Err(GssImportError::Unsupported) => {
            return Err(FillError::Retry(DowncallError::Unsupported))
        }
    };

    let expiry = Instant::now() + Duration::from_secs(timeout);

    trace!(target: "gss-upcall",
           "imported context, lifetime {}s, window {}",
           timeout, window);

    Ok(GssContext::new(mech_ctx, wire_ctx, expiry, window))
}

/// Handle a complete downcall message arriving on `pipe`.
///
/// The matching pending message is removed from the pending set
/// before any waiter is woken.  Parse failures after the uid never
/// poison the credential: the message completes with
/// [AuthCredError::Retry] and the daemon's write fails, except for
/// explicit daemon refusals, which pass through to the waiters while
/// the write succeeds.
pub(crate) fn pipe_downcall(
    mech: &Arc<dyn GssMechanism>,
    pipe: &Arc<GssPipe>,
    buf: &[u8]
) -> Result<usize, DowncallError> {
    let mlen = buf.len();

    if mlen > DOWNCALL_MAXSIZE {
        return Err(DowncallError::TooBig { size: mlen });
    }

    let mut pos = 0;
    let uid = match get_u32_ne(buf, &mut pos) {
        Some(uid) => uid,
        None => return Err(DowncallError::Fault)
    };

    let msg = match pipe
        .take_upcall(uid)
        .map_err(|_| DowncallError::MutexPoison)?
    {
        Some(msg) => msg,
        None => {
            debug!(target: "gss-upcall",
                   "downcall for uid {} matches no pending upcall",
                   uid);

            return Err(DowncallError::NoEntry);
        }
    };

    match fill_context(mech, buf, &mut pos) {
        Ok(ctx) => {
            msg.finish(Ok(Arc::new(ctx)));

            Ok(mlen)
        }
        Err(FillError::Daemon(err)) => {
            msg.finish(Err(err));

            Ok(mlen)
        }
        Err(FillError::Retry(dc_err)) => {
            warn!(target: "gss-upcall",
                  "unusable downcall for uid {} ({}), will retry",
                  uid, dc_err);

            msg.fail(AuthCredError::Retry);

            Err(dc_err)
        }
    }
}

#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::auth::GssAuthenticator;
#[cfg(test)]
use crate::cred::test_context;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::mech::loopback::LoopbackMechanism;

#[cfg(test)]
fn test_pipe(latch: &Arc<VersionLatch>) -> Arc<GssPipe> {
    let sink: std::sync::Weak<GssAuthenticator> = std::sync::Weak::new();

    GssPipe::new("gssd", 1, latch.clone(), sink)
}

#[cfg(test)]
fn test_msg(
    uid: u32,
    pipe: &Arc<GssPipe>,
    latch: &Arc<VersionLatch>
) -> Arc<UpcallMessage> {
    UpcallMessage::new(
        uid,
        encode_v0_msg(uid),
        pipe.clone(),
        latch.clone()
    )
}

#[test]
fn test_encode_v0() {
    init();

    assert_eq!(encode_v0_msg(1000), 1000u32.to_ne_bytes().to_vec());
}

#[test]
fn test_encode_v1() {
    init();

    let mech: Arc<dyn GssMechanism> = Arc::new(LoopbackMechanism::new());

    assert_eq!(
        encode_v1_msg(&mech, 1000, None, None).unwrap(),
        b"mech=loopback uid=1000 \n".to_vec()
    );
    assert_eq!(
        encode_v1_msg(
            &mech,
            0,
            Some("nfs@server.example"),
            Some("host/client@REALM")
        )
        .unwrap(),
        concat!(
            "mech=loopback uid=0 ",
            "target=nfs@server.example ",
            "service=host/client@REALM ",
            "\n"
        )
        .as_bytes()
        .to_vec()
    );
}

#[test]
fn test_encode_v1_overflow() {
    init();

    let mech: Arc<dyn GssMechanism> = Arc::new(LoopbackMechanism::new());
    let target: String =
        std::iter::repeat('x').take(UPCALL_BUF_LEN).collect();

    assert!(encode_v1_msg(&mech, 1000, Some(&target), None).is_err());
}

#[test]
fn test_add_upcall_dedups_by_uid() {
    init();

    let latch = VersionLatch::new();
    let pipe = test_pipe(&latch);
    let first = test_msg(1000, &pipe, &latch);
    let second = test_msg(1000, &pipe, &latch);
    let other = test_msg(1001, &pipe, &latch);

    let added = pipe.add_upcall(first.clone()).unwrap();

    assert!(Arc::ptr_eq(&added, &first));
    assert!(first.is_hashed());

    // The second request for the same uid collapses onto the first.
    let added = pipe.add_upcall(second.clone()).unwrap();

    assert!(Arc::ptr_eq(&added, &first));
    assert!(!second.is_hashed());

    let added = pipe.add_upcall(other.clone()).unwrap();

    assert!(Arc::ptr_eq(&added, &other));

    // Removal balances insertion.
    let taken = pipe.take_upcall(1000).unwrap().expect("expected entry");

    assert!(Arc::ptr_eq(&taken, &first));
    assert!(!first.is_hashed());
    assert!(pipe.take_upcall(1000).unwrap().is_none());
}

#[test]
fn test_fanout_wakes_both_waiter_kinds() {
    init();

    let latch = VersionLatch::new();
    let pipe = test_pipe(&latch);
    let msg = test_msg(1000, &pipe, &latch);

    pipe.add_upcall(msg.clone()).unwrap();

    let waiter_msg = msg.clone();
    let waiter = spawn(move || waiter_msg.wait_sync(&Interrupt::new()));

    let cred = crate::cred::GssCredential::new(
        1000,
        None,
        crate::mech::GssService::Integrity,
        std::sync::Weak::new()
    );
    let task = RpcTask::new(cred.clone(), 256);
    let callback = Arc::new(UpcallWake::new(cred.clone(), msg.clone()));

    assert!(msg.park_task(&task, Some(callback)).unwrap());

    let ctx = test_context(0x42);
    let taken = pipe.take_upcall(1000).unwrap().expect("expected entry");

    // Unhash before wake: a woken waiter can never observe its
    // message still pending.
    assert!(!taken.is_hashed());
    taken.finish(Ok(ctx.clone()));

    let got = waiter.join().unwrap().expect("expected a context");

    assert!(Arc::ptr_eq(&got, &ctx));
    assert_eq!(task.wait_woken().unwrap(), Ok(()));
    assert!(cred.is_uptodate());
    assert!(Arc::ptr_eq(
        &cred.get_ctx().expect("expected a context"),
        &ctx
    ));
}

#[test]
fn test_park_after_completion_declined() {
    init();

    let latch = VersionLatch::new();
    let pipe = test_pipe(&latch);
    let msg = test_msg(1000, &pipe, &latch);

    msg.finish(Err(AuthCredError::Denied));

    let cred = crate::cred::GssCredential::new(
        1000,
        None,
        crate::mech::GssService::Integrity,
        std::sync::Weak::new()
    );
    let task = RpcTask::new(cred, 256);

    assert!(!msg.park_task(&task, None).unwrap());
    assert_eq!(msg.status(), Err(AuthCredError::Denied));
}

#[test]
fn test_finish_first_result_wins() {
    init();

    let latch = VersionLatch::new();
    let pipe = test_pipe(&latch);
    let msg = test_msg(1000, &pipe, &latch);

    msg.finish(Err(AuthCredError::Denied));
    msg.finish(Ok(test_context(1)));

    assert_eq!(msg.status(), Err(AuthCredError::Denied));
}

#[test]
fn test_downcall_no_pending_entry() {
    init();

    let latch = VersionLatch::new();
    let pipe = test_pipe(&latch);
    let mech: Arc<dyn GssMechanism> = Arc::new(LoopbackMechanism::new());
    let mut buf = Vec::new();

    buf.extend_from_slice(&1000u32.to_ne_bytes());
    buf.extend_from_slice(&3600u32.to_ne_bytes());
    buf.extend_from_slice(&128u32.to_ne_bytes());

    assert_eq!(
        pipe_downcall(&mech, &pipe, &buf),
        Err(DowncallError::NoEntry)
    );
}

#[test]
fn test_downcall_oversize_rejected() {
    init();

    let latch = VersionLatch::new();
    let pipe = test_pipe(&latch);
    let mech: Arc<dyn GssMechanism> = Arc::new(LoopbackMechanism::new());
    let buf = vec![0; DOWNCALL_MAXSIZE + 1];

    assert_eq!(
        pipe_downcall(&mech, &pipe, &buf),
        Err(DowncallError::TooBig {
            size: DOWNCALL_MAXSIZE + 1
        })
    );
}

#[test]
fn test_downcall_zero_timeout_minimum() {
    init();

    let latch = VersionLatch::new();
    let pipe = test_pipe(&latch);
    let mech: Arc<dyn GssMechanism> = Arc::new(LoopbackMechanism::new());
    let msg = test_msg(1000, &pipe, &latch);

    pipe.add_upcall(msg.clone()).unwrap();

    let mut buf = Vec::new();

    buf.extend_from_slice(&1000u32.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&128u32.to_ne_bytes());
    buf.extend_from_slice(&1u32.to_ne_bytes());
    buf.extend_from_slice(b"W");
    buf.extend_from_slice(&1u32.to_ne_bytes());
    buf.extend_from_slice(&[0x42]);

    let before = Instant::now();

    pipe_downcall(&mech, &pipe, &buf).expect("expected success");

    let ctx = match msg.result() {
        Some(Ok(ctx)) => ctx,
        _ => panic!("expected a context")
    };

    // A zero lifetime from the daemon means "at least an hour".
    assert!(ctx.expiry() >= before + Duration::from_secs(3590));
}

#[test]
fn test_downcall_errno_mapping() {
    init();

    let latch = VersionLatch::new();
    let pipe = test_pipe(&latch);
    let mech: Arc<dyn GssMechanism> = Arc::new(LoopbackMechanism::new());

    for (errno, expected) in [
        (-EKEYEXPIRED, AuthCredError::KeyExpired),
        (-13, AuthCredError::Denied),
        (-1, AuthCredError::Denied)
    ] {
        let msg = test_msg(1000, &pipe, &latch);

        pipe.add_upcall(msg.clone()).unwrap();

        let mut buf = Vec::new();

        buf.extend_from_slice(&1000u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&(errno as u32).to_ne_bytes());

        // Daemon refusals are a successful write.
        assert_eq!(
            pipe_downcall(&mech, &pipe, &buf),
            Ok(buf.len())
        );
        assert_eq!(msg.status(), Err(expected));
    }
}

#[cfg(test)]
struct EnctypesMech {
    flavors: [crate::mech::Pseudoflavor; 0]
}

#[cfg(test)]
impl GssMechanism for EnctypesMech {
    fn name(&self) -> &str {
        "testmech"
    }

    fn upcall_enctypes(&self) -> Option<&str> {
        Some("18,17,16")
    }

    fn pseudoflavors(&self) -> &[crate::mech::Pseudoflavor] {
        &self.flavors
    }

    fn import_context(
        &self,
        _blob: &[u8]
    ) -> Result<Box<dyn crate::mech::GssSecContext>, GssImportError> {
        Err(GssImportError::Unsupported)
    }
}

#[test]
fn test_encode_v1_enctypes() {
    init();

    let mech: Arc<dyn GssMechanism> =
        Arc::new(EnctypesMech { flavors: [] });

    assert_eq!(
        encode_v1_msg(&mech, 1000, None, None).unwrap(),
        b"mech=testmech uid=1000 enctypes=18,17,16 \n".to_vec()
    );
}
