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

//! Upcall pipe channels.
//!
//! A [GssPipe] is the message channel between the credential
//! machinery and the user-space helper daemon.  Requests queue on
//! the pipe until a daemon attaches and reads them (the pipe has
//! wait-for-open semantics); the daemon answers by writing a
//! downcall back through its [DaemonHandle].
//!
//! # Versioning
//!
//! Each authenticator exposes two pipes: the legacy binary pipe
//! (`v0`), named after the mechanism, and the textual pipe (`v1`),
//! named `gssd`.  A single daemon serves the whole process, so which
//! version is in use is decided once, by the first pipe any daemon
//! opens: the [VersionLatch] records that version, counts pipe
//! users, and refuses opens of the other version with
//! [PipeError::Busy] until the last user releases.  Callers that
//! need a pipe before any daemon has attached park on the latch.
use std::collections::VecDeque;
use std::fmt::Display;
use std::fmt::Error;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::error::AuthCredError;
use crate::error::ErrorScope;
use crate::error::MutexPoison;
use crate::error::ScopedError;
use crate::rpc::Interrupt;
use crate::rpc::RpcWaitQueue;
use crate::upcall::UpcallMessage;

/// Largest downcall the pipe accepts.
pub const DOWNCALL_MAXSIZE: usize = 1024;

/// Interval between repeated daemon-absent warnings.
const WARN_INTERVAL: Duration = Duration::from_secs(15);

/// Granularity of interruptible waits on the latch.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Errors that can occur on pipe operations.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PipeError {
    /// A daemon of the other version holds the latch.
    Busy {
        /// The version currently latched.
        latched: u32
    },
    /// The pipe has been torn down.
    Closed,
    /// A mutex was poisoned.
    MutexPoison
}

/// Outcome of waiting for a daemon to attach.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DaemonWait {
    /// A daemon attached.
    Present,
    /// The timeout elapsed with no daemon.
    TimedOut,
    /// The waiter was killed.
    Interrupted
}

/// Sink for daemon downcalls.
///
/// The authenticator implements this; the pipe dispatches bytes a
/// daemon writes through it.
pub trait DowncallSink: Send + Sync {
    /// Handle `buf`, a complete downcall message, arriving on
    /// `pipe`.  Returns the number of bytes consumed.
    fn downcall(
        &self,
        pipe: &Arc<GssPipe>,
        buf: &[u8]
    ) -> Result<usize, DowncallError>;
}

/// Errors reported back to the daemon for a rejected downcall.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DowncallError {
    /// The message exceeded [DOWNCALL_MAXSIZE].
    TooBig {
        /// Size of the offending message.
        size: usize
    },
    /// A field ran past the end of the message.
    Fault,
    /// A field of the message was unusable.
    Invalid,
    /// No upcall is pending for the given uid.
    NoEntry,
    /// The provider rejected the security blob.
    Unsupported,
    /// The pipe has no attached sink.
    Closed,
    /// A mutex was poisoned.
    MutexPoison
}

struct LatchState {
    /// Version of the first pipe a daemon opened, while any user
    /// exists.
    version: Option<u32>,
    /// Number of live pipe users (open daemons plus in-flight
    /// messages).
    users: u32,
    /// Whether a daemon is believed to be running.  Cleared when a
    /// wait for the daemon times out.
    daemon_running: bool,
    /// Last time the daemon-absent warning was emitted.
    warned: Option<Instant>
}

/// The process-wide pipe version latch.
///
/// `version` is set if and only if `users > 0`.
pub struct VersionLatch {
    state: Mutex<LatchState>,
    /// Signalled when a daemon attaches.
    cond: Condvar,
    /// RPC tasks parked waiting for any daemon.
    rpc_waitqueue: RpcWaitQueue
}

struct PipeInner {
    /// Upcalls awaiting a daemon read.
    queue: VecDeque<Arc<UpcallMessage>>,
    /// Upcalls awaiting a downcall reply, at most one per uid.
    pending: Vec<Arc<UpcallMessage>>,
    /// Number of daemons currently holding this pipe open.
    nopen: u32,
    /// Set once the pipe is torn down.
    dead: bool
}

/// One upcall pipe node.
pub struct GssPipe {
    /// Node name (the mechanism name for v0, `"gssd"` for v1).
    name: String,
    /// Version this pipe speaks.
    version: u32,
    latch: Arc<VersionLatch>,
    sink: Weak<dyn DowncallSink>,
    inner: Mutex<PipeInner>
}

/// A daemon's open handle onto a [GssPipe].
///
/// Dropping the handle releases the pipe: every upcall still pending
/// on it fails with [AuthCredError::PipeClosed], and the latch user
/// count drops.
pub struct DaemonHandle {
    pipe: Arc<GssPipe>
}

impl VersionLatch {
    /// Create a latch with no pipes open.
    pub fn new() -> Arc<Self> {
        Arc::new(VersionLatch {
            state: Mutex::new(LatchState {
                version: None,
                users: 0,
                daemon_running: true,
                warned: None
            }),
            cond: Condvar::new(),
            rpc_waitqueue: RpcWaitQueue::new("gss pipe version")
        })
    }

    /// Get the latched version, taking a user reference.
    ///
    /// Returns `None` without taking a reference when no daemon has
    /// a pipe open.
    pub fn get_version(&self) -> Result<Option<u32>, MutexPoison> {
        match self.state.lock() {
            Ok(mut guard) => match guard.version {
                Some(vers) => {
                    guard.users += 1;

                    Ok(Some(vers))
                }
                None => Ok(None)
            },
            Err(_) => Err(MutexPoison)
        }
    }

    /// Drop a user reference taken by [get_version](Self::get_version)
    /// or a successful open.
    pub fn put_version(&self) -> Result<(), MutexPoison> {
        match self.state.lock() {
            Ok(mut guard) => {
                guard.users = guard.users.saturating_sub(1);

                if guard.users == 0 {
                    trace!(target: "gss-pipe",
                           "last pipe user gone, clearing version latch");

                    guard.version = None;
                }

                Ok(())
            }
            Err(_) => Err(MutexPoison)
        }
    }

    fn open(
        &self,
        version: u32
    ) -> Result<(), PipeError> {
        match self.state.lock() {
            Ok(mut guard) => {
                match guard.version {
                    None => {
                        info!(target: "gss-pipe",
                              "daemon attached, pipe version is {}",
                              version);

                        guard.version = Some(version);
                        guard.daemon_running = true;
                        self.cond.notify_all();

                        // Re-drive every task parked on the latch.
                        self.rpc_waitqueue
                            .wake_up_status(Ok(()))
                            .map_err(|_| PipeError::MutexPoison)?;
                    }
                    Some(latched) if latched != version => {
                        debug!(target: "gss-pipe",
                               "version {} open refused, {} is latched",
                               version, latched);

                        return Err(PipeError::Busy { latched: latched });
                    }
                    Some(_) => {}
                }

                guard.users += 1;

                Ok(())
            }
            Err(_) => Err(PipeError::MutexPoison)
        }
    }

    /// Park an RPC task until a daemon attaches.
    #[inline]
    pub fn rpc_waitqueue(&self) -> &RpcWaitQueue {
        &self.rpc_waitqueue
    }

    /// Check whether a daemon is believed to be running.
    pub fn daemon_running(&self) -> Result<bool, MutexPoison> {
        match self.state.lock() {
            Ok(guard) => Ok(guard.daemon_running),
            Err(_) => Err(MutexPoison)
        }
    }

    /// Record that the daemon failed to appear.
    pub fn set_daemon_down(&self) -> Result<(), MutexPoison> {
        match self.state.lock() {
            Ok(mut guard) => {
                guard.daemon_running = false;

                Ok(())
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Block until a daemon attaches, the timeout elapses, or the
    /// waiter is killed.
    pub fn wait_for_daemon(
        &self,
        timeout: Duration,
        interrupt: &Interrupt
    ) -> Result<DaemonWait, MutexPoison> {
        let deadline = Instant::now() + timeout;

        match self.state.lock() {
            Ok(guard) => {
                let mut guard = guard;

                loop {
                    if guard.version.is_some() {
                        return Ok(DaemonWait::Present);
                    }

                    if interrupt.is_raised() {
                        return Ok(DaemonWait::Interrupted);
                    }

                    let now = Instant::now();

                    if now >= deadline {
                        return Ok(DaemonWait::TimedOut);
                    }

                    // Wait in slices so a kill is noticed promptly.
                    let slice = (deadline - now).min(WAIT_SLICE);

                    guard = self
                        .cond
                        .wait_timeout(guard, slice)
                        .map(|(guard, _)| guard)
                        .map_err(|_| MutexPoison)?;
                }
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Emit the daemon-absent warning, rate-limited.
    pub fn warn_daemon_absent(&self) {
        let warn_now = match self.state.lock() {
            Ok(mut guard) => {
                let now = Instant::now();

                match guard.warned {
                    Some(prev) if now < prev + WARN_INTERVAL => false,
                    _ => {
                        guard.warned = Some(now);

                        true
                    }
                }
            }
            Err(_) => false
        };

        if warn_now {
            warn!(target: "gss-pipe",
                  concat!("AUTH_GSS upcall timed out; ",
                          "check that the user daemon is running"));
        }
    }
}

impl GssPipe {
    /// Create a pipe node named `name` speaking `version`.
    pub fn new(
        name: &str,
        version: u32,
        latch: Arc<VersionLatch>,
        sink: Weak<dyn DowncallSink>
    ) -> Arc<Self> {
        debug!(target: "gss-pipe",
               "creating upcall pipe \"{}\" (v{})",
               name, version);

        Arc::new(GssPipe {
            name: String::from(name),
            version: version,
            latch: latch,
            sink: sink,
            inner: Mutex::new(PipeInner {
                queue: VecDeque::new(),
                pending: Vec::new(),
                nopen: 0,
                dead: false
            })
        })
    }

    /// Get the pipe's node name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the version this pipe speaks.
    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Get the shared version latch.
    #[inline]
    pub fn latch(&self) -> &Arc<VersionLatch> {
        &self.latch
    }

    /// Check whether any daemon currently holds this pipe open.
    ///
    /// A torn-down pipe reads as closed even while handles onto it
    /// remain.
    pub fn is_open(&self) -> Result<bool, MutexPoison> {
        match self.inner.lock() {
            Ok(guard) => Ok(guard.nopen > 0 && !guard.dead),
            Err(_) => Err(MutexPoison)
        }
    }

    /// Attach a daemon to this pipe.
    pub fn open(self: &Arc<Self>) -> Result<DaemonHandle, PipeError> {
        match self.inner.lock() {
            Ok(guard) => {
                if guard.dead {
                    return Err(PipeError::Closed);
                }
            }
            Err(_) => return Err(PipeError::MutexPoison)
        }

        self.latch.open(self.version)?;

        match self.inner.lock() {
            Ok(mut guard) => {
                // Teardown may have run between the check above and
                // the latch attach; re-check under the same lock
                // destroy() uses so a handle is never minted on a
                // pipe that has already failed its messages.
                if guard.dead {
                    drop(guard);

                    let _ = self.latch.put_version();

                    return Err(PipeError::Closed);
                }

                guard.nopen += 1;
            }
            Err(_) => {
                let _ = self.latch.put_version();

                return Err(PipeError::MutexPoison);
            }
        }

        info!(target: "gss-pipe",
              "daemon opened pipe \"{}\"",
              self.name);

        Ok(DaemonHandle { pipe: self.clone() })
    }

    /// Queue an upcall for the daemon to read.
    ///
    /// The pipe has wait-for-open semantics: the message queues even
    /// before any daemon attaches.
    pub(crate) fn queue_upcall(
        &self,
        msg: Arc<UpcallMessage>
    ) -> Result<(), PipeError> {
        match self.inner.lock() {
            Ok(mut guard) => {
                if guard.dead {
                    return Err(PipeError::Closed);
                }

                trace!(target: "gss-pipe",
                       "queueing upcall for uid {} on \"{}\"",
                       msg.uid(), self.name);

                guard.queue.push_back(msg);

                Ok(())
            }
            Err(_) => Err(PipeError::MutexPoison)
        }
    }

    /// Insert `msg` into the pending set, de-duplicating by uid.
    ///
    /// If an upcall for the same uid is already pending, that
    /// message is returned instead and `msg` is discarded.
    pub(crate) fn add_upcall(
        &self,
        msg: Arc<UpcallMessage>
    ) -> Result<Arc<UpcallMessage>, MutexPoison> {
        match self.inner.lock() {
            Ok(mut guard) => {
                for pos in guard.pending.iter() {
                    if pos.uid() == msg.uid() {
                        trace!(target: "gss-pipe",
                               "found existing upcall for uid {}",
                               msg.uid());

                        return Ok(pos.clone());
                    }
                }

                msg.set_hashed(true);
                guard.pending.push(msg.clone());

                Ok(msg)
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Remove the pending upcall for `uid`, if any.
    pub(crate) fn take_upcall(
        &self,
        uid: u32
    ) -> Result<Option<Arc<UpcallMessage>>, MutexPoison> {
        match self.inner.lock() {
            Ok(mut guard) => {
                match guard.pending.iter().position(|m| m.uid() == uid) {
                    Some(idx) => {
                        let msg = guard.pending.remove(idx);

                        msg.set_hashed(false);

                        Ok(Some(msg))
                    }
                    None => Ok(None)
                }
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Remove `msg` from the pending set if it is still there.
    pub(crate) fn unhash_upcall(
        &self,
        msg: &Arc<UpcallMessage>
    ) -> Result<(), MutexPoison> {
        if !msg.is_hashed() {
            return Ok(());
        }

        match self.inner.lock() {
            Ok(mut guard) => {
                match guard
                    .pending
                    .iter()
                    .position(|m| Arc::ptr_eq(m, msg))
                {
                    Some(idx) => {
                        guard.pending.remove(idx);
                        msg.set_hashed(false);
                    }
                    None => {}
                }

                guard.queue.retain(|m| !Arc::ptr_eq(m, msg));

                Ok(())
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Pull every queued and pending upcall out of `guard` so the
    /// caller can fail them once the lock is dropped.
    fn drain_locked(
        guard: &mut PipeInner
    ) -> Vec<Arc<UpcallMessage>> {
        guard.queue.clear();

        let msgs = std::mem::take(&mut guard.pending);

        for msg in msgs.iter() {
            msg.set_hashed(false);
        }

        msgs
    }

    fn release(&self) {
        debug!(target: "gss-pipe",
               "daemon released pipe \"{}\"",
               self.name);

        // The user-count drop and the drain happen under one lock
        // acquisition, so no reader sees the pipe half released.
        let msgs = match self.inner.lock() {
            Ok(mut guard) => {
                guard.nopen = guard.nopen.saturating_sub(1);

                Self::drain_locked(&mut guard)
            }
            Err(_) => {
                warn!(target: "gss-pipe",
                      "pipe lock poisoned while releasing \"{}\"",
                      self.name);

                return;
            }
        };

        // Unhash before wake: each message is already out of the
        // pending set by the time a waiter observes its result.
        for msg in msgs {
            msg.fail(AuthCredError::PipeClosed);
        }

        if self.latch.put_version().is_err() {
            warn!(target: "gss-pipe",
                  "version latch poisoned while releasing \"{}\"",
                  self.name);
        }
    }

    /// Tear the pipe down, failing everything still queued.
    ///
    /// The dead mark and the drain happen under one lock
    /// acquisition; once any caller observes the pipe dead, its
    /// messages have already been taken for failure.
    pub(crate) fn destroy(&self) -> Result<(), MutexPoison> {
        let msgs = match self.inner.lock() {
            Ok(mut guard) => {
                guard.dead = true;

                Self::drain_locked(&mut guard)
            }
            Err(_) => return Err(MutexPoison)
        };

        for msg in msgs {
            msg.fail(AuthCredError::PipeClosed);
        }

        Ok(())
    }
}

impl DaemonHandle {
    /// Read the next queued upcall, if any.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, MutexPoison> {
        match self.pipe.inner.lock() {
            Ok(mut guard) => {
                Ok(guard.queue.pop_front().map(|msg| msg.bytes().to_vec()))
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Write a downcall message.
    ///
    /// Returns the number of bytes consumed on success.
    pub fn downcall(
        &self,
        buf: &[u8]
    ) -> Result<usize, DowncallError> {
        match self.pipe.sink.upgrade() {
            Some(sink) => sink.downcall(&self.pipe, buf),
            None => Err(DowncallError::Closed)
        }
    }

    /// Get the pipe this handle is attached to.
    #[inline]
    pub fn pipe(&self) -> &Arc<GssPipe> {
        &self.pipe
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.pipe.release();
    }
}

impl ScopedError for PipeError {
    fn scope(&self) -> ErrorScope {
        match self {
            PipeError::Busy { .. } => ErrorScope::External,
            PipeError::Closed => ErrorScope::Session,
            PipeError::MutexPoison => ErrorScope::Unrecoverable
        }
    }
}

impl ScopedError for DowncallError {
    fn scope(&self) -> ErrorScope {
        match self {
            DowncallError::TooBig { .. } => ErrorScope::External,
            DowncallError::Fault => ErrorScope::External,
            DowncallError::Invalid => ErrorScope::External,
            DowncallError::NoEntry => ErrorScope::External,
            DowncallError::Unsupported => ErrorScope::External,
            DowncallError::Closed => ErrorScope::Session,
            DowncallError::MutexPoison => ErrorScope::Unrecoverable
        }
    }
}

impl Display for PipeError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        match self {
            PipeError::Busy { latched } => {
                write!(f, "pipe version {} is latched", latched)
            }
            PipeError::Closed => write!(f, "pipe torn down"),
            PipeError::MutexPoison => write!(f, "mutex poisoned")
        }
    }
}

impl Display for DowncallError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        match self {
            DowncallError::TooBig { size } => {
                write!(f, "downcall of {} bytes too large", size)
            }
            DowncallError::Fault => write!(f, "truncated downcall"),
            DowncallError::Invalid => write!(f, "invalid uid"),
            DowncallError::NoEntry => write!(f, "no pending upcall"),
            DowncallError::Unsupported => {
                write!(f, "context blob not usable")
            }
            DowncallError::Closed => write!(f, "pipe torn down"),
            DowncallError::MutexPoison => write!(f, "mutex poisoned")
        }
    }
}

#[cfg(test)]
use std::sync::Barrier;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::auth::GssAuthenticator;
#[cfg(test)]
use crate::init;

#[cfg(test)]
fn test_pipe_pair(
    latch: &Arc<VersionLatch>
) -> (Arc<GssPipe>, Arc<GssPipe>) {
    let sink: Weak<GssAuthenticator> = Weak::new();
    let v1 = GssPipe::new("gssd", 1, latch.clone(), sink.clone());
    let v0 = GssPipe::new("krb5", 0, latch.clone(), sink);

    (v0, v1)
}

#[test]
fn test_latch_counts_users() {
    init();

    let latch = VersionLatch::new();

    assert!(latch.get_version().unwrap().is_none());

    let (v0, _) = test_pipe_pair(&latch);
    let handle = v0.open().expect("expected success");

    assert!(v0.is_open().unwrap());
    assert_eq!(latch.get_version().unwrap(), Some(0));

    // Two users now: the daemon and the reference just taken.
    drop(handle);

    assert!(!v0.is_open().unwrap());
    assert_eq!(latch.get_version().unwrap(), Some(0));

    latch.put_version().unwrap();
    latch.put_version().unwrap();

    assert!(latch.get_version().unwrap().is_none());
}

#[test]
fn test_latch_refuses_other_version() {
    init();

    let latch = VersionLatch::new();
    let (v0, v1) = test_pipe_pair(&latch);
    let handle = v1.open().expect("expected success");

    match v0.open() {
        Err(PipeError::Busy { latched }) => assert_eq!(latched, 1),
        _ => panic!("expected busy")
    }

    drop(handle);

    let _handle = v0.open().expect("expected success");
}

#[test]
fn test_wait_for_daemon_times_out() {
    init();

    let latch = VersionLatch::new();
    let start = Instant::now();
    let out = latch
        .wait_for_daemon(Duration::from_millis(120), &Interrupt::new())
        .unwrap();

    assert_eq!(out, DaemonWait::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(120));
}

#[test]
fn test_wait_for_daemon_interrupted() {
    init();

    let latch = VersionLatch::new();
    let interrupt = Interrupt::new();

    interrupt.raise();

    let out = latch
        .wait_for_daemon(Duration::from_secs(5), &interrupt)
        .unwrap();

    assert_eq!(out, DaemonWait::Interrupted);
}

#[test]
fn test_wait_for_daemon_sees_open() {
    init();

    let latch = VersionLatch::new();
    let (v0, _) = test_pipe_pair(&latch);

    let opener = spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        v0.open()
    });

    let out = latch
        .wait_for_daemon(Duration::from_secs(5), &Interrupt::new())
        .unwrap();

    assert_eq!(out, DaemonWait::Present);

    let _handle = opener.join().unwrap().expect("expected success");
}

#[test]
fn test_daemon_running_hint() {
    init();

    let latch = VersionLatch::new();

    assert!(latch.daemon_running().unwrap());

    latch.set_daemon_down().unwrap();

    assert!(!latch.daemon_running().unwrap());

    let (v0, _) = test_pipe_pair(&latch);
    let _handle = v0.open().expect("expected success");

    assert!(latch.daemon_running().unwrap());
}

#[test]
fn test_dead_pipe_refuses() {
    init();

    let latch = VersionLatch::new();
    let (v0, _) = test_pipe_pair(&latch);

    v0.destroy().unwrap();

    match v0.open() {
        Err(PipeError::Closed) => {}
        _ => panic!("expected closed")
    }
}

#[test]
fn test_open_races_destroy() {
    init();

    for _ in 0..100 {
        let latch = VersionLatch::new();
        let (v0, _) = test_pipe_pair(&latch);
        let barrier = Arc::new(Barrier::new(2));

        let open_pipe = v0.clone();
        let open_barrier = barrier.clone();
        let opener = spawn(move || {
            open_barrier.wait();
            open_pipe.open()
        });

        let destroy_pipe = v0.clone();
        let destroy_barrier = barrier;
        let destroyer = spawn(move || {
            destroy_barrier.wait();
            destroy_pipe.destroy().unwrap();
        });

        destroyer.join().unwrap();

        match opener.join().unwrap() {
            // The open won the race; its handle still sees an empty
            // queue and releases cleanly.
            Ok(handle) => {
                assert!(handle.recv().unwrap().is_none());
                drop(handle);
            }
            Err(PipeError::Closed) => {}
            Err(err) => panic!("unexpected error: {}", err)
        }

        // Whichever way the race went, the pipe reads as closed and
        // the latch holds no stale user reference.
        assert!(!v0.is_open().unwrap());
        assert!(latch.get_version().unwrap().is_none());
    }
}
