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

//! Host RPC runtime surface.
//!
//! The credential machinery binds to a surrounding ONC RPC runtime:
//! a task scheduler with an await/wake primitive and completion
//! callbacks, a per-call request buffer pair, and the owning RPC
//! client.  This module provides the slice of that runtime the
//! authentication flavor actually touches.  It is deliberately
//! minimal; transports, retransmission, and call dispatch live in
//! the host runtime proper.
//!
//! An [RpcTask] here stands for one outstanding call: it carries the
//! bound credential, the send and receive buffers, and enough
//! scheduling state for a wait queue to park and wake it.  A task
//! that a wait queue returns [AuthCredError::Retry] to is expected
//! to be re-driven by its owner once woken.
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::trace;

use crate::cred::GssCredential;
use crate::error::AuthCredError;
use crate::error::MutexPoison;
use crate::xdr::XdrBuf;

/// Largest verifier body the runtime accepts.
pub const RPC_MAX_AUTH_SIZE: usize = 400;

/// The owning RPC client, as seen by the authentication flavor.
///
/// The flavor needs two things from its client: the target principal
/// used in upcall requests, and the ability to fire a best-effort
/// NULL call carrying a credential whose procedure has been rewritten
/// to the context-destruction code.
pub trait RpcClient: Send + Sync {
    /// Get the server principal this client authenticates to, if
    /// one was configured.
    fn principal(&self) -> Option<&str>;

    /// Issue an asynchronous NULL RPC bound to `cred`.
    ///
    /// The call is fire-and-forget; failures are ignored.
    fn call_null(
        &self,
        cred: &Arc<GssCredential>
    );
}

/// Per-call marshalling state.
pub struct RpcRequest {
    /// Send buffer.
    snd_buf: XdrBuf,
    /// Receive buffer.
    rcv_buf: XdrBuf,
    /// Offset in the send head where the transport header ends and
    /// the RPC header (the XID) begins.
    header_base: usize,
    /// Read cursor into the receive buffer.
    rcv_pos: usize,
    /// Sequence number stamped on this call by marshalling.
    seqno: u32
}

/// Scheduling state of a task.
struct TaskSched {
    /// Result posted by the waker, once woken.
    status: Option<Result<(), AuthCredError>>,
    /// Whether a wake has been posted.
    woken: bool
}

/// One outstanding RPC call.
pub struct RpcTask {
    /// Credential bound to this call.  Refresh may rebind it.
    cred: Mutex<Arc<GssCredential>>,
    /// Marshalling state.
    req: Mutex<RpcRequest>,
    /// Scheduling state.
    sched: Mutex<TaskSched>,
    /// Wakeup signal for the driving thread.
    cond: Condvar
}

/// Completion callback invoked when a wait queue wakes a task.
///
/// The callback is responsible for posting the task's status via
/// [RpcTask::complete]; tasks parked without a callback are completed
/// by the queue itself.
pub trait WakeCallback: Send + Sync {
    /// Handle the wake of `task` with queue status `status`.
    fn wake(
        &self,
        task: &Arc<RpcTask>,
        status: Result<(), AuthCredError>
    );
}

struct Waiter {
    task: Arc<RpcTask>,
    callback: Option<Arc<dyn WakeCallback>>
}

/// A wait queue for RPC tasks.
///
/// Tasks park here while they wait for an external event (a daemon
/// reply, a daemon arrival).  Waking the queue posts a status to
/// every parked task, running completion callbacks where registered.
pub struct RpcWaitQueue {
    /// Queue name, for logging.
    name: &'static str,
    /// Parked tasks.
    waiters: Mutex<Vec<Waiter>>
}

/// A kill signal for synchronous waiters.
///
/// Synchronous credential creation sleeps in a killable state; this
/// handle is how the surrounding application delivers the kill.  The
/// flag is sticky.
#[derive(Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>
}

impl Interrupt {
    /// Create a new, un-raised `Interrupt`.
    #[inline]
    pub fn new() -> Self {
        Interrupt {
            raised: Arc::new(AtomicBool::new(false))
        }
    }

    /// Raise the kill signal.
    #[inline]
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Check whether the kill signal has been raised.
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

impl RpcRequest {
    /// Create a request whose send and receive buffers have capacity
    /// bound `buflen`.
    #[inline]
    pub fn new(buflen: usize) -> Self {
        RpcRequest {
            snd_buf: XdrBuf::new(buflen),
            rcv_buf: XdrBuf::new(buflen),
            header_base: 0,
            rcv_pos: 0,
            seqno: 0
        }
    }

    /// Get the send buffer.
    #[inline]
    pub fn snd_buf(&self) -> &XdrBuf {
        &self.snd_buf
    }

    /// Get the send buffer mutably.
    #[inline]
    pub fn snd_buf_mut(&mut self) -> &mut XdrBuf {
        &mut self.snd_buf
    }

    /// Get the receive buffer.
    #[inline]
    pub fn rcv_buf(&self) -> &XdrBuf {
        &self.rcv_buf
    }

    /// Get the receive buffer mutably.
    #[inline]
    pub fn rcv_buf_mut(&mut self) -> &mut XdrBuf {
        &mut self.rcv_buf
    }

    /// Get the offset of the XID in the send head.
    #[inline]
    pub fn header_base(&self) -> usize {
        self.header_base
    }

    /// Set the offset of the XID in the send head.
    ///
    /// The transport calls this after writing its own framing.
    #[inline]
    pub fn set_header_base(
        &mut self,
        base: usize
    ) {
        self.header_base = base;
    }

    /// Get the read cursor into the receive buffer.
    #[inline]
    pub fn rcv_pos(&self) -> usize {
        self.rcv_pos
    }

    /// Set the read cursor into the receive buffer.
    #[inline]
    pub fn set_rcv_pos(
        &mut self,
        pos: usize
    ) {
        self.rcv_pos = pos;
    }

    /// Get the sequence number stamped on this call.
    #[inline]
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    /// Record the sequence number stamped on this call.
    #[inline]
    pub fn set_seqno(
        &mut self,
        seqno: u32
    ) {
        self.seqno = seqno;
    }
}

impl RpcTask {
    /// Create a task bound to `cred`, with request buffers of
    /// capacity `buflen`.
    pub fn new(
        cred: Arc<GssCredential>,
        buflen: usize
    ) -> Arc<Self> {
        Arc::new(RpcTask {
            cred: Mutex::new(cred),
            req: Mutex::new(RpcRequest::new(buflen)),
            sched: Mutex::new(TaskSched {
                status: None,
                woken: false
            }),
            cond: Condvar::new()
        })
    }

    /// Get the credential currently bound to this task.
    pub fn cred(&self) -> Result<Arc<GssCredential>, MutexPoison> {
        match self.cred.lock() {
            Ok(guard) => Ok(guard.clone()),
            Err(_) => Err(MutexPoison)
        }
    }

    /// Rebind this task to a different credential.
    pub fn rebind_cred(
        &self,
        cred: Arc<GssCredential>
    ) -> Result<(), MutexPoison> {
        match self.cred.lock() {
            Ok(mut guard) => {
                *guard = cred;

                Ok(())
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Run `f` on this task's request state.
    pub fn with_req<T, F>(
        &self,
        f: F
    ) -> Result<T, MutexPoison>
    where
        F: FnOnce(&mut RpcRequest) -> T {
        match self.req.lock() {
            Ok(mut guard) => Ok(f(&mut guard)),
            Err(_) => Err(MutexPoison)
        }
    }

    /// Post a completion status and wake the driving thread.
    pub fn complete(
        &self,
        status: Result<(), AuthCredError>
    ) {
        match self.sched.lock() {
            Ok(mut guard) => {
                guard.status = Some(status);
                guard.woken = true;
                self.cond.notify_all();
            }
            // The driving thread is gone; nothing to wake.
            Err(_) => {}
        }
    }

    /// Block until a wake has been posted, then consume and return
    /// its status.
    pub fn wait_woken(
        &self
    ) -> Result<Result<(), AuthCredError>, MutexPoison> {
        match self.sched.lock() {
            Ok(guard) => {
                let mut guard = guard;

                while !guard.woken {
                    guard = self
                        .cond
                        .wait(guard)
                        .map_err(|_| MutexPoison)?;
                }

                guard.woken = false;

                Ok(guard.status.take().unwrap_or(Ok(())))
            }
            Err(_) => Err(MutexPoison)
        }
    }
}

impl RpcWaitQueue {
    /// Create a wait queue named `name`.
    #[inline]
    pub fn new(name: &'static str) -> Self {
        RpcWaitQueue {
            name: name,
            waiters: Mutex::new(Vec::new())
        }
    }

    /// Park `task` on this queue.
    ///
    /// If `callback` is provided, it runs when the queue is woken
    /// and is responsible for completing the task; otherwise the
    /// queue completes the task with the wake status.
    pub fn sleep_on(
        &self,
        task: &Arc<RpcTask>,
        callback: Option<Arc<dyn WakeCallback>>
    ) -> Result<(), MutexPoison> {
        trace!(target: "rpc-waitq",
               "task parking on \"{}\"",
               self.name);

        match self.waiters.lock() {
            Ok(mut guard) => {
                guard.push(Waiter {
                    task: task.clone(),
                    callback: callback
                });

                Ok(())
            }
            Err(_) => Err(MutexPoison)
        }
    }

    /// Wake every parked task with `status`.
    pub fn wake_up_status(
        &self,
        status: Result<(), AuthCredError>
    ) -> Result<(), MutexPoison> {
        let waiters = match self.waiters.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return Err(MutexPoison)
        };

        trace!(target: "rpc-waitq",
               "waking {} task(s) on \"{}\"",
               waiters.len(), self.name);

        for waiter in waiters {
            match waiter.callback {
                Some(callback) => {
                    callback.wake(&waiter.task, status);
                }
                None => waiter.task.complete(status)
            }
        }

        Ok(())
    }

    /// Get the number of parked tasks.
    pub fn len(&self) -> usize {
        match self.waiters.lock() {
            Ok(guard) => guard.len(),
            Err(_) => 0
        }
    }

    /// Check whether the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
