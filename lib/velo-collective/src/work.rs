// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Completion handles returned by collective calls.
//!
//! Issuing a collective enqueues it and returns an `Arc<dyn Work>` at once.
//! Callers wait (blocking, with an optional timeout) or poll; async callers can
//! await [`WorkHandle::completed`]. A handle resolves exactly once: the first
//! call to [`WorkHandle::complete`], [`WorkHandle::fail`] or
//! [`Work::abort`] wins and later ones are ignored.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::op_type::OpType;
use crate::tensor::Tensor;

/// Failure observed through a work handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    /// The backend reported a failure for this operation.
    #[error("{op} failed: {reason}")]
    Failed {
        /// Operation that failed.
        op: OpType,
        /// Backend-provided description.
        reason: Arc<str>,
    },

    /// `wait` gave up before the operation resolved.
    #[error("{op} did not complete within {timeout:?}")]
    Timeout {
        /// Operation being waited on.
        op: OpType,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The operation was aborted before completion.
    #[error("{0} was aborted")]
    Aborted(OpType),
}

/// Contract of an asynchronous operation handle.
pub trait Work: Send + Sync + fmt::Debug {
    /// Kind of operation this handle tracks.
    fn op_type(&self) -> OpType;

    /// `true` once the operation has resolved, successfully or not.
    fn is_completed(&self) -> bool;

    /// `true` once the operation has resolved without error.
    fn is_success(&self) -> bool;

    /// The failure, if the operation resolved with one.
    fn exception(&self) -> Option<WorkError>;

    /// Block until the operation resolves or `timeout` elapses.
    fn wait(&self, timeout: Option<Duration>) -> Result<(), WorkError>;

    /// Rank that satisfied a receive-from-any-source, once known.
    fn source_rank(&self) -> Option<usize>;

    /// Output tensors of a successful operation.
    fn result(&self) -> Vec<Tensor>;

    /// Abort a pending operation. Default is a no-op.
    fn abort(&self) {}
}

#[derive(Debug)]
enum WorkState {
    Pending,
    Completed {
        outputs: Vec<Tensor>,
        source_rank: Option<usize>,
    },
    Failed(WorkError),
}

struct WorkInner {
    op: OpType,
    rank: usize,
    seq: u64,
    state: Mutex<WorkState>,
    cond: Condvar,
    notify: Notify,
}

/// Generic [`Work`] implementation backends hand out and later resolve.
#[derive(Clone)]
pub struct WorkHandle {
    inner: Arc<WorkInner>,
}

impl WorkHandle {
    /// A pending handle for operation `op`, issued by `rank` as its `seq`-th call.
    pub fn new(op: OpType, rank: usize, seq: u64) -> Self {
        Self {
            inner: Arc::new(WorkInner {
                op,
                rank,
                seq,
                state: Mutex::new(WorkState::Pending),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// A handle that is already resolved successfully.
    pub fn completed_with(op: OpType, rank: usize, seq: u64, outputs: Vec<Tensor>) -> Self {
        let handle = Self::new(op, rank, seq);
        handle.complete(outputs, None);
        handle
    }

    /// Rank that issued the operation.
    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    /// Per-rank sequence number of the operation.
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    /// Resolve successfully. Returns `false` if the handle was already resolved.
    pub fn complete(&self, outputs: Vec<Tensor>, source_rank: Option<usize>) -> bool {
        self.resolve(WorkState::Completed {
            outputs,
            source_rank,
        })
    }

    /// Resolve with a failure. Returns `false` if the handle was already resolved.
    pub fn fail(&self, reason: impl Into<Arc<str>>) -> bool {
        self.resolve(WorkState::Failed(WorkError::Failed {
            op: self.inner.op,
            reason: reason.into(),
        }))
    }

    /// Wait for resolution without blocking a runtime thread.
    pub async fn completed(&self) -> Result<(), WorkError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = Self::outcome(&self.inner.state.lock());
            if let Some(outcome) = outcome {
                return outcome;
            }
            notified.await;
        }
    }

    fn resolve(&self, next: WorkState) -> bool {
        let mut state = self.inner.state.lock();
        if !matches!(*state, WorkState::Pending) {
            return false;
        }
        *state = next;
        drop(state);

        self.inner.cond.notify_all();
        self.inner.notify.notify_waiters();
        tracing::trace!(
            op = %self.inner.op,
            rank = self.inner.rank,
            seq = self.inner.seq,
            "work resolved"
        );
        true
    }

    fn outcome(state: &WorkState) -> Option<Result<(), WorkError>> {
        match state {
            WorkState::Pending => None,
            WorkState::Completed { .. } => Some(Ok(())),
            WorkState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

impl Work for WorkHandle {
    fn op_type(&self) -> OpType {
        self.inner.op
    }

    fn is_completed(&self) -> bool {
        !matches!(*self.inner.state.lock(), WorkState::Pending)
    }

    fn is_success(&self) -> bool {
        matches!(*self.inner.state.lock(), WorkState::Completed { .. })
    }

    fn exception(&self) -> Option<WorkError> {
        match &*self.inner.state.lock() {
            WorkState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<(), WorkError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();

        loop {
            if let Some(outcome) = Self::outcome(&state) {
                return outcome;
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut state, deadline).timed_out()
                        && matches!(*state, WorkState::Pending)
                    {
                        return Err(WorkError::Timeout {
                            op: self.inner.op,
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                }
                None => self.inner.cond.wait(&mut state),
            }
        }
    }

    fn source_rank(&self) -> Option<usize> {
        match &*self.inner.state.lock() {
            WorkState::Completed { source_rank, .. } => *source_rank,
            _ => None,
        }
    }

    fn result(&self) -> Vec<Tensor> {
        match &*self.inner.state.lock() {
            WorkState::Completed { outputs, .. } => outputs.clone(),
            _ => Vec::new(),
        }
    }

    fn abort(&self) {
        self.resolve(WorkState::Failed(WorkError::Aborted(self.inner.op)));
    }
}

impl fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkHandle")
            .field("op", &self.inner.op)
            .field("rank", &self.inner.rank)
            .field("seq", &self.inner.seq)
            .field("completed", &self.is_completed())
            .finish()
    }
}
