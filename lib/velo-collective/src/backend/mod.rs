// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend contract for one transport family.
//!
//! A [`Backend`] owns its connections and implements the collective primitives
//! for a family of devices (NCCL for CUDA, Gloo for CPU, ...). The process group
//! treats every backend uniformly through this trait, which is object-safe so
//! instances can be shared as `Arc<dyn Backend>` across several device types.
//!
//! Every collective has a default implementation that reports
//! [`BackendError::Unsupported`]; a transport overrides the ones it provides.
//! Implementations must deliver operations issued by one rank in program order.

pub mod local;
mod options;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::device::Device;
use crate::op_type::OpType;
use crate::store::StoreError;
use crate::tensor::Tensor;
use crate::work::Work;

pub use options::{
    AllToAllOptions, AllgatherOptions, AllreduceOptions, BarrierOptions, BroadcastOptions,
    GatherOptions, ReduceOp, ReduceOptions, ReduceScatterOptions, ScatterOptions,
};

/// Result of issuing a collective.
pub type WorkResult = Result<Arc<dyn Work>, BackendError>;

/// Transport family a backend belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendType {
    /// No backend configured.
    Undefined,
    /// TCP-based CPU collectives.
    Gloo,
    /// GPU-direct collectives.
    Nccl,
    /// Unified collective communication.
    Ucc,
    /// MPI.
    Mpi,
    /// Any user-registered backend not matching a known name.
    Custom,
}

impl BackendType {
    /// Map a configured backend name to its type.
    ///
    /// Matching is exact and case-sensitive; unrecognized names, including the
    /// empty string, map to [`BackendType::Custom`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "undefined" => BackendType::Undefined,
            "gloo" => BackendType::Gloo,
            "nccl" => BackendType::Nccl,
            "ucc" => BackendType::Ucc,
            "mpi" => BackendType::Mpi,
            _ => BackendType::Custom,
        }
    }

    /// Canonical lower-case name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            BackendType::Undefined => "undefined",
            BackendType::Gloo => "gloo",
            BackendType::Nccl => "nccl",
            BackendType::Ucc => "ucc",
            BackendType::Mpi => "mpi",
            BackendType::Custom => "custom",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-function form of [`BackendType::from_name`].
pub fn resolve_backend_name_to_type(name: &str) -> BackendType {
    BackendType::from_name(name)
}

/// Options a backend is constructed with.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Backend name as configured.
    pub backend: String,
    /// Default operation timeout.
    pub timeout: Duration,
}

impl BackendOptions {
    /// Default operation timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

    /// Options for `backend` with the default timeout.
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Errors raised synchronously when issuing an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend does not implement this operation.
    #[error("backend {backend} does not support {op}")]
    Unsupported {
        /// Backend name.
        backend: String,
        /// Requested operation.
        op: OpType,
    },

    /// Arguments do not satisfy the operation's contract.
    #[error("invalid arguments for {op}: {reason}")]
    InvalidArgument {
        /// Requested operation.
        op: OpType,
        /// What was wrong.
        reason: String,
    },

    /// Rendezvous store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl BackendError {
    /// `true` for failures worth retrying, such as a rendezvous timeout.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Store(StoreError::Timeout { .. }))
    }
}

fn unsupported<B: Backend + ?Sized>(backend: &B, op: OpType) -> BackendError {
    BackendError::Unsupported {
        backend: backend.name().to_string(),
        op,
    }
}

/// Collective primitives for one transport family.
pub trait Backend: Send + Sync {
    /// Backend name, e.g. `"nccl"`.
    fn name(&self) -> &str;

    /// Rank of this process within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Set the group name this backend reports.
    fn set_group_name(&self, name: &str);

    /// Group name this backend reports.
    fn group_name(&self) -> String;

    /// Set the group description this backend reports.
    fn set_group_desc(&self, desc: &str);

    /// Group description this backend reports.
    fn group_desc(&self) -> String;

    /// Turn on per-collective timing instrumentation.
    fn enable_collectives_timing(&self);

    /// Device this backend is bound to, if any.
    fn bound_device_id(&self) -> Option<Device> {
        None
    }

    /// Bind this backend to a device. Default ignores the request.
    fn set_bound_device_id(&self, _device: Option<Device>) {}

    /// Copy the root's tensor to every rank.
    fn broadcast(&self, _tensors: &[Tensor], _opts: &BroadcastOptions) -> WorkResult {
        Err(unsupported(self, OpType::Broadcast))
    }

    /// Reduce across ranks, result on every rank.
    fn allreduce(&self, _tensors: &[Tensor], _opts: &AllreduceOptions) -> WorkResult {
        Err(unsupported(self, OpType::Allreduce))
    }

    /// Allreduce a batch of tensors as one operation.
    fn allreduce_coalesced(&self, _tensors: &[Tensor], _opts: &AllreduceOptions) -> WorkResult {
        Err(unsupported(self, OpType::AllreduceCoalesced))
    }

    /// Reduce across ranks, result on the root only.
    fn reduce(&self, _tensors: &[Tensor], _opts: &ReduceOptions) -> WorkResult {
        Err(unsupported(self, OpType::Reduce))
    }

    /// Every rank receives every rank's input, one output tensor per rank.
    fn allgather(
        &self,
        _outputs: &[Vec<Tensor>],
        _inputs: &[Tensor],
        _opts: &AllgatherOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::Allgather))
    }

    /// Allgather into a single output buffer laid out in rank order.
    fn allgather_base(
        &self,
        _output: &Tensor,
        _input: &Tensor,
        _opts: &AllgatherOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::AllgatherBase))
    }

    /// Allgather a batch of inputs as one operation.
    fn allgather_coalesced(
        &self,
        _outputs: &[Vec<Tensor>],
        _inputs: &[Tensor],
        _opts: &AllgatherOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::AllgatherCoalesced))
    }

    /// The root receives every rank's input.
    fn gather(
        &self,
        _outputs: &[Vec<Tensor>],
        _inputs: &[Tensor],
        _opts: &GatherOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::Gather))
    }

    /// The root sends chunk `i` to rank `i`.
    fn scatter(
        &self,
        _outputs: &[Tensor],
        _inputs: &[Vec<Tensor>],
        _opts: &ScatterOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::Scatter))
    }

    /// Reduce chunk `i` across ranks and deliver it to rank `i`.
    fn reduce_scatter(
        &self,
        _outputs: &[Tensor],
        _inputs: &[Vec<Tensor>],
        _opts: &ReduceScatterOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::ReduceScatter))
    }

    /// Reduce-scatter from a single input buffer.
    fn reduce_scatter_base(
        &self,
        _output: &Tensor,
        _input: &Tensor,
        _opts: &ReduceScatterOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::ReduceScatterBase))
    }

    /// All-to-all over single buffers; empty split sizes mean equal splits.
    fn alltoall_base(
        &self,
        _output: &Tensor,
        _input: &Tensor,
        _output_split_sizes: &[usize],
        _input_split_sizes: &[usize],
        _opts: &AllToAllOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::AlltoallBase))
    }

    /// Rank `j`'s `inputs[i]` lands in rank `i`'s `outputs[j]`.
    fn alltoall(
        &self,
        _outputs: &[Tensor],
        _inputs: &[Tensor],
        _opts: &AllToAllOptions,
    ) -> WorkResult {
        Err(unsupported(self, OpType::Alltoall))
    }

    /// Send to `dst_rank`.
    fn send(&self, _tensors: &[Tensor], _dst_rank: usize, _tag: u32) -> WorkResult {
        Err(unsupported(self, OpType::Send))
    }

    /// Receive from `src_rank`.
    fn recv(&self, _tensors: &[Tensor], _src_rank: usize, _tag: u32) -> WorkResult {
        Err(unsupported(self, OpType::Recv))
    }

    /// Receive from whichever rank sends first with `tag`.
    fn recv_anysource(&self, _tensors: &[Tensor], _tag: u32) -> WorkResult {
        Err(unsupported(self, OpType::RecvAnySource))
    }

    /// Block every rank until all have arrived.
    fn barrier(&self, _opts: &BarrierOptions) -> WorkResult {
        Err(unsupported(self, OpType::Barrier))
    }

    /// Start recording operations into a coalesced batch.
    fn start_coalescing(&self) -> Result<(), BackendError> {
        Err(unsupported(self, OpType::Coalesced))
    }

    /// Issue the recorded batch as one operation.
    fn end_coalescing(&self) -> WorkResult {
        Err(unsupported(self, OpType::Coalesced))
    }
}
