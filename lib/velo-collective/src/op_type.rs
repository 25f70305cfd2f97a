// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Closed taxonomy of collective and point-to-point operations.
//!
//! Every operation a [`Backend`](crate::Backend) issues maps to exactly one
//! [`OpType`]. The string forms are the ones written to logs and work records,
//! so they are fixed; the numeric codes are the ones carried in raw work
//! records and must stay stable as well.

use std::fmt;
use std::str::FromStr;

/// Kind of a collective or point-to-point operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum OpType {
    Broadcast = 0,
    Allreduce = 1,
    AllreduceCoalesced = 2,
    Reduce = 3,
    Allgather = 4,
    /// Single-buffer variant of [`OpType::Allgather`].
    AllgatherBase = 5,
    AllgatherCoalesced = 6,
    Gather = 7,
    Scatter = 8,
    ReduceScatter = 9,
    AlltoallBase = 10,
    Alltoall = 11,
    Send = 12,
    Recv = 13,
    /// Receive from whichever rank sends first.
    RecvAnySource = 14,
    Barrier = 15,
    ReduceScatterBase = 16,
    /// Marker for a batch of fused operations.
    Coalesced = 17,
    AllreduceSparse = 18,
    Unknown = 100,
}

/// Raised when a name or code does not belong to the [`OpType`] set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpTypeParseError {
    /// No op type has this canonical name.
    #[error("unknown op type name: {0:?}")]
    UnknownName(String),

    /// No op type has this numeric code.
    #[error("unknown op type code: {0}")]
    UnknownCode(u8),
}

impl OpType {
    /// Every member of the set, in code order.
    pub const ALL: [OpType; 20] = [
        OpType::Broadcast,
        OpType::Allreduce,
        OpType::AllreduceCoalesced,
        OpType::Reduce,
        OpType::Allgather,
        OpType::AllgatherBase,
        OpType::AllgatherCoalesced,
        OpType::Gather,
        OpType::Scatter,
        OpType::ReduceScatter,
        OpType::AlltoallBase,
        OpType::Alltoall,
        OpType::Send,
        OpType::Recv,
        OpType::RecvAnySource,
        OpType::Barrier,
        OpType::ReduceScatterBase,
        OpType::Coalesced,
        OpType::AllreduceSparse,
        OpType::Unknown,
    ];

    /// Canonical upper-case name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            OpType::Broadcast => "BROADCAST",
            OpType::Allreduce => "ALLREDUCE",
            OpType::AllreduceCoalesced => "ALLREDUCE_COALESCED",
            OpType::Reduce => "REDUCE",
            OpType::Allgather => "ALLGATHER",
            OpType::AllgatherBase => "_ALLGATHER_BASE",
            OpType::AllgatherCoalesced => "ALLGATHER_COALESCED",
            OpType::Gather => "GATHER",
            OpType::Scatter => "SCATTER",
            OpType::ReduceScatter => "REDUCE_SCATTER",
            OpType::AlltoallBase => "ALLTOALL_BASE",
            OpType::Alltoall => "ALLTOALL",
            OpType::Send => "SEND",
            OpType::Recv => "RECV",
            OpType::RecvAnySource => "RECVANYSOURCE",
            OpType::Barrier => "BARRIER",
            OpType::ReduceScatterBase => "_REDUCE_SCATTER_BASE",
            OpType::Coalesced => "COALESCED",
            OpType::AllreduceSparse => "_ALLREDUCE_SPARSE",
            OpType::Unknown => "UNKNOWN",
        }
    }

    /// Stable numeric code.
    pub const fn code(&self) -> u8 {
        *self as u8
    }

    /// See [`is_p2p_op`].
    pub const fn is_p2p(&self, batched: bool) -> bool {
        is_p2p_op(*self, batched)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for OpType {
    type Error = OpTypeParseError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        OpType::ALL
            .into_iter()
            .find(|op| op.code() == code)
            .ok_or(OpTypeParseError::UnknownCode(code))
    }
}

impl FromStr for OpType {
    type Err = OpTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpType::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| OpTypeParseError::UnknownName(s.to_string()))
    }
}

/// Returns the canonical name of `op`.
pub fn op_type_to_string(op: OpType) -> &'static str {
    op.as_str()
}

/// Returns the canonical name for a raw op code read from a work record.
///
/// # Panics
///
/// A code outside the [`OpType`] set means the record is corrupt; this is an
/// internal-consistency violation and aborts the caller.
pub fn raw_op_type_to_string(code: u8) -> &'static str {
    match OpType::try_from(code) {
        Ok(op) => op.as_str(),
        Err(_) => panic!("Unknown op type! (code {code})"),
    }
}

/// Point-to-point classification.
///
/// Operations issued as part of a batched P2P group are never treated as
/// point-to-point; otherwise only `SEND`, `RECV` and `RECVANYSOURCE` are.
pub const fn is_p2p_op(op: OpType, batched: bool) -> bool {
    if batched {
        return false;
    }
    matches!(op, OpType::Send | OpType::Recv | OpType::RecvAnySource)
}
