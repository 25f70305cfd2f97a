// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-operation options and reduction kinds.

use crate::device::Device;

/// Elementwise reduction applied by reducing collectives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum of all contributions.
    #[default]
    Sum,
    /// Product of all contributions.
    Product,
    /// Smallest contribution.
    Min,
    /// Largest contribution.
    Max,
    /// Arithmetic mean of all contributions.
    Avg,
}

impl ReduceOp {
    /// Reduce same-length contributions elementwise, in rank order.
    ///
    /// Shorter contributions only affect the positions they cover.
    pub fn reduce(&self, contributions: &[Vec<f32>]) -> Vec<f32> {
        let Some(first) = contributions.first() else {
            return Vec::new();
        };

        let mut acc = first.clone();
        for contribution in &contributions[1..] {
            for (slot, &value) in acc.iter_mut().zip(contribution) {
                *slot = match self {
                    ReduceOp::Sum | ReduceOp::Avg => *slot + value,
                    ReduceOp::Product => *slot * value,
                    ReduceOp::Min => slot.min(value),
                    ReduceOp::Max => slot.max(value),
                };
            }
        }

        if *self == ReduceOp::Avg {
            let n = contributions.len() as f32;
            acc.iter_mut().for_each(|v| *v /= n);
        }
        acc
    }
}

/// Options for `broadcast`.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Rank whose data is sent.
    pub root_rank: usize,
    /// Index of the root tensor within the root's tensor list.
    pub root_tensor: usize,
}

/// Options for `allreduce` and `allreduce_coalesced`.
#[derive(Debug, Clone, Default)]
pub struct AllreduceOptions {
    /// Reduction to apply.
    pub reduce_op: ReduceOp,
}

/// Options for `reduce`.
#[derive(Debug, Clone, Default)]
pub struct ReduceOptions {
    /// Reduction to apply.
    pub reduce_op: ReduceOp,
    /// Rank receiving the result.
    pub root_rank: usize,
    /// Index of the result tensor within the root's tensor list.
    pub root_tensor: usize,
}

/// Options for the allgather family.
#[derive(Debug, Clone, Default)]
pub struct AllgatherOptions {}

/// Options for `gather`.
#[derive(Debug, Clone, Default)]
pub struct GatherOptions {
    /// Rank receiving every contribution.
    pub root_rank: usize,
}

/// Options for `scatter`.
#[derive(Debug, Clone, Default)]
pub struct ScatterOptions {
    /// Rank providing the chunks.
    pub root_rank: usize,
}

/// Options for the reduce-scatter family.
#[derive(Debug, Clone, Default)]
pub struct ReduceScatterOptions {
    /// Reduction to apply.
    pub reduce_op: ReduceOp,
}

/// Options for the all-to-all family.
#[derive(Debug, Clone, Default)]
pub struct AllToAllOptions {}

/// Options for `barrier`.
#[derive(Debug, Clone, Default)]
pub struct BarrierOptions {
    /// Device ordinals participating, for backends that bind per device.
    pub device_ids: Vec<u16>,
    /// Device to run the barrier on; picks the routing key when set.
    pub device: Option<Device>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_ops() {
        let contributions = vec![vec![1.0, 6.0], vec![3.0, 2.0], vec![2.0, 4.0]];
        assert_eq!(ReduceOp::Sum.reduce(&contributions), vec![6.0, 12.0]);
        assert_eq!(ReduceOp::Product.reduce(&contributions), vec![6.0, 48.0]);
        assert_eq!(ReduceOp::Min.reduce(&contributions), vec![1.0, 2.0]);
        assert_eq!(ReduceOp::Max.reduce(&contributions), vec![3.0, 6.0]);
        assert_eq!(ReduceOp::Avg.reduce(&contributions), vec![2.0, 4.0]);
    }

    #[test]
    fn test_reduce_empty() {
        assert!(ReduceOp::Sum.reduce(&[]).is_empty());
        assert_eq!(ReduceOp::default(), ReduceOp::Sum);
    }
}
