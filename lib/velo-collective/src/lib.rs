// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Process groups for collective communication.
//!
//! `velo-collective` lets a fixed-size group of ranks run collectives
//! (broadcast, allreduce, gather, scatter, send/recv, barrier, ...) through
//! pluggable [`Backend`]s, choosing the backend from the device type of the
//! operands.
//!
//! # Architecture
//!
//! [`ProcessGroup`] is the façade. It holds the group identity, a shared
//! rendezvous [`Store`], and the routing tables that map a [`DeviceType`] to a
//! [`BackendType`] and to a live backend instance. One instance may serve
//! several device types; lookups after the first are served from a cache.
//!
//! Every collective returns an [`Arc<dyn Work>`](Work) at once; completion is
//! observed by waiting on or polling that handle.
//!
//! [`BackendRegistry`] builds groups from a backend spec such as
//! `"cpu:gloo,cuda:nccl"`, retrying transient construction failures with a
//! [`Backoff`] policy. [`CollectiveConfig`] loads the spec and the retry pacing
//! from TOML and `VELO_COLLECTIVE_*` environment variables.
//!
//! [`LocalWorld`] runs every rank of a group inside one process.

pub mod backend;
pub mod backoff;
pub mod config;
pub mod device;
pub mod op_type;
pub mod process_group;
pub mod registry;
pub mod store;
pub mod tensor;
pub mod work;

pub use backend::local::{LocalBackend, LocalWorld};
pub use backend::{
    Backend, BackendError, BackendOptions, BackendType, ReduceOp, resolve_backend_name_to_type,
};
pub use backoff::{
    Backoff, BackoffError, ExponentialBackoffWithJitter, FixedBackoff, RetryError,
    retry_with_backoff, sleep_backoff_async,
};
pub use config::{BackoffConfig, CollectiveConfig, ConfigError, DebugLevel};
pub use device::{Device, DeviceType};
pub use op_type::{OpType, is_p2p_op, op_type_to_string, raw_op_type_to_string};
pub use process_group::{ProcessGroup, ProcessGroupError, ProcessGroupOptions};
pub use registry::{BackendFactory, BackendRegistry, BackendSpec, RegistryError};
pub use store::{HashStore, PrefixStore, Store, StoreError};
pub use tensor::Tensor;
pub use work::{Work, WorkError, WorkHandle};
