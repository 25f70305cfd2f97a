// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group façade and device-to-backend routing.
//!
//! A [`ProcessGroup`] owns three routing tables behind one mutex:
//!
//! - device type → [`BackendType`], populated by [`ProcessGroup::set_backend`];
//! - backend type → live backend instance;
//! - device type → live backend instance, a cache filled on first lookup.
//!
//! The cache is derived data: a hit never re-consults the type table, and a
//! miss resolves through the two other tables and memoizes the result under the
//! same lock, so concurrent first lookups of one device type observe a single
//! population.
//!
//! Every group-level collective picks its backend from the device type of its
//! first operand and forwards the call unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::backend::{
    AllToAllOptions, AllgatherOptions, AllreduceOptions, Backend, BackendError, BackendOptions,
    BackendType, BarrierOptions, BroadcastOptions, GatherOptions, ReduceOptions,
    ReduceScatterOptions, ScatterOptions, resolve_backend_name_to_type,
};
use crate::config::DebugLevel;
use crate::device::{Device, DeviceType};
use crate::op_type::OpType;
use crate::store::Store;
use crate::tensor::Tensor;
use crate::work::Work;

/// Errors returned by [`ProcessGroup`] operations.
///
/// All of these are configuration or state errors: they are surfaced at once
/// and are never worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessGroupError {
    /// No backend type was ever associated with the device type.
    #[error("No backend type associated with device type {0}")]
    NoBackendType(DeviceType),

    /// The backend type was declared for the device but never given an instance.
    #[error("Could not retrieve or create the backend {backend_type} for device type {device_type}")]
    BackendNotFound {
        /// Declared backend type.
        backend_type: BackendType,
        /// Device type being resolved.
        device_type: DeviceType,
    },

    /// The group name was read before any backend was attached.
    #[error("ProcessGroup name not set")]
    GroupNameNotSet,

    /// The group was used after [`ProcessGroup::release_resources`].
    #[error("ProcessGroup resources have been released")]
    Released,

    /// A collective was issued without operands to route on.
    #[error("{0} called with an empty tensor list")]
    EmptyTensorList(OpType),

    /// Rank and size do not describe a valid group member.
    #[error("invalid rank {rank} for group of size {size}")]
    InvalidRank {
        /// Requested rank.
        rank: usize,
        /// Requested size.
        size: usize,
    },

    /// An existing backend is bound to a different device than the group.
    #[error("backend {backend_type} is bound to {existing:?}, group is bound to {requested:?}")]
    BoundDeviceMismatch {
        /// Backend type being reused.
        backend_type: BackendType,
        /// Device the existing backend is bound to.
        existing: Option<Device>,
        /// Device the group is bound to.
        requested: Option<Device>,
    },

    /// The backend rejected the operation.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Options a [`ProcessGroup`] is constructed with.
#[derive(Debug, Clone)]
pub struct ProcessGroupOptions {
    /// Default backend name, e.g. `"nccl"` or `"cpu:gloo,cuda:nccl"`.
    pub backend: String,
    /// Default operation timeout handed to backends.
    pub timeout: Duration,
    /// Initial group description.
    pub group_desc: String,
    /// Verbosity of per-collective logging.
    pub debug_level: DebugLevel,
}

impl ProcessGroupOptions {
    /// Options for `backend` with default timeout, no description, and debug off.
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            timeout: BackendOptions::DEFAULT_TIMEOUT,
            group_desc: String::new(),
            debug_level: DebugLevel::Off,
        }
    }

    /// Options to construct a backend named `name` for this group.
    pub fn backend_options(&self, name: &str) -> BackendOptions {
        BackendOptions {
            backend: name.to_string(),
            timeout: self.timeout,
        }
    }
}

#[derive(Default)]
struct RoutingTables {
    store: Option<Arc<dyn Store>>,
    device_type_to_backend_type: HashMap<DeviceType, BackendType>,
    backend_type_to_backend: HashMap<BackendType, Arc<dyn Backend>>,
    device_type_to_backend: HashMap<DeviceType, Arc<dyn Backend>>,
    // first-attachment order of the cache keys
    attach_order: Vec<DeviceType>,
    released: bool,
}

impl RoutingTables {
    fn cache(&mut self, device_type: DeviceType, backend: Arc<dyn Backend>) {
        if self
            .device_type_to_backend
            .insert(device_type, backend)
            .is_none()
        {
            self.attach_order.push(device_type);
        }
    }

    /// Attached backends, first-attached first, each instance once.
    fn attached(&self) -> Vec<Arc<dyn Backend>> {
        let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
        for device_type in &self.attach_order {
            if let Some(backend) = self.device_type_to_backend.get(device_type)
                && !backends.iter().any(|b| Arc::ptr_eq(b, backend))
            {
                backends.push(backend.clone());
            }
        }
        backends
    }
}

/// A fixed-size group of ranks and the backends that serve it.
pub struct ProcessGroup {
    rank: usize,
    size: usize,
    options: ProcessGroupOptions,
    backend_type: BackendType,
    routing: Mutex<RoutingTables>,
    group_desc: RwLock<String>,
    bound_device: Mutex<Option<Device>>,
    initialized: AtomicBool,
}

impl ProcessGroup {
    /// Create a group member with no backends attached.
    pub fn new(
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        options: ProcessGroupOptions,
    ) -> Result<Self, ProcessGroupError> {
        if size == 0 || rank >= size {
            return Err(ProcessGroupError::InvalidRank { rank, size });
        }

        let backend_type = resolve_backend_name_to_type(&options.backend);
        tracing::info!(
            rank,
            size,
            backend = %options.backend,
            %backend_type,
            "process group created"
        );

        Ok(Self {
            rank,
            size,
            backend_type,
            group_desc: RwLock::new(options.group_desc.clone()),
            options,
            routing: Mutex::new(RoutingTables {
                store: Some(store),
                ..Default::default()
            }),
            bound_device: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    /// Rank of this member.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Backend name from the construction options.
    pub fn backend_name(&self) -> &str {
        &self.options.backend
    }

    /// Backend type the configured name resolves to.
    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    /// Construction options.
    pub fn options(&self) -> &ProcessGroupOptions {
        &self.options
    }

    /// Per-collective logging verbosity.
    pub fn debug_level(&self) -> DebugLevel {
        self.options.debug_level
    }

    /// Rendezvous store, until [`release_resources`](Self::release_resources).
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.routing.lock().store.clone()
    }

    /// Device types that have a backend type declared, in sorted order.
    pub fn device_types(&self) -> Vec<DeviceType> {
        let mut types: Vec<DeviceType> = self
            .routing
            .lock()
            .device_type_to_backend_type
            .keys()
            .copied()
            .collect();
        types.sort();
        types
    }

    /// `true` if at least one backend is attached to a device type.
    pub fn has_backends(&self) -> bool {
        !self.routing.lock().device_type_to_backend.is_empty()
    }

    /// `true` if `device_type` has a backend type declared.
    pub fn has_backend(&self, device_type: DeviceType) -> bool {
        self.routing
            .lock()
            .device_type_to_backend_type
            .contains_key(&device_type)
    }

    /// Device the group is bound to, if any.
    pub fn bound_device_id(&self) -> Option<Device> {
        *self.bound_device.lock()
    }

    /// Bind the group to a device; backends attached afterwards inherit it.
    pub fn set_bound_device_id(&self, device: Option<Device>) {
        *self.bound_device.lock() = device;
    }

    /// Resolve the backend serving `device_type`.
    ///
    /// The cache is consulted first; on a miss the type table and then the
    /// instance table are consulted and the result is memoized.
    pub fn get_backend(&self, device_type: DeviceType) -> Result<Arc<dyn Backend>, ProcessGroupError> {
        let mut tables = self.routing.lock();
        if tables.released {
            return Err(ProcessGroupError::Released);
        }

        if let Some(backend) = tables.device_type_to_backend.get(&device_type) {
            return Ok(backend.clone());
        }

        let backend_type = *tables
            .device_type_to_backend_type
            .get(&device_type)
            .ok_or(ProcessGroupError::NoBackendType(device_type))?;

        let backend = tables
            .backend_type_to_backend
            .get(&backend_type)
            .cloned()
            .ok_or(ProcessGroupError::BackendNotFound {
                backend_type,
                device_type,
            })?;

        tables.cache(device_type, backend.clone());
        tracing::debug!(
            rank = self.rank,
            %device_type,
            %backend_type,
            backend = backend.name(),
            "backend resolved"
        );
        Ok(backend)
    }

    /// Declare `backend_type` for `device_type`, optionally providing its instance.
    ///
    /// The type mapping is always recorded (last write wins). If an instance
    /// of `backend_type` is already attached it is reused for `device_type`
    /// and `backend` is ignored, provided its bound device equals the group's
    /// (both unbound counts as equal); otherwise a provided `backend` is attached
    /// for both tables and bound to the group's device. Without either, only
    /// the type mapping changes.
    pub fn set_backend(
        &self,
        device_type: DeviceType,
        backend_type: BackendType,
        backend: Option<Arc<dyn Backend>>,
    ) -> Result<(), ProcessGroupError> {
        let bound = self.bound_device_id();
        let mut tables = self.routing.lock();
        if tables.released {
            return Err(ProcessGroupError::Released);
        }

        let existing = tables.backend_type_to_backend.get(&backend_type).cloned();
        if let Some(existing) = &existing
            && existing.bound_device_id() != bound
        {
            return Err(ProcessGroupError::BoundDeviceMismatch {
                backend_type,
                existing: existing.bound_device_id(),
                requested: bound,
            });
        }

        tables
            .device_type_to_backend_type
            .insert(device_type, backend_type);

        match (existing, backend) {
            (Some(existing), _) => {
                tables.cache(device_type, existing);
            }
            (None, Some(backend)) => {
                backend.set_bound_device_id(bound);
                tables
                    .backend_type_to_backend
                    .insert(backend_type, backend.clone());
                tables.cache(device_type, backend);
            }
            (None, None) => {}
        }

        tracing::debug!(
            rank = self.rank,
            %device_type,
            %backend_type,
            attached = tables.device_type_to_backend.contains_key(&device_type),
            "backend registered"
        );
        Ok(())
    }

    /// Record one-time API usage for this group's backend.
    ///
    /// Only the first call logs; later calls are no-ops.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(
            target: "velo_collective::api_usage",
            key = %format!("process_group_{}", self.options.backend),
            rank = self.rank,
            size = self.size,
            "api usage"
        );
    }

    /// `true` once [`init`](Self::init) has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Name reported by the first attached backend.
    pub fn get_group_name(&self) -> Result<String, ProcessGroupError> {
        let first = {
            let tables = self.routing.lock();
            tables
                .attach_order
                .first()
                .and_then(|device_type| tables.device_type_to_backend.get(device_type))
                .cloned()
        };
        first
            .map(|backend| backend.group_name())
            .ok_or(ProcessGroupError::GroupNameNotSet)
    }

    /// Set the name on every attached backend. Without backends this does nothing.
    pub fn set_group_name(&self, name: &str) {
        for backend in self.attached() {
            backend.set_group_name(name);
        }
    }

    /// Group description.
    pub fn get_group_desc(&self) -> String {
        self.group_desc.read().clone()
    }

    /// Set the description locally and on every attached backend.
    pub fn set_group_desc(&self, desc: &str) {
        *self.group_desc.write() = desc.to_string();
        for backend in self.attached() {
            backend.set_group_desc(desc);
        }
    }

    /// Enable timing on the backends attached now. Later attachments are not affected.
    pub fn enable_collectives_timing(&self) {
        for backend in self.attached() {
            backend.enable_collectives_timing();
        }
    }

    /// Drop the store and every backend instance.
    ///
    /// Safe to call more than once or with no backend ever attached. Any
    /// collective issued afterwards fails with [`ProcessGroupError::Released`].
    pub fn release_resources(&self) {
        let mut tables = self.routing.lock();
        tables.store = None;
        tables.device_type_to_backend.clear();
        tables.backend_type_to_backend.clear();
        tables.attach_order.clear();
        tables.released = true;
        drop(tables);

        tracing::info!(rank = self.rank, size = self.size, "process group released");
    }

    /// `true` after [`release_resources`](Self::release_resources).
    pub fn is_released(&self) -> bool {
        self.routing.lock().released
    }

    fn attached(&self) -> Vec<Arc<dyn Backend>> {
        self.routing.lock().attached()
    }

    fn route(&self, op: OpType, device_type: DeviceType) -> Result<Arc<dyn Backend>, ProcessGroupError> {
        let backend = self.get_backend(device_type)?;
        match self.options.debug_level {
            DebugLevel::Detail => tracing::debug!(
                rank = self.rank,
                %op,
                %device_type,
                backend = backend.name(),
                "collective"
            ),
            _ => tracing::trace!(
                rank = self.rank,
                %op,
                %device_type,
                backend = backend.name(),
                "collective"
            ),
        }
        Ok(backend)
    }

    fn route_tensors(&self, op: OpType, tensors: &[Tensor]) -> Result<Arc<dyn Backend>, ProcessGroupError> {
        let first = tensors
            .first()
            .ok_or(ProcessGroupError::EmptyTensorList(op))?;
        self.route(op, first.device().device_type())
    }

    /// Broadcast the root's tensor to every rank.
    pub fn broadcast(
        &self,
        tensors: &[Tensor],
        opts: &BroadcastOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Broadcast, tensors)?;
        Ok(backend.broadcast(tensors, opts)?)
    }

    /// Reduce across ranks, leaving the result on every rank.
    pub fn allreduce(
        &self,
        tensors: &[Tensor],
        opts: &AllreduceOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Allreduce, tensors)?;
        Ok(backend.allreduce(tensors, opts)?)
    }

    /// Allreduce several tensors as one operation.
    pub fn allreduce_coalesced(
        &self,
        tensors: &[Tensor],
        opts: &AllreduceOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::AllreduceCoalesced, tensors)?;
        Ok(backend.allreduce_coalesced(tensors, opts)?)
    }

    /// Reduce across ranks onto the root.
    pub fn reduce(
        &self,
        tensors: &[Tensor],
        opts: &ReduceOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Reduce, tensors)?;
        Ok(backend.reduce(tensors, opts)?)
    }

    /// Gather every rank's input on every rank.
    pub fn allgather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
        opts: &AllgatherOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Allgather, inputs)?;
        Ok(backend.allgather(outputs, inputs, opts)?)
    }

    /// Allgather into one output buffer laid out in rank order.
    pub fn allgather_into_tensor(
        &self,
        output: &Tensor,
        input: &Tensor,
        opts: &AllgatherOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route(OpType::AllgatherBase, input.device().device_type())?;
        Ok(backend.allgather_base(output, input, opts)?)
    }

    /// Allgather several inputs as one operation.
    pub fn allgather_coalesced(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
        opts: &AllgatherOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::AllgatherCoalesced, inputs)?;
        Ok(backend.allgather_coalesced(outputs, inputs, opts)?)
    }

    /// Gather every rank's input on the root.
    pub fn gather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
        opts: &GatherOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Gather, inputs)?;
        Ok(backend.gather(outputs, inputs, opts)?)
    }

    /// Scatter the root's chunks, one per rank.
    pub fn scatter(
        &self,
        outputs: &[Tensor],
        inputs: &[Vec<Tensor>],
        opts: &ScatterOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Scatter, outputs)?;
        Ok(backend.scatter(outputs, inputs, opts)?)
    }

    /// Reduce chunk `i` across ranks onto rank `i`.
    pub fn reduce_scatter(
        &self,
        outputs: &[Tensor],
        inputs: &[Vec<Tensor>],
        opts: &ReduceScatterOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::ReduceScatter, outputs)?;
        Ok(backend.reduce_scatter(outputs, inputs, opts)?)
    }

    /// Reduce-scatter from a single input buffer.
    pub fn reduce_scatter_tensor(
        &self,
        output: &Tensor,
        input: &Tensor,
        opts: &ReduceScatterOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route(OpType::ReduceScatterBase, output.device().device_type())?;
        Ok(backend.reduce_scatter_base(output, input, opts)?)
    }

    /// All-to-all over single buffers.
    pub fn alltoall_base(
        &self,
        output: &Tensor,
        input: &Tensor,
        output_split_sizes: &[usize],
        input_split_sizes: &[usize],
        opts: &AllToAllOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route(OpType::AlltoallBase, input.device().device_type())?;
        Ok(backend.alltoall_base(output, input, output_split_sizes, input_split_sizes, opts)?)
    }

    /// All-to-all over per-rank tensor lists.
    pub fn alltoall(
        &self,
        outputs: &[Tensor],
        inputs: &[Tensor],
        opts: &AllToAllOptions,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Alltoall, inputs)?;
        Ok(backend.alltoall(outputs, inputs, opts)?)
    }

    /// Send to `dst_rank`.
    pub fn send(
        &self,
        tensors: &[Tensor],
        dst_rank: usize,
        tag: u32,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Send, tensors)?;
        Ok(backend.send(tensors, dst_rank, tag)?)
    }

    /// Receive from `src_rank`.
    pub fn recv(
        &self,
        tensors: &[Tensor],
        src_rank: usize,
        tag: u32,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::Recv, tensors)?;
        Ok(backend.recv(tensors, src_rank, tag)?)
    }

    /// Receive from whichever rank sends first; see [`Work::source_rank`].
    pub fn recv_anysource(
        &self,
        tensors: &[Tensor],
        tag: u32,
    ) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route_tensors(OpType::RecvAnySource, tensors)?;
        Ok(backend.recv_anysource(tensors, tag)?)
    }

    /// Synchronize every rank.
    ///
    /// Runs on `opts.device` when given, else on CUDA for an NCCL group and
    /// on the CPU otherwise.
    pub fn barrier(&self, opts: &BarrierOptions) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let device_type = match opts.device {
            Some(device) => device.device_type(),
            None if self.backend_type == BackendType::Nccl => DeviceType::Cuda,
            None => DeviceType::Cpu,
        };
        let backend = self.route(OpType::Barrier, device_type)?;
        Ok(backend.barrier(opts)?)
    }

    /// Start batching operations on the backend serving `device_type`.
    pub fn start_coalescing(&self, device_type: DeviceType) -> Result<(), ProcessGroupError> {
        let backend = self.route(OpType::Coalesced, device_type)?;
        Ok(backend.start_coalescing()?)
    }

    /// Issue the batch recorded since [`start_coalescing`](Self::start_coalescing).
    pub fn end_coalescing(&self, device_type: DeviceType) -> Result<Arc<dyn Work>, ProcessGroupError> {
        let backend = self.route(OpType::Coalesced, device_type)?;
        Ok(backend.end_coalescing()?)
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("backend", &self.options.backend)
            .field("device_types", &self.device_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalWorld;
    use crate::store::HashStore;
    use crate::work::WorkHandle;
    use std::sync::atomic::AtomicUsize;

    /// Backend that records identity calls and completes every op at once.
    struct MockBackend {
        name: &'static str,
        group_name: RwLock<String>,
        group_desc: RwLock<String>,
        timing: AtomicBool,
        bound: Mutex<Option<Device>>,
        calls: AtomicUsize,
    }

    impl MockBackend {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                group_name: RwLock::new(String::new()),
                group_desc: RwLock::new(String::new()),
                timing: AtomicBool::new(false),
                bound: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Backend for MockBackend {
        fn name(&self) -> &str {
            self.name
        }
        fn rank(&self) -> usize {
            0
        }
        fn size(&self) -> usize {
            2
        }
        fn set_group_name(&self, name: &str) {
            *self.group_name.write() = name.to_string();
        }
        fn group_name(&self) -> String {
            self.group_name.read().clone()
        }
        fn set_group_desc(&self, desc: &str) {
            *self.group_desc.write() = desc.to_string();
        }
        fn group_desc(&self) -> String {
            self.group_desc.read().clone()
        }
        fn enable_collectives_timing(&self) {
            self.timing.store(true, Ordering::Relaxed);
        }
        fn bound_device_id(&self) -> Option<Device> {
            *self.bound.lock()
        }
        fn set_bound_device_id(&self, device: Option<Device>) {
            *self.bound.lock() = device;
        }
        fn allreduce(&self, tensors: &[Tensor], _opts: &AllreduceOptions) -> crate::backend::WorkResult {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(WorkHandle::completed_with(
                OpType::Allreduce,
                0,
                1,
                tensors.to_vec(),
            )))
        }
        fn barrier(&self, _opts: &BarrierOptions) -> crate::backend::WorkResult {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(WorkHandle::completed_with(OpType::Barrier, 0, 1, Vec::new())))
        }
    }

    fn group(backend: &str) -> ProcessGroup {
        ProcessGroup::new(HashStore::new(), 0, 2, ProcessGroupOptions::new(backend)).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_rank() {
        let err = ProcessGroup::new(HashStore::new(), 2, 2, ProcessGroupOptions::new("gloo")).unwrap_err();
        assert_eq!(err, ProcessGroupError::InvalidRank { rank: 2, size: 2 });
        assert!(ProcessGroup::new(HashStore::new(), 0, 0, ProcessGroupOptions::new("gloo")).is_err());
    }

    #[test]
    fn test_identity() {
        let pg = group("nccl");
        assert_eq!(pg.rank(), 0);
        assert_eq!(pg.size(), 2);
        assert_eq!(pg.backend_name(), "nccl");
        assert_eq!(pg.backend_type(), BackendType::Nccl);
        assert_eq!(pg.debug_level(), DebugLevel::Off);
        assert!(pg.store().is_some());
        assert!(!pg.has_backends());
    }

    #[test]
    fn test_get_backend_caches_identity() {
        let pg = group("nccl");
        let nccl = MockBackend::new("nccl");
        pg.set_backend(DeviceType::Cuda, BackendType::Nccl, None).unwrap();
        pg.set_backend(DeviceType::Hip, BackendType::Nccl, Some(nccl.clone()))
            .unwrap();

        // Cuda was declared before the instance existed, so it resolves lazily.
        let first = pg.get_backend(DeviceType::Cuda).unwrap();
        let second = pg.get_backend(DeviceType::Cuda).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &(nccl.clone() as Arc<dyn Backend>)));

        // Re-pointing the type mapping at a type with no instance leaves the cache alone.
        pg.set_backend(DeviceType::Cuda, BackendType::Gloo, None).unwrap();
        let third = pg.get_backend(DeviceType::Cuda).unwrap();
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_get_backend_errors() {
        let pg = group("gloo");
        assert_eq!(
            pg.get_backend(DeviceType::Cpu).err().unwrap(),
            ProcessGroupError::NoBackendType(DeviceType::Cpu)
        );

        pg.set_backend(DeviceType::Cpu, BackendType::Gloo, None).unwrap();
        let err = pg.get_backend(DeviceType::Cpu).err().unwrap();
        assert_eq!(
            err,
            ProcessGroupError::BackendNotFound {
                backend_type: BackendType::Gloo,
                device_type: DeviceType::Cpu,
            }
        );
        assert!(err.to_string().contains("Could not retrieve or create"));
    }

    #[test]
    fn test_shared_instance_across_device_types() {
        let pg = group("nccl");
        let nccl = MockBackend::new("nccl");
        pg.set_backend(DeviceType::Cuda, BackendType::Nccl, Some(nccl.clone()))
            .unwrap();
        // second registration reuses the attached instance, not the one passed in
        pg.set_backend(DeviceType::Hip, BackendType::Nccl, Some(MockBackend::new("other")))
            .unwrap();

        let cuda = pg.get_backend(DeviceType::Cuda).unwrap();
        let hip = pg.get_backend(DeviceType::Hip).unwrap();
        assert!(Arc::ptr_eq(&cuda, &hip));
        assert_eq!(hip.name(), "nccl");
    }

    #[test]
    fn test_reregistration_last_write_wins() {
        let pg = group("gloo");
        let gloo = MockBackend::new("gloo");
        let custom = MockBackend::new("custom");
        pg.set_backend(DeviceType::Cpu, BackendType::Gloo, Some(gloo)).unwrap();
        pg.set_backend(DeviceType::Cpu, BackendType::Custom, Some(custom))
            .unwrap();

        assert_eq!(pg.get_backend(DeviceType::Cpu).unwrap().name(), "custom");
        assert!(pg.has_backend(DeviceType::Cpu));
        assert_eq!(pg.device_types(), vec![DeviceType::Cpu]);
    }

    #[test]
    fn test_bound_device_propagates_and_is_checked() {
        let pg = group("nccl");
        pg.set_bound_device_id(Some(Device::cuda(1)));
        let nccl = MockBackend::new("nccl");
        pg.set_backend(DeviceType::Cuda, BackendType::Nccl, Some(nccl.clone()))
            .unwrap();
        assert_eq!(nccl.bound_device_id(), Some(Device::cuda(1)));

        pg.set_bound_device_id(Some(Device::cuda(2)));
        let err = pg
            .set_backend(DeviceType::Hip, BackendType::Nccl, None)
            .unwrap_err();
        assert!(matches!(err, ProcessGroupError::BoundDeviceMismatch { .. }));
        assert!(!pg.has_backend(DeviceType::Hip));

        // an unbound group cannot reuse a backend bound to a device either
        pg.set_bound_device_id(None);
        let err = pg
            .set_backend(DeviceType::Hip, BackendType::Nccl, None)
            .unwrap_err();
        assert_eq!(
            err,
            ProcessGroupError::BoundDeviceMismatch {
                backend_type: BackendType::Nccl,
                existing: Some(Device::cuda(1)),
                requested: None,
            }
        );

        pg.set_bound_device_id(Some(Device::cuda(1)));
        pg.set_backend(DeviceType::Hip, BackendType::Nccl, None).unwrap();
        assert!(pg.has_backend(DeviceType::Hip));
    }

    #[test]
    fn test_group_name_fan_out() {
        let pg = group("gloo");
        pg.set_group_name("before");
        assert_eq!(pg.get_group_name().unwrap_err(), ProcessGroupError::GroupNameNotSet);

        let gloo = MockBackend::new("gloo");
        let nccl = MockBackend::new("nccl");
        pg.set_backend(DeviceType::Cpu, BackendType::Gloo, Some(gloo.clone()))
            .unwrap();
        pg.set_backend(DeviceType::Cuda, BackendType::Nccl, Some(nccl.clone()))
            .unwrap();

        pg.set_group_name("g1");
        assert_eq!(gloo.group_name(), "g1");
        assert_eq!(nccl.group_name(), "g1");
        assert_eq!(pg.get_group_name().unwrap(), "g1");

        nccl.set_group_name("diverged");
        assert_eq!(pg.get_group_name().unwrap(), "g1");
    }

    #[test]
    fn test_group_desc_and_timing_fan_out() {
        let pg = group("gloo");
        let gloo = MockBackend::new("gloo");
        pg.set_backend(DeviceType::Cpu, BackendType::Gloo, Some(gloo.clone()))
            .unwrap();

        pg.set_group_desc("tensor parallel");
        assert_eq!(pg.get_group_desc(), "tensor parallel");
        assert_eq!(gloo.group_desc(), "tensor parallel");

        pg.enable_collectives_timing();
        assert!(gloo.timing.load(Ordering::Relaxed));

        let late = MockBackend::new("nccl");
        pg.set_backend(DeviceType::Cuda, BackendType::Nccl, Some(late.clone()))
            .unwrap();
        assert!(!late.timing.load(Ordering::Relaxed));
    }

    #[test]
    fn test_release_resources() {
        let store = HashStore::new();
        let pg = ProcessGroup::new(store.clone(), 0, 1, ProcessGroupOptions::new("gloo")).unwrap();
        pg.release_resources();

        let pg = ProcessGroup::new(store.clone(), 0, 1, ProcessGroupOptions::new("gloo")).unwrap();
        let gloo = MockBackend::new("gloo");
        pg.set_backend(DeviceType::Cpu, BackendType::Gloo, Some(gloo.clone()))
            .unwrap();
        assert_eq!(Arc::strong_count(&store), 2);

        pg.release_resources();
        pg.release_resources();
        assert!(pg.is_released());
        assert!(pg.store().is_none());
        assert!(!pg.has_backends());
        assert_eq!(Arc::strong_count(&store), 1);
        assert_eq!(Arc::strong_count(&gloo), 1);

        let t = Tensor::from_vec(Device::CPU, vec![1.0]);
        assert_eq!(
            pg.allreduce(&[t], &AllreduceOptions::default()).unwrap_err(),
            ProcessGroupError::Released
        );
        assert_eq!(pg.get_backend(DeviceType::Cpu).err().unwrap(), ProcessGroupError::Released);
    }

    #[test]
    fn test_collectives_route_by_first_tensor() {
        let pg = group("gloo");
        let gloo = MockBackend::new("gloo");
        let nccl = MockBackend::new("nccl");
        pg.set_backend(DeviceType::Cpu, BackendType::Gloo, Some(gloo.clone()))
            .unwrap();
        pg.set_backend(DeviceType::Cuda, BackendType::Nccl, Some(nccl.clone()))
            .unwrap();

        let on_gpu = Tensor::from_vec(Device::cuda(0), vec![1.0]);
        let work = pg.allreduce(&[on_gpu], &AllreduceOptions::default()).unwrap();
        assert!(work.is_success());
        assert_eq!(nccl.calls.load(Ordering::Relaxed), 1);
        assert_eq!(gloo.calls.load(Ordering::Relaxed), 0);

        assert_eq!(
            pg.allreduce(&[], &AllreduceOptions::default()).unwrap_err(),
            ProcessGroupError::EmptyTensorList(OpType::Allreduce)
        );

        let err = pg
            .broadcast(&[Tensor::from_vec(Device::CPU, vec![1.0])], &BroadcastOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessGroupError::Backend(BackendError::Unsupported {
                op: OpType::Broadcast,
                ..
            })
        ));
    }

    #[test]
    fn test_barrier_device_selection() {
        let pg = group("nccl");
        let nccl = MockBackend::new("nccl");
        let gloo = MockBackend::new("gloo");
        pg.set_backend(DeviceType::Cuda, BackendType::Nccl, Some(nccl.clone()))
            .unwrap();
        pg.set_backend(DeviceType::Cpu, BackendType::Gloo, Some(gloo.clone()))
            .unwrap();

        pg.barrier(&BarrierOptions::default()).unwrap();
        assert_eq!(nccl.calls.load(Ordering::Relaxed), 1);

        let opts = BarrierOptions {
            device: Some(Device::CPU),
            ..Default::default()
        };
        pg.barrier(&opts).unwrap();
        assert_eq!(gloo.calls.load(Ordering::Relaxed), 1);

        let cpu_group = group("gloo");
        assert_eq!(
            cpu_group.barrier(&BarrierOptions::default()).unwrap_err(),
            ProcessGroupError::NoBackendType(DeviceType::Cpu)
        );
    }

    #[test]
    fn test_coalescing_unsupported_by_default() {
        let pg = group("gloo");
        pg.set_backend(DeviceType::Cpu, BackendType::Gloo, Some(MockBackend::new("gloo")))
            .unwrap();
        assert!(matches!(
            pg.start_coalescing(DeviceType::Cpu),
            Err(ProcessGroupError::Backend(BackendError::Unsupported {
                op: OpType::Coalesced,
                ..
            }))
        ));
        assert!(pg.end_coalescing(DeviceType::Cpu).is_err());
    }

    #[test]
    fn test_concurrent_first_lookup_populates_once() {
        let pg = Arc::new(group("nccl"));
        let nccl = MockBackend::new("nccl");
        pg.set_backend(DeviceType::Cuda, BackendType::Nccl, Some(nccl.clone()))
            .unwrap();
        pg.set_backend(DeviceType::Xpu, BackendType::Nccl, None).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pg = pg.clone();
                std::thread::spawn(move || pg.get_backend(DeviceType::Xpu).unwrap())
            })
            .collect();
        let resolved: Vec<Arc<dyn Backend>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for backend in &resolved {
            assert!(Arc::ptr_eq(backend, &resolved[0]));
        }
        drop(resolved);
        // test handle + instance table + Cuda and Xpu cache entries
        assert_eq!(Arc::strong_count(&nccl), 4);
    }

    #[test]
    fn test_init_logs_once() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let pg = group("gloo");
        assert!(!pg.is_initialized());
        pg.init();
        pg.init();
        assert!(pg.is_initialized());
    }

    #[test]
    fn test_routes_to_local_backend() {
        let world = LocalWorld::new(1);
        let pg = ProcessGroup::new(HashStore::new(), 0, 1, ProcessGroupOptions::new("local")).unwrap();
        pg.set_backend(DeviceType::Cpu, BackendType::Custom, Some(world.backend(0)))
            .unwrap();

        let t = Tensor::from_vec(Device::CPU, vec![2.0, 3.0]);
        pg.allreduce(&[t.clone()], &AllreduceOptions::default())
            .unwrap()
            .wait(None)
            .unwrap();
        assert_eq!(t.to_vec(), vec![2.0, 3.0]);
        assert_eq!(pg.get_backend(DeviceType::Cpu).unwrap().name(), "local");
    }
}
