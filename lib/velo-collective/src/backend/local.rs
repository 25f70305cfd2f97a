// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process backend: every rank of the group lives in the same process.
//!
//! A [`LocalWorld`] is shared by all ranks and hands out one [`LocalBackend`]
//! per rank. Collectives never block the issuing call: each rank deposits its
//! operands under its own sequence number and gets a pending [`WorkHandle`];
//! when the last rank arrives the operation runs and every participant's handle
//! resolves. Ranks therefore must issue the same sequence of collectives, as
//! with any real transport; a rank issuing a different operation at the same
//! position fails the whole step.
//!
//! Point-to-point messages are matched on `(src, dst, tag)` in FIFO order.
//! Sends are buffered and complete immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::backend::{
    AllToAllOptions, AllgatherOptions, AllreduceOptions, Backend, BackendError, BackendOptions,
    BarrierOptions, BroadcastOptions, GatherOptions, ReduceOp, ReduceOptions,
    ReduceScatterOptions, ScatterOptions, WorkResult,
};
use crate::device::Device;
use crate::op_type::OpType;
use crate::registry::BackendFactory;
use crate::store::Store;
use crate::tensor::Tensor;
use crate::work::{Work, WorkHandle};

/// Name reported by [`LocalBackend`].
pub const LOCAL_BACKEND_NAME: &str = "local";

/// Shared rendezvous point for every rank of an in-process group.
pub struct LocalWorld {
    size: usize,
    state: Mutex<WorldState>,
}

#[derive(Default)]
struct WorldState {
    collectives: HashMap<u64, PendingCollective>,
    messages: VecDeque<Message>,
    receives: VecDeque<PendingRecv>,
}

struct PendingCollective {
    arrivals: Vec<Option<Arrival>>,
    arrived: usize,
}

/// One rank's contribution to a collective step.
struct Arrival {
    op: OpType,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    root: usize,
    root_tensor: usize,
    reduce_op: Option<ReduceOp>,
    input_splits: Vec<usize>,
    output_splits: Vec<usize>,
    work: WorkHandle,
    issued_at: Instant,
    timed: bool,
}

impl Arrival {
    fn new(op: OpType, inputs: Vec<Tensor>, outputs: Vec<Tensor>) -> Self {
        Self {
            op,
            inputs,
            outputs,
            root: 0,
            root_tensor: 0,
            reduce_op: None,
            input_splits: Vec::new(),
            output_splits: Vec::new(),
            // replaced by `LocalBackend::enqueue`
            work: WorkHandle::new(op, 0, 0),
            issued_at: Instant::now(),
            timed: false,
        }
    }

    fn in_place(op: OpType, tensors: &[Tensor]) -> Self {
        Self::new(op, tensors.to_vec(), tensors.to_vec())
    }

    fn rooted(mut self, root: usize, root_tensor: usize) -> Self {
        self.root = root;
        self.root_tensor = root_tensor;
        self
    }

    fn reducing(mut self, reduce_op: ReduceOp) -> Self {
        self.reduce_op = Some(reduce_op);
        self
    }
}

struct Message {
    src: usize,
    dst: usize,
    tag: u32,
    data: Vec<f32>,
}

struct PendingRecv {
    dst: usize,
    src: Option<usize>,
    tag: u32,
    tensors: Vec<Tensor>,
    work: WorkHandle,
}

impl PendingRecv {
    fn matches(&self, src: usize, dst: usize, tag: u32) -> bool {
        self.dst == dst && self.tag == tag && self.src.is_none_or(|s| s == src)
    }
}

impl LocalWorld {
    /// A world of `size` ranks.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            state: Mutex::new(WorldState::default()),
        })
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Backend for `rank`, without a rendezvous store.
    ///
    /// # Panics
    ///
    /// If `rank` is outside the world.
    pub fn backend(self: &Arc<Self>, rank: usize) -> Arc<LocalBackend> {
        assert!(rank < self.size, "rank {rank} outside world of {}", self.size);
        Arc::new(LocalBackend::new(
            self.clone(),
            None,
            rank,
            BackendOptions::new(LOCAL_BACKEND_NAME),
        ))
    }

    /// Backend for `rank` that announces itself in `store` under `local/<rank>`.
    pub fn connect(
        self: &Arc<Self>,
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        options: BackendOptions,
    ) -> Result<Arc<LocalBackend>, BackendError> {
        if size != self.size || rank >= self.size {
            return Err(BackendError::InvalidArgument {
                op: OpType::Unknown,
                reason: format!(
                    "rank {rank} of {size} does not fit a local world of {}",
                    self.size
                ),
            });
        }
        store.set(&format!("local/{rank}"), Bytes::from_static(b"ready"))?;
        tracing::debug!(rank, size, "local backend connected");
        Ok(Arc::new(LocalBackend::new(
            self.clone(),
            Some(store),
            rank,
            options,
        )))
    }

    /// Factory that connects ranks of this world, for a
    /// [`BackendRegistry`](crate::BackendRegistry).
    pub fn factory(self: &Arc<Self>) -> BackendFactory {
        let world = self.clone();
        Arc::new(
            move |store: Arc<dyn Store>, rank: usize, size: usize, options: BackendOptions| {
                let backend: Arc<dyn Backend> = world.connect(store, rank, size, options)?;
                Ok(backend)
            },
        )
    }

    /// Collective steps still waiting for at least one rank.
    pub fn pending_collectives(&self) -> usize {
        self.state.lock().collectives.len()
    }

    /// Sends buffered without a matching receive.
    pub fn queued_messages(&self) -> usize {
        self.state.lock().messages.len()
    }

    fn arrive(&self, rank: usize, seq: u64, arrival: Arrival) {
        let ready = {
            let mut state = self.state.lock();
            let pending = state
                .collectives
                .entry(seq)
                .or_insert_with(|| PendingCollective {
                    arrivals: (0..self.size).map(|_| None).collect(),
                    arrived: 0,
                });
            pending.arrivals[rank] = Some(arrival);
            pending.arrived += 1;

            if pending.arrived == self.size {
                state.collectives.remove(&seq)
            } else {
                None
            }
        };

        if let Some(step) = ready {
            let arrivals: Vec<Arrival> = step.arrivals.into_iter().flatten().collect();
            run_step(seq, arrivals);
        }
    }

    fn post_send(&self, src: usize, dst: usize, tag: u32, data: Vec<f32>) {
        let matched = {
            let mut state = self.state.lock();
            // aborted receives stay queued until a send passes by
            state.receives.retain(|recv| !recv.work.is_completed());
            let found = state
                .receives
                .iter()
                .position(|recv| recv.matches(src, dst, tag));
            match found {
                Some(idx) => state.receives.remove(idx),
                None => {
                    state.messages.push_back(Message {
                        src,
                        dst,
                        tag,
                        data,
                    });
                    return;
                }
            }
        };

        if let Some(recv) = matched {
            deliver(&recv.tensors, &data);
            recv.work.complete(recv.tensors.clone(), Some(src));
        }
    }

    fn post_recv(&self, recv: PendingRecv) {
        let message = {
            let mut state = self.state.lock();
            let found = state
                .messages
                .iter()
                .position(|m| recv.matches(m.src, m.dst, m.tag));
            match found {
                Some(idx) => state.messages.remove(idx),
                None => {
                    state.receives.push_back(recv);
                    return;
                }
            }
        };

        if let Some(message) = message {
            deliver(&recv.tensors, &message.data);
            recv.work.complete(recv.tensors.clone(), Some(message.src));
        }
    }
}

fn deliver(tensors: &[Tensor], data: &[f32]) {
    let mut offset = 0;
    for tensor in tensors {
        let end = (offset + tensor.numel()).min(data.len());
        tensor.copy_from_slice(&data[offset..end]);
        offset = end;
    }
}

fn run_step(seq: u64, arrivals: Vec<Arrival>) {
    let outcome = check_consistent(&arrivals).and_then(|()| execute(&arrivals));

    for (rank, arrival) in arrivals.iter().enumerate() {
        if arrival.timed {
            tracing::debug!(
                op = %arrival.op,
                rank,
                seq,
                elapsed_us = arrival.issued_at.elapsed().as_micros() as u64,
                "collective timing"
            );
        }
        match &outcome {
            Ok(()) => {
                arrival.work.complete(arrival.outputs.clone(), None);
            }
            Err(reason) => {
                arrival.work.fail(reason.as_str());
            }
        }
    }

    if let Err(reason) = outcome {
        tracing::warn!(seq, "local collective failed: {}", reason);
    }
}

fn check_consistent(arrivals: &[Arrival]) -> Result<(), String> {
    let first = &arrivals[0];
    for (rank, arrival) in arrivals.iter().enumerate().skip(1) {
        if arrival.op != first.op {
            return Err(format!(
                "collective mismatch: rank {rank} issued {} while rank 0 issued {}",
                arrival.op, first.op
            ));
        }
        if arrival.root != first.root {
            return Err(format!(
                "{}: rank {rank} uses root {} while rank 0 uses root {}",
                first.op, arrival.root, first.root
            ));
        }
        if arrival.reduce_op != first.reduce_op {
            return Err(format!(
                "{}: rank {rank} uses {:?} while rank 0 uses {:?}",
                first.op, arrival.reduce_op, first.reduce_op
            ));
        }
    }
    Ok(())
}

/// Element count shared by every rank, or an error naming the first rank that differs.
fn uniform_len(
    op: OpType,
    what: &str,
    lens: impl IntoIterator<Item = usize>,
) -> Result<usize, String> {
    let mut lens = lens.into_iter().enumerate();
    let Some((_, expected)) = lens.next() else {
        return Ok(0);
    };
    for (rank, len) in lens {
        if len != expected {
            return Err(format!(
                "{op}: rank {rank} {what} holds {len} elements while rank 0 holds {expected}"
            ));
        }
    }
    Ok(expected)
}

fn reduce_op(arrivals: &[Arrival]) -> ReduceOp {
    arrivals[0].reduce_op.unwrap_or_default()
}

fn execute(arrivals: &[Arrival]) -> Result<(), String> {
    let size = arrivals.len();
    let first = &arrivals[0];

    match first.op {
        OpType::Broadcast => {
            let root = &arrivals[first.root];
            let src = root.inputs[root.root_tensor].to_vec();
            uniform_len(
                first.op,
                "tensor",
                arrivals.iter().map(|a| a.outputs[0].numel()),
            )?;
            for arrival in arrivals {
                arrival.outputs.iter().for_each(|t| t.copy_from_slice(&src));
            }
        }
        OpType::Allreduce | OpType::AllreduceCoalesced => {
            let count = first.inputs.len();
            if arrivals.iter().any(|a| a.inputs.len() != count) {
                return Err(format!("{}: ranks disagree on tensor count", first.op));
            }
            for idx in 0..count {
                uniform_len(first.op, "input", arrivals.iter().map(|a| a.inputs[idx].numel()))?;
                let contributions: Vec<Vec<f32>> =
                    arrivals.iter().map(|a| a.inputs[idx].to_vec()).collect();
                let reduced = reduce_op(arrivals).reduce(&contributions);
                for arrival in arrivals {
                    arrival.outputs[idx].copy_from_slice(&reduced);
                }
            }
        }
        OpType::Reduce => {
            uniform_len(first.op, "input", arrivals.iter().map(|a| a.inputs[0].numel()))?;
            let contributions: Vec<Vec<f32>> = arrivals.iter().map(|a| a.inputs[0].to_vec()).collect();
            let reduced = reduce_op(arrivals).reduce(&contributions);
            let root = &arrivals[first.root];
            root.outputs[root.root_tensor].copy_from_slice(&reduced);
        }
        OpType::Allgather => {
            for arrival in arrivals {
                for (src, output) in arrivals.iter().zip(&arrival.outputs) {
                    output.copy_from_slice(&src.inputs[0].to_vec());
                }
            }
        }
        OpType::AllgatherBase => {
            uniform_len(first.op, "input", arrivals.iter().map(|a| a.inputs[0].numel()))?;
            let gathered: Vec<f32> = arrivals.iter().flat_map(|a| a.inputs[0].to_vec()).collect();
            for arrival in arrivals {
                arrival.outputs[0].copy_from_slice(&gathered);
            }
        }
        OpType::Gather => {
            let root = &arrivals[first.root];
            for (src, output) in arrivals.iter().zip(&root.outputs) {
                output.copy_from_slice(&src.inputs[0].to_vec());
            }
        }
        OpType::Scatter => {
            let root = &arrivals[first.root];
            for (chunk, arrival) in root.inputs.iter().zip(arrivals) {
                arrival.outputs[0].copy_from_slice(&chunk.to_vec());
            }
        }
        OpType::ReduceScatter => {
            for (dst, target) in arrivals.iter().enumerate() {
                uniform_len(first.op, "input", arrivals.iter().map(|a| a.inputs[dst].numel()))?;
                let contributions: Vec<Vec<f32>> =
                    arrivals.iter().map(|a| a.inputs[dst].to_vec()).collect();
                target.outputs[0].copy_from_slice(&reduce_op(arrivals).reduce(&contributions));
            }
        }
        OpType::ReduceScatterBase => {
            let len = uniform_len(first.op, "input", arrivals.iter().map(|a| a.inputs[0].numel()))?;
            uniform_len(first.op, "output", arrivals.iter().map(|a| a.outputs[0].numel()))?;
            let inputs: Vec<Vec<f32>> = arrivals.iter().map(|a| a.inputs[0].to_vec()).collect();
            let chunk = len / size;
            for (dst, target) in arrivals.iter().enumerate() {
                let contributions: Vec<Vec<f32>> = inputs
                    .iter()
                    .map(|input| input[dst * chunk..(dst + 1) * chunk].to_vec())
                    .collect();
                target.outputs[0].copy_from_slice(&reduce_op(arrivals).reduce(&contributions));
            }
        }
        OpType::AlltoallBase => {
            let chunks: Vec<Vec<Vec<f32>>> = arrivals
                .iter()
                .map(|a| split_rows(&a.inputs[0], &a.input_splits, size))
                .collect::<Result<_, _>>()?;
            for (dst, target) in arrivals.iter().enumerate() {
                let row_len = row_len(&target.outputs[0]);
                let mut received = Vec::new();
                for (src, per_src) in chunks.iter().enumerate() {
                    let piece = &per_src[dst];
                    if let Some(&expected_rows) = target.output_splits.get(src)
                        && expected_rows * row_len != piece.len()
                    {
                        return Err(format!(
                            "{}: rank {dst} expects {expected_rows} rows from rank {src}",
                            first.op
                        ));
                    }
                    received.extend_from_slice(piece);
                }
                target.outputs[0].copy_from_slice(&received);
            }
        }
        OpType::Alltoall => {
            for (dst, target) in arrivals.iter().enumerate() {
                for (src, output) in arrivals.iter().zip(&target.outputs) {
                    output.copy_from_slice(&src.inputs[dst].to_vec());
                }
            }
        }
        OpType::Barrier => {}
        other => return Err(format!("{other} is not a collective step")),
    }
    Ok(())
}

fn row_len(tensor: &Tensor) -> usize {
    match tensor.shape().first() {
        Some(&rows) if rows > 0 => tensor.numel() / rows,
        _ => 1,
    }
}

fn split_rows(tensor: &Tensor, splits: &[usize], size: usize) -> Result<Vec<Vec<f32>>, String> {
    let data = tensor.to_vec();
    let row_len = row_len(tensor);
    // zero-width rows carry no data, so count them from the shape
    let rows = match row_len {
        0 => tensor.shape().first().copied().unwrap_or(0),
        n => data.len() / n,
    };

    let splits: Vec<usize> = if splits.is_empty() {
        vec![rows / size; size]
    } else {
        splits.to_vec()
    };
    if splits.len() != size || splits.iter().sum::<usize>() > rows {
        return Err(format!("split sizes {splits:?} do not fit {rows} rows"));
    }

    let mut offset = 0;
    Ok(splits
        .iter()
        .map(|rows| {
            let end = offset + rows * row_len;
            let piece = data[offset..end].to_vec();
            offset = end;
            piece
        })
        .collect())
}

/// One rank's view of a [`LocalWorld`].
pub struct LocalBackend {
    world: Arc<LocalWorld>,
    store: Option<Arc<dyn Store>>,
    rank: usize,
    options: BackendOptions,
    seq: AtomicU64,
    p2p_seq: AtomicU64,
    group_name: RwLock<String>,
    group_desc: RwLock<String>,
    timing: AtomicBool,
    bound_device: Mutex<Option<Device>>,
}

impl LocalBackend {
    fn new(
        world: Arc<LocalWorld>,
        store: Option<Arc<dyn Store>>,
        rank: usize,
        options: BackendOptions,
    ) -> Self {
        Self {
            world,
            store,
            rank,
            options,
            seq: AtomicU64::new(0),
            p2p_seq: AtomicU64::new(0),
            group_name: RwLock::new(String::new()),
            group_desc: RwLock::new(String::new()),
            timing: AtomicBool::new(false),
            bound_device: Mutex::new(None),
        }
    }

    /// Options this backend was constructed with.
    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Rendezvous store, when connected through one.
    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.store.as_ref()
    }

    /// `true` once collective timing has been enabled.
    pub fn timing_enabled(&self) -> bool {
        self.timing.load(Ordering::Relaxed)
    }

    /// Number of collectives issued so far by this rank.
    pub fn sequence_number(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    fn enqueue(&self, mut arrival: Arrival) -> WorkResult {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let work = WorkHandle::new(arrival.op, self.rank, seq);
        arrival.work = work.clone();
        arrival.timed = self.timing_enabled();

        tracing::trace!(op = %arrival.op, rank = self.rank, seq, "local collective issued");
        self.world.arrive(self.rank, seq, arrival);
        Ok(Arc::new(work))
    }

    fn invalid(&self, op: OpType, reason: impl Into<String>) -> BackendError {
        BackendError::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    fn check_root(&self, op: OpType, root: usize) -> Result<(), BackendError> {
        if root >= self.size() {
            return Err(self.invalid(op, format!("root rank {root} outside group of {}", self.size())));
        }
        Ok(())
    }

    fn check_single(&self, op: OpType, tensors: &[Tensor]) -> Result<(), BackendError> {
        if tensors.len() != 1 {
            return Err(self.invalid(op, format!("expected 1 tensor, got {}", tensors.len())));
        }
        Ok(())
    }

    fn check_per_rank(&self, op: OpType, what: &str, count: usize) -> Result<(), BackendError> {
        if count != self.size() {
            return Err(self.invalid(
                op,
                format!("expected {} {what} (one per rank), got {count}", self.size()),
            ));
        }
        Ok(())
    }

    fn check_peer(&self, op: OpType, peer: usize) -> Result<(), BackendError> {
        if peer >= self.size() || peer == self.rank {
            return Err(self.invalid(op, format!("invalid peer rank {peer} for rank {}", self.rank)));
        }
        Ok(())
    }

    fn next_p2p_seq(&self) -> u64 {
        self.p2p_seq.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        LOCAL_BACKEND_NAME
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.size
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
        *self.bound_device.lock()
    }

    fn set_bound_device_id(&self, device: Option<Device>) {
        *self.bound_device.lock() = device;
    }

    fn broadcast(&self, tensors: &[Tensor], opts: &BroadcastOptions) -> WorkResult {
        self.check_single(OpType::Broadcast, tensors)?;
        self.check_root(OpType::Broadcast, opts.root_rank)?;
        if opts.root_tensor != 0 {
            return Err(self.invalid(OpType::Broadcast, "root tensor index out of range"));
        }
        self.enqueue(Arrival::in_place(OpType::Broadcast, tensors).rooted(opts.root_rank, 0))
    }

    fn allreduce(&self, tensors: &[Tensor], opts: &AllreduceOptions) -> WorkResult {
        self.check_single(OpType::Allreduce, tensors)?;
        self.enqueue(Arrival::in_place(OpType::Allreduce, tensors).reducing(opts.reduce_op))
    }

    fn allreduce_coalesced(&self, tensors: &[Tensor], opts: &AllreduceOptions) -> WorkResult {
        if tensors.is_empty() {
            return Err(self.invalid(OpType::AllreduceCoalesced, "no tensors"));
        }
        self.enqueue(Arrival::in_place(OpType::AllreduceCoalesced, tensors).reducing(opts.reduce_op))
    }

    fn reduce(&self, tensors: &[Tensor], opts: &ReduceOptions) -> WorkResult {
        self.check_single(OpType::Reduce, tensors)?;
        self.check_root(OpType::Reduce, opts.root_rank)?;
        if opts.root_tensor != 0 {
            return Err(self.invalid(OpType::Reduce, "root tensor index out of range"));
        }
        self.enqueue(
            Arrival::in_place(OpType::Reduce, tensors)
                .rooted(opts.root_rank, 0)
                .reducing(opts.reduce_op),
        )
    }

    fn allgather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
        _opts: &AllgatherOptions,
    ) -> WorkResult {
        self.check_single(OpType::Allgather, inputs)?;
        let [outputs] = outputs else {
            return Err(self.invalid(OpType::Allgather, "expected one output list"));
        };
        self.check_per_rank(OpType::Allgather, "outputs", outputs.len())?;
        self.enqueue(Arrival::new(OpType::Allgather, inputs.to_vec(), outputs.clone()))
    }

    fn allgather_base(&self, output: &Tensor, input: &Tensor, _opts: &AllgatherOptions) -> WorkResult {
        if output.numel() != input.numel() * self.size() {
            return Err(self.invalid(
                OpType::AllgatherBase,
                "output must hold size * input elements",
            ));
        }
        self.enqueue(Arrival::new(
            OpType::AllgatherBase,
            vec![input.clone()],
            vec![output.clone()],
        ))
    }

    fn gather(&self, outputs: &[Vec<Tensor>], inputs: &[Tensor], opts: &GatherOptions) -> WorkResult {
        self.check_single(OpType::Gather, inputs)?;
        self.check_root(OpType::Gather, opts.root_rank)?;
        let outputs = if self.rank == opts.root_rank {
            let [outputs] = outputs else {
                return Err(self.invalid(OpType::Gather, "root expects one output list"));
            };
            self.check_per_rank(OpType::Gather, "outputs", outputs.len())?;
            outputs.clone()
        } else {
            Vec::new()
        };
        self.enqueue(Arrival::new(OpType::Gather, inputs.to_vec(), outputs).rooted(opts.root_rank, 0))
    }

    fn scatter(&self, outputs: &[Tensor], inputs: &[Vec<Tensor>], opts: &ScatterOptions) -> WorkResult {
        self.check_single(OpType::Scatter, outputs)?;
        self.check_root(OpType::Scatter, opts.root_rank)?;
        let inputs = if self.rank == opts.root_rank {
            let [inputs] = inputs else {
                return Err(self.invalid(OpType::Scatter, "root expects one input list"));
            };
            self.check_per_rank(OpType::Scatter, "inputs", inputs.len())?;
            inputs.clone()
        } else {
            Vec::new()
        };
        self.enqueue(Arrival::new(OpType::Scatter, inputs, outputs.to_vec()).rooted(opts.root_rank, 0))
    }

    fn reduce_scatter(
        &self,
        outputs: &[Tensor],
        inputs: &[Vec<Tensor>],
        opts: &ReduceScatterOptions,
    ) -> WorkResult {
        self.check_single(OpType::ReduceScatter, outputs)?;
        let [inputs] = inputs else {
            return Err(self.invalid(OpType::ReduceScatter, "expected one input list"));
        };
        self.check_per_rank(OpType::ReduceScatter, "inputs", inputs.len())?;
        self.enqueue(
            Arrival::new(OpType::ReduceScatter, inputs.clone(), outputs.to_vec())
                .reducing(opts.reduce_op),
        )
    }

    fn reduce_scatter_base(
        &self,
        output: &Tensor,
        input: &Tensor,
        opts: &ReduceScatterOptions,
    ) -> WorkResult {
        if input.numel() != output.numel() * self.size() {
            return Err(self.invalid(
                OpType::ReduceScatterBase,
                "input must hold size * output elements",
            ));
        }
        self.enqueue(
            Arrival::new(
                OpType::ReduceScatterBase,
                vec![input.clone()],
                vec![output.clone()],
            )
            .reducing(opts.reduce_op),
        )
    }

    fn alltoall_base(
        &self,
        output: &Tensor,
        input: &Tensor,
        output_split_sizes: &[usize],
        input_split_sizes: &[usize],
        _opts: &AllToAllOptions,
    ) -> WorkResult {
        for splits in [output_split_sizes, input_split_sizes] {
            if !splits.is_empty() {
                self.check_per_rank(OpType::AlltoallBase, "split sizes", splits.len())?;
            }
        }
        let mut arrival = Arrival::new(
            OpType::AlltoallBase,
            vec![input.clone()],
            vec![output.clone()],
        );
        arrival.input_splits = input_split_sizes.to_vec();
        arrival.output_splits = output_split_sizes.to_vec();
        self.enqueue(arrival)
    }

    fn alltoall(&self, outputs: &[Tensor], inputs: &[Tensor], _opts: &AllToAllOptions) -> WorkResult {
        self.check_per_rank(OpType::Alltoall, "inputs", inputs.len())?;
        self.check_per_rank(OpType::Alltoall, "outputs", outputs.len())?;
        self.enqueue(Arrival::new(OpType::Alltoall, inputs.to_vec(), outputs.to_vec()))
    }

    fn send(&self, tensors: &[Tensor], dst_rank: usize, tag: u32) -> WorkResult {
        self.check_single(OpType::Send, tensors)?;
        self.check_peer(OpType::Send, dst_rank)?;

        let seq = self.next_p2p_seq();
        self.world
            .post_send(self.rank, dst_rank, tag, tensors[0].to_vec());
        Ok(Arc::new(WorkHandle::completed_with(
            OpType::Send,
            self.rank,
            seq,
            tensors.to_vec(),
        )))
    }

    fn recv(&self, tensors: &[Tensor], src_rank: usize, tag: u32) -> WorkResult {
        self.check_single(OpType::Recv, tensors)?;
        self.check_peer(OpType::Recv, src_rank)?;

        let work = WorkHandle::new(OpType::Recv, self.rank, self.next_p2p_seq());
        self.world.post_recv(PendingRecv {
            dst: self.rank,
            src: Some(src_rank),
            tag,
            tensors: tensors.to_vec(),
            work: work.clone(),
        });
        Ok(Arc::new(work))
    }

    fn recv_anysource(&self, tensors: &[Tensor], tag: u32) -> WorkResult {
        self.check_single(OpType::RecvAnySource, tensors)?;

        let work = WorkHandle::new(OpType::RecvAnySource, self.rank, self.next_p2p_seq());
        self.world.post_recv(PendingRecv {
            dst: self.rank,
            src: None,
            tag,
            tensors: tensors.to_vec(),
            work: work.clone(),
        });
        Ok(Arc::new(work))
    }

    fn barrier(&self, _opts: &BarrierOptions) -> WorkResult {
        self.enqueue(Arrival::new(OpType::Barrier, Vec::new(), Vec::new()))
    }
}
