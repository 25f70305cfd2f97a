// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-rank groups over an in-process world, built through the registry.

use std::sync::Arc;
use std::time::Duration;

use velo_collective::backend::{
    AllgatherOptions, AllreduceOptions, BarrierOptions, BroadcastOptions, ReduceOp,
};
use velo_collective::{
    BackendRegistry, CollectiveConfig, Device, DeviceType, HashStore, LocalWorld, OpType,
    PrefixStore, ProcessGroup, ProcessGroupError, Store, Tensor, Work,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

async fn build_groups(size: usize, spec: &str) -> anyhow::Result<Vec<Arc<ProcessGroup>>> {
    let world = LocalWorld::new(size);
    let registry = BackendRegistry::new();
    registry.register("local", &[DeviceType::Cpu], world.factory())?;

    let config = CollectiveConfig {
        backend: spec.to_string(),
        timeout_secs: 10,
        ..Default::default()
    };
    let store: Arc<dyn Store> = PrefixStore::new("trainers", HashStore::new());

    let mut groups = Vec::with_capacity(size);
    for rank in 0..size {
        let mut backoff = config.backoff.build()?;
        let pg = registry
            .init_process_group(
                store.clone(),
                rank,
                size,
                config.process_group_options(),
                "trainers",
                &mut backoff,
            )
            .await?;
        groups.push(Arc::new(pg));
    }
    Ok(groups)
}

fn on_each_rank<T, F>(groups: &[Arc<ProcessGroup>], f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Arc<ProcessGroup>) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = groups
        .iter()
        .cloned()
        .map(|pg| {
            let f = f.clone();
            std::thread::spawn(move || f(pg))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[tokio::test]
async fn test_group_collectives_across_ranks() -> anyhow::Result<()> {
    let groups = build_groups(4, "local").await?;

    for pg in &groups {
        assert_eq!(pg.get_group_name()?, "trainers");
        assert!(pg.is_initialized());
    }

    let results = on_each_rank(&groups, |pg| {
        let rank = pg.rank() as f32;

        let t = Tensor::from_vec(Device::CPU, vec![rank, 1.0]);
        pg.allreduce(&[t.clone()], &AllreduceOptions::default())
            .unwrap()
            .wait(WAIT)
            .unwrap();
        let summed = t.to_vec();

        let b = Tensor::from_vec(Device::CPU, vec![rank]);
        let opts = BroadcastOptions {
            root_rank: 3,
            root_tensor: 0,
        };
        pg.broadcast(&[b.clone()], &opts).unwrap().wait(WAIT).unwrap();

        let gathered = Tensor::zeros(Device::CPU, &[4]);
        let input = Tensor::from_vec(Device::CPU, vec![rank * 10.0]);
        pg.allgather_into_tensor(&gathered, &input, &AllgatherOptions::default())
            .unwrap()
            .wait(WAIT)
            .unwrap();

        let m = Tensor::from_vec(Device::CPU, vec![rank]);
        let opts = AllreduceOptions {
            reduce_op: ReduceOp::Max,
        };
        pg.allreduce(&[m.clone()], &opts).unwrap().wait(WAIT).unwrap();

        pg.barrier(&BarrierOptions::default())
            .unwrap()
            .wait(WAIT)
            .unwrap();

        (summed, b.to_vec(), gathered.to_vec(), m.to_vec())
    });

    for (summed, broadcast, gathered, max) in results {
        assert_eq!(summed, vec![6.0, 4.0]);
        assert_eq!(broadcast, vec![3.0]);
        assert_eq!(gathered, vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(max, vec![3.0]);
    }
    Ok(())
}

#[tokio::test]
async fn test_ring_send_recv() -> anyhow::Result<()> {
    let groups = build_groups(3, "cpu:local").await?;

    let received = on_each_rank(&groups, |pg| {
        let size = pg.size();
        let rank = pg.rank();
        let next = (rank + 1) % size;
        let prev = (rank + size - 1) % size;

        let send = pg
            .send(&[Tensor::from_vec(Device::CPU, vec![rank as f32])], next, 0)
            .unwrap();
        let out = Tensor::zeros(Device::CPU, &[1]);
        let recv = pg.recv(&[out.clone()], prev, 0).unwrap();

        send.wait(WAIT).unwrap();
        recv.wait(WAIT).unwrap();
        assert_eq!(recv.op_type(), OpType::Recv);
        (rank, out.to_vec()[0])
    });

    for (rank, value) in received {
        assert_eq!(value as usize, (rank + 2) % 3);
    }
    Ok(())
}

#[tokio::test]
async fn test_release_makes_collectives_fail() -> anyhow::Result<()> {
    let groups = build_groups(1, "local").await?;
    let pg = &groups[0];
    assert!(pg.store().is_some());

    pg.release_resources();
    let err = pg
        .barrier(&BarrierOptions::default())
        .unwrap_err();
    assert_eq!(err, ProcessGroupError::Released);
    assert!(pg.get_group_name().is_err());
    Ok(())
}

#[tokio::test]
async fn test_unrouted_device_type() -> anyhow::Result<()> {
    let groups = build_groups(1, "local").await?;
    let gpu = Tensor::from_vec(Device::cuda(0), vec![1.0]);
    let err = groups[0]
        .allreduce(&[gpu], &AllreduceOptions::default())
        .unwrap_err();
    assert_eq!(err, ProcessGroupError::NoBackendType(DeviceType::Cuda));
    Ok(())
}
