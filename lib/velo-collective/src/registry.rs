// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Named backend factories and process-group bootstrap.
//!
//! A [`BackendRegistry`] maps a backend name to a factory and to the device
//! types it serves by default. [`BackendRegistry::init_process_group`] parses
//! the group's backend spec (`"gloo"` or `"cpu:gloo,cuda:nccl"`), constructs
//! each named backend once, attaches it for its device types, and initializes
//! the group.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::backend::{
    Backend, BackendError, BackendOptions, BackendType, resolve_backend_name_to_type,
};
use crate::backoff::{Backoff, RetryError, retry_with_backoff};
use crate::device::DeviceType;
use crate::process_group::{ProcessGroup, ProcessGroupError, ProcessGroupOptions};
use crate::store::Store;

/// Builds one rank's backend from `(store, rank, size, options)`.
pub type BackendFactory = Arc<
    dyn Fn(Arc<dyn Store>, usize, usize, BackendOptions) -> Result<Arc<dyn Backend>, BackendError>
        + Send
        + Sync,
>;

/// Errors returned by [`BackendRegistry`] and [`BackendSpec`] parsing.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The backend spec string is malformed.
    #[error("Invalid backend spec {spec:?}: {reason}")]
    InvalidSpec {
        /// Offending spec.
        spec: String,
        /// What was wrong.
        reason: String,
    },

    /// No factory is registered under the name.
    #[error("Backend not registered: {0}")]
    UnknownBackend(String),

    /// Two backend names of one spec resolve to the same backend type, so the
    /// group could hold only one of them.
    #[error("Backends {first} and {second} both resolve to backend type {backend_type}")]
    ConflictingBackendType {
        /// Name mentioned first.
        first: String,
        /// Name mentioned later.
        second: String,
        /// Type both resolve to.
        backend_type: BackendType,
    },

    /// The group timeout cannot be turned into a deadline.
    #[error("Timeout {0:?} is too large to schedule")]
    InvalidTimeout(Duration),

    /// A factory is already registered under the name.
    #[error("Backend already registered: {0}")]
    AlreadyRegistered(String),

    /// The factory failed, or kept failing transiently until the deadline.
    #[error("Failed to create backend {name} after {attempts} attempt(s): {source}")]
    Create {
        /// Backend name.
        name: String,
        /// Attempts made.
        attempts: usize,
        /// Error of the last attempt.
        #[source]
        source: BackendError,
    },

    /// The group rejected the configuration.
    #[error(transparent)]
    ProcessGroup(#[from] ProcessGroupError),
}

/// Which backend serves which device type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// One backend for all of its default device types, e.g. `"gloo"`.
    Single(String),
    /// Explicit assignments, e.g. `"cpu:gloo,cuda:nccl"`.
    PerDevice(Vec<(DeviceType, String)>),
}

impl BackendSpec {
    /// Backend names in first-mention order, each once.
    pub fn backend_names(&self) -> Vec<&str> {
        match self {
            BackendSpec::Single(name) => vec![name.as_str()],
            BackendSpec::PerDevice(entries) => {
                let mut names: Vec<&str> = Vec::new();
                for (_, name) in entries {
                    if !names.contains(&name.as_str()) {
                        names.push(name);
                    }
                }
                names
            }
        }
    }
}

impl FromStr for BackendSpec {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RegistryError::InvalidSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let spec = s.trim();
        if spec.is_empty() {
            return Err(invalid("empty"));
        }
        if !spec.contains(':') {
            return Ok(BackendSpec::Single(spec.to_string()));
        }

        let mut entries: Vec<(DeviceType, String)> = Vec::new();
        for pair in spec.split(',') {
            let Some((device, name)) = pair.split_once(':') else {
                return Err(invalid("expected <device>:<backend> pairs"));
            };
            let device: DeviceType = device
                .trim()
                .parse()
                .map_err(|_| invalid(&format!("unknown device type {:?}", device.trim())))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid("missing backend name"));
            }
            if entries.iter().any(|(d, _)| *d == device) {
                return Err(invalid(&format!("device type {device} listed twice")));
            }
            entries.push((device, name.to_string()));
        }
        Ok(BackendSpec::PerDevice(entries))
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSpec::Single(name) => f.write_str(name),
            BackendSpec::PerDevice(entries) => {
                let pairs: Vec<String> = entries
                    .iter()
                    .map(|(device, name)| format!("{device}:{name}"))
                    .collect();
                f.write_str(&pairs.join(","))
            }
        }
    }
}

struct RegistryEntry {
    factory: BackendFactory,
    device_types: Vec<DeviceType>,
}

/// Backend factories by name.
#[derive(Default)]
pub struct BackendRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, serving `device_types` when the spec names only the backend.
    pub fn register(
        &self,
        name: impl Into<String>,
        device_types: &[DeviceType],
        factory: BackendFactory,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }

        tracing::debug!(backend = %name, ?device_types, "backend factory registered");
        self.entries.insert(
            name,
            RegistryEntry {
                factory,
                device_types: device_types.to_vec(),
            },
        );
        Ok(())
    }

    /// `true` if a factory is registered under `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Default device types of `name`.
    pub fn device_types(&self, name: &str) -> Result<Vec<DeviceType>, RegistryError> {
        self.entries
            .get(name)
            .map(|entry| entry.device_types.clone())
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))
    }

    /// Expand a spec into `(device type, backend name)` assignments.
    ///
    /// Names that resolve to the same [`BackendType`] are rejected: the group
    /// keeps one instance per type and would route both to the first.
    pub fn assignments(&self, spec: &BackendSpec) -> Result<Vec<(DeviceType, String)>, RegistryError> {
        match spec {
            BackendSpec::Single(name) => Ok(self
                .device_types(name)?
                .into_iter()
                .map(|device| (device, name.clone()))
                .collect()),
            BackendSpec::PerDevice(entries) => {
                let mut types: HashMap<BackendType, &str> = HashMap::new();
                for (_, name) in entries {
                    if !self.is_registered(name) {
                        return Err(RegistryError::UnknownBackend(name.clone()));
                    }
                    let backend_type = resolve_backend_name_to_type(name);
                    match types.get(&backend_type) {
                        Some(&first) if first != name.as_str() => {
                            return Err(RegistryError::ConflictingBackendType {
                                first: first.to_string(),
                                second: name.clone(),
                                backend_type,
                            });
                        }
                        Some(_) => {}
                        None => {
                            types.insert(backend_type, name);
                        }
                    }
                }
                Ok(entries.clone())
            }
        }
    }

    fn factory(&self, name: &str) -> Result<BackendFactory, RegistryError> {
        self.entries
            .get(name)
            .map(|entry| entry.factory.clone())
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))
    }

    /// Build and initialize a group member from `options.backend`.
    ///
    /// Each distinct backend name is constructed once and attached for every
    /// device type assigned to it. Transient construction failures are retried
    /// with `backoff` until `options.timeout` elapses; any other failure
    /// aborts at once.
    pub async fn init_process_group(
        &self,
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        options: ProcessGroupOptions,
        group_name: &str,
        backoff: &mut dyn Backoff,
    ) -> Result<ProcessGroup, RegistryError> {
        let spec: BackendSpec = options.backend.parse()?;
        let assignments = self.assignments(&spec)?;
        let deadline = Instant::now()
            .checked_add(options.timeout)
            .ok_or(RegistryError::InvalidTimeout(options.timeout))?;

        let pg = ProcessGroup::new(store.clone(), rank, size, options.clone())?;

        let mut created: HashMap<String, Arc<dyn Backend>> = HashMap::new();
        for (device_type, name) in assignments {
            let backend = match created.get(&name) {
                Some(backend) => backend.clone(),
                None => {
                    let backend = self
                        .create(&name, &store, rank, size, &options, deadline, &mut *backoff)
                        .await?;
                    created.insert(name.clone(), backend.clone());
                    backend
                }
            };
            pg.set_backend(device_type, resolve_backend_name_to_type(&name), Some(backend))?;
        }

        pg.set_group_name(group_name);
        if !options.group_desc.is_empty() {
            pg.set_group_desc(&options.group_desc);
        }
        pg.init();

        tracing::info!(
            rank,
            size,
            spec = %spec,
            group = group_name,
            "process group initialized"
        );
        Ok(pg)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        name: &str,
        store: &Arc<dyn Store>,
        rank: usize,
        size: usize,
        options: &ProcessGroupOptions,
        deadline: Instant,
        backoff: &mut dyn Backoff,
    ) -> Result<Arc<dyn Backend>, RegistryError> {
        let factory = self.factory(name)?;
        let mut attempts = 0usize;

        let outcome = retry_with_backoff(backoff, deadline, || {
            attempts += 1;
            let factory = factory.clone();
            let store = store.clone();
            let backend_options = options.backend_options(name);
            async move {
                // only transient failures go back to the retry loop
                match factory(store, rank, size, backend_options) {
                    Err(err) if err.is_transient() => Err(err),
                    other => Ok(other),
                }
            }
        })
        .await;

        let create_error = |attempts, source| RegistryError::Create {
            name: name.to_string(),
            attempts,
            source,
        };
        match outcome {
            Ok(Ok(backend)) => {
                tracing::debug!(backend = name, rank, attempts, "backend created");
                Ok(backend)
            }
            Ok(Err(source)) => Err(create_error(attempts, source)),
            Err(RetryError::Deadline { attempts, last }) => Err(create_error(attempts, last)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendType;
    use crate::backend::local::LocalWorld;
    use crate::backoff::FixedBackoff;
    use crate::store::{HashStore, StoreError};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[rstest]
    #[case("gloo", BackendSpec::Single("gloo".into()))]
    #[case(" nccl ", BackendSpec::Single("nccl".into()))]
    #[case(
        "cpu:gloo,cuda:nccl",
        BackendSpec::PerDevice(vec![(DeviceType::Cpu, "gloo".into()), (DeviceType::Cuda, "nccl".into())])
    )]
    #[case("cuda: nccl", BackendSpec::PerDevice(vec![(DeviceType::Cuda, "nccl".into())]))]
    fn test_parse_spec(#[case] input: &str, #[case] expected: BackendSpec) {
        assert_eq!(input.parse::<BackendSpec>().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("cpu:gloo,nccl")]
    #[case("tpu:gloo")]
    #[case("cpu:")]
    #[case("cpu:gloo,cpu:mpi")]
    fn test_parse_spec_invalid(#[case] input: &str) {
        assert!(matches!(
            input.parse::<BackendSpec>(),
            Err(RegistryError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn test_spec_display_and_names() {
        let spec: BackendSpec = "cpu:gloo,cuda:nccl,hip:nccl".parse().unwrap();
        assert_eq!(spec.to_string(), "cpu:gloo,cuda:nccl,hip:nccl");
        assert_eq!(spec.backend_names(), vec!["gloo", "nccl"]);
    }

    #[test]
    fn test_register_twice() {
        let registry = BackendRegistry::new();
        let world = LocalWorld::new(1);
        registry
            .register("local", &[DeviceType::Cpu], world.factory())
            .unwrap();
        assert!(matches!(
            registry.register("local", &[DeviceType::Cpu], world.factory()),
            Err(RegistryError::AlreadyRegistered(_))
        ));
        assert_eq!(registry.names(), vec!["local".to_string()]);
        assert_eq!(registry.device_types("local").unwrap(), vec![DeviceType::Cpu]);
    }

    #[tokio::test]
    async fn test_init_process_group_local() -> anyhow::Result<()> {
        let registry = BackendRegistry::new();
        let world = LocalWorld::new(1);
        registry.register("local", &[DeviceType::Cpu, DeviceType::Meta], world.factory())?;

        let store = HashStore::new();
        let mut options = ProcessGroupOptions::new("local");
        options.group_desc = "unit".to_string();
        let mut backoff = FixedBackoff::new(Duration::from_millis(1));

        let pg = registry
            .init_process_group(store.clone(), 0, 1, options, "default_pg", &mut backoff)
            .await?;

        assert!(pg.is_initialized());
        assert_eq!(pg.get_group_name()?, "default_pg");
        assert_eq!(pg.get_group_desc(), "unit");
        assert_eq!(pg.backend_type(), BackendType::Custom);
        assert_eq!(pg.device_types(), vec![DeviceType::Cpu, DeviceType::Meta]);

        let cpu = pg.get_backend(DeviceType::Cpu)?;
        let meta = pg.get_backend(DeviceType::Meta)?;
        assert!(Arc::ptr_eq(&cpu, &meta));
        assert_eq!(cpu.group_desc(), "unit");
        assert!(store.check(&["local/0"])?);
        Ok(())
    }

    #[tokio::test]
    async fn test_init_retries_transient_failures() -> anyhow::Result<()> {
        let registry = BackendRegistry::new();
        let world = LocalWorld::new(1);
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = world.factory();
        let counter = calls.clone();
        let flaky: BackendFactory = Arc::new(
            move |store: Arc<dyn Store>, rank: usize, size: usize, options: BackendOptions| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(BackendError::Store(StoreError::Timeout {
                        keys: vec!["peer".into()],
                        timeout: Duration::from_millis(1),
                    }));
                }
                inner(store, rank, size, options)
            },
        );
        registry.register("flaky", &[DeviceType::Cpu], flaky)?;

        let mut backoff = FixedBackoff::new(Duration::from_millis(1));
        let pg = registry
            .init_process_group(
                HashStore::new(),
                0,
                1,
                ProcessGroupOptions::new("flaky"),
                "g",
                &mut backoff,
            )
            .await?;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(pg.has_backends());
        Ok(())
    }

    #[tokio::test]
    async fn test_init_fails_fast_on_permanent_error() {
        let registry = BackendRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let broken: BackendFactory = Arc::new(
            move |_store: Arc<dyn Store>, _rank: usize, _size: usize, _options: BackendOptions| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::InvalidArgument {
                    op: crate::OpType::Unknown,
                    reason: "bad device".into(),
                })
            },
        );
        registry.register("broken", &[DeviceType::Cpu], broken).unwrap();

        let mut backoff = FixedBackoff::new(Duration::from_millis(1));
        let err = registry
            .init_process_group(
                HashStore::new(),
                0,
                1,
                ProcessGroupOptions::new("broken"),
                "g",
                &mut backoff,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Create { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_backends_sharing_a_type_are_rejected() {
        let registry = BackendRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for (name, device) in [("alpha", DeviceType::Cpu), ("beta", DeviceType::Cuda)] {
            let inner = LocalWorld::new(1).factory();
            let counter = calls.clone();
            let counted: BackendFactory = Arc::new(
                move |store: Arc<dyn Store>, rank: usize, size: usize, options: BackendOptions| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    inner(store, rank, size, options)
                },
            );
            registry.register(name, &[device], counted).unwrap();
        }

        let mut backoff = FixedBackoff::new(Duration::from_millis(1));
        let err = registry
            .init_process_group(
                HashStore::new(),
                0,
                1,
                ProcessGroupOptions::new("cpu:alpha,cuda:beta"),
                "g",
                &mut backoff,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::ConflictingBackendType { ref first, ref second, backend_type: BackendType::Custom }
                if first == "alpha" && second == "beta"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // one custom name for several devices is fine
        let spec: BackendSpec = "cpu:alpha,cuda:alpha".parse().unwrap();
        assert_eq!(registry.assignments(&spec).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_init_rejects_unschedulable_timeout() {
        let registry = BackendRegistry::new();
        registry
            .register("local", &[DeviceType::Cpu], LocalWorld::new(1).factory())
            .unwrap();

        let mut options = ProcessGroupOptions::new("local");
        options.timeout = Duration::MAX;
        let mut backoff = FixedBackoff::new(Duration::from_millis(1));
        let err = registry
            .init_process_group(HashStore::new(), 0, 1, options, "g", &mut backoff)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTimeout(t) if t == Duration::MAX));
    }

    #[tokio::test]
    async fn test_init_unknown_backend() {
        let registry = BackendRegistry::new();
        let mut backoff = FixedBackoff::new(Duration::from_millis(1));
        let err = registry
            .init_process_group(
                HashStore::new(),
                0,
                1,
                ProcessGroupOptions::new("cpu:gloo"),
                "g",
                &mut backoff,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownBackend(name) if name == "gloo"));
    }
}
