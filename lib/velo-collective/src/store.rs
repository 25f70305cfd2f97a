// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous key-value store.
//!
//! The process group only holds a shared reference to a store and drops it on
//! release; backends use it for peer discovery. [`HashStore`] serves a single
//! process, [`PrefixStore`] namespaces one store between several groups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

/// Errors returned by [`Store`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The keys did not all appear before the timeout.
    #[error("timed out after {timeout:?} waiting for keys {keys:?}")]
    Timeout {
        /// Keys still missing.
        keys: Vec<String>,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// `add` was applied to a value that is not a decimal integer.
    #[error("value of key {0:?} is not an integer")]
    NotAnInteger(String),
}

/// Shared key-value store used for rendezvous.
pub trait Store: Send + Sync {
    /// Set `key` to `value`, waking any waiter.
    fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    /// Get `key`, waiting up to [`timeout`](Self::timeout) for it to appear.
    fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Atomically add `delta` to the integer at `key` (missing = 0); returns the new value.
    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// `true` if every key is present, without waiting.
    fn check(&self, keys: &[&str]) -> Result<bool, StoreError>;

    /// Remove `key`; returns whether it existed.
    fn delete_key(&self, key: &str) -> Result<bool, StoreError>;

    /// Number of keys currently stored.
    fn num_keys(&self) -> Result<usize, StoreError>;

    /// Wait until every key is present or `timeout` elapses.
    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<(), StoreError>;

    /// Default timeout for blocking reads.
    fn timeout(&self) -> Duration;
}

/// In-process [`Store`] backed by a map and a condition variable.
pub struct HashStore {
    map: Mutex<HashMap<String, Bytes>>,
    cond: Condvar,
    timeout: Duration,
}

impl HashStore {
    /// Default blocking-read timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Empty store with the default timeout.
    pub fn new() -> Arc<Self> {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// Empty store with an explicit blocking-read timeout.
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            timeout,
        })
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.map.lock().insert(key.to_string(), value);
        self.cond.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.wait(&[key], self.timeout)?;
        self.map
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::Timeout {
                keys: vec![key.to_string()],
                timeout: self.timeout,
            })
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut map = self.map.lock();
        let current = match map.get(key) {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))?,
            None => 0,
        };
        let next = current + delta;
        map.insert(key.to_string(), Bytes::from(next.to_string()));
        drop(map);

        self.cond.notify_all();
        Ok(next)
    }

    fn check(&self, keys: &[&str]) -> Result<bool, StoreError> {
        let map = self.map.lock();
        Ok(keys.iter().all(|key| map.contains_key(*key)))
    }

    fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.map.lock().remove(key).is_some())
    }

    fn num_keys(&self) -> Result<usize, StoreError> {
        Ok(self.map.lock().len())
    }

    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;
        let mut map = self.map.lock();

        loop {
            let missing: Vec<String> = keys
                .iter()
                .filter(|key| !map.contains_key(**key))
                .map(|key| key.to_string())
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            if self.cond.wait_until(&mut map, deadline).timed_out() {
                let still_missing = missing.iter().any(|key| !map.contains_key(key));
                if still_missing {
                    return Err(StoreError::Timeout {
                        keys: missing,
                        timeout,
                    });
                }
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Wraps another store and prefixes every key with `"<prefix>/"`.
pub struct PrefixStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

impl PrefixStore {
    /// Namespace `inner` under `prefix`.
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            inner,
        })
    }

    /// The wrapped store.
    pub fn underlying(&self) -> &Arc<dyn Store> {
        &self.inner
    }

    fn join(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

impl Store for PrefixStore {
    fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.inner.set(&self.join(key), value)
    }

    fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.inner.get(&self.join(key))
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.inner.add(&self.join(key), delta)
    }

    fn check(&self, keys: &[&str]) -> Result<bool, StoreError> {
        let joined: Vec<String> = keys.iter().map(|key| self.join(key)).collect();
        let refs: Vec<&str> = joined.iter().map(String::as_str).collect();
        self.inner.check(&refs)
    }

    fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete_key(&self.join(key))
    }

    fn num_keys(&self) -> Result<usize, StoreError> {
        self.inner.num_keys()
    }

    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<(), StoreError> {
        let joined: Vec<String> = keys.iter().map(|key| self.join(key)).collect();
        let refs: Vec<&str> = joined.iter().map(String::as_str).collect();
        self.inner.wait(&refs, timeout)
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }
}
