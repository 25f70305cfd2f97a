// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Operand handle passed through collectives.
//!
//! A [`Tensor`] is a cheap, cloneable reference to shared storage, so a backend
//! can keep a clone inside a pending work item and write results into it after
//! the issuing call has returned.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::Device;

/// Shared `f32` buffer tagged with the device it lives on.
#[derive(Clone)]
pub struct Tensor {
    device: Device,
    shape: Vec<usize>,
    storage: Arc<RwLock<Vec<f32>>>,
}

impl Tensor {
    /// Wrap `data` with the given shape.
    ///
    /// # Panics
    ///
    /// If the shape does not describe `data.len()` elements.
    pub fn new(device: Device, data: Vec<f32>, shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            numel,
            data.len(),
            "shape {shape:?} does not match {} elements",
            data.len()
        );
        Self {
            device,
            shape: shape.to_vec(),
            storage: Arc::new(RwLock::new(data)),
        }
    }

    /// One-dimensional tensor over `data`.
    pub fn from_vec(device: Device, data: Vec<f32>) -> Self {
        let len = data.len();
        Self::new(device, data, &[len])
    }

    /// Zero-filled tensor.
    pub fn zeros(device: Device, shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self::new(device, vec![0.0; numel], shape)
    }

    /// Device the storage lives on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Dimensions.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.storage.read().len()
    }

    /// Copy of the contents.
    pub fn to_vec(&self) -> Vec<f32> {
        self.storage.read().clone()
    }

    /// Overwrite the prefix of the storage with `src`.
    pub fn copy_from_slice(&self, src: &[f32]) {
        let mut guard = self.storage.write();
        let n = src.len().min(guard.len());
        guard[..n].copy_from_slice(&src[..n]);
    }

    /// `true` if both handles point at the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("device", &self.device)
            .field("shape", &self.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_storage() {
        let t = Tensor::from_vec(Device::CPU, vec![1.0, 2.0, 3.0]);
        let alias = t.clone();
        alias.copy_from_slice(&[9.0]);
        assert_eq!(t.to_vec(), vec![9.0, 2.0, 3.0]);
        assert!(t.shares_storage(&alias));
    }

    #[test]
    fn test_zeros_shape() {
        let t = Tensor::zeros(Device::cuda(0), &[2, 3]);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.device(), Device::cuda(0));
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn test_shape_mismatch_panics() {
        Tensor::new(Device::CPU, vec![1.0; 5], &[2, 3]);
    }
}
