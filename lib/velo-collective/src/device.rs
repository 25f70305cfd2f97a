// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device identity used as the routing key of a process group.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Family of device an operand lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum DeviceType {
    Cpu,
    Cuda,
    Hip,
    Xpu,
    Mlu,
    Meta,
    /// Out-of-tree accelerator registered by an extension.
    #[serde(rename = "privateuseone")]
    PrivateUse1,
}

impl DeviceType {
    /// Lower-case name, as accepted in backend specs (`"cuda:nccl"`).
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::Hip => "hip",
            DeviceType::Xpu => "xpu",
            DeviceType::Mlu => "mlu",
            DeviceType::Meta => "meta",
            DeviceType::PrivateUse1 => "privateuseone",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized device name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device type: {0:?}")]
pub struct UnknownDeviceType(pub String);

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" => Ok(DeviceType::Cuda),
            "hip" => Ok(DeviceType::Hip),
            "xpu" => Ok(DeviceType::Xpu),
            "mlu" => Ok(DeviceType::Mlu),
            "meta" => Ok(DeviceType::Meta),
            "privateuseone" => Ok(DeviceType::PrivateUse1),
            other => Err(UnknownDeviceType(other.to_string())),
        }
    }
}

/// A device type plus an optional ordinal (`cuda:1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    device_type: DeviceType,
    index: Option<u16>,
}

impl Device {
    /// Host memory.
    pub const CPU: Device = Device::new(DeviceType::Cpu);

    /// Device without an ordinal.
    pub const fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            index: None,
        }
    }

    /// Device with an explicit ordinal.
    pub const fn with_index(device_type: DeviceType, index: u16) -> Self {
        Self {
            device_type,
            index: Some(index),
        }
    }

    /// Shorthand for `cuda:<index>`.
    pub const fn cuda(index: u16) -> Self {
        Self::with_index(DeviceType::Cuda, index)
    }

    /// The family of this device.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// The ordinal, if any.
    pub fn index(&self) -> Option<u16> {
        self.index
    }
}

impl From<DeviceType> for Device {
    fn from(device_type: DeviceType) -> Self {
        Device::new(device_type)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{}", self.device_type, index),
            None => write!(f, "{}", self.device_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_names_roundtrip() {
        for dt in [
            DeviceType::Cpu,
            DeviceType::Cuda,
            DeviceType::Hip,
            DeviceType::Xpu,
            DeviceType::Mlu,
            DeviceType::Meta,
            DeviceType::PrivateUse1,
        ] {
            assert_eq!(dt.as_str().parse::<DeviceType>(), Ok(dt));
        }
        assert!("CUDA".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::cuda(3).to_string(), "cuda:3");
        assert_eq!(Device::CPU.to_string(), "cpu");
        assert_eq!(Device::from(DeviceType::Mlu).index(), None);
    }
}
