// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MMIO plumbing shared by the XIVE register windows.

use std::fmt;

use anyhow::anyhow;

use serde::Deserialize;
use serde::Serialize;

/// Information about how a device was accessed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct BusAccessInfo {
    /// Offset from base address that the device was accessed at.
    pub offset: u64,
    /// Absolute address of the device's access in its address space.
    pub address: u64,
    /// ID of the entity requesting a device access, usually the VCPU id.
    pub id: usize,
}

impl fmt::Display for BusAccessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Unique id per device type suitable for debug output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceId {
    /// Interrupt source ESB window.
    Source,
    /// Event queue ESn/ESe ESB window.
    EqSource,
    /// Thread interrupt management area.
    Tima,
}

/// This trait provides the functions required for a device to save and
/// restore its state.
pub trait Suspendable {
    /// Save the device state in an image that can be restored.
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        Err(anyhow!(
            "Suspendable::snapshot not implemented for {}",
            std::any::type_name::<Self>()
        ))
    }

    /// Load a saved snapshot of an image.
    fn restore(&mut self, _data: serde_json::Value) -> anyhow::Result<()> {
        Err(anyhow!(
            "Suspendable::restore not implemented for {}",
            std::any::type_name::<Self>()
        ))
    }
}

/// Trait for devices that respond to reads or writes in an arbitrary address
/// space.
///
/// The device does not care where it exists in address space as each method
/// is only given an offset into its allocated portion of address space. All
/// XIVE windows are big-endian.
#[allow(unused_variables)]
pub trait BusDevice: Send + Suspendable {
    /// Returns a label suitable for debug output.
    fn debug_label(&self) -> String;

    /// Returns a unique id per device type suitable for debug output.
    fn device_id(&self) -> DeviceId;

    /// Reads at `offset` from this device.
    fn read(&mut self, offset: BusAccessInfo, data: &mut [u8]) {}

    /// Writes at `offset` into this device.
    fn write(&mut self, offset: BusAccessInfo, data: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_info_display() {
        let info = BusAccessInfo {
            offset: 0x800,
            address: 0x3006_0800,
            id: 1,
        };
        let s = format!("{}", info);
        assert!(s.contains("0x800") || s.contains("2048"));
    }
}
