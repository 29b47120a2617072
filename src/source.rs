// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! XIVE interrupt source: an array of ESB cells with trigger input lines and
//! a per-source memory-mapped ESB control window.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::bus::DeviceId;
use crate::bus::Suspendable;
use crate::esb::esb_eoi;
use crate::esb::esb_set;
use crate::esb::esb_trigger;
use crate::esb::EsbState;
use crate::router::XiveNotifier;
use crate::XiveError;

/// ESB MMIO page geometry: `1 << shift` bytes of window per source. The odd
/// shifts select the split layout with a dedicated trigger page in front of
/// the management page.
pub const XIVE_ESB_4K: u32 = 12;
pub const XIVE_ESB_4K_2PAGE: u32 = 13;
pub const XIVE_ESB_64K: u32 = 16;
pub const XIVE_ESB_64K_2PAGE: u32 = 17;

/// Source flag enabling EOI by store on the management page.
pub const XIVE_SRC_STORE_EOI: u64 = 1 << 0;

/// Sticky per-source flag tracking an asserted level line, stored above the
/// P/Q pair in the status byte.
const XIVE_STATUS_ASSERTED: u8 = 0x4;

// Management page offsets. Loads below 0x800 perform an EOI, loads on the
// get range return the raw P/Q pair and the four set ranges force it,
// returning the previous value. Stores below 0x400 trigger.
const ESB_STORE_TRIGGER_END: u64 = 0x3ff;
const ESB_LOAD_EOI_END: u64 = 0x7ff;
const ESB_STORE_EOI: u64 = 0x400;
const ESB_GET: u64 = 0x800;
const ESB_GET_END: u64 = 0xbff;
const ESB_SET_PQ_00: u64 = 0xc00;
const ESB_SET_PQ_END: u64 = 0xfff;

/// An interrupt source block. Each of the `nr_irqs` sources owns one ESB
/// cell plus a level/edge classification bit; accepted notifications are
/// forwarded to the fabric with the source number.
pub struct XiveSource {
    nr_irqs: u32,
    esb_shift: u32,
    flags: u64,
    status: Vec<u8>,
    lsi_map: Vec<u64>,
    xive: Arc<Mutex<dyn XiveNotifier>>,
}

/// Serialized form of the live [`XiveSource`] state. The LSI bitmap is
/// configuration but travels with the state so a restore cannot disagree
/// with it.
#[derive(Serialize, Deserialize)]
struct XiveSourceSnapshot {
    nr_irqs: u32,
    status: Vec<u8>,
    lsi_map: Vec<u64>,
}

impl XiveSource {
    /// Creates a source block of `nr_irqs` edge sources forwarding into
    /// `xive`. All cells start switched off; level classification is applied
    /// afterwards with [`XiveSource::set_irq_lsi`].
    pub fn new(
        nr_irqs: u32,
        esb_shift: u32,
        flags: u64,
        xive: Arc<Mutex<dyn XiveNotifier>>,
    ) -> Result<XiveSource, XiveError> {
        if nr_irqs == 0 {
            return Err(XiveError::NoIrqs);
        }
        if !matches!(
            esb_shift,
            XIVE_ESB_4K | XIVE_ESB_4K_2PAGE | XIVE_ESB_64K | XIVE_ESB_64K_2PAGE
        ) {
            return Err(XiveError::EsbShift(esb_shift));
        }

        Ok(XiveSource {
            nr_irqs,
            esb_shift,
            flags,
            status: vec![EsbState::Off as u8; nr_irqs as usize],
            lsi_map: vec![0; (nr_irqs as usize + 63) / 64],
            xive,
        })
    }

    /// Number of sources in this block.
    pub fn nr_irqs(&self) -> u32 {
        self.nr_irqs
    }

    /// Total length in bytes of the ESB MMIO window.
    pub fn esb_len(&self) -> u64 {
        (1u64 << self.esb_shift) * self.nr_irqs as u64
    }

    /// Classifies a source as level-sensitive. Configuration, not live
    /// interrupt state: reset does not clear it.
    pub fn set_irq_lsi(&mut self, srcno: u32) {
        assert!(srcno < self.nr_irqs);
        self.lsi_map[srcno as usize / 64] |= 1 << (srcno % 64);
    }

    pub fn irq_is_lsi(&self, srcno: u32) -> bool {
        assert!(srcno < self.nr_irqs);
        self.lsi_map[srcno as usize / 64] & (1 << (srcno % 64)) != 0
    }

    /// Raw P/Q pair of a source.
    pub fn esb_get(&self, srcno: u32) -> EsbState {
        assert!(srcno < self.nr_irqs);
        EsbState::from_pq(self.status[srcno as usize])
    }

    /// Forces the P/Q pair of a source, returning the previous state.
    pub fn esb_set(&mut self, srcno: u32, pq: EsbState) -> EsbState {
        assert!(srcno < self.nr_irqs);
        esb_set(&mut self.status[srcno as usize], pq)
    }

    /// Returns whether the event notification should be forwarded.
    fn lsi_trigger(&mut self, srcno: u32) -> bool {
        match self.esb_get(srcno) {
            EsbState::Reset => {
                self.esb_set(srcno, EsbState::Pending);
                true
            }
            _ => false,
        }
    }

    /// Returns whether the event notification should be forwarded.
    fn esb_do_trigger(&mut self, srcno: u32) -> bool {
        let signal = esb_trigger(&mut self.status[srcno as usize]);

        // Levels cannot queue multiple edges.
        if self.irq_is_lsi(srcno) && self.esb_get(srcno) == EsbState::Queued {
            warn!("XIVE: queued an event on LSI IRQ {}", srcno);
        }

        signal
    }

    /// Returns whether the event notification should be forwarded.
    fn esb_do_eoi(&mut self, srcno: u32) -> bool {
        let mut signal = esb_eoi(&mut self.status[srcno as usize]);

        // LSI sources do not set the Q bit but they can still be asserted,
        // in which case we should forward a new event notification.
        if self.irq_is_lsi(srcno) && self.status[srcno as usize] & XIVE_STATUS_ASSERTED != 0 {
            signal = self.lsi_trigger(srcno);
        }

        signal
    }

    /// Forward the source event notification to the fabric.
    fn notify(&self, srcno: u32) {
        self.xive.lock().unwrap().notify(srcno);
    }

    /// Trigger line input. Level sources track the line state in the sticky
    /// asserted flag; edge sources only react to an assert.
    pub fn set_irq(&mut self, srcno: u32, level: bool) {
        assert!(srcno < self.nr_irqs);

        let notify = if self.irq_is_lsi(srcno) {
            if level {
                self.status[srcno as usize] |= XIVE_STATUS_ASSERTED;
                self.lsi_trigger(srcno)
            } else {
                self.status[srcno as usize] &= !XIVE_STATUS_ASSERTED;
                false
            }
        } else if level {
            self.esb_do_trigger(srcno)
        } else {
            false
        };

        if notify {
            self.notify(srcno);
        }
    }

    /// Resets all live interrupt state: every P/Q pair to Off ("ints off"),
    /// asserted flags cleared. The LSI classification bitmap is preserved.
    pub fn reset(&mut self) {
        // Do not clear the LSI bitmap.
        self.status.fill(EsbState::Off as u8);
    }

    fn has_2page(&self) -> bool {
        self.esb_shift == XIVE_ESB_4K_2PAGE || self.esb_shift == XIVE_ESB_64K_2PAGE
    }

    /// In a two pages ESB MMIO setting, even page is the trigger page, odd
    /// page is for management.
    fn is_trigger_page(&self, addr: u64) -> bool {
        self.has_2page() && (addr >> (self.esb_shift - 1)) & 1 == 0
    }

    fn esb_read(&mut self, addr: u64) -> u64 {
        let offset = addr & 0xfff;
        let srcno = (addr >> self.esb_shift) as u32;

        if srcno >= self.nr_irqs {
            warn!("XIVE: invalid ESB load on IRQ {:#x}", srcno);
            return !0;
        }

        if self.is_trigger_page(addr) {
            warn!(
                "XIVE: invalid load on IRQ {} trigger page at {:#x}",
                srcno, addr
            );
            return !0;
        }

        match offset {
            0..=ESB_LOAD_EOI_END => {
                let signal = self.esb_do_eoi(srcno);

                // Forward the source event notification for routing.
                if signal {
                    self.notify(srcno);
                }
                signal as u64
            }
            ESB_GET..=ESB_GET_END => self.esb_get(srcno) as u64,
            ESB_SET_PQ_00..=ESB_SET_PQ_END => {
                let pq = EsbState::from_pq(((offset >> 8) & 0x3) as u8);
                self.esb_set(srcno, pq) as u64
            }
            _ => {
                warn!("XIVE: invalid ESB load addr {:#x}", offset);
                !0
            }
        }
    }

    fn esb_write(&mut self, addr: u64, _value: u64) {
        let offset = addr & 0xfff;
        let srcno = (addr >> self.esb_shift) as u32;

        if srcno >= self.nr_irqs {
            warn!("XIVE: invalid ESB store on IRQ {:#x}", srcno);
            return;
        }

        // In a two pages ESB MMIO setting, trigger page only triggers.
        let notify = if self.is_trigger_page(addr) {
            self.esb_do_trigger(srcno)
        } else {
            match offset {
                0..=ESB_STORE_TRIGGER_END => self.esb_do_trigger(srcno),
                ESB_STORE_EOI..=ESB_LOAD_EOI_END => {
                    if self.flags & XIVE_SRC_STORE_EOI == 0 {
                        warn!("XIVE: invalid Store EOI for IRQ {}", srcno);
                        return;
                    }
                    self.esb_do_eoi(srcno)
                }
                ESB_SET_PQ_00..=ESB_SET_PQ_END => {
                    let pq = EsbState::from_pq(((offset >> 8) & 0x3) as u8);
                    self.esb_set(srcno, pq);
                    false
                }
                _ => {
                    warn!("XIVE: invalid ESB write addr {:#x}", offset);
                    return;
                }
            }
        };

        // Forward the source event notification for routing.
        if notify {
            self.notify(srcno);
        }
    }
}

impl BusDevice for XiveSource {
    fn debug_label(&self) -> String {
        "XIVE interrupt source".to_string()
    }

    fn device_id(&self) -> DeviceId {
        DeviceId::Source
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 8 {
            warn!("XIVE: bad ESB load size {} at {}", data.len(), info);
            data.fill(0xff);
            return;
        }
        let ret = self.esb_read(info.offset);
        data.copy_from_slice(&ret.to_be_bytes());
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if data.len() != 8 {
            warn!("XIVE: bad ESB store size {} at {}", data.len(), info);
            return;
        }
        let mut value = [0u8; 8];
        value.copy_from_slice(data);
        self.esb_write(info.offset, u64::from_be_bytes(value));
    }
}

impl Suspendable for XiveSource {
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        serde_json::to_value(XiveSourceSnapshot {
            nr_irqs: self.nr_irqs,
            status: self.status.clone(),
            lsi_map: self.lsi_map.clone(),
        })
        .context("failed serializing XiveSource")
    }

    fn restore(&mut self, data: serde_json::Value) -> anyhow::Result<()> {
        let snap: XiveSourceSnapshot =
            serde_json::from_value(data).context("failed to deserialize XiveSource snapshot")?;
        if snap.nr_irqs != self.nr_irqs {
            return Err(anyhow::anyhow!(
                "XiveSource snapshot has {} sources, expected {}",
                snap.nr_irqs,
                self.nr_irqs
            ));
        }
        self.status = snap.status;
        self.lsi_map = snap.lsi_map;
        Ok(())
    }
}
