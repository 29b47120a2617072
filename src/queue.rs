// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! XIVE event queues.
//!
//! An event queue is a circular, generation-tagged ring of 4-byte entries in
//! guest memory, one per notification destination. The descriptor tracks the
//! write index and generation bit plus two ESB sub-states: ESn coalesces
//! notifications towards the presenter, ESe tracks escalation (modeled but
//! never driven to completion).

use std::result;
use std::sync::Arc;
use std::sync::Mutex;

use log::error;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::bus::DeviceId;
use crate::bus::Suspendable;
use crate::esb::EsbState;
use crate::router::XiveRouter;
use crate::source::XIVE_ESB_4K;
use crate::source::XIVE_ESB_64K;
use crate::XiveError;

/// Guest memory write failure, reported synchronously to the queue push.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GuestMemoryError {
    #[error("invalid guest address {0:#x}")]
    InvalidGuestAddress(u64),
}

/// Seam through which the event queue writes ring entries at guest physical
/// addresses. Collaborators implement the actual storage.
pub trait GuestMemory: Send {
    fn write(&mut self, addr: u64, data: &[u8]) -> result::Result<(), GuestMemoryError>;
}

/// An event queue descriptor. Stored whole in the backing store and mutated
/// with a read-modify-write of the full record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XiveEq {
    pub valid: bool,
    /// Entries are enqueued to guest memory only when set.
    pub enqueue: bool,
    /// Skip ESn coalescing and always notify the presenter.
    pub ucond_notify: bool,
    /// Queue capacity is `1 << (qsize + 10)` entries.
    pub qsize: u8,
    /// Guest physical address of the ring.
    pub qaddr: u64,
    /// Current write index.
    pub qindex: u32,
    /// Generation bit, toggled on each wraparound.
    pub qgen: u8,
    /// Notification coalescing sub-state.
    pub esn: EsbState,
    /// Escalation sub-state. Tracked and guest visible, never driven.
    pub ese: EsbState,
    /// Destination virtual processor.
    pub vp_blk: u8,
    pub vp_idx: u32,
    /// 0: VP notification carrying a priority; 1: user-level event-based
    /// branch notification carrying a logical server id.
    pub format: u8,
    /// Ignore low-order VP id bits (logical server matching, unsupported).
    pub ignore: bool,
    pub priority: u8,
    pub logic_serv: u32,
}

impl XiveEq {
    /// Queue capacity in entries, a power of two fixed by the size class.
    pub fn capacity(&self) -> u32 {
        1 << (self.qsize as u32 + 10)
    }

    /// Appends `data` to the ring. On success the write index advances,
    /// flipping the generation bit on wraparound; a failed guest-memory
    /// write leaves both untouched so an unwritten entry is never exposed
    /// as consumed.
    pub fn push(&mut self, mem: &mut dyn GuestMemory, data: u32) {
        let qaddr = self.qaddr + ((self.qindex as u64) << 2);
        let qdata = ((self.qgen as u32) << 31) | (data & 0x7fff_ffff);

        if let Err(e) = mem.write(qaddr, &qdata.to_be_bytes()) {
            error!("XIVE: failed to write EQ data @{:#x}: {}", qaddr, e);
            return;
        }

        self.qindex = (self.qindex + 1) % self.capacity();
        if self.qindex == 0 {
            self.qgen ^= 1;
        }
    }

    /// Reset state: everything cleared with the notification and escalation
    /// ESBs switched off.
    pub fn reset(&mut self) {
        *self = XiveEq {
            esn: EsbState::Off,
            ese: EsbState::Off,
            ..Default::default()
        };
    }
}

/// Memory-mapped ESB window over the event queue ESn/ESe sub-states. Each
/// queue is assigned an even/odd pair of pages: the even page manages ESn,
/// the odd page ESe. The window is load-only.
pub struct XiveEqSource {
    nr_eqs: u32,
    esb_shift: u32,
    router: Arc<Mutex<XiveRouter>>,
}

impl XiveEqSource {
    pub fn new(
        nr_eqs: u32,
        esb_shift: u32,
        router: Arc<Mutex<XiveRouter>>,
    ) -> Result<XiveEqSource, XiveError> {
        if nr_eqs == 0 {
            return Err(XiveError::NoEqs);
        }
        if !matches!(esb_shift, XIVE_ESB_4K | XIVE_ESB_64K) {
            return Err(XiveError::EsbShift(esb_shift));
        }

        Ok(XiveEqSource {
            nr_eqs,
            esb_shift,
            router,
        })
    }

    /// Total length in bytes of the window: one page pair per queue.
    pub fn esb_len(&self) -> u64 {
        (1u64 << (self.esb_shift + 1)) * self.nr_eqs as u64
    }

    fn esb_read(&mut self, addr: u64) -> u64 {
        let offset = addr & 0xfff;
        let eq_idx = (addr >> (self.esb_shift + 1)) as u32;

        if eq_idx >= self.nr_eqs {
            warn!("XIVE: invalid EQ ESB load on EQ {:#x}", eq_idx);
            return !0;
        }

        let mut router = self.router.lock().unwrap();
        let eq_blk = router.chip_id();
        let mut eq = match router.get_eq(eq_blk, eq_idx) {
            Some(eq) => eq,
            None => {
                error!("XIVE: no EQ {:x}/{:x}", eq_blk, eq_idx);
                return !0;
            }
        };

        if !eq.valid {
            error!("XIVE: EQ {:x}/{:x} is invalid", eq_blk, eq_idx);
            return !0;
        }

        // Even page: ESn. Odd page: ESe.
        let is_esn = (addr >> self.esb_shift) & 1 == 0;
        let pq = if is_esn { eq.esn } else { eq.ese };

        let (next, ret) = match offset {
            0x000..=0x7ff => {
                let (next, signal) = pq.eoi();
                (next, signal as u64)
            }
            0x800..=0xbff => (pq, pq as u64),
            0xc00..=0xfff => (EsbState::from_pq(((offset >> 8) & 0x3) as u8), pq as u64),
            _ => {
                warn!("XIVE: invalid EQ ESB load addr {:#x}", offset);
                return !0;
            }
        };

        if next != pq {
            if is_esn {
                eq.esn = next;
            } else {
                eq.ese = next;
            }
            router.set_eq(eq_blk, eq_idx, eq);
        }

        ret
    }
}

impl BusDevice for XiveEqSource {
    fn debug_label(&self) -> String {
        "XIVE event queue ESB".to_string()
    }

    fn device_id(&self) -> DeviceId {
        DeviceId::EqSource
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 8 {
            warn!("XIVE: bad EQ ESB load size {} at {}", data.len(), info);
            data.fill(0xff);
            return;
        }
        let ret = self.esb_read(info.offset);
        data.copy_from_slice(&ret.to_be_bytes());
    }

    /// EQ ESB MMIO stores are invalid.
    fn write(&mut self, info: BusAccessInfo, _data: &[u8]) {
        warn!("XIVE: invalid EQ ESB write addr {:#x}", info.offset);
    }
}

impl Suspendable for XiveEqSource {
    // The window itself is stateless; the descriptors live in the router's
    // backing store.
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn restore(&mut self, _data: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Guest RAM stub keeping 4-byte cells, with a programmable failure
    /// window.
    #[derive(Default)]
    pub(crate) struct TestRam {
        pub cells: BTreeMap<u64, u32>,
        pub failing: bool,
    }

    impl GuestMemory for TestRam {
        fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
            if self.failing {
                return Err(GuestMemoryError::InvalidGuestAddress(addr));
            }
            let mut word = [0u8; 4];
            word.copy_from_slice(data);
            self.cells.insert(addr, u32::from_be_bytes(word));
            Ok(())
        }
    }

    fn small_eq() -> XiveEq {
        XiveEq {
            valid: true,
            enqueue: true,
            qsize: 0, // 1024 entries
            qaddr: 0x1000,
            esn: EsbState::Reset,
            ese: EsbState::Off,
            ..Default::default()
        }
    }

    #[test]
    fn push_encodes_generation_and_data() {
        let mut ram = TestRam::default();
        let mut eq = small_eq();

        eq.push(&mut ram, 0x1234);
        assert_eq!(ram.cells[&0x1000], 0x1234);
        assert_eq!(eq.qindex, 1);

        eq.qgen = 1;
        eq.push(&mut ram, 0xffff_ffff);
        // The generation bit occupies the top bit of the entry.
        assert_eq!(ram.cells[&0x1004], 0x8000_0000 | 0x7fff_ffff);
        assert_eq!(eq.qindex, 2);
    }

    #[test]
    fn push_round_trip_flips_generation_once() {
        let mut ram = TestRam::default();
        let mut eq = small_eq();
        let n = eq.capacity();

        for _ in 0..n {
            eq.push(&mut ram, 0);
        }
        assert_eq!(eq.qindex, 0);
        assert_eq!(eq.qgen, 1);

        // One more push starts the next lap without touching the generation.
        eq.push(&mut ram, 0);
        assert_eq!(eq.qindex, 1);
        assert_eq!(eq.qgen, 1);
    }

    #[test]
    fn failed_push_does_not_advance() {
        let mut ram = TestRam {
            failing: true,
            ..Default::default()
        };
        let mut eq = small_eq();

        eq.push(&mut ram, 0x1);
        assert_eq!(eq.qindex, 0);
        assert_eq!(eq.qgen, 0);
        assert!(ram.cells.is_empty());
    }

    #[test]
    fn reset_switches_esbs_off() {
        let mut eq = small_eq();
        eq.qindex = 5;
        eq.reset();
        assert_eq!(eq, XiveEq::default());
        assert_eq!(eq.esn, EsbState::Off);
        assert_eq!(eq.ese, EsbState::Off);
    }
}
