// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! XIVE thread interrupt management context.
//!
//! One [`XiveTctx`] exists per CPU thread. It holds four stacked privilege
//! rings of byte registers and drives the thread's external interrupt line
//! from the priority comparison between the pending interrupt priority (PIPR)
//! and the current priority mask (CPPR).
//!
//! The thread interrupt management area (TIMA) gives memory-mapped access to
//! the register file through four page views of decreasing privilege. The
//! region below 2K of each page reads and writes raw register values filtered
//! by per-page access maps; the region above 2K aliases specific offsets to
//! side-effecting operations.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
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
use crate::router::XiveRouter;

/// TIMA page size shift: four pages of 4K.
pub const TM_SHIFT: u32 = 12;

/// Ring base offsets in the register file, least privileged first.
pub const TM_QW0_USER: usize = 0x0;
pub const TM_QW1_OS: usize = 0x10;
pub const TM_QW2_HV_POOL: usize = 0x20;
pub const TM_QW3_HV_PHYS: usize = 0x30;

pub const TM_RING_COUNT: usize = 4;
pub const TM_RING_SIZE: usize = 0x10;

/// Byte registers within each ring.
pub const TM_NSR: usize = 0x0;
pub const TM_CPPR: usize = 0x1;
pub const TM_IPB: usize = 0x2;
pub const TM_LSMFB: usize = 0x3;
pub const TM_ACK_CNT: usize = 0x4;
pub const TM_INC: usize = 0x5;
pub const TM_AGE: usize = 0x6;
pub const TM_PIPR: usize = 0x7;
/// Big-endian CAM word identifying the dispatched virtual processor.
pub const TM_WORD2: usize = 0x8;

/// OS ring NSR exception-pending bit.
const TM_QW1_NSR_EO: u8 = 0x80;

/// WORD2 valid bits and CAM fields per ring.
pub const TM_QW0W2_VU: u32 = 0x8000_0000;
pub const TM_QW0W2_LOGIC_SERV: u32 = 0x00ff_ffff;
pub const TM_QW1W2_VO: u32 = 0x8000_0000;
pub const TM_QW1W2_OS_CAM: u32 = 0x00ff_ffff;
pub const TM_QW2W2_VP: u32 = 0x8000_0000;
pub const TM_QW2W2_POOL_CAM: u32 = 0x00ff_ffff;
pub const TM_QW3W2_VT: u32 = 0x8000_0000;

/// Highest priority number (numerically lowest priorities are most favored).
pub const XIVE_PRIORITY_MAX: u8 = 7;

// TIMA page views, most privileged first.
const TM_HW_PAGE: u8 = 0x0;
const TM_HV_PAGE: u8 = 0x1;
const TM_OS_PAGE: u8 = 0x2;
const TM_USER_PAGE: u8 = 0x3;

// Side-effecting operations in the region above 2K of each page.
const TM_SPC_ACK_OS_REG: u64 = 0xac0;
const TM_SPC_SET_OS_PENDING: u64 = 0xa00;

/// Converts a priority number to an Interrupt Pending Buffer (IPB) register,
/// which indicates a pending interrupt at the priority corresponding to the
/// bit number.
pub(crate) fn priority_to_ipb(priority: u8) -> u8 {
    if priority > XIVE_PRIORITY_MAX {
        0
    } else {
        1 << (XIVE_PRIORITY_MAX - priority)
    }
}

/// Converts an IPB register to a Pending Interrupt Priority Register (PIPR),
/// which contains the priority of the most favored pending notification.
pub(crate) fn ipb_to_pipr(ipb: u8) -> u8 {
    if ipb != 0 {
        ((ipb as u32) << 24).leading_zeros() as u8
    } else {
        0xff
    }
}

/// A privilege ring of the thread interrupt context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ring {
    User = TM_QW0_USER as isize,
    Os = TM_QW1_OS as isize,
    HvPool = TM_QW2_HV_POOL as isize,
    HvPhys = TM_QW3_HV_PHYS as isize,
}

impl Ring {
    /// Base offset of this ring in the register file.
    pub fn offset(self) -> usize {
        self as usize
    }
}

fn exception_mask(ring: Ring) -> u8 {
    match ring {
        Ring::Os => TM_QW1_NSR_EO,
        // Exception delivery is only modeled for the OS ring.
        _ => unreachable!("no exception mask for ring {:?}", ring),
    }
}

/// External interrupt line of a CPU thread. Cloned handles share the
/// asserted state so collaborators can watch the line the context drives.
#[derive(Clone, Debug, Default)]
pub struct IrqLine {
    asserted: Arc<AtomicBool>,
}

impl IrqLine {
    pub fn new() -> IrqLine {
        Default::default()
    }

    pub fn raise(&self) {
        self.asserted.store(true, Ordering::SeqCst);
    }

    pub fn lower(&self) {
        self.asserted.store(false, Ordering::SeqCst);
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted.load(Ordering::SeqCst)
    }
}

/// Per-thread interrupt context register file.
pub struct XiveTctx {
    regs: [u8; TM_RING_COUNT * TM_RING_SIZE],
    output: IrqLine,
    chip_id: u8,
    tid: u8,
}

impl XiveTctx {
    /// Creates the context of a CPU thread. `chip_id` and `tid` form the
    /// hardware CAM identity compared by the presenter on the physical ring;
    /// `output` is the thread's external interrupt line.
    pub fn new(chip_id: u8, tid: u8, output: IrqLine) -> XiveTctx {
        let mut tctx = XiveTctx {
            regs: [0; TM_RING_COUNT * TM_RING_SIZE],
            output,
            chip_id,
            tid,
        };
        tctx.reset();
        tctx
    }

    /// Machine reset. Clears everything, then presets the OS ring the way
    /// the hardware comes up: LSMFB/ACK#/AGE parked at 0xFF and PIPR
    /// recomputed from the empty IPB so no phantom interrupt fires when the
    /// CPPR is first set.
    pub fn reset(&mut self) {
        self.regs = [0; TM_RING_COUNT * TM_RING_SIZE];

        self.regs[TM_QW1_OS + TM_LSMFB] = 0xff;
        self.regs[TM_QW1_OS + TM_ACK_CNT] = 0xff;
        self.regs[TM_QW1_OS + TM_AGE] = 0xff;
        self.regs[TM_QW1_OS + TM_PIPR] = ipb_to_pipr(self.regs[TM_QW1_OS + TM_IPB]);
    }

    pub fn output(&self) -> &IrqLine {
        &self.output
    }

    /// One register byte, by ring and register offset.
    pub fn reg(&self, ring: Ring, reg: usize) -> u8 {
        self.regs[ring.offset() + reg]
    }

    /// The big-endian CAM word of a ring.
    pub fn word2(&self, ring: Ring) -> u32 {
        let base = ring.offset() + TM_WORD2;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.regs[base..base + 4]);
        u32::from_be_bytes(word)
    }

    pub fn set_word2(&mut self, ring: Ring, w2: u32) {
        let base = ring.offset() + TM_WORD2;
        self.regs[base..base + 4].copy_from_slice(&w2.to_be_bytes());
    }

    /// Programs the OS CAM word for a dispatched virtual processor, as the
    /// hypervisor does when scheduling a VP onto this thread.
    pub fn set_os_cam(&mut self, vp_blk: u8, vp_idx: u32) {
        self.set_word2(Ring::Os, TM_QW1W2_VO | cam_line(vp_blk, vp_idx));
    }

    /// The hardware CAM line compared on the physical ring.
    pub fn hw_cam(&self, block_group: bool) -> u32 {
        hw_cam_line(block_group, self.chip_id, self.tid)
    }

    /// Merges a priority into the ring's IPB and recomputes PIPR.
    pub fn ipb_update(&mut self, ring: Ring, priority: u8) {
        let base = ring.offset();
        self.regs[base + TM_IPB] |= priority_to_ipb(priority);
        self.regs[base + TM_PIPR] = ipb_to_pipr(self.regs[base + TM_IPB]);
    }

    /// Raises the exception line if a pending interrupt is more favored than
    /// the current priority mask. Idempotent.
    pub fn notify(&mut self, ring: Ring) {
        let base = ring.offset();
        if self.regs[base + TM_PIPR] < self.regs[base + TM_CPPR] {
            self.regs[base + TM_NSR] |= exception_mask(ring);
            self.output.raise();
        }
    }

    /// Sets the ring's priority mask, clamping invalid values to fully
    /// masked, and re-evaluates the pending exception.
    pub fn set_cppr(&mut self, ring: Ring, cppr: u8) {
        let cppr = if cppr > XIVE_PRIORITY_MAX { 0xff } else { cppr };

        self.regs[ring.offset() + TM_CPPR] = cppr;

        // CPPR has changed, check if we need to raise a pending exception.
        self.notify(ring);
    }

    /// Guest acknowledgment of the next pending interrupt. Accepting raises
    /// the thread's own priority floor to the accepted priority. The output
    /// line is always lowered, even on a spurious read. Returns the old NSR
    /// and the resulting CPPR packed for a 2-byte load.
    pub fn accept(&mut self, ring: Ring) -> u64 {
        let base = ring.offset();
        let nsr = self.regs[base + TM_NSR];
        let mask = exception_mask(ring);

        self.output.lower();

        if self.regs[base + TM_NSR] & mask != 0 {
            let cppr = self.regs[base + TM_PIPR];

            self.regs[base + TM_CPPR] = cppr;

            // Reset the pending buffer bit.
            self.regs[base + TM_IPB] &= !priority_to_ipb(cppr);
            self.regs[base + TM_PIPR] = ipb_to_pipr(self.regs[base + TM_IPB]);

            // Drop the exception bit.
            self.regs[base + TM_NSR] &= !mask;
        }

        ((nsr as u64) << 8) | self.regs[base + TM_CPPR] as u64
    }

    /// Adjusts the IPB to allow a CPU to process event queues of other
    /// priorities during one physical interrupt cycle.
    pub fn set_pending(&mut self, ring: Ring, priority: u8) {
        self.ipb_update(ring, priority);
        self.notify(ring);
    }

    pub(crate) fn regs_bytes(&self) -> Vec<u8> {
        self.regs.to_vec()
    }

    pub(crate) fn set_regs_bytes(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() != self.regs.len() {
            return false;
        }
        self.regs.copy_from_slice(bytes);
        true
    }

    fn tm_raw_write(&mut self, offset: u64, value: u64, size: usize) {
        let ring_offset = (offset & 0x30) as usize;
        let reg_offset = (offset & 0x3f) as usize;
        let mask = tm_mask(offset, size, true);

        // Only 4 or 8 byte stores are allowed and the User ring is excluded.
        if size < 4 || mask == 0 || ring_offset == TM_QW0_USER {
            warn!("XIVE: invalid write access at TIMA @{:#x}", offset);
            return;
        }

        // Use the register offset for the raw values and filter out reserved
        // values, byte by byte.
        for i in 0..size {
            let byte_mask = (mask >> (8 * (size - i - 1))) as u8;
            if byte_mask != 0 {
                self.regs[reg_offset + i] = ((value >> (8 * (size - i - 1))) as u8) & byte_mask;
            }
        }
    }

    fn tm_raw_read(&mut self, offset: u64, size: usize) -> u64 {
        let ring_offset = (offset & 0x30) as usize;
        let reg_offset = (offset & 0x3f) as usize;
        let mask = tm_mask(offset, size, false);

        // Only 4 or 8 byte loads are allowed and the User ring is excluded.
        if size < 4 || mask == 0 || ring_offset == TM_QW0_USER {
            warn!("XIVE: invalid read access at TIMA @{:#x}", offset);
            return !0;
        }

        let mut ret = 0u64;
        for i in 0..size {
            let reg = self.regs.get(reg_offset + i).copied().unwrap_or(0);
            ret |= (reg as u64) << (8 * (size - i - 1));
        }

        // Filter out reserved values.
        ret & mask
    }

    /// TIMA store. `offset` selects the page view in its bits above
    /// [`TM_SHIFT`]; special operations are tried first, raw register access
    /// last.
    pub fn tm_write(&mut self, offset: u64, value: u64, size: usize) {
        // First, check for special operations in the 2K region.
        if offset & 0x800 != 0 {
            match tm_find_op(offset, size, true) {
                Some(op) => {
                    if let Some(handler) = op.write_handler {
                        handler(self, offset, value, size);
                    }
                }
                None => {
                    warn!("XIVE: invalid write access at TIMA @{:#x}", offset);
                }
            }
            return;
        }

        // Then, for special operations in the region below 2K.
        if let Some(op) = tm_find_op(offset, size, true) {
            if let Some(handler) = op.write_handler {
                handler(self, offset, value, size);
            }
            return;
        }

        // Finish with raw access to the register values.
        self.tm_raw_write(offset, value, size);
    }

    /// TIMA load, mirroring [`XiveTctx::tm_write`].
    pub fn tm_read(&mut self, offset: u64, size: usize) -> u64 {
        // First, check for special operations in the 2K region.
        if offset & 0x800 != 0 {
            return match tm_find_op(offset, size, false) {
                Some(op) => match op.read_handler {
                    Some(handler) => handler(self, offset, size),
                    None => !0,
                },
                None => {
                    warn!("XIVE: invalid read access to TIMA @{:#x}", offset);
                    !0
                }
            };
        }

        // Then, for special operations in the region below 2K.
        if let Some(op) = tm_find_op(offset, size, false) {
            if let Some(handler) = op.read_handler {
                return handler(self, offset, size);
            }
        }

        // Finish with raw access to the register values.
        self.tm_raw_read(offset, size)
    }
}

/// CAM line of a virtual processor identity.
pub fn cam_line(vp_blk: u8, vp_idx: u32) -> u32 {
    ((vp_blk as u32) << 19) | vp_idx
}

/// The hardware CAM is hardwired from the chip and thread numbers:
///
///   `0x000 || 0b1 || 4-bit chip || 7-bit thread`
///
/// and with the block grouping extension:
///
///   `4-bit chip || 0x001 || 7-bit thread`
pub fn hw_cam_line(block_group: bool, chip_id: u8, tid: u8) -> u32 {
    if block_group {
        1 << 11 | ((chip_id as u32) & 0xf) << 7 | (tid as u32) & 0x7f
    } else {
        ((chip_id as u32) & 0xf) << 11 | 1 << 7 | (tid as u32) & 0x7f
    }
}

// Access maps for each page of the TIMA, filtering raw register loads and
// stores. Accessibility bits: 0 - no access, 1 - write only, 2 - read only,
// 3 - read/write.

#[rustfmt::skip]
const TM_HW_VIEW: [u8; 64] = [
    /* QW-0 User */   3, 0, 0, 0,   0, 0, 0, 0,   3, 3, 3, 3,   0, 0, 0, 0,
    /* QW-1 OS   */   3, 3, 3, 3,   3, 3, 0, 3,   3, 3, 3, 3,   0, 0, 0, 0,
    /* QW-2 HV   */   0, 0, 3, 3,   0, 0, 0, 0,   3, 3, 3, 3,   0, 0, 0, 0,
    /* QW-3 HW   */   3, 3, 3, 3,   0, 3, 0, 3,   3, 0, 0, 3,   3, 3, 3, 0,
];

#[rustfmt::skip]
const TM_HV_VIEW: [u8; 64] = [
    /* QW-0 User */   3, 0, 0, 0,   0, 0, 0, 0,   3, 3, 3, 3,   0, 0, 0, 0,
    /* QW-1 OS   */   3, 3, 3, 3,   3, 3, 0, 3,   3, 3, 3, 3,   0, 0, 0, 0,
    /* QW-2 HV   */   0, 0, 3, 3,   0, 0, 0, 0,   0, 3, 3, 3,   0, 0, 0, 0,
    /* QW-3 HW   */   3, 3, 3, 3,   0, 3, 0, 3,   3, 0, 0, 3,   0, 0, 0, 0,
];

#[rustfmt::skip]
const TM_OS_VIEW: [u8; 64] = [
    /* QW-0 User */   3, 0, 0, 0,   0, 0, 0, 0,   3, 3, 3, 3,   0, 0, 0, 0,
    /* QW-1 OS   */   2, 3, 2, 2,   2, 2, 0, 2,   0, 0, 0, 0,   0, 0, 0, 0,
    /* QW-2 HV   */   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,
    /* QW-3 HW   */   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 3, 3, 0,
];

#[rustfmt::skip]
const TM_USER_VIEW: [u8; 64] = [
    /* QW-0 User */   3, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,
    /* QW-1 OS   */   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,
    /* QW-2 HV   */   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,
    /* QW-3 HW   */   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,
];

/// Overall TIMA access map for the thread interrupt management context
/// registers.
const TM_VIEWS: [&[u8; 64]; TM_RING_COUNT] =
    [&TM_HW_VIEW, &TM_HV_VIEW, &TM_OS_VIEW, &TM_USER_VIEW];

/// Computes a register access mask for a given offset in the TIMA.
fn tm_mask(offset: u64, size: usize, write: bool) -> u64 {
    let page_offset = ((offset >> TM_SHIFT) & 0x3) as usize;
    let reg_offset = (offset & 0x3f) as usize;
    let reg_mask = if write { 0x1 } else { 0x2 };
    let view = TM_VIEWS[page_offset];
    let mut mask = 0u64;

    for i in 0..size {
        if view.get(reg_offset + i).copied().unwrap_or(0) & reg_mask != 0 {
            mask |= 0xffu64 << (8 * (size - i - 1));
        }
    }

    mask
}

// The TM context is mapped twice within each page. Stores and loads to the
// first mapping below 2K write and read the specified values without
// modification. The second mapping above 2K performs specific state changes
// (side effects) in addition to setting/returning the interrupt management
// area context of the processor thread.

fn tm_ack_os_reg(tctx: &mut XiveTctx, _offset: u64, _size: usize) -> u64 {
    tctx.accept(Ring::Os)
}

fn tm_set_os_cppr(tctx: &mut XiveTctx, _offset: u64, value: u64, _size: usize) {
    tctx.set_cppr(Ring::Os, (value & 0xff) as u8);
}

fn tm_set_os_pending(tctx: &mut XiveTctx, _offset: u64, value: u64, _size: usize) {
    tctx.ipb_update(Ring::Os, (value & 0xff) as u8);
    tctx.notify(Ring::Os);
}

type TmWriteHandler = fn(&mut XiveTctx, u64, u64, usize);
type TmReadHandler = fn(&mut XiveTctx, u64, usize) -> u64;

/// A "special" TIMA operation, keyed by page, page offset and access size.
struct XiveTmOp {
    page_offset: u8,
    op_offset: u64,
    size: usize,
    write_handler: Option<TmWriteHandler>,
    read_handler: Option<TmReadHandler>,
}

const TM_OPERATIONS: &[XiveTmOp] = &[
    // MMIOs below 2K: raw values and special operations without side
    // effects.
    XiveTmOp {
        page_offset: TM_OS_PAGE,
        op_offset: (TM_QW1_OS + TM_CPPR) as u64,
        size: 1,
        write_handler: Some(tm_set_os_cppr),
        read_handler: None,
    },
    // MMIOs above 2K: special operations with side effects.
    XiveTmOp {
        page_offset: TM_OS_PAGE,
        op_offset: TM_SPC_ACK_OS_REG,
        size: 2,
        write_handler: None,
        read_handler: Some(tm_ack_os_reg),
    },
    XiveTmOp {
        page_offset: TM_OS_PAGE,
        op_offset: TM_SPC_SET_OS_PENDING,
        size: 1,
        write_handler: Some(tm_set_os_pending),
        read_handler: None,
    },
];

fn tm_find_op(offset: u64, size: usize, write: bool) -> Option<&'static XiveTmOp> {
    let page_offset = ((offset >> TM_SHIFT) & 0x3) as u8;
    let op_offset = offset & 0xfff;

    TM_OPERATIONS.iter().find(|op| {
        // Accesses done from a more privileged TIMA page are allowed.
        op.page_offset >= page_offset
            && op.op_offset == op_offset
            && op.size == size
            && ((write && op.write_handler.is_some()) || (!write && op.read_handler.is_some()))
    })
}

/// Memory-mapped TIMA window over the router's thread contexts. The
/// accessing CPU thread is carried in [`BusAccessInfo::id`] so the decode
/// never relies on ambient state.
pub struct XiveTima {
    router: Arc<Mutex<XiveRouter>>,
}

/// Serialized register files of every thread context behind the window.
#[derive(Serialize, Deserialize)]
struct XiveTimaSnapshot {
    tctxs: Vec<Vec<u8>>,
}

impl XiveTima {
    pub fn new(router: Arc<Mutex<XiveRouter>>) -> XiveTima {
        XiveTima { router }
    }
}

impl BusDevice for XiveTima {
    fn debug_label(&self) -> String {
        "XIVE thread interrupt management area".to_string()
    }

    fn device_id(&self) -> DeviceId {
        DeviceId::Tima
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if !matches!(data.len(), 1 | 2 | 4 | 8) {
            warn!("XIVE: bad TIMA load size {} at {}", data.len(), info);
            data.fill(0xff);
            return;
        }
        let mut router = self.router.lock().unwrap();
        let size = data.len();
        match router.tctx_mut(info.id) {
            Some(tctx) => {
                let ret = tctx.tm_read(info.offset, size);
                data.copy_from_slice(&ret.to_be_bytes()[8 - size..]);
            }
            None => {
                warn!("XIVE: TIMA access from unknown CPU {}", info.id);
                data.fill(0xff);
            }
        }
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if !matches!(data.len(), 1 | 2 | 4 | 8) {
            warn!("XIVE: bad TIMA store size {} at {}", data.len(), info);
            return;
        }
        let mut value = [0u8; 8];
        value[8 - data.len()..].copy_from_slice(data);
        let mut router = self.router.lock().unwrap();
        match router.tctx_mut(info.id) {
            Some(tctx) => tctx.tm_write(info.offset, u64::from_be_bytes(value), data.len()),
            None => warn!("XIVE: TIMA access from unknown CPU {}", info.id),
        }
    }
}

impl Suspendable for XiveTima {
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        let router = self.router.lock().unwrap();
        serde_json::to_value(XiveTimaSnapshot {
            tctxs: (0..router.nr_tctxs())
                .filter_map(|cpu| router.tctx(cpu).map(|tctx| tctx.regs_bytes()))
                .collect(),
        })
        .context("failed serializing XiveTima")
    }

    fn restore(&mut self, data: serde_json::Value) -> anyhow::Result<()> {
        let snap: XiveTimaSnapshot =
            serde_json::from_value(data).context("failed to deserialize XiveTima snapshot")?;
        let mut router = self.router.lock().unwrap();
        if snap.tctxs.len() != router.nr_tctxs() {
            return Err(anyhow::anyhow!(
                "XiveTima snapshot has {} contexts, expected {}",
                snap.tctxs.len(),
                router.nr_tctxs()
            ));
        }
        for (cpu, regs) in snap.tctxs.iter().enumerate() {
            let tctx = match router.tctx_mut(cpu) {
                Some(tctx) => tctx,
                None => unreachable!(),
            };
            if !tctx.set_regs_bytes(regs) {
                return Err(anyhow::anyhow!(
                    "XiveTima snapshot has a malformed register file for CPU {}",
                    cpu
                ));
            }
        }
        Ok(())
    }
}
