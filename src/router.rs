// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! XIVE router and presenter.
//!
//! The router resolves a source notification to an event queue through the
//! routing table, pushes the event data into the queue and, unless the
//! notification coalesces in the queue's ESn state, hands over to the
//! presenter. The presenter matches the queue's destination virtual
//! processor against the CAM words of every dispatched thread context and
//! signals exactly one thread, or records backlog in the VP when none is
//! dispatched.

use std::collections::BTreeMap;

use log::error;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::queue::GuestMemory;
use crate::queue::XiveEq;
use crate::tctx::cam_line;
use crate::tctx::hw_cam_line;
use crate::tctx::priority_to_ipb;
use crate::tctx::IrqLine;
use crate::tctx::Ring;
use crate::tctx::XiveTctx;
use crate::tctx::TM_QW0W2_LOGIC_SERV;
use crate::tctx::TM_QW0W2_VU;
use crate::tctx::TM_QW1W2_OS_CAM;
use crate::tctx::TM_QW1W2_VO;
use crate::tctx::TM_QW2W2_POOL_CAM;
use crate::tctx::TM_QW2W2_VP;
use crate::tctx::TM_QW3W2_VT;

/// Notification seam between interrupt sources and the routing fabric. The
/// in-process [`XiveRouter`] is the default implementation; deployments can
/// substitute their own for tracing or remote routing without touching
/// source or queue code.
pub trait XiveNotifier: Send {
    /// Routes the notification of logical interrupt source number `lisn`.
    fn notify(&mut self, lisn: u32);
}

/// A routing entry, one per interrupt source.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XiveIve {
    pub valid: bool,
    /// Masked entries terminate the notification silently.
    pub masked: bool,
    /// Target event queue.
    pub eq_blk: u8,
    pub eq_idx: u32,
    /// Opaque payload pushed into the queue.
    pub eq_data: u32,
}

/// A virtual processor record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XiveVp {
    pub valid: bool,
    /// Backlog interrupt pending buffer, accumulated while the VP is not
    /// dispatched on any thread.
    pub ipb: u8,
}

/// Backing store for the routing, event queue and virtual processor tables.
///
/// Lookups return `None` for missing records, which is distinct from a
/// record that is present but invalid or masked. The core always performs a
/// whole-record read-modify-write through these accessors.
pub trait XiveStore: Send {
    fn get_ive(&self, lisn: u32) -> Option<XiveIve>;
    fn set_ive(&mut self, lisn: u32, ive: XiveIve);
    fn get_eq(&self, eq_blk: u8, eq_idx: u32) -> Option<XiveEq>;
    fn set_eq(&mut self, eq_blk: u8, eq_idx: u32, eq: XiveEq);
    fn get_vp(&self, vp_blk: u8, vp_idx: u32) -> Option<XiveVp>;
    fn set_vp(&mut self, vp_blk: u8, vp_idx: u32, vp: XiveVp);
}

/// Associative in-memory [`XiveStore`].
#[derive(Default)]
pub struct XiveTables {
    ives: BTreeMap<u32, XiveIve>,
    eqs: BTreeMap<(u8, u32), XiveEq>,
    vps: BTreeMap<(u8, u32), XiveVp>,
}

impl XiveStore for XiveTables {
    fn get_ive(&self, lisn: u32) -> Option<XiveIve> {
        self.ives.get(&lisn).copied()
    }

    fn set_ive(&mut self, lisn: u32, ive: XiveIve) {
        self.ives.insert(lisn, ive);
    }

    fn get_eq(&self, eq_blk: u8, eq_idx: u32) -> Option<XiveEq> {
        self.eqs.get(&(eq_blk, eq_idx)).copied()
    }

    fn set_eq(&mut self, eq_blk: u8, eq_idx: u32, eq: XiveEq) {
        self.eqs.insert((eq_blk, eq_idx), eq);
    }

    fn get_vp(&self, vp_blk: u8, vp_idx: u32) -> Option<XiveVp> {
        self.vps.get(&(vp_blk, vp_idx)).copied()
    }

    fn set_vp(&mut self, vp_blk: u8, vp_idx: u32, vp: XiveVp) {
        self.vps.insert((vp_blk, vp_idx), vp);
    }
}

fn tctx_ring_match(
    tctx: &XiveTctx,
    ring: Ring,
    vp_blk: u8,
    vp_idx: u32,
    logic_serv: u32,
) -> bool {
    let w2 = tctx.word2(ring);
    let cam = cam_line(vp_blk, vp_idx);
    let block_group = false;

    match ring {
        Ring::HvPhys => {
            w2 & TM_QW3W2_VT != 0
                && tctx.hw_cam(block_group) == hw_cam_line(block_group, vp_blk, vp_idx as u8)
        }
        Ring::HvPool => w2 & TM_QW2W2_VP != 0 && cam == w2 & TM_QW2W2_POOL_CAM,
        Ring::Os => w2 & TM_QW1W2_VO != 0 && cam == w2 & TM_QW1W2_OS_CAM,
        Ring::User => {
            w2 & TM_QW1W2_VO != 0
                && cam == w2 & TM_QW1W2_OS_CAM
                && w2 & TM_QW0W2_VU != 0
                && logic_serv == w2 & TM_QW0W2_LOGIC_SERV
        }
    }
}

/// Checks one thread context, scanning its rings from most to least
/// privileged.
fn presenter_tctx_match(
    tctx: &XiveTctx,
    format: u8,
    vp_blk: u8,
    vp_idx: u32,
    logic_serv: u32,
) -> Option<Ring> {
    if format == 0 {
        // F=0 & i=0: specific VP notification.
        for ring in [Ring::HvPhys, Ring::HvPool, Ring::Os] {
            if tctx_ring_match(tctx, ring, vp_blk, vp_idx, 0) {
                return Some(ring);
            }
        }
    } else if tctx_ring_match(tctx, Ring::User, vp_blk, vp_idx, logic_serv) {
        // F=1: user level event-based branch (EBB) notification.
        return Some(Ring::User);
    }
    None
}

/// The XIVE routing engine. Owns the thread interrupt contexts of its chip
/// and drives the whole notification chain synchronously on the calling
/// thread; routing state lives in the backing store behind [`XiveStore`].
pub struct XiveRouter {
    chip_id: u8,
    store: Box<dyn XiveStore>,
    mem: Box<dyn GuestMemory>,
    tctxs: Vec<XiveTctx>,
}

impl XiveRouter {
    pub fn new(chip_id: u8, store: Box<dyn XiveStore>, mem: Box<dyn GuestMemory>) -> XiveRouter {
        XiveRouter {
            chip_id,
            store,
            mem,
            tctxs: Vec::new(),
        }
    }

    pub fn chip_id(&self) -> u8 {
        self.chip_id
    }

    /// Creates the interrupt context of a new CPU thread and returns its
    /// index, used as the accessor id of TIMA accesses. Contexts live for
    /// the rest of the machine's lifetime.
    pub fn add_thread(&mut self, tid: u8, output: IrqLine) -> usize {
        self.tctxs.push(XiveTctx::new(self.chip_id, tid, output));
        self.tctxs.len() - 1
    }

    pub fn nr_tctxs(&self) -> usize {
        self.tctxs.len()
    }

    pub fn tctx(&self, cpu: usize) -> Option<&XiveTctx> {
        self.tctxs.get(cpu)
    }

    pub fn tctx_mut(&mut self, cpu: usize) -> Option<&mut XiveTctx> {
        self.tctxs.get_mut(cpu)
    }

    /// Machine reset of every thread context. Source and store state are
    /// reset by their owners.
    pub fn reset(&mut self) {
        for tctx in &mut self.tctxs {
            tctx.reset();
        }
    }

    pub fn get_ive(&self, lisn: u32) -> Option<XiveIve> {
        self.store.get_ive(lisn)
    }

    pub fn set_ive(&mut self, lisn: u32, ive: XiveIve) {
        self.store.set_ive(lisn, ive);
    }

    pub fn get_eq(&self, eq_blk: u8, eq_idx: u32) -> Option<XiveEq> {
        self.store.get_eq(eq_blk, eq_idx)
    }

    pub fn set_eq(&mut self, eq_blk: u8, eq_idx: u32, eq: XiveEq) {
        self.store.set_eq(eq_blk, eq_idx, eq);
    }

    pub fn get_vp(&self, vp_blk: u8, vp_idx: u32) -> Option<XiveVp> {
        self.store.get_vp(vp_blk, vp_idx)
    }

    pub fn set_vp(&mut self, vp_blk: u8, vp_idx: u32, vp: XiveVp) {
        self.store.set_vp(vp_blk, vp_idx, vp);
    }

    /// Presenter notification: finds the one thread the destination VP is
    /// dispatched on and updates its pending state, or records backlog in
    /// the VP record.
    fn presenter_notify(
        &mut self,
        format: u8,
        vp_blk: u8,
        vp_idx: u32,
        cam_ignore: bool,
        priority: u8,
        logic_serv: u32,
    ) {
        // VPD cache lookup.
        let mut vp = match self.store.get_vp(vp_blk, vp_idx) {
            Some(vp) => vp,
            None => {
                error!("XIVE: no VP {:x}/{:x}", vp_blk, vp_idx);
                return;
            }
        };

        if !vp.valid {
            error!("XIVE: VP {:x}/{:x} is invalid", vp_blk, vp_idx);
            return;
        }

        // F=0 & i=1: logical server notification. Selecting a winning
        // thread among several candidates takes bus exchanges this model
        // does not support; routing here is an error, not a guess.
        if format == 0 && cam_ignore {
            warn!(
                "XIVE: no support for LS notification VP {:x}/{:x}",
                vp_blk, vp_idx
            );
            return;
        }

        let mut matched: Option<(usize, Ring)> = None;
        for (cpu, tctx) in self.tctxs.iter().enumerate() {
            if let Some(ring) = presenter_tctx_match(tctx, format, vp_blk, vp_idx, logic_serv) {
                // Duplicate dispatch is never arbitrated.
                if matched.is_some() {
                    warn!(
                        "XIVE: already found a thread context VP {:x}/{:x}",
                        vp_blk, vp_idx
                    );
                    return;
                }
                matched = Some((cpu, ring));
            }
        }

        match matched {
            Some((cpu, ring)) => {
                let tctx = &mut self.tctxs[cpu];
                tctx.ipb_update(ring, priority);
                tctx.notify(ring);
            }
            None => {
                // No VP dispatched on a HW thread: record the IPB in the
                // associated VP. Escalation stops here.
                warn!("XIVE: VP {:x}/{:x} is not dispatched", vp_blk, vp_idx);
                vp.ipb |= priority_to_ipb(priority);
                self.store.set_vp(vp_blk, vp_idx, vp);
            }
        }
    }

    /// An EQ trigger coming from an event trigger or from another chip.
    fn eq_notify(&mut self, eq_blk: u8, eq_idx: u32, eq_data: u32) {
        // EQD cache lookup.
        let mut eq = match self.store.get_eq(eq_blk, eq_idx) {
            Some(eq) => eq,
            None => {
                error!("XIVE: no EQ {:x}/{:x}", eq_blk, eq_idx);
                return;
            }
        };

        if !eq.valid {
            error!("XIVE: EQ {:x}/{:x} is invalid", eq_blk, eq_idx);
            return;
        }

        if eq.enqueue {
            eq.push(self.mem.as_mut(), eq_data);
            self.store.set_eq(eq_blk, eq_idx, eq);
        }

        // The EQ is masked.
        if eq.format == 0 && eq.priority == 0xff {
            return;
        }

        // Check the EQ ESn (Event State Buffer for notification) for further
        // event coalescing in the router.
        if !eq.ucond_notify {
            let (next, notify) = eq.esn.trigger();

            if next != eq.esn {
                eq.esn = next;
                self.store.set_eq(eq_blk, eq_idx, eq);
            }

            // ESn[Q]=1: end of notification.
            if !notify {
                return;
            }
        }

        self.presenter_notify(
            eq.format,
            eq.vp_blk,
            eq.vp_idx,
            eq.ignore,
            eq.priority,
            eq.logic_serv,
        );
    }
}

impl XiveNotifier for XiveRouter {
    fn notify(&mut self, lisn: u32) {
        // IVE cache lookup.
        let ive = match self.store.get_ive(lisn) {
            Some(ive) => ive,
            None => {
                warn!("XIVE: unknown LISN {:x}", lisn);
                return;
            }
        };

        if !ive.valid {
            warn!("XIVE: invalid LISN {:x}", lisn);
            return;
        }

        if ive.masked {
            // Notification completed.
            return;
        }

        // The event trigger becomes an EQ trigger.
        self.eq_notify(ive.eq_blk, ive.eq_idx, ive.eq_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esb::EsbState;
    use crate::queue::GuestMemoryError;
    use crate::tctx::TM_IPB;
    use crate::tctx::TM_PIPR;

    /// Guest RAM stub that accepts and discards all writes.
    #[derive(Default)]
    struct NullRam;

    impl GuestMemory for NullRam {
        fn write(&mut self, _addr: u64, _data: &[u8]) -> Result<(), GuestMemoryError> {
            Ok(())
        }
    }

    const VP_BLK: u8 = 0x0;
    const VP_IDX: u32 = 0x20;
    const EQ_IDX: u32 = 0x5;
    const LISN: u32 = 0x11;

    fn test_router() -> XiveRouter {
        let mut router = XiveRouter::new(
            0,
            Box::new(XiveTables::default()),
            Box::new(NullRam),
        );
        router.set_ive(
            LISN,
            XiveIve {
                valid: true,
                masked: false,
                eq_blk: 0,
                eq_idx: EQ_IDX,
                eq_data: 0xbeef,
            },
        );
        router.set_eq(
            0,
            EQ_IDX,
            XiveEq {
                valid: true,
                enqueue: false,
                qsize: 0,
                esn: EsbState::Reset,
                vp_blk: VP_BLK,
                vp_idx: VP_IDX,
                priority: 3,
                ..Default::default()
            },
        );
        router.set_vp(
            VP_BLK,
            VP_IDX,
            XiveVp {
                valid: true,
                ipb: 0,
            },
        );
        router
    }

    fn dispatch_os(router: &mut XiveRouter) -> usize {
        let cpu = router.add_thread(0, IrqLine::new());
        let tctx = router.tctx_mut(cpu).unwrap();
        tctx.set_cppr(Ring::Os, 4);
        tctx.set_os_cam(VP_BLK, VP_IDX);
        cpu
    }

    #[test]
    fn notify_delivers_to_dispatched_os_ring() {
        let mut router = test_router();
        let cpu = dispatch_os(&mut router);

        router.notify(LISN);

        let tctx = router.tctx(cpu).unwrap();
        assert_eq!(tctx.reg(Ring::Os, TM_PIPR), 3);
        assert!(tctx.output().is_asserted());
        // ESn moved to Pending, awaiting acknowledgment.
        assert_eq!(router.get_eq(0, EQ_IDX).unwrap().esn, EsbState::Pending);
    }

    #[test]
    fn masked_ive_is_terminal() {
        let mut router = test_router();
        let cpu = dispatch_os(&mut router);
        let mut ive = router.get_ive(LISN).unwrap();
        ive.masked = true;
        router.set_ive(LISN, ive);

        router.notify(LISN);

        let tctx = router.tctx(cpu).unwrap();
        assert!(!tctx.output().is_asserted());
        assert_eq!(router.get_eq(0, EQ_IDX).unwrap().esn, EsbState::Reset);
    }

    #[test]
    fn unknown_and_invalid_lisns_are_dropped() {
        let mut router = test_router();
        let cpu = dispatch_os(&mut router);

        router.notify(0x999);
        router.set_ive(
            0x12,
            XiveIve {
                valid: false,
                ..Default::default()
            },
        );
        router.notify(0x12);

        assert!(!router.tctx(cpu).unwrap().output().is_asserted());
    }

    #[test]
    fn esn_coalesces_second_notification() {
        let mut router = test_router();
        let cpu = dispatch_os(&mut router);

        router.notify(LISN);
        let ack = router.tctx_mut(cpu).unwrap().accept(Ring::Os);
        assert_eq!(ack & 0xff, 3);

        // The queue has not been acknowledged: the second event queues in
        // ESn and never reaches the presenter.
        router.notify(LISN);
        let tctx = router.tctx(cpu).unwrap();
        assert!(!tctx.output().is_asserted());
        assert_eq!(tctx.reg(Ring::Os, TM_IPB), 0);
        assert_eq!(router.get_eq(0, EQ_IDX).unwrap().esn, EsbState::Queued);
    }

    #[test]
    fn ucond_notify_bypasses_esn() {
        let mut router = test_router();
        let cpu = dispatch_os(&mut router);
        let mut eq = router.get_eq(0, EQ_IDX).unwrap();
        eq.ucond_notify = true;
        eq.esn = EsbState::Queued;
        router.set_eq(0, EQ_IDX, eq);

        router.notify(LISN);

        let tctx = router.tctx(cpu).unwrap();
        assert!(tctx.output().is_asserted());
        // ESn is left alone on the unconditional path.
        assert_eq!(router.get_eq(0, EQ_IDX).unwrap().esn, EsbState::Queued);
    }

    #[test]
    fn fully_masked_eq_stops_before_presenter() {
        let mut router = test_router();
        let cpu = dispatch_os(&mut router);
        let mut eq = router.get_eq(0, EQ_IDX).unwrap();
        eq.priority = 0xff;
        router.set_eq(0, EQ_IDX, eq);

        router.notify(LISN);

        assert!(!router.tctx(cpu).unwrap().output().is_asserted());
        assert_eq!(router.get_eq(0, EQ_IDX).unwrap().esn, EsbState::Reset);
    }

    #[test]
    fn undispatched_vp_accumulates_backlog() {
        let mut router = test_router();

        router.notify(LISN);

        let vp = router.get_vp(VP_BLK, VP_IDX).unwrap();
        assert_eq!(vp.ipb, priority_to_ipb(3));
    }

    #[test]
    fn invalid_vp_gets_no_backlog() {
        let mut router = test_router();
        router.set_vp(
            VP_BLK,
            VP_IDX,
            XiveVp {
                valid: false,
                ipb: 0,
            },
        );

        router.notify(LISN);

        assert_eq!(router.get_vp(VP_BLK, VP_IDX).unwrap().ipb, 0);
    }

    #[test]
    fn duplicate_dispatch_is_dropped() {
        let mut router = test_router();
        let cpu0 = dispatch_os(&mut router);
        let cpu1 = dispatch_os(&mut router);

        router.notify(LISN);

        for cpu in [cpu0, cpu1] {
            let tctx = router.tctx(cpu).unwrap();
            assert!(!tctx.output().is_asserted());
            assert_eq!(tctx.reg(Ring::Os, TM_IPB), 0);
        }
        // And the backlog is not touched either: the notification is lost.
        assert_eq!(router.get_vp(VP_BLK, VP_IDX).unwrap().ipb, 0);
    }

    #[test]
    fn logical_server_notification_is_unsupported() {
        let mut router = test_router();
        let cpu = dispatch_os(&mut router);
        let mut eq = router.get_eq(0, EQ_IDX).unwrap();
        eq.ignore = true;
        router.set_eq(0, EQ_IDX, eq);

        router.notify(LISN);

        assert!(!router.tctx(cpu).unwrap().output().is_asserted());
        assert_eq!(router.get_vp(VP_BLK, VP_IDX).unwrap().ipb, 0);
    }

    #[test]
    fn hv_pool_ring_matches_programmed_cam() {
        let mut router = test_router();
        let cpu = router.add_thread(0, IrqLine::new());
        let tctx = router.tctx_mut(cpu).unwrap();
        tctx.set_word2(Ring::HvPool, TM_QW2W2_VP | cam_line(VP_BLK, VP_IDX));

        let matched = presenter_tctx_match(
            router.tctx(cpu).unwrap(),
            0,
            VP_BLK,
            VP_IDX,
            0,
        );
        assert_eq!(matched, Some(Ring::HvPool));
    }

    #[test]
    fn hv_phys_ring_matches_hardware_cam() {
        let mut router = test_router();
        // The hardware CAM is derived from (chip, thread), not programmed.
        let cpu = router.add_thread(0x21, IrqLine::new());
        let tctx = router.tctx_mut(cpu).unwrap();
        tctx.set_word2(Ring::HvPhys, TM_QW3W2_VT);

        let matched = presenter_tctx_match(router.tctx(cpu).unwrap(), 0, 0, 0x21, 0);
        assert_eq!(matched, Some(Ring::HvPhys));

        // A different thread id does not match.
        let matched = presenter_tctx_match(router.tctx(cpu).unwrap(), 0, 0, 0x22, 0);
        assert_eq!(matched, None);
    }

    #[test]
    fn user_ring_requires_logic_server() {
        let mut router = test_router();
        let cpu = router.add_thread(0, IrqLine::new());
        let logic_serv = cam_line(VP_BLK, VP_IDX);
        let tctx = router.tctx_mut(cpu).unwrap();
        tctx.set_word2(Ring::User, TM_QW0W2_VU | logic_serv);

        // Format 1 consults only the user ring.
        let tctx = router.tctx(cpu).unwrap();
        assert_eq!(
            presenter_tctx_match(tctx, 1, VP_BLK, VP_IDX, logic_serv),
            Some(Ring::User)
        );
        assert_eq!(presenter_tctx_match(tctx, 1, VP_BLK, VP_IDX, 0x1), None);
        // A format 0 notification never lands on the user ring.
        assert_eq!(presenter_tctx_match(tctx, 0, VP_BLK, VP_IDX, logic_serv), None);
    }
}
