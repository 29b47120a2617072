// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulates an XIVE-class interrupt virtualization engine.
//!
//! Event notifications flow from interrupt sources, through per-destination
//! event queues in guest memory, to the processor thread a virtual processor
//! is dispatched on: trigger -> [`XiveSource`] -> [`XiveRouter`] -> event
//! queue push -> presenter match -> [`XiveTctx`] exception raise. The whole
//! chain runs synchronously on the thread performing the access.
//!
//! Routing entries, event queue descriptors and virtual processor records
//! live in an external backing store behind the [`XiveStore`] trait; the
//! notification seam between sources and the router is the [`XiveNotifier`]
//! trait, implemented by [`XiveRouter`] for in-process delivery.

pub mod bus;
pub mod esb;
pub mod queue;
pub mod router;
pub mod source;
pub mod tctx;

use remain::sorted;
use thiserror::Error;

pub use self::bus::BusAccessInfo;
pub use self::bus::BusDevice;
pub use self::bus::DeviceId;
pub use self::bus::Suspendable;
pub use self::esb::EsbState;
pub use self::queue::GuestMemory;
pub use self::queue::GuestMemoryError;
pub use self::queue::XiveEq;
pub use self::queue::XiveEqSource;
pub use self::router::XiveIve;
pub use self::router::XiveNotifier;
pub use self::router::XiveRouter;
pub use self::router::XiveStore;
pub use self::router::XiveTables;
pub use self::router::XiveVp;
pub use self::source::XiveSource;
pub use self::tctx::IrqLine;
pub use self::tctx::Ring;
pub use self::tctx::XiveTctx;
pub use self::tctx::XiveTima;

/// Errors returned when realizing one of the XIVE devices with an invalid
/// configuration.
#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum XiveError {
    #[error("invalid ESB shift setting {0}")]
    EsbShift(u32),
    #[error("number of event queues needs to be greater than 0")]
    NoEqs,
    #[error("number of interrupts needs to be greater than 0")]
    NoIrqs,
}
