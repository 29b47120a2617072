// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Event State Buffer (ESB) state machine.
//!
//! Every notification channel in the engine is backed by a 2-bit P/Q pair:
//! interrupt source cells, the per-queue notification channel (ESn) and the
//! per-queue escalation channel (ESe) all step through the same transition
//! table, stored in different places.

use enumn::N;
use serde::Deserialize;
use serde::Serialize;

/// P bit: an event was forwarded and is pending acknowledgment.
pub const ESB_VAL_P: u8 = 0x2;
/// Q bit: at least one further event arrived while P was set.
pub const ESB_VAL_Q: u8 = 0x1;

/// State of a 2-bit P/Q pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(u8)]
pub enum EsbState {
    /// P=0 Q=0, ready to forward the next event.
    Reset = 0b00,
    /// P=0 Q=1, the channel is switched off.
    #[default]
    Off = 0b01,
    /// P=1 Q=0, one event forwarded, not yet acknowledged.
    Pending = 0b10,
    /// P=1 Q=1, events coalesced behind a pending one.
    Queued = 0b11,
}

impl EsbState {
    /// Decodes the low 2 bits of a raw cell value.
    pub fn from_pq(pq: u8) -> EsbState {
        match EsbState::n(pq & 0x3) {
            Some(state) => state,
            // Unreachable after masking to 2 bits.
            None => unreachable!(),
        }
    }

    /// Applies an event trigger. Returns the successor state and whether a
    /// notification must be forwarded to the next stage.
    pub fn trigger(self) -> (EsbState, bool) {
        match self {
            EsbState::Reset => (EsbState::Pending, true),
            EsbState::Pending | EsbState::Queued => (EsbState::Queued, false),
            EsbState::Off => (EsbState::Off, false),
        }
    }

    /// Applies an end-of-interrupt. Returns the successor state and whether a
    /// notification must be forwarded for an event queued behind the
    /// acknowledged one.
    pub fn eoi(self) -> (EsbState, bool) {
        match self {
            EsbState::Reset | EsbState::Pending => (EsbState::Reset, false),
            EsbState::Queued => (EsbState::Pending, true),
            EsbState::Off => (EsbState::Off, false),
        }
    }
}

/// Forces the P/Q pair of `cell` to `value`, preserving the upper status
/// bits, and returns the previous state. No notification is implied; the
/// caller decides what the old state means.
pub fn esb_set(cell: &mut u8, value: EsbState) -> EsbState {
    let old = EsbState::from_pq(*cell);

    *cell = (*cell & !0x3) | value as u8;

    old
}

/// Steps `cell` through the trigger transition, returning whether to forward
/// a notification.
pub fn esb_trigger(cell: &mut u8) -> bool {
    let (next, signal) = EsbState::from_pq(*cell).trigger();
    esb_set(cell, next);
    signal
}

/// Steps `cell` through the EOI transition, returning whether to forward a
/// notification.
pub fn esb_eoi(cell: &mut u8) -> bool {
    let (next, signal) = EsbState::from_pq(*cell).eoi();
    esb_set(cell, next);
    signal
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [EsbState; 4] = [
        EsbState::Reset,
        EsbState::Off,
        EsbState::Pending,
        EsbState::Queued,
    ];

    #[test]
    fn trigger_transitions() {
        assert_eq!(EsbState::Reset.trigger(), (EsbState::Pending, true));
        assert_eq!(EsbState::Pending.trigger(), (EsbState::Queued, false));
        assert_eq!(EsbState::Queued.trigger(), (EsbState::Queued, false));
        assert_eq!(EsbState::Off.trigger(), (EsbState::Off, false));
    }

    #[test]
    fn eoi_transitions() {
        assert_eq!(EsbState::Reset.eoi(), (EsbState::Reset, false));
        assert_eq!(EsbState::Pending.eoi(), (EsbState::Reset, false));
        assert_eq!(EsbState::Queued.eoi(), (EsbState::Pending, true));
        assert_eq!(EsbState::Off.eoi(), (EsbState::Off, false));
    }

    // Every (state, event) pair has exactly one defined successor.
    #[test]
    fn transitions_are_total() {
        for state in ALL_STATES {
            let (after_trigger, _) = state.trigger();
            let (after_eoi, _) = state.eoi();
            assert!(ALL_STATES.contains(&after_trigger));
            assert!(ALL_STATES.contains(&after_eoi));
        }
    }

    #[test]
    fn pq_bit_encoding() {
        assert_eq!(EsbState::Pending as u8, ESB_VAL_P);
        assert_eq!(EsbState::Off as u8, ESB_VAL_Q);
        assert_eq!(EsbState::Queued as u8, ESB_VAL_P | ESB_VAL_Q);
        for state in ALL_STATES {
            assert_eq!(EsbState::from_pq(state as u8), state);
        }
    }

    #[test]
    fn set_preserves_status_bits() {
        let mut cell = 0x4 | EsbState::Reset as u8;
        let old = esb_set(&mut cell, EsbState::Queued);
        assert_eq!(old, EsbState::Reset);
        assert_eq!(cell, 0x4 | EsbState::Queued as u8);
    }

    #[test]
    fn cell_trigger_and_eoi() {
        let mut cell = EsbState::Reset as u8;
        assert!(esb_trigger(&mut cell));
        assert!(!esb_trigger(&mut cell));
        assert_eq!(EsbState::from_pq(cell), EsbState::Queued);

        // Queued + EOI forwards the coalesced event.
        assert!(esb_eoi(&mut cell));
        assert_eq!(EsbState::from_pq(cell), EsbState::Pending);
        assert!(!esb_eoi(&mut cell));
        assert_eq!(EsbState::from_pq(cell), EsbState::Reset);
    }
}
