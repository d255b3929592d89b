//  _____       ______   ____
// |_   _|     |  ____|/ ____|  Institute of Embedded Systems
//   | |  _ __ | |__  | (___    Zurich University of Applied Sciences
//   | | | '_ \|  __|  \___ \   8401 Winterthur, Switzerland
//  _| |_| | | | |____ ____) |
// |_____|_| |_|______|_____/
//
// Copyright 2025 Institute of Embedded Systems at Zurich University of Applied Sciences.
// All rights reserved.
// SPDX-License-Identifier: MIT

/// An action a protocol state machine wants its driver loop to carry out
/// before `progress` is called again.
///
/// The driver loop (firmware main loop or simulator) matches on this and
/// either awaits a timer, opens the radio for a window, or sends a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action<TIME, MESSAGE> {
    /// Nothing to do; `progress` may be called again immediately.
    None,
    /// Suspend (via the power arbiter) until `end`.
    Wait { end: TIME },
    /// Enable the radio receiver until `end`.
    Receive { end: TIME },
    /// Send `message` to `dst`, optionally after `delay`.
    Transmit {
        dst: u8,
        message: MESSAGE,
        delay: Option<TIME>,
    },
}
