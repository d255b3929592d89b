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

#![cfg_attr(not(test), no_std)]

//! The cricket-call detection state machine: a real-time classifier driven
//! by edge-timer events that counts pulses in a specific cadence and
//! distinguishes a male call, a male call with female response, and noise
//! transients.

pub mod params;
mod state_machine;

pub use state_machine::{DetectAction, DetectEvent, DetectState, Detector};
