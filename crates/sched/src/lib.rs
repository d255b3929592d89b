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

//! The cooperative "minimum-power" scheduler: a seconds-of-day time source,
//! a per-subsystem power-mode arbiter, and a deferred-work dispatcher that
//! lets interrupt handlers hand long work back to the main context.

pub mod dispatch;
pub mod power;
pub mod time;

pub use dispatch::{DeferredAction, Dispatcher};
pub use power::{PowerArbiter, PowerState, Subsystem};
pub use time::{TimeSource, DAY_SECONDS};
