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

//! Design-level numeric parameters, exposed as constants rather than
//! derived from a specific peripheral clock prescaler.

/// Pulse duration upper bound, microseconds.
pub const HIGH_UB_US: u32 = 1_300;
/// Pulse duration lower bound, microseconds.
pub const HIGH_LB_US: u32 = 700;
/// Gap duration upper bound, microseconds.
pub const LOW_UB_US: u32 = 2_300;
/// Gap duration lower bound, microseconds.
pub const LOW_LB_US: u32 = 1_700;

/// Edges required during a 1 ms pulse window to accept it as ~40 kHz.
pub const EDGE_MIN_HIGH: u16 = 30;
pub const EDGE_MAX_HIGH: u16 = 45;
/// Edges permitted during a silence window.
pub const EDGE_THRESHOLD_LOW: u16 = 20;

pub const WAIT_FEM_LB_US: u32 = 25_000;
pub const WAIT_FEM_UB_US: u32 = 35_000;

pub const CLICKS_MIN: u8 = 4;
pub const CLICKS_MAX: u8 = 9;

pub const TRANSIENT_THRESHOLD: u8 = 5;

/// Edges below which a short-timeout check treats a wakeup as noise.
pub const SHORT_TIMEOUT_MIN_EDGES: u16 = 3;
