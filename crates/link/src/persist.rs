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

use cricket_wire::Observation;

/// Where the base writes a completed, reassembled upload once it ACKs.
/// A CSV sink backs this on real hardware; the simulator and tests use an
/// in-memory one.
pub trait ObservationSink {
    fn persist(&mut self, node_id: u8, observations: &[Observation]);
}
