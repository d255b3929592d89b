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

//! SD-card persistence is out of scope for this codebase; this sink logs
//! the persisted record over the debug line instead, in the shape a real
//! `ObservationSink` (e.g. `cricket-event-log`'s CSV writer) would
//! otherwise write to storage.

use cricket_link::ObservationSink;
use cricket_wire::Observation;
use defmt::info;

pub struct DebugLineSink;

impl ObservationSink for DebugLineSink {
    fn persist(&mut self, node_id: u8, observations: &[Observation]) {
        for obs in observations {
            info!(
                "upload;{};{};{};{}",
                node_id,
                obs.time,
                obs.kind as u8,
                obs.payload
            );
        }
    }
}
