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

use std::{fs::File, io::Write};

use cricket_link::ObservationSink;
use cricket_wire::Observation;

/// Debug lines carrying a machine-parseable event are prefixed with this
/// character so a plain `println!`/`info!` stream and the structured event
/// file can share one log sink.
pub const EVENT_INDICATOR_CHAR: char = '$';

const FILE_HEADER: &str = "uptime;node_id;kind;content";

/// Appends `$`-prefixed debug lines, with the indicator stripped, to a file
/// as they're observed. Used by the simulator to keep a trace of state/
/// message/action events alongside the console log.
pub struct ProtocolEventFileWriter {
    file: File,
}

impl ProtocolEventFileWriter {
    pub fn new(output_file_path: &str) -> Self {
        let mut file = File::create(output_file_path).expect("could not create event file");
        file.write_all(FILE_HEADER.as_bytes()).unwrap();
        file.write_all(b"\n").unwrap();
        Self { file }
    }

    pub fn write_event(&mut self, event: &str) {
        // strip indicator char
        let event = event.split_at(1).1;
        self.file.write_all(event.as_bytes()).unwrap();
        self.file.write_all(b"\n").unwrap();
    }

    pub fn flush(&mut self) {
        self.file.flush().unwrap();
    }
}

const CSV_HEADER: &str = "node_id,timestamp_seconds,kind,payload";

/// Append-only CSV persistence for completed uploads, one row per
/// [`Observation`]. Adapted from [`ProtocolEventFileWriter`]'s
/// create-write-header-then-rows shape.
pub struct CsvObservationSink {
    file: File,
}

impl CsvObservationSink {
    pub fn new(output_file_path: &str) -> Self {
        let mut file = File::create(output_file_path).expect("could not create observation file");
        file.write_all(CSV_HEADER.as_bytes()).unwrap();
        file.write_all(b"\n").unwrap();
        Self { file }
    }

    pub fn flush(&mut self) {
        self.file.flush().unwrap();
    }
}

impl ObservationSink for CsvObservationSink {
    fn persist(&mut self, node_id: u8, observations: &[Observation]) {
        for obs in observations {
            let kind = obs.kind as u8;
            self.file
                .write_all(format!("{},{},{},{}\n", node_id, obs.time, kind, obs.payload).as_bytes())
                .unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cricket_wire::Kind;

    #[test]
    fn csv_sink_writes_one_row_per_observation() {
        let path = std::env::temp_dir().join("cricket_event_log_test.csv");
        let path = path.to_str().unwrap();
        let mut sink = CsvObservationSink::new(path);
        sink.persist(0x01, &[Observation { time: 14, kind: Kind::Humidity, payload: 60 }]);
        sink.flush();
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents, "node_id,timestamp_seconds,kind,payload\n1,14,2,60\n");
    }
}
