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

use cricket_wire::{
    Action, Kind, Message, Observation, BASE_ADDR, MAX_OBSERVATIONS_PER_FRAGMENT,
};
use heapless::Vec;

use crate::store::ObservationStore;

/// Protocol state (node).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeState {
    Setup,
    Beacon,
    WaitBeacon,
    Idle,
    Send,
    WaitAck,
}

/// What the driver loop fed into `progress` this round: nothing (an
/// action just completed, or a scheduled wake fired), a received link
/// message, or environment readings gathered for a scheduled upload.
/// The environment read itself (I2C etc.) is out of scope; the driver
/// supplies the already-read values.
pub enum NodeInput {
    None,
    Message(Message),
    SensorReadings { temp: u8, humidity: u8, light: u8 },
}

/// Work the driver must do that is outside the protocol's own state: jam
/// the shared time source and reschedule the node's wake alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeSideEffect {
    None,
    JamSetTime { time_lo: u16, msb: u8 },
    ScheduleWake { at: u32 },
    /// `BeaconAck` carries both an authoritative clock value and the next
    /// wake time; both must be applied, so they ride in one variant rather
    /// than forcing two separate `progress` calls.
    JamSetTimeAndScheduleWake { time_lo: u16, msb: u8, at: u32 },
}

const BEACON_ACK_TIMEOUT_MS: u32 = 3_000;
const ACK_TIMEOUT_MS: u32 = 3_000;

/// A node's address is read from active-low DIP switches; bit-wise
/// inversion recovers the logical address.
pub fn resolve_node_address(raw_switch_lines: u8) -> u8 {
    !raw_switch_lines
}

/// Beacon registration, scheduled uploads, fragmentation, and ARQ for one
/// node. Owns its [`ObservationStore`] directly: the protocol is the data
/// store's only caller besides the detector's `record_observation` append.
pub struct NodeProtocol<const N: usize> {
    local_addr: u8,
    state: NodeState,
    store: ObservationStore<N>,
    snapshot: usize,
    seq_total: u8,
    seq_index: u8,
    resend_index: Option<u8>,
    period_s: u32,
    next_wake: u32,
    wait_until: u32,
}

impl<const N: usize> NodeProtocol<N> {
    pub fn new(local_addr: u8) -> Self {
        Self {
            local_addr,
            state: NodeState::Setup,
            store: ObservationStore::new(),
            snapshot: 0,
            seq_total: 0,
            seq_index: 0,
            resend_index: None,
            period_s: 0,
            next_wake: 0,
            wait_until: 0,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn local_addr(&self) -> u8 {
        self.local_addr
    }

    /// A detection call's finalize or a sensor reading lands here
    /// regardless of protocol state; it only ever appends. In `Idle`, the
    /// node wakes only for the next scheduled upload or a detection
    /// event, either of which only appends to the data store.
    pub fn record_observation(&mut self, obs: Observation) {
        self.store.append(obs);
    }

    fn fragment_count(&self) -> u8 {
        let entries = self.store.size();
        let per = MAX_OBSERVATIONS_PER_FRAGMENT;
        (((entries + per - 1) / per).max(1)) as u8
    }

    fn build_fragment(&self, index: u8) -> Message {
        let offset = (index as usize - 1) * MAX_OBSERVATIONS_PER_FRAGMENT;
        let mut buf = [Observation {
            time: 0,
            kind: Kind::Other,
            payload: 0,
        }; MAX_OBSERVATIONS_PER_FRAGMENT];
        let n = self.store.peek(self.snapshot, offset, &mut buf);
        let mut observations: Vec<Observation, MAX_OBSERVATIONS_PER_FRAGMENT> = Vec::new();
        for obs in buf.iter().take(n) {
            let _ = observations.push(*obs);
        }
        Message::Data {
            seq_total: self.seq_total,
            seq_index: index,
            observations,
        }
    }

    pub fn get_action(&self) -> Action<u32, Message> {
        match self.state {
            NodeState::Setup => Action::None,
            NodeState::Beacon => Action::Transmit {
                dst: BASE_ADDR,
                message: Message::Beacon,
                delay: None,
            },
            NodeState::WaitBeacon => Action::Receive { end: self.wait_until },
            NodeState::Idle => Action::Wait { end: self.next_wake },
            NodeState::Send => Action::Transmit {
                dst: BASE_ADDR,
                message: self.build_fragment(self.resend_index.unwrap_or(self.seq_index)),
                delay: None,
            },
            NodeState::WaitAck => Action::Receive { end: self.wait_until },
        }
    }

    /// Advance the state machine by one input, returning what the driver
    /// must additionally do to the shared time source.
    pub fn progress(&mut self, time: u32, input: NodeInput) -> NodeSideEffect {
        // On TimeSync, at any time: update the time source, no state
        // change.
        if let NodeInput::Message(Message::TimeSync { time_lo, msb }) = &input {
            return NodeSideEffect::JamSetTime {
                time_lo: *time_lo,
                msb: *msb,
            };
        }

        match (self.state, input) {
            (NodeState::Setup, NodeInput::None) => {
                self.state = NodeState::Beacon;
                NodeSideEffect::None
            }
            (NodeState::Beacon, NodeInput::None) => {
                self.wait_until = time + BEACON_ACK_TIMEOUT_MS / 1000;
                self.state = NodeState::WaitBeacon;
                NodeSideEffect::None
            }
            (
                NodeState::WaitBeacon,
                NodeInput::Message(Message::BeaconAck {
                    time: base_time,
                    period,
                    next_wake,
                    ..
                }),
            ) => {
                self.period_s = period;
                self.next_wake = next_wake;
                self.state = NodeState::Idle;
                NodeSideEffect::JamSetTimeAndScheduleWake {
                    time_lo: (base_time & 0xFFFF) as u16,
                    msb: ((base_time >> 16) & 0x1) as u8,
                    at: next_wake,
                }
            }
            (NodeState::WaitBeacon, NodeInput::None) => {
                // timed out waiting for BeaconAck; power radio down is the
                // driver's job when it sees `Setup`'s Action::None.
                self.state = NodeState::Setup;
                NodeSideEffect::None
            }

            (NodeState::Idle, NodeInput::SensorReadings { temp, humidity, light }) => {
                self.store
                    .append(Observation { time, kind: Kind::Temperature, payload: temp });
                self.store
                    .append(Observation { time, kind: Kind::Humidity, payload: humidity });
                self.store
                    .append(Observation { time, kind: Kind::Light, payload: light });
                self.snapshot = self.store.snapshot();
                self.seq_total = self.fragment_count();
                self.seq_index = 1;
                self.resend_index = None;
                self.state = NodeState::Send;
                NodeSideEffect::None
            }

            (NodeState::Send, NodeInput::None) => {
                if self.resend_index.is_some() {
                    // A repeat was already sent as the transmit action;
                    // fall straight back to waiting on the base.
                    self.resend_index = None;
                    self.wait_until = time + ACK_TIMEOUT_MS / 1000;
                    self.state = NodeState::WaitAck;
                } else if self.seq_index >= self.seq_total {
                    self.wait_until = time + ACK_TIMEOUT_MS / 1000;
                    self.state = NodeState::WaitAck;
                } else {
                    self.seq_index += 1;
                }
                NodeSideEffect::None
            }

            (NodeState::WaitAck, NodeInput::Message(Message::Ack { .. })) => {
                self.store.commit(self.snapshot);
                self.next_wake = self.next_wake.wrapping_add(self.period_s);
                self.state = NodeState::Idle;
                NodeSideEffect::ScheduleWake { at: self.next_wake }
            }
            (
                NodeState::WaitAck,
                NodeInput::Message(Message::Repeat { seq_index, .. }),
            ) => {
                self.resend_index = Some(seq_index);
                self.wait_until = time + ACK_TIMEOUT_MS / 1000;
                self.state = NodeState::Send;
                NodeSideEffect::None
            }
            (NodeState::WaitAck, NodeInput::None) => {
                // timeout: the store keeps the data, next scheduled upload
                // retries.
                self.next_wake = self.next_wake.wrapping_add(self.period_s);
                self.state = NodeState::Idle;
                NodeSideEffect::ScheduleWake { at: self.next_wake }
            }

            // Any unexpected state/message combination: return to Idle and
            // let the next scheduled wake retry.
            _ => {
                self.state = NodeState::Idle;
                NodeSideEffect::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_recovered_from_active_low_switches() {
        assert_eq!(resolve_node_address(0b1111_1110), 0b0000_0001);
    }

    #[test]
    fn boots_through_setup_and_beacon_into_wait_beacon() {
        let mut node: NodeProtocol<16> = NodeProtocol::new(0x01);
        assert_eq!(node.state(), NodeState::Setup);
        node.progress(0, NodeInput::None);
        assert_eq!(node.state(), NodeState::Beacon);
        assert!(matches!(
            node.get_action(),
            Action::Transmit { message: Message::Beacon, .. }
        ));
        node.progress(0, NodeInput::None);
        assert_eq!(node.state(), NodeState::WaitBeacon);
    }

    #[test]
    fn beacon_ack_installs_the_schedule_and_moves_to_idle() {
        let mut node: NodeProtocol<16> = NodeProtocol::new(0x01);
        node.progress(0, NodeInput::None);
        node.progress(0, NodeInput::None);
        let effect = node.progress(
            100,
            NodeInput::Message(Message::BeaconAck {
                time: 100,
                period: 30,
                next_wake: 130,
                flags: 0,
            }),
        );
        assert_eq!(node.state(), NodeState::Idle);
        assert_eq!(
            effect,
            NodeSideEffect::JamSetTimeAndScheduleWake { time_lo: 100, msb: 0, at: 130 }
        );
    }

    #[test]
    fn upload_completes_and_frees_the_store_on_ack() {
        let mut node: NodeProtocol<16> = NodeProtocol::new(0x01);
        node.record_observation(Observation::call(12, 5, false));
        node.record_observation(Observation {
            time: 13,
            kind: Kind::Temperature,
            payload: 21,
        });
        node.record_observation(Observation {
            time: 14,
            kind: Kind::Humidity,
            payload: 60,
        });

        // Drive straight to Idle with a schedule in place.
        node.progress(0, NodeInput::None);
        node.progress(0, NodeInput::None);
        node.progress(
            0,
            NodeInput::Message(Message::BeaconAck {
                time: 0,
                period: 30,
                next_wake: 0,
                flags: 0,
            }),
        );
        assert_eq!(node.state(), NodeState::Idle);

        node.progress(
            14,
            NodeInput::SensorReadings { temp: 1, humidity: 2, light: 3 },
        );
        assert_eq!(node.state(), NodeState::Send);
        assert_eq!(node.seq_total, 1);

        node.progress(14, NodeInput::None);
        assert_eq!(node.state(), NodeState::WaitAck);

        node.progress(14, NodeInput::Message(Message::Ack { time_lo: 100, msb: 0 }));
        assert_eq!(node.state(), NodeState::Idle);
        assert_eq!(node.store.size(), 0);
    }

    #[test]
    fn a_repeat_request_resends_and_stays_on_the_same_upload() {
        let mut node: NodeProtocol<16> = NodeProtocol::new(0x01);
        node.record_observation(Observation::call(1, 4, false));
        node.progress(0, NodeInput::None);
        node.progress(0, NodeInput::None);
        node.progress(
            0,
            NodeInput::Message(Message::BeaconAck { time: 0, period: 30, next_wake: 0, flags: 0 }),
        );
        node.progress(1, NodeInput::SensorReadings { temp: 0, humidity: 0, light: 0 });
        node.progress(1, NodeInput::None);
        assert_eq!(node.state(), NodeState::WaitAck);

        node.progress(1, NodeInput::Message(Message::Repeat { seq_total: 1, seq_index: 1 }));
        assert_eq!(node.state(), NodeState::Send);
        assert!(matches!(node.get_action(), Action::Transmit { .. }));

        node.progress(1, NodeInput::None);
        assert_eq!(node.state(), NodeState::WaitAck);
    }
}
