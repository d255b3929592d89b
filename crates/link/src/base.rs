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

use cricket_wire::{Action, Message, Observation, MAX_OBSERVATIONS_PER_FRAGMENT};
use heapless::Vec;

use crate::persist::ObservationSink;

/// One registered node's claim on the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Slot {
    pub node_id: u8,
    pub retry_count: u8,
    pub offset: usize,
}

/// The `M`-entry slot-assignment table the base consults on every beacon.
/// `Option<Slot>` rather than parallel arrays plus a sentinel value.
pub struct ScheduleTable<const M: usize> {
    slots: [Option<Slot>; M],
}

impl<const M: usize> Default for ScheduleTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const M: usize> ScheduleTable<M> {
    pub fn new() -> Self {
        Self { slots: [None; M] }
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn find(&self, node_id: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(slot) if slot.node_id == node_id))
    }

    fn min_distance_to_occupied(&self, index: usize) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(j, s)| {
                s.as_ref()
                    .map(|_| if index > j { index - j } else { j - index })
            })
            .min()
    }

    /// Register `node_id` in the free slot maximizing distance to its
    /// nearest occupied neighbour, lower index breaking ties; an empty
    /// table always places at `M / 2`. Returns `None` if the table is
    /// already full.
    pub fn insert(&mut self, node_id: u8) -> Option<usize> {
        if let Some(existing) = self.find(node_id) {
            return Some(existing);
        }
        if self.slots.iter().all(Option::is_none) {
            let mid = M / 2;
            self.slots[mid] = Some(Slot { node_id, retry_count: 0, offset: mid });
            return Some(mid);
        }
        let mut best: Option<(usize, usize)> = None;
        for i in 0..M {
            if self.slots[i].is_some() {
                continue;
            }
            let dist = self.min_distance_to_occupied(i).unwrap_or(usize::MAX);
            match best {
                Some((_, best_dist)) if dist <= best_dist => {}
                _ => best = Some((i, dist)),
            }
        }
        let (index, _) = best?;
        self.slots[index] = Some(Slot { node_id, retry_count: 0, offset: index });
        Some(index)
    }

    /// Remove the slot, if any, returning whether a node was cleared.
    pub fn clear(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }

    /// Increment a slot's retry count, deregistering the node (clearing
    /// the slot) once it exceeds `max_retries` with no data received.
    pub fn bump_retry(&mut self, index: usize, max_retries: u8) {
        let deregister = match self.slots.get_mut(index) {
            Some(Some(slot)) => {
                slot.retry_count += 1;
                slot.retry_count > max_retries
            }
            _ => false,
        };
        if deregister {
            self.clear(index);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BaseState {
    Idle,
    Beacon,
    Awake,
    Recv,
    Arq,
    Repeating,
}

/// What the driver fed into `progress`: an action completed (timeout or a
/// transmit that finished), a recurring beacon window is due, a particular
/// slot's window is due, or a frame arrived.
pub enum BaseInput {
    None,
    BeaconWindowDue,
    SlotDue { node_id: u8 },
    Frame { src: u8, message: Message },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BaseSideEffect {
    None,
    /// A node registered; the driver should schedule its recurring wake.
    NodeRegistered { node_id: u8, slot: usize },
    /// A node failed to answer `max_retries` windows in a row and was
    /// dropped from the table.
    NodeDeregistered { node_id: u8 },
}

const MAX_REPEAT: usize = 20;
const DEFAULT_PERIOD_S: u32 = 30;
const BEACON_LENGTH_S: u32 = 5;
const DEFAULT_MAX_RETRIES: u8 = 3;
const INITIAL_TIMEOUT_S: u32 = 10;
const SHORT_TIMEOUT_S: u32 = 1; // 750ms rounded up to one whole tick of the second-granular time source

fn step(period_s: u32, beacon_length_s: u32, m: usize) -> u32 {
    (period_s.saturating_sub(beacon_length_s)) / m as u32
}

/// Receive, reassemble, and ACK uploads from up to `M` registered nodes.
/// `FRAGS` bounds the number of fragments one upload may carry; `CAP`
/// must equal `FRAGS * MAX_OBSERVATIONS_PER_FRAGMENT` (the flat
/// reassembly buffer's size — Rust's const generics don't let us compute
/// that product from `FRAGS` alone).
pub struct BaseProtocol<const M: usize, const FRAGS: usize, const CAP: usize, S: ObservationSink> {
    table: ScheduleTable<M>,
    state: BaseState,
    source: Option<u8>,
    seq_total: u8,
    last_index_seen: u8,
    repeat_queue: Vec<u8, MAX_REPEAT>,
    reassembly: [Option<Observation>; CAP],
    pending_repeat: Option<u8>,
    /// A `BeaconAck` queued for transmission, keyed by destination, while
    /// the beacon window stays open for other nodes to register.
    pending_ack: Option<(u8, Message)>,
    ack_time: u32,
    wait_until: u32,
    max_retries: u8,
    sink: S,
}

impl<const M: usize, const FRAGS: usize, const CAP: usize, S: ObservationSink>
    BaseProtocol<M, FRAGS, CAP, S>
{
    pub fn new(sink: S) -> Self {
        Self {
            table: ScheduleTable::new(),
            state: BaseState::Idle,
            source: None,
            seq_total: 0,
            last_index_seen: 0,
            repeat_queue: Vec::new(),
            reassembly: [None; CAP],
            pending_repeat: None,
            pending_ack: None,
            ack_time: 0,
            wait_until: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            sink,
        }
    }

    pub fn state(&self) -> BaseState {
        self.state
    }

    pub fn table(&self) -> &ScheduleTable<M> {
        &self.table
    }

    fn place_fragment(&mut self, index: u8, observations: &[Observation]) {
        let base = (index as usize - 1) * MAX_OBSERVATIONS_PER_FRAGMENT;
        for (k, obs) in observations.iter().enumerate() {
            if let Some(slot) = self.reassembly.get_mut(base + k) {
                *slot = Some(*obs);
            }
        }
    }

    fn note_missing_up_to(&mut self, limit: u8) {
        for j in (self.last_index_seen + 1)..limit {
            if self.repeat_queue.len() < MAX_REPEAT {
                let _ = self.repeat_queue.push(j);
            }
        }
    }

    fn finalize_window(&mut self) {
        if let Some(source) = self.source {
            let mut flat: Vec<Observation, CAP> = Vec::new();
            for obs in self.reassembly.iter().flatten() {
                let _ = flat.push(*obs);
            }
            self.sink.persist(source, &flat);
        }
        self.source = None;
        self.state = BaseState::Idle;
    }

    pub fn get_action(&self) -> Action<u32, Message> {
        match self.state {
            BaseState::Idle => Action::None,
            BaseState::Beacon => match &self.pending_ack {
                Some((dst, message)) => {
                    Action::Transmit { dst: *dst, message: message.clone(), delay: None }
                }
                None => Action::Receive { end: self.wait_until },
            },
            BaseState::Awake | BaseState::Recv => Action::Receive { end: self.wait_until },
            BaseState::Arq => match self.repeat_queue.first() {
                Some(&index) => Action::Transmit {
                    dst: self.source.unwrap_or(0),
                    message: Message::Repeat { seq_total: self.seq_total, seq_index: index },
                    delay: None,
                },
                None => Action::Transmit {
                    dst: self.source.unwrap_or(0),
                    message: Message::Ack {
                        time_lo: (self.ack_time & 0xFFFF) as u16,
                        msb: ((self.ack_time >> 16) & 0x1) as u8,
                    },
                    delay: None,
                },
            },
            BaseState::Repeating => Action::Receive { end: self.wait_until },
        }
    }

    /// Advance the protocol by one input, returning work the driver must do
    /// that falls outside this protocol's own state (scheduling a newly
    /// registered node's wake, say).
    pub fn progress(&mut self, time: u32, input: BaseInput) -> BaseSideEffect {
        match (self.state, input) {
            (BaseState::Idle, BaseInput::BeaconWindowDue) => {
                self.state = BaseState::Beacon;
                self.wait_until = time + BEACON_LENGTH_S;
                BaseSideEffect::None
            }
            (BaseState::Beacon, BaseInput::Frame { src, message: Message::Beacon }) => {
                match self.table.insert(src) {
                    Some(slot) => {
                        let next_wake = time + slot as u32 * step(DEFAULT_PERIOD_S, BEACON_LENGTH_S, M);
                        self.pending_ack = Some((
                            src,
                            Message::BeaconAck {
                                time,
                                period: DEFAULT_PERIOD_S,
                                next_wake,
                                flags: 0,
                            },
                        ));
                        BaseSideEffect::NodeRegistered { node_id: src, slot }
                    }
                    None => BaseSideEffect::None,
                }
            }
            (BaseState::Beacon, BaseInput::None) => {
                if self.pending_ack.take().is_some() {
                    // the queued BeaconAck just went out; keep the window
                    // open for other nodes until it times out.
                    BaseSideEffect::None
                } else {
                    self.state = BaseState::Idle;
                    BaseSideEffect::None
                }
            }

            (BaseState::Idle, BaseInput::SlotDue { node_id }) => {
                if self.table.find(node_id).is_some() {
                    self.source = Some(node_id);
                    self.seq_total = 0;
                    self.last_index_seen = 0;
                    self.repeat_queue.clear();
                    self.reassembly = [None; CAP];
                    self.wait_until = time + INITIAL_TIMEOUT_S;
                    self.state = BaseState::Awake;
                }
                BaseSideEffect::None
            }
            (BaseState::Awake, BaseInput::None) => {
                if let Some(src) = self.source {
                    if let Some(index) = self.table.find(src) {
                        self.table.bump_retry(index, self.max_retries);
                        if self.table.get(index).is_none() {
                            self.source = None;
                            self.state = BaseState::Idle;
                            return BaseSideEffect::NodeDeregistered { node_id: src };
                        }
                    }
                }
                self.source = None;
                self.state = BaseState::Idle;
                BaseSideEffect::None
            }
            (
                BaseState::Awake,
                BaseInput::Frame { src, message: Message::Data { seq_total, seq_index, observations } },
            ) if Some(src) == self.source => {
                self.seq_total = seq_total;
                self.note_missing_up_to(seq_index);
                self.place_fragment(seq_index, &observations);
                self.last_index_seen = seq_index;
                self.wait_until = time + SHORT_TIMEOUT_S;
                if seq_index == seq_total {
                    self.ack_time = time;
                    self.state = BaseState::Arq;
                } else {
                    self.state = BaseState::Recv;
                }
                BaseSideEffect::None
            }

            (
                BaseState::Recv,
                BaseInput::Frame { src, message: Message::Data { seq_total, seq_index, observations } },
            ) if Some(src) == self.source => {
                self.seq_total = seq_total;
                self.note_missing_up_to(seq_index);
                self.place_fragment(seq_index, &observations);
                self.last_index_seen = seq_index;
                if seq_index == seq_total {
                    self.ack_time = time;
                    self.state = BaseState::Arq;
                } else {
                    self.wait_until = time + SHORT_TIMEOUT_S;
                }
                BaseSideEffect::None
            }
            (BaseState::Recv, BaseInput::Frame { .. }) => BaseSideEffect::None,
            (BaseState::Recv, BaseInput::None) => {
                self.note_missing_up_to(self.seq_total + 1);
                self.ack_time = time;
                self.state = BaseState::Arq;
                BaseSideEffect::None
            }

            (BaseState::Arq, BaseInput::Frame { .. }) => BaseSideEffect::None,
            (BaseState::Arq, BaseInput::None) => {
                match self.repeat_queue.first().copied() {
                    Some(index) => {
                        self.repeat_queue.remove(0);
                        self.pending_repeat = Some(index);
                        self.wait_until = time + SHORT_TIMEOUT_S;
                        self.state = BaseState::Repeating;
                    }
                    None => self.finalize_window(),
                }
                BaseSideEffect::None
            }
            (
                BaseState::Repeating,
                BaseInput::Frame { src, message: Message::Data { seq_index, observations, .. } },
            ) if Some(src) == self.source && Some(seq_index) == self.pending_repeat => {
                self.place_fragment(seq_index, &observations);
                self.pending_repeat = None;
                self.state = BaseState::Arq;
                BaseSideEffect::None
            }
            (BaseState::Repeating, BaseInput::Frame { .. }) => BaseSideEffect::None,
            (BaseState::Repeating, BaseInput::None) => {
                // gave up this window; the node will retry next cycle.
                self.pending_repeat = None;
                self.source = None;
                self.state = BaseState::Idle;
                BaseSideEffect::None
            }

            // any unexpected state/input combination: return to Idle.
            _ => {
                self.source = None;
                self.state = BaseState::Idle;
                BaseSideEffect::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink {
        rows: std::vec::Vec<(u8, Observation)>,
    }

    impl ObservationSink for VecSink {
        fn persist(&mut self, node_id: u8, observations: &[Observation]) {
            for obs in observations {
                self.rows.push((node_id, *obs));
            }
        }
    }

    #[test]
    fn an_empty_table_places_the_first_node_at_the_middle() {
        let mut table: ScheduleTable<20> = ScheduleTable::new();
        let slot = table.insert(0x01).unwrap();
        assert_eq!(slot, 10);
    }

    #[test]
    fn insertion_maximizes_distance_to_the_nearest_neighbour() {
        let mut table: ScheduleTable<20> = ScheduleTable::new();
        table.insert(0x01); // slot 10
        let slot = table.insert(0x02).unwrap();
        // farthest from 10 in [0,19] is 0 or 19; lower index wins the tie.
        assert_eq!(slot, 0);
    }

    #[test]
    fn three_silent_windows_deregister_a_node() {
        let mut table: ScheduleTable<20> = ScheduleTable::new();
        let slot = table.insert(0x02).unwrap();
        for _ in 0..3 {
            table.bump_retry(slot, 3);
        }
        assert!(table.get(slot).is_none());
    }

    fn data(seq_total: u8, seq_index: u8, obs: &[Observation]) -> Message {
        let mut observations: Vec<Observation, MAX_OBSERVATIONS_PER_FRAGMENT> = Vec::new();
        for o in obs {
            let _ = observations.push(*o);
        }
        Message::Data { seq_total, seq_index, observations }
    }

    #[test]
    fn a_beacon_registers_the_node_and_queues_a_beacon_ack() {
        let mut base: BaseProtocol<20, 4, { 4 * MAX_OBSERVATIONS_PER_FRAGMENT }, VecSink> =
            BaseProtocol::new(VecSink { rows: std::vec::Vec::new() });
        base.progress(100, BaseInput::BeaconWindowDue);
        assert_eq!(base.state(), BaseState::Beacon);

        let effect = base.progress(100, BaseInput::Frame { src: 0x01, message: Message::Beacon });
        assert_eq!(effect, BaseSideEffect::NodeRegistered { node_id: 0x01, slot: 10 });
        assert!(matches!(
            base.get_action(),
            Action::Transmit { dst: 0x01, message: Message::BeaconAck { .. }, .. }
        ));
    }

    #[test]
    fn a_clean_three_observation_upload_is_acked_and_persisted() {
        let mut base: BaseProtocol<20, 4, { 4 * MAX_OBSERVATIONS_PER_FRAGMENT }, VecSink> =
            BaseProtocol::new(VecSink { rows: std::vec::Vec::new() });
        base.table.insert(0x01);
        base.progress(100, BaseInput::SlotDue { node_id: 0x01 });
        assert_eq!(base.state(), BaseState::Awake);

        let obs = [
            Observation::call(12, 5, false),
            Observation { time: 13, kind: cricket_wire::Kind::Temperature, payload: 21 },
            Observation { time: 14, kind: cricket_wire::Kind::Humidity, payload: 60 },
        ];
        base.progress(100, BaseInput::Frame { src: 0x01, message: data(1, 1, &obs) });
        assert_eq!(base.state(), BaseState::Arq);
        assert!(matches!(
            base.get_action(),
            Action::Transmit { message: Message::Ack { .. }, .. }
        ));

        base.progress(100, BaseInput::None);
        assert_eq!(base.state(), BaseState::Idle);
        assert_eq!(base.sink.rows.len(), 3);
    }

    #[test]
    fn a_single_lost_fragment_is_repeated_and_then_acked() {
        let mut base: BaseProtocol<20, 4, { 4 * MAX_OBSERVATIONS_PER_FRAGMENT }, VecSink> =
            BaseProtocol::new(VecSink { rows: std::vec::Vec::new() });
        base.table.insert(0x01);
        base.progress(0, BaseInput::SlotDue { node_id: 0x01 });

        let a = Observation::call(1, 4, false);
        let c = Observation::call(3, 4, false);
        base.progress(0, BaseInput::Frame { src: 0x01, message: data(3, 1, &[a]) });
        assert_eq!(base.state(), BaseState::Recv);
        base.progress(0, BaseInput::Frame { src: 0x01, message: data(3, 3, &[c]) });
        assert_eq!(base.state(), BaseState::Arq);

        assert!(matches!(
            base.get_action(),
            Action::Transmit { message: Message::Repeat { seq_total: 3, seq_index: 2 }, .. }
        ));
        base.progress(0, BaseInput::None);
        assert_eq!(base.state(), BaseState::Repeating);

        let b = Observation::call(2, 4, false);
        base.progress(0, BaseInput::Frame { src: 0x01, message: data(3, 2, &[b]) });
        assert_eq!(base.state(), BaseState::Arq);
        assert!(matches!(
            base.get_action(),
            Action::Transmit { message: Message::Ack { .. }, .. }
        ));
        base.progress(0, BaseInput::None);
        assert_eq!(base.sink.rows.len(), 3);
    }
}
