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

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rand::{RngCore, SeedableRng};
use std::env;

use cricket_event_log::CsvObservationSink;
use cricket_link::BaseProtocol;

mod logger;
mod sim;

use crate::sim::*;

const EVENT_FILE_PATH: &str = "/tmp/cricket_protocol_events.csv";
const OBSERVATION_FILE_PATH: &str = "/tmp/cricket_observations.csv";

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut rng_seed: u64 = 0;
    let mut num_nodes: usize = 8;
    let mut simulation_minutes: usize = 90;

    for chunk in args[1..].chunks_exact(2) {
        let (arg, val) = (&chunk[0], &chunk[1]);
        match arg.as_str() {
            "--seed" => {
                rng_seed = val.parse().expect("invalid rng seed");
            }
            "--nodes" => {
                num_nodes = val.parse().expect("invalid number of nodes");
            }
            "--time_min" => {
                simulation_minutes = val.parse().expect("invalid number of simulation minutes");
            }
            _ => panic!("unknown argument: {}", arg),
        }
    }

    assert!(num_nodes > 0 && num_nodes < 0xFF, "invalid number of nodes");

    // Node addresses are only used to pick a deterministic startup order here;
    // the protocol itself learns them from each node's beacon.
    let mut rng = get_rng(rng_seed);
    let mut node_addrs: Vec<u8> = (1..=num_nodes as u8).collect();
    for i in (1..node_addrs.len()).rev() {
        let j = rng.next_u32() as usize % (i + 1);
        node_addrs.swap(i, j);
    }

    logger::init(log::Level::Trace, Some(EVENT_FILE_PATH)).unwrap();

    let sink = CsvObservationSink::new(OBSERVATION_FILE_PATH);
    let base = BaseProtocol::new(sink);
    let mut network = Network::new(base, &node_addrs);
    network.run((simulation_minutes * 60) as u32);

    println!("observations written to {}", OBSERVATION_FILE_PATH);
}

fn get_rng(rng_seed: u64) -> impl RngCore {
    println!("RNG seed: {rng_seed:#x}");
    rand_chacha::ChaCha8Rng::seed_from_u64(rng_seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cricket_detect::{DetectEvent, Detector};
    use cricket_wire::{Kind, Observation};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<(u8, Vec<Observation>)>>>);

    impl cricket_link::ObservationSink for SharedSink {
        fn persist(&mut self, node_id: u8, observations: &[Observation]) {
            self.0.borrow_mut().push((node_id, observations.to_vec()));
        }
    }

    impl SharedSink {
        fn observations(&self) -> Vec<Observation> {
            self.0.borrow().iter().flat_map(|(_, obs)| obs.iter().copied()).collect()
        }
    }

    fn new_base() -> (SharedSink, BaseImpl<SharedSink>) {
        let sink = SharedSink::default();
        (sink.clone(), BaseProtocol::new(sink))
    }

    /// One node, a clean upload cycle: beacon handshake, slot assignment, and
    /// an unimpeded upload all the way to the sink.
    #[test]
    fn clean_upload_reaches_the_sink() {
        let (sink, base) = new_base();
        let mut network = Network::new(base, &[0x05]);
        network.node_mut(0).record_observation(Observation {
            time: 0,
            kind: Kind::Temperature,
            payload: 21,
        });
        network.run(BEACON_PERIOD_S * 3);

        assert!(network.base().table().find(0x05).is_some());
        let observations = sink.observations();
        assert!(observations.iter().any(|o| o.kind == Kind::Temperature && o.payload == 21));
    }

    /// Losing a single fragment forces a `Repeat`; the retry still lands.
    #[test]
    fn single_fragment_loss_is_recovered_by_repeat() {
        let (sink, base) = new_base();
        let mut network = Network::new(base, &[0x05]);
        network.node_mut(0).record_observation(Observation {
            time: 0,
            kind: Kind::Humidity,
            payload: 55,
        });
        network.drop_nth_delivery_to(ActorId::Base, 2);
        network.run(BEACON_PERIOD_S * 3);

        let observations = sink.observations();
        assert!(observations.iter().any(|o| o.kind == Kind::Humidity && o.payload == 55));
    }

    /// Losing the last fragment of an upload times out and is retried from
    /// scratch via a fresh `Repeat` round.
    #[test]
    fn last_fragment_loss_recovers_after_timeout() {
        let (sink, base) = new_base();
        let mut network = Network::new(base, &[0x05]);
        network.node_mut(0).record_observation(Observation {
            time: 0,
            kind: Kind::Light,
            payload: 9,
        });
        network.drop_nth_delivery_to(ActorId::Base, 3);
        network.run(BEACON_PERIOD_S * 6);

        let observations = sink.observations();
        assert!(observations.iter().any(|o| o.kind == Kind::Light && o.payload == 9));
    }

    /// Several nodes register in the beacon window and each gets a distinct
    /// slot in the schedule table.
    #[test]
    fn multiple_nodes_register_into_distinct_slots() {
        let (_sink, base) = new_base();
        let addrs = [0x01, 0x02, 0x03];
        let network = Network::new(base, &addrs);

        let mut slots = Vec::new();
        for addr in addrs {
            let slot = network.base().table().find(addr).expect("node should be registered");
            slots.push(slot);
        }
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), addrs.len());
    }

    /// A node that stops transmitting entirely is dropped from the schedule
    /// after enough missed windows.
    #[test]
    fn silent_node_is_eventually_deregistered() {
        let (_sink, base) = new_base();
        let mut network = Network::new(base, &[0x07]);
        assert!(network.base().table().find(0x07).is_some());

        network.disable_node(0);
        network.run(BEACON_PERIOD_S * 25);

        assert!(network.base().table().find(0x07).is_none());
    }

    /// A confirmed call, followed by a female response within the listening
    /// window, yields two observations: the call and the flagged response.
    #[test]
    fn detection_with_female_response_is_recorded() {
        let mut d = Detector::new();
        d.progress(DetectEvent::Edge { time: 1000, elapsed_us: 0 });
        for i in 0..7u16 {
            if i > 0 {
                d.progress(DetectEvent::Edge { time: 0, elapsed_us: 1_000 });
            }
            d.progress(DetectEvent::ShortTimeout { edges: 10 });
            d.progress(DetectEvent::LongTimeout { edges: 35 });
            d.progress(DetectEvent::LongTimeout { edges: 2 });
        }

        let call = d
            .progress(DetectEvent::Edge { time: 1000, elapsed_us: 30_000 })
            .expect("the call should finalize once the female-window pulse arrives");
        assert!(!call.is_female_response());

        d.progress(DetectEvent::ShortTimeout { edges: 10 });
        d.progress(DetectEvent::LongTimeout { edges: 35 });
        let female = d
            .progress(DetectEvent::LongTimeout { edges: 2 })
            .expect("a clean female pulse should finalize");
        assert!(female.is_female_response());

        let mut node = NodeImpl::new(0x09);
        node.record_observation(call);
        node.record_observation(female);
    }
}
