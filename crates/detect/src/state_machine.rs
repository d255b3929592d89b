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

use crate::params::*;

/// One short-timeout compare point, fired roughly 200 us into a pulse
/// window to reject a spurious wakeup early.
pub const SHORT_TIMEOUT_US: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DetectState {
    Idle,
    FirstHigh,
    High,
    Low,
    Wait,
    HighFem,
    LowFem,
}

/// What the edge-timer/edge-counter pair should be configured to do while
/// in the returned state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DetectAction {
    /// Nothing running; wait for the next rising edge.
    ArmEdgeInterrupt,
    /// Run the window timer for `top_us`, with an optional short-timeout
    /// compare at `short_timeout_us`.
    RunWindow {
        top_us: u32,
        short_timeout_us: Option<u32>,
    },
}

/// Events the edge-timer abstraction delivers to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DetectEvent {
    /// A rising edge, with the time-of-day it occurred at and how far into
    /// the current window it landed.
    Edge { time: u32, elapsed_us: u32 },
    /// ~200 us into the window, carrying the edge count so far.
    ShortTimeout { edges: u16 },
    /// The window timer wrapped, carrying the final edge count.
    LongTimeout { edges: u16 },
}

fn is_high_like(state: DetectState) -> bool {
    matches!(state, DetectState::FirstHigh | DetectState::High | DetectState::HighFem)
}

fn is_low_like(state: DetectState) -> bool {
    matches!(state, DetectState::Low | DetectState::LowFem)
}

/// The cricket-call detection state machine.
///
/// A pure `(state, event) -> state` transition function, plus the
/// per-call context (`clicks`, `transient`, `call_start_time`) owned as
/// plain struct fields rather than file-scope globals.
pub struct Detector {
    state: DetectState,
    clicks: u8,
    transient: u8,
    call_start_time: u32,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    pub fn new() -> Self {
        Self {
            state: DetectState::Idle,
            clicks: 0,
            transient: 0,
            call_start_time: 0,
        }
    }

    pub fn state(&self) -> DetectState {
        self.state
    }

    pub fn get_action(&self) -> DetectAction {
        match self.state {
            DetectState::Idle => DetectAction::ArmEdgeInterrupt,
            DetectState::FirstHigh | DetectState::High | DetectState::HighFem => {
                DetectAction::RunWindow {
                    top_us: HIGH_UB_US,
                    short_timeout_us: Some(SHORT_TIMEOUT_US),
                }
            }
            DetectState::Low | DetectState::LowFem => DetectAction::RunWindow {
                top_us: LOW_UB_US,
                short_timeout_us: None,
            },
            DetectState::Wait => DetectAction::RunWindow {
                top_us: WAIT_FEM_UB_US,
                short_timeout_us: None,
            },
        }
    }

    /// Emit an Observation if `clicks` falls in the valid call range,
    /// discarding it (no emission) otherwise.
    fn try_finalize(&self, female: bool) -> Option<Observation> {
        if self.clicks >= CLICKS_MIN && self.clicks <= CLICKS_MAX {
            Some(Observation::call(self.call_start_time, self.clicks, female))
        } else {
            None
        }
    }

    /// Advance the state machine on one event, returning an Observation if
    /// this event finalized a call.
    pub fn progress(&mut self, event: DetectEvent) -> Option<Observation> {
        // Transient noise: edges arriving before the minimum expected pulse
        // (High-like) or gap (Low-like) duration, short of a timeout.
        if let DetectEvent::Edge { elapsed_us, .. } = event {
            if is_high_like(self.state) && elapsed_us < HIGH_LB_US {
                return self.bump_transient();
            }
            if is_low_like(self.state) && elapsed_us < LOW_LB_US {
                return self.bump_transient();
            }
        }

        match (self.state, event) {
            (DetectState::Idle, DetectEvent::Edge { time, .. }) => {
                self.clicks = 0;
                self.transient = 0;
                self.call_start_time = time;
                self.state = DetectState::FirstHigh;
                None
            }

            (DetectState::FirstHigh, DetectEvent::ShortTimeout { edges }) => {
                if edges < SHORT_TIMEOUT_MIN_EDGES {
                    self.state = DetectState::Idle;
                }
                None
            }
            (DetectState::High, DetectEvent::ShortTimeout { edges }) => {
                if edges < SHORT_TIMEOUT_MIN_EDGES {
                    self.state = DetectState::Wait;
                }
                None
            }
            (DetectState::HighFem, DetectEvent::ShortTimeout { edges }) => {
                if edges < SHORT_TIMEOUT_MIN_EDGES {
                    // Not a real female-response pulse; the original call's
                    // Observation was already emitted when we entered this
                    // state, so there is nothing left to finalize.
                    self.state = DetectState::Idle;
                }
                None
            }

            (DetectState::FirstHigh, DetectEvent::LongTimeout { edges })
            | (DetectState::High, DetectEvent::LongTimeout { edges }) => {
                if edges >= EDGE_MIN_HIGH && edges <= EDGE_MAX_HIGH && self.clicks <= CLICKS_MAX {
                    self.state = DetectState::Low;
                    None
                } else {
                    let obs = self.try_finalize(false);
                    self.state = DetectState::Idle;
                    obs
                }
            }
            (DetectState::Low, DetectEvent::LongTimeout { edges }) => {
                if edges <= EDGE_THRESHOLD_LOW {
                    self.clicks = (self.clicks + 1).min(CLICKS_MAX);
                    self.state = DetectState::Wait;
                    None
                } else {
                    let obs = self.try_finalize(false);
                    self.state = DetectState::Idle;
                    obs
                }
            }

            (DetectState::HighFem, DetectEvent::LongTimeout { edges }) => {
                if edges >= EDGE_MIN_HIGH && edges <= EDGE_MAX_HIGH {
                    self.state = DetectState::LowFem;
                } else {
                    self.state = DetectState::Idle;
                }
                None
            }
            (DetectState::LowFem, DetectEvent::LongTimeout { edges }) => {
                let obs = if edges <= EDGE_THRESHOLD_LOW {
                    self.clicks = 1;
                    Some(Observation::call(self.call_start_time, 1, true))
                } else {
                    None
                };
                self.state = DetectState::Idle;
                obs
            }

            (DetectState::Wait, DetectEvent::Edge { elapsed_us, .. })
                if elapsed_us > HIGH_LB_US && elapsed_us < WAIT_FEM_LB_US =>
            {
                self.state = DetectState::High;
                None
            }
            (DetectState::Wait, DetectEvent::Edge { elapsed_us, .. })
                if elapsed_us >= WAIT_FEM_LB_US =>
            {
                let obs = self.try_finalize(false);
                self.clicks = 0;
                self.state = DetectState::HighFem;
                obs
            }
            (DetectState::Wait, DetectEvent::Edge { .. }) => None,
            (DetectState::Wait, DetectEvent::LongTimeout { .. }) => {
                let obs = self.try_finalize(false);
                self.state = DetectState::Idle;
                obs
            }

            // Any unexpected state/event combination is treated as a
            // return to Idle.
            _ => {
                self.state = DetectState::Idle;
                None
            }
        }
    }

    fn bump_transient(&mut self) -> Option<Observation> {
        self.transient += 1;
        if self.transient > TRANSIENT_THRESHOLD {
            self.state = DetectState::Idle;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives `n` complete click cycles. The caller must already have sent
    /// the first edge (putting the detector in `FirstHigh`) before calling
    /// this; each subsequent click re-enters `High` from `Wait` via an edge
    /// that lands inside the "next click" window.
    fn run_clicks(d: &mut Detector, n: u16) {
        for i in 0..n {
            if i > 0 {
                assert_eq!(
                    d.progress(DetectEvent::Edge { time: 0, elapsed_us: 1_000 }),
                    None
                );
                assert_eq!(d.state(), DetectState::High);
            }
            assert_eq!(d.progress(DetectEvent::ShortTimeout { edges: 10 }), None);
            assert_eq!(d.progress(DetectEvent::LongTimeout { edges: 35 }), None);
            assert_eq!(d.progress(DetectEvent::LongTimeout { edges: 2 }), None);
        }
    }

    #[test]
    fn seven_clean_clicks_then_silence_emits_one_call() {
        let mut d = Detector::new();
        assert_eq!(d.progress(DetectEvent::Edge { time: 1000, elapsed_us: 0 }), None);
        run_clicks(&mut d, 7);
        assert_eq!(d.state(), DetectState::Wait);
        let obs = d.progress(DetectEvent::LongTimeout { edges: 0 }).unwrap();
        assert_eq!(obs.time, 1000);
        assert_eq!(obs.click_count(), 7);
        assert!(!obs.is_female_response());
        assert_eq!(d.state(), DetectState::Idle);
    }

    #[test]
    fn female_response_emits_a_second_observation_with_the_flag_set() {
        let mut d = Detector::new();
        d.progress(DetectEvent::Edge { time: 1000, elapsed_us: 0 });
        run_clicks(&mut d, 7);
        assert_eq!(d.state(), DetectState::Wait);

        // a further pulse >=25ms later
        let first = d
            .progress(DetectEvent::Edge { time: 1000, elapsed_us: 30_000 })
            .unwrap();
        assert_eq!(first.time, 1000);
        assert_eq!(first.click_count(), 7);
        assert!(!first.is_female_response());
        assert_eq!(d.state(), DetectState::HighFem);

        // followed by one more pulse completing the female click
        assert_eq!(d.progress(DetectEvent::ShortTimeout { edges: 10 }), None);
        assert_eq!(d.progress(DetectEvent::LongTimeout { edges: 35 }), None);
        let second = d.progress(DetectEvent::LongTimeout { edges: 2 }).unwrap();
        assert_eq!(second.time, 1000);
        assert_eq!(second.click_count(), 1);
        assert!(second.is_female_response());
        assert_eq!(d.state(), DetectState::Idle);
    }

    #[test]
    fn short_sequences_return_to_idle_without_emitting() {
        let mut d = Detector::new();
        d.progress(DetectEvent::Edge { time: 5, elapsed_us: 0 });
        assert_eq!(d.progress(DetectEvent::ShortTimeout { edges: 1 }), None);
        assert_eq!(d.state(), DetectState::Idle);
    }

    #[test]
    fn too_many_transient_edges_abort_without_emitting() {
        let mut d = Detector::new();
        d.progress(DetectEvent::Edge { time: 5, elapsed_us: 0 });
        assert_eq!(d.state(), DetectState::FirstHigh);
        for _ in 0..=TRANSIENT_THRESHOLD {
            d.progress(DetectEvent::Edge { time: 5, elapsed_us: 10 });
        }
        assert_eq!(d.state(), DetectState::Idle);
    }

    #[test]
    fn a_call_with_too_few_clicks_is_not_emitted() {
        let mut d = Detector::new();
        d.progress(DetectEvent::Edge { time: 5, elapsed_us: 0 });
        run_clicks(&mut d, 2);
        assert_eq!(d.progress(DetectEvent::LongTimeout { edges: 0 }), None);
        assert_eq!(d.state(), DetectState::Idle);
    }

    #[test]
    fn clicks_saturate_at_the_upper_bound() {
        let mut d = Detector::new();
        d.progress(DetectEvent::Edge { time: 5, elapsed_us: 0 });
        run_clicks(&mut d, 12);
        let obs = d.progress(DetectEvent::LongTimeout { edges: 0 }).unwrap();
        assert_eq!(obs.click_count(), CLICKS_MAX);
    }
}
