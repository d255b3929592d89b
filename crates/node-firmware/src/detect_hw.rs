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

//! Turns the acoustic comparator's GPIO edges and the monotonic clock into
//! the `DetectEvent`s the call-detection state machine consumes, and feeds
//! them back through `on_detect_event`. The comparator circuit and any
//! capture/compare timer peripheral that could do this in hardware are out
//! of scope for this codebase; this task polls instead.

use cricket_detect::{DetectAction, DetectEvent, DetectState};
use embassy_futures::select::{select, Either};
use embassy_stm32::exti::ExtiInput;
use embassy_time::{Duration, Instant, Timer};

#[embassy_executor::task]
pub async fn run(mut comparator: ExtiInput<'static>) {
    loop {
        let (action, state_before) = crate::detector_action_and_state().await;

        match action {
            DetectAction::ArmEdgeInterrupt => {
                comparator.wait_for_rising_edge().await;
                crate::on_detect_event(DetectEvent::Edge { time: crate::time_of_day(), elapsed_us: 0 });
            }
            DetectAction::RunWindow { top_us, short_timeout_us } => {
                run_window(&mut comparator, top_us, short_timeout_us, state_before).await;
            }
        }
    }
}

/// Races comparator edges against the window's short/long timeouts,
/// reporting each as it occurs, until either the long timeout fires or the
/// detector leaves `state_before` (a state change mid-window means the
/// next `get_action` call already describes a different window).
async fn run_window(
    comparator: &mut ExtiInput<'static>,
    top_us: u32,
    mut short_timeout_us: Option<u32>,
    state_before: DetectState,
) {
    let start = Instant::now();
    let long_deadline = start + Duration::from_micros(top_us as u64);
    let mut edges: u16 = 0;

    loop {
        let next_timeout = short_timeout_us
            .map(|us| start + Duration::from_micros(us as u64))
            .unwrap_or(long_deadline);

        match select(comparator.wait_for_rising_edge(), Timer::at(next_timeout)).await {
            Either::First(()) => {
                edges += 1;
                let elapsed_us = (Instant::now() - start).as_micros() as u32;
                crate::on_detect_event(DetectEvent::Edge { time: crate::time_of_day(), elapsed_us });
            }
            Either::Second(()) => {
                if short_timeout_us.is_some() {
                    short_timeout_us = None;
                    crate::on_detect_event(DetectEvent::ShortTimeout { edges });
                } else {
                    crate::on_detect_event(DetectEvent::LongTimeout { edges });
                    return;
                }
            }
        }

        let (_, state_now) = crate::detector_action_and_state().await;
        if state_now != state_before {
            return;
        }
    }
}
