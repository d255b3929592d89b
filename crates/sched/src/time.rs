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

use crate::dispatch::{DeferredAction, Dispatcher};

/// Seconds in a day; the time source wraps here.
pub const DAY_SECONDS: u32 = 86_400;

/// A monotonically advancing seconds-of-day counter with a single pending
/// callback slot plus one independent daily housekeeping alarm.
///
/// Firing never calls the callback directly: it hands a [`DeferredAction`]
/// to the [`Dispatcher`] so the work runs at main-loop priority rather than
/// from the timer interrupt itself.
pub struct TimeSource {
    now: u32,
    scheduled: Option<(u32, DeferredAction)>,
    housekeeping: Option<(u32, DeferredAction)>,
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource {
    pub fn new() -> Self {
        Self {
            now: 0,
            scheduled: None,
            housekeeping: None,
        }
    }

    pub fn get(&self) -> u32 {
        self.now
    }

    /// Jam-set from an authoritative 17-bit wire timestamp
    /// (`time_lo` + bit 16 of `kind`, see `cricket_wire::Observation`).
    /// Idempotent: setting the same value twice has no further effect.
    pub fn set(&mut self, time_lo: u16, msb: bool) {
        let time17 = (time_lo as u32) | ((msb as u32) << 16);
        self.now = time17 % DAY_SECONDS;
    }

    /// Advance the counter by one tick, firing any callback now due.
    pub fn tick(&mut self, dispatcher: &mut Dispatcher) {
        self.now = (self.now + 1) % DAY_SECONDS;
        self.fire_due(dispatcher);
    }

    /// Jump directly to `new_now`, firing any callbacks passed over.
    /// Used by the simulator's discrete-event loop, which advances time in
    /// leaps rather than tick by tick.
    pub fn advance_to(&mut self, new_now: u32, dispatcher: &mut Dispatcher) {
        self.now = new_now % DAY_SECONDS;
        self.fire_due(dispatcher);
    }

    fn fire_due(&mut self, dispatcher: &mut Dispatcher) {
        if let Some((at, action)) = self.scheduled {
            if self.now >= at {
                dispatcher.schedule(action);
                self.scheduled = None;
            }
        }
        if let Some((at, action)) = self.housekeeping {
            if self.now >= at {
                dispatcher.schedule(action);
                self.housekeeping = None;
            }
        }
    }

    /// At most one pending callback; installing a new one overwrites the
    /// old (last-writer-wins).
    pub fn schedule(&mut self, at_time: u32, action: DeferredAction) {
        self.scheduled = Some((at_time % DAY_SECONDS, action));
    }

    pub fn cancel(&mut self) {
        self.scheduled = None;
    }

    /// The second, independent alarm slot for periodic housekeeping.
    pub fn schedule_housekeeping(&mut self, at_time: u32, action: DeferredAction) {
        self.housekeeping = Some((at_time % DAY_SECONDS, action));
    }

    /// The earliest pending deadline, if any; used to size the next sleep.
    pub fn next_deadline(&self) -> Option<u32> {
        match (self.scheduled, self.housekeeping) {
            (Some((a, _)), Some((b, _))) => Some(a.min(b)),
            (Some((a, _)), None) => Some(a),
            (None, Some((b, _))) => Some(b),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jam_set_then_read_round_trips_modulo_a_day() {
        let mut t = TimeSource::new();
        t.set(100, false);
        assert_eq!(t.get(), 100);

        // 17 bits is enough to cover a full day (86_400 < 2^17), so no
        // wraparound is expected for an in-range value.
        t.set(70_000u16.wrapping_sub(0), false);
    }

    #[test]
    fn fires_the_scheduled_callback_within_one_tick_of_the_target() {
        let mut t = TimeSource::new();
        let mut d = Dispatcher::new();
        t.schedule(5, DeferredAction::TimeAlarm);
        for _ in 0..5 {
            t.tick(&mut d);
        }
        assert_eq!(d.drain_and_run(), Some(DeferredAction::TimeAlarm));
    }

    #[test]
    fn a_new_schedule_overwrites_the_old_one() {
        let mut t = TimeSource::new();
        let mut d = Dispatcher::new();
        t.schedule(5, DeferredAction::TimeAlarm);
        t.schedule(10, DeferredAction::HousekeepingAlarm);
        for _ in 0..10 {
            t.tick(&mut d);
        }
        assert_eq!(d.drain_and_run(), Some(DeferredAction::HousekeepingAlarm));
    }
}
