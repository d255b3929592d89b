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

/// Platform-neutral names for the arbitration policy; not the platform's
/// own mode-register values. Ordered shallowest first so the arbiter can
/// pick the minimum across all subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    FullOn,
    LightSleep,
    DeepSleep,
    Stop,
}

/// The subsystems the arbiter tracks a minimum power requirement for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Subsystem {
    Radio,
    Detect,
    Sensor,
    Delay,
    Modem,
    Rtc,
}

const NUM_SUBSYSTEMS: usize = 6;

fn index(subsystem: Subsystem) -> usize {
    match subsystem {
        Subsystem::Radio => 0,
        Subsystem::Detect => 1,
        Subsystem::Sensor => 2,
        Subsystem::Delay => 3,
        Subsystem::Modem => 4,
        Subsystem::Rtc => 5,
    }
}

/// Tracks each subsystem's minimum-required power state and picks the
/// deepest mode safe for all of them.
///
/// One array indexed by subsystem, rather than a separate bitmask per
/// power mode.
pub struct PowerArbiter {
    minimums: [PowerState; NUM_SUBSYSTEMS],
}

impl Default for PowerArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerArbiter {
    pub fn new() -> Self {
        Self {
            minimums: [PowerState::Stop; NUM_SUBSYSTEMS],
        }
    }

    /// Safe from any context; an ISR must only use this to loosen (raise
    /// towards `FullOn`) its subsystem's requirement, never to deepen it
    /// past what the main loop already cleared.
    pub fn set_minimum(&mut self, subsystem: Subsystem, state: PowerState) {
        self.minimums[index(subsystem)] = state;
    }

    pub fn minimum_for(&self, subsystem: Subsystem) -> PowerState {
        self.minimums[index(subsystem)]
    }

    /// The shallowest state consistent with every subsystem's requirement.
    fn required_state(&self) -> PowerState {
        self.minimums
            .iter()
            .copied()
            .min()
            .unwrap_or(PowerState::Stop)
    }

    /// Called only from the main loop. Returns the power state to enter:
    /// `FullOn` if any subsystem still needs it (the caller should not
    /// actually suspend), otherwise the deepest mode safe to enter until
    /// the next interrupt.
    pub fn sleep(&self) -> PowerState {
        self.required_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_the_deepest_mode_with_nothing_active() {
        let arbiter = PowerArbiter::new();
        assert_eq!(arbiter.sleep(), PowerState::Stop);
    }

    #[test]
    fn one_subsystem_requiring_full_on_blocks_sleep() {
        let mut arbiter = PowerArbiter::new();
        arbiter.set_minimum(Subsystem::Radio, PowerState::FullOn);
        arbiter.set_minimum(Subsystem::Detect, PowerState::DeepSleep);
        assert_eq!(arbiter.sleep(), PowerState::FullOn);
    }

    #[test]
    fn picks_the_shallowest_of_several_requirements() {
        let mut arbiter = PowerArbiter::new();
        arbiter.set_minimum(Subsystem::Radio, PowerState::LightSleep);
        arbiter.set_minimum(Subsystem::Sensor, PowerState::DeepSleep);
        assert_eq!(arbiter.sleep(), PowerState::LightSleep);
    }
}
