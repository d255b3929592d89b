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

/// Work an ISR handed back to the main context, named so the transitions
/// they drive are checkable in a `match` rather than hidden behind an
/// opaque function pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeferredAction {
    /// A node's scheduled upload window has arrived.
    WakeAndUpload,
    /// The base's recurring beacon window has arrived.
    BeaconWindow,
    /// The time source's single scheduled callback fired.
    TimeAlarm,
    /// The time source's independent daily housekeeping alarm fired.
    HousekeepingAlarm,
}

/// A single-slot queue for work that should run at main-loop priority
/// rather than inside an interrupt handler.
///
/// `schedule` is last-writer-wins: a new action overwrites whatever was
/// pending. `drain_and_run` hands back (and clears) whatever is pending;
/// the caller is expected to loop calling it until it returns `None`; since
/// the dispatched handler has `&mut Dispatcher` in scope it may itself call
/// `schedule` again, and that successor is picked up by the next iteration
/// of the caller's loop before it actually sleeps.
pub struct Dispatcher {
    slot: Option<DeferredAction>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { slot: None }
    }

    pub fn schedule(&mut self, action: DeferredAction) {
        self.slot = Some(action);
    }

    /// Take whatever is pending, clearing the slot.
    pub fn drain_and_run(&mut self) -> Option<DeferredAction> {
        self.slot.take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_later_schedule_overwrites_an_earlier_one() {
        let mut d = Dispatcher::new();
        d.schedule(DeferredAction::BeaconWindow);
        d.schedule(DeferredAction::WakeAndUpload);
        assert_eq!(d.drain_and_run(), Some(DeferredAction::WakeAndUpload));
        assert_eq!(d.drain_and_run(), None);
    }

    #[test]
    fn a_successor_scheduled_during_handling_is_observed_by_the_caller() {
        let mut d = Dispatcher::new();
        d.schedule(DeferredAction::TimeAlarm);
        let mut ran = std::vec::Vec::new();
        while let Some(action) = d.drain_and_run() {
            ran.push(action);
            if action == DeferredAction::TimeAlarm {
                d.schedule(DeferredAction::HousekeepingAlarm);
            }
        }
        assert_eq!(
            ran.as_slice(),
            [DeferredAction::TimeAlarm, DeferredAction::HousekeepingAlarm]
        );
    }
}
