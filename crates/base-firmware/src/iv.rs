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

//! STM32WL55 sub-GHz radio peripheral wiring for `lora-phy`'s `sx126x` driver.
//! Radio-chip register programming itself is out of scope for this
//! codebase — see `cricket-node-firmware::iv` for the sibling copy on the
//! node side.

use embassy_stm32::gpio::Output;
use embassy_stm32::interrupt;
use embassy_stm32::peripherals::SUBGHZSPI;
use embassy_stm32::spi::Spi;
use lora_phy::mod_traits::InterfaceVariant;

pub struct SubghzSpiDevice<'d>(pub Spi<'d, SUBGHZSPI>);

pub struct InterruptHandler;

impl embassy_stm32::interrupt::typelevel::Handler<embassy_stm32::interrupt::typelevel::SUBGHZ_RADIO>
    for InterruptHandler
{
    unsafe fn on_interrupt() {
        embassy_stm32::pac::SUBGHZ.clear_interrupt();
    }
}

pub struct Stm32wlInterfaceVariant<'d> {
    rf_switch: Option<Output<'d>>,
}

impl<'d> Stm32wlInterfaceVariant<'d> {
    pub fn new(
        _irqs: impl interrupt::typelevel::Binding<
            embassy_stm32::interrupt::typelevel::SUBGHZ_RADIO,
            InterruptHandler,
        >,
        _ctrl1: Option<Output<'d>>,
        rf_switch: Option<Output<'d>>,
    ) -> Result<Self, ()> {
        Ok(Self { rf_switch })
    }
}

impl<'d> InterfaceVariant for Stm32wlInterfaceVariant<'d> {
    fn set_rf_switch_rx(&mut self) {
        if let Some(sw) = self.rf_switch.as_mut() {
            sw.set_high();
        }
    }

    fn set_rf_switch_tx(&mut self) {
        if let Some(sw) = self.rf_switch.as_mut() {
            sw.set_low();
        }
    }
}
