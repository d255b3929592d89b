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

//! STM32WL55 sub-GHz radio peripheral wiring for `lora-phy`'s `sx126x` driver:
//! the SPI device wrapper and the interrupt/RF-switch `InterfaceVariant`.
//! Board bring-up below the `lora_phy::LoRa` driver is out of scope for this
//! codebase; this module only satisfies `lora_phy`'s trait bounds so `main.rs`
//! can drive the radio through `lora_phy::LoRa` directly.

use embassy_stm32::gpio::Output;
use embassy_stm32::interrupt;
use embassy_stm32::peripherals::SUBGHZSPI;
use embassy_stm32::spi::Spi;
use lora_phy::sx126x::Stm32wlInterfaceVariant as Sx126xInterfaceVariant;
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

/// Binds the radio busy/IRQ lines and the Nucleo board's RF switch enable
/// pin. `rf_switch` is `None` on boards that wire the switch some other way.
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
