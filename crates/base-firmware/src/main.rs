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

#![no_std]
#![no_main]

#[cfg(feature = "log-rtt")]
use defmt_rtt as _;

#[cfg(feature = "log-serial")]
use defmt_serial as _;

use embassy_executor::Spawner;
use panic_probe as _;

mod iv;
mod persist;

#[allow(unused_imports)]
use defmt::{debug, error, info, warn};
use embassy_stm32::rng::{self, Rng};
use embassy_stm32::{bind_interrupts, gpio, peripherals, spi::Spi, time};
use embassy_time::{Delay, Duration, Instant, Timer};
use lora_phy::{
    mod_params::{Bandwidth, CodingRate, ModulationParams, PacketParams, SpreadingFactor, *},
    mod_traits::RadioKind,
    sx126x::{self, Stm32wl, Sx126x},
    LoRa, RxMode,
};

#[allow(unused_imports)]
use embassy_stm32::{
    dma::NoDma,
    usart::{self, Uart},
};
#[cfg(feature = "log-serial")]
use static_cell::StaticCell;

use cricket_link::{BaseInput, BaseProtocol, BaseSideEffect};
use cricket_sched::{DeferredAction, Dispatcher, PowerArbiter, PowerState, Subsystem, TimeSource};
use cricket_wire::{Action, Frame, Message, BROADCAST_ADDR, MAX_PAYLOAD};
use persist::DebugLineSink;

const MAX_NODES: usize = 20;
const MAX_FRAGMENTS: usize = 4;
const REASSEMBLY_CAP: usize = MAX_FRAGMENTS * cricket_wire::MAX_OBSERVATIONS_PER_FRAGMENT;

const MAX_MESSAGE_SIZE: usize = MAX_PAYLOAD;

const LORA_SPREADING_FACTOR: SpreadingFactor = SpreadingFactor::_8;
const LORA_BANDWIDTH: Bandwidth = Bandwidth::_125KHz;
const LORA_CODING_RATE: CodingRate = CodingRate::_4_6;
const LORA_PREAMBLE_LEN: u16 = 12;
const LORA_IMPLICIT_HEADER: bool = false;
const LORA_CRC_ON: bool = true;
const LORA_IQ_INVERTED: bool = false;
const LORA_OUTPUT_POWER: i32 = 10;
const LORA_USE_HIGH_POWER_PA: bool = false;
const LORA_FREQUENCY: u32 = 868_000_000;
const MIN_RSSI: i16 = -70;

/// How often the beacon window reopens, seconds.
const BEACON_PERIOD_S: u32 = 30;

bind_interrupts!(struct Irqs{
    SUBGHZ_RADIO => iv::InterruptHandler;
    USART1 => usart::InterruptHandler<peripherals::USART1>;
    RNG => rng::InterruptHandler<peripherals::RNG>;
});

/// The firmware's own bookkeeping of each registered node's next upload
/// window; `BaseProtocol` itself only tracks slot assignment, not wake
/// timing, so the driver owns this the same way the node firmware owns its
/// single `next_wake` field.
struct WakeTable {
    entries: heapless::Vec<(u8, u32), MAX_NODES>,
}

impl WakeTable {
    fn new() -> Self {
        Self { entries: heapless::Vec::new() }
    }

    fn upsert(&mut self, node_id: u8, at: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|(id, _)| *id == node_id) {
            entry.1 = at;
        } else {
            let _ = self.entries.push((node_id, at));
        }
    }

    fn remove(&mut self, node_id: u8) {
        self.entries.retain(|(id, _)| *id != node_id);
    }

    /// The earliest due node, if any is already at or past `now`.
    fn due(&self, now: u32) -> Option<u8> {
        self.entries
            .iter()
            .filter(|(_, at)| *at <= now)
            .min_by_key(|(_, at)| *at)
            .map(|(id, _)| *id)
    }

    fn next_deadline(&self) -> Option<u32> {
        self.entries.iter().map(|(_, at)| *at).min()
    }

    fn reschedule(&mut self, node_id: u8) {
        if let Some(entry) = self.entries.iter_mut().find(|(id, _)| *id == node_id) {
            entry.1 += BEACON_PERIOD_S;
        }
    }
}

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let mut config = embassy_stm32::Config::default();
    {
        use embassy_stm32::rcc::*;
        config.rcc.hse = Some(Hse {
            freq: time::Hertz(32_000_000),
            mode: HseMode::Bypass,
            prescaler: HsePrescaler::DIV1,
        });
        config.rcc.mux = ClockSrc::PLL1_R;
        config.rcc.pll = Some(Pll {
            source: PllSource::HSE,
            prediv: PllPreDiv::DIV2,
            mul: PllMul::MUL6,
            divp: None,
            divq: Some(PllQDiv::DIV2),
            divr: Some(PllRDiv::DIV2),
        });
    }
    let p = embassy_stm32::init(config);

    #[cfg(feature = "log-serial")]
    {
        let mut uart_config = usart::Config::default();
        uart_config.baudrate = 115200;
        static UART: StaticCell<Uart<'static, peripherals::USART1, peripherals::DMA2_CH1>> =
            StaticCell::new();
        let uart = UART
            .init(Uart::new(p.USART1, p.PB7, p.PB6, Irqs, p.DMA2_CH1, NoDma, uart_config).unwrap());
        defmt_serial::defmt_serial(uart);
    }

    let _rf_ctrl1 = gpio::Output::new(p.PC4, gpio::Level::High, gpio::Speed::High);
    let rf_ctrl2 = gpio::Output::new(p.PC5, gpio::Level::High, gpio::Speed::High);
    let _rf_ctrl3 = gpio::Output::new(p.PC3, gpio::Level::High, gpio::Speed::High);
    let mut error_led = gpio::Output::new(p.PB9, gpio::Level::Low, gpio::Speed::Low);

    let lora_spi = Spi::new_subghz(p.SUBGHZSPI, p.DMA1_CH1, p.DMA1_CH2);
    let lora_spi = iv::SubghzSpiDevice(lora_spi);

    let mut base: BaseProtocol<MAX_NODES, MAX_FRAGMENTS, REASSEMBLY_CAP, DebugLineSink> =
        BaseProtocol::new(DebugLineSink);
    let mut wake_table = WakeTable::new();

    let mut rng = Rng::new(p.RNG, Irqs);

    let radio_config = sx126x::Config {
        chip: Stm32wl { use_high_power_pa: LORA_USE_HIGH_POWER_PA },
        tcxo_ctrl: Some(sx126x::TcxoCtrlVoltage::Ctrl1V7),
        use_dcdc: true,
        rx_boost: false,
    };
    let iv = iv::Stm32wlInterfaceVariant::new(Irqs, None, Some(rf_ctrl2)).unwrap();

    let mut lora = match LoRa::new(Sx126x::new(lora_spi, iv, radio_config), false, Delay).await {
        Ok(lora) => lora,
        Err(err) => {
            error!("radio init failed, halting: {}", err);
            halt_with_error_indicator(&mut error_led);
        }
    };

    let modulation_params = get_modulation_params(&mut lora);
    let mut tx_pkt_params = match lora.create_tx_packet_params(
        LORA_PREAMBLE_LEN,
        LORA_IMPLICIT_HEADER,
        LORA_CRC_ON,
        LORA_IQ_INVERTED,
        &modulation_params,
    ) {
        Ok(pp) => pp,
        Err(err) => {
            error!("radio error = {}, halting", err);
            halt_with_error_indicator(&mut error_led);
        }
    };

    let mut receive_buffer = [0u8; MAX_MESSAGE_SIZE];
    let rx_pkt_params = match lora.create_rx_packet_params(
        LORA_PREAMBLE_LEN,
        LORA_IMPLICIT_HEADER,
        receive_buffer.len() as u8,
        LORA_CRC_ON,
        LORA_IQ_INVERTED,
        &modulation_params,
    ) {
        Ok(pp) => pp,
        Err(err) => {
            error!("radio error = {}, halting", err);
            halt_with_error_indicator(&mut error_led);
        }
    };

    let mut arbiter = PowerArbiter::new();
    let mut dispatcher = Dispatcher::new();
    let mut time_source = TimeSource::new();
    time_source.schedule_housekeeping(BEACON_PERIOD_S, DeferredAction::BeaconWindow);

    let mut rx_message: Option<(u8, Message)> = None;

    loop {
        while let Some(action) = dispatcher.drain_and_run() {
            match action {
                DeferredAction::BeaconWindow => {
                    let effect = base.progress(time_source.get(), BaseInput::BeaconWindowDue);
                    apply_side_effect(effect, &mut wake_table, time_source.get());
                    time_source.schedule_housekeeping(
                        time_source.get() + BEACON_PERIOD_S,
                        DeferredAction::BeaconWindow,
                    );
                }
                DeferredAction::WakeAndUpload => {
                    if let Some(node_id) = wake_table.due(time_source.get()) {
                        let effect = base.progress(time_source.get(), BaseInput::SlotDue { node_id });
                        apply_side_effect(effect, &mut wake_table, time_source.get());
                        wake_table.reschedule(node_id);
                    }
                }
                DeferredAction::TimeAlarm | DeferredAction::HousekeepingAlarm => {}
            }
        }

        match base.get_action() {
            Action::None => {
                arbiter.set_minimum(Subsystem::Radio, PowerState::Stop);
                if let Some(deadline) = wake_table.next_deadline() {
                    wait_until(deadline, &mut time_source, &mut dispatcher).await;
                }
            }
            Action::Wait { end } => {
                arbiter.set_minimum(Subsystem::Radio, PowerState::Stop);
                wait_until(end, &mut time_source, &mut dispatcher).await;
                let effect = base.progress(time_source.get(), BaseInput::None);
                apply_side_effect(effect, &mut wake_table, time_source.get());
            }
            Action::Receive { end } => {
                arbiter.set_minimum(Subsystem::Radio, PowerState::LightSleep);
                let modulation_params = get_modulation_params(&mut lora);
                let deadline = Instant::from_millis((end as u64) * 1000);
                while Instant::now() < deadline {
                    let remaining = deadline - Instant::now();
                    match lora_receive(&mut lora, &rx_pkt_params, &modulation_params, &mut receive_buffer, remaining)
                        .await
                    {
                        Ok(len) => {
                            if let Ok(frame) = Frame::decode(&receive_buffer[..len]) {
                                if frame.dst == BROADCAST_ADDR || frame.dst == cricket_wire::BASE_ADDR {
                                    rx_message = Some((frame.src, frame.message));
                                }
                            }
                            break;
                        }
                        Err(ReceiveError::Timeout) | Err(ReceiveError::RadioError) => break,
                        Err(ReceiveError::InsufficientSignalStrength) => {
                            info!("ignoring message with low RSSI");
                        }
                    }
                }
                let _ = lora.enter_standby().await;
                let input = match rx_message.take() {
                    Some((src, message)) => BaseInput::Frame { src, message },
                    None => BaseInput::None,
                };
                let effect = base.progress(time_source.get(), input);
                apply_side_effect(effect, &mut wake_table, time_source.get());
            }
            Action::Transmit { dst, message, delay } => {
                arbiter.set_minimum(Subsystem::Radio, PowerState::FullOn);
                if let Some(delay_s) = delay {
                    Timer::after(Duration::from_secs(delay_s as u64)).await;
                }
                let modulation_params = get_modulation_params(&mut lora);
                let frame = Frame::new(dst, cricket_wire::BASE_ADDR, message);
                if let Ok(encoded) = frame.encode() {
                    lora_transmit(&mut lora, &mut tx_pkt_params, &modulation_params, &encoded).await;
                }
                let effect = base.progress(time_source.get(), BaseInput::None);
                apply_side_effect(effect, &mut wake_table, time_source.get());
            }
        }

        if arbiter.sleep() != PowerState::FullOn && !dispatcher.is_pending() {
            cortex_m::asm::wfi();
        }
        let _ = &mut rng;
    }
}

async fn wait_until(end: u32, time_source: &mut TimeSource, dispatcher: &mut Dispatcher) {
    let now = time_source.get();
    let remaining = end.wrapping_sub(now).min(cricket_sched::DAY_SECONDS);
    time_source.schedule(end, DeferredAction::TimeAlarm);
    Timer::after(Duration::from_secs(remaining as u64)).await;
    time_source.advance_to(end, dispatcher);
}

fn apply_side_effect(effect: BaseSideEffect, wake_table: &mut WakeTable, now: u32) {
    match effect {
        BaseSideEffect::None => {}
        BaseSideEffect::NodeRegistered { node_id, slot } => {
            wake_table.upsert(node_id, now + slot as u32);
        }
        BaseSideEffect::NodeDeregistered { node_id } => wake_table.remove(node_id),
    }
}

fn get_modulation_params<RK, DLY>(lora: &mut LoRa<RK, DLY>) -> ModulationParams
where
    RK: RadioKind,
    DLY: lora_phy::DelayNs,
{
    lora.create_modulation_params(LORA_SPREADING_FACTOR, LORA_BANDWIDTH, LORA_CODING_RATE, LORA_FREQUENCY)
        .unwrap()
}

async fn lora_transmit<RK, DLY>(
    lora: &mut LoRa<RK, DLY>,
    tx_pkt_params: &mut PacketParams,
    modulation_params: &ModulationParams,
    buffer: &[u8],
) where
    RK: RadioKind,
    DLY: lora_phy::DelayNs,
{
    if let Err(err) = lora
        .prepare_for_tx(modulation_params, tx_pkt_params, LORA_OUTPUT_POWER, buffer)
        .await
    {
        error!("radio error = {}", err);
        return;
    }
    if let Err(err) = lora.tx().await {
        error!("radio error = {}", err);
    }
}

async fn lora_receive<RK, DLY>(
    lora: &mut LoRa<RK, DLY>,
    rx_pkt_params: &PacketParams,
    modulation_params: &ModulationParams,
    buffer: &mut [u8; MAX_MESSAGE_SIZE],
    timeout: Duration,
) -> Result<usize, ReceiveError>
where
    RK: RadioKind,
    DLY: lora_phy::DelayNs,
{
    if let Err(err) = lora
        .prepare_for_rx(RxMode::Continuous, modulation_params, rx_pkt_params)
        .await
    {
        error!("radio error: {}", err);
        return Err(ReceiveError::RadioError);
    }

    *buffer = [0u8; MAX_MESSAGE_SIZE];

    match embassy_time::with_timeout(timeout, lora.rx(rx_pkt_params, buffer)).await {
        Ok(Ok((received_len, status))) => {
            if status.rssi < MIN_RSSI {
                return Err(ReceiveError::InsufficientSignalStrength);
            }
            Ok(received_len as usize)
        }
        Ok(Err(err)) => {
            info!("rx unsuccessful: {}", err);
            Err(ReceiveError::RadioError)
        }
        Err(_) => Err(ReceiveError::Timeout),
    }
}

enum ReceiveError {
    InsufficientSignalStrength,
    RadioError,
    Timeout,
}

/// Lights the error LED and parks forever. The only documented response to
/// a fatal radio-init failure; there is no recovery path, so the caller
/// never gets control back.
fn halt_with_error_indicator(led: &mut gpio::Output) -> ! {
    led.set_high();
    loop {
        cortex_m::asm::wfi();
    }
}

#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
