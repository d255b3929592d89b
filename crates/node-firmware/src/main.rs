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

mod detect_hw;
mod iv;
mod sensors;

#[allow(unused_imports)]
use defmt::{debug, error, info, warn};
use embassy_stm32::rng::{self, Rng};
use embassy_stm32::{bind_interrupts, exti::ExtiInput, gpio, peripherals, spi::Spi, time};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Delay, Duration, Instant, Timer};
use core::sync::atomic::{AtomicU32, Ordering};
use lora_phy::{
    mod_params::{Bandwidth, CodingRate, ModulationParams, PacketParams, SpreadingFactor, *},
    mod_traits::RadioKind,
    sx126x::{self, Stm32wl, Sx126x},
    LoRa, RxMode,
};

// for log-serial
#[allow(unused_imports)]
use embassy_stm32::{
    dma::NoDma,
    usart::{self, Uart},
};
#[cfg(feature = "log-serial")]
use static_cell::StaticCell;

use cricket_detect::{DetectEvent, Detector};
use cricket_link::{resolve_node_address, NodeInput, NodeProtocol, NodeSideEffect};
use cricket_sched::{DeferredAction, Dispatcher, PowerArbiter, PowerState, Subsystem, TimeSource};
use cricket_wire::{Action, Frame, Message, MAX_PAYLOAD};

/// How many uploads worth of observations the node buffers between radio
/// windows; the store is sized generously since a missed beacon window just
/// delays the upload rather than losing data.
const STORE_CAPACITY: usize = 64;

const MAX_MESSAGE_SIZE: usize = MAX_PAYLOAD;

const LORA_SPREADING_FACTOR: SpreadingFactor = SpreadingFactor::_8;
const LORA_BANDWIDTH: Bandwidth = Bandwidth::_125KHz;
/// Coding rate of 4/5 provides best trade off according to stm reference manual
const LORA_CODING_RATE: CodingRate = CodingRate::_4_6;
const LORA_PREAMBLE_LEN: u16 = 12;
const LORA_IMPLICIT_HEADER: bool = false;
const LORA_CRC_ON: bool = true;
const LORA_IQ_INVERTED: bool = false;
/// Output power in dBm [-17, 22]
const LORA_OUTPUT_POWER: i32 = 10;
const LORA_USE_HIGH_POWER_PA: bool = false;

const LORA_FREQUENCY: u32 = 868_000_000;

/// Packets with lower RSSI than this value get ignored.
const MIN_RSSI: i16 = -70;

bind_interrupts!(struct Irqs{
    SUBGHZ_RADIO => iv::InterruptHandler;
    // for log-serial
    USART1 => usart::InterruptHandler<peripherals::USART1>;
    RNG => rng::InterruptHandler<peripherals::RNG>;
});

/// The detector's running state, shared between the comparator-driven
/// detection task and the main task.
static DETECTOR: Mutex<CriticalSectionRawMutex, Option<Detector>> = Mutex::new(None);

/// Observations the detector finalized between main-loop iterations. The
/// detection task only ever pushes; the main loop is the sole consumer,
/// draining it into the node's data store (the store itself is touched
/// from main context only).
static PENDING_CALLS: Mutex<CriticalSectionRawMutex, heapless::Deque<cricket_wire::Observation, 8>> =
    Mutex::new(heapless::Deque::new());

/// Day-seconds clock the detection task stamps observations with; kept in
/// lockstep with `TimeSource` by the main loop each iteration, since the
/// detection task has no path of its own to the radio-synced clock.
static TIME_OF_DAY: AtomicU32 = AtomicU32::new(0);

pub(crate) fn time_of_day() -> u32 {
    TIME_OF_DAY.load(Ordering::Relaxed)
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
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

    // Active-low address switches; read once at boot since the node's
    // address never changes at runtime.
    let sw0 = gpio::Input::new(p.PB3, gpio::Pull::Up);
    let sw1 = gpio::Input::new(p.PB4, gpio::Pull::Up);
    let sw2 = gpio::Input::new(p.PB5, gpio::Pull::Up);
    let raw_switches = (sw0.is_high() as u8) | ((sw1.is_high() as u8) << 1) | ((sw2.is_high() as u8) << 2);
    let local_addr = resolve_node_address(raw_switches);

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

    // Nucleo rf switch
    let _rf_ctrl1 = gpio::Output::new(p.PC4, gpio::Level::High, gpio::Speed::High);
    let rf_ctrl2 = gpio::Output::new(p.PC5, gpio::Level::High, gpio::Speed::High);
    let _rf_ctrl3 = gpio::Output::new(p.PC3, gpio::Level::High, gpio::Speed::High);

    let mut error_led = gpio::Output::new(p.PB9, gpio::Level::Low, gpio::Speed::Low);

    let lora_spi = Spi::new_subghz(p.SUBGHZSPI, p.DMA1_CH1, p.DMA1_CH2);
    let lora_spi = iv::SubghzSpiDevice(lora_spi);

    {
        let mut detector = DETECTOR.lock().await;
        *detector = Some(Detector::new());
    }

    let comparator = ExtiInput::new(p.PA0, p.EXTI0, gpio::Pull::None);
    spawner.spawn(detect_hw::run(comparator)).unwrap();

    let mut node = NodeProtocol::<STORE_CAPACITY>::new(local_addr);

    let mut rng = Rng::new(p.RNG, Irqs);

    let radio_config = sx126x::Config {
        chip: Stm32wl {
            use_high_power_pa: LORA_USE_HIGH_POWER_PA,
        },
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

    let mut rx_message: Option<Message> = None;

    loop {
        TIME_OF_DAY.store(time_source.get(), Ordering::Relaxed);

        {
            let mut pending = PENDING_CALLS.lock().await;
            while let Some(obs) = pending.pop_front() {
                node.record_observation(obs);
            }
        }

        while let Some(action) = dispatcher.drain_and_run() {
            match action {
                DeferredAction::WakeAndUpload => {
                    let readings = sensors::read_all();
                    let effect = node.progress(
                        time_source.get(),
                        NodeInput::SensorReadings {
                            temp: readings.temperature,
                            humidity: readings.humidity,
                            light: readings.light,
                        },
                    );
                    apply_side_effect(effect, &mut time_source, &mut dispatcher);
                }
                DeferredAction::TimeAlarm | DeferredAction::HousekeepingAlarm => {}
                DeferredAction::BeaconWindow => {}
            }
        }

        let now = time_source.get();
        match node.get_action() {
            Action::None => {
                arbiter.set_minimum(Subsystem::Radio, PowerState::Stop);
            }
            Action::Wait { end } => {
                arbiter.set_minimum(Subsystem::Radio, PowerState::Stop);
                wait_until(end, now, &mut time_source, &mut dispatcher).await;
                let effect = node.progress(time_source.get(), NodeInput::None);
                apply_side_effect(effect, &mut time_source, &mut dispatcher);
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
                                if frame.dst == node.local_addr() || frame.dst == cricket_wire::BROADCAST_ADDR {
                                    rx_message = Some(frame.message);
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
                let effect = node.progress(
                    time_source.get(),
                    rx_message
                        .take()
                        .map(NodeInput::Message)
                        .unwrap_or(NodeInput::None),
                );
                apply_side_effect(effect, &mut time_source, &mut dispatcher);
            }
            Action::Transmit { dst, message, delay } => {
                arbiter.set_minimum(Subsystem::Radio, PowerState::FullOn);
                if let Some(delay_s) = delay {
                    Timer::after(Duration::from_secs(delay_s as u64)).await;
                }
                let modulation_params = get_modulation_params(&mut lora);
                let frame = Frame::new(dst, node.local_addr(), message);
                if let Ok(encoded) = frame.encode() {
                    lora_transmit(&mut lora, &mut tx_pkt_params, &modulation_params, &encoded).await;
                }
                let effect = node.progress(time_source.get(), NodeInput::None);
                apply_side_effect(effect, &mut time_source, &mut dispatcher);
            }
        }

        if arbiter.sleep() != PowerState::FullOn && !dispatcher.is_pending() {
            cortex_m::asm::wfi();
        }
        let _ = &mut rng;
    }
}

/// Wait for either the node's requested deadline or an interrupt-driven
/// deferred action, whichever comes first.
async fn wait_until(end: u32, now: u32, time_source: &mut TimeSource, dispatcher: &mut Dispatcher) {
    let remaining = end.wrapping_sub(now).min(cricket_sched::DAY_SECONDS);
    time_source.schedule(end, DeferredAction::TimeAlarm);
    Timer::after(Duration::from_secs(remaining as u64)).await;
    time_source.advance_to(end, dispatcher);
}

fn apply_side_effect(effect: NodeSideEffect, time_source: &mut TimeSource, dispatcher: &mut Dispatcher) {
    match effect {
        NodeSideEffect::None => {}
        NodeSideEffect::JamSetTime { time_lo, msb } => time_source.set(time_lo, msb != 0),
        NodeSideEffect::ScheduleWake { at } => time_source.schedule(at, DeferredAction::WakeAndUpload),
        NodeSideEffect::JamSetTimeAndScheduleWake { time_lo, msb, at } => {
            time_source.set(time_lo, msb != 0);
            time_source.schedule(at, DeferredAction::WakeAndUpload);
        }
    }
    let _ = dispatcher;
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

/// Advances the detector on one edge-timer/edge-counter event and, if a
/// call finalizes, pushes the resulting Observation to the pending queue
/// for the main loop to drain. Called from [`detect_hw::run`], which turns
/// the comparator's GPIO edges and the window timeouts into these events.
pub(crate) fn on_detect_event(event: DetectEvent) {
    if let Ok(mut detector) = DETECTOR.try_lock() {
        if let Some(detector) = detector.as_mut() {
            if let Some(obs) = detector.progress(event) {
                if let Ok(mut pending) = PENDING_CALLS.try_lock() {
                    let _ = pending.push_back(obs);
                }
            }
        }
    }
}

/// `DETECTOR` is populated before [`detect_hw::run`] is spawned, so this is
/// always `Some` by the time it's called.
pub(crate) async fn detector_action_and_state() -> (cricket_detect::DetectAction, cricket_detect::DetectState) {
    let detector = DETECTOR.lock().await;
    let detector = detector.as_ref().expect("detector initialized before detect_hw::run is spawned");
    (detector.get_action(), detector.state())
}

// prevent panic messages from being printed twice when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
