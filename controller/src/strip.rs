use std::time::Duration;

use anyhow::Context;
use esp_idf_hal::{
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{config::TransmitConfig, PinState, Pulse, RmtChannel, TxRmtDriver, VariableLengthSignal},
};
use log::{info, warn};

use ledstrip_common::{LedSnapshot, PixelSink};

const T0H_NS: u64 = 350;
const T0L_NS: u64 = 800;
const T1H_NS: u64 = 700;
const T1L_NS: u64 = 600;
const BITS_PER_PIXEL: usize = 24;

struct BitPulses {
    zero: [Pulse; 2],
    one: [Pulse; 2],
}

enum StripBackend {
    Rmt {
        tx: TxRmtDriver<'static>,
        pulses: BitPulses,
    },
    Disabled,
}

/// WS2812 encoder on an RMT TX channel (GRB order, 800 kHz bit timing).
pub struct LedStrip {
    backend: StripBackend,
    pushed_frames: u64,
    failed_frames: u64,
    last_error: Option<String>,
}

impl LedStrip {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx =
            TxRmtDriver::new(channel, pin, &config).context("failed to init RMT strip driver")?;

        let ticks_hz = tx.counter_clock().context("failed to read RMT counter clock")?;
        let pulse = |state, ns| {
            Pulse::new_with_duration(ticks_hz, state, &Duration::from_nanos(ns))
                .context("invalid WS2812 pulse timing")
        };
        let pulses = BitPulses {
            zero: [pulse(PinState::High, T0H_NS)?, pulse(PinState::Low, T0L_NS)?],
            one: [pulse(PinState::High, T1H_NS)?, pulse(PinState::Low, T1L_NS)?],
        };

        Ok(Self {
            backend: StripBackend::Rmt { tx, pulses },
            pushed_frames: 0,
            failed_frames: 0,
            last_error: None,
        })
    }

    pub fn disabled() -> Self {
        Self {
            backend: StripBackend::Disabled,
            pushed_frames: 0,
            failed_frames: 0,
            last_error: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.backend, StripBackend::Rmt { .. })
    }

    fn transmit(&mut self, frame: &LedSnapshot) -> anyhow::Result<()> {
        let StripBackend::Rmt { tx, pulses } = &mut self.backend else {
            return Ok(());
        };

        let mut signal = VariableLengthSignal::with_capacity(frame.pixels.len() * BITS_PER_PIXEL * 2);
        for pixel in &frame.pixels {
            for byte in pixel.grb() {
                for bit in (0..8).rev() {
                    let pair = if byte & (1 << bit) != 0 {
                        &pulses.one
                    } else {
                        &pulses.zero
                    };
                    signal
                        .push(pair.iter())
                        .context("failed to encode WS2812 bit")?;
                }
            }
        }

        tx.start_blocking(&signal)
            .context("failed to transmit LED frame over RMT")?;
        Ok(())
    }
}

impl PixelSink for LedStrip {
    fn show(&mut self, frame: &LedSnapshot) -> anyhow::Result<()> {
        if matches!(self.backend, StripBackend::Disabled) {
            return Ok(());
        }

        let result = self.transmit(frame);
        match &result {
            Ok(()) => {
                self.pushed_frames = self.pushed_frames.saturating_add(1);
                if self.last_error.take().is_some() {
                    info!(
                        "led strip recovered after {} failed frames",
                        self.failed_frames
                    );
                }
            }
            Err(err) => {
                self.failed_frames = self.failed_frames.saturating_add(1);
                if self.last_error.is_none() {
                    warn!(
                        "led strip transmit failing after {} good frames: {err:#}",
                        self.pushed_frames
                    );
                }
                self.last_error = Some(format!("{err:#}"));
            }
        }
        result
    }
}
