use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{info, warn};

use crate::leds::{DeviceState, LedSnapshot};

/// Output stage for a full LED frame.
pub trait PixelSink: Send {
    fn show(&mut self, frame: &LedSnapshot) -> anyhow::Result<()>;
}

/// Fixed-rate deadline tracker. A late tick moves the next deadline to
/// `now + period`; missed ticks are dropped.
#[derive(Debug, Clone)]
pub struct FrameClock {
    period: Duration,
    next: Instant,
    overruns: u64,
}

impl FrameClock {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: now + period,
            overruns: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Time to wait before the next tick, given that the current one ended at `now`.
    pub fn wait_after_tick(&mut self, now: Instant) -> Duration {
        if now < self.next {
            let wait = self.next - now;
            self.next += self.period;
            return wait;
        }

        self.overruns = self.overruns.saturating_add(1);
        self.next = now + self.period;
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuationStats {
    pub frames: u64,
    pub errors: u64,
    #[serde(rename = "lastRevision")]
    pub last_revision: u64,
}

const ERROR_LOG_EVERY: u64 = 100;

pub struct ActuationTask<K: PixelSink> {
    state: Arc<DeviceState>,
    sink: K,
    snapshot: LedSnapshot,
    stats: ActuationStats,
}

impl<K: PixelSink> ActuationTask<K> {
    pub fn new(state: Arc<DeviceState>, sink: K) -> Self {
        let snapshot = LedSnapshot {
            revision: 0,
            pixels: Vec::with_capacity(state.len()),
        };
        Self {
            state,
            sink,
            snapshot,
            stats: ActuationStats::default(),
        }
    }

    pub fn stats(&self) -> ActuationStats {
        self.stats
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Pushes the latest device state to the sink. Sink errors are counted,
    /// never propagated.
    pub fn tick(&mut self) {
        self.state.copy_into(&mut self.snapshot);

        match self.sink.show(&self.snapshot) {
            Ok(()) => {
                self.stats.frames = self.stats.frames.saturating_add(1);
                self.stats.last_revision = self.snapshot.revision;
            }
            Err(err) => {
                self.stats.errors = self.stats.errors.saturating_add(1);
                if self.stats.errors % ERROR_LOG_EVERY == 1 {
                    warn!(
                        "led frame push failed ({} failures so far): {err:#}",
                        self.stats.errors
                    );
                }
            }
        }
    }

    /// Blocking loop for a dedicated thread; returns once `stop` is set.
    pub fn run(mut self, period: Duration, stop: &AtomicBool) -> ActuationStats {
        info!("actuation loop running every {}ms", period.as_millis());
        let mut clock = FrameClock::new(period, Instant::now());

        while !stop.load(Ordering::Acquire) {
            self.tick();
            let wait = clock.wait_after_tick(Instant::now());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }

        info!(
            "actuation loop stopped after {} frames ({} overruns)",
            self.stats.frames,
            clock.overruns()
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{leds::LedUpdate, types::Rgb};

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<LedSnapshot>>>,
        fail: bool,
    }

    impl PixelSink for RecordingSink {
        fn show(&mut self, frame: &LedSnapshot) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow!("rmt busy"));
            }
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    #[test]
    fn clock_keeps_cadence_when_on_time() {
        let start = Instant::now();
        let period = Duration::from_millis(16);
        let mut clock = FrameClock::new(period, start);

        assert_eq!(clock.wait_after_tick(start + Duration::from_millis(4)), Duration::from_millis(12));
        assert_eq!(clock.wait_after_tick(start + Duration::from_millis(17)), Duration::from_millis(15));
        assert_eq!(clock.overruns(), 0);
    }

    #[test]
    fn clock_resyncs_after_overrun() {
        let start = Instant::now();
        let period = Duration::from_millis(16);
        let mut clock = FrameClock::new(period, start);

        let late = start + Duration::from_millis(100);
        assert_eq!(clock.wait_after_tick(late), Duration::ZERO);
        assert_eq!(clock.overruns(), 1);

        // Next deadline is measured from the late tick, not the missed ones.
        assert_eq!(clock.wait_after_tick(late + Duration::from_millis(6)), Duration::from_millis(10));
    }

    #[test]
    fn tick_pushes_latest_snapshot() {
        let state = Arc::new(DeviceState::new(3));
        let sink = RecordingSink::default();
        let frames = sink.frames.clone();
        let mut task = ActuationTask::new(state.clone(), sink);

        task.tick();
        state
            .apply(&LedUpdate::Patch {
                clear: false,
                fill: Some(Rgb::new(7, 7, 7)),
                pixels: Vec::new(),
            })
            .unwrap();
        task.tick();

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].pixels, vec![Rgb::OFF; 3]);
        assert_eq!(frames[1].revision, 1);
        assert_eq!(frames[1].pixels, vec![Rgb::new(7, 7, 7); 3]);
        assert_eq!(task.stats().last_revision, 1);
    }

    #[test]
    fn sink_errors_are_counted_not_fatal() {
        let state = Arc::new(DeviceState::new(3));
        let mut task = ActuationTask::new(
            state,
            RecordingSink {
                fail: true,
                ..RecordingSink::default()
            },
        );

        for _ in 0..5 {
            task.tick();
        }

        assert_eq!(
            task.stats(),
            ActuationStats {
                frames: 0,
                errors: 5,
                last_revision: 0
            }
        );
    }

    #[test]
    fn run_stops_on_flag() {
        let state = Arc::new(DeviceState::new(3));
        let stop = Arc::new(AtomicBool::new(false));
        let task = ActuationTask::new(state, RecordingSink::default());

        let handle = {
            let stop = stop.clone();
            thread::spawn(move || task.run(Duration::from_millis(5), &stop))
        };
        thread::sleep(Duration::from_millis(40));
        stop.store(true, Ordering::Release);

        let stats = handle.join().unwrap();
        assert!(stats.frames >= 2, "only {} frames", stats.frames);
    }
}
