//! Jittered interval timer.
//!
//! Fires a callback at `base + rand[0, jitter]`; base and jitter may be given
//! as finite sequences whose last element becomes the steady state, so a
//! caller can express compound backoff ("1s, 20s, 40s, then every 5 minutes")
//! with a single timer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Fallback jitter when a schedule supplies none.
pub const DEFAULT_JITTER_MS: u64 = 100;

// ── Schedule ──────────────────────────────────────────────────────────────────

/// A base/jitter schedule. The last element of each sequence is the
/// steady-state value for all subsequent ticks.
#[derive(Debug, Clone)]
pub struct TimerSchedule {
    bases: Vec<Duration>,
    jitters: Vec<Duration>,
    first_interval: Option<Duration>,
    first_jitter: Option<Duration>,
}

impl TimerSchedule {
    /// Single base/jitter pair for every tick.
    pub fn fixed(base: Duration, jitter: Duration) -> Self {
        Self::sequence(vec![base], vec![jitter])
    }

    /// Paired sequences; the shorter one is extended with its last element.
    pub fn sequence(bases: Vec<Duration>, jitters: Vec<Duration>) -> Self {
        Self {
            bases,
            jitters,
            first_interval: None,
            first_jitter: None,
        }
    }

    /// Millisecond convenience constructor. Negative intervals coerce to 0;
    /// a missing jitter coerces to the 100 ms default.
    pub fn from_millis(bases: &[i64], jitters: &[i64]) -> Self {
        let coerce = |ms: &i64| Duration::from_millis((*ms).max(0) as u64);
        let bases: Vec<Duration> = bases.iter().map(coerce).collect();
        let jitters: Vec<Duration> = if jitters.is_empty() {
            vec![Duration::from_millis(DEFAULT_JITTER_MS)]
        } else {
            jitters.iter().map(coerce).collect()
        };
        Self::sequence(bases, jitters)
    }

    /// Override the very first delay only.
    pub fn with_first(mut self, interval: Duration, jitter: Duration) -> Self {
        self.first_interval = Some(interval);
        self.first_jitter = Some(jitter);
        self
    }

    /// Base and jitter for the tick after `completed` callbacks have run.
    fn step(&self, completed: u64) -> (Duration, Duration) {
        if completed == 0 {
            if let Some(first) = self.first_interval {
                return (first, self.first_jitter.unwrap_or(Duration::ZERO));
            }
        }
        let idx = |seq: &[Duration]| -> Duration {
            if seq.is_empty() {
                return Duration::ZERO;
            }
            let i = (completed as usize).min(seq.len() - 1);
            seq[i]
        };
        let base = idx(&self.bases);
        let jitter = if self.jitters.is_empty() {
            Duration::from_millis(DEFAULT_JITTER_MS)
        } else {
            idx(&self.jitters)
        };
        (base, jitter)
    }

    /// Concrete delay for the next tick: `base + rand[0, jitter]`.
    pub fn delay(&self, completed: u64) -> Duration {
        let (base, jitter) = self.step(completed);
        let jitter_ms = jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        base + Duration::from_millis(extra)
    }
}

// ── Timer ─────────────────────────────────────────────────────────────────────

/// Passed to the callback on every invocation.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// Time since the previous callback entry (since spawn, for the first).
    pub since_last: Duration,
    /// Call counter, starting at 1.
    pub count: u64,
}

type Callback = Arc<dyn Fn(Tick) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Options beyond the schedule itself.
#[derive(Debug, Clone, Copy)]
pub struct TimerOptions {
    /// When set (the default) the next tick is armed only after the callback
    /// returns. Otherwise ticks arm concurrently with callback execution,
    /// with entry to the callback still serialized.
    pub await_callback: bool,
}

impl Default for TimerOptions {
    fn default() -> Self {
        Self { await_callback: true }
    }
}

/// A running jittered timer. Dropping the handle does not stop the timer;
/// call [`JitteredTimer::stop`].
pub struct JitteredTimer {
    cancel: CancellationToken,
}

impl JitteredTimer {
    /// Spawn the timer loop. At most one callback executes at a time.
    pub fn spawn<F, Fut>(schedule: TimerSchedule, opts: TimerOptions, callback: F) -> Self
    where
        F: Fn(Tick) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cb: Callback = Arc::new(move |tick| Box::pin(callback(tick)));

        tokio::spawn(async move {
            let entry_lock = Arc::new(Mutex::new(()));
            let mut completed: u64 = 0;
            let mut last_entry = Instant::now();

            loop {
                let delay = schedule.delay(completed);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                // A stop() that raced the sleep must still win.
                if token.is_cancelled() {
                    break;
                }

                completed += 1;
                let now = Instant::now();
                let tick = Tick {
                    since_last: now.duration_since(last_entry),
                    count: completed,
                };
                last_entry = now;

                if opts.await_callback {
                    cb(tick).await;
                } else {
                    let guard = entry_lock.clone().lock_owned().await;
                    let fut = cb(tick);
                    let inner_token = token.clone();
                    tokio::spawn(async move {
                        if inner_token.is_cancelled() {
                            return;
                        }
                        fut.await;
                        drop(guard);
                    });
                }
            }
        });

        Self { cancel }
    }

    /// Prevent any further callback invocations, including a tick whose
    /// sleep has already elapsed and is mid-wake.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
