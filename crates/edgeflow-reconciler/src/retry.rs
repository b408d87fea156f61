use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use edgeflow_domain::DesiredState;
use edgeflow_timer::{JitteredTimer, TimerOptions, TimerSchedule};
use tracing::debug;

/// Compound backoff for transient fetch failures: 1 s, 20 s, 40 s, 60 s,
/// then every 5 minutes, each plus `rand[0, jitter]`.
const RETRY_BASES_MS: [i64; 5] = [1_000, 20_000, 40_000, 60_000, 300_000];
const RETRY_JITTERS_MS: [i64; 5] = [5_000, 10_000, 20_000, 30_000, 30_000];

pub(crate) fn retry_schedule() -> TimerSchedule {
    TimerSchedule::from_millis(&RETRY_BASES_MS, &RETRY_JITTERS_MS)
}

type Handler =
    Arc<dyn Fn(DesiredState) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct RetryInner {
    /// Stored by value so a later `set_state` cannot mutate it out from
    /// under the retry.
    stored: Mutex<Option<DesiredState>>,
    timer: Mutex<Option<JitteredTimer>>,
    executing: AtomicBool,
}

/// The single `retrySetState` timer.
///
/// - a request while the callback is executing is discarded (the running
///   schedule advances to its next backoff step instead);
/// - a request while the timer is waiting replaces the stored state and
///   restarts the schedule from the first step;
/// - `cancel` stops everything outright.
#[derive(Clone)]
pub struct RetryTimer {
    inner: Arc<RetryInner>,
    handler: Handler,
}

impl RetryTimer {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(DesiredState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(RetryInner {
                stored: Mutex::new(None),
                timer: Mutex::new(None),
                executing: AtomicBool::new(false),
            }),
            handler: Arc::new(move |state| Box::pin(handler(state))),
        }
    }

    pub fn request(&self, state: DesiredState) {
        if self.inner.executing.load(Ordering::SeqCst) {
            debug!("retry requested during retry execution, schedule advances instead");
            return;
        }

        *self.inner.stored.lock().unwrap() = Some(state);

        // replace any waiting timer: the schedule restarts from step one
        let mut timer_slot = self.inner.timer.lock().unwrap();
        if let Some(old) = timer_slot.take() {
            old.stop();
        }

        let inner = self.inner.clone();
        let handler = self.handler.clone();
        *timer_slot = Some(JitteredTimer::spawn(
            retry_schedule(),
            TimerOptions::default(),
            move |tick| {
                let inner = inner.clone();
                let handler = handler.clone();
                async move {
                    let stored = inner.stored.lock().unwrap().clone();
                    let Some(state) = stored else { return };
                    debug!(attempt = tick.count, "retrying desired state");
                    inner.executing.store(true, Ordering::SeqCst);
                    handler(state).await;
                    inner.executing.store(false, Ordering::SeqCst);
                }
            },
        ));
    }

    pub fn cancel(&self) {
        if let Some(timer) = self.inner.timer.lock().unwrap().take() {
            timer.stop();
        }
        *self.inner.stored.lock().unwrap() = None;
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.timer.lock().unwrap().is_some()
    }
}
