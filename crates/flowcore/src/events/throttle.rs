use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Sink<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Leading + trailing edge rate limiter.
///
/// The first value after a quiet period is delivered immediately. Values
/// arriving inside the interval replace each other and the latest one is
/// delivered when the interval ends. The trailing edge needs a tokio runtime;
/// without one, pending values wait for `flush`.
pub struct Throttle<T> {
    interval: Duration,
    sink: Sink<T>,
    state: Mutex<ThrottleState<T>>,
}

struct ThrottleState<T> {
    last_emitted: Option<Instant>,
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Throttle<T> {
    pub fn new(interval: Duration, sink: impl Fn(T) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            interval,
            sink: Arc::new(sink),
            state: Mutex::new(ThrottleState {
                last_emitted: None,
                pending: None,
                timer: None,
            }),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn push(self: &Arc<Self>, value: T) {
        let now = Instant::now();
        let immediate = {
            let mut state = self.lock();
            let elapsed = state.last_emitted.map(|last| now.duration_since(last));
            match elapsed {
                Some(elapsed) if elapsed < self.interval => {
                    state.pending = Some(value);
                    if state.timer.is_none() {
                        self.schedule(&mut state, self.interval - elapsed);
                    }
                    None
                }
                _ => {
                    state.last_emitted = Some(now);
                    state.pending = None;
                    Some(value)
                }
            }
        };

        if let Some(value) = immediate {
            (self.sink)(value);
        }
    }

    /// Deliver the pending value now, if there is one.
    pub fn flush(&self) -> bool {
        let pending = {
            let mut state = self.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let pending = state.pending.take();
            if pending.is_some() {
                state.last_emitted = Some(Instant::now());
            }
            pending
        };

        match pending {
            Some(value) => {
                (self.sink)(value);
                true
            }
            None => false,
        }
    }

    /// Drop the pending value and stop the trailing timer.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    fn schedule(self: &Arc<Self>, state: &mut ThrottleState<T>, wait: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let throttle = Arc::downgrade(self);
        state.timer = Some(handle.spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(throttle) = throttle.upgrade() {
                throttle.fire_trailing();
            }
        }));
    }

    fn fire_trailing(&self) {
        let pending = {
            let mut state = self.lock();
            state.timer = None;
            let pending = state.pending.take();
            if pending.is_some() {
                state.last_emitted = Some(Instant::now());
            }
            pending
        };
        if let Some(value) = pending {
            (self.sink)(value);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState<T>> {
        // A panicking sink never runs under this lock, so poisoning can be ignored.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Drop for Throttle<T> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }
}
