use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

pub type WatchdogFn = Arc<dyn Fn() + Send + Sync>;

/// Restartable one-shot timer. Fires its callback once `timeout` passes
/// without a `restart`.
pub struct Watchdog {
    timeout: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    callback: Option<WatchdogFn>,
    timer: Option<JoinHandle<()>>,
}

impl State {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(State::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm the timer, replacing any pending one.
    pub fn start(&self, callback: WatchdogFn) {
        let mut state = self.lock();
        state.disarm();
        state.timer = Some(self.spawn_timer(Arc::clone(&callback)));
        state.callback = Some(callback);
    }

    /// Push the deadline out by a full timeout. No-op before `start`.
    pub fn restart(&self) {
        let mut state = self.lock();
        let Some(callback) = state.callback.clone() else {
            return;
        };
        state.disarm();
        state.timer = Some(self.spawn_timer(callback));
    }

    pub fn cancel(&self) {
        let mut state = self.lock();
        state.disarm();
        state.callback = None;
    }

    pub fn is_armed(&self) -> bool {
        self.lock()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    fn spawn_timer(&self, callback: WatchdogFn) -> JoinHandle<()> {
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            callback();
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.lock().disarm();
    }
}
