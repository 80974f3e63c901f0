//! Leading + trailing throttle.
//!
//! The first call in a quiet period runs the action immediately. Calls made
//! while the window is open collapse into one trailing run when it closes.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

type Action = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ThrottleState {
    pending: bool,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

pub struct Throttle {
    window: Duration,
    action: Action,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    pub fn new(window: Duration, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            window,
            action: Arc::new(action),
            state: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request a run of the action.
    ///
    /// Outside a tokio runtime there is no timer, so every call runs
    /// immediately.
    pub fn call(&self) {
        let leading = {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            if state.timer.is_some() {
                state.pending = true;
                false
            } else {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    state.timer = Some(runtime.spawn(run_window(
                        Arc::downgrade(&self.state),
                        Arc::clone(&self.action),
                        self.window,
                    )));
                }
                true
            }
        };
        if leading {
            (self.action)();
        }
    }

    /// Run a pending trailing call now instead of at the end of the window.
    pub fn flush(&self) {
        let fire = std::mem::take(&mut self.state().pending);
        if fire {
            (self.action)();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state().pending
    }

    /// Flush, then ignore every later call.
    pub fn dispose(&self) {
        self.flush();
        let timer = {
            let mut state = self.state();
            state.disposed = true;
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run_window(state: Weak<Mutex<ThrottleState>>, action: Action, window: Duration) {
    loop {
        tokio::time::sleep(window).await;
        let Some(state) = state.upgrade() else {
            return;
        };
        let fire = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state.pending {
                state.pending = false;
                true
            } else {
                state.timer = None;
                false
            }
        };
        if !fire {
            return;
        }
        action();
    }
}
