//! Inactivity supervisor
//!
//! Keeps at most one pending timer per token. Re-arming replaces the old
//! timer; every timer carries a generation number and only fires if it is
//! still the current one for its token when the deadline passes, so a
//! re-arm that lands before expiry always wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

use linkshare_core::Token;

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

/// Per-connection inactivity timers
pub struct InactivitySupervisor {
    timeout: Duration,
    timers: Arc<Mutex<HashMap<Token, Timer>>>,
    next_generation: AtomicU64,
}

impl InactivitySupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cancel any pending timer for `token` and start a new one.
    ///
    /// `on_expire` runs at most once, and only if this timer is not
    /// re-armed or cancelled before the deadline. Must be called from
    /// within a Tokio runtime.
    pub fn arm<F>(&self, token: &str, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let timeout = self.timeout;
        let key = token.to_string();

        let mut pending = self.timers.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let claimed = {
                let mut timers = timers.lock();
                match timers.get(&key) {
                    Some(timer) if timer.generation == generation => {
                        timers.remove(&key);
                        true
                    }
                    _ => false,
                }
            };

            if claimed {
                debug!("Inactivity timer expired for {}", key);
                on_expire();
            }
        });

        let previous = pending.insert(
            token.to_string(),
            Timer {
                generation,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Cancel the pending timer for `token`, if any
    pub fn cancel(&self, token: &str) -> bool {
        match self.timers.lock().remove(token) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, token: &str) -> bool {
        self.timers.lock().contains_key(token)
    }

    /// Number of pending timers
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}
