//! Generic idle-resource tracker shared by the kernel manager and the
//! vector DB manager (spec §4.4). A single sweeper task scans all
//! registered resources on a coarse tick and invokes the owner-supplied
//! expiry callback for anything past its deadline; the callback decides
//! what "expired" means (destroy a kernel, offload an index) and is
//! responsible for calling [`ActivityController::unregister`] if it does
//! not want to be invoked again on the next tick.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::error;

/// Coarse sweep tick, within spec's suggested 1-5s band.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

struct Entry {
    last_activity: Instant,
    idle_timeout: Duration,
    monitoring_enabled: bool,
}

impl Entry {
    /// `idleTimeout <= 0` disables expiry; `now == lastActivity + timeout`
    /// is treated as not yet expired (spec's tie-breaking rule).
    fn is_expired(&self, now: Instant) -> bool {
        self.monitoring_enabled
            && !self.idle_timeout.is_zero()
            && now > self.last_activity + self.idle_timeout
    }
}

pub struct ActivityController<F> {
    entries: Mutex<HashMap<String, Entry>>,
    on_expire: F,
}

impl<F> ActivityController<F>
where
    F: Fn(&str) + Send + Sync + 'static,
{
    pub fn new(on_expire: F) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            on_expire,
        })
    }

    /// Spawns the single periodic sweeper. The returned handle may be
    /// aborted to stop monitoring (used in tests and on manager shutdown).
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                controller.sweep();
            }
        })
    }

    pub fn register(&self, id: impl Into<String>, idle_timeout: Duration) {
        self.entries.lock().insert(
            id.into(),
            Entry {
                last_activity: Instant::now(),
                idle_timeout,
                monitoring_enabled: true,
            },
        );
    }

    pub fn unregister(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    /// Resets `lastActivity` to now. No-op if `id` is not registered.
    pub fn ping(&self, id: &str) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Disabling monitoring pauses expiry but preserves `lastActivity`.
    pub fn set_monitoring_enabled(&self, id: &str, enabled: bool) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.monitoring_enabled = enabled;
        }
    }

    pub fn get_last_activity(&self, id: &str) -> Option<Instant> {
        self.entries.lock().get(id).map(|e| e.last_activity)
    }

    pub fn get_timeout(&self, id: &str) -> Option<Duration> {
        self.entries.lock().get(id).map(|e| e.idle_timeout)
    }

    pub fn set_timeout(&self, id: &str, timeout: Duration) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.idle_timeout = timeout;
        }
    }

    /// `None` if `id` is unregistered or expiry is disabled for it.
    pub fn get_time_until_expire(&self, id: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        let entry = entries.get(id)?;
        if !entry.monitoring_enabled || entry.idle_timeout.is_zero() {
            return None;
        }
        let deadline = entry.last_activity + entry.idle_timeout;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in expired {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.on_expire)(&id))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(resource = %id, %message, "activity expiry callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::sync::Mutex as StdMutex;

    use super::*;

    #[tokio::test]
    async fn ping_before_expiry_prevents_it() {
        let expired = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&expired);
        let controller = ActivityController::new(move |id: &str| {
            recorder.lock().expect("lock").push(id.to_string());
        });
        controller.register("ns:k1", Duration::from_secs(10));

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(8)).await;
        controller.ping("ns:k1");
        controller.sweep();
        assert!(expired.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn sweep_invokes_on_expire_past_deadline() {
        let expired = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&expired);
        let controller = ActivityController::new(move |id: &str| {
            recorder.lock().expect("lock").push(id.to_string());
        });
        controller.register("ns:k1", Duration::from_secs(5));

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(6)).await;
        controller.sweep();
        assert_eq!(*expired.lock().expect("lock"), vec!["ns:k1".to_string()]);
    }

    #[tokio::test]
    async fn tie_at_exact_deadline_is_not_expired() {
        let controller = ActivityController::new(|_: &str| {});
        controller.register("ns:k1", Duration::from_secs(5));

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(5)).await;
        let entries = controller.entries.lock();
        let entry = entries.get("ns:k1").expect("registered");
        assert!(!entry.is_expired(Instant::now()));
    }

    #[tokio::test]
    async fn zero_timeout_disables_expiry() {
        let expired = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&expired);
        let controller = ActivityController::new(move |id: &str| {
            recorder.lock().expect("lock").push(id.to_string());
        });
        controller.register("ns:k1", Duration::ZERO);

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(1_000)).await;
        controller.sweep();
        assert!(expired.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn disabling_monitoring_preserves_last_activity() {
        let controller = ActivityController::new(|_: &str| {});
        controller.register("ns:k1", Duration::from_secs(5));
        let before = controller.get_last_activity("ns:k1").expect("registered");
        controller.set_monitoring_enabled("ns:k1", false);
        assert_eq!(controller.get_last_activity("ns:k1"), Some(before));
        assert_eq!(controller.get_time_until_expire("ns:k1"), None);
    }

    #[tokio::test]
    async fn panicking_callback_is_caught_and_logged() {
        let controller = ActivityController::new(|_: &str| panic!("boom"));
        controller.register("ns:k1", Duration::from_secs(1));

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(2)).await;
        controller.sweep();
        // Reaching here means the panic did not unwind out of sweep().
        assert!(controller.get_last_activity("ns:k1").is_some());
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let controller = ActivityController::new(|_: &str| {});
        controller.register("ns:k1", Duration::from_secs(5));
        controller.unregister("ns:k1");
        assert_eq!(controller.get_last_activity("ns:k1"), None);
    }
}
