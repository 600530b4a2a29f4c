//! Keyed periodic timers.
//!
//! Each timer runs a task on a tokio interval until it is stopped. Starting a
//! timer under a key that is already running cancels the old one first, so a
//! key never has two timers. Stopping does not abort a run in progress: the
//! task receives the timer's [`CancellationToken`] and must check it before
//! writing anything.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Timer {
    token: CancellationToken,
}

/// Registry of running timers, keyed by connection or schedule id.
#[derive(Default)]
pub struct TimerRegistry {
    timers: Mutex<HashMap<String, Timer>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` after `initial_delay` and then every `period`.
    ///
    /// Replaces any timer already registered under `key`.
    pub fn start<F, Fut>(
        &self,
        key: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        task: F,
    )
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let timer_key = key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            loop {
                task(cancelled.clone()).await;
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            debug!(key = %timer_key, "Timer loop exited");
        });

        let previous = self.lock().insert(key.clone(), Timer { token });
        if let Some(previous) = previous {
            previous.token.cancel();
            info!(key = %key, "Replaced running timer");
        } else {
            info!(key = %key, period_secs = period.as_secs(), "Started timer");
        }
    }

    /// Cancels the timer under `key`. Returns false if none was running.
    pub fn stop(&self, key: &str) -> bool {
        match self.lock().remove(key) {
            Some(timer) => {
                timer.token.cancel();
                info!(key = %key, "Stopped timer");
                true
            }
            None => false,
        }
    }

    /// Cancels every timer whose key starts with `prefix`.
    pub fn stop_prefixed(&self, prefix: &str) -> usize {
        let mut timers = self.lock();
        let keys: Vec<String> = timers
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(timer) = timers.remove(key) {
                timer.token.cancel();
            }
        }
        keys.len()
    }

    pub fn stop_all(&self) {
        let mut timers = self.lock();
        for (_, timer) in timers.drain() {
            timer.token.cancel();
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Timer>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(
        count: &Arc<AtomicUsize>,
    ) -> impl Fn(CancellationToken) -> futures::future::Ready<()> {
        let count = Arc::clone(count);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    #[tokio::test]
    async fn runs_until_stopped() {
        let registry = TimerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        registry.start("sync:a", Duration::ZERO, Duration::from_millis(10), counting(&count));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.stop("sync:a"));
        assert!(!registry.stop("sync:a"));

        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(count.load(Ordering::SeqCst) <= after_stop + 1);
    }

    #[tokio::test]
    async fn restarting_a_key_replaces_the_timer() {
        let registry = TimerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.start(
            "sync:a",
            Duration::from_millis(30),
            Duration::from_millis(30),
            counting(&first),
        );
        registry.start("sync:a", Duration::ZERO, Duration::from_secs(60), counting(&second));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_keys(), vec!["sync:a".to_string()]);
    }

    #[tokio::test]
    async fn stopping_cancels_the_token_seen_by_a_running_task() {
        let registry = TimerRegistry::new();
        let saw_cancel = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&saw_cancel);

        registry.start("backup:s1", Duration::ZERO, Duration::from_secs(60), move |token| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                if token.is_cancelled() {
                    flag.store(1, Ordering::SeqCst);
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.stop("backup:s1");
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_prefixed_only_touches_matching_keys() {
        let registry = TimerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        for key in ["sync:a", "sync:b", "backup:s1"] {
            registry.start(key, Duration::from_secs(60), Duration::from_secs(60), counting(&count));
        }

        assert_eq!(registry.stop_prefixed("sync:"), 2);
        assert_eq!(registry.active_keys(), vec!["backup:s1".to_string()]);
        registry.stop_all();
        assert!(!registry.is_running("backup:s1"));
    }
}
