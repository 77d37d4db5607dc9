//! Per-call capture fallback timers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

use crate::session::CallId;

#[derive(Debug)]
struct ScheduledFallback {
    timer_id: u64,
    handle: JoinHandle<()>,
}

/// At most one live fallback task per call
///
/// Cancelling removes the entry under the lock and then aborts and awaits the
/// task outside it, so a cancelled timer has fully stopped before the caller
/// continues.
#[derive(Debug, Clone, Default)]
pub(crate) struct FallbackTimers {
    timers: Arc<Mutex<HashMap<CallId, ScheduledFallback>>>,
    next_id: Arc<AtomicU64>,
}

impl FallbackTimers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start a timer for a call, replacing (and stopping) any previous one
    ///
    /// `make_task` receives the timer id so the task can deregister itself
    /// through [`FallbackTimers::complete`].
    pub(crate) async fn start<F>(&self, call_id: &CallId, make_task: F)
    where
        F: FnOnce(u64) -> tokio::task::JoinHandle<()>,
    {
        self.cancel(call_id).await;

        let timer_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = {
            // Spawned under the lock so the task cannot complete before its entry exists
            let mut timers = self.timers.lock();
            let handle = make_task(timer_id);
            timers.insert(call_id.clone(), ScheduledFallback { timer_id, handle })
        };
        if let Some(previous) = replaced {
            stop(call_id, previous).await;
        }
    }

    /// Stop a call's timer; true if one was pending
    pub(crate) async fn cancel(&self, call_id: &CallId) -> bool {
        let entry = self.timers.lock().remove(call_id);
        match entry {
            Some(entry) => {
                stop(call_id, entry).await;
                true
            }
            None => false,
        }
    }

    /// Deregister a timer that has run to completion
    pub(crate) fn complete(&self, call_id: &CallId, timer_id: u64) {
        let mut timers = self.timers.lock();
        if timers.get(call_id).is_some_and(|t| t.timer_id == timer_id) {
            timers.remove(call_id);
        }
    }

    pub(crate) fn is_pending(&self, call_id: &CallId) -> bool {
        self.timers.lock().contains_key(call_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.lock().len()
    }

    /// Abort every timer without waiting
    pub(crate) fn abort_all(&self) {
        for (_, entry) in self.timers.lock().drain() {
            entry.handle.abort();
        }
    }
}

async fn stop(call_id: &CallId, entry: ScheduledFallback) {
    entry.handle.abort();
    if let Err(e) = entry.handle.await {
        if e.is_panic() {
            error!(call_id = %call_id, timer_id = entry.timer_id, "Capture fallback task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_start_replaces_previous_timer() {
        let timers = FallbackTimers::new();
        let call = CallId::from("c1");
        let fired = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let fired = fired.clone();
            let done = timers.clone();
            let call_id = call.clone();
            timers
                .start(&call, move |timer_id| {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        fired.fetch_add(1, Ordering::SeqCst);
                        done.complete(&call_id, timer_id);
                    })
                })
                .await;
        }
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_pending(&call));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_timer() {
        let timers = FallbackTimers::new();
        let call = CallId::from("c1");
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        timers
            .start(&call, move |_| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;

        assert!(timers.cancel(&call).await);
        assert!(!timers.cancel(&call).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
