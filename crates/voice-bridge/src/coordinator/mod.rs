//! Conversation coordination
//!
//! The coordinator turns the store's gating primitives into conversation
//! semantics: TTS start/end accounting, barge-in counting (once per gating
//! episode), conversation state transitions and the capture fallback timer
//! that re-enables audio capture if a "playback finished" event never arrives.

mod fallback;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::metrics::{self, MetricsSink};
use crate::playback::GatingControl;
use crate::session::{CallId, ConversationState, GatingOutcome, PlaybackId, SessionStore};

use fallback::FallbackTimers;

/// Reason recorded when a playback is cancelled before it started
pub const REASON_CANCELLED: &str = "cancelled";
/// Reason recorded when the fallback timer ends an episode
pub const REASON_FALLBACK: &str = "fallback";

#[derive(Debug, Clone, Default)]
struct CallTracking {
    /// A barge-in was already counted for the current gating episode
    barge_in_counted: bool,
    barge_in_attempts: u32,
    tts_episodes: u32,
}

type TrackingMap = Arc<Mutex<HashMap<CallId, CallTracking>>>;

/// Aggregate conversation view for health endpoints
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationSummary {
    pub total_calls: usize,
    pub tts_active: usize,
    pub capture_disabled: usize,
    pub by_state: BTreeMap<String, usize>,
    pub barge_in_attempts: u64,
    pub tts_episodes: u64,
    pub pending_fallbacks: usize,
    pub tracked_calls: usize,
}

/// Coordinates gating, barge-in and conversation state for all calls
pub struct ConversationCoordinator {
    store: Arc<SessionStore>,
    metrics: Arc<dyn MetricsSink>,
    config: CoordinatorConfig,
    tracking: TrackingMap,
    fallbacks: FallbackTimers,
}

impl std::fmt::Debug for ConversationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationCoordinator")
            .field("config", &self.config)
            .field("tracked_calls", &self.tracking.lock().len())
            .field("pending_fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl ConversationCoordinator {
    pub fn new(store: Arc<SessionStore>, metrics: Arc<dyn MetricsSink>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            metrics,
            config,
            tracking: Arc::new(Mutex::new(HashMap::new())),
            fallbacks: FallbackTimers::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Start tracking a call
    pub async fn register_call(&self, call_id: &CallId) {
        self.tracking.lock().insert(call_id.clone(), CallTracking::default());
        debug!(call_id = %call_id, "Call registered with coordinator");
        self.refresh_gauges().await;
    }

    /// Stop tracking a call, waiting for its fallback timer to stop
    pub async fn unregister_call(&self, call_id: &CallId) {
        let cancelled = self.fallbacks.cancel(call_id).await;
        let tracking = self.tracking.lock().remove(call_id);
        debug!(
            call_id = %call_id,
            cancelled_fallback = cancelled,
            barge_in_attempts = tracking.map(|t| t.barge_in_attempts),
            "Call unregistered from coordinator"
        );
        self.refresh_gauges().await;
    }

    /// Add a playback's gating token with episode accounting
    pub async fn on_tts_start(&self, call_id: &CallId, playback_id: &PlaybackId) -> Option<GatingOutcome> {
        let outcome = self.store.set_gating_token_with_outcome(call_id, playback_id).await?;
        if outcome.transitioned {
            self.reset_barge_in(call_id);
            debug!(call_id = %call_id, generation = outcome.generation, "TTS episode started");
        }
        self.refresh_gauges().await;
        Some(outcome)
    }

    /// Clear a playback's gating token with episode accounting
    ///
    /// When the last token goes the episode ends and any pending capture
    /// fallback is cancelled (and awaited).
    pub async fn on_tts_end(
        &self,
        call_id: &CallId,
        playback_id: &PlaybackId,
        reason: &str,
    ) -> Option<GatingOutcome> {
        let outcome = self.store.clear_gating_token_with_outcome(call_id, playback_id).await?;
        if outcome.transitioned {
            self.reset_barge_in(call_id);
            if let Some(tracking) = self.tracking.lock().get_mut(call_id) {
                tracking.tts_episodes += 1;
            }
            self.metrics
                .increment_counter(metrics::TTS_EPISODES, &[("reason", reason)], 1);
            let cancelled = self.fallbacks.cancel(call_id).await;
            debug!(call_id = %call_id, reason, cancelled_fallback = cancelled, "TTS episode ended");
        }
        self.refresh_gauges().await;
        Some(outcome)
    }

    /// End a playback that never actually started
    pub async fn cancel_tts(&self, call_id: &CallId, playback_id: &PlaybackId) -> Option<GatingOutcome> {
        self.on_tts_end(call_id, playback_id, REASON_CANCELLED).await
    }

    /// Note caller audio that arrived while TTS is playing
    ///
    /// Returns true only for the first call in a gating episode; later calls
    /// in the same episode and calls outside gating return false.
    pub async fn note_audio_during_tts(&self, call_id: &CallId) -> bool {
        let gated = self
            .store
            .capture_state(call_id)
            .await
            .is_some_and(|capture| capture.tts_playing);
        if !gated {
            return false;
        }

        let counted = {
            let mut tracking = self.tracking.lock();
            let entry = tracking.entry(call_id.clone()).or_default();
            if entry.barge_in_counted {
                false
            } else {
                entry.barge_in_counted = true;
                entry.barge_in_attempts += 1;
                true
            }
        };
        if counted {
            self.metrics.increment_counter(metrics::BARGE_IN_ATTEMPTS, &[], 1);
            info!(call_id = %call_id, "Barge-in attempt during TTS");
        }
        counted
    }

    pub fn barge_in_attempts(&self, call_id: &CallId) -> u32 {
        self.tracking
            .lock()
            .get(call_id)
            .map(|t| t.barge_in_attempts)
            .unwrap_or(0)
    }

    /// Move a call to a named conversation state
    ///
    /// Unknown state names are logged and ignored. Returns true if the state
    /// changed.
    pub async fn update_conversation_state(&self, call_id: &CallId, state: &str) -> bool {
        match state.parse::<ConversationState>() {
            Ok(state) => self.set_conversation_state(call_id, state).await,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Ignoring conversation state update");
                false
            }
        }
    }

    /// Move a call to a conversation state; true if it changed
    pub async fn set_conversation_state(&self, call_id: &CallId, state: ConversationState) -> bool {
        let previous = self
            .store
            .update(call_id, |session| {
                std::mem::replace(&mut session.conversation_state, state)
            })
            .await;

        match previous {
            None => {
                debug!(call_id = %call_id, state = %state, "State update for unknown call");
                false
            }
            Some(previous) if previous == state => false,
            Some(previous) => {
                debug!(call_id = %call_id, from = %previous, to = %state, "Conversation state changed");
                self.refresh_gauges().await;
                true
            }
        }
    }

    /// Schedule the capture fallback with the configured delay
    pub async fn schedule_default_capture_fallback(&self, call_id: &CallId) -> bool {
        self.schedule_capture_fallback(call_id, self.config.capture_fallback())
            .await
    }

    /// Force capture back on after `delay` if it is still disabled
    ///
    /// Any previous timer for the call is cancelled and awaited first. With
    /// `fallback_per_episode` the timer only acts on the gating episode that
    /// was current when it was scheduled. Returns false for unknown calls.
    pub async fn schedule_capture_fallback(&self, call_id: &CallId, delay: Duration) -> bool {
        let Some(capture) = self.store.capture_state(call_id).await else {
            debug!(call_id = %call_id, "Capture fallback requested for unknown call");
            return false;
        };
        let generation = self
            .config
            .fallback_per_episode
            .then_some(capture.gating_generation);

        // Measured from scheduling, not from when the task is first polled
        let deadline = tokio::time::Instant::now() + delay;
        let store = self.store.clone();
        let sink = self.metrics.clone();
        let tracking = self.tracking.clone();
        let timers = self.fallbacks.clone();
        let task_call_id = call_id.clone();

        self.fallbacks
            .start(call_id, move |timer_id| {
                tokio::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    let call_id = task_call_id;
                    if store.force_enable_capture(&call_id, generation).await {
                        if let Some(entry) = tracking.lock().get_mut(&call_id) {
                            entry.barge_in_counted = false;
                            entry.tts_episodes += 1;
                        }
                        sink.increment_counter(metrics::CAPTURE_FALLBACKS, &[], 1);
                        sink.increment_counter(metrics::TTS_EPISODES, &[("reason", REASON_FALLBACK)], 1);
                        warn!(call_id = %call_id, delay_ms = delay.as_millis() as u64, "Capture fallback fired");
                    } else {
                        debug!(call_id = %call_id, "Capture fallback found nothing to do");
                    }
                    timers.complete(&call_id, timer_id);
                })
            })
            .await;

        debug!(
            call_id = %call_id,
            delay_ms = delay.as_millis() as u64,
            generation = ?generation,
            "Capture fallback scheduled"
        );
        true
    }

    /// Cancel a call's fallback timer; true if one was pending
    pub async fn cancel_capture_fallback(&self, call_id: &CallId) -> bool {
        self.fallbacks.cancel(call_id).await
    }

    pub fn has_pending_fallback(&self, call_id: &CallId) -> bool {
        self.fallbacks.is_pending(call_id)
    }

    pub fn pending_fallbacks(&self) -> usize {
        self.fallbacks.len()
    }

    /// Aggregate counts over every session
    pub async fn get_summary(&self) -> ConversationSummary {
        let stats = self.store.stats().await;
        let tracking = self.tracking.lock();
        ConversationSummary {
            total_calls: stats.total_sessions,
            tts_active: stats.tts_playing,
            capture_disabled: stats.capture_disabled,
            by_state: stats.by_state,
            barge_in_attempts: tracking.values().map(|t| t.barge_in_attempts as u64).sum(),
            tts_episodes: tracking.values().map(|t| t.tts_episodes as u64).sum(),
            pending_fallbacks: self.fallbacks.len(),
            tracked_calls: tracking.len(),
        }
    }

    /// Abort every pending fallback timer without waiting
    pub fn shutdown(&self) {
        self.fallbacks.abort_all();
    }

    fn reset_barge_in(&self, call_id: &CallId) {
        if let Some(entry) = self.tracking.lock().get_mut(call_id) {
            entry.barge_in_counted = false;
        }
    }

    async fn refresh_gauges(&self) {
        let stats = self.store.stats().await;
        self.metrics
            .set_gauge(metrics::TTS_GATING_ACTIVE, &[], stats.tts_playing as f64);
        self.metrics.set_gauge(
            metrics::AUDIO_CAPTURE_ENABLED,
            &[],
            stats.total_sessions.saturating_sub(stats.capture_disabled) as f64,
        );
        for (state, count) in &stats.by_state {
            self.metrics
                .set_gauge(metrics::CALLS_BY_STATE, &[("state", state.as_str())], *count as f64);
        }
    }
}

impl Drop for ConversationCoordinator {
    fn drop(&mut self) {
        self.fallbacks.abort_all();
    }
}

#[async_trait]
impl GatingControl for ConversationCoordinator {
    async fn gate(&self, call_id: &CallId, playback_id: &PlaybackId) -> Option<GatingOutcome> {
        self.on_tts_start(call_id, playback_id).await
    }

    async fn ungate(&self, call_id: &CallId, playback_id: &PlaybackId, reason: &str) -> Option<GatingOutcome> {
        self.on_tts_end(call_id, playback_id, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::session::CallSession;

    async fn setup() -> (Arc<SessionStore>, Arc<InMemoryMetrics>, ConversationCoordinator) {
        let store = Arc::new(SessionStore::new());
        let sink = Arc::new(InMemoryMetrics::new());
        let coordinator = ConversationCoordinator::new(store.clone(), sink.clone(), CoordinatorConfig::default());
        store.upsert(CallSession::new("c1")).await;
        coordinator.register_call(&CallId::from("c1")).await;
        (store, sink, coordinator)
    }

    #[tokio::test]
    async fn test_barge_in_counted_once_per_episode() {
        let (_store, sink, coordinator) = setup().await;
        let call = CallId::from("c1");
        let p1 = PlaybackId::from("response:c1:1");

        assert!(!coordinator.note_audio_during_tts(&call).await);

        coordinator.on_tts_start(&call, &p1).await;
        assert!(coordinator.note_audio_during_tts(&call).await);
        assert!(!coordinator.note_audio_during_tts(&call).await);
        coordinator.on_tts_end(&call, &p1, "finished").await;

        let p2 = PlaybackId::from("response:c1:2");
        coordinator.on_tts_start(&call, &p2).await;
        assert!(coordinator.note_audio_during_tts(&call).await);

        assert_eq!(coordinator.barge_in_attempts(&call), 2);
        assert_eq!(sink.counter_total(metrics::BARGE_IN_ATTEMPTS), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_deadline_counts_from_scheduling() {
        let (store, _sink, coordinator) = setup().await;
        let call = CallId::from("c1");
        coordinator.on_tts_start(&call, &PlaybackId::from("p1")).await;
        coordinator.schedule_capture_fallback(&call, Duration::from_millis(100)).await;

        // The clock moves before the timer task has ever been polled
        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(store.get_by_call_id(&call).await.unwrap().audio_capture_enabled);
        assert!(!coordinator.has_pending_fallback(&call));
    }

    #[tokio::test]
    async fn test_unknown_state_is_ignored() {
        let (store, _sink, coordinator) = setup().await;
        let call = CallId::from("c1");

        assert!(!coordinator.update_conversation_state(&call, "singing").await);
        assert!(!coordinator.update_conversation_state(&call, "greeting").await);
        assert!(coordinator.update_conversation_state(&call, "listening").await);
        assert_eq!(
            store.get_by_call_id(&call).await.map(|s| s.conversation_state),
            Some(ConversationState::Listening)
        );
        assert!(!coordinator.update_conversation_state(&CallId::from("nope"), "listening").await);
    }

    #[tokio::test]
    async fn test_gauges_follow_gating() {
        let (_store, sink, coordinator) = setup().await;
        let call = CallId::from("c1");
        let p1 = PlaybackId::from("greeting:c1:1");

        coordinator.on_tts_start(&call, &p1).await;
        assert_eq!(sink.gauge(metrics::TTS_GATING_ACTIVE, &[]), Some(1.0));
        assert_eq!(sink.gauge(metrics::AUDIO_CAPTURE_ENABLED, &[]), Some(0.0));

        coordinator.cancel_tts(&call, &p1).await;
        assert_eq!(sink.gauge(metrics::TTS_GATING_ACTIVE, &[]), Some(0.0));
        assert_eq!(sink.counter(metrics::TTS_EPISODES, &[("reason", REASON_CANCELLED)]), 1);
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let (_store, _sink, coordinator) = setup().await;
        let call = CallId::from("c1");
        coordinator.on_tts_start(&call, &PlaybackId::from("p1")).await;
        coordinator.note_audio_during_tts(&call).await;

        let summary = coordinator.get_summary().await;
        assert_eq!(summary.total_calls, 1);
        assert_eq!(summary.tts_active, 1);
        assert_eq!(summary.capture_disabled, 1);
        assert_eq!(summary.barge_in_attempts, 1);
        assert_eq!(summary.by_state.get("greeting"), Some(&1));
    }
}
