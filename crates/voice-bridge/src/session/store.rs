//! Session store
//!
//! The store is the only authority on which calls and playbacks exist and on
//! their gating state. Every mutation runs inside one store-wide critical
//! section, so gating transitions for a call are serialized no matter how
//! telephony callbacks, audio frames and timers interleave.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{CallId, CallSession, CallStatus, ConversationState, PlaybackId, PlaybackRef};

/// Result of a gating token update on a known call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatingOutcome {
    /// Outstanding tokens after the update
    pub active_count: usize,
    /// Whether this update crossed the 0 <-> 1 boundary
    pub transitioned: bool,
    /// Gating generation of the session after the update
    pub generation: u64,
}

/// What [`SessionStore::insert_or_merge`] did with a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMerge {
    /// The call was new
    Inserted,
    /// The call was live; its identity fields were merged into it
    Merged { provider_added: bool },
}

/// Gating view of a call, read without copying the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureState {
    pub audio_capture_enabled: bool,
    pub tts_playing: bool,
    pub gating_generation: u64,
}

/// Aggregate view of the store for health endpoints
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_calls: usize,
    pub tts_playing: usize,
    pub capture_disabled: usize,
    pub by_state: BTreeMap<String, usize>,
    pub outbound_calls: usize,
    pub playbacks_outstanding: usize,
    pub provider_sessions: usize,
    pub total_created: u64,
    pub total_removed: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<CallId, CallSession>,
    /// Channel id (canonical and secondary) -> owning call
    channel_index: HashMap<String, CallId>,
    playbacks: HashMap<PlaybackId, PlaybackRef>,
    provider_sessions: usize,
    total_created: u64,
    total_removed: u64,
}

impl StoreInner {
    fn index_channels(&mut self, session: &CallSession) {
        for channel_id in session.channel_ids() {
            if let Some(previous) = self.channel_index.insert(channel_id.clone(), session.call_id.clone()) {
                if previous != session.call_id {
                    warn!(
                        channel_id = %channel_id,
                        previous = %previous,
                        call_id = %session.call_id,
                        "Channel alias moved to a different call"
                    );
                }
            }
        }
    }

    fn unindex_channels(&mut self, call_id: &CallId) {
        self.channel_index.retain(|_, owner| owner != call_id);
    }

    fn reindex(&mut self, call_id: &CallId) {
        self.unindex_channels(call_id);
        if let Some(session) = self.sessions.get(call_id).cloned() {
            self.index_channels(&session);
        }
    }
}

/// Registry of live call sessions and outstanding playbacks
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session and rebuild its channel aliases
    pub async fn upsert(&self, mut session: CallSession) {
        session.sync_gating_counters();
        let call_id = session.call_id.clone();

        let mut inner = self.inner.lock().await;
        inner.unindex_channels(&call_id);
        inner.index_channels(&session);
        if inner.sessions.insert(call_id.clone(), session).is_none() {
            inner.total_created += 1;
            info!(call_id = %call_id, "Session registered");
        } else {
            debug!(call_id = %call_id, "Session replaced");
        }
    }

    /// Insert a new session, or merge it into the live one with the same id
    ///
    /// Unlike [`SessionStore::upsert`], a live call keeps its gating tokens,
    /// generation, conversation state and scratch area, so a repeated call
    /// start cannot release a playback that is still running.
    pub async fn insert_or_merge(&self, session: CallSession) -> SessionMerge {
        let call_id = session.call_id.clone();
        let mut inner = self.inner.lock().await;

        if let Some(live) = inner.sessions.get_mut(&call_id) {
            let provider_added = live.merge_identity(session);
            inner.reindex(&call_id);
            debug!(call_id = %call_id, provider_added, "Session merged into live call");
            return SessionMerge::Merged { provider_added };
        }

        let mut session = session;
        session.sync_gating_counters();
        inner.index_channels(&session);
        inner.sessions.insert(call_id.clone(), session);
        inner.total_created += 1;
        info!(call_id = %call_id, "Session registered");
        SessionMerge::Inserted
    }

    /// Look up a session by its canonical id
    pub async fn get_by_call_id(&self, call_id: &CallId) -> Option<CallSession> {
        self.inner.lock().await.sessions.get(call_id).cloned()
    }

    /// Look up a session by any of its channel ids
    pub async fn get_by_channel_id(&self, channel_id: &str) -> Option<CallSession> {
        let inner = self.inner.lock().await;
        inner
            .channel_index
            .get(channel_id)
            .and_then(|call_id| inner.sessions.get(call_id))
            .cloned()
    }

    /// Gating flags of a call without cloning the session
    pub async fn capture_state(&self, call_id: &CallId) -> Option<CaptureState> {
        self.inner.lock().await.sessions.get(call_id).map(|s| CaptureState {
            audio_capture_enabled: s.audio_capture_enabled,
            tts_playing: s.tts_playing,
            gating_generation: s.gating_generation,
        })
    }

    /// Take the caller audio buffered since the last gating change
    ///
    /// Returns `None` for unknown calls and an empty buffer if nothing was
    /// buffered.
    pub async fn take_pending_audio(&self, call_id: &CallId) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let session = inner.sessions.get_mut(call_id)?;
        Some(session.vad_scratch_mut().take_pending_audio())
    }

    /// Whether a call is registered
    pub async fn contains(&self, call_id: &CallId) -> bool {
        self.inner.lock().await.sessions.contains_key(call_id)
    }

    /// Remove a session together with every alias pointing at it
    pub async fn remove(&self, call_id: &CallId) -> Option<CallSession> {
        let mut inner = self.inner.lock().await;
        let removed = inner.sessions.remove(call_id)?;
        inner.unindex_channels(call_id);
        inner.total_removed += 1;
        info!(call_id = %call_id, "Session removed");
        Some(removed)
    }

    /// Mutate a session in place, then re-persist its aliases and counters
    ///
    /// This is the supported way to change fields after `upsert`. Aliases are
    /// rebuilt only if the closure changed the channel set.
    pub async fn update<F, R>(&self, call_id: &CallId, f: F) -> Option<R>
    where
        F: FnOnce(&mut CallSession) -> R,
    {
        let mut inner = self.inner.lock().await;
        let session = inner.sessions.get_mut(call_id)?;
        let channels_before = session.channels.clone();
        let result = f(session);
        session.sync_gating_counters();
        if session.channels != channels_before {
            inner.reindex(call_id);
        }
        Some(result)
    }

    /// Add a gating token for a playback; false if the call is unknown
    pub async fn set_gating_token(&self, call_id: &CallId, playback_id: &PlaybackId) -> bool {
        self.set_gating_token_with_outcome(call_id, playback_id).await.is_some()
    }

    /// Add a gating token and report the resulting gating state
    ///
    /// Only the 0 -> 1 transition starts a gating episode: capture is
    /// disabled, the start time recorded, the generation bumped and the VAD
    /// scratch area cleared. Repeating a token is a no-op.
    pub async fn set_gating_token_with_outcome(
        &self,
        call_id: &CallId,
        playback_id: &PlaybackId,
    ) -> Option<GatingOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(call_id) else {
            warn!(call_id = %call_id, playback_id = %playback_id, "Gating token set for unknown call");
            return None;
        };

        let before = session.tts_tokens.len();
        session.tts_tokens.insert(playback_id.clone());
        session.sync_gating_counters();

        let transitioned = before == 0 && session.active_count == 1;
        if transitioned {
            session.audio_capture_enabled = false;
            session.tts_started_at = Some(Utc::now());
            session.gating_generation += 1;
            session.reset_vad_scratch();
            debug!(
                call_id = %call_id,
                playback_id = %playback_id,
                generation = session.gating_generation,
                "TTS gating started, audio capture disabled"
            );
        } else if session.active_count > 0 {
            session.audio_capture_enabled = false;
            debug!(
                call_id = %call_id,
                playback_id = %playback_id,
                active_count = session.active_count,
                "Gating token added to an active episode"
            );
        }

        Some(GatingOutcome {
            active_count: session.active_count,
            transitioned,
            generation: session.gating_generation,
        })
    }

    /// Remove a gating token; false if the call is unknown
    pub async fn clear_gating_token(&self, call_id: &CallId, playback_id: &PlaybackId) -> bool {
        self.clear_gating_token_with_outcome(call_id, playback_id).await.is_some()
    }

    /// Remove a gating token and report the resulting gating state
    ///
    /// Only the 1 -> 0 transition ends the episode and re-enables capture.
    pub async fn clear_gating_token_with_outcome(
        &self,
        call_id: &CallId,
        playback_id: &PlaybackId,
    ) -> Option<GatingOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(call_id) else {
            warn!(call_id = %call_id, playback_id = %playback_id, "Gating token cleared for unknown call");
            return None;
        };

        let removed = session.tts_tokens.remove(playback_id);
        session.sync_gating_counters();

        let transitioned = removed && session.active_count == 0;
        if transitioned {
            session.audio_capture_enabled = true;
            session.tts_ended_at = Some(Utc::now());
            session.reset_vad_scratch();
            debug!(call_id = %call_id, playback_id = %playback_id, "TTS gating ended, audio capture enabled");
        } else if session.active_count > 0 {
            session.audio_capture_enabled = false;
            debug!(
                call_id = %call_id,
                playback_id = %playback_id,
                active_count = session.active_count,
                "Gating token cleared, other playbacks still outstanding"
            );
        } else if !removed {
            debug!(call_id = %call_id, playback_id = %playback_id, "Gating token was not outstanding");
        }

        Some(GatingOutcome {
            active_count: session.active_count,
            transitioned,
            generation: session.gating_generation,
        })
    }

    /// Force audio capture back on for a call whose gating never cleared
    ///
    /// With `generation` set, acts only if the call is still in that gating
    /// episode. Stale tokens are dropped so the refcount stays consistent.
    /// Returns true if capture was re-enabled.
    pub async fn force_enable_capture(&self, call_id: &CallId, generation: Option<u64>) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(call_id) else {
            return false;
        };

        if session.audio_capture_enabled {
            return false;
        }
        if let Some(expected) = generation {
            if session.gating_generation != expected {
                debug!(
                    call_id = %call_id,
                    expected,
                    current = session.gating_generation,
                    "Capture fallback skipped, a newer gating episode is active"
                );
                return false;
            }
        }

        let stale: Vec<_> = session.tts_tokens.iter().cloned().collect();
        session.tts_tokens.clear();
        session.sync_gating_counters();
        session.audio_capture_enabled = true;
        session.tts_ended_at = Some(Utc::now());
        session.reset_vad_scratch();
        warn!(call_id = %call_id, stale_tokens = ?stale, "Audio capture force-enabled");
        true
    }

    /// Register an outstanding playback; false if its call is gone or ending
    pub async fn add_playback(&self, playback: PlaybackRef) -> bool {
        let mut inner = self.inner.lock().await;
        let live = inner
            .sessions
            .get(&playback.call_id)
            .is_some_and(|s| s.status != CallStatus::Ending);
        if !live {
            debug!(playback_id = %playback.playback_id, call_id = %playback.call_id, "Playback for removed call not registered");
            return false;
        }
        debug!(playback_id = %playback.playback_id, call_id = %playback.call_id, "Playback registered");
        inner.playbacks.insert(playback.playback_id.clone(), playback);
        true
    }

    /// Remove and return a playback
    pub async fn pop_playback(&self, playback_id: &PlaybackId) -> Option<PlaybackRef> {
        self.inner.lock().await.playbacks.remove(playback_id)
    }

    pub async fn get_playback(&self, playback_id: &PlaybackId) -> Option<PlaybackRef> {
        self.inner.lock().await.playbacks.get(playback_id).cloned()
    }

    pub async fn list_playbacks_for_call(&self, call_id: &CallId) -> Vec<PlaybackRef> {
        let inner = self.inner.lock().await;
        let mut playbacks: Vec<_> = inner
            .playbacks
            .values()
            .filter(|p| &p.call_id == call_id)
            .cloned()
            .collect();
        playbacks.sort_by(|a, b| a.playback_id.cmp(&b.playback_id));
        playbacks
    }

    /// Remove every playback belonging to a call
    pub async fn drain_playbacks_for_call(&self, call_id: &CallId) -> Vec<PlaybackRef> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<_> = inner
            .playbacks
            .iter()
            .filter(|(_, p)| &p.call_id == call_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| inner.playbacks.remove(id)).collect()
    }

    pub async fn register_provider_session(&self) {
        self.inner.lock().await.provider_sessions += 1;
    }

    pub async fn release_provider_session(&self) {
        let mut inner = self.inner.lock().await;
        inner.provider_sessions = inner.provider_sessions.saturating_sub(1);
    }

    /// Ids of calls that are not being torn down
    pub async fn active_calls(&self) -> Vec<CallId> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<_> = inner
            .sessions
            .values()
            .filter(|s| s.status != CallStatus::Ending)
            .map(|s| s.call_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn all_sessions(&self) -> Vec<CallSession> {
        self.inner.lock().await.sessions.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Outbound calls grouped by campaign id
    pub async fn outbound_call_counts(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock().await;
        let mut counts = HashMap::new();
        for outbound in inner.sessions.values().filter_map(|s| s.outbound.as_ref()) {
            *counts.entry(outbound.campaign_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub async fn stats(&self) -> SessionStats {
        let inner = self.inner.lock().await;
        let mut stats = SessionStats {
            total_sessions: inner.sessions.len(),
            playbacks_outstanding: inner.playbacks.len(),
            provider_sessions: inner.provider_sessions,
            total_created: inner.total_created,
            total_removed: inner.total_removed,
            ..Default::default()
        };
        for state in ConversationState::ALL {
            stats.by_state.insert(state.as_str().to_string(), 0);
        }

        for session in inner.sessions.values() {
            if session.status != CallStatus::Ending {
                stats.active_calls += 1;
            }
            if session.tts_playing {
                stats.tts_playing += 1;
            }
            if !session.audio_capture_enabled {
                stats.capture_disabled += 1;
            }
            if session.is_outbound() {
                stats.outbound_calls += 1;
            }
            *stats
                .by_state
                .entry(session.conversation_state.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Ids of sessions at least `max_age` old
    pub async fn expired_call_ids(&self, max_age: Duration) -> Vec<CallId> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let inner = self.inner.lock().await;
        let now = Utc::now();
        inner
            .sessions
            .values()
            .filter(|s| now.signed_duration_since(s.created_at) >= max_age)
            .map(|s| s.call_id.clone())
            .collect()
    }

    /// Remove sessions older than `max_age`, returning how many were removed
    ///
    /// Expired ids are collected under one lock; each removal then takes the
    /// lock on its own so the sweep never holds it for the whole fleet.
    pub async fn cleanup_expired(&self, max_age: Duration) -> usize {
        let expired = self.expired_call_ids(max_age).await;

        let mut removed = 0;
        for call_id in &expired {
            if self.remove(call_id).await.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Expired sessions cleaned up");
        }
        removed
    }
}
