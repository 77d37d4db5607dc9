//! Voice bridge engine
//!
//! Wires the session store, playback manager, conversation coordinator and
//! VAD together from one [`VoiceBridgeConfig`] and routes bridge events and
//! caller audio into them.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::audio::pcm16_le_to_samples;
use crate::bridge::{BridgeClient, BridgeEvent};
use crate::config::VoiceBridgeConfig;
use crate::coordinator::{ConversationCoordinator, ConversationSummary};
use crate::error::Result;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::playback::{GatingControl, PlaybackKind, PlaybackManager};
use crate::session::{CallId, CallSession, CallStatus, PlaybackId, SessionMerge, SessionStats, SessionStore};
use crate::vad::{SpeechClassifier, VadManager, VadResult, ZeroCrossingClassifier};

/// Caller audio kept in a session's scratch buffer (30 s of 16 kHz PCM16)
const MAX_PENDING_AUDIO_BYTES: usize = 16_000 * 2 * 30;

/// What to do with a frame of caller audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAudioDecision {
    /// Capture is enabled; hand the frame to the STT provider
    Forward,
    /// Capture is disabled (or the call is unknown); drop the frame
    Suppress,
    /// First caller speech of this gating episode; the frame is dropped but
    /// the caller is trying to interrupt
    BargeIn,
}

/// Health view over the whole engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub sessions: SessionStats,
    pub conversation: ConversationSummary,
    pub vad_tracked_calls: usize,
}

/// Real-time call session engine
pub struct VoiceBridgeEngine {
    config: VoiceBridgeConfig,
    store: Arc<SessionStore>,
    coordinator: Arc<ConversationCoordinator>,
    playback: PlaybackManager,
    vad: VadManager,
}

impl std::fmt::Debug for VoiceBridgeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceBridgeEngine")
            .field("coordinator", &self.coordinator)
            .field("playback", &self.playback)
            .finish()
    }
}

impl VoiceBridgeEngine {
    /// Create an engine that discards metrics
    pub fn new(config: VoiceBridgeConfig, bridge: Arc<dyn BridgeClient>) -> Result<Self> {
        Self::with_metrics(config, bridge, Arc::new(NoopMetrics))
    }

    /// Create an engine reporting to a metrics sink
    pub fn with_metrics(
        config: VoiceBridgeConfig,
        bridge: Arc<dyn BridgeClient>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let classifier: Arc<dyn SpeechClassifier> = Arc::new(ZeroCrossingClassifier::default());
        Self::with_components(config, bridge, metrics, Some(classifier))
    }

    /// Create an engine with an explicit speech classifier (or none)
    pub fn with_components(
        config: VoiceBridgeConfig,
        bridge: Arc<dyn BridgeClient>,
        metrics: Arc<dyn MetricsSink>,
        classifier: Option<Arc<dyn SpeechClassifier>>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SessionStore::new());
        let coordinator = Arc::new(ConversationCoordinator::new(
            store.clone(),
            metrics.clone(),
            config.coordinator.clone(),
        ));
        let gating: Arc<dyn GatingControl> = coordinator.clone();
        let playback = PlaybackManager::with_gating(store.clone(), gating, bridge, config.playback.clone());
        let vad = VadManager::with_components(config.vad.clone(), classifier, metrics)?;

        info!(
            media_dir = %config.playback.media_dir.display(),
            capture_fallback_ms = config.coordinator.capture_fallback_ms,
            adaptive_vad = config.vad.adaptive_enabled,
            "Voice bridge engine created"
        );
        Ok(Self {
            config,
            store,
            coordinator,
            playback,
            vad,
        })
    }

    pub fn config(&self) -> &VoiceBridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &ConversationCoordinator {
        &self.coordinator
    }

    pub fn playback(&self) -> &PlaybackManager {
        &self.playback
    }

    pub fn vad(&self) -> &VadManager {
        &self.vad
    }

    /// Start a call on its primary channel
    ///
    /// Returns the session as stored, which for a repeated start is the live
    /// call with the new details merged in.
    pub async fn start_call(&self, call_id: impl Into<CallId>, provider: Option<&str>) -> CallSession {
        let mut session = CallSession::new(call_id).with_status(CallStatus::Connected);
        if let Some(provider) = provider {
            session = session.with_provider(provider);
        }
        let call_id = session.call_id.clone();
        self.start_call_with(session.clone()).await;
        self.store.get_by_call_id(&call_id).await.unwrap_or(session)
    }

    /// Start a call from a fully built session
    ///
    /// A start for a call that is already live (a duplicated telephony event)
    /// only merges channels, bridge id, provider and status into it; gating
    /// and coordinator tracking carry on untouched.
    pub async fn start_call_with(&self, session: CallSession) -> SessionMerge {
        let call_id = session.call_id.clone();
        let provider = session.provider.clone();

        let merge = self.store.insert_or_merge(session).await;
        match merge {
            SessionMerge::Inserted => {
                if provider.is_some() {
                    self.store.register_provider_session().await;
                }
                self.coordinator.register_call(&call_id).await;
                info!(call_id = %call_id, provider = ?provider, "Call started");
            }
            SessionMerge::Merged { provider_added } => {
                if provider_added {
                    self.store.register_provider_session().await;
                }
                info!(call_id = %call_id, provider = ?provider, "Repeated start merged into live call");
            }
        }
        merge
    }

    /// Tear a call down; returns the removed session
    ///
    /// The call's fallback timer has stopped, its playbacks are discarded and
    /// its VAD state is gone by the time this returns.
    pub async fn end_call(&self, call_id: &CallId) -> Option<CallSession> {
        self.store
            .update(call_id, |session| session.status = CallStatus::Ending)
            .await?;

        self.coordinator.unregister_call(call_id).await;
        let discarded = self.playback.discard_call_playbacks(call_id).await;
        self.vad.reset_call(call_id);

        let removed = self.store.remove(call_id).await;
        if removed.as_ref().is_some_and(|s| s.provider.is_some()) {
            self.store.release_provider_session().await;
        }
        info!(call_id = %call_id, discarded_playbacks = discarded, "Call ended");
        removed
    }

    /// Play synthesized speech to a call and arm the capture fallback
    pub async fn speak(&self, call_id: &CallId, audio: &[u8], kind: PlaybackKind) -> Option<PlaybackId> {
        let playback_id = self.playback.play_audio(call_id, audio, kind).await?;
        self.coordinator.schedule_default_capture_fallback(call_id).await;
        Some(playback_id)
    }

    /// Route an event from the telephony bridge; false if it matched nothing
    pub async fn handle_bridge_event(&self, event: BridgeEvent) -> bool {
        match event {
            BridgeEvent::PlaybackFinished { playback_id } => self.playback.finish(&playback_id).await.is_some(),
            BridgeEvent::ChannelDestroyed { channel_id } => {
                let Some(session) = self.store.get_by_channel_id(&channel_id).await else {
                    debug!(channel_id = %channel_id, "ChannelDestroyed for unknown channel");
                    return false;
                };
                self.end_call(&session.call_id).await.is_some()
            }
        }
    }

    /// Score a frame of caller audio (PCM16 LE) and decide where it goes
    pub async fn process_inbound_audio(
        &self,
        call_id: &CallId,
        pcm: &[u8],
        sample_rate: u32,
    ) -> InboundAudioDecision {
        let Some(capture) = self.store.capture_state(call_id).await else {
            trace!(call_id = %call_id, "Inbound audio for unknown call");
            return InboundAudioDecision::Suppress;
        };

        let samples = pcm16_le_to_samples(pcm);
        let result = self.vad.process_frame(call_id, &samples, sample_rate);

        if !capture.audio_capture_enabled {
            if result.is_speech && self.coordinator.note_audio_during_tts(call_id).await {
                self.vad.record_interruption(call_id);
                return InboundAudioDecision::BargeIn;
            }
            return InboundAudioDecision::Suppress;
        }

        let buffered = self
            .store
            .update(call_id, |session| buffer_audio(session, pcm, &result))
            .await;
        match buffered {
            // Gating started while the frame was being scored
            Some(false) => InboundAudioDecision::Suppress,
            _ => InboundAudioDecision::Forward,
        }
    }

    /// Take the caller audio forwarded since the last gating change
    pub async fn take_caller_audio(&self, call_id: &CallId) -> Option<Bytes> {
        self.store.take_pending_audio(call_id).await.map(Bytes::from)
    }

    /// Tear down every session older than `max_session_age`
    pub async fn sweep_expired(&self) -> usize {
        let expired = self
            .store
            .expired_call_ids(self.config.sessions.max_session_age())
            .await;
        let mut removed = 0;
        for call_id in &expired {
            if self.end_call(call_id).await.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Expired calls swept");
        }
        removed
    }

    /// Run [`VoiceBridgeEngine::sweep_expired`] every `cleanup_interval`
    ///
    /// The task stops on its own once the engine is dropped; abort the
    /// returned handle to stop it earlier.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sessions.cleanup_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.sweep_expired().await;
            }
            debug!("Session cleanup task stopped");
        })
    }

    pub async fn summary(&self) -> EngineSummary {
        EngineSummary {
            sessions: self.store.stats().await,
            conversation: self.coordinator.get_summary().await,
            vad_tracked_calls: self.vad.tracked_calls(),
        }
    }

    /// Stop background timers without waiting on them
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        info!("Voice bridge engine shut down");
    }
}

/// Append a forwarded frame to the session's scratch buffer
///
/// Returns false if capture was disabled in the meantime.
fn buffer_audio(session: &mut CallSession, pcm: &[u8], result: &VadResult) -> bool {
    if !session.audio_capture_enabled {
        return false;
    }
    let scratch = session.vad_scratch_mut();
    scratch.push_audio(pcm, MAX_PENDING_AUDIO_BYTES);
    scratch.frames_seen += 1;
    if result.is_speech {
        scratch.speech_frames += 1;
        scratch.trailing_silence = 0;
        scratch.last_speech_at = Some(chrono::Utc::now());
    } else {
        scratch.trailing_silence += 1;
    }
    true
}
