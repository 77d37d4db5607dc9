//! TTS playback lifecycle
//!
//! A playback moves through `Created -> Gated + Dispatched -> Finished` or ends
//! at `FailedAtDispatch`. The gating token is set *before* the bridge command
//! goes out, so caller audio arriving while the command is in flight is
//! already treated as gated. A failed dispatch rolls the token back. No
//! retries happen at this layer.

mod ids;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bridge::BridgeClient;
use crate::config::PlaybackConfig;
use crate::session::{CallId, GatingOutcome, PlaybackId, PlaybackRef, SessionStore};

pub use ids::{PlaybackIdGenerator, PlaybackKind};

/// Rollback reason used when the bridge rejects a playback
pub const REASON_DISPATCH_FAILED: &str = "dispatch_failed";
/// Reason used when the bridge reports a playback finished
pub const REASON_FINISHED: &str = "finished";

/// Gating primitives used by the playback manager
///
/// Implemented by the session store directly and by the conversation
/// coordinator, which layers its accounting on top.
#[async_trait]
pub trait GatingControl: Send + Sync {
    async fn gate(&self, call_id: &CallId, playback_id: &PlaybackId) -> Option<GatingOutcome>;

    async fn ungate(&self, call_id: &CallId, playback_id: &PlaybackId, reason: &str) -> Option<GatingOutcome>;
}

#[async_trait]
impl GatingControl for SessionStore {
    async fn gate(&self, call_id: &CallId, playback_id: &PlaybackId) -> Option<GatingOutcome> {
        self.set_gating_token_with_outcome(call_id, playback_id).await
    }

    async fn ungate(&self, call_id: &CallId, playback_id: &PlaybackId, _reason: &str) -> Option<GatingOutcome> {
        self.clear_gating_token_with_outcome(call_id, playback_id).await
    }
}

/// A playback the bridge reported as finished
#[derive(Debug, Clone)]
pub struct FinishedPlayback {
    pub playback: PlaybackRef,
    /// Gating state after the token was cleared (None if the call is gone)
    pub gating: Option<GatingOutcome>,
}

/// Owns playback id generation, gating, dispatch and cleanup
pub struct PlaybackManager {
    store: Arc<SessionStore>,
    gating: Arc<dyn GatingControl>,
    bridge: Arc<dyn BridgeClient>,
    config: PlaybackConfig,
    ids: PlaybackIdGenerator,
}

impl std::fmt::Debug for PlaybackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackManager")
            .field("media_dir", &self.config.media_dir)
            .field("use_bridge_media", &self.config.use_bridge_media)
            .finish()
    }
}

impl PlaybackManager {
    /// Create a manager that gates directly through the store
    pub fn new(store: Arc<SessionStore>, bridge: Arc<dyn BridgeClient>, config: PlaybackConfig) -> Self {
        let gating: Arc<dyn GatingControl> = store.clone();
        Self::with_gating(store, gating, bridge, config)
    }

    /// Create a manager that gates through another controller
    pub fn with_gating(
        store: Arc<SessionStore>,
        gating: Arc<dyn GatingControl>,
        bridge: Arc<dyn BridgeClient>,
        config: PlaybackConfig,
    ) -> Self {
        Self {
            store,
            gating,
            bridge,
            config,
            ids: PlaybackIdGenerator::new(),
        }
    }

    /// Play synthesized audio to a call
    ///
    /// Returns the playback id, or `None` if the call is unknown or the
    /// playback could not be dispatched. A `None` leaves no gating token and
    /// no playback registered.
    pub async fn play_audio(&self, call_id: &CallId, audio: &[u8], kind: PlaybackKind) -> Option<PlaybackId> {
        let Some(session) = self.store.get_by_call_id(call_id).await else {
            debug!(call_id = %call_id, "Playback requested for unknown call");
            return None;
        };

        let playback_id = self.ids.next(&kind, call_id);
        let audio_file = match self.write_audio(&playback_id, audio).await {
            Ok(path) => path,
            Err(e) => {
                warn!(call_id = %call_id, playback_id = %playback_id, error = %e, "Failed to write playback audio");
                return None;
            }
        };

        if self.gating.gate(call_id, &playback_id).await.is_none() {
            debug!(call_id = %call_id, playback_id = %playback_id, "Call ended before playback could be gated");
            remove_audio_file(&audio_file).await;
            return None;
        }

        let bridge_id = session.bridge_id.clone().filter(|_| self.config.use_bridge_media);
        let playback = PlaybackRef {
            playback_id: playback_id.clone(),
            call_id: call_id.clone(),
            channel_id: session.playback_channel().to_string(),
            bridge_id: bridge_id.clone(),
            media_ref: media_ref(&audio_file),
            audio_file: Some(audio_file.clone()),
        };
        // Registered before dispatch so a fast PlaybackFinished finds it
        if !self.store.add_playback(playback.clone()).await {
            debug!(call_id = %call_id, playback_id = %playback_id, "Call ended before playback could be registered");
            self.gating.ungate(call_id, &playback_id, REASON_DISPATCH_FAILED).await;
            remove_audio_file(&audio_file).await;
            return None;
        }

        let dispatched = match &bridge_id {
            Some(bridge_id) => {
                self.bridge
                    .play_media_with_id(bridge_id, &playback.media_ref, &playback_id)
                    .await
            }
            None => self.bridge.play_via_bridge(&playback.channel_id, &audio_file).await,
        };

        match dispatched {
            Ok(true) => {
                info!(
                    call_id = %call_id,
                    playback_id = %playback_id,
                    kind = kind.as_str(),
                    bytes = audio.len(),
                    "Playback dispatched"
                );
                Some(playback_id)
            }
            outcome => {
                match outcome {
                    Err(e) => warn!(call_id = %call_id, playback_id = %playback_id, error = %e, "Bridge playback failed"),
                    _ => warn!(call_id = %call_id, playback_id = %playback_id, "Bridge rejected playback"),
                }
                self.store.pop_playback(&playback_id).await;
                self.gating.ungate(call_id, &playback_id, REASON_DISPATCH_FAILED).await;
                remove_audio_file(&audio_file).await;
                None
            }
        }
    }

    /// Handle a finished playback; false if the id is unknown
    pub async fn on_playback_finished(&self, playback_id: &PlaybackId) -> bool {
        self.finish(playback_id).await.is_some()
    }

    /// Handle a finished playback and report what it released
    pub async fn finish(&self, playback_id: &PlaybackId) -> Option<FinishedPlayback> {
        let Some(playback) = self.store.pop_playback(playback_id).await else {
            warn!(playback_id = %playback_id, "PlaybackFinished for unknown playback id");
            return None;
        };

        let gating = self
            .gating
            .ungate(&playback.call_id, playback_id, REASON_FINISHED)
            .await;
        debug!(
            call_id = %playback.call_id,
            playback_id = %playback_id,
            remaining = gating.map(|g| g.active_count),
            "Playback finished"
        );

        if let Some(path) = playback.audio_file.clone() {
            self.schedule_file_cleanup(path);
        }
        Some(FinishedPlayback { playback, gating })
    }

    /// Drop every outstanding playback of a call that is going away
    pub async fn discard_call_playbacks(&self, call_id: &CallId) -> usize {
        let playbacks = self.store.drain_playbacks_for_call(call_id).await;
        for playback in &playbacks {
            if let Some(path) = playback.audio_file.clone() {
                self.schedule_file_cleanup(path);
            }
        }
        if !playbacks.is_empty() {
            debug!(call_id = %call_id, count = playbacks.len(), "Discarded outstanding playbacks");
        }
        playbacks.len()
    }

    fn schedule_file_cleanup(&self, path: PathBuf) {
        let delay = self.config.cleanup_delay();
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            remove_audio_file(&path).await;
        });
    }

    async fn write_audio(&self, playback_id: &PlaybackId, audio: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.media_dir).await?;
        let path = self
            .config
            .media_dir
            .join(format!("{}.{}", file_stem(playback_id), self.config.file_extension));
        tokio::fs::write(&path, audio).await?;
        Ok(path)
    }
}

/// File-system safe stem for a playback id
fn file_stem(playback_id: &PlaybackId) -> String {
    playback_id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Bridge media reference for a file (`sound:` URIs omit the extension)
fn media_ref(path: &Path) -> String {
    format!("sound:{}", path.with_extension("").display())
}

async fn remove_audio_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed playback audio"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove playback audio"),
    }
}
