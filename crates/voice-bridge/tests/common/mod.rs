//! Shared helpers for voice bridge integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use rvoip_voice_bridge::config::VoiceBridgeConfig;
use rvoip_voice_bridge::{BridgeClient, PlaybackId, Result, SessionStore, VoiceBridgeError};

/// How the mock bridge answers playback commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeBehavior {
    Accept,
    Reject,
    Fail,
}

/// A playback command seen by the mock bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    File {
        channel_id: String,
        file: PathBuf,
        existed: bool,
        gated: Option<bool>,
    },
    Media {
        bridge_id: String,
        media_ref: String,
        playback_id: PlaybackId,
        gated: Option<bool>,
    },
}

impl BridgeCall {
    /// Whether the call was gated when the command arrived (None if not observed)
    pub fn gated(&self) -> Option<bool> {
        match self {
            BridgeCall::File { gated, .. } | BridgeCall::Media { gated, .. } => *gated,
        }
    }
}

/// Bridge double that records every command
#[derive(Debug)]
pub struct MockBridge {
    behavior: Mutex<BridgeBehavior>,
    calls: Mutex<Vec<BridgeCall>>,
    store: Mutex<Option<Arc<SessionStore>>>,
}

impl MockBridge {
    pub fn new(behavior: BridgeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            store: Mutex::new(None),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(BridgeBehavior::Accept)
    }

    pub fn set_behavior(&self, behavior: BridgeBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Record the gating state of each call as commands arrive
    pub fn observe(&self, store: Arc<SessionStore>) {
        *self.store.lock() = Some(store);
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().clone()
    }

    fn answer(&self) -> Result<bool> {
        match *self.behavior.lock() {
            BridgeBehavior::Accept => Ok(true),
            BridgeBehavior::Reject => Ok(false),
            BridgeBehavior::Fail => Err(VoiceBridgeError::bridge("simulated bridge outage")),
        }
    }
}

#[async_trait]
impl BridgeClient for MockBridge {
    async fn play_via_bridge(&self, channel_id: &str, file_path: &Path) -> Result<bool> {
        let store = self.store.lock().clone();
        let gated = match store {
            Some(store) => Some(
                store
                    .get_by_channel_id(channel_id)
                    .await
                    .is_some_and(|s| s.tts_playing && !s.audio_capture_enabled),
            ),
            None => None,
        };
        self.calls.lock().push(BridgeCall::File {
            channel_id: channel_id.to_string(),
            file: file_path.to_path_buf(),
            existed: file_path.exists(),
            gated,
        });
        self.answer()
    }

    async fn play_media_with_id(&self, bridge_id: &str, media_ref: &str, playback_id: &PlaybackId) -> Result<bool> {
        let store = self.store.lock().clone();
        let gated = match store {
            Some(store) => match store.get_playback(playback_id).await {
                Some(playback) => Some(
                    store
                        .get_by_call_id(&playback.call_id)
                        .await
                        .is_some_and(|s| s.tts_tokens.contains(playback_id)),
                ),
                None => Some(false),
            },
            None => None,
        };
        self.calls.lock().push(BridgeCall::Media {
            bridge_id: bridge_id.to_string(),
            media_ref: media_ref.to_string(),
            playback_id: playback_id.clone(),
            gated,
        });
        self.answer()
    }
}

/// Configuration writing media into a fresh temporary directory
pub fn test_config() -> (VoiceBridgeConfig, TempDir) {
    let dir = tempfile::tempdir().expect("create media dir");
    let mut config = VoiceBridgeConfig::default();
    config.playback.media_dir = dir.path().to_path_buf();
    (config, dir)
}

/// One 20 ms frame of 8 kHz samples
pub fn silent_frame() -> Vec<i16> {
    vec![0; 160]
}

/// One 20 ms frame of an 8 kHz 300 Hz tone
pub fn loud_frame() -> Vec<i16> {
    (0..160)
        .map(|i| {
            let t = i as f32 / 8000.0;
            (12000.0 * (2.0 * std::f32::consts::PI * 300.0 * t).sin()) as i16
        })
        .collect()
}

pub fn pcm(samples: &[i16]) -> Vec<u8> {
    rvoip_voice_bridge::audio::samples_to_pcm16_le(samples)
}

pub fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
