//! Telephony bridge collaborator
//!
//! The bridge layer itself lives outside this crate. It is reached through
//! [`BridgeClient`] for playback commands and reports back with
//! [`BridgeEvent`]s that the engine routes into the playback manager and the
//! session store.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::session::PlaybackId;

/// Playback commands understood by the telephony bridge
///
/// `Ok(false)` and `Err(_)` both mean the command was not accepted.
#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// Play a file on a single channel
    async fn play_via_bridge(&self, channel_id: &str, file_path: &Path) -> Result<bool>;

    /// Play a media reference on a bridge, tagged with our playback id
    async fn play_media_with_id(&self, bridge_id: &str, media_ref: &str, playback_id: &PlaybackId) -> Result<bool>;
}

/// Events delivered by the telephony bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A playback started by us has finished (or was stopped)
    PlaybackFinished { playback_id: PlaybackId },
    /// A channel was hung up or otherwise destroyed
    ChannelDestroyed { channel_id: String },
}
