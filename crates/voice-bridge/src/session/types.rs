//! Call session and playback records

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical call identifier
///
/// Always equal to the caller's primary channel id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Playback identifier, formatted `kind:call_id:suffix`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaybackId(pub String);

impl PlaybackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PlaybackId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Conversation state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    /// Agent greeting is being played
    Greeting,
    /// Waiting for the caller to speak
    Listening,
    /// Caller turn is being processed by the AI pipeline
    Processing,
}

impl ConversationState {
    pub const ALL: [ConversationState; 3] = [
        ConversationState::Greeting,
        ConversationState::Listening,
        ConversationState::Processing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Greeting => "greeting",
            ConversationState::Listening => "listening",
            ConversationState::Processing => "processing",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown conversation state name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownConversationState(pub String);

impl fmt::Display for UnknownConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown conversation state: {}", self.0)
    }
}

impl std::error::Error for UnknownConversationState {}

impl FromStr for ConversationState {
    type Err = UnknownConversationState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greeting" => Ok(ConversationState::Greeting),
            "listening" => Ok(ConversationState::Listening),
            "processing" => Ok(ConversationState::Processing),
            other => Err(UnknownConversationState(other.to_string())),
        }
    }
}

/// Lifecycle status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Channel exists, not yet bridged to a provider
    Ringing,
    /// Call is connected to the AI pipeline
    Connected,
    /// Call is being torn down
    Ending,
}

/// Role of a secondary channel attached to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// Local channel used for bridge-side playback
    Local,
    /// External media channel carrying raw audio to the provider
    ExternalMedia,
    /// Transport-specific channel (e.g. a websocket or RTP leg)
    Transport,
}

/// Metadata attached to calls placed by an outbound campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCallInfo {
    pub campaign_id: String,
    pub lead_id: Option<String>,
    pub attempt: u32,
}

/// Per-call scratch area used while scoring caller audio
///
/// Reset at every gating start and end so audio buffered before the agent
/// spoke never leaks into decisions made after it.
#[derive(Debug, Clone, Default)]
pub struct VadScratch {
    /// Caller audio buffered since the last reset (PCM16 LE)
    pub pending_audio: VecDeque<u8>,
    /// Frames scored since the last reset
    pub frames_seen: u64,
    /// Speech frames since the last reset
    pub speech_frames: u64,
    /// Consecutive silent frames at the tail of `pending_audio`
    pub trailing_silence: u32,
    pub last_speech_at: Option<DateTime<Utc>>,
}

impl VadScratch {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Append caller audio, dropping the oldest whole samples beyond `max_bytes`
    pub fn push_audio(&mut self, pcm: &[u8], max_bytes: usize) {
        self.pending_audio.extend(pcm);
        if self.pending_audio.len() > max_bytes {
            let excess = (self.pending_audio.len() - max_bytes + 1) & !1;
            self.pending_audio.drain(..excess);
        }
    }

    /// Hand out the buffered audio, leaving the counters untouched
    pub fn take_pending_audio(&mut self) -> Vec<u8> {
        Vec::from(std::mem::take(&mut self.pending_audio))
    }
}

/// Full state of one live call
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Canonical id (caller's primary channel id)
    pub call_id: CallId,
    /// Secondary channel ids by role
    pub channels: HashMap<ChannelRole, String>,
    pub bridge_id: Option<String>,
    pub provider: Option<String>,
    pub conversation_state: ConversationState,
    pub status: CallStatus,
    /// Outstanding TTS gating tokens (playback ids)
    pub tts_tokens: BTreeSet<PlaybackId>,
    /// Mirrors `tts_tokens.len()`
    pub active_count: usize,
    /// Mirrors `active_count > 0`
    pub tts_playing: bool,
    pub audio_capture_enabled: bool,
    /// Incremented on every 0 -> 1 gating transition
    pub gating_generation: u64,
    pub tts_started_at: Option<DateTime<Utc>>,
    pub tts_ended_at: Option<DateTime<Utc>>,
    vad_scratch: Option<VadScratch>,
    pub created_at: DateTime<Utc>,
    pub outbound: Option<OutboundCallInfo>,
}

impl CallSession {
    /// Create a new session in the greeting state with capture enabled
    pub fn new(call_id: impl Into<CallId>) -> Self {
        Self {
            call_id: call_id.into(),
            channels: HashMap::new(),
            bridge_id: None,
            provider: None,
            conversation_state: ConversationState::Greeting,
            status: CallStatus::Ringing,
            tts_tokens: BTreeSet::new(),
            active_count: 0,
            tts_playing: false,
            audio_capture_enabled: true,
            gating_generation: 0,
            tts_started_at: None,
            tts_ended_at: None,
            vad_scratch: None,
            created_at: Utc::now(),
            outbound: None,
        }
    }

    pub fn with_channel(mut self, role: ChannelRole, channel_id: impl Into<String>) -> Self {
        self.channels.insert(role, channel_id.into());
        self
    }

    pub fn with_bridge_id(mut self, bridge_id: impl Into<String>) -> Self {
        self.bridge_id = Some(bridge_id.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_status(mut self, status: CallStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_outbound(mut self, outbound: OutboundCallInfo) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Every channel id that resolves to this session, canonical first
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids = vec![self.call_id.0.clone()];
        let mut secondary: Vec<_> = self.channels.iter().collect();
        secondary.sort_by_key(|(role, _)| **role);
        ids.extend(
            secondary
                .into_iter()
                .map(|(_, id)| id.clone())
                .filter(|id| id != &self.call_id.0),
        );
        ids
    }

    /// Channel used for playback when no bridge is involved
    pub fn playback_channel(&self) -> &str {
        self.channels
            .get(&ChannelRole::Local)
            .map(String::as_str)
            .unwrap_or(self.call_id.as_str())
    }

    /// Scratch area, created on first use
    pub fn vad_scratch_mut(&mut self) -> &mut VadScratch {
        self.vad_scratch.get_or_insert_with(VadScratch::default)
    }

    pub fn vad_scratch(&self) -> Option<&VadScratch> {
        self.vad_scratch.as_ref()
    }

    /// Clear the scratch area if it has been created
    pub fn reset_vad_scratch(&mut self) {
        if let Some(scratch) = self.vad_scratch.as_mut() {
            scratch.reset();
        }
    }

    /// Take identity and routing fields from a newer description of the call
    ///
    /// Channels, bridge id, provider, status and outbound metadata are merged.
    /// Gating, conversation state, the scratch area and the creation time are
    /// kept. Returns true if the call gained a provider it did not have.
    pub(crate) fn merge_identity(&mut self, newer: CallSession) -> bool {
        self.channels.extend(newer.channels);
        if newer.bridge_id.is_some() {
            self.bridge_id = newer.bridge_id;
        }
        let provider_added = self.provider.is_none() && newer.provider.is_some();
        if newer.provider.is_some() {
            self.provider = newer.provider;
        }
        if newer.outbound.is_some() {
            self.outbound = newer.outbound;
        }
        if self.status != CallStatus::Ending {
            self.status = newer.status;
        }
        provider_added
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub(crate) fn sync_gating_counters(&mut self) {
        self.active_count = self.tts_tokens.len();
        self.tts_playing = self.active_count > 0;
    }
}

/// An outstanding playback dispatched to the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRef {
    pub playback_id: PlaybackId,
    pub call_id: CallId,
    pub channel_id: String,
    pub bridge_id: Option<String>,
    /// Media reference handed to the bridge (e.g. `sound:/path/without/ext`)
    pub media_ref: String,
    /// Transient audio file backing the playback
    pub audio_file: Option<std::path::PathBuf>,
}
