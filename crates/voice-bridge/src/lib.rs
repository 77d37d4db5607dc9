//! # Voice-Bridge: Real-Time Call Sessions for AI Voice Agents
//!
//! This library holds the per-call state machine that sits between a
//! telephony bridge and speech pipelines (STT, LLM, TTS). It decides when the
//! caller's audio is captured, when it is suppressed because the agent is
//! speaking, and when the caller is trying to barge in.
//!
//! ## Components
//!
//! - **SessionStore**: the only authority on which calls and playbacks exist,
//!   with refcounted TTS gating serialized behind one store-wide lock
//! - **PlaybackManager**: playback ids, gate-before-dispatch ordering and
//!   compensating rollback when the bridge rejects a playback
//! - **ConversationCoordinator**: conversation state, barge-in accounting and
//!   the capture fallback timer
//! - **VadManager**: energy + classifier voice activity detection with frame
//!   smoothing and per-call adaptive thresholds
//! - **VoiceBridgeEngine**: wires everything from one configuration and
//!   routes bridge events and caller audio
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use rvoip_voice_bridge::prelude::*;
//!
//! struct Bridge;
//!
//! #[async_trait]
//! impl BridgeClient for Bridge {
//!     async fn play_via_bridge(&self, _channel_id: &str, _file: &Path) -> Result<bool> {
//!         Ok(true)
//!     }
//!
//!     async fn play_media_with_id(&self, _bridge_id: &str, _media: &str, _id: &PlaybackId) -> Result<bool> {
//!         Ok(true)
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let engine = VoiceBridgeEngine::new(VoiceBridgeConfig::default(), Arc::new(Bridge))?;
//! engine.start_call("chan-1", Some("openai")).await;
//!
//! let call = CallId::from("chan-1");
//! let playback = engine.speak(&call, &[0u8; 320], PlaybackKind::Greeting).await;
//!
//! // Caller audio is suppressed until the bridge reports the playback finished
//! let decision = engine.process_inbound_audio(&call, &[0u8; 320], 8000).await;
//! assert_eq!(decision, InboundAudioDecision::Suppress);
//!
//! if let Some(playback_id) = playback {
//!     engine.handle_bridge_event(BridgeEvent::PlaybackFinished { playback_id }).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod playback;
pub mod session;
pub mod vad;

pub use bridge::{BridgeClient, BridgeEvent};
pub use config::VoiceBridgeConfig;
pub use coordinator::{ConversationCoordinator, ConversationSummary};
pub use engine::{EngineSummary, InboundAudioDecision, VoiceBridgeEngine};
pub use error::{Result, VoiceBridgeError};
pub use playback::{PlaybackKind, PlaybackManager};
pub use session::{CallId, CallSession, ConversationState, PlaybackId, SessionStore};
pub use vad::{VadConfig, VadManager, VadResult};

/// Version information for the voice bridge library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    pub use crate::bridge::{BridgeClient, BridgeEvent};
    pub use crate::config::VoiceBridgeConfig;
    pub use crate::coordinator::ConversationCoordinator;
    pub use crate::engine::{InboundAudioDecision, VoiceBridgeEngine};
    pub use crate::error::{Result, VoiceBridgeError};
    pub use crate::metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
    pub use crate::playback::{PlaybackKind, PlaybackManager};
    pub use crate::session::{
        CallId, CallSession, CallStatus, ChannelRole, ConversationState, PlaybackId, SessionStore,
    };
    pub use crate::vad::{VadConfig, VadManager, VadResult};
}
