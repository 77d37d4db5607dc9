//! Call sessions and the store that owns them

pub mod store;
pub mod types;

pub use store::{CaptureState, GatingOutcome, SessionMerge, SessionStats, SessionStore};
pub use types::{
    CallId, CallSession, CallStatus, ChannelRole, ConversationState, OutboundCallInfo, PlaybackId,
    PlaybackRef, UnknownConversationState, VadScratch,
};
