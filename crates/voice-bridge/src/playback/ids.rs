//! Playback identifiers

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::session::{CallId, PlaybackId};

/// What a playback is for, used as the id prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlaybackKind {
    Greeting,
    Response,
    Filler,
    Farewell,
    Custom(String),
}

impl PlaybackKind {
    pub fn as_str(&self) -> &str {
        match self {
            PlaybackKind::Greeting => "greeting",
            PlaybackKind::Response => "response",
            PlaybackKind::Filler => "filler",
            PlaybackKind::Farewell => "farewell",
            PlaybackKind::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for PlaybackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for PlaybackKind {
    fn from(kind: &str) -> Self {
        match kind {
            "greeting" => PlaybackKind::Greeting,
            "response" => PlaybackKind::Response,
            "filler" => PlaybackKind::Filler,
            "farewell" => PlaybackKind::Farewell,
            other => PlaybackKind::Custom(other.to_string()),
        }
    }
}

/// Generates `kind:callId:suffix` playback ids
///
/// The suffix is a microsecond timestamp taken from a monotonic clock anchored
/// at the wall clock when the generator was created. Two ids from one
/// generator never share a suffix, even within the same microsecond.
#[derive(Debug)]
pub struct PlaybackIdGenerator {
    anchor: Instant,
    epoch_micros: u64,
    last: AtomicU64,
}

impl PlaybackIdGenerator {
    pub fn new() -> Self {
        let epoch_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self {
            anchor: Instant::now(),
            epoch_micros,
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self, kind: &PlaybackKind, call_id: &CallId) -> PlaybackId {
        let now = self.epoch_micros + self.anchor.elapsed().as_micros() as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        let suffix = loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break candidate,
                Err(actual) => last = actual,
            }
        };
        PlaybackId::new(format!("{}:{}:{:x}", kind.as_str(), call_id, suffix))
    }
}

impl Default for PlaybackIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
