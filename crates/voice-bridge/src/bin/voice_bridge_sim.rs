//! Voice bridge simulator
//!
//! Drives a few simulated calls through the engine against an in-process
//! bridge: a greeting is played, the caller barges in while it plays, the
//! bridge reports the playback finished (or loses the event, leaving it to
//! the capture fallback) and the caller then speaks with capture enabled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use rvoip_voice_bridge::logging::setup_logging;
use rvoip_voice_bridge::metrics::{self, InMemoryMetrics};
use rvoip_voice_bridge::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate calls through the voice bridge engine")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of concurrent calls to simulate
    #[arg(short = 'n', long, default_value = "3")]
    calls: usize,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Playback duration reported by the simulated bridge (milliseconds)
    #[arg(long, default_value = "400")]
    playback_ms: u64,

    /// Drop every PlaybackFinished event so the capture fallback has to recover
    #[arg(long)]
    lose_events: bool,
}

/// Bridge that accepts every playback and reports it finished later
struct SimulatedBridge {
    events: mpsc::UnboundedSender<BridgeEvent>,
    playback_time: Duration,
    lose_events: bool,
}

impl SimulatedBridge {
    fn finish_later(&self, playback_id: PlaybackId) {
        if self.lose_events {
            warn!(playback_id = %playback_id, "Simulated bridge dropping PlaybackFinished");
            return;
        }
        let events = self.events.clone();
        let delay = self.playback_time;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(BridgeEvent::PlaybackFinished { playback_id });
        });
    }
}

#[async_trait]
impl BridgeClient for SimulatedBridge {
    async fn play_via_bridge(&self, channel_id: &str, file_path: &Path) -> Result<bool, VoiceBridgeError> {
        info!(channel_id, file = %file_path.display(), "Bridge playing file");
        // Without a bridge id the playback id is the file stem
        let stem = file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| VoiceBridgeError::bridge("playback file has no stem"))?;
        if let Some(playback_id) = stem_to_playback_id(stem) {
            self.finish_later(playback_id);
        }
        Ok(true)
    }

    async fn play_media_with_id(
        &self,
        bridge_id: &str,
        media_ref: &str,
        playback_id: &PlaybackId,
    ) -> Result<bool, VoiceBridgeError> {
        info!(bridge_id, media_ref, playback_id = %playback_id, "Bridge playing media");
        self.finish_later(playback_id.clone());
        Ok(true)
    }
}

/// Recover `kind:call:suffix` from a file stem written as `kind_call_suffix`
fn stem_to_playback_id(stem: &str) -> Option<PlaybackId> {
    let (kind, rest) = stem.split_once('_')?;
    let (call, suffix) = rest.rsplit_once('_')?;
    Some(PlaybackId::new(format!("{}:{}:{}", kind, call, suffix)))
}

/// A 20 ms frame of 8 kHz PCM16 LE: a voiced tone or silence
fn frame(voiced: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(320);
    for i in 0..160 {
        let sample = if voiced {
            let t = i as f32 / 8000.0;
            (9000.0 * (2.0 * std::f32::consts::PI * 300.0 * t).sin()) as i16
        } else {
            0
        };
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

async fn simulate_call(engine: Arc<VoiceBridgeEngine>, index: usize) -> Result<()> {
    let channel = format!("chan-{}", index);
    let session = CallSession::new(channel.as_str())
        .with_status(CallStatus::Connected)
        .with_provider("simulated")
        .with_bridge_id(format!("bridge-{}", index))
        .with_channel(ChannelRole::ExternalMedia, format!("ext-{}", index));
    engine.start_call_with(session).await;
    let call = CallId::from(channel.as_str());

    let greeting: Vec<u8> = (0..25).flat_map(|_| frame(true).to_vec()).collect();
    if engine.speak(&call, &greeting, PlaybackKind::Greeting).await.is_none() {
        warn!(call_id = %call, "Greeting could not be played");
    }

    let mut barge_ins = 0;
    let mut forwarded = 0;
    for _ in 0..150 {
        match engine.process_inbound_audio(&call, &frame(true), 8000).await {
            InboundAudioDecision::BargeIn => barge_ins += 1,
            InboundAudioDecision::Forward => forwarded += 1,
            InboundAudioDecision::Suppress => {}
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine.coordinator().update_conversation_state(&call, "listening").await;

    info!(call_id = %call, barge_ins, forwarded, "Caller audio processed");
    engine
        .handle_bridge_event(BridgeEvent::ChannelDestroyed {
            channel_id: format!("ext-{}", index),
        })
        .await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => VoiceBridgeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VoiceBridgeConfig::default(),
    };
    if args.lose_events {
        config.coordinator.capture_fallback_ms = config.coordinator.capture_fallback_ms.min(1000);
    }

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    setup_logging(&config.logging)?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let bridge = Arc::new(SimulatedBridge {
        events: events_tx,
        playback_time: Duration::from_millis(args.playback_ms),
        lose_events: args.lose_events,
    });
    let sink = Arc::new(InMemoryMetrics::new());
    let engine = Arc::new(VoiceBridgeEngine::with_metrics(config, bridge, sink.clone())?);
    let cleanup = engine.spawn_cleanup_task();

    let router = {
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                engine.handle_bridge_event(event).await;
            }
        })
    };

    let calls: Vec<_> = (0..args.calls)
        .map(|i| tokio::spawn(simulate_call(engine.clone(), i)))
        .collect();
    for call in calls {
        call.await.context("call task failed")??;
    }

    let summary = engine.summary().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(
        barge_ins = sink.counter_total(metrics::BARGE_IN_ATTEMPTS),
        fallbacks = sink.counter_total(metrics::CAPTURE_FALLBACKS),
        vad_frames = sink.counter_total(metrics::VAD_FRAMES),
        "Simulation finished"
    );

    cleanup.abort();
    router.abort();
    engine.shutdown();
    Ok(())
}
