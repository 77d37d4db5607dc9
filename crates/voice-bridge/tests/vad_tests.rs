//! Voice activity detection integration tests

mod common;

use std::sync::Arc;

use common::{loud_frame, silent_frame};
use rvoip_voice_bridge::metrics::{self, InMemoryMetrics, NoopMetrics};
use rvoip_voice_bridge::session::CallId;
use rvoip_voice_bridge::vad::{CallEnvironment, VadConfig, VadManager};

/// Constant-valued frame with the given normalized RMS energy
fn hum(energy: f32) -> Vec<i16> {
    vec![(energy * 32768.0).round() as i16; 160]
}

fn energy_only(config: VadConfig) -> VadManager {
    VadManager::with_components(config, None, Arc::new(NoopMetrics)).unwrap()
}

#[test]
fn test_speech_needs_consecutive_frames() {
    let config = VadConfig {
        min_speech_frames: 2,
        ..VadConfig::default()
    };
    let vad = VadManager::new(config).unwrap();
    let call = CallId::from("c1");

    for _ in 0..20 {
        assert!(!vad.process_frame(&call, &silent_frame(), 8000).is_speech);
    }

    let first = vad.process_frame(&call, &loud_frame(), 8000);
    assert!(first.frame_speech);
    assert!(!first.is_speech);

    let second = vad.process_frame(&call, &loud_frame(), 8000);
    assert!(second.is_speech);
    assert!(second.classifier_used);
    assert!(second.confidence >= 0.9);
}

#[test]
fn test_single_silent_frame_does_not_end_speech() {
    let config = VadConfig {
        min_speech_frames: 1,
        max_silence_frames: 3,
        ..VadConfig::default()
    };
    let vad = VadManager::new(config).unwrap();
    let call = CallId::from("c1");

    assert!(vad.process_frame(&call, &loud_frame(), 8000).is_speech);
    assert!(vad.process_frame(&call, &silent_frame(), 8000).is_speech);
    assert!(vad.process_frame(&call, &silent_frame(), 8000).is_speech);
    assert!(vad.process_frame(&call, &loud_frame(), 8000).is_speech);

    for _ in 0..2 {
        assert!(vad.process_frame(&call, &silent_frame(), 8000).is_speech);
    }
    assert!(!vad.process_frame(&call, &silent_frame(), 8000).is_speech);

    // Leaving the speaking state records one turn and one utterance
    assert_eq!(vad.analyzer().speech_events(&call).len(), 1);
    assert_eq!(vad.call_context(&call).unwrap().turns, 1);
}

#[test]
fn test_calls_do_not_share_state() {
    let config = VadConfig {
        classifier_enabled: false,
        min_speech_frames: 1,
        adaptive_min_samples: 5,
        threshold_blend: 0.5,
        ..VadConfig::default()
    };
    let vad = energy_only(config);
    let (a, b) = (CallId::from("A"), CallId::from("B"));

    // A sits in steady background noise that pushes its threshold up
    for _ in 0..60 {
        assert!(!vad.process_frame(&a, &hum(0.015), 8000).frame_speech);
    }
    let a_threshold = vad.call_status(&a).unwrap().threshold;
    assert!(a_threshold > 0.035, "A threshold did not adapt: {}", a_threshold);

    // B starts fresh at the base threshold
    let b_result = vad.process_frame(&b, &hum(0.03), 8000);
    assert!((b_result.threshold - 0.02).abs() < 1e-6);
    assert!(b_result.is_speech);

    // The same frame on A stays below A's raised threshold
    assert!(!vad.process_frame(&a, &hum(0.03), 8000).frame_speech);
    assert!(vad.is_speaking(&b));
    assert!(!vad.is_speaking(&a));

    vad.reset_call(&a);
    assert!(vad.call_status(&a).is_none());
    assert!(vad.call_status(&b).is_some());
    assert!(vad.is_speaking(&b));

    // A comes back with nothing carried over
    let fresh = vad.process_frame(&a, &silent_frame(), 8000);
    assert!((fresh.threshold - 0.02).abs() < 1e-6);
}

#[test]
fn test_interleaved_calls_stay_isolated() {
    let config = VadConfig {
        min_speech_frames: 3,
        ..VadConfig::default()
    };
    let vad = VadManager::new(config).unwrap();
    let (a, b) = (CallId::from("A"), CallId::from("B"));

    for _ in 0..3 {
        vad.process_frame(&a, &loud_frame(), 8000);
        vad.process_frame(&b, &silent_frame(), 8000);
    }
    assert!(vad.is_speaking(&a));
    assert!(!vad.is_speaking(&b));
    assert_eq!(vad.call_status(&b).unwrap().speech_frames, 0);
    assert_eq!(vad.tracked_calls(), 2);
}

#[test]
fn test_environment_adaptation_raises_base_in_noise() {
    let config = VadConfig {
        adaptation_interval_frames: 50,
        ..VadConfig::default()
    };
    let vad = VadManager::new(config).unwrap();
    let call = CallId::from("c1");

    // Tonal hum: loud but rejected by the classifier
    for _ in 0..50 {
        assert!(!vad.process_frame(&call, &hum(0.06), 8000).frame_speech);
    }

    let status = vad.call_status(&call).unwrap();
    assert_eq!(status.environment, CallEnvironment::Noisy);
    // 0.02 blended 30% toward 0.02 * 1.5
    assert!((status.base_threshold - 0.023).abs() < 1e-4);
}

#[test]
fn test_metrics_use_fleet_labels_only() {
    let sink = Arc::new(InMemoryMetrics::new());
    let vad = VadManager::with_components(VadConfig::default(), None, sink.clone()).unwrap();

    for i in 0..10 {
        let call = CallId::new(format!("call-{}", i));
        vad.process_frame(&call, &silent_frame(), 8000);
    }

    assert_eq!(sink.counter(metrics::VAD_FRAMES, &[("result", "silence")]), 10);
    assert_eq!(sink.observations(metrics::VAD_CONFIDENCE, &[]).len(), 10);
    assert!(sink.gauge(metrics::VAD_ADAPTIVE_THRESHOLD, &[]).is_some());
    assert_eq!(sink.label_values(metrics::VAD_FRAMES, "result"), vec!["silence".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_environment_adaptation_waits_for_cooldown() {
    let config = VadConfig {
        adaptation_interval_frames: 10,
        adaptation_cooldown_ms: 1000,
        ..VadConfig::default()
    };
    let vad = VadManager::new(config).unwrap();
    let call = CallId::from("c1");
    let feed = |frames: usize| {
        for _ in 0..frames {
            vad.process_frame(&call, &hum(0.06), 8000);
        }
    };
    let base = || vad.call_status(&call).unwrap().base_threshold;

    feed(10);
    assert_eq!(vad.call_status(&call).unwrap().environment, CallEnvironment::Noisy);
    assert!((base() - 0.023).abs() < 1e-4);

    // Second interval falls inside the cooldown
    feed(10);
    assert!((base() - 0.023).abs() < 1e-4);

    tokio::time::advance(std::time::Duration::from_millis(1001)).await;
    feed(10);
    // 0.023 blended 30% toward 0.03
    assert!((base() - 0.0251).abs() < 1e-4);
}
