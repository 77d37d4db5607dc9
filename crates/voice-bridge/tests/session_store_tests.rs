//! Session store integration tests
//!
//! Covers:
//! - Alias round-trips through upsert / lookup / remove
//! - Refcounted gating (overlapping playbacks, idempotent tokens)
//! - The gating counter invariant over random token sequences
//! - The two-phase expiry sweep

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rvoip_voice_bridge::session::{
    CallId, CallSession, CallStatus, ChannelRole, OutboundCallInfo, PlaybackId, SessionStore,
};

fn call(id: &str) -> CallId {
    CallId::from(id)
}

fn aliased_session(id: &str) -> CallSession {
    CallSession::new(id)
        .with_channel(ChannelRole::Local, format!("{}-local", id))
        .with_channel(ChannelRole::ExternalMedia, format!("{}-ext", id))
        .with_channel(ChannelRole::Transport, format!("{}-sip", id))
        .with_bridge_id(format!("{}-bridge", id))
}

#[tokio::test]
async fn test_aliases_round_trip() {
    let store = SessionStore::new();
    store.upsert(aliased_session("c1")).await;
    store.upsert(aliased_session("c2")).await;

    let session = store.get_by_call_id(&call("c1")).await.expect("c1 stored");
    for channel_id in session.channel_ids() {
        let found = store.get_by_channel_id(&channel_id).await.expect("alias resolves");
        assert_eq!(found.call_id, call("c1"), "alias {} resolved to the wrong call", channel_id);
    }

    let removed = store.remove(&call("c1")).await.expect("c1 removed");
    assert_eq!(removed.call_id, call("c1"));
    assert!(store.get_by_call_id(&call("c1")).await.is_none());
    for channel_id in removed.channel_ids() {
        assert!(store.get_by_channel_id(&channel_id).await.is_none());
    }

    // The other call's aliases are untouched
    assert!(store.get_by_channel_id("c2-ext").await.is_some());
    assert!(store.remove(&call("c1")).await.is_none());
}

#[tokio::test]
async fn test_overlapping_playbacks_keep_call_gated() {
    let store = SessionStore::new();
    store.upsert(CallSession::new("c1")).await;
    let (p1, p2) = (PlaybackId::from("p1"), PlaybackId::from("p2"));

    assert!(store.set_gating_token(&call("c1"), &p1).await);
    assert!(store.set_gating_token(&call("c1"), &p2).await);
    assert!(store.clear_gating_token(&call("c1"), &p1).await);

    let session = store.get_by_call_id(&call("c1")).await.unwrap();
    assert!(session.tts_playing);
    assert!(!session.audio_capture_enabled);
    assert_eq!(session.active_count, 1);

    assert!(store.clear_gating_token(&call("c1"), &p2).await);
    let session = store.get_by_call_id(&call("c1")).await.unwrap();
    assert!(!session.tts_playing);
    assert!(session.audio_capture_enabled);
    assert_eq!(session.active_count, 0);
    assert!(session.tts_ended_at.is_some());
}

#[tokio::test]
async fn test_repeated_token_does_not_restart_episode() {
    let store = SessionStore::new();
    store.upsert(CallSession::new("c1")).await;
    let p1 = PlaybackId::from("p1");

    store.set_gating_token(&call("c1"), &p1).await;
    let first = store.get_by_call_id(&call("c1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    store.set_gating_token(&call("c1"), &p1).await;
    let second = store.get_by_call_id(&call("c1")).await.unwrap();

    assert_eq!(second.active_count, 1);
    assert_eq!(second.tts_started_at, first.tts_started_at);
    assert_eq!(second.gating_generation, first.gating_generation);
}

#[tokio::test]
async fn test_unknown_call_is_not_an_error() {
    let store = SessionStore::new();
    let p1 = PlaybackId::from("p1");

    assert!(!store.set_gating_token(&call("ghost"), &p1).await);
    assert!(!store.clear_gating_token(&call("ghost"), &p1).await);
    assert!(!store.force_enable_capture(&call("ghost"), None).await);
    assert!(store.get_by_channel_id("ghost").await.is_none());
    assert!(store.pop_playback(&p1).await.is_none());
}

#[tokio::test]
async fn test_cleanup_expired_removes_everything_at_zero_age() {
    let store = SessionStore::new();
    for i in 0..5 {
        store
            .upsert(aliased_session(&format!("c{}", i)).with_status(CallStatus::Connected))
            .await;
    }
    assert_eq!(store.active_calls().await.len(), 5);

    assert_eq!(store.cleanup_expired(Duration::ZERO).await, 5);
    assert!(store.active_calls().await.is_empty());
    assert_eq!(store.session_count().await, 0);
    assert!(store.get_by_channel_id("c3-local").await.is_none());

    let stats = store.stats().await;
    assert_eq!(stats.total_created, 5);
    assert_eq!(stats.total_removed, 5);
}

#[tokio::test]
async fn test_stats_and_outbound_counts() {
    let store = SessionStore::new();
    let outbound = |campaign: &str, lead: &str| OutboundCallInfo {
        campaign_id: campaign.to_string(),
        lead_id: Some(lead.to_string()),
        attempt: 1,
    };
    store.upsert(CallSession::new("in-1")).await;
    store
        .upsert(CallSession::new("out-1").with_outbound(outbound("spring", "l1")))
        .await;
    store
        .upsert(CallSession::new("out-2").with_outbound(outbound("spring", "l2")))
        .await;
    store
        .upsert(CallSession::new("out-3").with_outbound(outbound("renewals", "l3")))
        .await;
    store.set_gating_token(&call("out-1"), &PlaybackId::from("p")).await;
    store.register_provider_session().await;

    let counts = store.outbound_call_counts().await;
    assert_eq!(counts.get("spring"), Some(&2));
    assert_eq!(counts.get("renewals"), Some(&1));

    let stats = store.stats().await;
    assert_eq!(stats.total_sessions, 4);
    assert_eq!(stats.outbound_calls, 3);
    assert_eq!(stats.tts_playing, 1);
    assert_eq!(stats.capture_disabled, 1);
    assert_eq!(stats.provider_sessions, 1);
    assert_eq!(stats.by_state.get("greeting"), Some(&4));
    assert_eq!(stats.by_state.get("processing"), Some(&0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gating_is_serialized() {
    let store = Arc::new(SessionStore::new());
    store.upsert(CallSession::new("c1")).await;

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let token = PlaybackId::new(format!("p{}", i));
                store.set_gating_token(&CallId::from("c1"), &token).await;
                tokio::task::yield_now().await;
                store.clear_gating_token(&CallId::from("c1"), &token).await;
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let session = store.get_by_call_id(&call("c1")).await.unwrap();
    assert_eq!(session.active_count, 0);
    assert!(!session.tts_playing);
    assert!(session.audio_capture_enabled);
}

#[derive(Debug, Clone)]
enum TokenOp {
    Set(u8),
    Clear(u8),
}

fn token_op() -> impl Strategy<Value = TokenOp> {
    prop_oneof![(0u8..6).prop_map(TokenOp::Set), (0u8..6).prop_map(TokenOp::Clear)]
}

proptest! {
    #[test]
    fn prop_gating_counters_track_token_set(ops in prop::collection::vec(token_op(), 0..64)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = SessionStore::new();
            store.upsert(CallSession::new("c1")).await;
            let id = call("c1");

            for op in ops {
                match op {
                    TokenOp::Set(n) => store.set_gating_token(&id, &PlaybackId::new(format!("p{}", n))).await,
                    TokenOp::Clear(n) => store.clear_gating_token(&id, &PlaybackId::new(format!("p{}", n))).await,
                };
                let session = store.get_by_call_id(&id).await.unwrap();
                prop_assert_eq!(session.active_count, session.tts_tokens.len());
                prop_assert_eq!(session.tts_playing, session.active_count > 0);
                prop_assert_eq!(session.audio_capture_enabled, session.active_count == 0);
            }
            Ok(())
        })?;
    }
}
