//! Behavioural tests for the in-memory status store.

use std::{sync::Arc, time::Duration};

use postline_core::{
    storage::mock::MockStatusStore, Clock, CoreError, ExternalId, MailStatus, MetricsSnapshot,
    NewStatusTransition, StatusStore, TestClock,
};
use serde_json::json;

fn transition(id: &str, provider_status: &str) -> NewStatusTransition {
    NewStatusTransition {
        external_id: ExternalId::new(id),
        provider_status: provider_status.to_string(),
        status: postline_core::StatusTranslator::map(provider_status),
        tracking_number: None,
        raw_payload: json!({ "id": id, "status": provider_status }),
    }
}

fn store_at_bucket_start() -> (MockStatusStore, TestClock) {
    let clock = TestClock::new();
    clock.set_unix_seconds(1_700_000_040);
    let store = MockStatusStore::with_clock(Arc::new(clock.clone()));
    (store, clock)
}

#[tokio::test]
async fn recent_status_is_found_inside_window_only() {
    let (store, clock) = store_at_bucket_start();
    let id = ExternalId::new("ltr_1");

    store.apply_status_transition(transition("ltr_1", "mailed")).await.unwrap();

    let hit = store.find_recent_status(&id, "mailed", Duration::from_secs(60)).await.unwrap();
    assert!(hit.is_some());

    let other_status =
        store.find_recent_status(&id, "delivered", Duration::from_secs(60)).await.unwrap();
    assert!(other_status.is_none());

    clock.advance(Duration::from_secs(61));
    let expired = store.find_recent_status(&id, "mailed", Duration::from_secs(60)).await.unwrap();
    assert!(expired.is_none());
}

#[tokio::test]
async fn same_transition_in_same_bucket_conflicts() {
    let (store, _clock) = store_at_bucket_start();

    store.apply_status_transition(transition("ltr_2", "in_transit")).await.unwrap();
    let err = store.apply_status_transition(transition("ltr_2", "in_transit")).await.unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(store.history().await.len(), 1);
}

#[tokio::test]
async fn same_transition_in_later_bucket_is_recorded() {
    let (store, clock) = store_at_bucket_start();

    store.apply_status_transition(transition("ltr_3", "in_transit")).await.unwrap();
    clock.advance(Duration::from_secs(120));
    store.apply_status_transition(transition("ltr_3", "in_transit")).await.unwrap();

    assert_eq!(store.history_for(&ExternalId::new("ltr_3")).await.len(), 2);
}

#[tokio::test]
async fn transition_updates_registered_mail_piece() {
    let (store, _clock) = store_at_bucket_start();
    let id = ExternalId::new("ltr_4");
    store.register_mail_piece(&id, MailStatus::Submitted).await.unwrap();

    let mut update = transition("ltr_4", "delivered");
    update.tracking_number = Some("9400100000000000000000".to_string());
    store.apply_status_transition(update).await.unwrap();

    let piece = store.find_mail_piece(&id).await.unwrap().unwrap();
    assert_eq!(piece.status, MailStatus::Delivered);
    assert_eq!(piece.provider_status.as_deref(), Some("delivered"));
    assert_eq!(piece.tracking_number.as_deref(), Some("9400100000000000000000"));
}

#[tokio::test]
async fn unknown_mail_piece_still_gets_history() {
    let (store, _clock) = store_at_bucket_start();

    let record = store.apply_status_transition(transition("ltr_5", "mystery")).await.unwrap();

    assert_eq!(record.status, MailStatus::Unknown);
    assert!(store.find_mail_piece(&ExternalId::new("ltr_5")).await.unwrap().is_none());
}

#[tokio::test]
async fn injected_failures_are_consumed_in_order() {
    let (store, _clock) = store_at_bucket_start();
    store.fail_next_applies(2, CoreError::Database("connection reset".into())).await;

    assert!(store.apply_status_transition(transition("ltr_6", "mailed")).await.is_err());
    assert!(store.apply_status_transition(transition("ltr_6", "mailed")).await.is_err());
    assert!(store.apply_status_transition(transition("ltr_6", "mailed")).await.is_ok());
    assert_eq!(store.apply_calls().await, 3);
}

#[tokio::test]
async fn snapshots_and_health() {
    let store = MockStatusStore::new();
    let snapshot = MetricsSnapshot { total_events: 4, ..Default::default() };

    store.fail_next_snapshot(CoreError::Database("down".into())).await;
    assert!(store.upsert_metrics_snapshot(&snapshot).await.is_err());
    store.upsert_metrics_snapshot(&snapshot).await.unwrap();
    assert_eq!(store.metrics_snapshots().await, vec![snapshot]);

    store.health_check().await.unwrap();
    store.set_unhealthy(Some("pool closed".into())).await;
    assert!(store.health_check().await.is_err());
}

#[tokio::test]
async fn recorded_time_comes_from_injected_clock() {
    let (store, clock) = store_at_bucket_start();

    let record = store.apply_status_transition(transition("ltr_7", "printed")).await.unwrap();

    assert_eq!(record.recorded_at.timestamp(), clock.unix_seconds());
}
