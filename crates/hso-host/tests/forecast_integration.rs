//! Forecast freshness handling inside a cycle.

use std::sync::Arc;
use std::time::Duration;

use hso_adapters::mock::MockForecastSource;
use hso_contracts::{CycleOutcome, StageError, StageKind, StageStatus, StateRecord};
use hso_host::fixtures::{DOMAIN, Harness};

fn envelope_evidence(record: &StateRecord) -> &serde_json::Value {
    &record
        .evidence
        .iter()
        .find(|e| e.kind == "envelope")
        .expect("envelope evidence")
        .detail
}

#[tokio::test]
async fn fresh_field_is_committed_with_the_cycle() {
    let h = Harness::builder().build();

    let cycle = h.scheduler.run_cycle(DOMAIN, 300).await.unwrap();

    assert_eq!(cycle.outcome, CycleOutcome::Committed);
    assert!(!cycle.field_stale);
    assert_eq!(cycle.stage(StageKind::Forecast).unwrap().status, StageStatus::Ok);
    let record = h.scheduler.latest_state(DOMAIN).unwrap().unwrap();
    assert_eq!(record.artifact["field_stale"], false);
    assert_eq!(record.artifact["field"]["area"]["id"], "west");
    assert_eq!(record.artifact["field"]["step_s"], 60);
    assert!(envelope_evidence(&record).get("stale").is_none());
    assert_eq!(h.forecast.requested_areas(), vec!["west".to_string()]);
}

#[tokio::test]
async fn stale_field_is_never_consumed_as_fresh() {
    let source = Arc::new(MockForecastSource::new(1.0).with_age(Duration::from_secs(120)));
    let h = Harness::builder()
        .config(|c| c.staleness_bound_ms = 60_000)
        .forecast(source)
        .build();

    let cycle = h.scheduler.run_cycle(DOMAIN, 300).await.unwrap();

    assert_eq!(cycle.outcome, CycleOutcome::Committed);
    assert!(cycle.field_stale);
    let forecast = cycle.stage(StageKind::Forecast).unwrap();
    assert_eq!(forecast.status, StageStatus::Failed);
    assert!(forecast
        .errors
        .iter()
        .any(|e| matches!(e, StageError::StaleField { bound_ms: 60_000, .. })));

    let record = h.scheduler.latest_state(DOMAIN).unwrap().unwrap();
    assert_eq!(record.artifact["field_stale"], true);
    assert!(record.artifact.get("field").is_none());
    assert_eq!(envelope_evidence(&record)["stale"], true);
    assert!(h.scheduler.forecast().latest(&hso_host::fixtures::small_area()).is_none());
}

#[tokio::test]
async fn prior_field_is_carried_forward_and_flagged() {
    let h = Harness::builder().build();
    let first = h.scheduler.run_cycle(DOMAIN, 300).await.unwrap();
    assert!(!first.field_stale);
    let first_record = h.scheduler.latest_state(DOMAIN).unwrap().unwrap();

    h.forecast.set_failing(true);
    let second = h.scheduler.run_cycle(DOMAIN, 300).await.unwrap();

    assert_eq!(second.outcome, CycleOutcome::Committed);
    assert!(second.field_stale);
    assert_eq!(
        second.stage(StageKind::Forecast).unwrap().status,
        StageStatus::Fallback
    );
    let record = h.scheduler.latest_state(DOMAIN).unwrap().unwrap();
    assert_eq!(record.artifact["field_stale"], true);
    assert_eq!(record.artifact["field"]["grid"], first_record.artifact["field"]["grid"]);
    assert_eq!(envelope_evidence(&record)["stale"], true);
}

#[tokio::test]
async fn expired_prior_field_is_dropped_from_the_record() {
    let h = Harness::builder()
        .config(|c| c.staleness_bound_ms = 30)
        .build();
    let first = h.scheduler.run_cycle(DOMAIN, 300).await.unwrap();
    assert_eq!(first.outcome, CycleOutcome::Committed);
    assert!(!first.field_stale);

    h.forecast.set_failing(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = h.scheduler.run_cycle(DOMAIN, 300).await.unwrap();

    assert_eq!(second.outcome, CycleOutcome::Committed);
    assert!(second.field_stale);
    let forecast = second.stage(StageKind::Forecast).unwrap();
    assert_eq!(forecast.status, StageStatus::Failed);
    assert!(forecast
        .errors
        .iter()
        .any(|e| matches!(e, StageError::StaleField { bound_ms: 30, .. })));

    let record = h.scheduler.latest_state(DOMAIN).unwrap().unwrap();
    assert_eq!(record.artifact["field_stale"], true);
    assert!(record.artifact.get("field").is_none());
    assert!(record.evidence.iter().all(|e| e.kind != "field"));
    assert_eq!(envelope_evidence(&record)["stale"], true);
}

#[tokio::test]
async fn slow_forecast_is_cut_at_its_sub_budget() {
    let h = Harness::builder().build();
    h.forecast.set_latency(Duration::from_millis(500));

    let cycle = h.scheduler.run_cycle(DOMAIN, 300).await.unwrap();

    assert_eq!(cycle.outcome, CycleOutcome::Committed);
    assert!(cycle.field_stale);
    let forecast = cycle.stage(StageKind::Forecast).unwrap();
    assert_eq!(forecast.status, StageStatus::Failed);
    assert!(forecast.elapsed_ms < 200, "forecast took {}ms", forecast.elapsed_ms);
    assert!(cycle.elapsed_ms <= 300);
}
