//! The cadence loop: ticks, skipped ticks, fan-out and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use hso_adapters::mock::MockSolver;
use hso_host::fixtures::{DOMAIN, Harness};
use hso_host::{DomainSpec, HostError, StaticProblem};

#[tokio::test]
async fn committed_records_reach_subscribers() {
    let h = Harness::builder().build();
    let mut updates = h.scheduler.subscribe();

    h.scheduler.start(Duration::from_millis(100), 3_600).unwrap();
    let record = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("a record within two seconds")
        .unwrap();
    h.scheduler.stop().await.unwrap();

    assert_eq!(record.domain, DOMAIN);
    assert_eq!(record.cycle_id, 1);
    let stats = h.scheduler.stats();
    assert!(stats.committed >= 1);
    assert_eq!(
        stats.cycles_started,
        stats.committed + stats.degraded + stats.failed
    );
}

#[tokio::test]
async fn busy_domain_skips_ticks() {
    let h = Harness::builder()
        .classical(Arc::new(
            MockSolver::classical(6.0).with_latency(Duration::from_millis(120)),
        ))
        .build();

    h.scheduler.start(Duration::from_millis(40), 3_600).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    h.scheduler.stop().await.unwrap();

    let stats = h.scheduler.stats();
    assert!(stats.skipped_ticks >= 1, "{stats:?}");
    assert!(stats.committed >= 1, "{stats:?}");
    assert_eq!(
        stats.cycles_started,
        stats.committed + stats.degraded + stats.failed
    );

    // Cycle ids of one domain are strictly increasing and gap-free across commits.
    let latest = h.scheduler.latest_state(DOMAIN).unwrap().unwrap();
    let chain = h.scheduler.committer().query_lineage(&latest.id).unwrap();
    let ids: Vec<u64> = chain.iter().rev().map(|r| r.cycle_id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");
}

#[tokio::test]
async fn second_start_is_rejected_until_stopped() {
    let h = Harness::builder().build();
    h.scheduler.start(Duration::from_secs(5), 3_600).unwrap();
    assert!(matches!(
        h.scheduler.start(Duration::from_secs(5), 3_600),
        Err(HostError::AlreadyRunning)
    ));
    h.scheduler.stop().await.unwrap();
    h.scheduler.start(Duration::from_secs(5), 3_600).unwrap();
    h.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn domains_register_once() {
    let h = Harness::builder().build();
    let spec = DomainSpec::new(
        DOMAIN,
        hso_contracts::PolicyProfile::OpsSafe,
        Arc::new(StaticProblem::new(
            hso_host::fixtures::small_problem(),
            hso_host::fixtures::small_area(),
        )),
    );
    assert!(matches!(
        h.scheduler.register_domain(spec),
        Err(HostError::DuplicateDomain(d)) if d == DOMAIN
    ));
    assert_eq!(h.scheduler.domains(), vec![DOMAIN.to_string()]);
}
