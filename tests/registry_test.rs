mod common;

use std::{sync::Arc, time::Duration};

use wa_orchestrator::{ConnectionState, status::reason};

use common::{
    drain, eventually, fast_policy, harness,
    provider_mock::{MockProvider, provider_error},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_get_or_create_starts_one_session() -> anyhow::Result<()> {
    let provider = MockProvider::new().with_create_delay(Duration::from_millis(20));
    let h = harness(provider, fast_policy());
    let registry = h.orchestrator.registry().clone();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry.get_or_create("shared-instance", "agent-1")
        }));
    }

    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await?);
    }
    let first = sessions
        .first()
        .ok_or_else(|| anyhow::anyhow!("no session returned"))?;
    assert!(sessions.iter().all(|session| Arc::ptr_eq(session, first)));
    assert_eq!(registry.len(), 1);

    eventually(|| first.state() == ConnectionState::AwaitingScan).await?;
    assert_eq!(MockProvider::calls(&h.provider.create_calls), 1);
    assert_eq!(h.metrics.snapshot(0).sessions_started, 1);
    Ok(())
}

#[tokio::test]
async fn remove_ends_subscriptions_with_session_removed() -> anyhow::Result<()> {
    let h = harness(MockProvider::new(), fast_policy());
    let registry = h.orchestrator.registry();
    let (session, subscription) = registry.attach("removable", "agent-1");

    let removed = registry
        .remove("removable")
        .ok_or_else(|| anyhow::anyhow!("session not tracked"))?;
    assert!(Arc::ptr_eq(&removed, &session));
    assert!(registry.get("removable").is_none());
    assert!(registry.remove("removable").is_none());

    let events = drain(subscription).await?;
    let last = events
        .last()
        .ok_or_else(|| anyhow::anyhow!("no terminal event"))?;
    assert_eq!(last.state, ConnectionState::Disconnected);
    assert_eq!(last.reason.as_deref(), Some(reason::SESSION_REMOVED));

    eventually(|| session.is_finished()).await?;
    assert_eq!(h.bus.subscriber_count("removable"), 0);
    assert_eq!(h.metrics.snapshot(0).sessions_removed, 1);
    Ok(())
}

#[tokio::test]
async fn ended_session_is_replaced_by_a_fresh_one() -> anyhow::Result<()> {
    let provider = MockProvider::new()
        .push_connect(Err(provider_error(400, "bad request")))
        .push_connect(Err(provider_error(400, "bad request")));
    let h = harness(provider, fast_policy());
    let registry = h.orchestrator.registry();

    let failed = registry.get_or_create("retry-me", "agent-1");
    eventually(|| failed.is_finished()).await?;
    assert_eq!(failed.state(), ConnectionState::Failed);
    assert!(!failed.is_live());

    // The tombstone stays queryable until it is replaced.
    assert_eq!(
        registry.get("retry-me").map(|session| session.state()),
        Some(ConnectionState::Failed)
    );
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.live_count(), 0);
    assert_eq!(h.orchestrator.metrics().sessions_live, 0);

    let fresh = registry.get_or_create("retry-me", "agent-1");
    assert!(!Arc::ptr_eq(&failed, &fresh));
    eventually(|| fresh.state() == ConnectionState::AwaitingScan).await?;
    assert_eq!(MockProvider::calls(&h.provider.create_calls), 2);
    assert_eq!(registry.live_count(), 1);
    assert_eq!(h.orchestrator.metrics().sessions_live, 1);
    Ok(())
}

#[tokio::test]
async fn listing_is_sorted_and_clear_closes_everything() -> anyhow::Result<()> {
    let h = harness(MockProvider::new(), fast_policy());
    let registry = h.orchestrator.registry();
    assert!(registry.is_empty());

    let (_, charlie) = registry.attach("charlie", "agent-3");
    let (_, alpha) = registry.attach("alpha", "agent-1");
    let (_, bravo) = registry.attach("bravo", "agent-2");

    assert_eq!(registry.list(), vec!["alpha", "bravo", "charlie"]);
    let names: Vec<String> = registry
        .snapshots()
        .into_iter()
        .map(|snapshot| snapshot.instance_name)
        .collect();
    assert_eq!(names, vec!["alpha", "bravo", "charlie"]);

    let cleared = registry.clear();
    assert_eq!(cleared.len(), 3);
    assert!(registry.is_empty());

    for subscription in [alpha, bravo, charlie] {
        let events = drain(subscription).await?;
        let last = events
            .last()
            .ok_or_else(|| anyhow::anyhow!("no terminal event"))?;
        assert_eq!(last.reason.as_deref(), Some(reason::SESSION_REMOVED));
    }
    Ok(())
}
