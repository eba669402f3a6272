mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use fleet_broker::clock::Clock;
use fleet_broker::scheduler::job::JobStatus;
use fleet_broker::scheduler::Dispatcher;
use fleet_broker::store::{JobStore, MemoryJobStore};
use test_harness::{echo_inputs, test_config, wait_until, FakeBroker, FakeRuntime, TestNode};

fn play_node(runtime: FakeRuntime) -> TestNode {
    TestNode::new(FakeBroker::new().with_inputs(&echo_inputs("play")), runtime)
}

async fn wait_for_container(node: &TestNode) {
    let runtime = node.runtime.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let runtime = runtime.clone();
            async move { !runtime.calls_starting_with("wait").is_empty() }
        })
        .await,
        "container should be running"
    );
}

#[tokio::test]
async fn test_queue_runs_jobs_in_submission_order() {
    let node = play_node(FakeRuntime::new());
    let first = node.submit("play").await;
    let second = node.submit("play").await;
    let dispatcher = Dispatcher::new(node.ctx.clone());

    let started = dispatcher.poll_once().await;
    assert_eq!(started.len(), 1);
    let result = started.into_iter().next().unwrap().await.unwrap();
    assert_eq!(result.job_id, first.id);
    assert_eq!(result.status, JobStatus::Success);

    let claimed = node.job(first.id).await;
    assert_eq!(claimed.node_uuid, Some(node.ctx.node_id));
    assert!(claimed.started.is_some());
    assert_eq!(node.job(second.id).await.status, JobStatus::Queued);

    let started = dispatcher.poll_once().await;
    assert_eq!(started.len(), 1);
    let result = started.into_iter().next().unwrap().await.unwrap();
    assert_eq!(result.job_id, second.id);
}

#[tokio::test]
async fn test_busy_queue_is_skipped() {
    let node = play_node(FakeRuntime::new().blocking());
    let first = node.submit("play").await;
    let second = node.submit("play").await;
    let dispatcher = Dispatcher::new(node.ctx.clone());

    assert_eq!(dispatcher.poll_once().await.len(), 1);
    wait_for_container(&node).await;

    assert!(dispatcher.poll_once().await.is_empty());
    assert_eq!(node.job(first.id).await.status, JobStatus::Running);
    assert_eq!(node.job(second.id).await.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_queues_are_independent() {
    let node = play_node(FakeRuntime::new());
    let a = node.submit("play").await;
    let b = node.submit("deploy").await;

    let started = Dispatcher::new(node.ctx.clone()).poll_once().await;
    assert_eq!(started.len(), 2);
    for handle in started {
        handle.await.unwrap();
    }

    for id in [a.id, b.id] {
        let job = node.job(id).await;
        assert_eq!(job.node_uuid, Some(node.ctx.node_id));
        assert!(job.status.is_terminal());
    }
}

#[tokio::test]
async fn test_draining_node_claims_nothing() {
    let node = play_node(FakeRuntime::new());
    let job = node.submit("play").await;

    assert!(node.ctx.begin_drain());
    assert!(!node.ctx.begin_drain());

    assert!(Dispatcher::new(node.ctx.clone()).poll_once().await.is_empty());
    assert_eq!(node.job(job.id).await.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_capacity_limits_claims() {
    let config = fleet_broker::config::NodeConfig {
        max_concurrent_jobs: 1,
        ..test_config()
    };
    let node = TestNode::with_config(
        config,
        FakeBroker::new().with_inputs(&echo_inputs("play")),
        FakeRuntime::new().blocking(),
    );
    node.submit("play").await;
    let other = node.submit("zeta").await;
    let dispatcher = Dispatcher::new(node.ctx.clone());

    assert_eq!(dispatcher.poll_once().await.len(), 1);
    assert_eq!(node.ctx.running_jobs(), 1);

    assert!(dispatcher.poll_once().await.is_empty());
    assert_eq!(node.job(other.id).await.status, JobStatus::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claim_is_exclusive_across_claimers() {
    let store = Arc::new(MemoryJobStore::new());
    let node = TestNode::sharing(
        store.clone(),
        test_config(),
        FakeBroker::new(),
        FakeRuntime::new(),
    );
    let job = node.submit("play").await;
    let now = node.clock.now();

    let claims: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next("play", Uuid::new_v4(), now).await })
        })
        .collect();

    let mut winners = Vec::new();
    for claim in claims {
        if let Some(claimed) = claim.await.unwrap().unwrap() {
            winners.push(claimed);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, job.id);
    assert_eq!(node.job(job.id).await.node_uuid, winners[0].node_uuid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fleet_runs_each_job_once() {
    let store = Arc::new(MemoryJobStore::new());
    let node_a = TestNode::sharing(
        store.clone(),
        test_config(),
        FakeBroker::new().with_inputs(&echo_inputs("play")),
        FakeRuntime::new(),
    );
    let node_b = TestNode::sharing(
        store.clone(),
        test_config(),
        FakeBroker::new().with_inputs(&echo_inputs("play")),
        FakeRuntime::new(),
    );

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(node_a.submit("play").await.id);
    }

    let dispatch_a = Dispatcher::new(node_a.ctx.clone());
    let dispatch_b = Dispatcher::new(node_b.ctx.clone());
    for _ in 0..20 {
        let (a, b) = tokio::join!(dispatch_a.poll_once(), dispatch_b.poll_once());
        assert!(a.len() + b.len() <= 1, "a queue runs one job at a time");
        for handle in a.into_iter().chain(b) {
            handle.await.unwrap();
        }
    }

    for id in &ids {
        assert_eq!(node_a.job(*id).await.status, JobStatus::Success);
    }
    let creates = node_a.runtime.calls_starting_with("create").len()
        + node_b.runtime.calls_starting_with("create").len();
    assert_eq!(creates, ids.len());
}
