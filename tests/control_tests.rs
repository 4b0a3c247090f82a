//! End-to-end tests for the control service broadcast engine: batching,
//! coalescing, newest-wins supersession, failure isolation, activity-based
//! expiration and oversized payloads, all over in-memory loopback
//! transports with a paused clock.

mod common;

use common::*;
use std::sync::Arc;
use tokio::time::sleep;
use uuid::Uuid;
use volmesh::config::{EXPIRATION_TIME, PING_INTERVAL};
use volmesh::generation::generation_hash;
use volmesh::model::{
    Application, Deployment, DeploymentState, DockerImage, Node, NodeState, StateChange,
};

fn node(uuid: u128, hostname: &str) -> Node {
    Node::new(Uuid::from_u128(uuid), hostname)
}

fn test_deployment() -> Deployment {
    Deployment::new([node(1, "node1.example.com").with_applications([
        Application::new("myapp", DockerImage::from_string("postgresql")),
        Application::new("myapp2", DockerImage::from_string("mysql")),
    ])])
}

fn nth_deployment(n: u128) -> Deployment {
    test_deployment().update_node(node(100 + n, &format!("extra{n}.example.com")))
}

#[tokio::test(start_paused = true)]
async fn initial_snapshot_on_connect() {
    let _ = tracing_subscriber::fmt::try_init();
    let (service, configuration) = control_fixture();
    let c1 = test_deployment();
    configuration.save(c1.clone());

    let agent = FakeAgent::new();
    let (agent_service, _connection) = connect_fake_agent(&service, Arc::clone(&agent)).await;
    advance_batching().await;

    assert_eq!(agent.update_count(), 1);
    assert_eq!(agent.desired().as_deref(), Some(&c1));
    assert_eq!(agent.actual().as_deref(), Some(&DeploymentState::default()));
    assert_eq!(
        agent_service.held_generations(),
        (
            generation_hash(&c1).unwrap(),
            generation_hash(&DeploymentState::default()).unwrap(),
        )
    );
}

#[tokio::test(start_paused = true)]
async fn configuration_burst_coalesces_into_one_update() {
    let _ = tracing_subscriber::fmt::try_init();
    let (service, configuration) = control_fixture();
    let agent = FakeAgent::new();
    let (_agent_service, _connection) = connect_fake_agent(&service, Arc::clone(&agent)).await;
    advance_batching().await;
    let baseline = agent.update_count();

    let mut last = test_deployment();
    for i in 0..10 {
        last = nth_deployment(i);
        configuration.save(last.clone());
    }
    // Nothing goes out before the batching window closes.
    assert_eq!(agent.update_count(), baseline);

    advance_batching().await;
    assert_eq!(agent.update_count(), baseline + 1);
    assert_eq!(agent.desired().as_deref(), Some(&last));
}

#[tokio::test(start_paused = true)]
async fn newest_pending_target_supersedes_older_one() {
    let _ = tracing_subscriber::fmt::try_init();
    let (service, _configuration) = control_fixture();
    let (agent, release) = FakeAgent::gated();
    let (_agent_service, _connection) = connect_fake_agent(&service, Arc::clone(&agent)).await;

    // The initial snapshot goes in flight and stays there, unanswered.
    advance_batching().await;

    let configuration = service.configuration();
    let second = nth_deployment(1);
    configuration.save(second.clone());
    advance_batching().await;

    let third = nth_deployment(2);
    configuration.save(third.clone());
    advance_batching().await;

    // Answer the in-flight send; the queued target must be the newest one.
    release.send(()).unwrap();
    advance_batching().await;
    release.send(()).unwrap();
    advance_batching().await;

    let delivered = agent.delivered_configurations();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1], third);
    // The superseded intermediate configuration never reached the wire.
    assert!(!delivered.contains(&second));
}

#[tokio::test(start_paused = true)]
async fn failing_connection_does_not_stall_others() {
    let _ = tracing_subscriber::fmt::try_init();
    let (service, configuration) = control_fixture();
    let _failing = connect_failing_agent(&service);
    let healthy = FakeAgent::new();
    let (_agent_service, _connection) =
        connect_fake_agent(&service, Arc::clone(&healthy)).await;
    advance_batching().await;

    let c1 = test_deployment();
    configuration.save(c1.clone());
    advance_batching().await;
    assert_eq!(healthy.desired().as_deref(), Some(&c1));

    let c2 = nth_deployment(1);
    configuration.save(c2.clone());
    advance_batching().await;
    assert_eq!(healthy.desired().as_deref(), Some(&c2));
}

#[tokio::test(start_paused = true)]
async fn state_report_notifies_all_connected_agents() {
    let _ = tracing_subscriber::fmt::try_init();
    let (service, configuration) = control_fixture();
    configuration.save(test_deployment());

    let first = FakeAgent::new();
    let second = FakeAgent::new();
    let (_s1, _c1) = connect_fake_agent(&service, Arc::clone(&first)).await;
    let (_s2, _c2) = connect_fake_agent(&service, Arc::clone(&second)).await;
    advance_batching().await;

    let report = NodeState::new(Uuid::from_u128(7), "192.0.2.17").with_applications([
        Application::new("db", DockerImage::from_string("postgresql")),
    ]);
    first
        .peer()
        .expect("peer handle")
        .report_state(vec![StateChange::NodeState(report.clone())])
        .await
        .expect("state report");
    advance_batching().await;

    let expected = DeploymentState::default().update_node(report);
    for agent in [&first, &second] {
        assert_eq!(agent.actual().as_deref(), Some(&expected));
        assert_eq!(agent.desired().as_deref(), Some(&test_deployment()));
    }
}

#[tokio::test(start_paused = true)]
async fn contribution_survives_pings_then_expires_after_silence() {
    let _ = tracing_subscriber::fmt::try_init();
    let (service, _configuration) = control_fixture();
    let agent = FakeAgent::new();
    let (_agent_service, connection) = connect_fake_agent(&service, Arc::clone(&agent)).await;
    advance_batching().await;

    let uuid = Uuid::from_u128(7);
    let report = NodeState::new(uuid, "192.0.2.17").with_applications([]);
    agent
        .peer()
        .expect("peer handle")
        .report_state(vec![StateChange::NodeState(report)])
        .await
        .expect("state report");
    advance_batching().await;
    assert!(service.current_state().nodes.contains_key(&uuid));

    // Stay connected well past the expiration window: the automatic pings
    // keep refreshing the contribution.
    sleep(EXPIRATION_TIME + PING_INTERVAL).await;
    assert!(service.current_state().nodes.contains_key(&uuid));

    // Go silent. The connection's death does not evict anything by itself.
    connection.close();
    sleep(EXPIRATION_TIME - PING_INTERVAL).await;
    assert!(service.current_state().nodes.contains_key(&uuid));

    // One full expiration window after the last activity, the node is gone.
    sleep(PING_INTERVAL * 3).await;
    assert!(service.current_state().nodes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_node_state_round_trips() {
    let _ = tracing_subscriber::fmt::try_init();
    let (service, _configuration) = control_fixture();
    let agent = FakeAgent::new();
    let (_agent_service, _connection) = connect_fake_agent(&service, Arc::clone(&agent)).await;
    advance_batching().await;

    let image = DockerImage::from_string("postgresql");
    let applications =
        (0..800).map(|i| Application::new(format!("postgres-{i}"), image.clone()));
    let huge = NodeState::new(Uuid::from_u128(13), "192.0.3.13")
        .with_applications(applications);

    agent
        .peer()
        .expect("peer handle")
        .report_state(vec![StateChange::NodeState(huge.clone())])
        .await
        .expect("oversized state report");

    assert_eq!(
        service.current_state(),
        DeploymentState::default().update_node(huge)
    );
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_broadcast_and_closes_connections() {
    let _ = tracing_subscriber::fmt::try_init();
    let (service, configuration) = control_fixture();
    let agent = FakeAgent::new();
    let (_agent_service, connection) = connect_fake_agent(&service, Arc::clone(&agent)).await;
    advance_batching().await;
    let baseline = agent.update_count();

    configuration.save(test_deployment());
    service.stop();
    advance_batching().await;

    // The delayed broadcast was cancelled, not merely delayed.
    assert_eq!(agent.update_count(), baseline);
    assert!(!connection.is_connected());
    assert_eq!(service.connection_count(), 0);
}
