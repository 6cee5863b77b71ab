//! End-to-end lifecycle tests: session replacement, and serialization of
//! command resolutions against reconciliation on the same deployment.

mod common;

use std::sync::Arc;

use sy_core::traits::{DeploymentStore, ServerStore};
use sy_core::types::{AgentHealth, DeploymentId, DeploymentStatus, ServerId};
use sy_protocol::{AppReport, CommandAction, ResultStatus, ServerEvent, StatusReport};

use sy_orchestrator::session;

use common::{harness, seed_deployment, seed_server};

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let h = harness();
    seed_server(&h, "srv-1");
    let server_id = ServerId::new("srv-1");

    let first = session::register_agent(&h.state, &server_id).await;
    assert_eq!(first.connection.generation, 1);

    let second = session::register_agent(&h.state, &server_id).await;
    assert_eq!(second.connection.generation, 2);

    // the first connection was force-closed and unregistered
    assert!(first.connection.cancel_token().is_cancelled());
    assert!(!second.connection.cancel_token().is_cancelled());
    assert_eq!(h.state.registry.len(), 1);
    assert_eq!(h.state.registry.get(&server_id).unwrap().generation, 2);

    // the old socket's unwinding must not tear down the replacement
    session::disconnect_agent(&h.state, &server_id, 1, "old socket unwound").await;
    assert_eq!(h.state.registry.len(), 1);
    let server = h.servers.get(&server_id).await.unwrap().unwrap();
    assert_eq!(server.health, AgentHealth::Connected);

    // a real disconnect of the current generation does
    session::disconnect_agent(&h.state, &server_id, 2, "agent stopped").await;
    assert!(h.state.registry.is_empty());
    let server = h.servers.get(&server_id).await.unwrap().unwrap();
    assert_eq!(server.health, AgentHealth::Disconnected);
}

#[tokio::test]
async fn test_disconnect_fails_pending_commands() {
    let h = harness();
    seed_server(&h, "srv-1");
    seed_deployment(&h, "d1", "srv-1", DeploymentStatus::Stopped);
    let server_id = ServerId::new("srv-1");

    // keep the registration alive: dropping its receiver would close the
    // outbound queue and refuse the send outright
    let registration = session::register_agent(&h.state, &server_id).await;
    let command_id = h
        .state
        .dispatcher
        .send(
            &server_id,
            CommandAction::Start,
            "blog",
            Some(DeploymentId::new("d1")),
            None,
        )
        .await
        .unwrap();

    session::disconnect_agent(
        &h.state,
        &server_id,
        registration.connection.generation,
        "agent stopped",
    )
    .await;

    assert_eq!(h.state.dispatcher.pending_count(), 0);
    assert!(h.state.dispatcher.record(&command_id).is_some());
    let row = h
        .deployments
        .get(&DeploymentId::new("d1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, DeploymentStatus::Error);
}

/// Commands and status reports race on the same deployment; every observed
/// transition must chain off the previous one (no lost or interleaved
/// updates), because both paths commit under the deployment's lock.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_command_and_report_writes_never_interleave() {
    let h = harness();
    seed_server(&h, "srv-1");
    seed_deployment(&h, "d1", "srv-1", DeploymentStatus::Stopped);
    let server_id = ServerId::new("srv-1");

    let _registration = session::register_agent(&h.state, &server_id).await;
    let mut room = h.state.broadcaster.subscribe();

    for _ in 0..20 {
        let dispatcher = Arc::clone(&h.state.dispatcher);
        let reconciler = Arc::clone(&h.state.reconciler);
        let command_server = server_id.clone();
        let report_server = server_id.clone();

        // one full command cycle driving the row to running
        let command = tokio::spawn(async move {
            let command_id = dispatcher
                .send(
                    &command_server,
                    CommandAction::Start,
                    "blog",
                    Some(DeploymentId::new("d1")),
                    None,
                )
                .await
                .unwrap();
            dispatcher.handle_ack(&command_server, &command_id, 0).await;
            dispatcher
                .handle_result(
                    &command_server,
                    &command_id,
                    ResultStatus::Success,
                    None,
                    None,
                    None,
                )
                .await;
        });

        // a concurrent report claiming the app is stopped
        let report = tokio::spawn(async move {
            reconciler
                .ingest(
                    &report_server,
                    StatusReport {
                        metrics: None,
                        network: None,
                        apps: vec![AppReport {
                            app_name: "blog".into(),
                            status: "stopped".into(),
                        }],
                    },
                )
                .await;
        });

        command.await.unwrap();
        report.await.unwrap();
    }

    // replay the room: each deployment transition must start from exactly
    // the state the previous one left behind
    let mut last_status = "stopped".to_string();
    let mut transitions = 0;
    while let Ok(event) = room.try_recv() {
        if let ServerEvent::DeploymentStatus {
            deployment_id,
            previous,
            status,
            ..
        } = event
        {
            assert_eq!(deployment_id, "d1");
            assert_eq!(
                previous, last_status,
                "interleaved write detected after {} transitions",
                transitions
            );
            last_status = status;
            transitions += 1;
        }
    }
    assert!(transitions > 0);

    let row = h
        .deployments
        .get(&DeploymentId::new("d1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status.as_str(), last_status);
}
