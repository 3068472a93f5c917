//! Multi-node cluster scenarios over the in-memory transport hub
//!
//! Timers are shortened so a full suspect/refute cycle fits in a test run;
//! assertions poll with a deadline instead of assuming exact tick counts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use gridflow_cluster::{
    ClusterConfig, ClusterError, ClusterNode, MemoryHub, NodeState,
};
use gridflow_journal::WorkflowStatus;
use gridflow_runtime::{SubmitOutcome, WorkflowError};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn fast_config(port: u16, seeds: Vec<SocketAddr>) -> ClusterConfig {
    ClusterConfig::new(format!("node-{port}"), addr(port))
        .with_seeds(seeds)
        .with_gossip_tick_period(Duration::from_millis(50))
        .with_probe_timeouts(Duration::from_millis(25), Duration::from_millis(50))
        .with_suspect_timeout(Duration::from_millis(250))
        .with_submit_ack_timeout(Duration::from_secs(2))
}

async fn start_node(hub: &Arc<MemoryHub>, port: u16, seeds: Vec<SocketAddr>) -> Arc<ClusterNode> {
    let (transport, inbox) = hub.bind(addr(port));
    ClusterNode::start(fast_config(port, seeds), transport, inbox)
        .await
        .unwrap()
}

/// Poll a condition until it holds or the deadline passes
async fn wait_for(what: &str, deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(condition(), "timed out waiting for: {what}");
}

async fn three_node_cluster(
    hub: &Arc<MemoryHub>,
) -> (Arc<ClusterNode>, Arc<ClusterNode>, Arc<ClusterNode>) {
    let seed = start_node(hub, 7800, vec![]).await;
    let node_b = start_node(hub, 7801, vec![addr(7800)]).await;
    let node_c = start_node(hub, 7802, vec![addr(7800)]).await;

    let nodes = [seed.clone(), node_b.clone(), node_c.clone()];
    wait_for("all three nodes to see three alive members", Duration::from_secs(3), || {
        nodes.iter().all(|n| n.alive_members().len() == 3)
    })
    .await;

    (seed, node_b, node_c)
}

#[test_log::test(tokio::test)]
async fn test_three_node_formation() {
    let hub = MemoryHub::new();
    let (seed, node_b, node_c) = three_node_cluster(&hub).await;

    // Every node projects the same ring
    wait_for("identical rings", Duration::from_secs(2), || {
        seed.ring_members() == node_b.ring_members()
            && node_b.ring_members() == node_c.ring_members()
            && seed.ring_members().len() == 3
    })
    .await;

    for node in [&seed, &node_b, &node_c] {
        node.shutdown().await;
    }
}

#[test_log::test(tokio::test)]
async fn test_consistent_routing_across_nodes() {
    let hub = MemoryHub::new();
    let (seed, node_b, node_c) = three_node_cluster(&hub).await;

    wait_for("rings to agree", Duration::from_secs(2), || {
        seed.ring_members() == node_b.ring_members()
            && node_b.ring_members() == node_c.ring_members()
    })
    .await;

    let members = seed.ring_members();
    for i in 1..=6 {
        let key = format!("workflow-{i}");
        let owner = seed.ring_owner(&key).unwrap();
        assert_eq!(node_b.ring_owner(&key).unwrap(), owner, "owner of {key}");
        assert_eq!(node_c.ring_owner(&key).unwrap(), owner, "owner of {key}");
        assert!(members.contains(&owner));
    }

    for node in [&seed, &node_b, &node_c] {
        node.shutdown().await;
    }
}

#[test_log::test(tokio::test)]
async fn test_partition_suspicion_and_refutation() {
    let hub = MemoryHub::new();
    let (seed, node_b, node_c) = three_node_cluster(&hub).await;

    // Partition node-b away from the cluster
    hub.partition(addr(7801));

    // Suspicion comes first and holds for the suspect timeout
    wait_for(
        "survivors to suspect node-7801",
        Duration::from_secs(3),
        || {
            matches!(
                seed.member_state("node-7801"),
                Some(NodeState::Suspect | NodeState::Dead)
            ) && matches!(
                node_c.member_state("node-7801"),
                Some(NodeState::Suspect | NodeState::Dead)
            )
        },
    )
    .await;

    wait_for(
        "survivors to bury node-7801",
        Duration::from_secs(3),
        || {
            seed.member_state("node-7801") == Some(NodeState::Dead)
                && node_c.member_state("node-7801") == Some(NodeState::Dead)
        },
    )
    .await;

    // The dead member leaves the survivors' rings
    wait_for("rings without node-7801", Duration::from_secs(2), || {
        seed.ring_members() == vec!["node-7800".to_string(), "node-7802".to_string()]
            && node_c.ring_members() == vec!["node-7800".to_string(), "node-7802".to_string()]
    })
    .await;

    // Heal: node-b refutes the death sentence with a higher incarnation
    hub.heal(addr(7801));

    let nodes = [seed.clone(), node_b.clone(), node_c.clone()];
    wait_for(
        "node-7801 to refute and rejoin everywhere",
        Duration::from_secs(4),
        || {
            nodes.iter().all(|n| {
                n.member_state("node-7801") == Some(NodeState::Alive)
                    && n.ring_members().len() == 3
            })
        },
    )
    .await;

    // Refutation advanced the incarnation past the death claim
    assert!(seed.member_incarnation("node-7801").unwrap() >= 1);

    wait_for("rings to converge after healing", Duration::from_secs(2), || {
        seed.ring_members() == node_b.ring_members()
            && node_b.ring_members() == node_c.ring_members()
    })
    .await;

    for node in [&seed, &node_b, &node_c] {
        node.shutdown().await;
    }
}

#[test_log::test(tokio::test)]
async fn test_remote_submission_runs_on_owner() {
    let hub = MemoryHub::new();
    let (seed, node_b, node_c) = three_node_cluster(&hub).await;
    let nodes = [seed.clone(), node_b.clone(), node_c.clone()];

    wait_for("rings to agree", Duration::from_secs(2), || {
        seed.ring_members() == node_b.ring_members()
            && node_b.ring_members() == node_c.ring_members()
    })
    .await;

    for node in &nodes {
        node.register("echo", |_ctx, value: String| async move {
            Ok::<_, WorkflowError>(format!("echo:{value}"))
        });
    }

    // Find an id the seed does not own, so the submission must forward
    let workflow_id = (0..100)
        .map(|i| format!("workflow-x-{i}"))
        .find(|id| seed.ring_owner(id).unwrap() != seed.node_id())
        .expect("some id lands on another node");
    let owner_id = seed.ring_owner(&workflow_id).unwrap();

    let outcome = seed
        .submit("echo", &workflow_id, json!("hello"))
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Completed(json!("echo:hello")));

    // The journal exists on the owner and nowhere else
    for node in &nodes {
        let status = node.workflow_status(&workflow_id).await.unwrap();
        if node.node_id() == owner_id {
            assert_eq!(status, WorkflowStatus::Completed);
        } else {
            assert_eq!(status, WorkflowStatus::NotStarted);
        }
    }

    // Resubmission is idempotent through the forwarding path too
    let again = seed
        .submit("echo", &workflow_id, json!("different input"))
        .await
        .unwrap();
    assert_eq!(again, SubmitOutcome::Completed(json!("echo:hello")));

    for node in &nodes {
        node.shutdown().await;
    }
}

#[test_log::test(tokio::test)]
async fn test_remote_submission_of_unknown_workflow() {
    let hub = MemoryHub::new();
    let (seed, node_b, node_c) = three_node_cluster(&hub).await;

    wait_for("rings to agree", Duration::from_secs(2), || {
        seed.ring_members() == node_b.ring_members()
            && node_b.ring_members() == node_c.ring_members()
    })
    .await;

    // No node registered anything; a forwarded submission comes back as a
    // terminal unknown-workflow failure rather than hanging.
    let workflow_id = (0..100)
        .map(|i| format!("workflow-y-{i}"))
        .find(|id| seed.ring_owner(id).unwrap() != seed.node_id())
        .expect("some id lands on another node");

    match seed.submit("ghost", &workflow_id, json!(null)).await {
        Ok(SubmitOutcome::Failed(info)) => assert_eq!(info.kind, "unknown_workflow"),
        other => panic!("unexpected result: {other:?}"),
    }

    for node in [&seed, &node_b, &node_c] {
        node.shutdown().await;
    }
}

#[test_log::test(tokio::test)]
async fn test_graceful_leave_removes_member() {
    let hub = MemoryHub::new();
    let (seed, node_b, node_c) = three_node_cluster(&hub).await;

    node_c.shutdown().await;

    wait_for(
        "survivors to see node-7802 as left",
        Duration::from_secs(2),
        || {
            seed.member_state("node-7802") == Some(NodeState::Left)
                && node_b.member_state("node-7802") == Some(NodeState::Left)
        },
    )
    .await;

    wait_for("rings without node-7802", Duration::from_secs(2), || {
        seed.ring_members() == vec!["node-7800".to_string(), "node-7801".to_string()]
            && node_b.ring_members() == seed.ring_members()
    })
    .await;

    seed.shutdown().await;
    node_b.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_submission_to_partitioned_owner_is_retryable() {
    let hub = MemoryHub::new();
    let (seed, node_b, node_c) = three_node_cluster(&hub).await;
    let nodes = [seed.clone(), node_b.clone(), node_c.clone()];

    for node in &nodes {
        node.register("echo", |_ctx, value: String| async move {
            Ok::<_, WorkflowError>(value)
        });
    }

    wait_for("rings to agree", Duration::from_secs(2), || {
        seed.ring_members() == node_b.ring_members()
            && node_b.ring_members() == node_c.ring_members()
    })
    .await;

    // Pick an id owned by node-b, then cut node-b off
    let workflow_id = (0..100)
        .map(|i| format!("workflow-z-{i}"))
        .find(|id| seed.ring_owner(id).unwrap() == "node-7801")
        .expect("some id lands on node-7801");

    hub.partition(addr(7801));

    let err = seed
        .submit("echo", &workflow_id, json!("lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::TransientTransport(_)));

    for node in &nodes {
        node.shutdown().await;
    }
}
