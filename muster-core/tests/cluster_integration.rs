#![allow(clippy::unwrap_used)]
//! Multi-node scenarios driven over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use muster_core::{
    Cluster, ClusterEvent, Endpoint, FailureDetectorConfig, InProcessNetwork, JoinConfig,
    LinkStatus, MembershipConfig, Metadata, NodeStatusChange,
};
use tokio::sync::mpsc;
use tokio::time;

fn endpoint(port: u16) -> Endpoint {
    Endpoint::new("127.0.0.1", port)
}

fn test_config() -> MembershipConfig {
    MembershipConfig {
        k: 10,
        h: 8,
        l: 1,
        rpc_timeout: Duration::from_millis(200),
        failure_detector: FailureDetectorConfig {
            probe_interval: Duration::from_millis(50),
            probe_failure_threshold: 3,
        },
        join: JoinConfig {
            attempts: 5,
            phase2_timeout: Duration::from_secs(2),
        },
    }
}

async fn wait_for<F>(mut condition: F, deadline: Duration, what: &str)
where
    F: FnMut() -> bool,
{
    let started = time::Instant::now();
    while !condition() {
        assert!(
            started.elapsed() < deadline,
            "timed out waiting for {what}"
        );
        time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn seed_bootstrap_yields_single_member_view() {
    let network = InProcessNetwork::new();
    let seed = endpoint(4000);
    let cluster = Cluster::builder(seed.clone())
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .start()
        .await
        .unwrap();

    assert_eq!(cluster.member_list(), vec![seed]);
    let first = cluster.configuration_id();
    let second = cluster.configuration_id();
    assert_eq!(first, second);

    cluster.shutdown().await;
}

#[tokio::test]
async fn joiner_and_seed_agree_on_the_new_view() {
    let network = InProcessNetwork::new();
    let seed_endpoint = endpoint(4100);
    let joiner_endpoint = endpoint(4101);

    let seed = Cluster::builder(seed_endpoint.clone())
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .with_log_proposals(true)
        .start()
        .await
        .unwrap();
    let bootstrap_configuration = seed.configuration_id();

    let joiner = Cluster::builder(joiner_endpoint.clone())
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .join(seed_endpoint.clone())
        .await
        .unwrap();

    let mut expected = vec![seed_endpoint, joiner_endpoint];
    expected.sort_unstable();

    let mut seed_members = seed.member_list();
    seed_members.sort_unstable();
    assert_eq!(seed_members, expected);

    let mut joiner_members = joiner.member_list();
    joiner_members.sort_unstable();
    assert_eq!(joiner_members, expected);

    assert_eq!(seed.configuration_id(), joiner.configuration_id());
    assert_ne!(seed.configuration_id(), bootstrap_configuration);
    // The admission arrived as exactly one proposal batch at the seed.
    assert_eq!(seed.proposal_log().len(), 1);

    joiner.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn sequential_joins_converge_on_every_member() {
    let network = InProcessNetwork::new();
    let seed_endpoint = endpoint(4200);
    let seed = Cluster::builder(seed_endpoint.clone())
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .start()
        .await
        .unwrap();

    let mut clusters = Vec::new();
    for port in 4201..4204 {
        let member = Cluster::builder(endpoint(port))
            .with_in_process_network(Arc::clone(&network))
            .with_config(test_config())
            .join(seed_endpoint.clone())
            .await
            .unwrap();
        clusters.push(member);
    }

    let mut expected: Vec<Endpoint> = (4200..4204).map(endpoint).collect();
    expected.sort_unstable();

    // Later admissions reach earlier members through broadcast commits.
    wait_for(
        || {
            clusters.iter().all(|cluster| {
                let mut members = cluster.member_list();
                members.sort_unstable();
                members == expected
            }) && {
                let mut members = seed.member_list();
                members.sort_unstable();
                members == expected
            }
        },
        Duration::from_secs(5),
        "all members to observe the full view",
    )
    .await;

    let reference = seed.configuration_id();
    for cluster in &clusters {
        assert_eq!(cluster.configuration_id(), reference);
    }

    for cluster in clusters {
        cluster.shutdown().await;
    }
    seed.shutdown().await;
}

#[tokio::test]
async fn concurrent_joiners_are_admitted_despite_config_races() {
    let network = InProcessNetwork::new();
    let seed_endpoint = endpoint(4300);
    let seed = Cluster::builder(seed_endpoint.clone())
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .start()
        .await
        .unwrap();

    // Both joiners race phase 2 under the same phase-1 configuration; a
    // loser receives CONFIG_CHANGED and retries phase 1 within its attempt
    // budget.
    let first = {
        let network = Arc::clone(&network);
        let seed_endpoint = seed_endpoint.clone();
        tokio::spawn(async move {
            Cluster::builder(endpoint(4301))
                .with_in_process_network(network)
                .with_config(test_config())
                .join(seed_endpoint)
                .await
        })
    };
    let second = {
        let network = Arc::clone(&network);
        let seed_endpoint = seed_endpoint.clone();
        tokio::spawn(async move {
            Cluster::builder(endpoint(4302))
                .with_in_process_network(network)
                .with_config(test_config())
                .join(seed_endpoint)
                .await
        })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    let mut expected = vec![seed_endpoint, endpoint(4301), endpoint(4302)];
    expected.sort_unstable();
    wait_for(
        || {
            [&seed, &first, &second].iter().all(|cluster| {
                let mut members = cluster.member_list();
                members.sort_unstable();
                members == expected
            })
        },
        Duration::from_secs(5),
        "seed and both joiners to agree",
    )
    .await;

    first.shutdown().await;
    second.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn failed_member_is_removed_from_every_surviving_view() {
    let network = InProcessNetwork::new();
    let seed_endpoint = endpoint(4400);
    let seed = Cluster::builder(seed_endpoint.clone())
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .start()
        .await
        .unwrap();

    let survivor = Cluster::builder(endpoint(4401))
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .join(seed_endpoint.clone())
        .await
        .unwrap();
    let victim = Cluster::builder(endpoint(4402))
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .join(seed_endpoint.clone())
        .await
        .unwrap();
    let victim_endpoint = victim.local_endpoint();

    let mut full: Vec<Endpoint> = vec![seed_endpoint, endpoint(4401), endpoint(4402)];
    full.sort_unstable();
    wait_for(
        || {
            [&seed, &survivor, &victim].iter().all(|cluster| {
                let mut members = cluster.member_list();
                members.sort_unstable();
                members == full
            })
        },
        Duration::from_secs(5),
        "the three-member view to form",
    )
    .await;

    let (removed_tx, mut removed_rx) = mpsc::unbounded_channel();
    seed.register_subscription(
        ClusterEvent::NodeRemoved,
        Arc::new(move |changes: &[NodeStatusChange]| {
            for change in changes {
                removed_tx.send(change.clone()).unwrap();
            }
        }),
    );

    // Take the victim off the fabric; probes start timing out.
    victim.shutdown().await;

    let mut expected = full.clone();
    expected.retain(|member| *member != victim_endpoint);
    wait_for(
        || {
            [&seed, &survivor].iter().all(|cluster| {
                let mut members = cluster.member_list();
                members.sort_unstable();
                members == expected
            })
        },
        Duration::from_secs(10),
        "survivors to remove the failed member",
    )
    .await;

    let removal = time::timeout(Duration::from_secs(1), removed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(removal.endpoint, victim_endpoint);
    assert_eq!(removal.status, LinkStatus::Down);
    assert_eq!(seed.configuration_id(), survivor.configuration_id());

    survivor.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn metadata_rides_along_with_the_join() {
    let network = InProcessNetwork::new();
    let seed_endpoint = endpoint(4500);
    let seed = Cluster::builder(seed_endpoint.clone())
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .start()
        .await
        .unwrap();

    let joiner = Cluster::builder(endpoint(4501))
        .with_in_process_network(Arc::clone(&network))
        .with_config(test_config())
        .with_metadata(Metadata::new().with("role", "frontend"))
        .join(seed_endpoint)
        .await
        .unwrap();

    wait_for(
        || seed.member_list().len() == 2,
        Duration::from_secs(5),
        "the joiner to be admitted",
    )
    .await;

    let tags = seed.metadata_of(&joiner.local_endpoint()).unwrap();
    assert_eq!(tags.get("role"), Some("frontend"));

    joiner.shutdown().await;
    seed.shutdown().await;
}
