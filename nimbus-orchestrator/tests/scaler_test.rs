// Integration tests for parallel scale-out

mod common;

use common::{lifecycle, live_names, mock_provider, provisioner, running_cluster, test_settings, MAX_WORKERS};
use nimbus_common::{ClusterError, InstanceStatus};
use nimbus_orchestrator::{ConnectionPool, ParallelNodeScaler, ScaleOptions};
use nimbus_providers::mock::MockProvider;
use std::sync::Arc;
use std::time::Duration;

fn scaler() -> ParallelNodeScaler {
    let settings = test_settings();
    ParallelNodeScaler::new(
        Arc::new(provisioner(&settings)),
        lifecycle(&settings),
        settings.max_parallel_nodes,
    )
}

fn node_names(cluster: &nimbus_common::Cluster) -> Vec<String> {
    cluster.nodes.iter().map(|n| n.name.clone()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_success_grows_without_gaps() {
    let mock = mock_provider();
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let mut cluster = running_cluster(&mock, "vfxt", 3);

    let added = scaler()
        .add_cluster_nodes(&pool, &mut cluster, 4, &ScaleOptions::default())
        .await
        .unwrap();

    let added: Vec<String> = added.into_iter().map(|n| n.name).collect();
    assert_eq!(added, vec!["vfxt-04", "vfxt-05", "vfxt-06", "vfxt-07"]);
    assert_eq!(cluster.nodes.len(), 7);
    assert_eq!(
        node_names(&cluster),
        (1..=7).map(|n| format!("vfxt-{:02}", n)).collect::<Vec<_>>()
    );
    assert_eq!(mock.calls().create, 4);
}

#[tokio::test]
async fn test_suffixes_follow_the_highest_existing_node() {
    let mock = mock_provider();
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let mut cluster = running_cluster(&mock, "vfxt", 3);
    // vfxt-02 went away; numbering continues after vfxt-03.
    cluster.nodes.remove(1);

    scaler()
        .add_cluster_nodes(&pool, &mut cluster, 2, &ScaleOptions::default())
        .await
        .unwrap();
    assert_eq!(node_names(&cluster), vec!["vfxt-01", "vfxt-03", "vfxt-04", "vfxt-05"]);
}

#[tokio::test]
async fn test_zero_nodes_is_a_no_op() {
    let mock = mock_provider();
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let mut cluster = running_cluster(&mock, "vfxt", 1);

    let added = scaler()
        .add_cluster_nodes(&pool, &mut cluster, 0, &ScaleOptions::default())
        .await
        .unwrap();
    assert!(added.is_empty());
    assert_eq!(mock.calls().create, 0);
    assert_eq!(pool.opened(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partial_failure_rolls_back_everything() {
    let mock = mock_provider();
    mock.fail_creation("vfxt-05", "quota exceeded");
    mock.script_boot("vfxt-06", vec![InstanceStatus::active("BOOT_FAILURE")]);
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let mut cluster = running_cluster(&mock, "vfxt", 3);
    let before = cluster.nodes.clone();

    let err = scaler()
        .add_cluster_nodes(&pool, &mut cluster, 4, &ScaleOptions::default())
        .await
        .unwrap_err();

    match err {
        ClusterError::ScaleOut {
            failures,
            rollback_errors,
        } => {
            assert_eq!(failures.len(), 2, "{:?}", failures);
            assert!(failures[0].starts_with("vfxt-05: "), "{:?}", failures);
            assert!(failures[0].contains("quota exceeded"));
            assert!(failures[1].starts_with("vfxt-06: "), "{:?}", failures);
            assert!(rollback_errors.is_empty(), "{:?}", rollback_errors);
        }
        other => panic!("expected ScaleOut, got {:?}", other),
    }
    assert_eq!(cluster.nodes, before);
    assert_eq!(live_names(&mock), vec!["vfxt-01", "vfxt-02", "vfxt-03"]);
}

#[tokio::test]
async fn test_skip_cleanup_keeps_created_nodes() {
    let mock = mock_provider();
    mock.fail_creation("vfxt-03", "quota exceeded");
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let mut cluster = running_cluster(&mock, "vfxt", 1);

    let options = ScaleOptions {
        skip_cleanup: true,
        ..ScaleOptions::default()
    };
    let err = scaler()
        .add_cluster_nodes(&pool, &mut cluster, 3, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ScaleOut { ref failures, .. } if failures.len() == 1));

    assert_eq!(cluster.nodes.len(), 1);
    assert_eq!(live_names(&mock), vec!["vfxt-01", "vfxt-02", "vfxt-04"]);
}

#[tokio::test]
async fn test_rollback_failures_are_reported() {
    let mock = mock_provider();
    mock.fail_creation("vfxt-03", "quota exceeded");
    mock.fail_deletion("vfxt-02");
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let mut cluster = running_cluster(&mock, "vfxt", 1);

    let err = scaler()
        .add_cluster_nodes(&pool, &mut cluster, 2, &ScaleOptions::default())
        .await
        .unwrap_err();
    match err {
        ClusterError::ScaleOut {
            failures,
            rollback_errors,
        } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(rollback_errors.len(), 1);
            assert!(rollback_errors[0].starts_with("vfxt-02: "), "{:?}", rollback_errors);
        }
        other => panic!("expected ScaleOut, got {:?}", other),
    }
    assert_eq!(cluster.nodes.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded_by_the_worker_count() {
    let mock = MockProvider::new().with_latency(Duration::from_millis(20));
    mock.add_template(common::TEMPLATE);
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let mut cluster = running_cluster(&mock, "vfxt", 1);

    scaler()
        .add_cluster_nodes(&pool, &mut cluster, 10, &ScaleOptions::default())
        .await
        .unwrap();

    assert_eq!(cluster.nodes.len(), 11);
    assert!(mock.max_concurrent_creates() <= MAX_WORKERS);
    assert!(mock.max_concurrent_creates() >= 2);
    // One connection per worker, never more.
    assert_eq!(pool.opened(), MAX_WORKERS);
}

#[tokio::test]
async fn test_small_requests_spawn_fewer_workers() {
    let mock = mock_provider();
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let mut cluster = running_cluster(&mock, "vfxt", 1);

    scaler()
        .add_cluster_nodes(&pool, &mut cluster, 1, &ScaleOptions::default())
        .await
        .unwrap();
    assert_eq!(pool.opened(), 1);
}

#[tokio::test]
async fn test_connection_failures_fail_every_node() {
    let mock = mock_provider();
    let pool = ConnectionPool::new(|| Err(anyhow::anyhow!("endpoint unreachable")));
    let mut cluster = running_cluster(&mock, "vfxt", 1);

    let err = scaler()
        .add_cluster_nodes(&pool, &mut cluster, 2, &ScaleOptions::default())
        .await
        .unwrap_err();
    match err {
        ClusterError::ScaleOut { failures, .. } => {
            assert_eq!(failures.len(), 2);
            assert!(failures.iter().all(|f| f.contains("endpoint unreachable")));
        }
        other => panic!("expected ScaleOut, got {:?}", other),
    }
    assert_eq!(cluster.nodes.len(), 1);
}
