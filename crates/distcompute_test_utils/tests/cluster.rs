use std::time::Duration;

use distcompute_coordinator::JobError;
use distcompute_protocol::config::SystemConfig;
use distcompute_protocol::{ArgValue, FunctionId};
use distcompute_test_utils::{spawn_test_cluster, spawn_test_cluster_with_config};

#[tokio::test]
async fn s1_single_worker_square_map() {
    let cluster = spawn_test_cluster(1, 4).await.unwrap();
    let inputs = vec![
        ArgValue::Int(1),
        ArgValue::Int(2),
        ArgValue::Int(3),
        ArgValue::Int(4),
        ArgValue::Int(5),
    ];
    let results = cluster
        .dispatcher
        .map(FunctionId::new("square"), inputs, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        results,
        vec![
            ArgValue::Int(1),
            ArgValue::Int(4),
            ArgValue::Int(9),
            ArgValue::Int(16),
            ArgValue::Int(25),
        ]
    );
}

#[tokio::test]
async fn s2_three_workers_identity_over_range_preserves_order_and_counts() {
    let cluster = spawn_test_cluster(3, 8).await.unwrap();
    let n = 1000;
    let inputs: Vec<ArgValue> = (0..n as i64).map(ArgValue::Int).collect();
    let results = cluster
        .dispatcher
        .map(FunctionId::new("identity"), inputs, Duration::from_secs(10))
        .await
        .unwrap();

    let expected: Vec<ArgValue> = (0..n as i64).map(ArgValue::Int).collect();
    assert_eq!(results, expected);

    let stats = cluster.dispatcher.stats().await;
    assert_eq!(stats.tasks_completed_total, n as u64);
}

#[tokio::test]
async fn s3_job_survives_worker_death_mid_flight() {
    let mut cluster = spawn_test_cluster(2, 4).await.unwrap();
    let n = 100;
    let inputs: Vec<ArgValue> = (0..n as i64).map(ArgValue::Int).collect();

    let dispatcher = cluster.dispatcher.clone();
    let map_task = tokio::spawn(async move {
        dispatcher
            .map(FunctionId::new("identity"), inputs, Duration::from_secs(15))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.kill_worker(0).await;

    let results = map_task.await.unwrap().unwrap();
    let expected: Vec<ArgValue> = (0..n as i64).map(ArgValue::Int).collect();
    assert_eq!(results, expected);
}

#[tokio::test]
async fn s4_task_error_fails_job_with_index_and_message() {
    let cluster = spawn_test_cluster(1, 4).await.unwrap();
    let inputs = vec![ArgValue::Int(1), ArgValue::Int(2), ArgValue::Int(3)];
    let err = cluster
        .dispatcher
        .map(FunctionId::new("fail"), inputs, Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        JobError::Failed { message, .. } => {
            assert!(message.contains("fail() called with"));
        }
        other => panic!("expected JobError::Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn s5_slow_task_times_out() {
    let cluster = spawn_test_cluster(1, 4).await.unwrap();
    let inputs = vec![ArgValue::Int(10_000)];
    let err = cluster
        .dispatcher
        .map(
            FunctionId::new("sleep_ms"),
            inputs,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::TimedOut { completed: 0 }));
}

#[tokio::test]
async fn s6_large_payload_round_trips_via_chunking() {
    let cluster = spawn_test_cluster(1, 1).await.unwrap();
    let big: Vec<i64> = (0..2_000_000).collect();
    let inputs = vec![ArgValue::IntVec(big)];

    let results = cluster
        .dispatcher
        .map(FunctionId::new("identity"), inputs, Duration::from_secs(30))
        .await
        .unwrap();

    match &results[0] {
        ArgValue::IntVec(v) => assert_eq!(v.len(), 2_000_000),
        other => panic!("expected IntVec, got {other:?}"),
    }
}

#[tokio::test]
async fn auth_rejects_worker_with_wrong_token() {
    let config = SystemConfig {
        shared_token: Some("secret".to_string()),
        ..SystemConfig::default()
    };
    let cluster = spawn_test_cluster_with_config(0, 4, config).await.unwrap();

    use distcompute_protocol::config::WorkerRuntimeConfig;
    use distcompute_worker::{FunctionRegistry, WorkerClient};

    let mut worker_config =
        WorkerRuntimeConfig::new(cluster.addr.to_string(), "rogue-worker".to_string());
    worker_config.token = Some("wrong".to_string());
    let client = WorkerClient::new(worker_config, FunctionRegistry::with_builtins());

    let err = client.run().await.unwrap_err();
    assert!(format!("{err}").contains("rejected"));
}
