//! Credential pool properties under concurrent sessions.

use std::sync::Arc;
use std::time::Duration;

use health_check_pool::HcError;

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_is_never_exceeded() {
    let env = common::TestEnv::new(common::fast_config());
    common::seed_credentials(&env.services, &[("alice", 2), ("bob", 2), ("carol", 2)]).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let pool = env.services.pool.clone();
        handles.push(tokio::spawn(async move {
            pool.acquire(&format!("session-{}", i)).await
        }));
    }

    let mut acquired = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => acquired += 1,
            Err(HcError::Timeout { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(acquired, 6);

    let status = env.services.pool.pool_status().await.unwrap();
    assert_eq!(status.used_capacity, 6);
    assert_eq!(status.available_capacity, 0);

    for name in ["alice", "bob", "carol"] {
        let credential = env.services.pool.get_credential(name).await.unwrap();
        assert_eq!(credential.current_sessions, 2);
        assert_eq!(credential.active_session_ids.len(), 2);
    }
}

#[tokio::test]
async fn test_waiting_session_gets_credential_after_release() {
    let mut config = common::fast_config();
    config.pool.max_wait_ms = 5_000;
    let env = common::TestEnv::new(config);
    common::seed_credentials(&env.services, &[("alice", 1)]).await;

    env.services.pool.acquire("A").await.unwrap();

    let pool = env.services.pool.clone();
    let waiter = tokio::spawn(async move { pool.acquire("B").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    assert!(env.services.pool.release("alice", "A").await.unwrap());

    let credential = waiter.await.unwrap().unwrap();
    assert_eq!(credential.username, "alice");
    assert_eq!(credential.current_sessions, 1);
    assert!(credential.active_session_ids.contains("B"));
    assert!(!credential.active_session_ids.contains("A"));
}

#[tokio::test]
async fn test_waiting_session_times_out_without_side_effects() {
    let env = common::TestEnv::new(common::fast_config());
    common::seed_credentials(&env.services, &[("alice", 1)]).await;
    env.services.pool.acquire("A").await.unwrap();

    let started = std::time::Instant::now();
    let err = env.services.pool.acquire("B").await.unwrap_err();
    assert!(matches!(err, HcError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(250));

    let credential = env.services.pool.get_credential("alice").await.unwrap();
    assert_eq!(credential.current_sessions, 1);
    assert_eq!(
        credential.active_session_ids.iter().collect::<Vec<_>>(),
        vec!["A"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_processes_share_capacity_through_the_store() {
    let mut config = common::fast_config();
    config.pool.serialize_attempts = false;
    let env = common::TestEnv::new(config.clone());
    common::seed_credentials(&env.services, &[("alice", 1), ("bob", 1)]).await;
    let other = env.second_process(config);

    let pools = [env.services.pool.clone(), other.pool.clone()];
    let mut handles = Vec::new();
    for i in 0..8 {
        let pool = Arc::clone(&pools[i % 2]);
        handles.push(tokio::spawn(async move {
            pool.acquire(&format!("p{}-session-{}", i % 2, i)).await.is_ok()
        }));
    }

    let mut acquired = 0;
    for handle in handles {
        if handle.await.unwrap() {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 2);
    assert_eq!(other.pool.pool_status().await.unwrap().used_capacity, 2);
}

#[tokio::test]
async fn test_release_then_acquire_restores_session_count() {
    let env = common::TestEnv::new(common::fast_config());
    common::seed_credentials(&env.services, &[("alice", 3)]).await;
    env.services.pool.acquire("keep").await.unwrap();

    for round in 0..5 {
        let session = format!("cycle-{}", round);
        env.services.pool.acquire(&session).await.unwrap();
        assert!(env.services.pool.release("alice", &session).await.unwrap());
    }

    let credential = env.services.pool.get_credential("alice").await.unwrap();
    assert_eq!(credential.current_sessions, 1);
    assert_eq!(credential.total_usage_count, 6);
}
