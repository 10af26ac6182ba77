//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use health_check_pool::config::{CoordinatorConfig, TransitionPolicy};
use health_check_pool::coordinator::{CheckContext, CheckError, CheckExecutor, CheckTarget};
use health_check_pool::inventory::NewNode;
use health_check_pool::pool::NewCredential;
use health_check_pool::proxy::{NewProxy, Proxy};
use health_check_pool::{Database, Services};

/// Services over a database file in a private temp directory.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub services: Services,
}

impl TestEnv {
    pub fn new(config: CoordinatorConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config;
        config.database.path = dir.path().join("hc.db");
        let services = Services::start(config).unwrap();
        Self { dir, services }
    }

    /// A second, independent connection to the same file, as another process would have.
    pub fn second_process(&self, config: CoordinatorConfig) -> Services {
        let db = Database::open(&self.dir.path().join("hc.db")).unwrap();
        Services::with_database(db, config)
    }
}

/// Short waits so timeouts resolve quickly in tests.
pub fn fast_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.pool.poll_interval_ms = 20;
    config.pool.max_wait_ms = 300;
    config.checks.check_timeout_secs = 5;
    config.status.transition_policy = TransitionPolicy::Strict;
    config
}

pub async fn seed_credentials(services: &Services, credentials: &[(&str, u32)]) {
    for (username, max_sessions) in credentials {
        services
            .pool
            .upsert_credential(NewCredential {
                username: username.to_string(),
                secret: "secret".into(),
                target_ip: "10.0.0.10".into(),
                target_port: 22,
                max_sessions: *max_sessions,
                enabled: true,
            })
            .await
            .unwrap();
    }
}

pub async fn seed_proxies(services: &Services, proxies: &[(&str, i64)]) {
    for (name, priority) in proxies {
        services
            .proxies
            .upsert_proxy(NewProxy {
                name: name.to_string(),
                ip: "192.168.50.1".into(),
                port: 3128,
                user: "relay".into(),
                priority: *priority,
                is_primary: false,
                is_active: true,
            })
            .await
            .unwrap();
    }
}

pub async fn seed_nodes(services: &Services, count: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..count {
        let id = format!("node-{:02}", i);
        services
            .inventory
            .upsert_node(NewNode {
                id: id.clone(),
                address: format!("10.20.0.{}", i + 1),
                hostname: format!("edge-{}", i),
                site: "dc1".into(),
                group: "north".into(),
                vendor: "unknown".into(),
                node_type: "router".into(),
                priority: 0,
                health_check_enabled: true,
                login_enabled: true,
            })
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

/// Executor whose checks block until a permit is released on `gate`.
pub struct GatedExecutor {
    pub gate: Arc<Semaphore>,
    pub runs: AtomicUsize,
}

impl GatedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(Semaphore::new(0)),
            runs: AtomicUsize::new(0),
        })
    }

    pub fn open(&self, checks: usize) {
        self.gate.add_permits(checks);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckExecutor for GatedExecutor {
    async fn connect(&self, _target: &CheckTarget, _proxy: &Proxy) -> Result<(), CheckError> {
        Ok(())
    }

    async fn run(&self, _ctx: &CheckContext) -> Result<(), CheckError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.gate.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(CheckError::Node("gate closed".into())),
        }
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
