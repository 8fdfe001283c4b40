//! HTTP client for the secrets server, readiness polling and leader lookup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::protocol::{HealthResponse, LeaderResponse};
use common::{Error, Result};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

/// Interval between two health checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Every non-active state is remapped to 299 so the body is always returned.
const HEALTH_QUERY: &[(&str, &str)] = &[
    ("standbycode", "299"),
    ("sealedcode", "299"),
    ("uninitcode", "299"),
    ("perfstandbyok", "true"),
    ("performancestandbycode", "299"),
    ("drsecondarycode", "299"),
];

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VaultApi: Send + Sync {
    async fn health(&self) -> Result<HealthResponse>;
    async fn leader(&self) -> Result<LeaderResponse>;
}

/// Server client addressed through the connection binding. TLS
/// verification is skipped; the snapshot CLI gets the CA bundle instead.
pub struct VaultClient {
    http: reqwest::Client,
    address: String,
}

impl VaultClient {
    pub fn new(address: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("server http client: {e}")))?;
        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{path}", self.address);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("GET {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Connectivity(format!("GET {url}: {status}")));
        }
        resp.json()
            .await
            .map_err(|e| Error::Connectivity(format!("GET {url}: unreadable response: {e}")))
    }
}

#[async_trait]
impl VaultApi for VaultClient {
    async fn health(&self) -> Result<HealthResponse> {
        self.get_json("/v1/sys/health", HEALTH_QUERY).await
    }

    async fn leader(&self) -> Result<LeaderResponse> {
        self.get_json("/v1/sys/leader", &[]).await
    }
}

/// Builds a server client for an address.
pub trait VaultConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn VaultApi>>;
}

/// Connects with [`VaultClient`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl VaultConnector for HttpConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn VaultApi>> {
        Ok(Arc::new(VaultClient::new(address)?))
    }
}

/// Poll `sys/health` until the server reports unsealed.
///
/// The first check runs immediately, later ones every [`POLL_INTERVAL`].
/// Connectivity failures and sealed responses are retried; any other error
/// ends the wait. The whole poll is bounded by `timeout`.
pub async fn wait_until_ready(api: &dyn VaultApi, timeout: Duration) -> Result<HealthResponse> {
    info!(timeout_secs = timeout.as_secs(), "waiting for the server to be ready");

    let poll = async {
        let mut ticker = time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempt: u32 = 0;
        loop {
            ticker.tick().await;
            attempt += 1;
            match api.health().await {
                Ok(health) if !health.sealed => {
                    info!(attempt, version = %health.version, "server is unsealed and accepting connections");
                    return Ok(health);
                }
                Ok(_) => info!(attempt, "server is sealed; retrying"),
                Err(e) if e.is_retryable() => warn!(attempt, error = %e, "server unreachable; retrying"),
                Err(e) => return Err(e),
            }
        }
    };

    time::timeout(timeout, poll).await.map_err(|_| {
        Error::DeadlineExceeded(format!("server not ready after {}s", timeout.as_secs()))
    })?
}

/// Service address of the raft leader.
///
/// `cluster_address` is the leader's cluster address such as
/// `https://vault-0.vault-internal:8201`; its host part is rebuilt into
/// `<scheme>://<host>.<namespace>.svc:<port>`.
pub fn leader_address(cluster_address: &str, scheme: &str, namespace: &str, port: u16) -> Result<String> {
    if cluster_address.is_empty() {
        return Err(Error::Connectivity("leader address is empty".into()));
    }
    let start = cluster_address.rfind('/').map_or(0, |i| i + 1);
    let end = cluster_address.rfind(':').filter(|&i| i >= start).unwrap_or(cluster_address.len());
    let host = &cluster_address[start..end];
    if host.is_empty() {
        return Err(Error::Connectivity(format!(
            "no host in leader address {cluster_address:?}"
        )));
    }
    Ok(format!("{scheme}://{host}.{namespace}.svc:{port}"))
}

/// Ask the server for its leader and build the address to talk to.
pub async fn resolve_leader(api: &dyn VaultApi, scheme: &str, namespace: &str, port: u16) -> Result<String> {
    let leader = api.leader().await?;
    let address = leader_address(&leader.leader_cluster_address, scheme, namespace, port)?;
    info!(leader = %address, "resolved leader address");
    Ok(address)
}
