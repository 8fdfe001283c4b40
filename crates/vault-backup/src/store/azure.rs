//! Keys stored as Azure Key Vault secrets.
//!
//! Key Vault secret names may not contain `.`, so every `.` in a key is
//! replaced by `-`; callers always use the dotted form. Values are stored
//! base64-encoded with content type `password`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::gcp::http_error;
use super::{http_client, TokenSource, UnsealKeyStore, REQUEST_TIMEOUT};
use crate::binding::AzureKeyVaultSpec;
use crate::cluster::{required_secret, Cluster};

pub const CLIENT_ID: &str = "client-id";
pub const CLIENT_SECRET: &str = "client-secret";

const API_VERSION: &str = "7.4";
const CONTENT_TYPE: &str = "password";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Tokens are refreshed this long before they expire.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Key Vault secret name for `key`.
pub fn secret_name(key: &str) -> String {
    key.replace('.', "-")
}

/// Authority host and Key Vault resource of one Azure cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AzureCloud {
    pub authority: &'static str,
    pub vault_resource: &'static str,
}

impl AzureCloud {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "azurepubliccloud" | "azurecloud" => Ok(Self {
                authority: "https://login.microsoftonline.com",
                vault_resource: "https://vault.azure.net",
            }),
            "azurechinacloud" => Ok(Self {
                authority: "https://login.chinacloudapi.cn",
                vault_resource: "https://vault.azure.cn",
            }),
            "azureusgovernmentcloud" => Ok(Self {
                authority: "https://login.microsoftonline.us",
                vault_resource: "https://vault.usgovcloudapi.net",
            }),
            other => Err(Error::Config(format!("azureKeyVault: unknown cloud {other:?}"))),
        }
    }

    fn scope(&self) -> String {
        format!("{}/.default", self.vault_resource)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VaultSecrets: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String>;
    async fn set_secret(&self, name: &str, value: &str, content_type: &str) -> Result<()>;
}

pub struct AzureKeyVaultStore {
    secrets: Arc<dyn VaultSecrets>,
}

impl AzureKeyVaultStore {
    /// Pick a credential and build the Key Vault client.
    ///
    /// A credential Secret carrying `client-id` and `client-secret` selects
    /// the client-credentials flow against `tenantID`. Without them, or with
    /// `useManagedIdentity`, tokens come from the instance metadata service.
    pub async fn connect(cluster: &dyn Cluster, namespace: &str, spec: AzureKeyVaultSpec) -> Result<Self> {
        if spec.vault_base_url.trim().is_empty() {
            return Err(Error::Config("azureKeyVault: vaultBaseURL is not set".into()));
        }
        let cloud = AzureCloud::from_name(&spec.cloud)?;
        let http = http_client(REQUEST_TIMEOUT)?;

        let creds = match spec.credential_secret_ref.as_ref().filter(|r| !r.name.is_empty()) {
            Some(r) => Some(required_secret(cluster, namespace, &r.name).await?),
            None if spec.use_managed_identity => None,
            None => {
                return Err(Error::Config(
                    "azureKeyVault: credentialSecretRef is not set and useManagedIdentity is false".into(),
                ))
            }
        };

        let client_id = creds
            .as_ref()
            .and_then(|c| c.get(CLIENT_ID))
            .map(|v| String::from_utf8_lossy(v).into_owned());
        let client_secret = creds
            .as_ref()
            .and_then(|c| c.get(CLIENT_SECRET))
            .map(|v| String::from_utf8_lossy(v).into_owned());

        let tokens: Arc<dyn TokenSource> = match (client_id, client_secret) {
            (Some(id), Some(secret)) if !spec.use_managed_identity => {
                if spec.tenant_id.trim().is_empty() {
                    return Err(Error::Config("azureKeyVault: tenantID is not set".into()));
                }
                Arc::new(ClientSecretCredential::new(
                    http.clone(),
                    cloud.authority,
                    &spec.tenant_id,
                    id,
                    secret,
                    cloud.scope(),
                ))
            }
            (id, _) => {
                info!("using managed identity for key vault access");
                Arc::new(ManagedIdentityCredential::new(
                    http.clone(),
                    IMDS_ENDPOINT,
                    cloud.vault_resource,
                    id,
                ))
            }
        };

        let rest = KeyVaultRest::new(http, &spec.vault_base_url, tokens);
        Ok(Self::with_client(Arc::new(rest)))
    }

    pub fn with_client(secrets: Arc<dyn VaultSecrets>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl UnsealKeyStore for AzureKeyVaultStore {
    async fn get(&self, key: &str) -> Result<String> {
        let name = secret_name(key);
        let encoded = self.secrets.get_secret(&name).await?;
        let decoded = B64
            .decode(encoded.trim())
            .map_err(|e| Error::Decrypt(format!("key vault secret {name} is not base64: {e}")))?;
        String::from_utf8(decoded).map_err(|_| Error::Decrypt(format!("value of {key} is not valid UTF-8")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let name = secret_name(key);
        self.secrets
            .set_secret(&name, &B64.encode(value), CONTENT_TYPE)
            .await?;
        debug!(key, secret = %name, "key written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key Vault REST client
// ---------------------------------------------------------------------------

pub struct KeyVaultRest {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretBundle {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

impl KeyVaultRest {
    pub fn new(http: reqwest::Client, base_url: &str, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn secret_url(&self, name: &str) -> String {
        format!("{}/secrets/{}", self.base_url, urlencoding::encode(name))
    }
}

#[async_trait]
impl VaultSecrets for KeyVaultRest {
    async fn get_secret(&self, name: &str) -> Result<String> {
        let resp = self
            .http
            .get(self.secret_url(name))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(self.tokens.bearer_token().await?)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("key vault get {name}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(http_error(
                status,
                format!("key vault secret {name}: {status}"),
                Error::Connectivity,
            ));
        }
        let bundle: SecretBundle = resp
            .json()
            .await
            .map_err(|e| Error::Decrypt(format!("key vault secret {name}: {e}")))?;
        Ok(bundle.value)
    }

    async fn set_secret(&self, name: &str, value: &str, content_type: &str) -> Result<()> {
        let body = SecretBundle {
            value: value.to_string(),
            content_type: Some(content_type.to_string()),
        };
        let resp = self
            .http
            .put(self.secret_url(name))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(self.tokens.bearer_token().await?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Write(format!("unable to set secret {name} in key vault: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(http_error(
                status,
                format!("unable to set secret {name} in key vault: {status}"),
                Error::Write,
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds; a number for AAD, a string for IMDS.
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    fn lifetime(&self) -> Duration {
        let secs = match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        Duration::from_secs(secs.unwrap_or(300))
    }
}

#[derive(Default)]
struct CachedToken(Mutex<Option<(String, Instant)>>);

impl CachedToken {
    async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<TokenResponse>> + Send,
    {
        let mut slot = self.0.lock().await;
        if let Some((token, expires)) = slot.as_ref() {
            if Instant::now() + EXPIRY_SLACK < *expires {
                return Ok(token.clone());
            }
        }
        let fresh = fetch().await?;
        let expires = Instant::now() + fresh.lifetime();
        *slot = Some((fresh.access_token.clone(), expires));
        Ok(fresh.access_token)
    }
}

/// OAuth2 client-credentials flow against Azure AD.
pub struct ClientSecretCredential {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: CachedToken,
}

impl std::fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        authority: &str,
        tenant_id: &str,
        client_id: String,
        client_secret: String,
        scope: String,
    ) -> Self {
        Self {
            http,
            token_url: format!("{}/{tenant_id}/oauth2/v2.0/token", authority.trim_end_matches('/')),
            client_id,
            client_secret,
            scope,
            cache: CachedToken::default(),
        }
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("azure ad token: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Config(format!("azure ad token: {status}")));
        }
        resp.json()
            .await
            .map_err(|e| Error::Config(format!("azure ad token response: {e}")))
    }
}

#[async_trait]
impl TokenSource for ClientSecretCredential {
    async fn bearer_token(&self) -> Result<String> {
        self.cache.get_or_fetch(|| self.fetch()).await
    }
}

/// Tokens from the instance metadata service of the node.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    resource: String,
    client_id: Option<String>,
    cache: CachedToken,
}

impl ManagedIdentityCredential {
    pub fn new(http: reqwest::Client, endpoint: &str, resource: &str, client_id: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            resource: resource.to_string(),
            client_id,
            cache: CachedToken::default(),
        }
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let mut query = vec![
            ("api-version", "2018-02-01"),
            ("resource", self.resource.as_str()),
        ];
        if let Some(id) = self.client_id.as_deref() {
            query.push(("client_id", id));
        }
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&query)
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("managed identity token: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Config(format!("managed identity token: {status}")));
        }
        resp.json()
            .await
            .map_err(|e| Error::Config(format!("managed identity token response: {e}")))
    }
}

#[async_trait]
impl TokenSource for ManagedIdentityCredential {
    async fn bearer_token(&self) -> Result<String> {
        self.cache.get_or_fetch(|| self.fetch()).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use mockall::predicate::eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::binding::LocalObjectReference;
    use crate::cluster::fake::FakeCluster;
    use crate::store::MockTokenSource;

    #[derive(Default)]
    struct MemoryVault(StdMutex<HashMap<String, (String, String)>>);

    #[async_trait]
    impl VaultSecrets for MemoryVault {
        async fn get_secret(&self, name: &str) -> Result<String> {
            self.0
                .lock()
                .unwrap()
                .get(name)
                .map(|(v, _)| v.clone())
                .ok_or_else(|| Error::NotFound(name.to_string()))
        }
        async fn set_secret(&self, name: &str, value: &str, content_type: &str) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .insert(name.to_string(), (value.to_string(), content_type.to_string()));
            Ok(())
        }
    }

    fn tokens() -> Arc<MockTokenSource> {
        let mut t = MockTokenSource::new();
        t.expect_bearer_token().returning(|| Ok("eyJ.test".to_string()));
        Arc::new(t)
    }

    #[test]
    fn dots_become_dashes() {
        assert_eq!(
            secret_name("k8s.cluster.ns.name-root-token"),
            "k8s-cluster-ns-name-root-token"
        );
        assert_eq!(secret_name("plain-key"), "plain-key");
    }

    #[tokio::test]
    async fn dotted_keys_round_trip_under_dashed_names() {
        let vault = Arc::new(MemoryVault::default());
        let store = AzureKeyVaultStore::with_client(vault.clone());

        store.set("k8s.cluster.ns.name-root-token", "s.root").await.unwrap();
        let stored = vault.0.lock().unwrap()["k8s-cluster-ns-name-root-token"].clone();
        assert_eq!(stored, (B64.encode("s.root"), "password".to_string()));

        assert_eq!(store.get("k8s.cluster.ns.name-root-token").await.unwrap(), "s.root");
    }

    #[tokio::test]
    async fn get_uses_dashed_name() {
        let mut vault = MockVaultSecrets::new();
        vault
            .expect_get_secret()
            .with(eq("k8s---ns-v-unseal-key-0"))
            .returning(|_| Ok(B64.encode("share")));
        let store = AzureKeyVaultStore::with_client(Arc::new(vault));
        assert_eq!(store.get("k8s.-.ns.v-unseal-key-0").await.unwrap(), "share");
    }

    #[test]
    fn cloud_selection() {
        assert_eq!(
            AzureCloud::from_name("").unwrap().vault_resource,
            "https://vault.azure.net"
        );
        assert_eq!(
            AzureCloud::from_name("AzureChinaCloud").unwrap().authority,
            "https://login.chinacloudapi.cn"
        );
        assert_eq!(
            AzureCloud::from_name("AzureUSGovernmentCloud").unwrap().scope(),
            "https://vault.usgovcloudapi.net/.default"
        );
        assert!(AzureCloud::from_name("MarsCloud").is_err());
    }

    #[tokio::test]
    async fn rest_client_reads_secret_bundle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secrets/k8s-c-ns-v-root-token"))
            .and(query_param("api-version", API_VERSION))
            .and(header("authorization", "Bearer eyJ.test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": B64.encode("s.root"),
                "id": "https://kv/secrets/k8s-c-ns-v-root-token/abc",
            })))
            .mount(&server)
            .await;

        let rest = KeyVaultRest::new(reqwest::Client::new(), &server.uri(), tokens());
        let store = AzureKeyVaultStore::with_client(Arc::new(rest));
        assert_eq!(store.get("k8s.c.ns.v-root-token").await.unwrap(), "s.root");
    }

    #[tokio::test]
    async fn rest_client_writes_password_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/secrets/p-unseal-key-1"))
            .and(body_json(json!({ "value": B64.encode("k1"), "contentType": "password" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": B64.encode("k1") })))
            .expect(1)
            .mount(&server)
            .await;

        let rest = KeyVaultRest::new(reqwest::Client::new(), &server.uri(), tokens());
        AzureKeyVaultStore::with_client(Arc::new(rest))
            .set("p-unseal-key-1", "k1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let rest = KeyVaultRest::new(reqwest::Client::new(), &server.uri(), tokens());
        assert!(matches!(rest.get_secret("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn client_secret_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "aad-token",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cred = ClientSecretCredential::new(
            reqwest::Client::new(),
            &server.uri(),
            "tenant-1",
            "app".into(),
            "secret".into(),
            "https://vault.azure.net/.default".into(),
        );
        assert_eq!(cred.bearer_token().await.unwrap(), "aad-token");
        assert_eq!(cred.bearer_token().await.unwrap(), "aad-token");
        assert!(!format!("{cred:?}").contains("secret\""));
    }

    #[tokio::test]
    async fn managed_identity_sends_metadata_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .and(header("Metadata", "true"))
            .and(query_param("resource", "https://vault.azure.net"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "imds-token",
                "expires_in": "3599"
            })))
            .mount(&server)
            .await;

        let cred = ManagedIdentityCredential::new(
            reqwest::Client::new(),
            &format!("{}/metadata/identity/oauth2/token", server.uri()),
            "https://vault.azure.net",
            None,
        );
        assert_eq!(cred.bearer_token().await.unwrap(), "imds-token");
    }

    #[tokio::test]
    async fn connect_requires_credentials_or_managed_identity() {
        let cluster = FakeCluster::default();
        let spec = AzureKeyVaultSpec {
            vault_base_url: "https://kv.vault.azure.net".into(),
            tenant_id: "t".into(),
            ..Default::default()
        };
        let err = AzureKeyVaultStore::connect(&cluster, "demo", spec).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn connect_with_client_secret_needs_tenant() {
        let cluster = FakeCluster::default().with_secret(
            "demo",
            "azure-cred",
            &[(CLIENT_ID, "app"), (CLIENT_SECRET, "s3cr3t")],
        );
        let spec = AzureKeyVaultSpec {
            vault_base_url: "https://kv.vault.azure.net".into(),
            credential_secret_ref: Some(LocalObjectReference { name: "azure-cred".into() }),
            ..Default::default()
        };
        let err = AzureKeyVaultStore::connect(&cluster, "demo", spec).await.err().unwrap();
        assert!(err.to_string().contains("tenantID"));
    }
}
