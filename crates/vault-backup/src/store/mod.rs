//! Unseal-key stores.
//!
//! Every place the unsealer can keep the root token and unseal-key shares
//! is wrapped behind [`UnsealKeyStore`]. [`new_store`] picks the backend
//! from a [`StoreConfig`], which has exactly one variant by construction.
//!
//! | Variant            | Protection                          | Persisted in           |
//! |--------------------|-------------------------------------|------------------------|
//! | `KubernetesSecret` | the Secret itself                   | Secret data key        |
//! | `GoogleKmsGcs`     | Cloud KMS symmetric key + CRC32C    | GCS object per key     |
//! | `AwsKmsSsm`        | KMS with encryption context         | SSM String parameter   |
//! | `AzureKeyVault`    | Key Vault                           | Key Vault secret       |
//!
//! The interim working directory is also a store ([`interim::InterimDirStore`]),
//! which lets backup export and restore import share [`migrate_keys`].

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod interim;
pub mod k8s;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use common::{Error, Result};
use tracing::{debug, info};

use crate::binding::{AwsKmsSsmSpec, AzureKeyVaultSpec, GoogleKmsGcsSpec, KubernetesSecretSpec, ModeSpec};
use crate::cluster::Cluster;
use crate::keys::KeySet;

/// Uniform get/set contract over one key-material backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UnsealKeyStore: Send + Sync {
    /// Fetch (and decrypt, where applicable) the value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if nothing is stored under `key`,
    /// [`Error::Decrypt`] / [`Error::Integrity`] if the ciphertext cannot be
    /// turned back into the original value.
    async fn get(&self, key: &str) -> Result<String>;

    /// Store `value` under `key`, overwriting any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Source of OAuth2 bearer tokens for the REST-based backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

/// Backend selection with its connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    KubernetesSecret(KubernetesSecretSpec),
    GoogleKmsGcs(GoogleKmsGcsSpec),
    AwsKmsSsm(AwsKmsSsmSpec),
    AzureKeyVault(AzureKeyVaultSpec),
}

impl StoreConfig {
    pub fn mode_name(&self) -> &'static str {
        match self {
            StoreConfig::KubernetesSecret(_) => "kubernetesSecret",
            StoreConfig::GoogleKmsGcs(_) => "googleKmsGcs",
            StoreConfig::AwsKmsSsm(_) => "awsKmsSsm",
            StoreConfig::AzureKeyVault(_) => "azureKeyVault",
        }
    }
}

impl TryFrom<ModeSpec> for StoreConfig {
    type Error = Error;

    /// Zero or several populated modes are both rejected.
    fn try_from(mode: ModeSpec) -> Result<Self> {
        let mut selected = Vec::with_capacity(1);
        if let Some(spec) = mode.kubernetes_secret {
            selected.push(StoreConfig::KubernetesSecret(spec));
        }
        if let Some(spec) = mode.google_kms_gcs {
            selected.push(StoreConfig::GoogleKmsGcs(spec));
        }
        if let Some(spec) = mode.aws_kms_ssm {
            selected.push(StoreConfig::AwsKmsSsm(spec));
        }
        if let Some(spec) = mode.azure_key_vault {
            selected.push(StoreConfig::AzureKeyVault(spec));
        }

        match selected.len() {
            0 => Err(Error::UnknownMode("no unseal mode is set".into())),
            1 => Ok(selected.remove(0)),
            _ => {
                let names: Vec<_> = selected.iter().map(StoreConfig::mode_name).collect();
                Err(Error::UnknownMode(format!(
                    "exactly one unseal mode must be set, found {}",
                    names.join(", ")
                )))
            }
        }
    }
}

/// Build the backend selected by `config`.
///
/// Credential Secrets named by the config are read from `namespace`.
pub async fn new_store(
    config: StoreConfig,
    cluster: Arc<dyn Cluster>,
    namespace: &str,
) -> Result<Box<dyn UnsealKeyStore>> {
    info!(mode = config.mode_name(), namespace, "creating unseal key store");
    let store: Box<dyn UnsealKeyStore> = match config {
        StoreConfig::KubernetesSecret(spec) => {
            Box::new(k8s::KubernetesSecretStore::new(cluster, namespace, spec)?)
        }
        StoreConfig::GoogleKmsGcs(spec) => {
            Box::new(gcp::GoogleKmsGcsStore::connect(cluster.as_ref(), namespace, spec).await?)
        }
        StoreConfig::AwsKmsSsm(spec) => {
            Box::new(aws::AwsKmsSsmStore::connect(cluster.as_ref(), namespace, spec).await?)
        }
        StoreConfig::AzureKeyVault(spec) => {
            Box::new(azure::AzureKeyVaultStore::connect(cluster.as_ref(), namespace, spec).await?)
        }
    };
    Ok(store)
}

/// Name of the credential Secret a backend requires.
/// Upper bound on every cloud KMS, object-storage and key-vault call.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("http client: {e}")))
}

pub(crate) fn credential_secret_name(
    mode: &str,
    reference: Option<&crate::binding::LocalObjectReference>,
) -> Result<String> {
    reference
        .map(|r| r.name.clone())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Config(format!("{mode}: credentialSecretRef is not set")))
}

/// Copy every key of `from_keys` out of `source` into `destination` under the
/// name at the same position in `to_keys`.
///
/// The first failing read or write aborts the copy.
pub async fn migrate_keys(
    source: &dyn UnsealKeyStore,
    from_keys: &KeySet,
    destination: &dyn UnsealKeyStore,
    to_keys: &KeySet,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        from_keys.len() == to_keys.len(),
        "key sets differ in size: {} vs {}",
        from_keys.len(),
        to_keys.len()
    );

    for (from, to) in from_keys.zip(to_keys) {
        let value = source
            .get(from)
            .await
            .with_context(|| format!("failed to read key {from}"))?;
        destination
            .set(to, &value)
            .await
            .with_context(|| format!("failed to write key {to}"))?;
        debug!(from, to, "key copied");
    }

    info!(keys = to_keys.len(), "unseal keys and root token copied");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::binding::LocalObjectReference;
    use crate::cluster::fake::FakeCluster;

    fn k8s_mode() -> KubernetesSecretSpec {
        KubernetesSecretSpec { secret_name: "vault-keys".into() }
    }

    #[test]
    fn single_mode_is_selected() {
        let mode = ModeSpec {
            kubernetes_secret: Some(k8s_mode()),
            ..Default::default()
        };
        assert_eq!(
            StoreConfig::try_from(mode).unwrap(),
            StoreConfig::KubernetesSecret(k8s_mode())
        );
    }

    #[tokio::test]
    async fn stalled_provider_call_times_out() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let http = http_client(Duration::from_millis(100)).unwrap();
        let err = http.get(server.uri()).send().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn zero_modes_is_unknown_mode() {
        let err = StoreConfig::try_from(ModeSpec::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownMode(_)));
    }

    #[test]
    fn two_modes_is_unknown_mode_naming_both() {
        let mode = ModeSpec {
            kubernetes_secret: Some(k8s_mode()),
            aws_kms_ssm: Some(AwsKmsSsmSpec::default()),
            ..Default::default()
        };
        let err = StoreConfig::try_from(mode).unwrap_err();
        assert!(matches!(err, Error::UnknownMode(_)));
        let msg = err.to_string();
        assert!(msg.contains("kubernetesSecret") && msg.contains("awsKmsSsm"));
    }

    #[tokio::test]
    async fn factory_builds_kubernetes_store() {
        let cluster = Arc::new(
            FakeCluster::default().with_secret("demo", "vault-keys", &[("p-root-token", "s.root")]),
        );
        let store = new_store(StoreConfig::KubernetesSecret(k8s_mode()), cluster, "demo")
            .await
            .unwrap();
        assert_eq!(store.get("p-root-token").await.unwrap(), "s.root");
    }

    #[tokio::test]
    async fn factory_rejects_missing_credential_reference() {
        let cluster = Arc::new(FakeCluster::default());
        let spec = GoogleKmsGcsSpec {
            bucket: "b".into(),
            ..Default::default()
        };
        let err = new_store(StoreConfig::GoogleKmsGcs(spec), cluster, "demo")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn credential_secret_name_requires_non_empty_reference() {
        assert!(credential_secret_name("m", None).is_err());
        let empty = LocalObjectReference::default();
        assert!(credential_secret_name("m", Some(&empty)).is_err());
        let named = LocalObjectReference { name: "cred".into() };
        assert_eq!(credential_secret_name("m", Some(&named)).unwrap(), "cred");
    }

    #[tokio::test]
    async fn migration_renames_keys_and_leaves_source_untouched() {
        let old = MemoryStore::with(&[("p-root-token", "A"), ("p-unseal-key-0", "B")]);
        let new = MemoryStore::default();

        migrate_keys(&old, &KeySet::build("p", 1), &new, &KeySet::build("q", 1))
            .await
            .unwrap();

        let migrated = new.snapshot();
        assert_eq!(migrated.len(), 2);
        assert_eq!(migrated["q-root-token"], "A");
        assert_eq!(migrated["q-unseal-key-0"], "B");
        assert_eq!(old.snapshot()["p-root-token"], "A");
        assert_eq!(old.snapshot()["p-unseal-key-0"], "B");
    }

    #[tokio::test]
    async fn migration_stops_at_first_failed_read() {
        // unseal-key-0 is missing; unseal-key-1 must never be written.
        let old = MemoryStore::with(&[("p-root-token", "A"), ("p-unseal-key-1", "C")]);
        let new = MemoryStore::default();

        let err = migrate_keys(&old, &KeySet::build("p", 2), &new, &KeySet::build("q", 2))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("p-unseal-key-0"));
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
        let written = new.snapshot();
        assert_eq!(written.len(), 1);
        assert!(written.contains_key("q-root-token"));
    }

    #[tokio::test]
    async fn migration_stops_at_first_failed_write() {
        let old = MemoryStore::with(&[("p-root-token", "A"), ("p-unseal-key-0", "B")]);
        let mut dest = MockUnsealKeyStore::new();
        dest.expect_set()
            .times(1)
            .returning(|key, _| Err(Error::Write(key.to_string())));

        let err = migrate_keys(&old, &KeySet::build("p", 1), &dest, &KeySet::build("q", 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("q-root-token"));
    }
}
