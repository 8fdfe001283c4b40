//! Connection binding (`AppBinding`) and server (`VaultServer`) models.
//!
//! Only the fields this tool reads are modelled; everything else in the
//! objects is ignored on deserialisation.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use common::{Error, Result};
use serde::Deserialize;
use tracing::warn;

use crate::cluster::{required_secret, Cluster, SecretData};

/// The only storage backend that supports snapshot save/restore.
pub const RAFT_BACKEND: &str = "raft";

/// Data key of the backup-token Secret holding the token.
pub const TOKEN_DATA_KEY: &str = "token";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ObjectMeta {
    name: String,
    namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Object<S> {
    metadata: ObjectMeta,
    spec: S,
}

// ---------------------------------------------------------------------------
// AppBinding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppBinding {
    pub name: String,
    pub namespace: String,
    pub spec: AppBindingSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppBindingSpec {
    pub client_config: ClientConfig,
    /// Raw server configuration; see [`VaultServerConfiguration`].
    pub parameters: Option<serde_json::Value>,
    pub secret_transforms: Vec<SecretTransform>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub url: Option<String>,
    pub service: Option<ServiceReference>,
    /// Base64-encoded PEM bundle.
    pub ca_bundle: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceReference {
    pub scheme: String,
    pub name: String,
    pub port: u16,
    pub path: Option<String>,
}

impl AppBinding {
    /// Build from the JSON form of the Kubernetes object.
    pub fn from_object(value: serde_json::Value) -> Result<Self> {
        let obj: Object<AppBindingSpec> = serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("malformed AppBinding: {e}")))?;
        Ok(Self {
            name: obj.metadata.name,
            namespace: obj.metadata.namespace,
            spec: obj.spec,
        })
    }

    /// Base URL of the server.
    pub fn url(&self) -> Result<String> {
        let cc = &self.spec.client_config;
        if let Some(url) = cc.url.as_deref().filter(|u| !u.is_empty()) {
            return Ok(url.to_string());
        }
        let svc = self.service()?;
        let mut url = format!("{}://{}.{}.svc", svc.scheme, svc.name, self.namespace);
        if svc.port != 0 {
            url.push_str(&format!(":{}", svc.port));
        }
        if let Some(path) = svc.path.as_deref() {
            url.push_str(path);
        }
        Ok(url)
    }

    /// Port the server listens on.
    pub fn port(&self) -> Result<u16> {
        if let Some(svc) = &self.spec.client_config.service {
            if svc.port != 0 {
                return Ok(svc.port);
            }
        }
        let url = self.url()?;
        let authority = url
            .split_once("://")
            .map_or(url.as_str(), |(_, rest)| rest)
            .split('/')
            .next()
            .unwrap_or_default();
        authority
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .ok_or_else(|| Error::Config(format!("AppBinding {}: no port in {url}", self.qualified())))
    }

    /// URL scheme used to reach the server.
    pub fn scheme(&self) -> Result<String> {
        if let Some(svc) = &self.spec.client_config.service {
            if !svc.scheme.is_empty() {
                return Ok(svc.scheme.clone());
            }
        }
        let url = self.url()?;
        url.split_once("://")
            .map(|(scheme, _)| scheme.to_string())
            .ok_or_else(|| Error::Config(format!("AppBinding {}: no scheme in {url}", self.qualified())))
    }

    /// Decoded CA bundle, if the binding carries one.
    pub fn ca_bundle(&self) -> Result<Option<Vec<u8>>> {
        match self.spec.client_config.ca_bundle.as_deref() {
            None | Some("") => Ok(None),
            Some(encoded) => B64
                .decode(encoded)
                .map(Some)
                .map_err(|e| Error::Config(format!("AppBinding {}: caBundle: {e}", self.qualified()))),
        }
    }

    /// Server configuration from `spec.parameters`.
    ///
    /// Malformed parameters are logged and the defaults are used.
    pub fn parameters(&self) -> VaultServerConfiguration {
        let Some(raw) = self.spec.parameters.clone() else {
            return VaultServerConfiguration::default();
        };
        serde_json::from_value(raw).unwrap_or_else(|e| {
            warn!(
                binding = %self.qualified(),
                error = %e,
                "unable to parse binding parameters; using defaults"
            );
            VaultServerConfiguration::default()
        })
    }

    /// Apply `spec.secretTransforms` to the data of a Secret, in order.
    pub async fn transform_secret(&self, cluster: &dyn Cluster, data: &mut SecretData) -> Result<()> {
        for transform in &self.spec.secret_transforms {
            transform.apply(cluster, &self.namespace, data).await?;
        }
        Ok(())
    }

    fn service(&self) -> Result<&ServiceReference> {
        self.spec
            .client_config
            .service
            .as_ref()
            .ok_or_else(|| {
                Error::Config(format!(
                    "AppBinding {}: clientConfig has neither url nor service",
                    self.qualified()
                ))
            })
    }

    pub fn qualified(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Secret transforms
// ---------------------------------------------------------------------------

/// One transformation step; exactly one field is expected to be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecretTransform {
    pub rename_key: Option<RenameKey>,
    pub add_key: Option<AddKey>,
    pub add_keys_from: Option<AddKeysFrom>,
    pub remove_key: Option<RemoveKey>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenameKey {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AddKey {
    pub key: String,
    /// Base64-encoded value.
    pub value: Option<String>,
    pub string_value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AddKeysFrom {
    pub secret_ref: LocalObjectReference,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoveKey {
    pub key: String,
}

impl SecretTransform {
    async fn apply(&self, cluster: &dyn Cluster, namespace: &str, data: &mut SecretData) -> Result<()> {
        if let Some(rename) = &self.rename_key {
            if let Some(value) = data.remove(&rename.from) {
                data.insert(rename.to.clone(), value);
            }
        }
        if let Some(add) = &self.add_key {
            let value = match (&add.string_value, &add.value) {
                (Some(s), _) => s.as_bytes().to_vec(),
                (None, Some(encoded)) => B64
                    .decode(encoded)
                    .map_err(|e| Error::Config(format!("addKey {}: {e}", add.key)))?,
                (None, None) => Vec::new(),
            };
            data.insert(add.key.clone(), value);
        }
        if let Some(from) = &self.add_keys_from {
            let source = required_secret(cluster, namespace, &from.secret_ref.name).await?;
            data.extend(source);
        }
        if let Some(remove) = &self.remove_key {
            data.remove(&remove.key);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server configuration parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultServerConfiguration {
    /// Storage backend kind, e.g. `raft`.
    pub backend: String,
    pub backup_token_secret_ref: Option<LocalObjectReference>,
    pub unsealer: Option<UnsealerSpec>,
}

impl VaultServerConfiguration {
    /// Name of the Secret holding the backup token.
    pub fn backup_token_secret(&self, binding_name: &str) -> String {
        self.backup_token_secret_ref
            .as_ref()
            .map(|r| r.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{binding_name}-backup-token"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsealerSpec {
    #[serde(default = "default_secret_shares")]
    pub secret_shares: u32,
    #[serde(default = "default_secret_threshold")]
    pub secret_threshold: u32,
    #[serde(default)]
    pub mode: ModeSpec,
}

fn default_secret_shares() -> u32 {
    5
}
fn default_secret_threshold() -> u32 {
    3
}

/// Where the unsealer keeps the unseal keys and root token.
///
/// Exactly one field is expected to be set; see
/// [`crate::store::StoreConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModeSpec {
    pub kubernetes_secret: Option<KubernetesSecretSpec>,
    pub google_kms_gcs: Option<GoogleKmsGcsSpec>,
    pub aws_kms_ssm: Option<AwsKmsSsmSpec>,
    pub azure_key_vault: Option<AzureKeyVaultSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesSecretSpec {
    pub secret_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GoogleKmsGcsSpec {
    pub bucket: String,
    pub kms_crypto_key: String,
    pub kms_key_ring: String,
    pub kms_location: String,
    pub kms_project: String,
    pub credential_secret_ref: Option<LocalObjectReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AwsKmsSsmSpec {
    #[serde(rename = "kmsKeyID")]
    pub kms_key_id: String,
    pub ssm_key_prefix: String,
    pub region: String,
    pub credential_secret_ref: Option<LocalObjectReference>,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AzureKeyVaultSpec {
    #[serde(rename = "vaultBaseURL")]
    pub vault_base_url: String,
    pub cloud: String,
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    pub credential_secret_ref: Option<LocalObjectReference>,
    pub use_managed_identity: bool,
}

// ---------------------------------------------------------------------------
// VaultServer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VaultServer {
    pub name: String,
    pub namespace: String,
    pub spec: VaultServerSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VaultServerSpec {
    /// One-of map keyed by backend kind (`raft`, `consul`, ...).
    pub backend: serde_json::Map<String, serde_json::Value>,
}

impl VaultServer {
    pub fn from_object(value: serde_json::Value) -> Result<Self> {
        let obj: Object<VaultServerSpec> = serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("malformed VaultServer: {e}")))?;
        Ok(Self {
            name: obj.metadata.name,
            namespace: obj.metadata.namespace,
            spec: obj.spec,
        })
    }

    /// Backend kinds configured on the server.
    pub fn backend_kinds(&self) -> Vec<&str> {
        self.spec
            .backend
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn is_raft(&self) -> bool {
        self.backend_kinds() == [RAFT_BACKEND]
    }
}
