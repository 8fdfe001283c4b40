//! Keys encrypted with AWS KMS and stored as SSM parameters.
//!
//! The parameter value is the base64 of the KMS ciphertext, stored as a
//! plain `String` parameter (SSM's own decryption is not used). Every KMS
//! call carries the encryption context `Tool=vault-unsealer`.

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::config::Region;
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_ssm::types::ParameterType;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use common::{Error, Result};
use tracing::{debug, info};

use super::{credential_secret_name, UnsealKeyStore};
use crate::binding::AwsKmsSsmSpec;
use crate::cluster::{required_secret, Cluster};

const CONTEXT_KEY: &str = "Tool";
const CONTEXT_VALUE: &str = "vault-unsealer";
const PARAMETER_DESCRIPTION: &str = "vault-unsealer";

pub const ACCESS_KEY: &str = "access_key";
pub const SECRET_KEY: &str = "secret_key";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Raw value of a parameter, `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<String>>;
    /// Create or overwrite a `String` parameter.
    async fn put(&self, name: &str, value: &str) -> Result<()>;
}

/// KMS bound to one key and the unsealer's encryption context.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsCipher: Send + Sync {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

pub struct AwsKmsSsmStore {
    kms: Arc<dyn KmsCipher>,
    ssm: Arc<dyn ParameterStore>,
    key_prefix: String,
}

impl AwsKmsSsmStore {
    /// Build SDK clients from the credential Secret.
    ///
    /// `access_key`/`secret_key` are used when both are present; otherwise
    /// the SDK's default credential chain applies (e.g. IRSA).
    pub async fn connect(cluster: &dyn Cluster, namespace: &str, spec: AwsKmsSsmSpec) -> Result<Self> {
        let secret_name = credential_secret_name("awsKmsSsm", spec.credential_secret_ref.as_ref())?;
        if spec.kms_key_id.trim().is_empty() {
            return Err(Error::Config("awsKmsSsm: kmsKeyID is not set".into()));
        }
        if spec.region.trim().is_empty() {
            return Err(Error::Config("awsKmsSsm: region is not set".into()));
        }

        let creds = required_secret(cluster, namespace, &secret_name).await?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(spec.region.clone()));
        match (creds.get(ACCESS_KEY), creds.get(SECRET_KEY)) {
            (Some(access), Some(secret)) => {
                let access = utf8_field(access, ACCESS_KEY)?;
                let secret = utf8_field(secret, SECRET_KEY)?;
                loader = loader.credentials_provider(aws_sdk_kms::config::Credentials::new(
                    access,
                    secret,
                    None,
                    None,
                    "credential-secret",
                ));
            }
            _ => info!(secret = %secret_name, "no static AWS keys in credential secret; using default chain"),
        }
        if !spec.endpoint.is_empty() {
            loader = loader.endpoint_url(&spec.endpoint);
        }
        let sdk = loader.load().await;

        let kms = AwsKms {
            client: aws_sdk_kms::Client::new(&sdk),
            key_id: spec.kms_key_id.clone(),
        };
        let ssm = AwsSsm {
            client: aws_sdk_ssm::Client::new(&sdk),
        };
        Ok(Self::with_clients(&spec, Arc::new(kms), Arc::new(ssm)))
    }

    pub fn with_clients(spec: &AwsKmsSsmSpec, kms: Arc<dyn KmsCipher>, ssm: Arc<dyn ParameterStore>) -> Self {
        Self {
            kms,
            ssm,
            key_prefix: spec.ssm_key_prefix.clone(),
        }
    }

    fn parameter_name(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

fn utf8_field(value: &[u8], field: &str) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|_| Error::Config(format!("{field} is not valid UTF-8")))
}

#[async_trait]
impl UnsealKeyStore for AwsKmsSsmStore {
    async fn get(&self, key: &str) -> Result<String> {
        let name = self.parameter_name(key);
        let encoded = self
            .ssm
            .get(&name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("ssm parameter {name}")))?;
        let ciphertext = B64
            .decode(encoded.trim())
            .map_err(|e| Error::Decrypt(format!("ssm parameter {name} is not base64: {e}")))?;
        let plaintext = self.kms.decrypt(&ciphertext).await?;
        String::from_utf8(plaintext).map_err(|_| Error::Decrypt(format!("plaintext of {key} is not valid UTF-8")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let name = self.parameter_name(key);
        let ciphertext = self.kms.encrypt(value.as_bytes()).await?;
        self.ssm.put(&name, &B64.encode(ciphertext)).await?;
        debug!(key, parameter = %name, "key written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SDK clients
// ---------------------------------------------------------------------------

pub struct AwsKms {
    client: aws_sdk_kms::Client,
    key_id: String,
}

#[async_trait]
impl KmsCipher for AwsKms {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let out = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(plaintext.to_vec()))
            .encryption_context(CONTEXT_KEY, CONTEXT_VALUE)
            .send()
            .await
            .map_err(|e| Error::Write(format!("kms encrypt: {}", DisplayErrorContext(&e))))?;
        out.ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| Error::Write("kms encrypt returned no ciphertext".into()))
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let out = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .encryption_context(CONTEXT_KEY, CONTEXT_VALUE)
            .send()
            .await
            .map_err(|e| Error::Decrypt(format!("kms decrypt: {}", DisplayErrorContext(&e))))?;
        out.plaintext()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| Error::Decrypt("kms decrypt returned no plaintext".into()))
    }
}

pub struct AwsSsm {
    client: aws_sdk_ssm::Client,
}

#[async_trait]
impl ParameterStore for AwsSsm {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        let out = self
            .client
            .get_parameters()
            .names(name)
            .with_decryption(false)
            .send()
            .await
            .map_err(|e| {
                Error::Connectivity(format!(
                    "ssm get {name}: {}",
                    aws_sdk_ssm::error::DisplayErrorContext(&e)
                ))
            })?;
        Ok(out
            .parameters()
            .first()
            .and_then(|p| p.value())
            .map(str::to_owned))
    }

    async fn put(&self, name: &str, value: &str) -> Result<()> {
        self.client
            .put_parameter()
            .name(name)
            .description(PARAMETER_DESCRIPTION)
            .overwrite(true)
            .r#type(ParameterType::String)
            .value(value)
            .send()
            .await
            .map_err(|e| {
                Error::Write(format!(
                    "ssm put {name}: {}",
                    aws_sdk_ssm::error::DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// XORs with a fixed byte; enough to make ciphertext differ from plaintext.
    struct XorKms;

    #[async_trait]
    impl KmsCipher for XorKms {
        async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
            Ok(plaintext.iter().map(|b| b ^ 0x5a).collect())
        }
        async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
            Ok(ciphertext.iter().map(|b| b ^ 0x5a).collect())
        }
    }

    #[derive(Default)]
    struct MemorySsm(Mutex<HashMap<String, String>>);

    #[async_trait]
    impl ParameterStore for MemorySsm {
        async fn get(&self, name: &str) -> Result<Option<String>> {
            Ok(self.0.lock().unwrap().get(name).cloned())
        }
        async fn put(&self, name: &str, value: &str) -> Result<()> {
            self.0.lock().unwrap().insert(name.to_string(), value.to_string());
            Ok(())
        }
    }

    fn spec(prefix: &str) -> AwsKmsSsmSpec {
        AwsKmsSsmSpec {
            kms_key_id: "alias/vault".into(),
            ssm_key_prefix: prefix.into(),
            region: "us-east-1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_base64_ciphertext() {
        let ssm = Arc::new(MemorySsm::default());
        let store = AwsKmsSsmStore::with_clients(&spec(""), Arc::new(XorKms), ssm.clone());

        store.set("p-unseal-key-2", "f00d").await.unwrap();

        let stored = ssm.0.lock().unwrap()["p-unseal-key-2"].clone();
        let expected: Vec<u8> = b"f00d".iter().map(|b| b ^ 0x5a).collect();
        assert_eq!(stored, B64.encode(expected));
        assert_eq!(store.get("p-unseal-key-2").await.unwrap(), "f00d");
    }

    #[tokio::test]
    async fn parameter_names_carry_the_ssm_prefix() {
        let ssm = Arc::new(MemorySsm::default());
        let store = AwsKmsSsmStore::with_clients(&spec("/vault/"), Arc::new(XorKms), ssm.clone());
        store.set("p-root-token", "s.x").await.unwrap();
        assert!(ssm.0.lock().unwrap().contains_key("/vault/p-root-token"));
    }

    #[tokio::test]
    async fn missing_parameter_is_not_found() {
        let store = AwsKmsSsmStore::with_clients(&spec(""), Arc::new(XorKms), Arc::new(MemorySsm::default()));
        assert!(matches!(store.get("p-root-token").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn non_base64_parameter_is_decrypt_error() {
        let mut ssm = MockParameterStore::new();
        ssm.expect_get().returning(|_| Ok(Some("not base64!".into())));
        let mut kms = MockKmsCipher::new();
        kms.expect_decrypt().never();

        let store = AwsKmsSsmStore::with_clients(&spec(""), Arc::new(kms), Arc::new(ssm));
        assert!(matches!(store.get("k").await, Err(Error::Decrypt(_))));
    }

    #[tokio::test]
    async fn failed_encrypt_writes_nothing() {
        let mut kms = MockKmsCipher::new();
        kms.expect_encrypt()
            .returning(|_| Err(Error::Write("kms encrypt: AccessDenied".into())));
        let mut ssm = MockParameterStore::new();
        ssm.expect_put().never();

        let store = AwsKmsSsmStore::with_clients(&spec(""), Arc::new(kms), Arc::new(ssm));
        assert!(store.set("k", "v").await.is_err());
    }
}
