//! Keys encrypted with a Cloud KMS symmetric key and stored as GCS objects.
//!
//! Each key is one object named after the key; the object body is the raw
//! KMS ciphertext. Both directions are CRC32C-checked: a checksum mismatch
//! is an [`Error::Integrity`] and the affected value is never returned.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use common::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use super::{credential_secret_name, http_client, TokenSource, UnsealKeyStore, REQUEST_TIMEOUT};
use crate::binding::GoogleKmsGcsSpec;
use crate::cluster::{required_secret, Cluster};

pub const KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";
pub const STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Data key of the credential Secret holding the service-account JSON.
pub const SERVICE_ACCOUNT_KEY: &str = "sa.json";

/// Result of a KMS encrypt call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encrypted {
    pub ciphertext: Vec<u8>,
    pub ciphertext_crc32c: Option<u32>,
    /// The service confirmed it received the plaintext intact.
    pub verified_plaintext_crc32c: bool,
}

/// Result of a KMS decrypt call.
#[derive(Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub plaintext_crc32c: Option<u32>,
}

impl std::fmt::Debug for Decrypted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decrypted")
            .field("plaintext", &"[REDACTED]")
            .field("plaintext_crc32c", &self.plaintext_crc32c)
            .finish()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudKms: Send + Sync {
    async fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<Encrypted>;
    async fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> Result<Decrypted>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    async fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>>;
    async fn write(&self, bucket: &str, object: &str, body: Vec<u8>) -> Result<()>;
}

pub struct GoogleKmsGcsStore {
    kms: Arc<dyn CloudKms>,
    objects: Arc<dyn ObjectBucket>,
    bucket: String,
    key_name: String,
}

impl GoogleKmsGcsStore {
    /// Validate `spec`, load the service-account key from its credential
    /// Secret and build REST clients for KMS and GCS.
    pub async fn connect(cluster: &dyn Cluster, namespace: &str, spec: GoogleKmsGcsSpec) -> Result<Self> {
        let secret_name = credential_secret_name("googleKmsGcs", spec.credential_secret_ref.as_ref())?;
        validate(&spec)?;

        let creds = required_secret(cluster, namespace, &secret_name).await?;
        let sa_json = creds.get(SERVICE_ACCOUNT_KEY).ok_or_else(|| {
            Error::Config(format!("{SERVICE_ACCOUNT_KEY} not found in secret {namespace}/{secret_name}"))
        })?;

        let tokens = ServiceAccountTokens::from_key(sa_json).await?;
        let rest = Arc::new(GoogleRest::new(
            Arc::new(tokens),
            KMS_ENDPOINT.to_string(),
            STORAGE_ENDPOINT.to_string(),
        )?);
        Ok(Self::with_clients(&spec, rest.clone(), rest))
    }

    pub fn with_clients(spec: &GoogleKmsGcsSpec, kms: Arc<dyn CloudKms>, objects: Arc<dyn ObjectBucket>) -> Self {
        Self {
            kms,
            objects,
            bucket: spec.bucket.clone(),
            key_name: crypto_key_name(spec),
        }
    }
}

fn validate(spec: &GoogleKmsGcsSpec) -> Result<()> {
    for (value, field) in [
        (&spec.bucket, "bucket"),
        (&spec.kms_project, "kmsProject"),
        (&spec.kms_location, "kmsLocation"),
        (&spec.kms_key_ring, "kmsKeyRing"),
        (&spec.kms_crypto_key, "kmsCryptoKey"),
    ] {
        if value.trim().is_empty() {
            return Err(Error::Config(format!("googleKmsGcs: {field} is not set")));
        }
    }
    Ok(())
}

/// Fully-qualified crypto key resource name.
pub fn crypto_key_name(spec: &GoogleKmsGcsSpec) -> String {
    format!(
        "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
        spec.kms_project, spec.kms_location, spec.kms_key_ring, spec.kms_crypto_key
    )
}

#[async_trait]
impl UnsealKeyStore for GoogleKmsGcsStore {
    async fn get(&self, key: &str) -> Result<String> {
        let ciphertext = self.objects.read(&self.bucket, key).await?;
        let decrypted = self.kms.decrypt(&self.key_name, &ciphertext).await?;

        match decrypted.plaintext_crc32c {
            Some(expected) if expected == crc32c::crc32c(&decrypted.plaintext) => {}
            Some(_) => {
                return Err(Error::Integrity(format!(
                    "decrypt response for {key} corrupted in transit"
                )))
            }
            None => {
                return Err(Error::Integrity(format!(
                    "decrypt response for {key} carries no plaintext checksum"
                )))
            }
        }

        String::from_utf8(decrypted.plaintext)
            .map_err(|_| Error::Decrypt(format!("plaintext of {key} is not valid UTF-8")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let encrypted = self.kms.encrypt(&self.key_name, value.as_bytes()).await?;

        if !encrypted.verified_plaintext_crc32c {
            return Err(Error::Integrity(format!(
                "encrypt request for {key} corrupted in transit"
            )));
        }
        if let Some(expected) = encrypted.ciphertext_crc32c {
            if expected != crc32c::crc32c(&encrypted.ciphertext) {
                return Err(Error::Integrity(format!(
                    "encrypt response for {key} corrupted in transit"
                )));
            }
        }

        self.objects.write(&self.bucket, key, encrypted.ciphertext).await?;
        debug!(key, bucket = %self.bucket, "key written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// REST clients
// ---------------------------------------------------------------------------

/// OAuth2 tokens minted from a service-account key held in memory.
pub struct ServiceAccountTokens {
    auth: yup_oauth2::authenticator::DefaultAuthenticator,
}

impl std::fmt::Debug for ServiceAccountTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServiceAccountTokens([REDACTED])")
    }
}

impl ServiceAccountTokens {
    pub async fn from_key(sa_json: &[u8]) -> Result<Self> {
        let key = yup_oauth2::parse_service_account_key(sa_json)
            .map_err(|e| Error::Config(format!("invalid service-account key: {e}")))?;
        let auth = yup_oauth2::ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|e| Error::Config(format!("service-account authenticator: {e}")))?;
        Ok(Self { auth })
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokens {
    async fn bearer_token(&self) -> Result<String> {
        let token = self
            .auth
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .map_err(|e| Error::Connectivity(format!("google oauth2 token: {e}")))?;
        token
            .token()
            .map(str::to_owned)
            .ok_or_else(|| Error::Config("google oauth2 returned no access token".into()))
    }
}

/// Cloud KMS and Cloud Storage JSON API client.
pub struct GoogleRest {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    kms_endpoint: String,
    storage_endpoint: String,
}

impl GoogleRest {
    pub fn new(tokens: Arc<dyn TokenSource>, kms_endpoint: String, storage_endpoint: String) -> Result<Self> {
        let http = http_client(REQUEST_TIMEOUT)?;
        Ok(Self {
            http,
            tokens,
            kms_endpoint: kms_endpoint.trim_end_matches('/').to_string(),
            storage_endpoint: storage_endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn kms_call<Req: Serialize + Sync, Resp: for<'de> Deserialize<'de>>(
        &self,
        key_name: &str,
        op: &str,
        body: &Req,
        on_failure: fn(String) -> Error,
    ) -> Result<Resp> {
        let url = format!("{}/{key_name}:{op}", self.kms_endpoint);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.tokens.bearer_token().await?)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("kms {op}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(http_error(status, format!("kms {op} {key_name}: {status}: {text}"), on_failure));
        }
        resp.json()
            .await
            .map_err(|e| on_failure(format!("kms {op} response: {e}")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest {
    plaintext: String,
    plaintext_crc32c: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptResponse {
    ciphertext: String,
    #[serde(default, deserialize_with = "int64_field")]
    ciphertext_crc32c: Option<u32>,
    #[serde(default)]
    verified_plaintext_crc32c: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest {
    ciphertext: String,
    ciphertext_crc32c: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecryptResponse {
    #[serde(default)]
    plaintext: String,
    #[serde(default, deserialize_with = "int64_field")]
    plaintext_crc32c: Option<u32>,
}

/// Protobuf int64 fields arrive as JSON strings; accept numbers as well.
fn int64_field<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Str(String),
        Num(u64),
    }
    let parsed = match Option::<Int64>::deserialize(d)? {
        None => None,
        Some(Int64::Num(n)) => u32::try_from(n).ok(),
        Some(Int64::Str(s)) => s.parse::<u32>().ok(),
    };
    Ok(parsed)
}

#[async_trait]
impl CloudKms for GoogleRest {
    async fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<Encrypted> {
        let req = EncryptRequest {
            plaintext: B64.encode(plaintext),
            plaintext_crc32c: crc32c::crc32c(plaintext).to_string(),
        };
        let resp: EncryptResponse = self.kms_call(key_name, "encrypt", &req, Error::Write).await?;
        let ciphertext = B64
            .decode(resp.ciphertext)
            .map_err(|e| Error::Write(format!("kms encrypt: ciphertext is not base64: {e}")))?;
        Ok(Encrypted {
            ciphertext,
            ciphertext_crc32c: resp.ciphertext_crc32c,
            verified_plaintext_crc32c: resp.verified_plaintext_crc32c,
        })
    }

    async fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> Result<Decrypted> {
        let req = DecryptRequest {
            ciphertext: B64.encode(ciphertext),
            ciphertext_crc32c: crc32c::crc32c(ciphertext).to_string(),
        };
        let resp: DecryptResponse = self.kms_call(key_name, "decrypt", &req, Error::Decrypt).await?;
        let plaintext = B64
            .decode(resp.plaintext)
            .map_err(|e| Error::Decrypt(format!("kms decrypt: plaintext is not base64: {e}")))?;
        Ok(Decrypted {
            plaintext,
            plaintext_crc32c: resp.plaintext_crc32c,
        })
    }
}

#[async_trait]
impl ObjectBucket for GoogleRest {
    async fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.storage_endpoint,
            urlencoding::encode(bucket),
            urlencoding::encode(object)
        );
        let resp = self
            .http
            .get(&url)
            .query(&[("alt", "media")])
            .bearer_auth(self.tokens.bearer_token().await?)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("gcs read {bucket}/{object}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(http_error(
                status,
                format!("gcs object {bucket}/{object}: {status}"),
                Error::Connectivity,
            ));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Connectivity(format!("gcs read {bucket}/{object}: {e}")))?;
        Ok(body.to_vec())
    }

    async fn write(&self, bucket: &str, object: &str, body: Vec<u8>) -> Result<()> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.storage_endpoint,
            urlencoding::encode(bucket)
        );
        let resp = self
            .http
            .post(&url)
            .query(&[("uploadType", "media"), ("name", object)])
            .bearer_auth(self.tokens.bearer_token().await?)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Write(format!("gcs write {bucket}/{object}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(http_error(
                status,
                format!("gcs write {bucket}/{object}: {status}"),
                Error::Write,
            ));
        }
        Ok(())
    }
}

/// Map a failed HTTP status onto the error taxonomy.
pub(crate) fn http_error(status: reqwest::StatusCode, message: String, otherwise: fn(String) -> Error) -> Error {
    match status.as_u16() {
        404 => Error::NotFound(message),
        401 | 403 => Error::Config(message),
        _ => otherwise(message),
    }
}
