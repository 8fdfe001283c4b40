//! Keys kept in plain data entries of one Kubernetes Secret.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Error, Result};

use super::UnsealKeyStore;
use crate::binding::KubernetesSecretSpec;
use crate::cluster::{required_secret, Cluster};

pub struct KubernetesSecretStore {
    cluster: Arc<dyn Cluster>,
    namespace: String,
    secret_name: String,
}

impl KubernetesSecretStore {
    pub fn new(cluster: Arc<dyn Cluster>, namespace: &str, spec: KubernetesSecretSpec) -> Result<Self> {
        if spec.secret_name.trim().is_empty() {
            return Err(Error::Config("kubernetesSecret: secretName is not set".into()));
        }
        Ok(Self {
            cluster,
            namespace: namespace.to_string(),
            secret_name: spec.secret_name,
        })
    }

    fn secret(&self) -> String {
        format!("{}/{}", self.namespace, self.secret_name)
    }
}

#[async_trait]
impl UnsealKeyStore for KubernetesSecretStore {
    async fn get(&self, key: &str) -> Result<String> {
        let mut data = required_secret(self.cluster.as_ref(), &self.namespace, &self.secret_name).await?;
        let value = data
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("{key} not found in secret {}", self.secret())))?;
        String::from_utf8(value)
            .map_err(|_| Error::Decrypt(format!("{key} in secret {} is not valid UTF-8", self.secret())))
    }

    /// Read-modify-write of the Secret's data. A missing Secret is
    /// [`Error::NotFound`]; it is never created here.
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = required_secret(self.cluster.as_ref(), &self.namespace, &self.secret_name).await?;
        data.insert(key.to_string(), value.as_bytes().to_vec());
        self.cluster
            .replace_secret_data(&self.namespace, &self.secret_name, data)
            .await
    }
}
