//! Access to the Kubernetes API.
//!
//! Everything the orchestrators and key stores need from the cluster goes
//! through the [`Cluster`] trait, so tests can substitute an in-memory
//! cluster. [`KubeCluster`] is the production implementation backed by a
//! `kube` client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{Error, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DynamicObject, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::json;
use tracing::debug;

use crate::binding::{AppBinding, VaultServer};

/// The `data` map of a Kubernetes Secret with decoded values.
pub type SecretData = BTreeMap<String, Vec<u8>>;

const APP_BINDING: (&str, &str, &str) = ("appcatalog.appscode.com", "v1alpha1", "AppBinding");
const VAULT_SERVER: (&str, &str, &str) = ("kubevault.com", "v1alpha2", "VaultServer");
const LICENSE_REQUEST: (&str, &str, &str) =
    ("proxyserver.licenses.appscode.com", "v1alpha1", "LicenseRequest");

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Data of a Secret, or `None` if the Secret does not exist.
    async fn secret_data(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;

    /// Replace the data of an existing Secret.
    ///
    /// Fails with [`Error::NotFound`] if the Secret does not exist.
    async fn replace_secret_data(&self, namespace: &str, name: &str, data: SecretData)
        -> Result<()>;

    async fn app_binding(&self, namespace: &str, name: &str) -> Result<AppBinding>;

    async fn vault_server(&self, namespace: &str, name: &str) -> Result<VaultServer>;

    /// Arguments of `container` in the pod template of a StatefulSet.
    ///
    /// `None` if the StatefulSet or the container does not exist.
    async fn container_args(
        &self,
        namespace: &str,
        statefulset: &str,
        container: &str,
    ) -> Result<Option<Vec<String>>>;

    /// Ask the license proxy for a license covering `features`.
    ///
    /// Returns the license blob; an empty response is an error.
    async fn request_license(&self, features: &[String]) -> Result<String>;
}

/// Fetch a Secret that must exist.
pub async fn required_secret(cluster: &dyn Cluster, namespace: &str, name: &str) -> Result<SecretData> {
    cluster
        .secret_data(namespace, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("secret {namespace}/{name}")))
}

/// Production [`Cluster`] backed by the in-cluster (or kubeconfig) client.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    /// Connect using the ambient configuration: the service-account token
    /// inside a pod, otherwise the local kubeconfig.
    pub async fn connect() -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| Error::Config(format!("kubernetes client: {e}")))?;
        Ok(Self { client })
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynamic(&self, namespace: Option<&str>, resource: &ApiResource) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    async fn get_dynamic(
        &self,
        namespace: &str,
        name: &str,
        gvk: (&str, &str, &str),
    ) -> Result<serde_json::Value> {
        let obj = self
            .dynamic(Some(namespace), &api_resource(gvk))
            .get_opt(name)
            .await
            .map_err(|e| kube_error(gvk.2, namespace, name, e))?
            .ok_or_else(|| Error::NotFound(format!("{} {namespace}/{name}", gvk.2)))?;
        serde_json::to_value(&obj)
            .map_err(|e| Error::Internal(format!("{} {namespace}/{name}: {e}", gvk.2)))
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn secret_data(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let secret = self
            .secrets(namespace)
            .get_opt(name)
            .await
            .map_err(|e| kube_error("secret", namespace, name, e))?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, ByteString(v))| (k, v))
                .collect()
        }))
    }

    async fn replace_secret_data(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
    ) -> Result<()> {
        let api = self.secrets(namespace);
        let mut secret = api
            .get_opt(name)
            .await
            .map_err(|e| kube_error("secret", namespace, name, e))?
            .ok_or_else(|| Error::NotFound(format!("secret {namespace}/{name}")))?;

        secret.data = Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect());
        secret.string_data = None;

        // resourceVersion from the read makes this a conditional update.
        api.replace(name, &PostParams::default(), &secret)
            .await
            .map_err(|e| Error::Write(format!("secret {namespace}/{name}: {e}")))?;
        debug!(namespace, name, "secret updated");
        Ok(())
    }

    async fn app_binding(&self, namespace: &str, name: &str) -> Result<AppBinding> {
        let value = self.get_dynamic(namespace, name, APP_BINDING).await?;
        AppBinding::from_object(value)
    }

    async fn vault_server(&self, namespace: &str, name: &str) -> Result<VaultServer> {
        let value = self.get_dynamic(namespace, name, VAULT_SERVER).await?;
        VaultServer::from_object(value)
    }

    async fn container_args(
        &self,
        namespace: &str,
        statefulset: &str,
        container: &str,
    ) -> Result<Option<Vec<String>>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let Some(sts) = api
            .get_opt(statefulset)
            .await
            .map_err(|e| kube_error("statefulset", namespace, statefulset, e))?
        else {
            return Ok(None);
        };

        let args = sts
            .spec
            .and_then(|spec| spec.template.spec)
            .and_then(|pod| pod.containers.into_iter().find(|c| c.name == container))
            .map(|c| c.args.unwrap_or_default());
        Ok(args)
    }

    async fn request_license(&self, features: &[String]) -> Result<String> {
        let resource = api_resource(LICENSE_REQUEST);
        let api = self.dynamic(None, &resource);
        let request = DynamicObject::new("", &resource).data(json!({
            "request": { "features": features },
        }));

        let response = api
            .create(&PostParams::default(), &request)
            .await
            .map_err(|e| Error::Connectivity(format!("license request: {e}")))?;

        let license = response
            .data
            .pointer("/response/license")
            .and_then(|l| l.as_str())
            .unwrap_or_default();
        if license.is_empty() {
            return Err(Error::Config(format!(
                "no license issued for features {}",
                features.join(",")
            )));
        }
        Ok(license.to_string())
    }
}

fn api_resource(gvk: (&str, &str, &str)) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(gvk.0, gvk.1, gvk.2))
}

fn kube_error(kind: &str, namespace: &str, name: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ref resp) if resp.code == 404 => {
            Error::NotFound(format!("{kind} {namespace}/{name}"))
        }
        other => Error::Connectivity(format!("{kind} {namespace}/{name}: {other}")),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory [`Cluster`] for tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeCluster {
        pub secrets: Mutex<HashMap<(String, String), SecretData>>,
        pub bindings: HashMap<(String, String), AppBinding>,
        pub servers: HashMap<(String, String), VaultServer>,
        pub statefulset_args: HashMap<(String, String), Vec<String>>,
        pub license: Option<String>,
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    impl FakeCluster {
        pub fn with_secret(self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
            let data = data
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect();
            self.secrets.lock().unwrap().insert(key(namespace, name), data);
            self
        }

        pub fn with_binding(mut self, binding: AppBinding) -> Self {
            self.bindings
                .insert(key(&binding.namespace, &binding.name), binding);
            self
        }

        pub fn with_server(mut self, server: VaultServer) -> Self {
            self.servers
                .insert(key(&server.namespace, &server.name), server);
            self
        }

        pub fn with_license(mut self, license: &str) -> Self {
            self.license = Some(license.to_string());
            self
        }

        pub fn secret_value(&self, namespace: &str, name: &str, data_key: &str) -> Option<String> {
            self.secrets
                .lock()
                .unwrap()
                .get(&key(namespace, name))
                .and_then(|d| d.get(data_key))
                .map(|v| String::from_utf8_lossy(v).into_owned())
        }
    }

    #[async_trait]
    impl Cluster for FakeCluster {
        async fn secret_data(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
            Ok(self.secrets.lock().unwrap().get(&key(namespace, name)).cloned())
        }

        async fn replace_secret_data(
            &self,
            namespace: &str,
            name: &str,
            data: SecretData,
        ) -> Result<()> {
            let mut secrets = self.secrets.lock().unwrap();
            match secrets.get_mut(&key(namespace, name)) {
                Some(existing) => {
                    *existing = data;
                    Ok(())
                }
                None => Err(Error::NotFound(format!("secret {namespace}/{name}"))),
            }
        }

        async fn app_binding(&self, namespace: &str, name: &str) -> Result<AppBinding> {
            self.bindings
                .get(&key(namespace, name))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("AppBinding {namespace}/{name}")))
        }

        async fn vault_server(&self, namespace: &str, name: &str) -> Result<VaultServer> {
            self.servers
                .get(&key(namespace, name))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("VaultServer {namespace}/{name}")))
        }

        async fn container_args(
            &self,
            namespace: &str,
            statefulset: &str,
            _container: &str,
        ) -> Result<Option<Vec<String>>> {
            Ok(self.statefulset_args.get(&key(namespace, statefulset)).cloned())
        }

        async fn request_license(&self, features: &[String]) -> Result<String> {
            self.license
                .clone()
                .ok_or_else(|| Error::Config(format!("no license issued for features {}", features.join(","))))
        }
    }
}
