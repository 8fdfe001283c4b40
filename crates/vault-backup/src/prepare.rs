//! Steps shared by backup and restore before any data moves.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use common::Error;
use tracing::info;

use crate::binding::{AppBinding, UnsealerSpec, VaultServerConfiguration};
use crate::cluster::{required_secret, Cluster, SecretData};
use crate::config::Config;
use crate::keys::{default_key_prefix, parse_key_prefix, UNSEALER_CONTAINER};
use crate::priority::PrioritySettings;
use crate::session::{backup_token, CommandRunner, Session};
use crate::store::{new_store, StoreConfig, UnsealKeyStore};
use crate::vault::{self, VaultConnector};

/// Collaborators of one run.
#[derive(Clone)]
pub struct Deps {
    pub cluster: Arc<dyn Cluster>,
    pub runner: Arc<dyn CommandRunner>,
    pub connector: Arc<dyn VaultConnector>,
}

/// What every run learns before touching the server.
pub struct Preflight {
    pub storage_secret: SecretData,
    pub priority: PrioritySettings,
    pub binding: AppBinding,
    pub parameters: VaultServerConfiguration,
}

/// License check, storage Secret, priority settings and binding lookup.
pub async fn preflight(cfg: &Config, deps: &Deps) -> Result<Preflight> {
    deps.cluster
        .request_license(&cfg.license_features)
        .await
        .context("license check failed")?;
    info!(features = ?cfg.license_features, "license verified");

    let storage_secret = required_secret(
        deps.cluster.as_ref(),
        &cfg.storage_secret_namespace,
        &cfg.storage_secret_name,
    )
    .await
    .with_context(|| {
        format!(
            "failed to read storage secret {}/{}",
            cfg.storage_secret_namespace, cfg.storage_secret_name
        )
    })?;

    let priority = PrioritySettings::from_config(cfg).context("invalid resource priority settings")?;

    let binding = deps
        .cluster
        .app_binding(cfg.binding_namespace(), &cfg.appbinding)
        .await
        .with_context(|| format!("failed to get AppBinding {}/{}", cfg.binding_namespace(), cfg.appbinding))?;
    let parameters = binding.parameters();

    Ok(Preflight {
        storage_secret,
        priority,
        binding,
        parameters,
    })
}

/// Remove `dir` with everything in it and create it again, empty.
pub fn clear_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("unable to clean data dir {}", dir.display())),
    }
    fs::create_dir_all(dir).with_context(|| format!("unable to create data dir {}", dir.display()))
}

/// TLS, readiness, token and leader address, in that order.
pub async fn open_session(cfg: &Config, deps: &Deps, binding: &AppBinding) -> Result<Session> {
    let url = binding.url()?;
    let api = deps.connector.connect(&url)?;

    let ca = binding.ca_bundle()?;
    let session = Session::new()
        .with_ca_bundle(ca.as_deref(), &cfg.scratch_dir)
        .context("failed to stage CA bundle")?;

    vault::wait_until_ready(api.as_ref(), cfg.wait_timeout())
        .await
        .with_context(|| format!("server {} did not become ready", binding.qualified()))?;

    let token = backup_token(deps.cluster.as_ref(), binding)
        .await
        .context("failed to load backup token")?;

    let leader = vault::resolve_leader(api.as_ref(), &binding.scheme()?, &binding.namespace, binding.port()?)
        .await
        .context("failed to resolve leader address")?;

    Ok(session.with_token(&token).with_address(&leader))
}

/// Key prefix the unsealer of `binding` uses.
///
/// `KEY_PREFIX` wins; otherwise the `--key-prefix=` argument of the unsealer
/// container in the server's StatefulSet; otherwise the default prefix.
pub async fn resolve_key_prefix(cfg: &Config, cluster: &dyn Cluster, binding: &AppBinding) -> Result<String> {
    if let Some(prefix) = cfg.key_prefix.as_deref().filter(|p| !p.is_empty()) {
        return Ok(prefix.to_string());
    }
    let args = cluster
        .container_args(&binding.namespace, &binding.name, UNSEALER_CONTAINER)
        .await
        .with_context(|| format!("failed to read StatefulSet {}", binding.qualified()))?;
    if let Some(prefix) = args.as_deref().and_then(parse_key_prefix) {
        info!(prefix = %prefix, "key prefix taken from unsealer arguments");
        return Ok(prefix);
    }
    Ok(default_key_prefix(cfg.cluster_name.as_deref(), &binding.namespace, &binding.name))
}

/// The unsealer spec, which must be present to touch any keys.
pub fn unsealer(parameters: &VaultServerConfiguration) -> Result<&UnsealerSpec> {
    parameters
        .unsealer
        .as_ref()
        .ok_or_else(|| Error::Config("binding parameters carry no unsealer spec".into()))
        .map_err(Into::into)
}

/// The store the unsealer of `binding` keeps its keys in.
pub async fn key_store(
    deps: &Deps,
    binding: &AppBinding,
    unsealer: &UnsealerSpec,
) -> Result<Box<dyn UnsealKeyStore>> {
    let config = StoreConfig::try_from(unsealer.mode.clone())?;
    let store = new_store(config, deps.cluster.clone(), &binding.namespace).await?;
    Ok(store)
}
