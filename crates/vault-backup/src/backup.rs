//! Backup: raft snapshot plus the unseal key set, archived together.
//!
//! # Sequence
//!
//! 1. License check, storage Secret, priority settings, connection binding.
//! 2. The server's backend must be raft.
//! 3. The interim directory is wiped and recreated.
//! 4. CA bundle, readiness wait, backup token, leader address.
//! 5. `vault operator raft snapshot save` into the interim directory.
//! 6. Root token and unseal keys copied from the unsealer's store into the
//!    interim directory, one file per key.
//! 7. The interim directory is archived and retention applied.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use common::protocol::{BackupOutput, TargetRef};
use common::Error;
use tracing::{error, info};

use crate::archive::{Archiver, RetentionPolicy};
use crate::binding::RAFT_BACKEND;
use crate::config::Config;
use crate::keys::KeySet;
use crate::prepare::{self, Deps};
use crate::session::SNAPSHOT_FILE;
use crate::store::interim::InterimDirStore;
use crate::store::migrate_keys;

/// Run a backup and describe its outcome.
///
/// With `OUTPUT_DIR` set, a failure becomes a failed record instead of an
/// error so it can still be written out.
pub async fn run(cfg: &Config, deps: &Deps) -> Result<BackupOutput> {
    let target = TargetRef::app_binding(&cfg.appbinding, cfg.binding_namespace());
    match backup(cfg, deps, target.clone()).await {
        Ok(output) => Ok(output),
        Err(e) if cfg.output_dir.is_some() => {
            error!(error = %format!("{e:#}"), "backup failed");
            Ok(BackupOutput::failed(target, &cfg.hostname, format!("{e:#}")))
        }
        Err(e) => Err(e),
    }
}

async fn backup(cfg: &Config, deps: &Deps, target: TargetRef) -> Result<BackupOutput> {
    let started = Instant::now();
    let pre = prepare::preflight(cfg, deps).await?;
    let binding = &pre.binding;

    if pre.parameters.backend != RAFT_BACKEND {
        return Err(Error::BackendPrecondition(format!(
            "backend of {} must be {RAFT_BACKEND} for snapshots, found {:?}",
            binding.qualified(),
            pre.parameters.backend
        ))
        .into());
    }

    let interim = cfg.interim_data_dir.as_path();
    prepare::clear_dir(interim)?;

    let session = prepare::open_session(cfg, deps, binding).await?;
    info!(binding = %binding.qualified(), "backing up server");

    let snapshot = interim.join(SNAPSHOT_FILE);
    deps.runner
        .run(&session.snapshot_save(&snapshot, &cfg.vault_args))
        .await
        .context("failed to save raft snapshot")?;
    info!(path = %snapshot.display(), "snapshot saved");

    export_keys(cfg, deps, &pre, interim).await?;

    let archiver = Archiver::new(cfg, &pre.storage_secret, deps.runner.clone(), pre.priority)?;
    archiver
        .ensure_repository()
        .await
        .context("failed to initialise backup repository")?;
    let stats = archiver
        .backup(interim, &cfg.hostname)
        .await
        .context("failed to archive interim data")?;
    archiver
        .apply_retention(&RetentionPolicy::from_config(cfg), &cfg.hostname)
        .await
        .context("failed to apply retention policy")?;

    let elapsed = started.elapsed();
    info!(elapsed_ms = elapsed.as_millis() as u64, "backup finished");
    Ok(BackupOutput::succeeded(
        target,
        &cfg.hostname,
        vec![stats],
        format!("{:.3}s", elapsed.as_secs_f64()),
    ))
}

/// Copy the key set out of the unsealer's store into `interim` under the
/// same names.
async fn export_keys(cfg: &Config, deps: &Deps, pre: &prepare::Preflight, interim: &Path) -> Result<()> {
    let unsealer = prepare::unsealer(&pre.parameters)?;
    let prefix = prepare::resolve_key_prefix(cfg, deps.cluster.as_ref(), &pre.binding).await?;
    let keys = KeySet::build(&prefix, unsealer.secret_shares);
    info!(
        prefix = %prefix,
        keys = keys.len(),
        threshold = unsealer.secret_threshold,
        "exporting unseal keys and root token"
    );

    let store = prepare::key_store(deps, &pre.binding, unsealer).await?;
    let files = InterimDirStore::new(interim);
    migrate_keys(store.as_ref(), &keys, &files, &keys)
        .await
        .context("failed to export unseal keys")
}
