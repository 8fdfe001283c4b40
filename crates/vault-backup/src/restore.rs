//! Restore: bring back the interim directory, replay the raft snapshot and,
//! for a different target cluster, move the key set into its store.

use std::time::Instant;

use anyhow::{Context, Result};
use common::protocol::{RestoreOutput, TargetRef};
use common::Error;
use tracing::{error, info};

use crate::archive::Archiver;
use crate::config::Config;
use crate::keys::KeySet;
use crate::prepare::{self, Deps, Preflight};
use crate::session::SNAPSHOT_FILE;
use crate::store::interim::InterimDirStore;
use crate::store::migrate_keys;

/// Run a restore and describe its outcome; see [`crate::backup::run`].
pub async fn run(cfg: &Config, deps: &Deps) -> Result<RestoreOutput> {
    let target = TargetRef::app_binding(&cfg.appbinding, cfg.binding_namespace());
    match restore(cfg, deps, target.clone()).await {
        Ok(output) => Ok(output),
        Err(e) if cfg.output_dir.is_some() => {
            error!(error = %format!("{e:#}"), "restore failed");
            Ok(RestoreOutput::failed(target, &cfg.hostname, format!("{e:#}")))
        }
        Err(e) => Err(e),
    }
}

async fn restore(cfg: &Config, deps: &Deps, target: TargetRef) -> Result<RestoreOutput> {
    let started = Instant::now();
    let pre = prepare::preflight(cfg, deps).await?;
    let binding = &pre.binding;

    let server = deps
        .cluster
        .vault_server(&binding.namespace, &binding.name)
        .await
        .with_context(|| format!("failed to get VaultServer {}", binding.qualified()))?;
    if !server.is_raft() {
        return Err(Error::BackendPrecondition(format!(
            "backend of VaultServer {} must be raft for snapshot restore, found {:?}",
            binding.qualified(),
            server.backend_kinds()
        ))
        .into());
    }

    let interim = cfg.interim_data_dir.as_path();
    prepare::clear_dir(interim)?;

    let session = prepare::open_session(cfg, deps, binding).await?;
    info!(binding = %binding.qualified(), force = cfg.force, "restoring server");

    let archiver = Archiver::new(cfg, &pre.storage_secret, deps.runner.clone(), pre.priority)?;
    archiver
        .restore(&cfg.snapshots, cfg.source_hostname(), interim)
        .await
        .context("failed to restore interim data")?;

    let snapshot = interim.join(SNAPSHOT_FILE);
    deps.runner
        .run(&session.snapshot_restore(&snapshot, cfg.force, &cfg.vault_args))
        .await
        .context("failed to restore raft snapshot")?;
    info!("snapshot restored");

    if cfg.force {
        import_keys(cfg, deps, &pre).await?;
    }

    let elapsed = started.elapsed();
    info!(elapsed_ms = elapsed.as_millis() as u64, "restore finished");
    Ok(RestoreOutput::succeeded(
        target,
        &cfg.hostname,
        format!("{:.3}s", elapsed.as_secs_f64()),
    ))
}

/// Copy the backed-up key set from the interim directory into the target
/// unsealer's store, renaming from the old prefix to the new one.
async fn import_keys(cfg: &Config, deps: &Deps, pre: &Preflight) -> Result<()> {
    let unsealer = prepare::unsealer(&pre.parameters)?;
    let new_prefix = prepare::resolve_key_prefix(cfg, deps.cluster.as_ref(), &pre.binding).await?;
    let old_prefix = cfg
        .old_key_prefix
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| new_prefix.clone());
    info!(
        from = %old_prefix,
        to = %new_prefix,
        shares = unsealer.secret_shares,
        threshold = unsealer.secret_threshold,
        "migrating unseal keys and root token"
    );

    let old_keys = KeySet::build(&old_prefix, unsealer.secret_shares);
    let new_keys = KeySet::build(&new_prefix, unsealer.secret_shares);

    let files = InterimDirStore::new(&cfg.interim_data_dir);
    let store = prepare::key_store(deps, &pre.binding, unsealer).await?;
    migrate_keys(&files, &old_keys, store.as_ref(), &new_keys)
        .await
        .context("failed to migrate unseal keys")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use common::protocol::HostPhase;

    use super::*;
    use crate::binding::tests::{raft_server, sample_binding};
    use crate::binding::VaultServer;
    use crate::cluster::fake::FakeCluster;
    use crate::config::tests::sample;
    use crate::prepare::tests::{healthy_server, FixedConnector};
    use crate::session::{CommandOutput, CommandRunner, CommandSpec};

    /// `restic restore` drops the backed-up files (prefix `p`) into the
    /// interim directory; `vault` only records.
    struct FakeTools {
        interim: PathBuf,
        commands: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for FakeTools {
        async fn run(&self, cmd: &CommandSpec) -> common::Result<CommandOutput> {
            self.commands.lock().unwrap().push(cmd.clone());
            if cmd.program() == "restic" && cmd.get_args().first().map(String::as_str) == Some("restore") {
                fs::write(self.interim.join("backup.snap"), b"raft-snapshot")?;
                for (name, value) in [
                    ("p-root-token", "s.root"),
                    ("p-unseal-key-0", "k0"),
                    ("p-unseal-key-1", "k1"),
                    ("p-unseal-key-2", "k2"),
                ] {
                    fs::write(self.interim.join(name), serde_json::to_vec(value).unwrap())?;
                }
            }
            Ok(CommandOutput::default())
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        cfg: Config,
        tools: Arc<FakeTools>,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let interim = root.path().join("interim");
        let mut cfg = sample();
        cfg.interim_data_dir = interim.clone();
        cfg.scratch_dir = root.path().to_path_buf();
        cfg.old_key_prefix = Some("p".into());
        cfg.key_prefix = Some("q".into());
        Fixture {
            _root: root,
            cfg,
            tools: Arc::new(FakeTools {
                interim,
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    fn cluster() -> FakeCluster {
        FakeCluster::default()
            .with_license("license")
            .with_secret("demo", "s3-secret", &[("RESTIC_PASSWORD", "pw")])
            .with_secret("demo", "vault-backup-token", &[("token", "s.backup")])
            .with_secret("demo", "vault-keys", &[])
            .with_binding(sample_binding())
            .with_server(raft_server("vault", "demo"))
    }

    fn deps(cluster: Arc<FakeCluster>, tools: Arc<FakeTools>) -> Deps {
        Deps {
            cluster,
            runner: tools,
            connector: Arc::new(FixedConnector(healthy_server())),
        }
    }

    #[tokio::test]
    async fn forced_restore_migrates_keys_to_new_prefix() {
        let mut f = fixture();
        f.cfg.force = true;
        let cluster = Arc::new(cluster());

        let out = run(&f.cfg, &deps(cluster.clone(), f.tools.clone())).await.unwrap();
        assert_eq!(out.restore_target_status.stats[0].phase, HostPhase::Succeeded);

        for (key, value) in [
            ("q-root-token", "s.root"),
            ("q-unseal-key-0", "k0"),
            ("q-unseal-key-1", "k1"),
            ("q-unseal-key-2", "k2"),
        ] {
            assert_eq!(cluster.secret_value("demo", "vault-keys", key).as_deref(), Some(value));
        }
        assert!(cluster.secret_value("demo", "vault-keys", "p-root-token").is_none());
        assert_eq!(
            fs::read_to_string(f.cfg.interim_data_dir.join("p-root-token")).unwrap(),
            "\"s.root\""
        );
    }

    #[tokio::test]
    async fn archive_restore_runs_before_snapshot_restore() {
        let mut f = fixture();
        f.cfg.force = true;
        run(&f.cfg, &deps(Arc::new(cluster()), f.tools.clone())).await.unwrap();

        let commands = f.tools.commands.lock().unwrap();
        let programs: Vec<&str> = commands.iter().map(|c| c.program()).collect();
        assert_eq!(programs, ["restic", "vault"]);
        let snapshot = &commands[1];
        assert_eq!(snapshot.get_args()[4], "-force");
        assert_eq!(snapshot.get_env("VAULT_TOKEN"), Some("s.backup"));
    }

    #[tokio::test]
    async fn unforced_restore_leaves_store_alone() {
        let f = fixture();
        let cluster = Arc::new(cluster());
        run(&f.cfg, &deps(cluster.clone(), f.tools.clone())).await.unwrap();

        assert!(cluster.secret_value("demo", "vault-keys", "q-root-token").is_none());
        let commands = f.tools.commands.lock().unwrap();
        assert!(!commands[1].get_args().iter().any(|a| a == "-force"));
    }

    #[tokio::test]
    async fn target_without_raft_backend_is_rejected() {
        let f = fixture();
        let consul = VaultServer::from_object(serde_json::json!({
            "metadata": { "name": "vault", "namespace": "demo" },
            "spec": { "backend": { "consul": { "address": "consul:8500" } } }
        }))
        .unwrap();
        let cluster = Arc::new(cluster().with_server(consul));

        let err = run(&f.cfg, &deps(cluster, f.tools.clone())).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::BackendPrecondition(_))));
        assert!(f.tools.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_backed_up_key_aborts_migration() {
        let mut f = fixture();
        f.cfg.force = true;
        f.cfg.old_key_prefix = Some("other".into());
        let cluster = Arc::new(cluster());

        let err = run(&f.cfg, &deps(cluster.clone(), f.tools.clone())).await.unwrap_err();
        assert!(format!("{err:#}").contains("other-root-token"));
        assert!(cluster.secret_value("demo", "vault-keys", "q-root-token").is_none());
    }

    #[tokio::test]
    async fn failure_record_when_output_dir_is_set() {
        let mut f = fixture();
        f.cfg.output_dir = Some(f.cfg.scratch_dir.clone());
        let cluster = Arc::new(cluster().with_secret("demo", "vault-backup-token", &[]));

        let out = run(&f.cfg, &deps(cluster, f.tools.clone())).await.unwrap();
        let stats = &out.restore_target_status.stats[0];
        assert_eq!(stats.phase, HostPhase::Failed);
        assert!(stats.error.as_deref().unwrap().contains("token"));
    }
}
