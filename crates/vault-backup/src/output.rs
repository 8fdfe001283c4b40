//! The per-host record written at the end of a run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

pub const OUTPUT_FILE: &str = "output.json";

/// Write `record` as pretty JSON to `<dir>/output.json`.
pub fn write_output<T: Serialize>(dir: &Path, record: &T) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("unable to create output dir {}", dir.display()))?;
    let path = dir.join(OUTPUT_FILE);
    let json = serde_json::to_vec_pretty(record).context("failed to encode output record")?;
    fs::write(&path, json).with_context(|| format!("unable to write {}", path.display()))?;
    info!(path = %path.display(), "output written");
    Ok(path)
}
