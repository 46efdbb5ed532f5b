use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::regimen::MedicationRegimen;

/// Upstream supplier of regimens, typically the prescription backend or its local export.
pub trait RegimenSource: Send + Sync {
    fn load(&self) -> Result<Vec<MedicationRegimen>>;

    /// Filesystem locations worth watching for changes, if any.
    fn watch_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedFile {
    Many(Vec<MedicationRegimen>),
    One(Box<MedicationRegimen>),
}

/// Reads every `*.json` file under its roots. A root may also be a single file.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRegimenSource {
    roots: Vec<PathBuf>,
}

impl DirectoryRegimenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        if !self.roots.contains(&path) {
            self.roots.push(path);
        }
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn ingest_root(&self, root: &Path, out: &mut Vec<MedicationRegimen>) -> Result<()> {
        if root.is_file() {
            if is_json_file(root) {
                ingest_file(root, out);
            }
            return Ok(());
        }
        if !root.is_dir() {
            warn!(path = %root.display(), "regimen root does not exist");
            return Ok(());
        }
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type().is_file() && is_json_file(path) {
                ingest_file(path, out);
            }
        }
        Ok(())
    }
}

impl RegimenSource for DirectoryRegimenSource {
    fn load(&self) -> Result<Vec<MedicationRegimen>> {
        let mut regimens = Vec::new();
        for root in &self.roots {
            self.ingest_root(root, &mut regimens)?;
        }
        debug!(count = regimens.len(), "regimens loaded from disk");
        Ok(regimens)
    }

    fn watch_paths(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }
}

/// Unreadable files are skipped with a warning.
fn ingest_file(path: &Path, out: &mut Vec<MedicationRegimen>) {
    match load_seed_file(path) {
        Ok(regimens) => out.extend(regimens),
        Err(err) => warn!(
            path = %path.display(),
            error = %format!("{err:#}"),
            "skipping unreadable regimen file"
        ),
    }
}

/// Parses a seed file holding one regimen or an array of them.
pub fn load_seed_file(path: &Path) -> Result<Vec<MedicationRegimen>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read regimen file {}", path.display()))?;
    let seed: SeedFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse regimen file {}", path.display()))?;
    Ok(match seed {
        SeedFile::Many(regimens) => regimens,
        SeedFile::One(regimen) => vec![*regimen],
    })
}

fn is_json_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
