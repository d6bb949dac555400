//! Registry loading
//!
//! Reads a registry directory:
//!
//! ```text
//! kinds/**/*.json            one entity kind per file
//! customizations/**/*.json   one customization per file (optional)
//! system.json                installed apps (optional)
//! records/*.json             {"kind": ..., "records": [...]} seeds for the record store (optional)
//! errors.json                error log seed (optional)
//! ```

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::atlas::{Atlas, Collaborators};
use crate::config::AtlasConfig;
use crate::customization::{CustomizationDef, CustomizationRegistry};
use crate::registry::{AppInfo, SchemaRegistry};
use crate::schema::EntityKind;
use crate::store::{
    ErrorRecord, MemoryErrorFeed, MemoryPolicy, MemoryStore, Record, TracingNotifier,
};

#[derive(Debug, Default, Deserialize)]
struct SystemFile {
    #[serde(default)]
    apps: Vec<AppInfo>,
}

#[derive(Debug, Deserialize)]
struct RecordsFile {
    kind: String,
    #[serde(default)]
    records: Vec<Record>,
}

/// Everything read from a registry directory
pub struct LoadedRegistry {
    pub customizations: Arc<CustomizationRegistry>,
    pub records: BTreeMap<String, Vec<Record>>,
    pub errors: Vec<ErrorRecord>,
}

/// Load kinds, customizations and collaborator seeds from `dir`
pub fn load_from_directory(dir: &Path) -> anyhow::Result<LoadedRegistry> {
    if !dir.is_dir() {
        return Err(anyhow!("Registry directory {} does not exist", dir.display()));
    }

    let kinds: Vec<EntityKind> = json_files(&dir.join("kinds"))
        .iter()
        .map(|p| read_json(p))
        .collect::<anyhow::Result<_>>()?;
    if kinds.is_empty() {
        return Err(anyhow!("No kind definitions under {}", dir.join("kinds").display()));
    }

    let system_path = dir.join("system.json");
    let system: SystemFile = if system_path.is_file() {
        read_json(&system_path)?
    } else {
        SystemFile::default()
    };

    let schema = Arc::new(SchemaRegistry::new(kinds, system.apps));
    let customizations = Arc::new(CustomizationRegistry::new(schema));
    let defs: Vec<CustomizationDef> = json_files(&dir.join("customizations"))
        .iter()
        .map(|p| read_json(p))
        .collect::<anyhow::Result<_>>()?;
    let registered = customizations
        .register_all(defs)
        .context("Failed to register customizations")?;

    let mut records: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for path in json_files(&dir.join("records")) {
        let file: RecordsFile = read_json(&path)?;
        records.entry(file.kind).or_default().extend(file.records);
    }

    let errors_path = dir.join("errors.json");
    let errors: Vec<ErrorRecord> = if errors_path.is_file() {
        read_json(&errors_path)?
    } else {
        Vec::new()
    };

    info!(
        kinds = customizations.schema().snapshot().kind_count(),
        customizations = registered.len(),
        record_kinds = records.len(),
        errors = errors.len(),
        "Loaded registry from {}",
        dir.display()
    );

    Ok(LoadedRegistry {
        customizations,
        records,
        errors,
    })
}

/// Open an atlas over a registry directory with in-memory collaborators
pub fn open(config: AtlasConfig, dir: &Path) -> anyhow::Result<Atlas> {
    let loaded = load_from_directory(dir)?;
    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::with_records(loaded.records)),
        policy: Arc::new(MemoryPolicy::allow_all()),
        errors: Arc::new(MemoryErrorFeed::new(loaded.errors)),
        notifier: Arc::new(TracingNotifier),
    };
    Ok(Atlas::new(config, loaded.customizations, collaborators))
}

/// `.json` files under `dir` in path order; a missing directory yields none
fn json_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    debug!(path = %path.display(), "Parsing registry file");
    serde_json::from_str(&content).map_err(|e| anyhow!("Failed to parse JSON in {}: {}", path.display(), e))
}
