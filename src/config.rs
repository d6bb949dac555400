//! Configuration management for the atlas
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (atlas.toml)
//! - Environment variables (ATLAS__*)
//!
//! ## Example config file (atlas.toml):
//! ```toml
//! [registry]
//! path = "./registry"
//!
//! [graph]
//! max_depth = 3
//!
//! [search]
//! per_kind_timeout_ms = 1500
//! priority_kinds = ["Customer", "Sales Order"]
//!
//! [monitor]
//! trend_threshold = 2.5
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtlasConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub rollback: RollbackConfig,

    #[serde(default)]
    pub harness: HarnessConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory holding kinds/, customizations/, records/ and system.json
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

/// Relationship mapping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Requested depths are clamped to this
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Follow bookkeeping links (owner, amended_from, ...) by default
    #[serde(default)]
    pub include_standard: bool,

    /// Link fields considered bookkeeping rather than structure
    #[serde(default = "default_standard_fields")]
    pub standard_fields: Vec<String>,
}

/// Universal search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    /// Deadline for a single kind's lookup
    #[serde(default = "default_per_kind_timeout_ms")]
    pub per_kind_timeout_ms: u64,

    /// Upper bound on kinds fanned out to
    #[serde(default = "default_max_kinds")]
    pub max_kinds: usize,

    #[serde(default = "default_min_per_kind")]
    pub min_per_kind: usize,

    #[serde(default = "default_max_text_fields")]
    pub max_text_fields: usize,

    #[serde(default = "default_max_numeric_fields")]
    pub max_numeric_fields: usize,

    /// Kinds fanned out to first
    #[serde(default)]
    pub priority_kinds: Vec<String>,
}

/// Error monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,

    /// current/prior ratio above which a group is trending
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold: f64,

    #[serde(default = "default_high_severity_count")]
    pub high_severity_count: usize,

    /// Max records pulled from the feed per window
    #[serde(default = "default_fetch_cap")]
    pub fetch_cap: usize,

    #[serde(default = "default_signature_max_len")]
    pub signature_max_len: usize,
}

/// Rollback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Attempts after losing an optimistic version check
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Test harness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Fill missing required fields with dummy values
    #[serde(default = "default_true")]
    pub fill_required: bool,
}

/// CLI output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

/// Output format for JSON
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pretty,
    Compact,
}

// Default value functions
fn default_registry_path() -> PathBuf {
    PathBuf::from("./registry")
}

fn default_true() -> bool {
    true
}

fn default_max_depth() -> usize {
    3
}

fn default_standard_fields() -> Vec<String> {
    [
        "owner",
        "modified_by",
        "company",
        "amended_from",
        "parent",
        "parenttype",
        "parentfield",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_search_limit() -> usize {
    20
}

fn default_per_kind_timeout_ms() -> u64 {
    2000
}

fn default_max_kinds() -> usize {
    50
}

fn default_min_per_kind() -> usize {
    3
}

fn default_max_text_fields() -> usize {
    8
}

fn default_max_numeric_fields() -> usize {
    5
}

fn default_window_hours() -> u32 {
    1
}

fn default_trend_threshold() -> f64 {
    2.0
}

fn default_high_severity_count() -> usize {
    3
}

fn default_fetch_cap() -> usize {
    500
}

fn default_signature_max_len() -> usize {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            include_standard: false,
            standard_fields: default_standard_fields(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
            per_kind_timeout_ms: default_per_kind_timeout_ms(),
            max_kinds: default_max_kinds(),
            min_per_kind: default_min_per_kind(),
            max_text_fields: default_max_text_fields(),
            max_numeric_fields: default_max_numeric_fields(),
            priority_kinds: Vec::new(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            trend_threshold: default_trend_threshold(),
            high_severity_count: default_high_severity_count(),
            fetch_cap: default_fetch_cap(),
            signature_max_len: default_signature_max_len(),
        }
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            fill_required: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Pretty,
            log_filter: default_log_filter(),
        }
    }
}

impl SearchConfig {
    pub fn per_kind_timeout(&self) -> Duration {
        Duration::from_millis(self.per_kind_timeout_ms)
    }
}

impl AtlasConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["atlas.toml", ".atlas.toml", "config/atlas.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "kind-atlas", "atlas") {
            let xdg_config = config_dir.config_dir().join("atlas.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // ATLAS__SEARCH__PER_KIND_TIMEOUT_MS=500
        builder = builder.add_source(
            Environment::with_prefix("ATLAS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Write configuration as TOML
    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get the registry path (resolves relative paths)
    pub fn registry_path(&self) -> PathBuf {
        if self.registry.path.is_absolute() {
            self.registry.path.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.registry.path)
        }
    }
}
