//! Lightweight configuration loader and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `APP_*` env vars
//! (nested keys separated by `__`, e.g. `APP_RETRIEVAL__TOP_N=8`). Provides
//! helpers to expand `~` and `${VAR}` and to resolve relative paths against the
//! directory the configuration was loaded from.
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{SourceGroup, TierLabel};

pub struct Config {
    figment: Figment,
    base_dir: PathBuf,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Load `config.toml` and the environment overlay from `dir`.
    pub fn load_from(dir: &Path) -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::new().merge(Toml::file(dir.join("config.toml")));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment, base_dir: dir.to_path_buf() };
        config.validate_for_env(&env_name)?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// Typed view of the whole configuration.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to extract settings: {}", e))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn resolve_path<S: AsRef<str>>(&self, p: S) -> PathBuf {
        resolve_with_base(&self.base_dir, p)
    }

    fn validate_for_env(&self, env: &str) -> anyhow::Result<()> {
        if matches!(env, "prod" | "production") {
            let backends: Vec<BackendSettings> = self.get("backends").unwrap_or_default();
            if backends.is_empty() {
                return Err(anyhow::anyhow!("Prod config must declare at least one backend"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub retrieval: RetrievalSettings,
    pub backends: Vec<BackendSettings>,
    pub single_index: Option<SingleIndexSettings>,
    pub snapshot: Option<SnapshotSettings>,
    pub keyword: Option<KeywordSettings>,
    pub embedding: EmbeddingSettings,
    pub discovery: DiscoverySettings,
    pub events: EventSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if r.top_n == 0 || r.top_k == 0 {
            return Err(Error::InvalidConfig("retrieval.top_n and retrieval.top_k must be > 0".into()));
        }
        if r.max_concurrent_calls == 0 {
            return Err(Error::InvalidConfig("retrieval.max_concurrent_calls must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for b in &self.backends {
            if !seen.insert(b.name.as_str()) {
                return Err(Error::InvalidConfig(format!("duplicate backend name '{}'", b.name)));
            }
        }
        if let Some(single) = &self.single_index {
            if !self.backends.iter().any(|b| b.name == single.backend) {
                return Err(Error::InvalidConfig(format!(
                    "single_index.backend '{}' is not a declared backend",
                    single.backend
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_n: usize,
    pub top_k: usize,
    pub default_deadline_ms: u64,
    pub tier_max_latency_ms: u64,
    pub max_concurrent_calls: usize,
    pub tiers: Vec<TierLabel>,
}

impl RetrievalSettings {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn tier_max_latency(&self) -> Duration {
        Duration::from_millis(self.tier_max_latency_ms)
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_n: 5,
            top_k: 10,
            default_deadline_ms: 2_000,
            tier_max_latency_ms: 800,
            max_concurrent_calls: 16,
            tiers: TierLabel::DEFAULT_ORDER.to_vec(),
        }
    }
}

/// One Qdrant instance hosting the collections of a source group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    pub name: String,
    pub url: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub use_env_proxy: bool,
}

impl BackendSettings {
    pub fn source_group(&self) -> SourceGroup {
        SourceGroup::from_label(&self.group)
    }
}

fn default_group() -> String {
    SourceGroup::Legacy.as_str().to_string()
}

fn default_backend_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleIndexSettings {
    pub backend: String,
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSettings {
    pub path: String,
    #[serde(default = "default_snapshot_table")]
    pub table: String,
}

fn default_snapshot_table() -> String {
    "knowledge".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordSettings {
    pub docs_dir: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    vec!["txt".to_string(), "md".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model_dir: Option<String>,
    pub dimension: usize,
    pub fake: bool,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self { model_dir: None, dimension: 384, fake: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub refresh_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self { refresh_secs: 300 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub jsonl_path: Option<String>,
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
