use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::PromotionPolicy;
use crate::error::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub root_paths: Vec<String>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_retry_wait_ms")]
    pub max_retry_wait_ms: u64,
    #[serde(default = "default_unclaimed_expiry_ms")]
    pub unclaimed_expiry_ms: u64,
    #[serde(default)]
    pub history_csv: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub formats: Vec<PatternFormatConfig>,
}

/// One `[[formats]]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatternFormatConfig {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    pub primary: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub discard_empty: bool,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_tick_interval_ms() -> u64 {
    2_000
}

fn default_max_retry_wait_ms() -> u64 {
    60_000
}

fn default_unclaimed_expiry_ms() -> u64 {
    300_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root_paths: Vec::new(),
            ignore_patterns: Vec::new(),
            tick_interval_ms: default_tick_interval_ms(),
            max_retry_wait_ms: default_max_retry_wait_ms(),
            unclaimed_expiry_ms: default_unclaimed_expiry_ms(),
            history_csv: None,
            dry_run: false,
            formats: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn policy(&self) -> PromotionPolicy {
        PromotionPolicy {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            max_retry_wait: Duration::from_millis(self.max_retry_wait_ms),
            unclaimed_expiry: Duration::from_millis(self.unclaimed_expiry_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.tick_interval_ms == 0 {
            return Err(Error::Other("tick_interval_ms must be greater than 0".into()));
        }
        let mut seen = Vec::new();
        for format in &self.formats {
            if seen.contains(&format.id.as_str()) {
                return Err(Error::Registration(format!(
                    "format '{}' is defined twice",
                    format.id
                )));
            }
            seen.push(format.id.as_str());

            // Imported files would reappear in the next snapshot and be imported again.
            if let Some(output_dir) = &format.output_dir {
                if let Some(root) = self
                    .root_paths
                    .iter()
                    .find(|root| is_within(output_dir, root))
                {
                    return Err(Error::Other(format!(
                        "format '{}' output_dir {} lies inside root path {}",
                        format.id, output_dir, root
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_within(path: &str, root: &str) -> bool {
    if Path::new(path).starts_with(root) {
        return true;
    }
    let resolve = |p: &str| fs::canonicalize(p).unwrap_or_else(|_| PathBuf::from(p));
    resolve(path).starts_with(resolve(root))
}

/// Load `Config.toml` (or `path`), then `TRIAGE_*` environment overrides.
pub fn load_configuration(path: Option<&str>) -> Result<AppConfig, Error> {
    let file = match path {
        Some(path) => ConfigFile::with_name(path).required(true),
        None => ConfigFile::with_name("Config").required(false),
    };
    let config = build(Config::builder().add_source(file))?;
    config.validate()?;
    Ok(config)
}

fn build(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<AppConfig, ConfigError> {
    builder
        .add_source(
            Environment::with_prefix("TRIAGE")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("root_paths")
                .with_list_parse_key("ignore_patterns"),
        )
        .build()?
        .try_deserialize::<AppConfig>()
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for dir in dirs {
        let dir_path = Path::new(&dir);
        if result.iter().any(|kept| dir_path.starts_with(Path::new(kept))) {
            continue;
        }
        result.retain(|kept| !Path::new(kept).starts_with(dir_path));
        result.push(dir);
    }

    result
}
