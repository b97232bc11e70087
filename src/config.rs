use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::ApprovalPolicy;
use crate::model::{ResourceInfo, ResourceKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("resource catalog {path}: {reason}")]
    Catalog { path: PathBuf, reason: String },
}

/// Daemon settings, read from `STUDIOBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// JSON array of resources; defaults to `<data_dir>/resources.json`.
    pub resources_file: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    pub auto_approve: Vec<ResourceKind>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            resources_file: None,
            sweep_interval: Duration::from_secs(300),
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            metrics_port: None,
            auto_approve: Vec::new(),
        }
    }
}

fn parse_num<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_resources(raw: &str) -> Result<Vec<ResourceInfo>, String> {
    let resources: Vec<ResourceInfo> = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    for (i, r) in resources.iter().enumerate() {
        if resources[..i].iter().any(|o| o.kind == r.kind && o.id == r.id) {
            return Err(format!("{} #{} listed twice", r.kind, r.id));
        }
    }
    Ok(resources)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup("STUDIOBOOK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("STUDIOBOOK_RESOURCES_FILE") {
            config.resources_file = Some(PathBuf::from(file));
        }
        if let Some(raw) = lookup("STUDIOBOOK_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse_num("STUDIOBOOK_SWEEP_INTERVAL_SECS", &raw)?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "STUDIOBOOK_SWEEP_INTERVAL_SECS",
                    value: raw,
                    reason: "must be positive".into(),
                });
            }
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup("STUDIOBOOK_COMPACT_THRESHOLD") {
            config.compact_threshold = parse_num("STUDIOBOOK_COMPACT_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("STUDIOBOOK_METRICS_PORT") {
            config.metrics_port = Some(parse_num("STUDIOBOOK_METRICS_PORT", &raw)?);
        }
        if let Some(raw) = lookup("STUDIOBOOK_AUTO_APPROVE") {
            config.auto_approve = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<ResourceKind>().map_err(|reason| ConfigError::Invalid {
                        var: "STUDIOBOOK_AUTO_APPROVE",
                        value: raw.clone(),
                        reason,
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }

    pub fn resources_path(&self) -> PathBuf {
        self.resources_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("resources.json"))
    }

    /// Read the resource catalog. A missing file is an empty catalog.
    pub fn load_resources(&self) -> Result<Vec<ResourceInfo>, ConfigError> {
        let path = self.resources_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ConfigError::Catalog {
                    path,
                    reason: e.to_string(),
                });
            }
        };
        parse_resources(&raw).map_err(|reason| ConfigError::Catalog { path, reason })
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            auto_approve: self.auto_approve.clone(),
        }
    }
}
