use crate::cohort::CohortLabel;
use crate::errors::{AppError, AppResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_ORG_PREFIX: &str = "REGISTRY_ORG_PREFIX";
pub const ENV_DEFAULT_COHORT: &str = "REGISTRY_DEFAULT_COHORT";
pub const ENV_BACKEND: &str = "REGISTRY_BACKEND";
pub const ENV_DATA_PATH: &str = "REGISTRY_DATA_PATH";
pub const ENV_LOG_DIR: &str = "REGISTRY_LOG_DIR";

const DEFAULT_SQLITE_PATH: &str = "data/cohort-registry.db";
const DEFAULT_WORKBOOK_PATH: &str = "data/cohort-registry.json";

static ORG_PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{1,16}$").expect("valid org prefix regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Sqlite { path: PathBuf },
    Workbook { path: PathBuf },
}

impl BackendConfig {
    pub fn path(&self) -> &Path {
        match self {
            Self::Sqlite { path } | Self::Workbook { path } => path,
        }
    }

    fn with_kind(kind: &str, path: Option<PathBuf>) -> AppResult<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite {
                path: path.unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH)),
            }),
            "workbook" => Ok(Self::Workbook {
                path: path.unwrap_or_else(|| PathBuf::from(DEFAULT_WORKBOOK_PATH)),
            }),
            other => Err(AppError::Validation(format!(
                "Unknown backend '{}': expected 'sqlite' or 'workbook'",
                other
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Sqlite { .. } => "sqlite",
            Self::Workbook { .. } => "workbook",
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from(DEFAULT_SQLITE_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub org_prefix: String,
    pub default_cohort: String,
    pub backend: BackendConfig,
    pub log_dir: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            org_prefix: "UGO".to_string(),
            default_cohort: "C1".to_string(),
            backend: BackendConfig::default(),
            log_dir: None,
            busy_timeout_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    /// YAML file (optional) first, then `REGISTRY_*` environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path).map_err(|error| {
            AppError::Validation(format!("Cannot read config {}: {}", path.display(), error))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        if let Some(prefix) = read(ENV_ORG_PREFIX) {
            self.org_prefix = prefix;
        }
        if let Some(cohort) = read(ENV_DEFAULT_COHORT) {
            self.default_cohort = cohort;
        }
        let data_path = read(ENV_DATA_PATH).map(PathBuf::from);
        match read(ENV_BACKEND) {
            Some(kind) => {
                let path = if kind.eq_ignore_ascii_case(self.backend.kind()) {
                    data_path.or_else(|| Some(self.backend.path().to_path_buf()))
                } else {
                    data_path
                };
                self.backend = BackendConfig::with_kind(&kind, path)?;
            }
            None => {
                if let Some(path) = data_path {
                    self.backend = BackendConfig::with_kind(self.backend.kind(), Some(path))?;
                }
            }
        }
        if let Some(log_dir) = read(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(log_dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if !ORG_PREFIX_PATTERN.is_match(&self.org_prefix) {
            return Err(AppError::Validation(format!(
                "Invalid org prefix '{}': use 1-16 letters or digits",
                self.org_prefix
            )));
        }
        CohortLabel::parse(&self.default_cohort)?;
        if self.busy_timeout_ms == 0 {
            return Err(AppError::Validation("busyTimeoutMs must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn default_cohort_label(&self) -> AppResult<CohortLabel> {
        CohortLabel::parse(&self.default_cohort)
    }

    /// Log directory, falling back to a `logs` directory beside the data file.
    pub fn resolved_log_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => dir.clone(),
            None => self
                .backend
                .path()
                .parent()
                .map(|parent| parent.join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs")),
        }
    }
}
