//! Configuration loading and validation.
//!
//! Precedence, lowest first: built-in defaults → `/etc/xdg/concord/
//! settings.toml` → XDG config dir → local `config/settings.toml` →
//! `CONCORD_CONFIG_FILE` override → `CONCORD__`-prefixed environment.
//! Per-call request options sit on top of all of this and are resolved in
//! the coordinator.

use std::{env, path::PathBuf, time::Duration};

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::extract::ExtractionOptions;
use crate::services::executor::ExecutorConfig;
use crate::services::jobs::Strategy;
use crate::services::reaper::RetentionConfig;
use crate::services::webhook::WebhookConfig;
use crate::text::compare::ComparatorConfig;
use crate::text::merge::MergePolicy;

const LOCAL_CONFIG_PATH: &str = "config/settings.toml";
const ETC_CONFIG_ENV: &str = "CONCORD_ETC_CONFIG_DIR";
const CONFIG_OVERRIDE_ENV: &str = "CONCORD_CONFIG_FILE";
const ETC_CONFIG_DEFAULT: &str = "/etc/xdg";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub webhook: WebhookSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Public base for URLs embedded in webhook payloads.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root for the LMDB environment and per-job artifacts.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "ExtractionConfig::default_strategy")]
    pub default_strategy: Strategy,
    #[serde(default = "ExtractionConfig::default_max_parallel")]
    pub max_parallel_extractors: usize,
    #[serde(default = "ExtractionConfig::default_per_extractor_timeout_secs")]
    pub per_extractor_timeout_secs: u64,
    #[serde(default = "ExtractionConfig::default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "ExtractionConfig::default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "ExtractionConfig::default_auto_merge_threshold")]
    pub auto_merge_threshold: f64,
    #[serde(default = "ExtractionConfig::default_min_free_memory_ratio")]
    pub min_free_memory_ratio: f64,
    #[serde(default = "ExtractionConfig::default_max_input_bytes")]
    pub max_input_bytes: u64,
    /// `highest_confidence`, `auto_merge_high_confidence`, or `prefer_<name>`.
    #[serde(default = "ExtractionConfig::default_policy")]
    pub default_policy: String,
    #[serde(default = "ExtractionConfig::default_worker_poll_secs")]
    pub worker_poll_secs: u64,
    #[serde(default)]
    pub default_options: ExtractionOptions,
    #[serde(default)]
    pub extractors: ExtractorsConfig,
}

impl ExtractionConfig {
    fn default_strategy() -> Strategy {
        Strategy::Fallback
    }

    fn default_max_parallel() -> usize {
        3
    }

    fn default_per_extractor_timeout_secs() -> u64 {
        300
    }

    fn default_job_timeout_secs() -> u64 {
        600
    }

    fn default_similarity_threshold() -> f64 {
        0.90
    }

    fn default_auto_merge_threshold() -> f64 {
        0.95
    }

    fn default_min_free_memory_ratio() -> f64 {
        0.25
    }

    fn default_max_input_bytes() -> u64 {
        100 * 1024 * 1024
    }

    fn default_policy() -> String {
        "highest_confidence".to_string()
    }

    fn default_worker_poll_secs() -> u64 {
        1
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent: self.max_parallel_extractors,
            per_extractor_timeout: Duration::from_secs(self.per_extractor_timeout_secs),
        }
    }

    pub fn comparator_config(&self) -> ComparatorConfig {
        ComparatorConfig {
            similarity_threshold: self.similarity_threshold,
            auto_merge_threshold: self.auto_merge_threshold,
            ..ComparatorConfig::default()
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn merge_policy(&self) -> Result<MergePolicy, AppConfigError> {
        parse_merge_policy(&self.default_policy)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            default_strategy: Self::default_strategy(),
            max_parallel_extractors: Self::default_max_parallel(),
            per_extractor_timeout_secs: Self::default_per_extractor_timeout_secs(),
            job_timeout_secs: Self::default_job_timeout_secs(),
            similarity_threshold: Self::default_similarity_threshold(),
            auto_merge_threshold: Self::default_auto_merge_threshold(),
            min_free_memory_ratio: Self::default_min_free_memory_ratio(),
            max_input_bytes: Self::default_max_input_bytes(),
            default_policy: Self::default_policy(),
            worker_poll_secs: Self::default_worker_poll_secs(),
            default_options: ExtractionOptions::default(),
            extractors: ExtractorsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractorsConfig {
    #[serde(default = "ExtractorsConfig::default_docling_binary")]
    pub docling_binary: String,
    #[serde(default = "ExtractorsConfig::default_mineru_binary")]
    pub mineru_binary: String,
    #[serde(default)]
    pub remote_endpoint: Option<Url>,
    #[serde(default = "ExtractorsConfig::default_remote_model")]
    pub remote_model: String,
    #[serde(default = "ExtractorsConfig::default_remote_api_key_env")]
    pub remote_api_key_env: String,
}

impl ExtractorsConfig {
    fn default_docling_binary() -> String {
        "docling".to_string()
    }

    fn default_mineru_binary() -> String {
        "mineru".to_string()
    }

    fn default_remote_model() -> String {
        "ocr-large-latest".to_string()
    }

    fn default_remote_api_key_env() -> String {
        "CONCORD_OCR_API_KEY".to_string()
    }
}

impl Default for ExtractorsConfig {
    fn default() -> Self {
        Self {
            docling_binary: Self::default_docling_binary(),
            mineru_binary: Self::default_mineru_binary(),
            remote_endpoint: None,
            remote_model: Self::default_remote_model(),
            remote_api_key_env: Self::default_remote_api_key_env(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookSettings {
    #[serde(default = "WebhookSettings::default_attempts")]
    pub attempts: u32,
    #[serde(default = "WebhookSettings::default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "WebhookSettings::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl WebhookSettings {
    fn default_attempts() -> u32 {
        3
    }

    fn default_base_delay_secs() -> u64 {
        5
    }

    fn default_request_timeout_secs() -> u64 {
        30
    }

    pub fn to_webhook_config(&self, public_base_url: Option<String>) -> WebhookConfig {
        WebhookConfig {
            attempts: self.attempts,
            base_delay: Duration::from_secs(self.base_delay_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            public_base_url,
        }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            base_delay_secs: Self::default_base_delay_secs(),
            request_timeout_secs: Self::default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionSettings {
    #[serde(default = "RetentionSettings::default_completed_days")]
    pub completed_days: u32,
    #[serde(default = "RetentionSettings::default_failed_days")]
    pub failed_days: u32,
}

impl RetentionSettings {
    fn default_completed_days() -> u32 {
        7
    }

    fn default_failed_days() -> u32 {
        30
    }

    pub fn to_retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            completed_days: self.completed_days,
            failed_days: self.failed_days,
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            completed_days: Self::default_completed_days(),
            failed_days: Self::default_failed_days(),
        }
    }
}

pub fn parse_merge_policy(raw: &str) -> Result<MergePolicy, AppConfigError> {
    match raw {
        "highest_confidence" => Ok(MergePolicy::HighestConfidence),
        "auto_merge_high_confidence" => Ok(MergePolicy::AutoMergeHighConfidence),
        other => match other.strip_prefix("prefer_") {
            Some(name) if !name.is_empty() => Ok(MergePolicy::Prefer(name.to_string())),
            _ => Err(invalid_config(format!("unknown merge policy `{other}`"))),
        },
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs()?;
    let default_storage = dirs.data_dir().to_path_buf();
    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .set_default("extraction.default_strategy", "fallback")?
        .set_default("extraction.max_parallel_extractors", 3)?
        .set_default("extraction.per_extractor_timeout_secs", 300)?
        .set_default("extraction.job_timeout_secs", 600)?
        .set_default("extraction.similarity_threshold", 0.90)?
        .set_default("extraction.auto_merge_threshold", 0.95)?
        .set_default("extraction.min_free_memory_ratio", 0.25)?
        .set_default("extraction.default_policy", "highest_confidence")?
        .set_default("webhook.attempts", 3)?
        .set_default("webhook.base_delay_secs", 5)?
        .set_default("retention.completed_days", 7)?
        .set_default("retention.failed_days", 30)?;

    for path in base_config_paths(&dirs) {
        debug_assert!(!path.as_os_str().is_empty());
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    if let Some(override_path) = config_override_path()? {
        debug_assert!(!override_path.as_os_str().is_empty());
        builder = builder.add_source(
            File::from(override_path)
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("CONCORD").separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("io", "concord", "concord").ok_or(AppConfigError::MissingProjectDirs)
}

fn base_config_paths(dirs: &ProjectDirs) -> [PathBuf; 3] {
    let etc_root = etc_config_dir();
    [
        etc_root.join("concord").join("settings.toml"),
        dirs.config_dir().join("settings.toml"),
        PathBuf::from(LOCAL_CONFIG_PATH),
    ]
}

fn config_override_path() -> Result<Option<PathBuf>, AppConfigError> {
    match env::var_os(CONFIG_OVERRIDE_ENV) {
        None => Ok(None),
        Some(raw) => {
            let path = PathBuf::from(raw);
            if path.as_os_str().is_empty() {
                return Err(invalid_config("CONCORD_CONFIG_FILE must not be empty"));
            }
            Ok(Some(path))
        }
    }
}

fn etc_config_dir() -> PathBuf {
    match env::var_os(ETC_CONFIG_ENV) {
        Some(raw) => {
            let path = PathBuf::from(&raw);
            if path.as_os_str().is_empty() {
                PathBuf::from(ETC_CONFIG_DEFAULT)
            } else {
                path
            }
        }
        None => PathBuf::from(ETC_CONFIG_DEFAULT),
    }
}

fn validate_config(config: &AppConfig) -> Result<(), AppConfigError> {
    let extraction = &config.extraction;

    if extraction.max_parallel_extractors == 0 {
        return Err(invalid_config("max_parallel_extractors must be at least 1"));
    }
    if extraction.per_extractor_timeout_secs == 0 || extraction.job_timeout_secs == 0 {
        return Err(invalid_config("timeouts must be positive"));
    }
    if extraction.job_timeout_secs < extraction.per_extractor_timeout_secs {
        return Err(invalid_config(
            "job_timeout_secs must not be below per_extractor_timeout_secs",
        ));
    }
    for (name, value) in [
        ("similarity_threshold", extraction.similarity_threshold),
        ("auto_merge_threshold", extraction.auto_merge_threshold),
        ("min_free_memory_ratio", extraction.min_free_memory_ratio),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(invalid_config(format!("{name} must lie in [0, 1]")));
        }
    }
    if extraction.similarity_threshold > extraction.auto_merge_threshold {
        return Err(invalid_config(
            "similarity_threshold must not exceed auto_merge_threshold",
        ));
    }
    extraction.merge_policy()?;

    if config.retention.completed_days == 0 || config.retention.failed_days == 0 {
        return Err(invalid_config("retention windows must be at least one day"));
    }
    if config.webhook.attempts == 0 {
        return Err(invalid_config("webhook.attempts must be at least 1"));
    }

    if config.server.listen_addr.is_empty() {
        return Err(invalid_config("server.listen_addr may not be empty"));
    }

    Ok(())
}

fn invalid_config<S: Into<String>>(message: S) -> AppConfigError {
    AppConfigError::Build(config::ConfigError::Message(message.into()))
}
