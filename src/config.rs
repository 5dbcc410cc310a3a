use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::AnalysisMode;

/// Upper bound on any per-mode inference timeout.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// Upper bound on the stall threshold.
pub const MAX_STALL_THRESHOLD_SECS: u64 = 7 * 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub advisors: Vec<AdvisorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Uploaded images are kept here, one file per job.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("critiq")
        .join("critiq.db")
}

fn default_upload_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("critiq/uploads")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            upload_dir: default_upload_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Any OpenAI-compatible server (LM Studio, vLLM, OpenAI itself).
    #[default]
    OpenAI,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub provider: ProviderType,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub embedding_model: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-mode call timeouts in seconds.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_model() -> String {
    "qwen2.5-vl-7b-instruct".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: ProviderType::default(),
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: None,
            embedding_model: None,
            max_tokens: default_max_tokens(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_baseline_timeout")]
    pub baseline_secs: f64,
    #[serde(default = "default_adapter_timeout")]
    pub adapter_secs: f64,
    #[serde(default = "default_rag_timeout")]
    pub rag_secs: f64,
    #[serde(default = "default_rag_adapter_timeout")]
    pub rag_adapter_secs: f64,
}

fn default_baseline_timeout() -> f64 {
    120.0
}

fn default_adapter_timeout() -> f64 {
    180.0
}

fn default_rag_timeout() -> f64 {
    240.0
}

fn default_rag_adapter_timeout() -> f64 {
    300.0
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            baseline_secs: default_baseline_timeout(),
            adapter_secs: default_adapter_timeout(),
            rag_secs: default_rag_timeout(),
            rag_adapter_secs: default_rag_adapter_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn for_mode(&self, mode: AnalysisMode) -> Duration {
        let secs = match mode {
            AnalysisMode::Baseline => self.baseline_secs,
            AnalysisMode::Adapter => self.adapter_secs,
            AnalysisMode::Rag => self.rag_secs,
            AnalysisMode::RagAdapter => self.rag_adapter_secs,
        };
        if secs.is_finite() {
            Duration::from_secs_f64(secs.clamp(0.0, MAX_TIMEOUT_SECS))
        } else {
            Duration::from_secs_f64(MAX_TIMEOUT_SECS)
        }
    }

    fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("baseline_secs", self.baseline_secs),
            ("adapter_secs", self.adapter_secs),
            ("rag_secs", self.rag_secs),
            ("rag_adapter_secs", self.rag_adapter_secs),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Attempts allowed for transient failures before a job fails for good.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// A non-terminal job idle for longer than this is reported as stuck.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_secs: u64,

    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    /// First retry waits this long; each further retry doubles it.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_retry_backoff_max")]
    pub retry_backoff_max_ms: u64,

    /// Fallback poll for the dispatcher when no wake-up arrives.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_stall_threshold() -> u64 {
    300
}

fn default_watchdog_interval() -> u64 {
    30
}

fn default_retry_backoff() -> u64 {
    2_000
}

fn default_retry_backoff_max() -> u64 {
    60_000
}

fn default_poll_interval() -> u64 {
    1_000
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stall_threshold_secs: default_stall_threshold(),
            watchdog_interval_secs: default_watchdog_interval(),
            retry_backoff_ms: default_retry_backoff(),
            retry_backoff_max_ms: default_retry_backoff_max(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl JobsConfig {
    pub fn stall_threshold(&self) -> chrono::Duration {
        let secs = self.stall_threshold_secs.min(MAX_STALL_THRESHOLD_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Backoff before attempt `retry_count + 1`, doubling per retry and capped.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Nearest reference profiles kept per request.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// A user score at or below this marks the dimension as weak.
    #[serde(default = "default_weak_threshold")]
    pub weak_threshold: f32,

    /// A reference must score at least this on a dimension to be cited for it.
    #[serde(default = "default_high_bar")]
    pub high_bar: f32,

    #[serde(default = "default_max_citations")]
    pub max_image_citations: usize,

    #[serde(default = "default_max_citations")]
    pub max_quote_citations: usize,

    /// Passages quoted into the prompt context.
    #[serde(default = "default_context_passages")]
    pub context_passages: usize,
}

fn default_top_k() -> usize {
    5
}

fn default_weak_threshold() -> f32 {
    6.0
}

fn default_high_bar() -> f32 {
    8.0
}

fn default_max_citations() -> usize {
    3
}

fn default_context_passages() -> usize {
    6
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            weak_threshold: default_weak_threshold(),
            high_bar: default_high_bar(),
            max_image_citations: default_max_citations(),
            max_quote_citations: default_max_citations(),
            context_passages: default_context_passages(),
        }
    }
}

/// An advisor persona. The persona text is passed to the model untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub persona: String,
}

impl AdvisorConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            inference: InferenceConfig::default(),
            jobs: JobsConfig::default(),
            retrieval: RetrievalConfig::default(),
            advisors: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `CRITIQ_CONFIG` or the default location, writing defaults on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CRITIQ_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("critiq")
    }

    pub fn advisor(&self, advisor_id: &str) -> Option<&AdvisorConfig> {
        self.advisors.iter().find(|a| a.id == advisor_id)
    }

    fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if r.weak_threshold >= r.high_bar {
            return Err(anyhow!(
                "retrieval.weak_threshold ({}) must be below retrieval.high_bar ({})",
                r.weak_threshold,
                r.high_bar
            ));
        }
        for (name, secs) in self.inference.timeouts.entries() {
            if !(secs > 0.0 && secs <= MAX_TIMEOUT_SECS) {
                return Err(anyhow!(
                    "inference.timeouts.{} ({}) must be above 0 and at most {}",
                    name,
                    secs,
                    MAX_TIMEOUT_SECS
                ));
            }
        }
        if self.jobs.stall_threshold_secs > MAX_STALL_THRESHOLD_SECS {
            return Err(anyhow!(
                "jobs.stall_threshold_secs ({}) must be at most {}",
                self.jobs.stall_threshold_secs,
                MAX_STALL_THRESHOLD_SECS
            ));
        }
        if self.jobs.max_retries == 0 {
            return Err(anyhow!("jobs.max_retries must be at least 1"));
        }
        for (i, advisor) in self.advisors.iter().enumerate() {
            if self.advisors[..i].iter().any(|a| a.id == advisor.id) {
                return Err(anyhow!("advisor '{}' is configured twice", advisor.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_observed_conventions() {
        let config = Config::default();
        assert_eq!(config.jobs.max_retries, 3);
        assert_eq!(config.jobs.stall_threshold_secs, 300);
        assert_eq!(config.retrieval.max_image_citations, 3);
        assert_eq!(config.retrieval.max_quote_citations, 3);
        assert!(config.retrieval.weak_threshold < config.retrieval.high_bar);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [inference]
            provider = "ollama"
            endpoint = "http://localhost:11434"

            [[advisors]]
            id = "adams"
            name = "Ansel Adams"
            persona = "You are Ansel Adams."
            "#,
        )
        .unwrap();

        assert_eq!(config.inference.provider, ProviderType::Ollama);
        assert_eq!(config.inference.timeouts.rag_adapter_secs, 300.0);
        assert_eq!(config.advisor("adams").unwrap().display_name(), "Ansel Adams");
        assert!(config.advisor("cartier-bresson").is_none());
    }

    #[test]
    fn test_timeout_per_mode() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.for_mode(AnalysisMode::Baseline), Duration::from_secs(120));
        assert_eq!(timeouts.for_mode(AnalysisMode::RagAdapter), Duration::from_secs(300));
        assert!(
            timeouts.for_mode(AnalysisMode::Rag) > timeouts.for_mode(AnalysisMode::Baseline)
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let jobs = JobsConfig {
            retry_backoff_ms: 1_000,
            retry_backoff_max_ms: 3_000,
            ..JobsConfig::default()
        };
        assert_eq!(jobs.backoff_for(1), Duration::from_millis(1_000));
        assert_eq!(jobs.backoff_for(2), Duration::from_millis(2_000));
        assert_eq!(jobs.backoff_for(3), Duration::from_millis(3_000));
        assert_eq!(jobs.backoff_for(30), Duration::from_millis(3_000));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.advisors.push(AdvisorConfig {
            id: "adams".into(),
            name: None,
            persona: "persona".into(),
        });
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.advisors.len(), 1);
        assert_eq!(loaded.advisor("adams").unwrap().display_name(), "adams");
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[retrieval]\nweak_threshold = 9.0\nhigh_bar = 8.0\n",
        )
        .unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_durations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        for body in [
            "[inference.timeouts]\nbaseline_secs = 1e300\n",
            "[inference.timeouts]\nrag_secs = -5.0\n",
            "[inference.timeouts]\nadapter_secs = 0.0\n",
            "[jobs]\nstall_threshold_secs = 1000000000\n",
        ] {
            std::fs::write(&path, body).unwrap();
            assert!(Config::load_from(&path).is_err(), "{}", body);
        }

        std::fs::write(&path, "[inference.timeouts]\nbaseline_secs = 90.5\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(
            config.inference.timeouts.for_mode(AnalysisMode::Baseline),
            Duration::from_secs_f64(90.5)
        );
    }

    #[test]
    fn test_duration_helpers_never_panic() {
        let timeouts = TimeoutConfig {
            baseline_secs: f64::INFINITY,
            adapter_secs: f64::NAN,
            rag_secs: 1e300,
            rag_adapter_secs: -1.0,
        };
        let cap = Duration::from_secs_f64(MAX_TIMEOUT_SECS);
        assert_eq!(timeouts.for_mode(AnalysisMode::Baseline), cap);
        assert_eq!(timeouts.for_mode(AnalysisMode::Adapter), cap);
        assert_eq!(timeouts.for_mode(AnalysisMode::Rag), cap);
        assert_eq!(timeouts.for_mode(AnalysisMode::RagAdapter), Duration::ZERO);

        let jobs = JobsConfig {
            stall_threshold_secs: u64::MAX,
            ..JobsConfig::default()
        };
        assert_eq!(
            jobs.stall_threshold(),
            chrono::Duration::seconds(MAX_STALL_THRESHOLD_SECS as i64)
        );
    }
}
