//! Pipeline configuration, loaded from a single TOML file.
//!
//! Modeled as a plain value handed to the orchestrator at construction, the way the
//! teacher's `Configuration::from_config_file` loads `config.toml` into a typed struct.
//! There is no hidden process-wide state: every task-specific LLM setting is resolved
//! against the default at construction time, not read lazily at call sites.

use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_crawl_delay_ms")]
    pub crawl_delay_ms: u64,
    #[serde(default = "default_crawl_max_retries")]
    pub crawl_max_retries: u32,
    #[serde(default = "default_crawl_timeout_s")]
    pub crawl_timeout_s: u64,

    #[serde(default = "default_glossary_sample_chapters")]
    pub glossary_sample_chapters: usize,
    #[serde(default = "default_glossary_sample_size")]
    pub glossary_sample_size: usize,
    #[serde(default = "default_glossary_min_entries")]
    pub glossary_min_entries: usize,
    #[serde(default = "default_glossary_max_entries")]
    pub glossary_max_entries: usize,
    #[serde(default)]
    pub glossary_random_sample: bool,
    #[serde(default = "default_glossary_wait_timeout_s")]
    pub glossary_wait_timeout_s: u64,
    #[serde(default = "default_glossary_batch_interval_s")]
    pub glossary_batch_interval_s: u64,
    #[serde(default = "default_glossary_scorer_rebuild_threshold")]
    pub glossary_scorer_rebuild_threshold: u64,

    #[serde(default)]
    pub enable_polish_pass: bool,
    #[serde(default = "default_polish_temperature")]
    pub polish_temperature: f32,
    #[serde(default = "default_polish_max_retries")]
    pub polish_max_retries: u32,

    #[serde(default)]
    pub llm: LlmTaskConfigs,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LlmTaskConfigs {
    #[serde(default)]
    pub default: LlmConfig,
    pub crawl: Option<LlmConfig>,
    pub glossary: Option<LlmConfig>,
    pub translate: Option<LlmConfig>,
}

impl LlmTaskConfigs {
    /// Resolves each task's config by falling back field-wise into the default,
    /// so a task-specific block that only overrides `model` still inherits the
    /// default `api_key`/`base_url`/etc.
    pub fn resolve_crawl(&self) -> LlmConfig {
        self.crawl
            .clone()
            .unwrap_or_else(|| self.default.clone())
            .merged_over(&self.default)
    }

    pub fn resolve_glossary(&self) -> LlmConfig {
        self.glossary
            .clone()
            .unwrap_or_else(|| self.default.clone())
            .merged_over(&self.default)
    }

    pub fn resolve_translate(&self) -> LlmConfig {
        self.translate
            .clone()
            .unwrap_or_else(|| self.default.clone())
            .merged_over(&self.default)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmConfig {
    /// Fills any field left `None` in `self` with the corresponding field from `base`.
    fn merged_over(mut self, base: &LlmConfig) -> Self {
        self.api_key = self.api_key.or_else(|| base.api_key.clone());
        self.base_url = self.base_url.or_else(|| base.base_url.clone());
        self.model = self.model.or_else(|| base.model.clone());
        self.max_tokens = self.max_tokens.or(base.max_tokens);
        self.temperature = self.temperature.or(base.temperature);
        self
    }
}

fn default_chunk_size() -> usize {
    2000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_workers() -> usize {
    2
}
fn default_crawl_delay_ms() -> u64 {
    1000
}
fn default_crawl_max_retries() -> u32 {
    3
}
fn default_crawl_timeout_s() -> u64 {
    30
}
fn default_glossary_sample_chapters() -> usize {
    3
}
fn default_glossary_sample_size() -> usize {
    4000
}
fn default_glossary_min_entries() -> usize {
    5
}
fn default_glossary_max_entries() -> usize {
    20
}
fn default_glossary_wait_timeout_s() -> u64 {
    60
}
fn default_glossary_batch_interval_s() -> u64 {
    30
}
fn default_glossary_scorer_rebuild_threshold() -> u64 {
    5
}
fn default_polish_temperature() -> f32 {
    0.3
}
fn default_polish_max_retries() -> u32 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            workers: default_workers(),
            crawl_delay_ms: default_crawl_delay_ms(),
            crawl_max_retries: default_crawl_max_retries(),
            crawl_timeout_s: default_crawl_timeout_s(),
            glossary_sample_chapters: default_glossary_sample_chapters(),
            glossary_sample_size: default_glossary_sample_size(),
            glossary_min_entries: default_glossary_min_entries(),
            glossary_max_entries: default_glossary_max_entries(),
            glossary_random_sample: false,
            glossary_wait_timeout_s: default_glossary_wait_timeout_s(),
            glossary_batch_interval_s: default_glossary_batch_interval_s(),
            glossary_scorer_rebuild_threshold: default_glossary_scorer_rebuild_threshold(),
            enable_polish_pass: false,
            polish_temperature: default_polish_temperature(),
            polish_max_retries: default_polish_max_retries(),
            llm: LlmTaskConfigs::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let mut raw = String::new();
        File::open(path.as_ref())?.read_to_string(&mut raw)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(
            self.chunk_overlap < self.chunk_size,
            "chunk_overlap must be less than chunk_size"
        );
        anyhow::ensure!(self.workers > 0, "workers must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn task_llm_config_falls_back_to_default_field_wise() {
        let mut llm = LlmTaskConfigs {
            default: LlmConfig {
                api_key: Some("key".into()),
                base_url: Some("https://default".into()),
                model: Some("default-model".into()),
                max_tokens: Some(1000),
                temperature: Some(0.7),
            },
            ..Default::default()
        };
        llm.translate = Some(LlmConfig {
            model: Some("translate-model".into()),
            ..Default::default()
        });
        let resolved = llm.resolve_translate();
        assert_eq!(resolved.model.as_deref(), Some("translate-model"));
        assert_eq!(resolved.api_key.as_deref(), Some("key"));
        assert_eq!(resolved.base_url.as_deref(), Some("https://default"));
    }

    #[test]
    fn rejects_invalid_chunk_overlap() {
        let mut config = Config::default();
        config.chunk_overlap = config.chunk_size;
        assert!(config.validate().is_err());
    }
}
