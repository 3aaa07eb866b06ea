use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::debug;

use crate::agents::{AgentOptions, RetryPolicy};
use crate::links::LinkCheckSettings;
use crate::orchestrator::{ControllerOptions, DEFAULT_MAX_ITERATIONS};
use crate::scope::ResearchContext;
use crate::search::DEFAULT_BING_ENDPOINT;
use crate::{RfxError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "rfx.toml";
const CONFIG_PATH_ENV: &str = "RFX_CONFIG";
const MAX_ITERATIONS_LIMIT: u32 = 10;

/// Top-level configuration. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub links: LinksConfig,
    pub orchestrator: OrchestratorConfig,
    pub research: ResearchConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the model API key from the environment.
    pub fn llm_api_key(&self) -> Result<SecretValue, RfxError> {
        require_env(&self.llm.api_key_env)
    }

    /// Resolve the search API key; `None` disables web search.
    pub fn search_api_key(&self) -> Option<SecretValue> {
        crate::security::optional_env(&self.search.api_key_env)
    }
}

/// Loads configuration with validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `RFX_CONFIG` environment variable.
    /// 3. `rfx.toml` in the current working directory.
    ///
    /// A missing file at the default location yields the built-in defaults; a
    /// missing file that was named explicitly is an error.
    pub fn load(path: Option<PathBuf>) -> Result<Config, RfxError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            debug!(path = %candidate.display(), "no configuration file; using defaults");
            let config = Config::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| RfxError::config_io(candidate.clone(), err))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config, RfxError> {
        let config: Config =
            toml::from_str(raw).map_err(|err| RfxError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), RfxError> {
        let max = config.orchestrator.max_iterations;
        if !(1..=MAX_ITERATIONS_LIMIT).contains(&max) {
            return Err(RfxError::InvalidConfiguration(format!(
                "orchestrator.max_iterations must be between 1 and {MAX_ITERATIONS_LIMIT}, got {max}"
            )));
        }
        if config.orchestrator.agent_timeout_ms == 0 {
            return Err(RfxError::InvalidConfiguration(
                "orchestrator.agent_timeout_ms must be greater than zero".into(),
            ));
        }
        if config.search.count_per_context == 0 {
            return Err(RfxError::InvalidConfiguration(
                "search.count_per_context must be at least 1".into(),
            ));
        }
        if config.links.timeout_ms == 0 {
            return Err(RfxError::InvalidConfiguration(
                "links.timeout_ms must be greater than zero".into(),
            ));
        }
        if config.links.max_concurrent == 0 {
            return Err(RfxError::InvalidConfiguration(
                "links.max_concurrent must be at least 1".into(),
            ));
        }
        if config.llm.api_key_env.trim().is_empty() {
            return Err(RfxError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_version: String,
    pub deployment: String,
    /// Separate (usually smaller) deployment for the Manager role.
    pub manager_deployment: Option<String>,
    pub api_key_env: String,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_version: "2024-06-01".to_string(),
            deployment: "gpt-4o".to_string(),
            manager_deployment: None,
            api_key_env: "AZURE_OPENAI_API_KEY".to_string(),
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub count_per_context: u32,
    pub timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_BING_ENDPOINT.to_string(),
            api_key_env: "BING_SEARCH_API_KEY".to_string(),
            count_per_context: 3,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinksConfig {
    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub retry_backoff_ms: u64,
    pub max_concurrent: usize,
    pub accept_invalid_certs: bool,
}

impl Default for LinksConfig {
    fn default() -> Self {
        let defaults = LinkCheckSettings::default();
        Self {
            timeout_ms: defaults.timeout.as_millis() as u64,
            max_redirects: defaults.max_redirects,
            retry_backoff_ms: defaults.retry_backoff.as_millis() as u64,
            max_concurrent: defaults.max_concurrent,
            accept_invalid_certs: defaults.accept_invalid_certs,
        }
    }
}

impl LinksConfig {
    pub fn settings(&self) -> LinkCheckSettings {
        LinkCheckSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            max_redirects: self.max_redirects,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_concurrent: self.max_concurrent,
            accept_invalid_certs: self.accept_invalid_certs,
            ..LinkCheckSettings::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub agent_timeout_ms: u64,
    pub history_window: usize,
    pub max_search_rounds: u32,
    /// Extra attempts for throttled or dropped model calls.
    pub model_retries: u32,
    pub model_backoff_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            agent_timeout_ms: 120_000,
            history_window: 5,
            max_search_rounds: 3,
            model_retries: 1,
            model_backoff_ms: 500,
        }
    }
}

impl OrchestratorConfig {
    pub fn controller_options(&self, expose_monologue: bool) -> ControllerOptions {
        ControllerOptions {
            max_iterations: self.max_iterations,
            agent_timeout: Duration::from_millis(self.agent_timeout_ms),
            history_window: self.history_window,
            expose_monologue,
        }
    }

    pub fn agent_options(&self, links: &LinksConfig) -> AgentOptions {
        let initial_backoff = Duration::from_millis(self.model_backoff_ms);
        AgentOptions {
            max_search_rounds: self.max_search_rounds,
            max_concurrent_links: links.max_concurrent,
            link_timeout: links.settings().verdict_budget(),
            retry: RetryPolicy {
                max_retries: self.model_retries,
                initial_backoff,
                max_backoff: initial_backoff * 8,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Context labels or slugs; unknown values are ignored.
    pub default_contexts: Vec<String>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            default_contexts: vec![ResearchContext::AzureAi.label().to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for `cycles.jsonl`; unset disables the cycle log.
    pub cycle_log_dir: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            cycle_log_dir: None,
            retention_days: 90,
        }
    }
}
