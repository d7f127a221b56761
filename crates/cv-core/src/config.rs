use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.conveyor/config.toml`
/// (or the file named by `CONVEYOR_CONFIG`).
///
/// **Security**: This struct NEVER stores API keys, tokens, or secrets.
/// Sections only hold the *names* of environment variables; see
/// [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    pub const ENV_PATH: &'static str = "CONVEYOR_CONFIG";

    /// Load from `CONVEYOR_CONFIG` or `~/.conveyor/config.toml`, falling back
    /// to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(Self::ENV_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agents.validate()?;
        self.pipeline.validate()?;
        if self.llm.initial_backoff_ms > self.llm.max_backoff_ms {
            return Err(ConfigError::Validation(
                "llm.initial_backoff_ms must not exceed llm.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// `{repo_root}/{state_dir}`, the root of every persisted document.
    pub fn state_root(&self) -> PathBuf {
        self.general.repo_root.join(&self.general.state_dir)
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conveyor")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Backlog JSON file, relative to `repo_root` unless absolute.
    #[serde(default = "default_stories_file")]
    pub stories_file: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            project_name: default_project_name(),
            repo_root: default_repo_root(),
            state_dir: default_state_dir(),
            base_branch: default_base_branch(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            stories_file: default_stories_file(),
        }
    }
}

fn default_project_id() -> String {
    "default".into()
}
fn default_project_name() -> String {
    "conveyor".into()
}
fn default_repo_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_state_dir() -> String {
    ".conveyor".into()
}
fn default_base_branch() -> String {
    "main".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_stories_file() -> PathBuf {
    PathBuf::from("stories.json")
}

/// Provider + model assignment for one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    8192
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Developer agent.
    #[serde(default = "default_amelia")]
    pub amelia: AgentModelConfig,
    /// Reviewer agent.
    #[serde(default = "default_alex")]
    pub alex: AgentModelConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            amelia: default_amelia(),
            alex: default_alex(),
        }
    }
}

fn default_amelia() -> AgentModelConfig {
    AgentModelConfig {
        provider: "anthropic".into(),
        model: "claude-sonnet-4-20250514".into(),
        max_tokens: default_max_tokens(),
        temperature: default_temperature(),
    }
}

fn default_alex() -> AgentModelConfig {
    AgentModelConfig {
        provider: "openai".into(),
        model: "gpt-4o".into(),
        max_tokens: default_max_tokens(),
        temperature: 0.1,
    }
}

impl AgentsConfig {
    /// The reviewer only provides independent judgment if it runs on a
    /// different model than the developer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, agent) in [("amelia", &self.amelia), ("alex", &self.alex)] {
            if agent.provider.trim().is_empty() || agent.model.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "agents.{name} needs both provider and model"
                )));
            }
            if !(0.0..=2.0).contains(&agent.temperature) {
                return Err(ConfigError::Validation(format!(
                    "agents.{name}.temperature must be within 0.0..=2.0"
                )));
            }
        }
        if self.amelia.provider == self.alex.provider && self.amelia.model == self.alex.model {
            return Err(ConfigError::Validation(format!(
                "amelia and alex must use different models (both {}/{})",
                self.amelia.provider, self.amelia.model
            )));
        }
        Ok(())
    }
}

/// Retry policy shared by every LLM client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_request_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_anthropic_key_env")]
    pub anthropic_key_env: String,
    #[serde(default = "default_openai_key_env")]
    pub openai_key_env: String,
    /// Local inference server base URL (OpenAI-compatible).
    #[serde(default = "default_local_base_url")]
    pub local_base_url: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic_key_env: default_anthropic_key_env(),
            openai_key_env: default_openai_key_env(),
            local_base_url: default_local_base_url(),
        }
    }
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_local_base_url() -> String {
    "http://127.0.0.1:11434".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    /// Env var name for the GitHub token (default: `GITHUB_TOKEN`).
    #[serde(default = "default_github_env")]
    pub token_env: String,
    /// Labels added to every PR on top of `ai-generated`, `reviewed` and
    /// `epic-{N}`.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub team_reviewers: Vec<String>,
    /// `merge`, `squash` or `rebase`.
    #[serde(default = "default_merge_method")]
    pub merge_method: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: None,
            repo: None,
            token_env: default_github_env(),
            labels: Vec::new(),
            reviewers: Vec::new(),
            team_reviewers: Vec::new(),
            merge_method: default_merge_method(),
        }
    }
}

fn default_github_env() -> String {
    "GITHUB_TOKEN".into()
}
fn default_merge_method() -> String {
    "squash".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// When false, PRs stop at `review` and CI is not monitored.
    #[serde(default = "default_true")]
    pub auto_merge_enabled: bool,
    #[serde(default = "default_ci_polling_interval_secs")]
    pub ci_polling_interval_secs: u64,
    #[serde(default = "default_max_ci_wait_time_secs")]
    pub max_ci_wait_time_secs: u64,
    #[serde(default = "default_max_ci_retries")]
    pub max_ci_retries: u32,
    #[serde(default = "default_ci_retry_delay_secs")]
    pub ci_retry_delay_secs: u64,
    /// How long a PR head may report no check runs at all before CI is
    /// taken as absent and the PR counts as green.
    #[serde(default = "default_ci_no_checks_grace_secs")]
    pub ci_no_checks_grace_secs: u64,
    #[serde(default = "default_max_escalations")]
    pub max_escalations: usize,
    #[serde(default = "default_max_parallel_stories")]
    pub max_parallel_stories: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_merge_enabled: true,
            ci_polling_interval_secs: default_ci_polling_interval_secs(),
            max_ci_wait_time_secs: default_max_ci_wait_time_secs(),
            max_ci_retries: default_max_ci_retries(),
            ci_retry_delay_secs: default_ci_retry_delay_secs(),
            ci_no_checks_grace_secs: default_ci_no_checks_grace_secs(),
            max_escalations: default_max_escalations(),
            max_parallel_stories: default_max_parallel_stories(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ci_polling_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "pipeline.ci_polling_interval_secs must be > 0".into(),
            ));
        }
        if self.max_escalations == 0 {
            return Err(ConfigError::Validation(
                "pipeline.max_escalations must be >= 1".into(),
            ));
        }
        if self.max_parallel_stories == 0 {
            return Err(ConfigError::Validation(
                "pipeline.max_parallel_stories must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_ci_polling_interval_secs() -> u64 {
    30
}
fn default_max_ci_wait_time_secs() -> u64 {
    1800
}
fn default_max_ci_retries() -> u32 {
    2
}
fn default_ci_retry_delay_secs() -> u64 {
    60
}
fn default_ci_no_checks_grace_secs() -> u64 {
    120
}
fn default_max_escalations() -> usize {
    3
}
fn default_max_parallel_stories() -> usize {
    4
}

// ---------------------------------------------------------------------------
// CredentialProvider
// ---------------------------------------------------------------------------

/// Reads credentials from environment variables at runtime.
///
/// Config stores env var *names*; this resolves them to values on demand.
/// Empty values count as unset.
pub struct CredentialProvider;

impl CredentialProvider {
    pub fn resolve(env_name: &str) -> Option<String> {
        std::env::var(env_name).ok().filter(|v| !v.trim().is_empty())
    }

    pub fn github_token(cfg: &GitHubConfig) -> Option<String> {
        Self::resolve(&cfg.token_env)
    }

    pub fn anthropic_api_key(cfg: &ProvidersConfig) -> Option<String> {
        Self::resolve(&cfg.anthropic_key_env)
    }

    pub fn openai_api_key(cfg: &ProvidersConfig) -> Option<String> {
        Self::resolve(&cfg.openai_key_env)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
