//! Environment-sourced configuration
//!
//! All configuration is read once at startup into an immutable [`Config`].
//! Each integration exposes a feature gate derived from "all required keys
//! present". In production a missing required key aborts startup; in
//! development the affected feature degrades to a no-op.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    MissingRequired(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Deployment mode, from `VIGIL_ENV` (default `development`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Development,
    Production,
}

impl RunMode {
    pub fn is_production(self) -> bool {
        matches!(self, RunMode::Production)
    }
}

/// Which LLM provider the detector prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    /// Pick whichever provider has a key configured, Anthropic first.
    #[default]
    Auto,
}

impl LlmProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAi),
            "anthropic" => Some(LlmProvider::Anthropic),
            "auto" => Some(LlmProvider::Auto),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Auto => "auto",
        }
    }
}

/// Railway API + monitoring scope.
#[derive(Debug, Clone, Default)]
pub struct RailwayConfig {
    pub api_token: Option<String>,
    pub projects: Vec<String>,
    pub environments: Vec<String>,
    /// Empty means "all services in each environment".
    pub services: Vec<String>,
}

impl RailwayConfig {
    pub fn enabled(&self) -> bool {
        self.api_token.is_some() && !self.projects.is_empty()
    }
}

/// Slack alerting + interactive controls.
#[derive(Debug, Clone, Default)]
pub struct SlackConfig {
    pub bot_token: Option<String>,
    pub signing_secret: Option<String>,
    pub channel_id: Option<String>,
}

impl SlackConfig {
    pub fn enabled(&self) -> bool {
        self.bot_token.is_some() && self.signing_secret.is_some() && self.channel_id.is_some()
    }
}

/// LLM classification lane.
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

impl LlmConfig {
    pub fn enabled(&self) -> bool {
        self.openai_api_key.is_some() || self.anthropic_api_key.is_some()
    }
}

/// Performance tunables. Every field has a default; env overrides are
/// parsed leniently (unparseable values fall back to the default).
#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_retry_attempts: u32,
    pub max_backoff: Duration,
    pub rate_limit_per_hour: u32,
    pub rate_limit_per_second: u32,
    pub polling_interval: Duration,
    pub batch_min: usize,
    pub batch_max: usize,
    pub batch_window_min: Duration,
    pub batch_window_max: Duration,
    pub buffer_retention_hours: u32,
    pub memory_limit_mb: u32,
    pub retention_days: i64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(45),
            max_retry_attempts: 10,
            max_backoff: Duration::from_secs(60),
            rate_limit_per_hour: 10_000,
            rate_limit_per_second: 50,
            polling_interval: Duration::from_secs(30),
            batch_min: 10,
            batch_max: 1_000,
            batch_window_min: Duration::from_secs(5),
            batch_window_max: Duration::from_secs(300),
            buffer_retention_hours: 24,
            memory_limit_mb: 512,
            retention_days: 90,
        }
    }
}

/// Immutable application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: RunMode,
    pub port: u16,
    pub db_path: String,
    pub railway: RailwayConfig,
    pub slack: SlackConfig,
    pub llm: LlmConfig,
    pub perf: PerformanceConfig,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_csv(key: &str) -> Vec<String> {
    env_var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Validation is mode-dependent: production requires the Railway token,
    /// at least one monitored project, one LLM key, and the Slack signing
    /// secret whenever a bot token is present. Development accepts any
    /// subset and degrades the missing features.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match env_var("VIGIL_ENV").as_deref() {
            Some("production" | "prod") => RunMode::Production,
            _ => RunMode::Development,
        };

        let port = env_var("VIGIL_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let db_path = env_var("VIGIL_DB_PATH").unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.vigil/vigil.db")
        });

        let mut environments = env_csv("MONITORED_ENVIRONMENTS");
        if environments.is_empty() {
            environments.push("production".to_string());
        }

        let railway = RailwayConfig {
            api_token: env_var("RAILWAY_API_TOKEN"),
            projects: env_csv("MONITORED_PROJECTS"),
            environments,
            services: env_csv("MONITORED_SERVICES"),
        };

        let slack = SlackConfig {
            bot_token: env_var("SLACK_BOT_TOKEN"),
            signing_secret: env_var("SLACK_SIGNING_SECRET"),
            channel_id: env_var("SLACK_CHANNEL_ID"),
        };

        let provider = match env_var("DEFAULT_LLM_PROVIDER") {
            Some(raw) => LlmProvider::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: "DEFAULT_LLM_PROVIDER",
                value: raw,
            })?,
            None => LlmProvider::Auto,
        };

        let llm = LlmConfig {
            provider,
            openai_api_key: env_var("OPENAI_API_KEY"),
            anthropic_api_key: env_var("ANTHROPIC_API_KEY"),
        };

        let defaults = PerformanceConfig::default();
        let perf = PerformanceConfig {
            connection_timeout: Duration::from_secs(env_u64("CONNECTION_TIMEOUT_S", 30)),
            heartbeat_interval: Duration::from_secs(env_u64("HEARTBEAT_INTERVAL_S", 30)),
            heartbeat_timeout: Duration::from_secs(env_u64("HEARTBEAT_TIMEOUT_S", 45)),
            max_retry_attempts: u32::try_from(env_u64("MAX_RETRY_ATTEMPTS", 10)).unwrap_or(10),
            max_backoff: Duration::from_secs(env_u64("MAX_BACKOFF_S", 60)),
            rate_limit_per_hour: u32::try_from(env_u64("RATE_LIMIT_HR", 10_000)).unwrap_or(10_000),
            rate_limit_per_second: u32::try_from(env_u64("RATE_LIMIT_SEC", 50)).unwrap_or(50),
            polling_interval: Duration::from_secs(env_u64("POLLING_INTERVAL_S", 30)),
            batch_min: usize::try_from(env_u64("BATCH_MIN", 10)).unwrap_or(defaults.batch_min),
            batch_max: usize::try_from(env_u64("BATCH_MAX", 1_000)).unwrap_or(defaults.batch_max),
            batch_window_min: Duration::from_secs(env_u64("BATCH_WINDOW_MIN_S", 5)),
            batch_window_max: Duration::from_secs(env_u64("BATCH_WINDOW_MAX_S", 300)),
            buffer_retention_hours: u32::try_from(env_u64("BUFFER_RETENTION_H", 24)).unwrap_or(24),
            memory_limit_mb: u32::try_from(env_u64("MEMORY_LIMIT_MB", 512)).unwrap_or(512),
            retention_days: i64::try_from(env_u64("RETENTION_DAYS", 90)).unwrap_or(90),
        };

        let config = Self {
            mode,
            port,
            db_path,
            railway,
            slack,
            llm,
            perf,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.mode.is_production() {
            return Ok(());
        }
        if self.railway.api_token.is_none() {
            return Err(ConfigError::MissingRequired("RAILWAY_API_TOKEN"));
        }
        if self.railway.projects.is_empty() {
            return Err(ConfigError::MissingRequired("MONITORED_PROJECTS"));
        }
        if !self.llm.enabled() {
            return Err(ConfigError::MissingRequired(
                "OPENAI_API_KEY or ANTHROPIC_API_KEY",
            ));
        }
        // Accepting unsigned Slack traffic is never allowed; a bot token
        // without a signing secret is a misconfiguration, not a degrade.
        if self.slack.bot_token.is_some() && self.slack.signing_secret.is_none() {
            return Err(ConfigError::MissingRequired("SLACK_SIGNING_SECRET"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_round_trip() {
        for p in [LlmProvider::OpenAi, LlmProvider::Anthropic, LlmProvider::Auto] {
            assert_eq!(LlmProvider::parse(p.as_str()), Some(p));
        }
        assert_eq!(LlmProvider::parse("gemini"), None);
    }

    #[test]
    fn test_feature_gates() {
        let railway = RailwayConfig {
            api_token: Some("tok".into()),
            projects: vec!["p1".into()],
            ..RailwayConfig::default()
        };
        assert!(railway.enabled());
        assert!(!RailwayConfig::default().enabled());

        let slack = SlackConfig {
            bot_token: Some("xoxb".into()),
            signing_secret: Some("sec".into()),
            channel_id: Some("C123".into()),
        };
        assert!(slack.enabled());
        assert!(!SlackConfig {
            signing_secret: None,
            ..slack
        }
        .enabled());
    }

    #[test]
    fn test_production_requires_signing_secret_with_bot_token() {
        let config = Config {
            mode: RunMode::Production,
            port: 8080,
            db_path: ":memory:".into(),
            railway: RailwayConfig {
                api_token: Some("tok".into()),
                projects: vec!["p1".into()],
                environments: vec!["production".into()],
                services: vec![],
            },
            slack: SlackConfig {
                bot_token: Some("xoxb".into()),
                signing_secret: None,
                channel_id: Some("C1".into()),
            },
            llm: LlmConfig {
                provider: LlmProvider::Auto,
                openai_api_key: Some("sk".into()),
                anthropic_api_key: None,
            },
            perf: PerformanceConfig::default(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired("SLACK_SIGNING_SECRET"))
        ));
    }

    #[test]
    fn test_development_accepts_empty() {
        let config = Config {
            mode: RunMode::Development,
            port: 8080,
            db_path: ":memory:".into(),
            railway: RailwayConfig::default(),
            slack: SlackConfig::default(),
            llm: LlmConfig::default(),
            perf: PerformanceConfig::default(),
        };
        assert!(config.validate().is_ok());
    }
}
