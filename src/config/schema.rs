//! Configuration tree and validation.
//!
//! The on-disk file is JSON, deep-merged over these defaults by the loader.
//! Validation errors carry the dotted path of the offending key so a typo
//! is a one-line fix, not a stack trace.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::router::{AgentProfile, AgentRule};
use crate::config::loader::ConfigError;

pub const LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];
pub const AUTONOMY_LEVELS: &[&str] = &["readonly", "supervised", "full"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSection,
    pub gateway: GatewaySection,
    pub security: SecuritySection,
    pub autonomy: AutonomySection,
    pub observability: ObservabilitySection,
    pub memory: MemorySection,
    pub engines: EnginesSection,
    pub tunnel: TunnelSection,
    pub secrets: SecretsSection,
    pub routing: RoutingSection,
    pub scheduler: SchedulerSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentSection::default(),
            gateway: GatewaySection::default(),
            security: SecuritySection::default(),
            autonomy: AutonomySection::default(),
            observability: ObservabilitySection::default(),
            memory: MemorySection::default(),
            engines: EnginesSection::default(),
            tunnel: TunnelSection::default(),
            secrets: SecretsSection::default(),
            routing: RoutingSection::default(),
            scheduler: SchedulerSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub model: String,
    pub provider: String,
    pub system_prompt: String,
    pub max_iterations: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            provider: "anthropic".to_string(),
            system_prompt: "You are a helpful personal assistant.".to_string(),
            max_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub host: String,
    /// Kept wide so out-of-range values are caught by validation with a
    /// useful message instead of a deserialization failure.
    pub port: u64,
    pub session_idle_minutes: u64,
    pub drain_timeout_secs: u64,
    pub pairing_enabled: bool,
    pub identity_enabled: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8710,
            session_idle_minutes: 240,
            drain_timeout_secs: 30,
            pairing_enabled: true,
            identity_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub allowed_paths: Vec<String>,
    pub blocked_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomySection {
    pub level: String,
}

impl Default for AutonomySection {
    fn default() -> Self {
        Self {
            level: "supervised".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub log_level: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub enabled: bool,
    pub recall_limit: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            recall_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesSection {
    pub default: String,
    pub subprocess_command: Option<String>,
}

impl Default for EnginesSection {
    fn default() -> Self {
        Self {
            default: "mock".to_string(),
            subprocess_command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub enabled: bool,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsSection {
    /// Sidecar `KEY=VALUE` file consulted during `${VAR}` substitution.
    pub env_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub rules: Vec<AgentRule>,
    pub agents: HashMap<String, AgentProfile>,
    pub mesh_enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub jobs: Vec<SchedulerJobSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerJobSection {
    pub name: String,
    pub schedule: String,
    pub message: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Checks enumerations, ranges and required values. The message names
    /// the offending key by its dotted path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.model.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.model must not be empty".into()));
        }
        if self.agent.provider.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "agent.provider must not be empty".into(),
            ));
        }
        if self.gateway.port < 1 || self.gateway.port > 65_535 {
            return Err(ConfigError::Invalid("gateway.port out of range".into()));
        }
        if !AUTONOMY_LEVELS.contains(&self.autonomy.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "autonomy.level must be one of {}",
                AUTONOMY_LEVELS.join("|")
            )));
        }
        if !LOG_LEVELS.contains(&self.observability.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "observability.log_level must be one of {}",
                LOG_LEVELS.join("|")
            )));
        }
        if self.engines.default.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "engines.default must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.gateway.port as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_port_out_of_range() {
        let mut config = Config::default();
        config.gateway.port = 99_999;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gateway.port out of range"));

        config.gateway.port = 0;
        assert!(config.validate().is_err());

        config.gateway.port = 65_535;
        assert!(config.validate().is_ok());
        config.gateway.port = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_autonomy_level() {
        let mut config = Config::default();
        config.autonomy.level = "root".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("autonomy.level"));
    }

    #[test]
    fn test_bad_log_level() {
        let mut config = Config::default();
        config.observability.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("observability.log_level"));
    }

    #[test]
    fn test_empty_model_rejected() {
        let mut config = Config::default();
        config.agent.model = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("agent.model"));
    }

    #[test]
    fn test_partial_json_gets_defaults() {
        let config: Config = serde_json::from_str(r#"{"gateway": {"port": 9000}}"#).unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.observability.log_level, "info");
        assert_eq!(config.agent.max_iterations, 20);
    }
}
