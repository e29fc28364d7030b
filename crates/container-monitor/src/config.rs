// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::MonitorError;
use std::env;
use std::time::Duration;

const DEFAULT_INSTANCE_ID: &str = "i-dev";
const DEFAULT_AGENT_IMAGE_PREFIXES: &str = "goodeggs/convox-agent,agent/agent";
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_CGROUP_MEMORY_ROOT: &str = "/cgroup/memory/docker";
const DEFAULT_CGROUP_SETUP_DELAY_MS: u64 = 1000;
const DEFAULT_BACKOFF_MIN_MS: u64 = 50;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;

/// Agent configuration, read once from the process environment
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Container runtime endpoint. `None` uses the local socket.
    pub docker_host: Option<String>,
    /// Identity of this host, used in log prefixes and health escalation
    pub instance_id: String,
    /// Optional client identifier attached to error reports
    pub client_id: Option<String>,
    /// Image name prefixes that identify the agent's own container
    pub agent_image_prefixes: Vec<String>,
    /// Period of the batched stream forwarder
    pub flush_interval: Duration,
    /// Directory holding per-container memory cgroups
    pub cgroup_memory_root: String,
    /// Delay before touching cgroup files of a freshly started container
    pub cgroup_setup_delay: Duration,
    /// Lower bound of the log subscription reconnect backoff
    pub logs_retry_backoff_min: Duration,
    /// Upper bound of the log subscription reconnect backoff
    pub logs_retry_backoff_max: Duration,
    pub development: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            docker_host: None,
            instance_id: DEFAULT_INSTANCE_ID.to_string(),
            client_id: None,
            agent_image_prefixes: parse_list(DEFAULT_AGENT_IMAGE_PREFIXES),
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            cgroup_memory_root: DEFAULT_CGROUP_MEMORY_ROOT.to_string(),
            cgroup_setup_delay: Duration::from_millis(DEFAULT_CGROUP_SETUP_DELAY_MS),
            logs_retry_backoff_min: Duration::from_millis(DEFAULT_BACKOFF_MIN_MS),
            logs_retry_backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            development: false,
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, MonitorError> {
        let log_level = env::var("LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());
        let docker_host = env::var("DOCKER_HOST").ok().filter(|v| !v.is_empty());
        let instance_id = env::var("INSTANCE_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_string());
        let client_id = env::var("CLIENT_ID").ok().filter(|v| !v.is_empty());
        let agent_image_prefixes = parse_list(
            &env::var("AGENT_IMAGE_PREFIXES")
                .unwrap_or_else(|_| DEFAULT_AGENT_IMAGE_PREFIXES.to_string()),
        );
        let flush_interval = Duration::from_millis(millis_var(
            "FLUSH_INTERVAL_MS",
            DEFAULT_FLUSH_INTERVAL_MS,
        )?);
        let cgroup_memory_root = env::var("CGROUP_MEMORY_ROOT")
            .unwrap_or_else(|_| DEFAULT_CGROUP_MEMORY_ROOT.to_string());
        let cgroup_setup_delay = Duration::from_millis(millis_var(
            "CGROUP_SETUP_DELAY_MS",
            DEFAULT_CGROUP_SETUP_DELAY_MS,
        )?);
        let logs_retry_backoff_min = Duration::from_millis(millis_var(
            "LOGS_RETRY_BACKOFF_MIN_MS",
            DEFAULT_BACKOFF_MIN_MS,
        )?);
        let logs_retry_backoff_max = Duration::from_millis(millis_var(
            "LOGS_RETRY_BACKOFF_MAX_MS",
            DEFAULT_BACKOFF_MAX_MS,
        )?);
        let development = env::var("DEVELOPMENT")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(false);

        let config = Self {
            log_level,
            docker_host,
            instance_id,
            client_id,
            agent_image_prefixes,
            flush_interval,
            cgroup_memory_root,
            cgroup_setup_delay,
            logs_retry_backoff_min,
            logs_retry_backoff_max,
            development,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), MonitorError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(MonitorError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.flush_interval.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "FLUSH_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        if self.logs_retry_backoff_min.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "LOGS_RETRY_BACKOFF_MIN_MS must be greater than 0".to_string(),
            ));
        }

        if self.logs_retry_backoff_min > self.logs_retry_backoff_max {
            return Err(MonitorError::InvalidConfig(
                "LOGS_RETRY_BACKOFF_MIN_MS cannot exceed LOGS_RETRY_BACKOFF_MAX_MS".to_string(),
            ));
        }

        if self.cgroup_memory_root.trim().is_empty() {
            return Err(MonitorError::InvalidConfig(
                "CGROUP_MEMORY_ROOT cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether an image name belongs to the agent itself
    pub fn is_agent_image(&self, image: &str) -> bool {
        self.agent_image_prefixes
            .iter()
            .any(|prefix| image.starts_with(prefix.as_str()))
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn millis_var(name: &str, default: u64) -> Result<u64, MonitorError> {
    match env::var(name) {
        Ok(val) => val.trim().parse::<u64>().map_err(|_| {
            MonitorError::InvalidConfig(format!("{name} must be a number of milliseconds"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = AgentConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let config = AgentConfig {
            logs_retry_backoff_min: Duration::from_secs(5),
            logs_retry_backoff_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            logs_retry_backoff_min: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_flush_interval() {
        let config = AgentConfig {
            flush_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_image_detection() {
        let config = AgentConfig::default();
        assert!(config.is_agent_image("goodeggs/convox-agent:0.71"));
        assert!(config.is_agent_image("agent/agent:latest"));
        assert!(!config.is_agent_image("httpd:2.4"));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        env::set_var("LOG_LEVEL", "DEBUG");
        env::set_var("INSTANCE_ID", "i-553ffcd2");
        env::set_var("AGENT_IMAGE_PREFIXES", "acme/agent, other/agent");
        env::set_var("FLUSH_INTERVAL_MS", "250");

        let config = AgentConfig::from_env().expect("config should load");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.instance_id, "i-553ffcd2");
        assert_eq!(
            config.agent_image_prefixes,
            vec!["acme/agent".to_string(), "other/agent".to_string()]
        );
        assert_eq!(config.flush_interval, Duration::from_millis(250));

        env::remove_var("LOG_LEVEL");
        env::remove_var("INSTANCE_ID");
        env::remove_var("AGENT_IMAGE_PREFIXES");
        env::remove_var("FLUSH_INTERVAL_MS");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_non_numeric_interval() {
        env::set_var("FLUSH_INTERVAL_MS", "fast");
        let config = AgentConfig::from_env();
        assert!(config.is_err());
        assert_eq!(
            config.unwrap_err().to_string(),
            "Invalid configuration: FLUSH_INTERVAL_MS must be a number of milliseconds"
        );
        env::remove_var("FLUSH_INTERVAL_MS");
    }
}
