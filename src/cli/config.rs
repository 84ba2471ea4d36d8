use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

use crate::{
    core::{
        runner::{DutLogin, RunnerSettings},
        servo::ServoTiming,
        session::{DEFAULT_ITERATION_COUNT, DEFAULT_MARGIN_MILLIS},
    },
    protocol::{
        link::{DeviceCategory, SerialLink, SharedLink},
        runtime::SerialConfig,
    },
};

/// Serial device of one side of the fixture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Port path; unset means no device selected
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub serial: SerialConfig,
}

impl DeviceConfig {
    pub fn link(&self, category: DeviceCategory) -> SharedLink {
        Arc::new(SerialLink::new(
            category,
            self.port.clone(),
            self.serial.clone(),
        ))
    }
}

/// Pacing and timeout values, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    #[serde(default = "default_stale_request_timeout_ms")]
    pub stale_request_timeout_ms: u64,
    #[serde(default = "default_command_pacing_ms")]
    pub command_pacing_ms: u64,
    #[serde(default = "default_settle_quiet_ms")]
    pub settle_quiet_ms: u64,
    #[serde(default = "default_settle_limit_ms")]
    pub settle_limit_ms: u64,
}

fn default_request_interval_ms() -> u64 {
    100
}

fn default_stale_request_timeout_ms() -> u64 {
    1000
}

fn default_command_pacing_ms() -> u64 {
    20
}

fn default_settle_quiet_ms() -> u64 {
    300
}

fn default_settle_limit_ms() -> u64 {
    3000
}

fn default_margin_ms() -> i64 {
    DEFAULT_MARGIN_MILLIS
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATION_COUNT
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: default_request_interval_ms(),
            stale_request_timeout_ms: default_stale_request_timeout_ms(),
            command_pacing_ms: default_command_pacing_ms(),
            settle_quiet_ms: default_settle_quiet_ms(),
            settle_limit_ms: default_settle_limit_ms(),
        }
    }
}

/// Root configuration of a measurement run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    #[serde(default)]
    pub servo: DeviceConfig,
    #[serde(default)]
    pub dut: DeviceConfig,
    #[serde(default = "default_margin_ms")]
    pub margin_ms: i64,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Workload bodies, one configuration slot each
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Answer the DUT console login prompt when set
    #[serde(default)]
    pub dut_login: Option<DutLogin>,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            servo: DeviceConfig::default(),
            dut: DeviceConfig::default(),
            margin_ms: default_margin_ms(),
            iterations: default_iterations(),
            scripts: Vec::new(),
            timing: TimingConfig::default(),
            dut_login: None,
        }
    }
}

impl MeasurementConfig {
    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Read configuration from a file
    pub fn from_file(file_path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read configuration file {file_path}"))?;
        Self::from_json(&content)
            .map_err(|err| anyhow!("Invalid configuration file {file_path}: {err}"))
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Replace the configured scripts with the contents of `files`. No files
    /// keeps the configured scripts.
    pub fn override_scripts(&mut self, files: &[String]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        self.scripts = files
            .iter()
            .map(|path| {
                std::fs::read_to_string(path)
                    .map(|body| body.trim_end().to_string())
                    .with_context(|| format!("Failed to read script {path}"))
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        let t = &self.timing;
        RunnerSettings {
            servo: ServoTiming {
                // tokio intervals reject a zero period
                request_interval: Duration::from_millis(t.request_interval_ms.max(1)),
                stale_request_timeout: Duration::from_millis(t.stale_request_timeout_ms),
            },
            command_pacing: Duration::from_millis(t.command_pacing_ms),
            settle_quiet: Duration::from_millis(t.settle_quiet_ms),
            settle_limit: Duration::from_millis(t.settle_limit_ms),
            login: self.dut_login.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = MeasurementConfig::from_json(r#"{"scripts": ["sleep 5"]}"#).unwrap();
        assert_eq!(config.margin_ms, 300);
        assert_eq!(config.iterations, 2);
        assert_eq!(config.servo.port, None);
        assert_eq!(config.servo.serial.baud, 115_200);
        assert_eq!(config.timing, TimingConfig::default());

        let settings = config.runner_settings();
        assert_eq!(settings.servo.request_interval, Duration::from_millis(100));
        assert_eq!(settings.servo.stale_request_timeout, Duration::from_secs(1));
        assert!(settings.login.is_none());
    }

    #[test]
    fn config_serialization() {
        let config = MeasurementConfig {
            servo: DeviceConfig {
                port: Some("/dev/ttyUSB0".to_string()),
                serial: SerialConfig::default(),
            },
            dut: DeviceConfig {
                port: Some("/dev/ttyUSB3".to_string()),
                serial: SerialConfig::default(),
            },
            scripts: vec!["stress-ng -c 1 -t 10".to_string(), "sleep 10".to_string()],
            dut_login: Some(DutLogin::default()),
            ..MeasurementConfig::default()
        };

        let json = config.to_json().unwrap();
        let parsed = MeasurementConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(
            parsed.runner_settings().login.map(|l| l.prompt),
            Some("localhost login:".to_string())
        );
    }

    #[test]
    fn partial_login_section_uses_defaults() {
        let config =
            MeasurementConfig::from_json(r#"{"dut_login": {"password": "secret"}}"#).unwrap();
        let login = config.dut_login.unwrap();
        assert_eq!(login.user, "root");
        assert_eq!(login.password, "secret");
    }
}
