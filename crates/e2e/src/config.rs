//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};
use crate::spec::FormatChoice;

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory containing the spec files
    pub spec_dir: PathBuf,

    /// Glob of spec files, relative to `spec_dir`
    pub test_glob: String,

    /// Spec file layout
    pub format: FormatChoice,

    /// Only check the original response, no capture servers
    pub curl_only: bool,

    /// Log URLs and captured records
    pub verbose: bool,

    /// Print each test description and exit
    pub describe_only: bool,

    /// How long to wait for each duplicate
    pub wait_timeout_ms: u64,

    /// How long to keep listening for extra duplicates once a test's
    /// expected duplicates have all matched
    pub settle_ms: u64,

    /// Proxy under test
    pub proxy: ProxyConfig,

    /// Duplication targets
    pub capture: CaptureConfig,

    /// Latency budget checks
    pub timing: TimingConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            spec_dir: PathBuf::from("data"),
            test_glob: "*.req".to_string(),
            format: FormatChoice::Auto,
            curl_only: false,
            verbose: false,
            describe_only: false,
            wait_timeout_ms: 3000,
            settle_ms: 200,
            proxy: ProxyConfig::default(),
            capture: CaptureConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

/// Where original requests are sent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,

    /// Client timeout for the original request
    pub request_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8042,
            request_timeout_ms: 30_000,
        }
    }
}

/// Capture server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub host: String,

    /// Primary duplication target (0 = ephemeral)
    pub primary_port: u16,

    /// Secondary duplication target (0 = ephemeral)
    pub secondary_port: u16,

    /// Path token that makes a capture server stall
    pub delay_marker: String,

    /// Stall before the record is delivered
    pub delay_ms: u64,

    /// Give up on a capture server that does not accept connections
    pub startup_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            primary_port: 8043,
            secondary_port: 16555,
            delay_marker: "delay".to_string(),
            delay_ms: 2000,
            startup_timeout_ms: 5000,
        }
    }
}

/// Latency window for requests carrying the sleep marker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Path token that triggers the latency check
    pub sleep_marker: String,

    /// Duplication delay configured on the proxy
    pub delay_ms: u64,

    pub slack_below_ms: u64,
    pub slack_above_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sleep_marker: "sleep".to_string(),
            delay_ms: 1500,
            slack_below_ms: 1,
            slack_above_ms: 51,
        }
    }
}

impl TimingConfig {
    /// Inclusive bounds on the elapsed time, in milliseconds
    pub fn window(&self) -> (u64, u64) {
        (
            self.delay_ms.saturating_sub(self.slack_below_ms),
            self.delay_ms + self.slack_above_ms,
        )
    }
}

impl HarnessConfig {
    /// Load configuration from file, defaults when it does not exist
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings that can never produce a meaningful run
    pub fn validate(&self) -> E2eResult<()> {
        if !self.curl_only
            && self.capture.primary_port != 0
            && self.capture.primary_port == self.capture.secondary_port
        {
            return Err(E2eError::Config(format!(
                "primary and secondary capture ports are both {}",
                self.capture.primary_port
            )));
        }
        if self.test_glob.is_empty() {
            return Err(E2eError::Config("empty test glob".to_string()));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Glob as displayed in messages
    pub fn test_pattern(&self) -> String {
        self.spec_dir.join(&self.test_glob).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let config = HarnessConfig::default();
        assert_eq!(config.proxy.port, 8042);
        assert_eq!(config.capture.primary_port, 8043);
        assert_eq!(config.capture.secondary_port, 16555);
        assert_eq!(config.timing.window(), (1499, 1551));
        assert_eq!(config.wait_timeout(), Duration::from_secs(3));
        assert_eq!(config.settle(), Duration::from_millis(200));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: HarnessConfig = toml::from_str(
            r#"
test_glob = "dup_*.req"
format = "dup"

[capture]
secondary_port = 17000

[timing]
delay_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(config.test_glob, "dup_*.req");
        assert_eq!(config.format, FormatChoice::Dup);
        assert_eq!(config.capture.secondary_port, 17000);
        assert_eq!(config.capture.primary_port, 8043);
        assert_eq!(config.timing.window(), (499, 551));
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let config = HarnessConfig::load(Path::new("/nonexistent/duptest.toml")).unwrap();
        assert_eq!(config.test_glob, "*.req");
    }

    #[test]
    fn test_same_capture_ports_rejected() {
        let mut config = HarnessConfig::default();
        config.capture.secondary_port = config.capture.primary_port;
        assert!(matches!(config.validate(), Err(E2eError::Config(_))));

        config.curl_only = true;
        assert!(config.validate().is_ok());
    }
}
