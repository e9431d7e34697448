//! # Configuration Management
//!
//! Loads the engine configuration from several layered sources:
//! - Default values (the `Default` impl below)
//! - An optional TOML file (`onboard.toml` in the working directory)
//! - Environment variables prefixed with `APP_`, nested keys split by `__`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`APP_TRANSPORT__URL`, `APP_SESSION__COMPLETION_GRACE_MS`, ...)
//! 2. Configuration file (`onboard.toml`)
//! 3. Default values
//!
//! ## Key Components:
//! - **TransportConfig**: relay URL, wire dialect, reconnect and keep-alive tuning
//! - **AudioConfig**: capture sample rate, buffer size and the capture constraints
//! - **PlaybackConfig**: output sample rate and amplitude cadence
//! - **SessionConfig**: how long a finished session may keep talking
//! - **RunnerConfig**: files used by the headless `onboard-voice` binary

use crate::error::{SessionError, SessionResult};
use crate::transport::WireDialect;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default configuration file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "onboard";

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Connection to the conversational relay.
///
/// ## Fields:
/// - `url`: WebSocket URL of the relay (e.g. "ws://localhost:8000")
/// - `dialect`: which message vocabulary the relay speaks ("direct" or "enveloped")
/// - `max_reconnect_attempts`: reconnects tried after an abnormal drop before giving up
/// - `reconnect_base_delay_ms`: delay before the first reconnect, doubled per attempt
/// - `reconnect_max_delay_ms`: upper bound on a single reconnect delay
/// - `connect_timeout_ms`: how long one connect attempt may take
/// - `keepalive_interval_ms`: ping cadence; 0 disables keep-alive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub url: String,
    pub dialect: WireDialect,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
}

/// Microphone capture settings.
///
/// The three processing flags are requested from the device at acquisition
/// time. `validate` refuses a configuration that turns any of them off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub capture_buffer_size: usize, // samples per outbound frame
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// Agent speech playback settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub output_sample_rate: u32,
    pub amplitude_interval_ms: u64, // roughly one animation frame
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on how long the agent may keep speaking after a terminal tool call.
    pub completion_grace_ms: u64,
}

/// Inputs for the headless runner binary. The library never reads these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub instruction_file: Option<PathBuf>,
    pub input_wav: Option<PathBuf>,
    pub output_wav: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                url: "ws://localhost:8000".to_string(),
                dialect: WireDialect::Direct,
                max_reconnect_attempts: 5,
                reconnect_base_delay_ms: 1_000,
                reconnect_max_delay_ms: 30_000,
                connect_timeout_ms: 10_000,
                keepalive_interval_ms: 20_000,
            },
            audio: AudioConfig {
                input_sample_rate: 16_000,
                capture_buffer_size: 4096,
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
            playback: PlaybackConfig {
                output_sample_rate: 24_000,
                amplitude_interval_ms: 16,
            },
            session: SessionConfig {
                completion_grace_ms: 7_000,
            },
            runner: RunnerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, `onboard.toml` and `APP_*` environment variables.
    pub fn load() -> SessionResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE, false)
    }

    /// Load configuration using `file` (path without extension, or with `.toml`).
    ///
    /// ## Parameters:
    /// - `file`: configuration file to layer over the defaults
    /// - `required`: fail when the file does not exist
    pub fn load_from(file: &str, required: bool) -> SessionResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::with_name(file).required(required))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        Ok(config)
    }

    /// Check that the values can drive a session.
    pub fn validate(&self) -> SessionResult<()> {
        let t = &self.transport;
        if !(t.url.starts_with("ws://") || t.url.starts_with("wss://")) {
            return Err(SessionError::Config(format!(
                "transport.url must be a ws:// or wss:// URL, got {:?}",
                t.url
            )));
        }
        if t.reconnect_base_delay_ms == 0 {
            return Err(SessionError::Config(
                "transport.reconnect_base_delay_ms must be greater than 0".into(),
            ));
        }
        if t.reconnect_max_delay_ms < t.reconnect_base_delay_ms {
            return Err(SessionError::Config(
                "transport.reconnect_max_delay_ms cannot be below the base delay".into(),
            ));
        }
        if t.connect_timeout_ms == 0 {
            return Err(SessionError::Config(
                "transport.connect_timeout_ms must be greater than 0".into(),
            ));
        }

        let a = &self.audio;
        if a.input_sample_rate == 0 || a.capture_buffer_size == 0 {
            return Err(SessionError::Config(
                "audio.input_sample_rate and audio.capture_buffer_size must be greater than 0".into(),
            ));
        }
        if !(a.echo_cancellation && a.noise_suppression && a.auto_gain_control) {
            return Err(SessionError::Config(
                "echo cancellation, noise suppression and auto gain control are required".into(),
            ));
        }

        if self.playback.output_sample_rate == 0 {
            return Err(SessionError::Config(
                "playback.output_sample_rate must be greater than 0".into(),
            ));
        }
        if self.playback.amplitude_interval_ms == 0 {
            return Err(SessionError::Config(
                "playback.amplitude_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML (printed by the runner at startup).
    pub fn to_toml(&self) -> SessionResult<String> {
        toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when keep-alive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
}

impl PlaybackConfig {
    pub fn amplitude_interval(&self) -> Duration {
        Duration::from_millis(self.amplitude_interval_ms)
    }
}

impl SessionConfig {
    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.transport.url, "ws://localhost:8000");
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.playback.output_sample_rate, 24_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.transport.url = "http://localhost:8000".into();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.audio.echo_cancellation = false;
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));

        let mut config = EngineConfig::default();
        config.transport.reconnect_max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keepalive_can_be_disabled() {
        let mut config = EngineConfig::default();
        assert_eq!(
            config.transport.keepalive_interval(),
            Some(Duration::from_secs(20))
        );
        config.transport.keepalive_interval_ms = 0;
        assert_eq!(config.transport.keepalive_interval(), None);
    }

    /// File values override defaults; untouched sections keep their defaults.
    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[transport]
url = "wss://relay.example.test/live"
dialect = "enveloped"
max_reconnect_attempts = 3

[session]
completion_grace_ms = 1500
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = EngineConfig::load_from(&path, true).unwrap();
        assert_eq!(config.transport.url, "wss://relay.example.test/live");
        assert_eq!(config.transport.dialect, WireDialect::Enveloped);
        assert_eq!(config.transport.max_reconnect_attempts, 3);
        assert_eq!(config.transport.reconnect_base_delay_ms, 1_000);
        assert_eq!(config.session.completion_grace(), Duration::from_millis(1500));
        assert_eq!(config.audio.capture_buffer_size, 4096);
    }

    #[test]
    fn test_to_toml_renders_sections() {
        let rendered = EngineConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[transport]"));
        assert!(rendered.contains("dialect = \"direct\""));
    }
}
