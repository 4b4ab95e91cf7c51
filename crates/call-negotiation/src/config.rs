use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::ConfigError;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_FALLBACK_OFFER_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }

    fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

/// Capture processing requested from the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// Per-call configuration. Not protocol state: it is read once when the
/// connection is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// How long a callee waits for an offer before sending its own.
    pub fallback_offer_timeout: Duration,
    pub audio: AudioConstraints,
    /// When false, remote audio stays blocked until `resume_playback`.
    pub autoplay: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            fallback_offer_timeout: DEFAULT_FALLBACK_OFFER_TIMEOUT,
            audio: AudioConstraints::default(),
            autoplay: true,
        }
    }
}

fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

impl CallConfig {
    /// Load configuration from `CALL_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = env::var("CALL_STUN_URLS") {
            config.ice_servers = split_urls(&raw).into_iter().map(IceServer::stun).collect();
        }

        if let Ok(url) = env::var("CALL_TURN_URL") {
            let username = env::var("CALL_TURN_USERNAME").unwrap_or_default();
            let credential = env::var("CALL_TURN_CREDENTIAL").unwrap_or_default();
            config
                .ice_servers
                .push(IceServer::turn(url, username, credential));
        }

        if env_truthy("CALL_LOCALHOST_ONLY") {
            config.ice_servers.clear();
        }

        if let Ok(raw) = env::var("CALL_FALLBACK_OFFER_MS") {
            let millis = raw.trim().parse::<u64>().map_err(|err| ConfigError::Invalid {
                key: "CALL_FALLBACK_OFFER_MS",
                reason: err.to_string(),
            })?;
            config.fallback_offer_timeout = Duration::from_millis(millis);
        }

        if let Ok(raw) = env::var("CALL_AUTOPLAY") {
            config.autoplay = raw == "1" || raw.eq_ignore_ascii_case("true");
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document such as:
    ///
    /// ```toml
    /// fallback_offer_ms = 2000
    ///
    /// [[ice_servers]]
    /// urls = ["stun:stun.example.org:3478"]
    /// ```
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(raw)?;
        let defaults = Self::default();
        let config = Self {
            ice_servers: file.ice_servers.unwrap_or(defaults.ice_servers),
            fallback_offer_timeout: file
                .fallback_offer_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.fallback_offer_timeout),
            audio: file.audio.unwrap_or_default(),
            autoplay: file.autoplay.unwrap_or(defaults.autoplay),
        };
        config.validate()?;
        Ok(config)
    }

    /// No STUN/TURN: host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fallback_offer_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "fallback_offer_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "ice_servers",
                    reason: "server without urls".into(),
                });
            }
            if server.is_turn() && (server.username.is_empty() || server.credential.is_empty()) {
                return Err(ConfigError::Invalid {
                    key: "ice_servers",
                    reason: format!("turn server {} needs username and credential", server.urls[0]),
                });
            }
        }
        Ok(())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    ice_servers: Option<Vec<IceServer>>,
    fallback_offer_ms: Option<u64>,
    audio: Option<AudioConstraints>,
    autoplay: Option<bool>,
}

/// Builder for `CallConfig`.
#[derive(Debug, Default)]
pub struct CallConfigBuilder {
    ice_servers: Vec<IceServer>,
    fallback_offer_timeout: Option<Duration>,
    audio: Option<AudioConstraints>,
    autoplay: Option<bool>,
}

impl CallConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stun_server(mut self, url: impl Into<String>) -> Self {
        self.ice_servers.push(IceServer::stun(url));
        self
    }

    pub fn add_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers
            .push(IceServer::turn(url, username, credential));
        self
    }

    pub fn fallback_offer_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_offer_timeout = Some(timeout);
        self
    }

    pub fn audio(mut self, audio: AudioConstraints) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = Some(autoplay);
        self
    }

    pub fn build(self) -> Result<CallConfig, ConfigError> {
        let mut config = CallConfig::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        if let Some(timeout) = self.fallback_offer_timeout {
            config.fallback_offer_timeout = timeout;
        }
        if let Some(audio) = self.audio {
            config.audio = audio;
        }
        if let Some(autoplay) = self.autoplay {
            config.autoplay = autoplay;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const ENV_KEYS: [&str; 7] = [
        "CALL_STUN_URLS",
        "CALL_TURN_URL",
        "CALL_TURN_USERNAME",
        "CALL_TURN_CREDENTIAL",
        "CALL_LOCALHOST_ONLY",
        "CALL_FALLBACK_OFFER_MS",
        "CALL_AUTOPLAY",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn default_uses_public_stun_and_two_second_fallback() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers, vec![IceServer::stun(DEFAULT_STUN_URL)]);
        assert_eq!(config.fallback_offer_timeout, Duration::from_secs(2));
        assert!(config.audio.echo_cancellation);
        assert!(config.audio.noise_suppression);
        assert!(config.audio.auto_gain_control);
    }

    #[test]
    fn from_env_adds_turn_and_overrides_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("CALL_STUN_URLS", "stun:a.example:3478, stun:b.example:3478");
            env::set_var("CALL_TURN_URL", "turn:turn.example:3478");
            env::set_var("CALL_TURN_USERNAME", "user");
            env::set_var("CALL_TURN_CREDENTIAL", "secret");
            env::set_var("CALL_FALLBACK_OFFER_MS", "750");
        }
        let config = CallConfig::from_env().expect("valid env config");
        clear_env();

        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(
            config.ice_servers[2],
            IceServer::turn("turn:turn.example:3478", "user", "secret")
        );
        assert_eq!(config.fallback_offer_timeout, Duration::from_millis(750));
    }

    #[test]
    fn from_env_rejects_garbage_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("CALL_FALLBACK_OFFER_MS", "soon") };
        let err = CallConfig::from_env().unwrap_err();
        clear_env();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "CALL_FALLBACK_OFFER_MS",
                ..
            }
        ));
    }

    #[test]
    fn localhost_only_drops_ice_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("CALL_LOCALHOST_ONLY", "1") };
        let config = CallConfig::from_env().expect("valid env config");
        clear_env();
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn toml_config_round_trips_servers() {
        let raw = r#"
            fallback_offer_ms = 1500
            autoplay = false

            [[ice_servers]]
            urls = ["stun:stun.example.org:3478"]

            [[ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "u"
            credential = "c"

            [audio]
            noise_suppression = false
        "#;
        let config = CallConfig::from_toml_str(raw).expect("parse toml");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.fallback_offer_timeout, Duration::from_millis(1500));
        assert!(!config.autoplay);
        assert!(!config.audio.noise_suppression);
        assert!(config.audio.echo_cancellation);
    }

    #[test]
    fn turn_without_credentials_is_invalid() {
        let err = CallConfigBuilder::new()
            .add_stun_server("stun:stun.example.org:3478")
            .add_turn_server("turn:turn.example.org:3478", "", "")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ice_servers", .. }));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = CallConfigBuilder::new()
            .fallback_offer_timeout(Duration::from_millis(300))
            .autoplay(false)
            .build()
            .expect("valid config");
        assert_eq!(config.ice_servers, CallConfig::default().ice_servers);
        assert_eq!(config.fallback_offer_timeout, Duration::from_millis(300));
        assert!(!config.autoplay);
        assert!(config.rtc_ice_servers()[0].urls[0].starts_with("stun:"));
    }
}
