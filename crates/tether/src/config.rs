use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::ConfigError;

pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_MAX_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            ..Default::default()
        }
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Opaque credentials handed to a [`crate::auth::CredentialsExchange`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_entity: Option<String>,
}

/// Cancels a reconnect loop between attempts.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `abort` has been called.
    pub async fn aborted(&self) {
        let mut aborted = self.tx.subscribe();
        let _ = aborted.wait_for(|aborted| *aborted).await;
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Which transport a configuration is able to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    WebRtc { signaling_address: String },
    Direct,
}

/// Everything needed to dial one machine.
#[derive(Debug, Clone, Default)]
pub struct DialConfig {
    pub host: String,
    pub signaling_address: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub credentials: Option<Credentials>,
    pub access_token: Option<String>,
    pub signaling_credentials: Option<Credentials>,
    pub signaling_access_token: Option<String>,
    pub disable_sessions: bool,
    pub disable_trickle: bool,
    pub no_reconnect: bool,
    pub reconnect_max_attempts: Option<u32>,
    pub reconnect_max_wait: Option<Duration>,
    pub reconnect_abort: Option<AbortHandle>,
    pub dial_timeout: Option<Duration>,
    pub priority: Option<i32>,
    pub insecure: bool,
    pub sdp_fields: Vec<(String, String)>,
}

impl DialConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn target(&self) -> DialTarget {
        match self.signaling_address.as_deref() {
            Some(address) if !address.trim().is_empty() => DialTarget::WebRtc {
                signaling_address: address.to_string(),
            },
            _ => DialTarget::Direct,
        }
    }

    pub fn is_webrtc(&self) -> bool {
        matches!(self.target(), DialTarget::WebRtc { .. })
    }

    /// Rejects illegal combinations before any network activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.access_token.is_some() {
            if self.credentials.is_some() {
                return Err(ConfigError::AccessTokenWithCredentials);
            }
            if self.signaling_credentials.is_some() || self.signaling_access_token.is_some() {
                return Err(ConfigError::AccessTokenWithSignalingAuth);
            }
        }
        if self.reconnect_max_attempts == Some(0) {
            return Err(ConfigError::NotPositive {
                field: "reconnect_max_attempts",
            });
        }
        if self.reconnect_max_wait.is_some_and(|wait| wait.is_zero()) {
            return Err(ConfigError::NotPositive {
                field: "reconnect_max_wait",
            });
        }
        Ok(())
    }

    pub fn with_signaling(mut self, address: impl Into<String>) -> Self {
        self.signaling_address = Some(address.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn no_reconnect(mut self, value: bool) -> Self {
        self.no_reconnect = value;
        self
    }

    pub fn disable_sessions(mut self, value: bool) -> Self {
        self.disable_sessions = value;
        self
    }

    pub fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = Some(attempts);
        self
    }

    pub fn reconnect_max_wait(mut self, wait: Duration) -> Self {
        self.reconnect_max_wait = Some(wait);
        self
    }

    pub fn reconnect_abort(mut self, handle: AbortHandle) -> Self {
        self.reconnect_abort = Some(handle);
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn insecure(mut self, value: bool) -> Self {
        self.insecure = value;
        self
    }

    pub fn with_sdp_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sdp_fields.push((key.into(), value.into()));
        self
    }

    /// Load a configuration from `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("TETHER_HOST").map_err(|_| ConfigError::MissingHost)?;
        let mut config = DialConfig::new(host);
        config.signaling_address = non_empty_env("TETHER_SIGNALING_ADDRESS");
        config.access_token = non_empty_env("TETHER_ACCESS_TOKEN");
        config.disable_sessions = parse_bool_env("TETHER_DISABLE_SESSIONS", false);
        config.disable_trickle = parse_bool_env("TETHER_DISABLE_TRICKLE", false);
        config.no_reconnect = parse_bool_env("TETHER_NO_RECONNECT", false);
        config.insecure = parse_bool_env("TETHER_INSECURE", false);
        config.reconnect_max_attempts = parse_u64_env("TETHER_RECONNECT_MAX_ATTEMPTS")
            .map(|value| u32::try_from(value).unwrap_or(u32::MAX));
        config.reconnect_max_wait =
            parse_u64_env("TETHER_RECONNECT_MAX_WAIT_MS").map(Duration::from_millis);
        config.dial_timeout = parse_u64_env("TETHER_DIAL_TIMEOUT_MS").map(Duration::from_millis);
        if let Some(urls) = non_empty_env("TETHER_ICE_SERVERS") {
            config.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| IceServer::new(vec![url.to_string()]))
                .collect();
        }
        config.validate()?;
        Ok(config)
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_bool_env(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(value) => !matches!(value.trim(), "" | "0" | "false" | "no"),
        Err(_) => default,
    }
}

fn parse_u64_env(var: &str) -> Option<u64> {
    let value = std::env::var(var).ok()?;
    match value.trim().parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(
                target: "tether::config",
                var,
                error = %err,
                "failed to parse dial option from env; ignoring"
            );
            None
        }
    }
}
