//! Public types for the pusher-client crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// A boxed error type for collaborator callbacks (authorizers, custom transports).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Listener bound to one `(channel, event)` pair. Receives the decoded payload.
pub type ChannelListener = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

pub(crate) const DEFAULT_HOST: &str = "ws.pusherapp.com";
pub(crate) const WS_PORT: u16 = 80;
pub(crate) const WSS_PORT: u16 = 443;

/// Upper bound for every [`TimingConfig`] value. Deadlines are `Instant + Duration`.
pub(crate) const MAX_TIMING: Duration = Duration::from_secs(24 * 60 * 60);

/// Run a caller-supplied listener. A panic is logged and contained so the
/// event loop keeps running. Returns `false` if the listener panicked.
pub(crate) fn guard_listener(listener: &'static str, f: impl FnOnce()) -> bool {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            tracing::error!(listener, "Listener panicked: {message}");
            false
        }
    }
}

/// Lifecycle state of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, `connect()` never called.
    Idle,
    /// A transport is being opened or is waiting for `connection_established`.
    Connecting,
    /// `connection_established` received; a socket id is assigned.
    Connected,
    /// The connection dropped and a retry is scheduled.
    Reconnecting,
    /// `disconnect()` was called; no retries will happen.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Receives connection-level notifications.
///
/// Callbacks run on the client's event loop, so they should return quickly.
/// Calling back into [`PusherClient`](crate::PusherClient) from a callback is
/// fine: every client method only enqueues a command.
pub trait ConnectionListener: Send + Sync {
    /// The server assigned `socket_id` to a new (or re-established) connection.
    fn on_connect(&self, socket_id: &str) {
        let _ = socket_id;
    }

    /// The connection was closed by an explicit `disconnect()`.
    fn on_disconnect(&self) {}

    /// Raw text of every inbound frame that is not a reserved system event.
    fn on_message(&self, raw: &str) {
        let _ = raw;
    }
}

/// Timing knobs for retries and liveness detection.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Deadline for the first `connection_established`, and the base retry delay.
    pub initial_timeout: Duration,
    /// Added to the retry delay for every attempt.
    pub retry_increment: Duration,
    /// Upper bound on the retry delay.
    pub max_retry_delay: Duration,
    /// Silence after which a ping is sent.
    pub activity_timeout: Duration,
    /// How long to wait for any frame after a ping before closing the transport.
    pub pong_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(4),
            retry_increment: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(10),
            activity_timeout: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for [`PusherClient`](crate::PusherClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application key, embedded in the connection path.
    pub app_key: String,
    /// Use `wss` on port 443 instead of `ws` on port 80. Defaults to `true`.
    pub encrypted: bool,
    /// Realtime host. Defaults to `"ws.pusherapp.com"`.
    pub host: Option<String>,
    /// Port override. Defaults to 443 when encrypted, 80 otherwise.
    pub port: Option<u16>,
    /// Retry and heartbeat timing. Defaults to [`TimingConfig::default`].
    pub timing: Option<TimingConfig>,
}

impl ClientConfig {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            encrypted: true,
            host: None,
            port: None,
            timing: None,
        }
    }

    pub(crate) fn scheme(&self) -> &'static str {
        if self.encrypted { "wss" } else { "ws" }
    }

    pub(crate) fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.encrypted { WSS_PORT } else { WS_PORT })
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.app_key.trim().is_empty() {
            return Err(Error::Config("app_key must not be empty".to_string()));
        }
        if self.host().is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        let timing = self.timing.clone().unwrap_or_default();
        let bounded = [
            ("initial_timeout", timing.initial_timeout),
            ("retry_increment", timing.retry_increment),
            ("max_retry_delay", timing.max_retry_delay),
            ("activity_timeout", timing.activity_timeout),
            ("pong_timeout", timing.pong_timeout),
        ];
        for (name, value) in bounded {
            if value > MAX_TIMING {
                return Err(Error::Config(format!(
                    "{name} must not exceed {}s",
                    MAX_TIMING.as_secs()
                )));
            }
        }
        if timing.activity_timeout.is_zero() || timing.pong_timeout.is_zero() {
            return Err(Error::Config(
                "heartbeat intervals must be non-zero".to_string(),
            ));
        }
        if timing.initial_timeout.is_zero() || timing.max_retry_delay.is_zero() {
            return Err(Error::Config("retry delays must be non-zero".to_string()));
        }
        if timing.max_retry_delay < timing.initial_timeout {
            return Err(Error::Config(
                "max_retry_delay must not be less than initial_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authorization failed: {0}")]
    Authorization(BoxError),

    #[error("Transport is not open")]
    NotConnected,

    #[error("Transport closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Auth endpoint HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_encrypted() {
        let config = ClientConfig::new("app-key");
        assert_eq!(config.scheme(), "wss");
        assert_eq!(config.host(), "ws.pusherapp.com");
        assert_eq!(config.port(), 443);
    }

    #[test]
    fn plaintext_config_uses_port_80() {
        let mut config = ClientConfig::new("app-key");
        config.encrypted = false;
        assert_eq!(config.scheme(), "ws");
        assert_eq!(config.port(), 80);

        config.port = Some(6001);
        assert_eq!(config.port(), 6001);
    }

    #[test]
    fn validate_rejects_empty_app_key() {
        let err = ClientConfig::new("  ").validate().unwrap_err();
        assert!(err.to_string().contains("app_key"), "got: {err}");
    }

    #[test]
    fn validate_rejects_zero_heartbeat() {
        let mut config = ClientConfig::new("key");
        config.timing = Some(TimingConfig {
            pong_timeout: Duration::ZERO,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    fn with_timing(timing: TimingConfig) -> ClientConfig {
        let mut config = ClientConfig::new("key");
        config.timing = Some(timing);
        config
    }

    #[test]
    fn validate_rejects_zero_retry_delays() {
        let config = with_timing(TimingConfig {
            initial_timeout: Duration::ZERO,
            retry_increment: Duration::ZERO,
            max_retry_delay: Duration::ZERO,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = with_timing(TimingConfig {
            max_retry_delay: Duration::ZERO,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_max_delay_below_initial() {
        let config = with_timing(TimingConfig {
            initial_timeout: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(5),
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_retry_delay"), "got: {err}");
    }

    #[test]
    fn validate_rejects_unbounded_timing() {
        let config = with_timing(TimingConfig {
            activity_timeout: Duration::MAX,
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("activity_timeout"), "got: {err}");

        let config = with_timing(TimingConfig {
            retry_increment: MAX_TIMING + Duration::from_secs(1),
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_accepts_zero_increment_and_bounds() {
        let config = with_timing(TimingConfig {
            retry_increment: Duration::ZERO,
            initial_timeout: MAX_TIMING,
            max_retry_delay: MAX_TIMING,
            activity_timeout: MAX_TIMING,
            pong_timeout: MAX_TIMING,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn guard_listener_contains_panics() {
        assert!(guard_listener("test", || {}));
        assert!(!guard_listener("test", || panic!("listener failure")));
        let message = String::from("owned");
        assert!(!guard_listener("test", move || panic!("{message}")));
    }

    #[test]
    fn timing_defaults() {
        let t = TimingConfig::default();
        assert_eq!(t.initial_timeout, Duration::from_secs(4));
        assert_eq!(t.retry_increment, Duration::from_secs(1));
        assert_eq!(t.max_retry_delay, Duration::from_secs(10));
        assert_eq!(t.activity_timeout, Duration::from_secs(120));
        assert_eq!(t.pong_timeout, Duration::from_secs(30));
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
