//! Public client handle.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::Error;
use crate::auth::Authorizer;
use crate::channel::{Channel, SubscribeAuth};
use crate::connection::{Command, EventLoopState, post_command, spawn_event_loop};
use crate::protocol;
use crate::stats::{ClientStats, StatsSnapshot};
use crate::transport::{Transport, WsTransport};
use crate::types::{ClientConfig, ConnectionListener, ConnectionState};

/// A Pusher client.
///
/// Each client runs one background task that owns the connection, its timers,
/// and all subscriptions. Methods on this handle (and on [`Channel`]) post a
/// request to that task and return immediately; requests are applied in the
/// order they were made. Cloning the handle shares the same connection. The
/// task stops, closing the connection, when every handle has been dropped.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct PusherClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<ClientStats>,
}

impl PusherClient {
    /// Create a client that connects over WebSocket. Does not connect yet.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Self::with_transport(config, Arc::new(WsTransport))
    }

    /// Create a client that opens connections through `transport`.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let url = protocol::build_ws_url(&config)?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let stats = Arc::new(ClientStats::default());

        tracing::debug!(url = %url, "Client created");
        spawn_event_loop(
            EventLoopState {
                url,
                transport,
                timing: config.timing.unwrap_or_default(),
                state_tx,
                stats: Arc::clone(&stats),
            },
            commands_rx,
        );

        Ok(Self {
            commands,
            state,
            stats,
        })
    }

    fn post(&self, cmd: Command) {
        post_command(&self.commands, cmd);
    }

    /// Set the listener for connection lifecycle events and raw inbound
    /// messages, replacing any previous one. Set it before `connect()` to
    /// observe the first `on_connect`.
    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.post(Command::SetListener(listener));
    }

    /// Start connecting. Failures are retried in the background; watch
    /// [`state_changes`](Self::state_changes) or the listener for progress.
    pub fn connect(&self) {
        self.post(Command::Connect);
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        self.post(Command::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every published state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Send a connection-level event. Dropped with an error log if not connected.
    pub fn send(&self, event: impl Into<String>, data: serde_json::Value) {
        self.post(Command::Send {
            event: event.into(),
            channel: None,
            data,
        });
    }

    fn subscribe_with(&self, name: impl Into<String>, auth: SubscribeAuth) -> Channel {
        let name = name.into();
        self.post(Command::Subscribe {
            channel: name.clone(),
            auth,
        });
        Channel::new(name, self.commands.clone())
    }

    /// Subscribe to a public channel. Subscribing to a channel that is
    /// already subscribed keeps the existing subscription and its listeners.
    pub fn subscribe(&self, name: impl Into<String>) -> Channel {
        self.subscribe_with(name, SubscribeAuth::Public)
    }

    /// Subscribe to a private channel with a pre-computed auth token.
    ///
    /// The token is tied to a socket id, so it is only valid for the
    /// connection it was issued on. Prefer
    /// [`subscribe_with_authorizer`](Self::subscribe_with_authorizer) when
    /// the subscription must survive reconnects.
    pub fn subscribe_with_token(&self, name: impl Into<String>, auth: impl Into<String>) -> Channel {
        self.subscribe_with(
            name,
            SubscribeAuth::Token {
                auth: auth.into(),
                user_id: None,
            },
        )
    }

    /// Subscribe to a presence channel with a pre-computed auth token.
    pub fn subscribe_presence(
        &self,
        name: impl Into<String>,
        auth: impl Into<String>,
        user_id: i64,
    ) -> Channel {
        self.subscribe_with(
            name,
            SubscribeAuth::Token {
                auth: auth.into(),
                user_id: Some(user_id),
            },
        )
    }

    /// Subscribe to a private channel, asking `authorizer` for a token on
    /// every (re-)subscribe.
    pub fn subscribe_with_authorizer(
        &self,
        name: impl Into<String>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Channel {
        self.subscribe_with(
            name,
            SubscribeAuth::Authorizer {
                authorizer,
                user_id: None,
            },
        )
    }

    /// Subscribe to a presence channel, asking `authorizer` for a token on
    /// every (re-)subscribe.
    pub fn subscribe_presence_with_authorizer(
        &self,
        name: impl Into<String>,
        authorizer: Arc<dyn Authorizer>,
        user_id: i64,
    ) -> Channel {
        self.subscribe_with(
            name,
            SubscribeAuth::Authorizer {
                authorizer,
                user_id: Some(user_id),
            },
        )
    }

    pub fn unsubscribe(&self, name: impl Into<String>) {
        self.post(Command::Unsubscribe {
            channel: name.into(),
        });
    }

    /// Bind a listener for `event` on an already subscribed channel.
    pub fn bind<F>(&self, channel: impl Into<String>, event: impl Into<String>, listener: F)
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.post(Command::Bind {
            channel: channel.into(),
            event: event.into(),
            listener: Arc::new(listener),
        });
    }
}

impl std::fmt::Debug for PusherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PusherClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
