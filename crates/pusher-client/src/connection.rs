//! Connection management: the event loop that owns the transport, the retry and
//! heartbeat timers, and the channel registry.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::Error;
use crate::auth::Authorizer;
use crate::backoff::{BackoffPolicy, RetryKind, RetryScheduler};
use crate::channel::{ChannelRegistry, Dispatch, SubscribeAuth, SubscriptionStatus};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::protocol::{self, Envelope, SubscribeCredentials, event};
use crate::stats::{ClientStats, bump};
use crate::transport::{Connection, FrameSink, FrameStream, Transport};
use crate::types::{
    BoxError, ChannelListener, ConnectionListener, ConnectionState, TimingConfig, guard_listener,
};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Requests from [`PusherClient`](crate::PusherClient) and [`Channel`](crate::Channel) handles.
pub(crate) enum Command {
    Connect,
    Disconnect,
    SetListener(Arc<dyn ConnectionListener>),
    Subscribe {
        channel: String,
        auth: SubscribeAuth,
    },
    Unsubscribe {
        channel: String,
    },
    Bind {
        channel: String,
        event: String,
        listener: ChannelListener,
    },
    Send {
        event: String,
        channel: Option<String>,
        data: serde_json::Value,
    },
    Status {
        channel: String,
        reply: oneshot::Sender<Option<SubscriptionStatus>>,
    },
}

pub(crate) fn post_command(commands: &mpsc::UnboundedSender<Command>, cmd: Command) {
    if commands.send(cmd).is_err() {
        tracing::debug!("Event loop has exited, dropping command");
    }
}

/// Results of work spawned off the event loop.
enum Internal {
    Authorized {
        channel: String,
        socket_id: String,
        result: Result<String, BoxError>,
    },
}

type OpenFuture = BoxFuture<'static, Result<Connection, Error>>;

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoopState {
    pub url: String,
    pub transport: Arc<dyn Transport>,
    pub timing: TimingConfig,
    pub state_tx: watch::Sender<ConnectionState>,
    pub stats: Arc<ClientStats>,
}

pub(crate) fn spawn_event_loop(p: EventLoopState, commands: mpsc::UnboundedReceiver<Command>) {
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let event_loop = EventLoop {
        url: p.url,
        transport: p.transport,
        listener: None,
        state: ConnectionState::Idle,
        state_tx: p.state_tx,
        socket_id: None,
        allow_auto_reconnect: false,
        retry: RetryScheduler::new(BackoffPolicy::from_timing(&p.timing)),
        heartbeat: HeartbeatMonitor::new(&p.timing),
        channels: ChannelRegistry::default(),
        opening: None,
        sink: None,
        stream: None,
        internal_tx,
        stats: p.stats,
    };
    tokio::spawn(event_loop.run(commands, internal_rx));
}

struct EventLoop {
    url: String,
    transport: Arc<dyn Transport>,
    listener: Option<Arc<dyn ConnectionListener>>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    socket_id: Option<String>,
    allow_auto_reconnect: bool,
    retry: RetryScheduler,
    heartbeat: HeartbeatMonitor,
    channels: ChannelRegistry,
    opening: Option<OpenFuture>,
    sink: Option<FrameSink>,
    stream: Option<FrameStream>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    stats: Arc<ClientStats>,
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        tracing::debug!(state = %self.state, "Event loop stopped");
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn poll_open(opening: &mut Option<OpenFuture>) -> Result<Connection, Error> {
    match opening {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<Result<String, Error>> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::debug!("All client handles dropped, shutting down");
                        self.allow_auto_reconnect = false;
                        self.retry.stop();
                        self.close_transport();
                        return;
                    }
                },

                Some(msg) = internal_rx.recv() => self.handle_internal(msg).await,

                opened = poll_open(&mut self.opening) => {
                    self.opening = None;
                    self.on_open_result(opened);
                }

                frame = next_frame(&mut self.stream) => self.on_frame(frame).await,

                () = wait_until(self.retry.deadline()) => self.on_retry_timer(),

                () = wait_until(self.heartbeat.deadline()) => self.on_heartbeat_timer().await,
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "Connection state changed");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn notify(&self, callback: &'static str, f: impl FnOnce(&dyn ConnectionListener)) {
        if let Some(listener) = &self.listener
            && !guard_listener(callback, || f(listener.as_ref()))
        {
            bump(&self.stats.listener_panics);
        }
    }

    // --- Commands ---

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::SetListener(listener) => self.listener = Some(listener),
            Command::Subscribe { channel, auth } => self.subscribe(channel, auth).await,
            Command::Unsubscribe { channel } => self.unsubscribe(&channel).await,
            Command::Bind {
                channel,
                event,
                listener,
            } => {
                if !self.channels.bind(&channel, &event, listener) {
                    tracing::debug!(
                        channel = %channel,
                        event = %event,
                        "Ignoring bind on a channel that is not subscribed"
                    );
                }
            }
            Command::Send {
                event,
                channel,
                data,
            } => {
                let envelope = Envelope::new(event, channel, data);
                if let Err(e) = self.send(&envelope).await {
                    tracing::error!(event = %envelope.event, "Error sending message: {e}");
                }
            }
            Command::Status { channel, reply } => {
                let _ = reply.send(self.channels.get(&channel).map(|e| e.status));
            }
        }
    }

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::debug!(state = %self.state, "Ignoring connect, connection already in progress");
            }
            ConnectionState::Idle | ConnectionState::Disconnected => {
                self.allow_auto_reconnect = true;
                self.open_transport();
                self.retry.start_initial_timeout(Instant::now());
            }
            ConnectionState::Reconnecting => {
                // Attempt now. The scheduled retry stays armed in case this one stalls.
                self.allow_auto_reconnect = true;
                self.open_transport();
            }
        }
    }

    fn disconnect(&mut self) {
        self.allow_auto_reconnect = false;
        self.retry.stop();
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected => {
                tracing::debug!(state = %self.state, "Ignoring disconnect, not connected");
            }
            _ => {
                tracing::info!("Disconnecting");
                self.close_transport();
                self.set_state(ConnectionState::Disconnected);
                self.notify("on_disconnect", |l| l.on_disconnect());
            }
        }
    }

    async fn subscribe(&mut self, channel: String, auth: SubscribeAuth) {
        if !self.channels.subscribe(&channel, auth) {
            tracing::debug!(channel = %channel, "Already subscribed");
            return;
        }
        if self.state == ConnectionState::Connected {
            self.request_subscription(&channel).await;
        } else {
            tracing::debug!(channel = %channel, "Not connected, subscribe deferred until connected");
        }
    }

    async fn unsubscribe(&mut self, channel: &str) {
        if !self.channels.unsubscribe(channel) {
            tracing::debug!(channel, "Ignoring unsubscribe, channel not subscribed");
            return;
        }
        if self.state == ConnectionState::Connected
            && let Err(e) = self.send(&protocol::build_unsubscribe_msg(channel)).await
        {
            tracing::warn!(channel, "Error sending unsubscribe: {e}");
        }
        tracing::info!(channel, "Unsubscribed");
    }

    // --- Subscriptions ---

    async fn request_subscription(&mut self, channel: &str) {
        let credentials = match self.channels.get(channel).map(|e| e.auth.clone()) {
            None => return,
            Some(SubscribeAuth::Public) => SubscribeCredentials::default(),
            Some(SubscribeAuth::Token { auth, user_id }) => SubscribeCredentials {
                auth: Some(auth),
                user_id,
            },
            Some(SubscribeAuth::Authorizer { authorizer, .. }) => {
                self.authorize(authorizer, channel);
                return;
            }
        };
        self.send_subscribe(channel, &credentials).await;
    }

    /// Run the authorizer off the loop; the token comes back as [`Internal::Authorized`].
    fn authorize(&self, authorizer: Arc<dyn Authorizer>, channel: &str) {
        let Some(socket_id) = self.socket_id.clone() else {
            tracing::debug!(channel, "No socket id yet, authorization deferred");
            return;
        };
        let channel = channel.to_string();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = authorizer.authorize(&socket_id, &channel).await;
            let _ = internal_tx.send(Internal::Authorized {
                channel,
                socket_id,
                result,
            });
        });
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Authorized {
                channel,
                socket_id,
                result,
            } => {
                let token = match result {
                    Ok(token) => token,
                    Err(e) => {
                        let total = bump(&self.stats.auth_failures);
                        let e = Error::Authorization(e);
                        tracing::warn!(
                            channel = %channel,
                            total_auth_failures = total,
                            "Subscribe abandoned: {e}"
                        );
                        return;
                    }
                };
                if self.socket_id.as_deref() != Some(socket_id.as_str()) {
                    tracing::debug!(channel = %channel, "Discarding authorization for a previous connection");
                    return;
                }
                let user_id = match self.channels.get(&channel).map(|e| &e.auth) {
                    Some(SubscribeAuth::Authorizer { user_id, .. }) => *user_id,
                    _ => {
                        tracing::debug!(channel = %channel, "Discarding authorization, channel no longer subscribed");
                        return;
                    }
                };
                let credentials = SubscribeCredentials {
                    auth: Some(token),
                    user_id,
                };
                self.send_subscribe(&channel, &credentials).await;
            }
        }
    }

    async fn send_subscribe(&mut self, channel: &str, credentials: &SubscribeCredentials) {
        match self
            .send(&protocol::build_subscribe_msg(channel, credentials))
            .await
        {
            Ok(()) => tracing::info!(channel, "Subscribe requested"),
            Err(e) => tracing::warn!(channel, "Error sending subscribe: {e}"),
        }
    }

    // --- Transport ---

    fn open_transport(&mut self) {
        self.close_transport();
        let attempt = bump(&self.stats.connection_attempts);
        tracing::info!(url = %self.url, attempt, "Connecting");
        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        self.opening = Some(Box::pin(async move { transport.open(&url).await }));
        self.set_state(ConnectionState::Connecting);
    }

    /// Drop the current transport (or in-flight open) and everything tied to its session.
    fn close_transport(&mut self) {
        self.opening = None;
        self.stream = None;
        self.heartbeat.on_disconnect();
        self.socket_id = None;
        self.channels.mark_all_pending();
        if let Some(mut sink) = self.sink.take() {
            tokio::spawn(async move {
                if let Err(e) = sink.close().await {
                    tracing::debug!("Error closing transport: {e}");
                }
            });
        }
    }

    fn on_open_result(&mut self, result: Result<Connection, Error>) {
        match result {
            Ok(conn) => {
                tracing::debug!("Transport open, waiting for connection_established");
                self.sink = Some(conn.sink);
                self.stream = Some(conn.stream);
            }
            Err(e) => {
                tracing::warn!("Error connecting: {e}");
                self.on_connection_lost("open failed");
            }
        }
    }

    /// The transport went away without `disconnect()`: hand over to the retry scheduler.
    fn on_connection_lost(&mut self, reason: &str) {
        let failures = bump(&self.stats.failed_attempts);
        self.close_transport();

        if !self.allow_auto_reconnect {
            if self.state != ConnectionState::Disconnected {
                self.set_state(ConnectionState::Disconnected);
                self.notify("on_disconnect", |l| l.on_disconnect());
            }
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        if self.retry.retry_pending() {
            tracing::info!(reason, total_failures = failures, "Connection lost, retry already scheduled");
        } else {
            let delay = self.retry.schedule_retry(Instant::now());
            tracing::info!(
                reason,
                total_failures = failures,
                delay_ms = delay.as_millis() as u64,
                "Connection lost, retry scheduled"
            );
        }
    }

    /// Write one frame. A write error on an open transport counts as a lost connection.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), Error> {
        let result = self.write_frame(envelope).await;
        match &result {
            Ok(()) => {
                bump(&self.stats.frames_sent);
            }
            Err(Error::NotConnected | Error::Json(_)) => {
                bump(&self.stats.send_failures);
            }
            Err(_) => {
                bump(&self.stats.send_failures);
                self.on_connection_lost("write failed");
            }
        }
        result
    }

    async fn write_frame(&mut self, envelope: &Envelope) -> Result<(), Error> {
        let text = protocol::encode(envelope)?;
        let sink = self.sink.as_mut().ok_or(Error::NotConnected)?;
        tracing::trace!(frame = %text, "Sending frame");
        sink.send(text).await
    }

    // --- Inbound frames ---

    async fn on_frame(&mut self, frame: Option<Result<String, Error>>) {
        match frame {
            Some(Ok(text)) => self.on_text(text).await,
            Some(Err(e)) => {
                tracing::warn!("Transport error: {e}");
                self.on_connection_lost("transport error");
            }
            None => {
                tracing::info!("Transport closed");
                self.on_connection_lost("transport closed");
            }
        }
    }

    async fn on_text(&mut self, text: String) {
        bump(&self.stats.frames_received);
        tracing::trace!(frame = %text, "Received frame");
        if self.heartbeat.is_running() {
            self.heartbeat.on_activity(Instant::now());
        }

        let envelope = match protocol::decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let total = bump(&self.stats.decode_errors);
                tracing::warn!(total_decode_errors = total, "Discarding frame: {e}");
                return;
            }
        };

        if !envelope.is_reserved() {
            self.on_event(&text, &envelope);
            return;
        }
        match envelope.event.as_str() {
            event::CONNECTION_ESTABLISHED => self.on_connection_established(&envelope).await,
            event::PING => {
                tracing::trace!("Ping received");
                if let Err(e) = self.send(&protocol::build_pong_msg()).await {
                    tracing::warn!("Error sending pong: {e}");
                }
            }
            _ => {
                tracing::trace!(awaited = self.heartbeat.awaiting_pong(), "Pong received");
            }
        }
    }

    async fn on_connection_established(&mut self, envelope: &Envelope) {
        if self.state == ConnectionState::Connected {
            tracing::warn!("Ignoring duplicate connection_established");
            return;
        }
        let socket_id = match protocol::parse_socket_id(envelope) {
            Ok(id) => id,
            Err(e) => {
                let total = bump(&self.stats.decode_errors);
                tracing::warn!(total_decode_errors = total, "Discarding frame: {e}");
                return;
            }
        };

        self.retry.stop();
        self.socket_id = Some(socket_id.clone());
        self.set_state(ConnectionState::Connected);
        self.heartbeat.on_activity(Instant::now());
        tracing::info!(socket_id = %socket_id, channels = self.channels.len(), "Connected");
        self.notify("on_connect", |l| l.on_connect(&socket_id));

        for channel in self.channels.pending() {
            if self.state != ConnectionState::Connected {
                break;
            }
            self.request_subscription(&channel).await;
        }
    }

    fn on_event(&mut self, raw: &str, envelope: &Envelope) {
        match envelope.event.as_str() {
            event::SUBSCRIPTION_SUCCEEDED => {
                if let Some(channel) = envelope.channel.as_deref()
                    && self.channels.mark_active(channel)
                {
                    tracing::info!(channel, "Subscription succeeded");
                }
            }
            event::ERROR => {
                let (code, message) = protocol::parse_error(envelope);
                tracing::warn!(
                    ?code,
                    message = message.as_deref().unwrap_or("-"),
                    "Server sent error event"
                );
            }
            _ => {}
        }

        self.notify("on_message", |l| l.on_message(raw));
        match self.channels.dispatch(envelope) {
            Dispatch::Delivered => {}
            Dispatch::Dropped => tracing::trace!(
                event = %envelope.event,
                channel = ?envelope.channel,
                "No listener bound, event dropped"
            ),
            Dispatch::Panicked => {
                bump(&self.stats.listener_panics);
            }
        }
    }

    // --- Timers ---

    fn on_retry_timer(&mut self) {
        match self.retry.fire(Instant::now()) {
            Some(RetryKind::InitialTimeout) => {
                tracing::warn!(
                    attempt = self.retry.attempt(),
                    "No connection_established before initial timeout, retry scheduled"
                );
                if self.state == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
            Some(RetryKind::Retry) => {
                tracing::info!("Retrying connection");
                self.open_transport();
            }
            None => {}
        }
    }

    async fn on_heartbeat_timer(&mut self) {
        let now = Instant::now();
        let idle_ms = self
            .heartbeat
            .idle_for(now)
            .map_or(0, |d| d.as_millis() as u64);
        match self.heartbeat.fire(now) {
            Some(HeartbeatAction::SendPing) => {
                tracing::debug!(idle_ms, "Connection idle, sending ping");
                if let Err(e) = self.send(&protocol::build_ping_msg()).await {
                    tracing::warn!("Error sending ping: {e}");
                }
            }
            Some(HeartbeatAction::CloseTransport) => {
                let total = bump(&self.stats.heartbeat_timeouts);
                tracing::warn!(idle_ms, total_heartbeat_timeouts = total, "No response to ping, closing connection");
                self.on_connection_lost("heartbeat timeout");
            }
            None => {}
        }
    }
}
