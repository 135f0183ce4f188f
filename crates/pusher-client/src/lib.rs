//! Pusher realtime client.
//!
//! Maintains one WebSocket connection to a Pusher-protocol server and lets
//! callers subscribe to channels and bind listeners to named events.
//!
//! # Features
//! - Automatic reconnection with linear backoff
//! - Heartbeat-based liveness detection (ping after silence, close on no reply)
//! - Subscriptions replayed on every new connection
//! - Private and presence channels via pre-computed tokens or an [`Authorizer`]
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pusher_client::Error> {
//! use pusher_client::{ClientConfig, PusherClient};
//!
//! let client = PusherClient::new(ClientConfig::new("app-key"))?;
//! let channel = client.subscribe("prices");
//! channel.bind("update", |data| println!("price update: {data}"));
//! client.connect();
//!
//! let mut state = client.state_changes();
//! while state.changed().await.is_ok() {
//!     println!("state: {}", *state.borrow());
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod backoff;
mod channel;
mod client;
mod connection;
mod heartbeat;
mod protocol;
mod stats;
mod transport;
mod types;

pub use auth::{Authorizer, HttpAuthorizer};
pub use channel::{Channel, SubscriptionStatus};
pub use client::PusherClient;
pub use stats::StatsSnapshot;
pub use transport::{Connection, FrameSink, FrameStream, Transport, WsTransport};
pub use types::{
    BoxError, ChannelListener, ClientConfig, ConnectionListener, ConnectionState, Error,
    TimingConfig,
};
