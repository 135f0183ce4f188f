//! Channel registry: subscriptions, per-event listeners, and event dispatch.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::auth::Authorizer;
use crate::connection::{Command, post_command};
use crate::protocol::Envelope;
use crate::types::{ChannelListener, guard_listener};

/// How a subscribe request for a channel is authorized.
#[derive(Clone)]
pub(crate) enum SubscribeAuth {
    Public,
    Token {
        auth: String,
        user_id: Option<i64>,
    },
    Authorizer {
        authorizer: Arc<dyn Authorizer>,
        user_id: Option<i64>,
    },
}

impl fmt::Debug for SubscribeAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeAuth::Public => f.write_str("Public"),
            SubscribeAuth::Token { user_id, .. } => f
                .debug_struct("Token")
                .field("user_id", user_id)
                .finish_non_exhaustive(),
            SubscribeAuth::Authorizer { user_id, .. } => f
                .debug_struct("Authorizer")
                .field("user_id", user_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Outcome of [`ChannelRegistry::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Delivered,
    /// No listener is bound for the channel and event.
    Dropped,
    Panicked,
}

/// Whether the server has confirmed a subscription on the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Pending,
    Active,
}

pub(crate) struct ChannelEntry {
    pub auth: SubscribeAuth,
    pub status: SubscriptionStatus,
    listeners: HashMap<String, ChannelListener>,
}

/// All subscribed channels, keyed by name. Owned by the connection event loop.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: BTreeMap<String, ChannelEntry>,
}

impl ChannelRegistry {
    /// Register `name`. Returns `false` (leaving the existing entry untouched)
    /// if the channel is already registered.
    pub fn subscribe(&mut self, name: &str, auth: SubscribeAuth) -> bool {
        if self.channels.contains_key(name) {
            return false;
        }
        self.channels.insert(
            name.to_string(),
            ChannelEntry {
                auth,
                status: SubscriptionStatus::Pending,
                listeners: HashMap::new(),
            },
        );
        true
    }

    pub fn unsubscribe(&mut self, name: &str) -> bool {
        self.channels.remove(name).is_some()
    }

    /// Set the listener for `(channel, event)`, replacing any previous one.
    /// Returns `false` if the channel is not registered.
    pub fn bind(&mut self, channel: &str, event: &str, listener: ChannelListener) -> bool {
        match self.channels.get_mut(channel) {
            Some(entry) => {
                entry.listeners.insert(event.to_string(), listener);
                true
            }
            None => false,
        }
    }

    /// Invoke the listener bound to the envelope's channel and event.
    pub fn dispatch(&self, envelope: &Envelope) -> Dispatch {
        let Some(listener) = envelope
            .channel
            .as_deref()
            .and_then(|name| self.channels.get(name))
            .and_then(|entry| entry.listeners.get(&envelope.event))
        else {
            return Dispatch::Dropped;
        };
        let payload = envelope.payload();
        if guard_listener("channel", || listener(&payload)) {
            Dispatch::Delivered
        } else {
            Dispatch::Panicked
        }
    }

    pub fn get(&self, name: &str) -> Option<&ChannelEntry> {
        self.channels.get(name)
    }

    pub fn mark_active(&mut self, name: &str) -> bool {
        match self.channels.get_mut(name) {
            Some(entry) => {
                entry.status = SubscriptionStatus::Active;
                true
            }
            None => false,
        }
    }

    /// Subscriptions do not survive a connection; all go back to pending.
    pub fn mark_all_pending(&mut self) {
        for entry in self.channels.values_mut() {
            entry.status = SubscriptionStatus::Pending;
        }
    }

    pub fn pending(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|(_, e)| e.status == SubscriptionStatus::Pending)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

/// Handle to a subscribed channel.
///
/// Cheap to clone. Operations are forwarded to the client's event loop, so
/// they take effect in call order.
#[derive(Clone)]
pub struct Channel {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl Channel {
    pub(crate) fn new(name: String, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { name, commands }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listen for `event` on this channel. A later bind for the same event
    /// replaces this listener.
    pub fn bind<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        post_command(
            &self.commands,
            Command::Bind {
                channel: self.name.clone(),
                event: event.into(),
                listener: Arc::new(listener),
            },
        );
    }

    /// Send a client event on this channel.
    pub fn trigger(&self, event: impl Into<String>, data: serde_json::Value) {
        post_command(
            &self.commands,
            Command::Send {
                event: event.into(),
                channel: Some(self.name.clone()),
                data,
            },
        );
    }

    /// Current subscription status, or `None` if the channel has been
    /// unsubscribed or the client has shut down.
    pub async fn status(&self) -> Option<SubscriptionStatus> {
        let (reply, rx) = oneshot::channel();
        post_command(
            &self.commands,
            Command::Status {
                channel: self.name.clone(),
                reply,
            },
        );
        rx.await.ok().flatten()
    }

    pub fn unsubscribe(&self) {
        post_command(
            &self.commands,
            Command::Unsubscribe {
                channel: self.name.clone(),
            },
        );
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
