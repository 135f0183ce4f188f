//! Subscribe to a Pusher channel and print every event bound on it.
//!
//! ```sh
//! cargo run -p pusher-client --example subscribe -- <APP_KEY> <CHANNEL> <EVENT>...
//! ```
//!
//! Private channels (`private-*`) need the app secret so the example can sign
//! the subscription itself:
//! ```sh
//! PUSHER_APP_SECRET=secret cargo run -p pusher-client --example subscribe \
//!     -- <APP_KEY> private-<NAME> <EVENT>...
//! ```
//!
//! Set `PUSHER_HOST` to connect somewhere other than `ws.pusherapp.com`.
//! Event data is printed to stdout (pipe to `jq` for formatting).

use std::fmt::Write as _;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use pusher_client::{Authorizer, BoxError, ClientConfig, ConnectionListener, PusherClient};

type HmacSha256 = Hmac<Sha256>;

/// Signs subscriptions locally. Only for trying things out: a real
/// application keeps the secret on its server.
struct LocalSigner {
    app_key: String,
    secret: String,
}

#[async_trait::async_trait]
impl Authorizer for LocalSigner {
    async fn authorize(&self, socket_id: &str, channel: &str) -> Result<String, BoxError> {
        // Pusher signing format: socket_id:channel_name
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| format!("HMAC error: {e}"))?;
        mac.update(format!("{socket_id}:{channel}").as_bytes());
        let mut signature = String::new();
        for byte in mac.finalize().into_bytes() {
            write!(signature, "{byte:02x}")?;
        }
        Ok(format!("{}:{signature}", self.app_key))
    }
}

struct Printer;

impl ConnectionListener for Printer {
    fn on_connect(&self, socket_id: &str) {
        eprintln!("[connected] socket_id={socket_id}");
    }

    fn on_disconnect(&self) {
        eprintln!("[disconnected]");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let usage = "usage: subscribe <APP_KEY> <CHANNEL> <EVENT>...";
    let app_key = args.first().ok_or(usage)?.clone();
    let channel_name = args.get(1).ok_or(usage)?.clone();
    let events = args.get(2..).unwrap_or_default();
    if events.is_empty() {
        return Err(usage.into());
    }

    let mut config = ClientConfig::new(app_key.clone());
    config.host = std::env::var("PUSHER_HOST").ok();
    let client = PusherClient::new(config)?;
    client.set_listener(Arc::new(Printer));

    let channel = if channel_name.starts_with("private-") {
        let secret = std::env::var("PUSHER_APP_SECRET")
            .map_err(|_| "PUSHER_APP_SECRET is required for private channels")?;
        client.subscribe_with_authorizer(&channel_name, Arc::new(LocalSigner { app_key, secret }))
    } else {
        client.subscribe(&channel_name)
    };

    for event in events {
        let name = event.clone();
        channel.bind(event.as_str(), move |data| {
            eprintln!("[event] {name}");
            println!("{data}");
        });
    }

    eprintln!("subscribing to '{channel}' ...");
    client.connect();

    tokio::signal::ctrl_c().await?;
    client.disconnect();
    Ok(())
}
