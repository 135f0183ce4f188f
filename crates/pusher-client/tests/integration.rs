use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use httpmock::prelude::*;
use pusher_client::{
    ClientConfig, ConnectionListener, ConnectionState, HttpAuthorizer, PusherClient, TimingConfig,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

struct MockPusherServer {
    listener: TcpListener,
    port: u16,
}

impl MockPusherServer {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    /// Accept one WebSocket connection. Returns the request path and query.
    async fn accept(&self) -> Result<(WsStream, String), Box<dyn std::error::Error>> {
        let (tcp, _) = self.listener.accept().await?;
        let uri = Arc::new(Mutex::new(String::new()));
        let captured = Arc::clone(&uri);
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *captured.lock().unwrap() = req.uri().to_string();
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await?;
        let uri = uri.lock().unwrap().clone();
        Ok((ws, uri))
    }

    /// Accept one connection and send `connection_established`.
    async fn accept_and_establish(
        &self,
        socket_id: &str,
    ) -> Result<WsStream, Box<dyn std::error::Error>> {
        let (mut ws, _) = self.accept().await?;
        let data = json!({"socket_id": socket_id, "activity_timeout": 120}).to_string();
        send_json(
            &mut ws,
            json!({"event": "pusher:connection_established", "data": data}),
        )
        .await?;
        Ok(ws)
    }
}

async fn send_json(ws: &mut WsStream, frame: Value) -> Result<(), Box<dyn std::error::Error>> {
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await?;
    Ok(())
}

async fn read_json(ws: &mut WsStream) -> Result<Value, Box<dyn std::error::Error>> {
    loop {
        let frame = ws.next().await.ok_or("WebSocket closed unexpectedly")??;
        if let tungstenite::Message::Text(text) = frame {
            return Ok(serde_json::from_str(text.as_str())?);
        }
    }
}

fn test_config(port: u16) -> ClientConfig {
    let mut config = ClientConfig::new("test-key");
    config.encrypted = false;
    config.host = Some("127.0.0.1".to_string());
    config.port = Some(port);
    config
}

struct ConnectCounter(mpsc::UnboundedSender<String>);

impl ConnectionListener for ConnectCounter {
    fn on_connect(&self, socket_id: &str) {
        let _ = self.0.send(socket_id.to_string());
    }
}

async fn wait_for_state(client: &PusherClient, state: ConnectionState) {
    let mut states = client.state_changes();
    timeout(WAIT, states.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("client shut down");
}

// ---------------------------------------------------------------------------
// Test 1: handshake, subscribe, and receive an event
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_subscribe_and_receive_event() {
    let server = MockPusherServer::start().await.unwrap();
    let client = PusherClient::new(test_config(server.port)).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = client.subscribe("prices");
    channel.bind("update", move |data| {
        let _ = tx.send(data.clone());
    });
    client.connect();

    let (mut ws, uri) = server.accept().await.unwrap();
    assert_eq!(
        uri,
        format!(
            "/app/test-key?client=pusher-client-rs&version={}&protocol=7",
            env!("CARGO_PKG_VERSION")
        )
    );
    send_json(
        &mut ws,
        json!({"event": "pusher:connection_established", "data": "{\"socket_id\":\"1.2\"}"}),
    )
    .await
    .unwrap();

    let subscribe = read_json(&mut ws).await.unwrap();
    assert_eq!(
        subscribe,
        json!({"event": "pusher:subscribe", "channel": "prices", "data": {}})
    );
    assert!(client.is_connected());

    send_json(
        &mut ws,
        json!({"event": "update", "channel": "prices", "data": "{\"price\":42}"}),
    )
    .await
    .unwrap();

    let data = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(data, json!({"price": 42}));
}

// ---------------------------------------------------------------------------
// Test 2: private channel authorized over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn private_channel_with_http_authorizer() {
    let http = MockServer::start();
    let auth_mock = http.mock(|when, then| {
        when.method(POST)
            .path("/pusher/auth")
            .header("authorization", "Bearer session")
            .body_contains("socket_id=1.2")
            .body_contains("channel_name=private-room");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"auth": "test-key:signature"}));
    });

    let server = MockPusherServer::start().await.unwrap();
    let client = PusherClient::new(test_config(server.port)).unwrap();
    let authorizer = HttpAuthorizer::new(http.url("/pusher/auth"))
        .unwrap()
        .header("authorization", "Bearer session");
    client.subscribe_with_authorizer("private-room", Arc::new(authorizer));
    client.connect();

    let mut ws = server.accept_and_establish("1.2").await.unwrap();
    let subscribe = read_json(&mut ws).await.unwrap();
    assert_eq!(
        subscribe,
        json!({
            "event": "pusher:subscribe",
            "channel": "private-room",
            "data": {"auth": "test-key:signature"},
        })
    );
    auth_mock.assert();
}

#[tokio::test]
async fn rejected_http_authorization_is_not_retried() {
    let http = MockServer::start();
    let auth_mock = http.mock(|when, then| {
        when.method(POST).path("/pusher/auth");
        then.status(403);
    });

    let server = MockPusherServer::start().await.unwrap();
    let client = PusherClient::new(test_config(server.port)).unwrap();
    let authorizer = HttpAuthorizer::new(http.url("/pusher/auth")).unwrap();
    client.subscribe_with_authorizer("private-room", Arc::new(authorizer));
    client.connect();

    let mut ws = server.accept_and_establish("1.2").await.unwrap();
    timeout(WAIT, async {
        while client.stats().auth_failures == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("authorization never failed");

    // The next frame the client sends is the reply to our ping, not a subscribe.
    send_json(&mut ws, json!({"event": "pusher:ping", "data": {}}))
        .await
        .unwrap();
    let reply = read_json(&mut ws).await.unwrap();
    assert_eq!(reply["event"], "pusher:pong");
    auth_mock.assert_hits(1);
}

// ---------------------------------------------------------------------------
// Test 3: server ping is answered
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_ping_is_answered_with_pong() {
    let server = MockPusherServer::start().await.unwrap();
    let client = PusherClient::new(test_config(server.port)).unwrap();
    client.connect();

    let mut ws = server.accept_and_establish("1.2").await.unwrap();
    wait_for_state(&client, ConnectionState::Connected).await;

    send_json(&mut ws, json!({"event": "pusher:ping", "data": {}}))
        .await
        .unwrap();
    let reply = read_json(&mut ws).await.unwrap();
    assert_eq!(reply, json!({"event": "pusher:pong", "data": {}}));
}

// ---------------------------------------------------------------------------
// Test 4: server-side close triggers reconnect and resubscribe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnects_after_server_close() {
    let server = MockPusherServer::start().await.unwrap();
    let mut config = test_config(server.port);
    config.timing = Some(TimingConfig {
        initial_timeout: Duration::from_millis(100),
        retry_increment: Duration::from_millis(50),
        max_retry_delay: Duration::from_millis(500),
        ..Default::default()
    });
    let client = PusherClient::new(config).unwrap();
    let (tx, mut connects) = mpsc::unbounded_channel();
    client.set_listener(Arc::new(ConnectCounter(tx)));
    client.subscribe("news");
    client.connect();

    let mut ws = server.accept_and_establish("1.1").await.unwrap();
    read_json(&mut ws).await.unwrap();
    assert_eq!(timeout(WAIT, connects.recv()).await.unwrap().unwrap(), "1.1");
    ws.close(None).await.unwrap();
    drop(ws);

    let mut ws = timeout(WAIT, server.accept_and_establish("2.2"))
        .await
        .unwrap()
        .unwrap();
    let subscribe = read_json(&mut ws).await.unwrap();
    assert_eq!(subscribe["channel"], "news");
    assert_eq!(timeout(WAIT, connects.recv()).await.unwrap().unwrap(), "2.2");
    assert_eq!(client.stats().connection_attempts, 2);
}

// ---------------------------------------------------------------------------
// Test 5: disconnect closes the socket
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_closes_socket() {
    let server = MockPusherServer::start().await.unwrap();
    let client = PusherClient::new(test_config(server.port)).unwrap();
    client.connect();

    let mut ws = server.accept_and_establish("1.2").await.unwrap();
    wait_for_state(&client, ConnectionState::Connected).await;
    client.disconnect();

    let end = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok(), "socket was not closed");
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
