//! Full-duplex text transport: the trait the connection drives, and the
//! WebSocket implementation used by default.

use std::pin::Pin;

use futures_util::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::Error;

/// Outbound half of an open transport. Accepts whole text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of an open transport. Ends when the transport closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send>>;

/// An open transport, split into its two halves.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens connections to a URL.
///
/// The connection owns at most one [`Connection`] at a time. A failure from
/// `open` counts as a failed attempt and schedules a retry; it never reaches the
/// caller of `connect()`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Connection, Error>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Connection, Error> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url).await?;
        let (ws_write, ws_read) = ws.split();

        let sink = ws_write.with(|text: String| {
            future::ready(Ok::<_, Error>(tungstenite::Message::Text(text.into())))
        });

        // Only text frames carry envelopes. Control frames are answered by
        // tungstenite itself; a close frame is followed by end-of-stream.
        let stream = ws_read.filter_map(|frame| {
            future::ready(match frame {
                Ok(tungstenite::Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(tungstenite::Message::Close(close)) => {
                    tracing::debug!(?close, "Received close frame");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            })
        });

        Ok(Connection::new(Box::pin(sink), Box::pin(stream)))
    }
}
