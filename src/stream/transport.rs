// =============================================================================
// Stream transport — the socket seam under the streaming connection
// =============================================================================
//
// The connection actor only ever sees text frames: a sink it writes JSON
// strings into, and a stream of inbound text frames that ends when the socket
// goes away. Ping/Pong is answered by tungstenite; Close ends the stream.
// =============================================================================

use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens full-duplex text connections to a URL.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)>;
}

/// Production transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        info!(url = %url, "connecting to market data WebSocket");
        let (ws_stream, _response) = connect_async(url)
            .await
            .context("failed to connect to market data WebSocket")?;
        info!(url = %url, "market data WebSocket connected");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(anyhow::Error::from)
            .with(|text: String| future::ready(Ok::<_, anyhow::Error>(Message::Text(text))));

        let stream = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(message) => frame_text(message).map(Ok),
                    Err(e) => Some(Err(anyhow::Error::from(e))),
                })
            });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Text payload of a data frame. Control frames and binary frames that are
/// not UTF-8 yield `None` and leave the socket untouched.
fn frame_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "dropping binary frame that is not UTF-8");
                None
            }
        },
        // Ping / Pong / raw frames: tungstenite answers pings itself.
        _ => {
            debug!("ignoring non-data WebSocket frame");
            None
        }
    }
}
