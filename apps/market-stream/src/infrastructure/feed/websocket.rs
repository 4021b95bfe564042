//! WebSocket Transport
//!
//! [`FeedConnector`] over `tokio-tungstenite` with rustls. Only text frames
//! are surfaced; protocol pings are answered by tungstenite itself and a
//! close frame ends the link.

use async_trait::async_trait;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::application::ports::{FeedConnector, FeedLink, TransportError};

/// Opens WebSocket links to the feed endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    /// Create a connector for `url`.
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl FeedConnector for WebSocketConnector {
    async fn connect(&self) -> Result<FeedLink, TransportError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Feed sent close frame");
                    Some(Err(TransportError::Closed))
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            })
        });

        Ok(FeedLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}
