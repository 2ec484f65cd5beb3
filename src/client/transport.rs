//! WebSocket Transport Layer
//!
//! Connects to the broker endpoint and moves text messages. Knows nothing
//! about STOMP, credentials or reconnection.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::shared::error::RealtimeError;

/// Send half of the broker socket
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Receive half of the broker socket
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Open a WebSocket to `url` and split it for concurrent send/receive
pub async fn open(url: &str) -> Result<(WsSink, WsStream), RealtimeError> {
    debug!(url = %url, "[STOMP] Opening WebSocket");

    let (ws, response) = connect_async(url)
        .await
        .map_err(|e| RealtimeError::transport(format!("WebSocket connect failed: {}", e)))?;

    debug!(url = %url, status = %response.status(), "[STOMP] WebSocket open");
    Ok(ws.split())
}

/// Send one STOMP payload as a text message
pub async fn send_text(sink: &mut WsSink, payload: String) -> Result<(), RealtimeError> {
    sink.send(Message::Text(payload))
        .await
        .map_err(|e| RealtimeError::transport(format!("Failed to send: {}", e)))
}

/// Close the socket, ignoring errors from an already-dead peer
pub async fn close(sink: &mut WsSink) {
    if let Err(e) = sink.close().await {
        debug!("[STOMP] Close on dead socket: {}", e);
    }
}

/// What one item from the receive half means to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A text payload (one or more STOMP frames, or a heart-beat)
    Text(String),
    /// Peer closed, or the stream ended
    Closed(Option<String>),
    /// Socket failure
    Failed(String),
    /// A payload that cannot carry STOMP; dropped, the socket stays up
    Malformed(String),
    /// Ping/pong and other control traffic
    Control,
}

/// Interpret the next item of a [`WsStream`]
pub fn classify(item: Option<Result<Message, WsError>>) -> Incoming {
    match item {
        Some(Ok(Message::Text(text))) => Incoming::Text(text),
        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
            Ok(text) => Incoming::Text(text),
            Err(e) => Incoming::Malformed(format!("binary message is not UTF-8: {}", e)),
        },
        Some(Ok(Message::Close(frame))) => {
            Incoming::Closed(frame.map(|f| format!("{} {}", f.code, f.reason)))
        }
        // tungstenite answers pings itself
        Some(Ok(_)) => Incoming::Control,
        Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
            Incoming::Closed(None)
        }
        Some(Err(e)) => Incoming::Failed(e.to_string()),
    }
}
