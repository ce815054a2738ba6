use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("closed")]
    Closed,
    #[error("io: {0}")]
    Io(String),
}

/// Bidirectional text-frame channel owned by one thread.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound frame, or `Ok(None)` once the peer has closed.
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(url: &Url) -> Result<Self, TransportError> {
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        debug!(status = %response.status(), path = url.path(), "websocket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map(Some)
                        .map_err(|e| TransportError::Io(format!("binary frame is not utf-8: {}", e)));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(err)) => {
                    return match map_ws_error(err) {
                        TransportError::Closed => Ok(None),
                        other => Err(other),
                    };
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(err) => match map_ws_error(err) {
                TransportError::Closed => Ok(()),
                other => Err(other),
            },
        }
    }
}

// Resets and broken pipes count as closure, not as protocol failures.
fn map_ws_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(
            ProtocolError::ResetWithoutClosingHandshake | ProtocolError::SendAfterClosing,
        )
        | WsError::Io(_) => TransportError::Closed,
        other => TransportError::Io(other.to_string()),
    }
}

/// In-memory transport backed by channels.
pub struct ChannelTransport {
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: bool,
}

/// The far side of a [`ChannelTransport`].
pub struct ChannelPeer {
    /// Frames delivered to the transport; dropping it closes the connection.
    pub frames: mpsc::Sender<String>,
    /// Frames the transport has sent.
    pub sent: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    pub fn pair(buffer: usize) -> (Self, ChannelPeer) {
        let (frames, incoming) = mpsc::channel(buffer);
        let (outgoing, sent) = mpsc::unbounded_channel();
        (
            Self {
                incoming,
                outgoing,
                closed: false,
            },
            ChannelPeer { frames, sent },
        )
    }
}

#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outgoing.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.incoming.close();
        Ok(())
    }
}
