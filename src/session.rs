//! Users and threads.
//!
//! A [`User`] holds an anonymous device identity and its bearer credential.
//! Each [`Thread`] it creates owns exactly one chat connection and runs one
//! send at a time: a message goes out, then inbound frames are decoded until
//! the turn reaches a terminal event.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{ApiClient, Credential, DeviceId};
use crate::config::ClientConfig;
use crate::decoder::EventDecoder;
use crate::error::{Error, Result};
use crate::message::{ChatMode, ContentBlock, UploadedFile, encode, new_message_id};
use crate::protocol::StreamEvent;
use crate::transport::{FrameTransport, TransportError};

pub const DEFAULT_THREAD_TITLE: &str = "新しいスレッド";

/// Lazy, single-pass sequence of events for one send.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>>;

pub struct User {
    client: Arc<ApiClient>,
    identity: DeviceId,
    credential: Credential,
}

impl User {
    /// Generates a device identity and authenticates it.
    pub async fn create(config: ClientConfig) -> Result<Self> {
        let client = Arc::new(ApiClient::new(config)?);
        let identity = client.create_identity();
        let credential = client.authenticate(&identity).await?;
        Ok(Self::from_parts(client, identity, credential))
    }

    pub fn from_parts(client: Arc<ApiClient>, identity: DeviceId, credential: Credential) -> Self {
        Self {
            client,
            identity,
            credential,
        }
    }

    pub fn identity(&self) -> &DeviceId {
        &self.identity
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub async fn create_thread(&self, title: &str) -> Result<Thread> {
        let agent_id = self.client.config().agent_id.clone();
        self.create_thread_for_agent(title, &agent_id).await
    }

    /// Creates a server-side thread and opens its chat connection.
    pub async fn create_thread_for_agent(&self, title: &str, agent_id: &str) -> Result<Thread> {
        let thread_id = self
            .client
            .create_thread(&self.identity, &self.credential, agent_id, title)
            .await?;
        let transport = self
            .client
            .open_session(&thread_id, &self.identity, &self.credential)
            .await?;

        Ok(Thread::new(
            thread_id,
            Arc::clone(&self.client),
            self.identity.clone(),
            self.credential.clone(),
            Box::new(transport),
        ))
    }
}

/// Closes a [`Thread`] from outside the task consuming its events.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.signal.borrow()
    }
}

pub struct Thread {
    id: String,
    client: Arc<ApiClient>,
    identity: DeviceId,
    credential: Credential,
    transport: Box<dyn FrameTransport>,
    close_signal: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
    released: bool,
}

impl Thread {
    pub fn new(
        id: String,
        client: Arc<ApiClient>,
        identity: DeviceId,
        credential: Credential,
        transport: Box<dyn FrameTransport>,
    ) -> Self {
        let (close_signal, close_rx) = watch::channel(false);
        Self {
            id,
            client,
            identity,
            credential,
            transport,
            close_signal: Arc::new(close_signal),
            close_rx,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            signal: Arc::clone(&self.close_signal),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.close_rx.borrow()
    }

    pub async fn upload(
        &self,
        file: Vec<u8>,
        filename: &str,
        mime_type: &str,
        is_image: bool,
    ) -> Result<UploadedFile> {
        self.client
            .upload_file(
                &self.identity,
                &self.credential,
                &self.id,
                file,
                filename,
                mime_type,
                is_image,
            )
            .await
    }

    /// Sends one message and returns the events it produces.
    ///
    /// The message is written before this returns; a write failure is a
    /// [`Error::Connection`]. The returned stream ends after `Done`,
    /// `Disconnected` or `DecodeError`, or silently when the thread is closed
    /// through a [`CloseHandle`].
    pub async fn send(&mut self, mode: ChatMode, contents: &[ContentBlock]) -> Result<EventStream<'_>> {
        if self.is_closed() {
            self.release().await;
            return Err(Error::Connection("thread is closed".to_string()));
        }

        let config = self.client.config();
        let message_id = new_message_id();
        let frame = encode(
            mode,
            contents,
            self.identity.as_str(),
            &self.id,
            &message_id,
            &config.locale,
            chrono::Utc::now().timestamp_millis(),
        );
        let payload = serde_json::to_string(&frame)?;

        self.transport
            .send_text(payload)
            .await
            .map_err(|e| Error::Connection(format!("failed to send message: {}", e)))?;
        info!(thread_id = %self.id, %message_id, %mode, "message sent");

        let mut decoder = EventDecoder::new(config.malformed_frames);
        let frame_timeout = config.frame_timeout;
        let mut close_rx = self.close_rx.clone();
        let transport = &mut self.transport;
        let released = &mut self.released;
        let thread_id = self.id.clone();

        Ok(Box::pin(async_stream::stream! {
            loop {
                let inbound = tokio::select! {
                    biased;
                    _ = closed(&mut close_rx) => None,
                    inbound = next_inbound(transport.as_mut(), frame_timeout) => Some(inbound),
                };

                match inbound {
                    None => {
                        debug!(%thread_id, "thread closed while streaming");
                        if let Err(err) = transport.close().await {
                            warn!(%thread_id, error = %err, "failed to close transport");
                        }
                        *released = true;
                        break;
                    }
                    Some(Inbound::Frame(raw)) => {
                        for event in decoder.decode_text(&raw) {
                            yield event;
                        }
                    }
                    Some(Inbound::Closed) => {
                        if let Some(event) = decoder.on_closed() {
                            yield event;
                        }
                    }
                    Some(Inbound::Failed(message)) => {
                        if let Some(event) = decoder.on_failure(message) {
                            yield event;
                        }
                    }
                }

                if decoder.is_terminal() {
                    debug!(%thread_id, "turn finished");
                    break;
                }
            }
        }))
    }

    /// Releases the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        self.close_signal.send_replace(true);
        self.release().await;
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.transport.close().await {
            Ok(()) => info!(thread_id = %self.id, "thread closed"),
            Err(err) => warn!(thread_id = %self.id, error = %err, "failed to close transport"),
        }
    }
}

async fn closed(close_rx: &mut watch::Receiver<bool>) {
    let _ = close_rx.wait_for(|closed| *closed).await;
}

enum Inbound {
    Frame(String),
    Closed,
    Failed(String),
}

async fn next_inbound(transport: &mut dyn FrameTransport, frame_timeout: Option<Duration>) -> Inbound {
    let received = match frame_timeout {
        Some(limit) => match tokio::time::timeout(limit, transport.recv_text()).await {
            Ok(received) => received,
            Err(_) => return Inbound::Failed("timed out waiting for frame".to_string()),
        },
        None => transport.recv_text().await,
    };

    match received {
        Ok(Some(raw)) => Inbound::Frame(raw),
        Ok(None) | Err(TransportError::Closed) => Inbound::Closed,
        Err(TransportError::Io(message)) => Inbound::Failed(message),
    }
}

/// Streams only the text of a one-off prompt on a fresh user and thread.
pub fn stream_text(
    config: ClientConfig,
    prompt: impl Into<String>,
    mode: ChatMode,
) -> impl Stream<Item = Result<String>> + Send {
    let prompt = prompt.into();
    async_stream::try_stream! {
        let user = User::create(config).await?;
        let mut thread = user.create_thread(DEFAULT_THREAD_TITLE).await?;

        let mut failure = None;
        match thread.send(mode, &[ContentBlock::text(prompt)]).await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    match event {
                        StreamEvent::TextDelta { text } => yield text,
                        StreamEvent::DecodeError { message } => {
                            failure = Some(Error::Decode(message));
                            break;
                        }
                        StreamEvent::Done | StreamEvent::Disconnected => break,
                        _ => {}
                    }
                }
            }
            Err(err) => failure = Some(err),
        }
        thread.close().await;

        if let Some(err) = failure {
            Err::<(), Error>(err)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake_server;
    use crate::client::{AUTH_PATH, THREAD_PATH};
    use crate::decoder::{THINKING_SENTINEL, frames};
    use crate::transport::{ChannelPeer, ChannelTransport};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::SinkExt;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    const BUFFER: usize = 16;

    fn thread_with(config: ClientConfig) -> (Thread, ChannelPeer) {
        let (transport, peer) = ChannelTransport::pair(BUFFER);
        let thread = Thread::new(
            "thread-id".to_string(),
            Arc::new(ApiClient::new(config).unwrap()),
            DeviceId::new("dev-id"),
            Credential::new("token"),
            Box::new(transport),
        );
        (thread, peer)
    }

    fn thread() -> (Thread, ChannelPeer) {
        thread_with(ClientConfig::new("secret"))
    }

    async fn queue(peer: &ChannelPeer, raw: &[String]) {
        for frame in raw {
            peer.frames.send(frame.clone()).await.unwrap();
        }
    }

    async fn collect(stream: EventStream<'_>) -> Vec<StreamEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn send_writes_envelope_and_decodes_turn() {
        let (mut thread, mut peer) = thread();
        queue(
            &peer,
            &[
                frames::ack(),
                frames::event_append(json!([
                    {"contentType": "TEXT", "textData": {"text": THINKING_SENTINEL}}
                ])),
                frames::text("Hello "),
                frames::summary("World"),
                frames::image("thumb.url", "preview.url"),
                frames::done(),
            ],
        )
        .await;

        let events = collect(
            thread
                .send(ChatMode::UserInput, &[ContentBlock::text("hi")])
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Ack,
                StreamEvent::ReasoningStart,
                StreamEvent::TextDelta {
                    text: "Hello ".to_string()
                },
                StreamEvent::ReasoningDelta {
                    text: "World".to_string()
                },
                StreamEvent::ImageThumbnail {
                    url: "thumb.url".to_string()
                },
                StreamEvent::Image {
                    url: "preview.url".to_string()
                },
                StreamEvent::Done,
            ]
        );

        let sent: Value = serde_json::from_str(&peer.sent.recv().await.unwrap()).unwrap();
        let data = &sent["message"]["payload"]["data"];
        assert_eq!(data["threadId"], "thread-id");
        assert_eq!(data["userId"], "dev-id");
        assert_eq!(
            data["contents"],
            json!([{"contentType": "TEXT", "textData": {"text": "hi"}}])
        );
    }

    #[tokio::test]
    async fn nothing_is_read_after_done() {
        let (mut thread, peer) = thread();
        queue(&peer, &[frames::done(), frames::text("next turn")]).await;

        let events = collect(thread.send(ChatMode::UserInput, &[]).await.unwrap()).await;
        assert_eq!(events, vec![StreamEvent::Done]);
        assert_eq!(peer.frames.capacity(), BUFFER - 1);
    }

    #[tokio::test]
    async fn closing_mid_turn_yields_disconnected_without_done() {
        let (mut thread, peer) = thread();
        queue(&peer, &[frames::ack(), frames::text("partial")]).await;
        drop(peer.frames);

        let events = collect(thread.send(ChatMode::UserInput, &[]).await.unwrap()).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Ack,
                StreamEvent::TextDelta {
                    text: "partial".to_string()
                },
                StreamEvent::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn malformed_frame_ends_turn_with_decode_error() {
        let (mut thread, peer) = thread();
        queue(&peer, &["not json".to_string(), frames::done()]).await;

        let events = collect(thread.send(ChatMode::UserInput, &[]).await.unwrap()).await;
        assert!(matches!(events.as_slice(), [StreamEvent::DecodeError { .. }]));
    }

    #[tokio::test]
    async fn skip_policy_reads_past_malformed_frames() {
        let config = ClientConfig::new("secret")
            .with_malformed_frames(crate::config::MalformedFramePolicy::SkipAndLog);
        let (mut thread, peer) = thread_with(config);
        queue(&peer, &["not json".to_string(), frames::done()]).await;

        let events = collect(thread.send(ChatMode::UserInput, &[]).await.unwrap()).await;
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[tokio::test]
    async fn frame_timeout_surfaces_as_decode_error() {
        let config = ClientConfig::new("secret").with_frame_timeout(Duration::from_millis(50));
        let (mut thread, peer) = thread_with(config);
        queue(&peer, &[frames::ack()]).await;

        let events = collect(thread.send(ChatMode::UserInput, &[]).await.unwrap()).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Ack,
                StreamEvent::DecodeError {
                    message: "timed out waiting for frame".to_string()
                }
            ]
        );
        drop(peer);
    }

    #[tokio::test]
    async fn close_handle_stops_stream_and_releases_transport() {
        let (mut thread, peer) = thread();
        let handle = thread.close_handle();
        queue(&peer, &[frames::ack(), frames::text("never delivered")]).await;

        {
            let mut events = thread.send(ChatMode::UserInput, &[]).await.unwrap();
            assert_eq!(events.next().await, Some(StreamEvent::Ack));
            handle.close();
            assert_eq!(events.next().await, None);
        }

        assert!(thread.is_closed());
        assert!(handle.is_closed());
        thread.close().await;
        assert!(matches!(
            thread.send(ChatMode::UserInput, &[]).await,
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_sends() {
        let (mut thread, _peer) = thread();
        thread.close().await;
        thread.close().await;
        assert!(thread.is_closed());
        assert!(matches!(
            thread.send(ChatMode::UserInput, &[ContentBlock::text("late")]).await,
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn write_failure_is_connection_error() {
        let (mut thread, peer) = thread();
        drop(peer.sent);
        assert!(matches!(
            thread.send(ChatMode::UserInput, &[]).await,
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn each_send_uses_a_fresh_message_id() {
        let (mut thread, mut peer) = thread();
        queue(&peer, &[frames::done(), frames::done()]).await;

        collect(thread.send(ChatMode::UserInput, &[]).await.unwrap()).await;
        collect(thread.send(ChatMode::DeepThink, &[]).await.unwrap()).await;

        let first: Value = serde_json::from_str(&peer.sent.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&peer.sent.recv().await.unwrap()).unwrap();
        assert_ne!(
            first["message"]["metadata"]["messageId"],
            second["message"]["metadata"]["messageId"]
        );
        assert_eq!(second["message"]["payload"]["action"], "DEEP_THINK");
    }

    #[tokio::test]
    async fn threads_stream_independently() {
        let (mut first, first_peer) = thread();
        let (mut second, second_peer) = thread();
        queue(&first_peer, &[frames::text("one"), frames::done()]).await;
        queue(&second_peer, &[frames::text("two"), frames::done()]).await;

        let (a, b) = tokio::join!(
            async { collect(first.send(ChatMode::UserInput, &[]).await.unwrap()).await },
            async { collect(second.send(ChatMode::UserInput, &[]).await.unwrap()).await },
        );
        assert_eq!(a[0], StreamEvent::TextDelta { text: "one".to_string() });
        assert_eq!(b[0], StreamEvent::TextDelta { text: "two".to_string() });
    }

    async fn spawn_chat_server(replies: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<Message>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            let mut received = vec![ws.next().await.unwrap().unwrap()];
            for reply in replies {
                ws.send(Message::Text(reply)).await.unwrap();
            }
            while let Some(Ok(message)) = ws.next().await {
                received.push(message);
            }
            received
        });
        (format!("ws://{}", addr), server)
    }

    fn rest_app() -> Router {
        Router::new()
            .route(
                AUTH_PATH,
                get(|| async {
                    Json(json!({"code": "0", "data": {"accessToken": "anon-token"}}))
                }),
            )
            .route(
                THREAD_PATH,
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["title"], DEFAULT_THREAD_TITLE);
                    Json(json!({"code": "0", "data": {"id": "thread-9"}}))
                }),
            )
    }

    #[tokio::test]
    async fn user_creates_thread_bound_to_live_connection() {
        let base = fake_server::spawn(rest_app()).await;
        let (ws_base, server) = spawn_chat_server(vec![frames::ack(), frames::done()]).await;
        let config = ClientConfig::new("secret")
            .with_base_url(&base)
            .with_ws_base_url(&ws_base);

        let user = User::create(config).await.unwrap();
        assert_eq!(user.credential().as_str(), "anon-token");

        let mut thread = user.create_thread(DEFAULT_THREAD_TITLE).await.unwrap();
        assert_eq!(thread.id(), "thread-9");

        let events = collect(
            thread
                .send(ChatMode::UserInput, &[ContentBlock::text("こんにちは")])
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(events, vec![StreamEvent::Ack, StreamEvent::Done]);
        thread.close().await;

        let received = server.await.unwrap();
        let Message::Text(sent) = &received[0] else {
            panic!("expected text frame, got {:?}", received[0]);
        };
        let sent: Value = serde_json::from_str(sent).unwrap();
        assert_eq!(sent["message"]["payload"]["data"]["threadId"], "thread-9");
        assert!(received.iter().any(|m| matches!(m, Message::Close(_))));
    }

    #[tokio::test]
    async fn stream_text_yields_only_text_and_closes_thread() {
        let base = fake_server::spawn(rest_app()).await;
        let (ws_base, server) = spawn_chat_server(vec![
            frames::ack(),
            frames::summary("thinking about it"),
            frames::text("Hello "),
            frames::text("World"),
            frames::done(),
        ])
        .await;
        let config = ClientConfig::new("secret")
            .with_base_url(&base)
            .with_ws_base_url(&ws_base);

        let chunks: Vec<String> = stream_text(config, "hi", ChatMode::UserInput)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["Hello ".to_string(), "World".to_string()]);

        let received = server.await.unwrap();
        assert!(received.iter().any(|m| matches!(m, Message::Close(_))));
    }

    #[tokio::test]
    async fn stream_text_reports_decode_errors() {
        let base = fake_server::spawn(rest_app()).await;
        let (ws_base, _server) =
            spawn_chat_server(vec![frames::text("partial"), "{broken".to_string()]).await;
        let config = ClientConfig::new("secret")
            .with_base_url(&base)
            .with_ws_base_url(&ws_base);

        let chunks: Vec<Result<String>> = stream_text(config, "hi", ChatMode::UserInput)
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_deref().unwrap(), "partial");
        assert!(matches!(chunks[1], Err(Error::Decode(_))));
    }
}
