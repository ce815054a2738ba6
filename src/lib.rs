//! Client for the signed, session-based companion chat protocol.
//!
//! A [`User`] authenticates an anonymous device, each [`Thread`] owns one chat
//! connection, and [`Thread::send`] turns the server's frames into a typed
//! [`StreamEvent`] stream that ends at `Done`, `Disconnected` or `DecodeError`.

pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod message;
pub mod protocol;
pub mod session;
pub mod signer;
pub mod transport;

pub use client::{ApiClient, Credential, DeviceId};
pub use config::{ClientConfig, LocaleConfig, MalformedFramePolicy};
pub use decoder::{DecoderState, EventDecoder};
pub use error::{Error, Result};
pub use message::{ChatMode, ContentBlock, UploadedFile};
pub use protocol::StreamEvent;
pub use session::{CloseHandle, DEFAULT_THREAD_TITLE, EventStream, Thread, User, stream_text};
pub use signer::{Signer, sign};
pub use transport::{ChannelPeer, ChannelTransport, FrameTransport, TransportError, WsTransport};
