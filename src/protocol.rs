use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ChatMode;

/// `{code, message, data}` wrapper shared by every REST response.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    pub code: Value,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ApiEnvelope {
    pub fn is_success(&self) -> bool {
        match &self.code {
            Value::String(code) => code == "0",
            Value::Number(code) => code.as_i64() == Some(0),
            _ => false,
        }
    }

    pub fn message_or(&self, fallback: &str) -> String {
        self.message
            .as_deref()
            .filter(|message| !message.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousToken {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadRequest<'a> {
    pub scenario_agent_id: &'a str,
    pub title: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ThreadCreated {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadKind {
    VisionData,
    UserData,
}

/// JSON side-channel part of a multipart upload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor<'a> {
    #[serde(rename = "type")]
    pub kind: UploadKind,
    pub agent_id: &'a str,
    pub thread_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploaded {
    pub file_id: String,
    pub file_url: String,
    pub original_filename: String,
}

#[derive(Debug, Serialize)]
pub struct OutboundFrame {
    pub message: OutboundMessage,
}

#[derive(Debug, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: OutboundPayload,
    pub metadata: MessageMetadata,
}

#[derive(Debug, Serialize)]
pub struct OutboundPayload {
    pub action: ChatMode,
    pub data: ConversationData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationData {
    pub chat_request_type: ChatMode,
    pub role: &'static str,
    pub user_id: String,
    pub thread_id: String,
    pub message_id: String,
    pub language: String,
    pub platform: String,
    pub timestamp: i64,
    pub contents: Vec<WireContent>,
    pub retry: bool,
    pub debug: bool,
    pub timezone_string: String,
    pub country_code: String,
    pub city: String,
    pub explicit_search: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub message_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "contentType")]
pub enum WireContent {
    #[serde(rename = "TEXT")]
    Text {
        #[serde(rename = "textData")]
        text_data: TextData,
    },
    #[serde(rename = "INPUT_IMAGE")]
    InputImage {
        #[serde(rename = "inputImageData")]
        input_image_data: InputImageData,
    },
    #[serde(rename = "INPUT_FILE")]
    InputFile {
        #[serde(rename = "inputFileData")]
        input_file_data: InputFileData,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextData {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputImageData {
    pub src: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFileData {
    pub src: String,
    pub resource_id: String,
    pub name: String,
}

/// Decoded server output for one `send`, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Ack,
    TextDelta { text: String },
    ReasoningStart,
    ReasoningDelta { text: String },
    ImageThumbnail { url: String },
    Image { url: String },
    Notification { data: Value },
    Done,
    Disconnected,
    DecodeError { message: String },
}

impl StreamEvent {
    /// True for the events after which nothing else is yielded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Done | StreamEvent::Disconnected | StreamEvent::DecodeError { .. }
        )
    }
}
