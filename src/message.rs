use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LocaleConfig;
use crate::protocol::{
    ConversationData, InputFileData, InputImageData, MessageMetadata, OutboundFrame,
    OutboundMessage, OutboundPayload, TextData, WireContent,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatMode {
    #[default]
    UserInput,
    DeepThink,
    AiRead,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::UserInput => "USER_INPUT",
            ChatMode::DeepThink => "DEEP_THINK",
            ChatMode::AiRead => "AI_READ",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().replace('-', "_").as_str() {
            "USER_INPUT" => Ok(ChatMode::UserInput),
            "DEEP_THINK" => Ok(ChatMode::DeepThink),
            "AI_READ" => Ok(ChatMode::AiRead),
            other => Err(format!(
                "unknown chat mode '{}', expected USER_INPUT, DEEP_THINK or AI_READ",
                other
            )),
        }
    }
}

/// One piece of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text {
        value: String,
    },
    File {
        resource_id: String,
        url: String,
        display_name: String,
    },
    Image {
        resource_id: String,
        url: String,
    },
}

impl ContentBlock {
    pub fn text(value: impl Into<String>) -> Self {
        ContentBlock::Text {
            value: value.into(),
        }
    }

    pub fn to_wire(&self) -> WireContent {
        match self {
            ContentBlock::Text { value } => WireContent::Text {
                text_data: TextData {
                    text: value.clone(),
                },
            },
            ContentBlock::Image { resource_id, url } => WireContent::InputImage {
                input_image_data: InputImageData {
                    src: url.clone(),
                    resource_id: resource_id.clone(),
                },
            },
            ContentBlock::File {
                resource_id,
                url,
                display_name,
            } => WireContent::InputFile {
                input_file_data: InputFileData {
                    src: url.clone(),
                    resource_id: resource_id.clone(),
                    name: display_name.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_id: String,
    pub file_url: String,
    pub file_name: String,
    pub is_image: bool,
}

impl From<&UploadedFile> for ContentBlock {
    fn from(file: &UploadedFile) -> Self {
        if file.is_image {
            ContentBlock::Image {
                resource_id: file.file_id.clone(),
                url: file.file_url.clone(),
            }
        } else {
            ContentBlock::File {
                resource_id: file.file_id.clone(),
                url: file.file_url.clone(),
                display_name: file.file_name.clone(),
            }
        }
    }
}

impl From<UploadedFile> for ContentBlock {
    fn from(file: UploadedFile) -> Self {
        ContentBlock::from(&file)
    }
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Builds the outbound `CONVERSATION` envelope for one user turn.
pub fn encode(
    mode: ChatMode,
    contents: &[ContentBlock],
    device_id: &str,
    thread_id: &str,
    message_id: &str,
    locale: &LocaleConfig,
    timestamp_ms: i64,
) -> OutboundFrame {
    OutboundFrame {
        message: OutboundMessage {
            kind: "CONVERSATION",
            payload: OutboundPayload {
                action: mode,
                data: ConversationData {
                    chat_request_type: mode,
                    role: "user",
                    user_id: device_id.to_string(),
                    thread_id: thread_id.to_string(),
                    message_id: message_id.to_string(),
                    language: locale.language.clone(),
                    platform: locale.platform.clone(),
                    timestamp: timestamp_ms,
                    contents: contents.iter().map(ContentBlock::to_wire).collect(),
                    retry: false,
                    debug: false,
                    timezone_string: locale.timezone.clone(),
                    country_code: locale.country_code.clone(),
                    city: locale.city.clone(),
                    explicit_search: "AUTO",
                },
            },
            metadata: MessageMetadata {
                message_id: message_id.to_string(),
                timestamp: timestamp_ms,
            },
        },
    }
}
