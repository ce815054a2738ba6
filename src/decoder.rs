//! Inbound frame decoding.
//!
//! The decoder turns raw server frames into [`StreamEvent`]s for a single
//! `send`. It has two states: `Awaiting` while frames are still expected and
//! `Terminal` once `Done`, `Disconnected` or `DecodeError` has been produced.
//! Nothing is decoded after the terminal state is reached.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MalformedFramePolicy;
use crate::protocol::StreamEvent;

/// Text the server sends with `action = EVENT` when reasoning begins.
///
/// Only this exact text becomes `ReasoningStart`. Any other `EVENT` text,
/// such as a search status, is delivered as an ordinary `TextDelta`, so
/// callers that join text deltas will see those status strings inline.
pub const THINKING_SENTINEL: &str = "思考中...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Awaiting,
    Terminal,
}

#[derive(Debug, Error)]
enum FrameError {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected `{0}` to be an object")]
    NotObject(&'static str),
    #[error("expected `{0}` to be an array")]
    NotArray(&'static str),
    #[error("expected `{0}` to be a string")]
    NotString(&'static str),
}

#[derive(Debug)]
pub struct EventDecoder {
    state: DecoderState,
    policy: MalformedFramePolicy,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new(MalformedFramePolicy::default())
    }
}

impl EventDecoder {
    pub fn new(policy: MalformedFramePolicy) -> Self {
        Self {
            state: DecoderState::Awaiting,
            policy,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state == DecoderState::Terminal
    }

    /// Decodes one raw text frame into zero or more events.
    pub fn decode_text(&mut self, raw: &str) -> Vec<StreamEvent> {
        if self.reject_after_terminal() {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(frame) => self.decode_value(&frame),
            Err(err) => self.malformed(FrameError::from(err)).into_iter().collect(),
        }
    }

    /// Decodes one already-parsed frame into zero or more events.
    pub fn decode_value(&mut self, frame: &Value) -> Vec<StreamEvent> {
        if self.reject_after_terminal() {
            return Vec::new();
        }
        let mut events = Vec::new();
        match classify(frame, &mut events) {
            Ok(()) => {
                if events.iter().any(StreamEvent::is_terminal) {
                    self.state = DecoderState::Terminal;
                }
            }
            Err(err) => {
                // Items decoded before the failure still go out, in order.
                if let Some(event) = self.malformed(err) {
                    events.push(event);
                }
            }
        }
        events
    }

    /// The transport closed while a frame was awaited.
    pub fn on_closed(&mut self) -> Option<StreamEvent> {
        self.terminate(StreamEvent::Disconnected)
    }

    /// A failure outside frame classification (transport error, timeout).
    pub fn on_failure(&mut self, message: impl Into<String>) -> Option<StreamEvent> {
        self.terminate(StreamEvent::DecodeError {
            message: message.into(),
        })
    }

    fn terminate(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        if self.reject_after_terminal() {
            return None;
        }
        self.state = DecoderState::Terminal;
        Some(event)
    }

    fn reject_after_terminal(&self) -> bool {
        if self.is_terminal() {
            warn!("frame input after terminal state ignored");
            return true;
        }
        false
    }

    fn malformed(&mut self, err: FrameError) -> Option<StreamEvent> {
        match self.policy {
            MalformedFramePolicy::FailStop => {
                self.state = DecoderState::Terminal;
                Some(StreamEvent::DecodeError {
                    message: err.to_string(),
                })
            }
            MalformedFramePolicy::SkipAndLog => {
                warn!(error = %err, "skipping malformed frame");
                None
            }
        }
    }
}

fn classify(frame: &Value, events: &mut Vec<StreamEvent>) -> Result<(), FrameError> {
    let root = frame.as_object().ok_or(FrameError::NotObject("frame"))?;
    let Some(envelope) = child_object(root, "webSocket")? else {
        return Ok(());
    };

    match tag(envelope, "type") {
        Some("ACK") => events.push(StreamEvent::Ack),
        Some("CONVERSATION") => conversation(envelope, events)?,
        Some("NOTIFICATION") => {
            let data = match child_object(envelope, "payload")? {
                Some(payload) => payload.get("data").cloned().unwrap_or(Value::Null),
                None => Value::Null,
            };
            events.push(StreamEvent::Notification { data });
        }
        other => debug!(frame_type = ?other, "ignoring frame"),
    }
    Ok(())
}

fn conversation(
    envelope: &Map<String, Value>,
    events: &mut Vec<StreamEvent>,
) -> Result<(), FrameError> {
    let Some(payload) = child_object(envelope, "payload")? else {
        return Ok(());
    };
    let action = tag(payload, "action");
    let Some(data) = child_object(payload, "data")? else {
        return Ok(());
    };

    match tag(data, "chatResponseStatus") {
        Some("APPEND") => append(action, data, events),
        Some("DONE") => {
            events.push(StreamEvent::Done);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn append(
    action: Option<&str>,
    data: &Map<String, Value>,
    events: &mut Vec<StreamEvent>,
) -> Result<(), FrameError> {
    let Some(contents) = child_array(data, "contents")? else {
        return Ok(());
    };

    for item in contents {
        let content = item.as_object().ok_or(FrameError::NotObject("contents[]"))?;
        match tag(content, "contentType") {
            Some("TEXT") => {
                let text = content_text(content)?;
                if action == Some("EVENT") && text == THINKING_SENTINEL {
                    events.push(StreamEvent::ReasoningStart);
                } else {
                    events.push(StreamEvent::TextDelta {
                        text: text.to_string(),
                    });
                }
            }
            Some("SUMMARY_TEXT") => events.push(StreamEvent::ReasoningDelta {
                text: content_text(content)?.to_string(),
            }),
            Some("OUTPUT_IMAGE") => output_image(content, events)?,
            other => debug!(content_type = ?other, "skipping content item"),
        }
    }
    Ok(())
}

fn output_image(
    content: &Map<String, Value>,
    events: &mut Vec<StreamEvent>,
) -> Result<(), FrameError> {
    let Some(image_data) = child_object(content, "outputImageData")? else {
        return Ok(());
    };
    let Some(first) = child_array(image_data, "imageGens")?.and_then(|gens| gens.first()) else {
        return Ok(());
    };
    let generated = first.as_object().ok_or(FrameError::NotObject("imageGens[0]"))?;

    if let Some(url) = child_str(generated, "thumbnail")? {
        events.push(StreamEvent::ImageThumbnail {
            url: url.to_string(),
        });
    }
    if let Some(url) = child_str(generated, "preview")? {
        events.push(StreamEvent::Image {
            url: url.to_string(),
        });
    }
    Ok(())
}

fn content_text(content: &Map<String, Value>) -> Result<&str, FrameError> {
    match child_object(content, "textData")? {
        Some(text_data) => Ok(child_str(text_data, "text")?.unwrap_or_default()),
        None => Ok(""),
    }
}

// Discriminators that are not strings match no known tag.
fn tag<'a>(parent: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    parent.get(field).and_then(Value::as_str)
}

// Missing and null fields read as absent; any other shape mismatch is an error.

fn child_object<'a>(
    parent: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a Map<String, Value>>, FrameError> {
    match parent.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(FrameError::NotObject(field)),
    }
}

fn child_array<'a>(
    parent: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a Vec<Value>>, FrameError> {
    match parent.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(FrameError::NotArray(field)),
    }
}

fn child_str<'a>(
    parent: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, FrameError> {
    match parent.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(FrameError::NotString(field)),
    }
}

#[cfg(test)]
pub(crate) mod frames {
    use serde_json::{Value, json};

    pub fn ack() -> String {
        json!({"webSocket": {"type": "ACK"}}).to_string()
    }

    pub fn append(contents: Value) -> String {
        json!({
            "webSocket": {
                "type": "CONVERSATION",
                "payload": {"data": {"chatResponseStatus": "APPEND", "contents": contents}}
            }
        })
        .to_string()
    }

    pub fn event_append(contents: Value) -> String {
        json!({
            "webSocket": {
                "type": "CONVERSATION",
                "payload": {
                    "action": "EVENT",
                    "data": {"chatResponseStatus": "APPEND", "contents": contents}
                }
            }
        })
        .to_string()
    }

    pub fn text(text: &str) -> String {
        append(json!([{"contentType": "TEXT", "textData": {"text": text}}]))
    }

    pub fn summary(text: &str) -> String {
        append(json!([{"contentType": "SUMMARY_TEXT", "textData": {"text": text}}]))
    }

    pub fn image(thumbnail: &str, preview: &str) -> String {
        append(json!([{
            "contentType": "OUTPUT_IMAGE",
            "outputImageData": {"imageGens": [{"thumbnail": thumbnail, "preview": preview}]}
        }]))
    }

    pub fn done() -> String {
        json!({
            "webSocket": {"type": "CONVERSATION", "payload": {"data": {"chatResponseStatus": "DONE"}}}
        })
        .to_string()
    }
}
