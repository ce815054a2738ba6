use thiserror::Error;

/// Errors raised by the REST layer and by session setup.
///
/// Streaming failures are not represented here: once a message has been
/// sent, termination and decode failures arrive as [`StreamEvent`] values.
///
/// [`StreamEvent`]: crate::protocol::StreamEvent
#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("thread creation failed: {message}")]
    ThreadCreation { message: String },

    #[error("upload failed: {message}")]
    Upload { message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_errors_carry_server_message() {
        let err = Error::Authentication {
            message: "device banned".to_string(),
        };
        assert_eq!(err.to_string(), "authentication failed: device banned");

        let err = Error::ThreadCreation {
            message: "agent not found".to_string(),
        };
        assert_eq!(err.to_string(), "thread creation failed: agent not found");
    }
}
