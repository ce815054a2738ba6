use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://ai.rakuten.co.jp";
pub const DEFAULT_WS_BASE_URL: &str = "wss://companion.ai.rakuten.co.jp";
pub const DEFAULT_AGENT_ID: &str = "6812e64f9dfaf301f7000001";

/// Static locale block sent with every chat request and on REST headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleConfig {
    pub language: String,
    pub platform: String,
    pub timezone: String,
    pub country_code: String,
    pub city: String,
}

impl Default for LocaleConfig {
    fn default() -> Self {
        Self {
            language: "ja".to_string(),
            platform: "WEB".to_string(),
            timezone: "Asia/Tokyo".to_string(),
            country_code: "JP".to_string(),
            city: "Nerima".to_string(),
        }
    }
}

/// What the decoder does with a frame it cannot parse or classify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedFramePolicy {
    /// Emit `DecodeError` and end the stream.
    #[default]
    FailStop,
    /// Log the frame and keep reading.
    SkipAndLog,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub ws_base_url: String,
    pub secret_key: String,
    pub agent_id: String,
    pub locale: LocaleConfig,
    pub frame_timeout: Option<Duration>,
    pub malformed_frames: MalformedFramePolicy,
}

impl ClientConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            secret_key: secret_key.into(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
            locale: LocaleConfig::default(),
            frame_timeout: None,
            malformed_frames: MalformedFramePolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Self {
        self.base_url = normalize_base_url(base_url.as_ref());
        self
    }

    pub fn with_ws_base_url(mut self, ws_base_url: impl AsRef<str>) -> Self {
        self.ws_base_url = normalize_base_url(ws_base_url.as_ref());
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_locale(mut self, locale: LocaleConfig) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = Some(timeout);
        self
    }

    pub fn with_malformed_frames(mut self, policy: MalformedFramePolicy) -> Self {
        self.malformed_frames = policy;
        self
    }
}

// The secret never shows up in logs or panics.
impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("ws_base_url", &self.ws_base_url)
            .field("secret_key", &"<redacted>")
            .field("agent_id", &self.agent_id)
            .field("locale", &self.locale)
            .field("frame_timeout", &self.frame_timeout)
            .field("malformed_frames", &self.malformed_frames)
            .finish()
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
