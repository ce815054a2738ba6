use std::fmt;

use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::UploadedFile;
use crate::protocol::{
    AnonymousToken, ApiEnvelope, CreateThreadRequest, FileUploaded, ThreadCreated,
    UploadDescriptor, UploadKind,
};
use crate::signer::Signer;
use crate::transport::WsTransport;

pub const AUTH_PATH: &str = "/api/v2/auth/anonymous";
pub const THREAD_PATH: &str = "/api/v1/thread";
pub const UPLOAD_PATH: &str = "/api/v1/files/upload";
pub const CHAT_WS_PATH: &str = "/ws/v1/chat";

/// Locally generated anonymous device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// `<uuid-v4>-<6 hex chars>`.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", Uuid::new_v4(), &suffix[..6]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bearer token bound to a [`DeviceId`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Signed REST client for the anonymous chat API.
pub struct ApiClient {
    config: ClientConfig,
    signer: Signer,
    http: HttpClient,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let signer = Signer::new(&config.secret_key)?;
        Ok(Self {
            config,
            signer,
            http: HttpClient::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn create_identity(&self) -> DeviceId {
        DeviceId::generate()
    }

    pub async fn authenticate(&self, identity: &DeviceId) -> Result<Credential> {
        let request = self
            .request(Method::GET, AUTH_PATH, identity)
            .header("Content-Type", "application/json");

        let envelope = read_envelope(request).await?;
        let token: AnonymousToken = into_data(envelope, "Authentication Failed", |message| {
            Error::Authentication { message }
        })?;

        info!(device_id = %identity, "authenticated anonymous device");
        Ok(Credential::new(token.access_token))
    }

    pub async fn create_thread(
        &self,
        identity: &DeviceId,
        credential: &Credential,
        agent_id: &str,
        title: &str,
    ) -> Result<String> {
        let body = CreateThreadRequest {
            scenario_agent_id: agent_id,
            title,
        };
        let request = self
            .request(Method::POST, THREAD_PATH, identity)
            .bearer_auth(credential.as_str())
            .json(&body);

        let envelope = read_envelope(request).await?;
        let thread: ThreadCreated = into_data(envelope, "Failed to create thread", |message| {
            Error::ThreadCreation { message }
        })?;

        info!(thread_id = %thread.id, agent_id, "created thread");
        Ok(thread.id)
    }

    /// Opens the signed chat WebSocket for `thread_id`.
    pub async fn open_session(
        &self,
        thread_id: &str,
        identity: &DeviceId,
        credential: &Credential,
    ) -> Result<WsTransport> {
        let url = self.signer.signed_ws_url(
            &self.config.ws_base_url,
            CHAT_WS_PATH,
            &[("deviceId", identity.as_str())],
            &[
                ("accessToken", credential.as_str()),
                ("platform", self.config.locale.platform.as_str()),
            ],
        )?;

        let transport = WsTransport::connect(&url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        debug!(thread_id, "chat session opened");
        Ok(transport)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upload_file(
        &self,
        identity: &DeviceId,
        credential: &Credential,
        thread_id: &str,
        file: Vec<u8>,
        filename: &str,
        mime_type: &str,
        is_image: bool,
    ) -> Result<UploadedFile> {
        let descriptor = UploadDescriptor {
            kind: if is_image {
                UploadKind::VisionData
            } else {
                UploadKind::UserData
            },
            agent_id: &self.config.agent_id,
            thread_id,
        };
        let descriptor = serde_json::to_string(&descriptor)?;

        let size = file.len();
        let form = Form::new()
            .part(
                "file",
                Part::bytes(file)
                    .file_name(filename.to_string())
                    .mime_str(mime_type)?,
            )
            .part(
                "request",
                Part::text(descriptor)
                    .file_name("blob")
                    .mime_str("application/json")?,
            );

        let request = self
            .request(Method::POST, UPLOAD_PATH, identity)
            .bearer_auth(credential.as_str())
            .multipart(form);

        let envelope = read_envelope(request).await?;
        let uploaded: FileUploaded = into_data(envelope, "Failed to upload file", |message| {
            Error::Upload { message }
        })?;

        info!(thread_id, file_id = %uploaded.file_id, size, is_image, "uploaded file");
        Ok(UploadedFile {
            file_id: uploaded.file_id,
            file_url: uploaded.file_url,
            file_name: uploaded.original_filename,
            is_image,
        })
    }

    fn request(&self, method: Method, path: &str, identity: &DeviceId) -> RequestBuilder {
        let signature = self.signer.sign_request(method.as_str(), path, &[]);
        debug!(%method, path, "signed request");

        let request = self
            .http
            .request(method, format!("{}{}", self.config.base_url, path))
            .header("X-Platform", &self.config.locale.platform)
            .header("X-Country-Code", &self.config.locale.country_code)
            .header("Device-ID", identity.as_str());
        signature.apply(request)
    }
}

async fn read_envelope(request: RequestBuilder) -> Result<ApiEnvelope> {
    let response = request.send().await?.error_for_status()?;
    Ok(response.json().await?)
}

fn into_data<T, F>(envelope: ApiEnvelope, fallback: &str, reject: F) -> Result<T>
where
    T: DeserializeOwned,
    F: FnOnce(String) -> Error,
{
    if !envelope.is_success() {
        return Err(reject(envelope.message_or(fallback)));
    }

    let data = envelope
        .data
        .ok_or_else(|| Error::UnexpectedResponse("success envelope without data".to_string()))?;
    serde_json::from_value(data).map_err(|e| Error::UnexpectedResponse(e.to_string()))
}
