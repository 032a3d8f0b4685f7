//! WhatsApp Business Cloud API sender.
//!
//! Sends text messages, or an image/document with the message as caption, via
//! the Graph API. Requires an access token and the sending phone number ID from
//! Meta Business Suite.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::{CLOUD_API_BASE, CLOUD_API_CONNECT_TIMEOUT, CLOUD_API_VERSION};
use crate::dispatch::{SendError, Sender};

/// Cloud API channel configuration
#[derive(Debug, Clone)]
pub struct CloudApiConfig {
    pub access_token: String,
    pub phone_number_id: String,
    pub api_base: String,
    pub api_version: String,
}

impl CloudApiConfig {
    pub fn new(access_token: String, phone_number_id: String) -> Self {
        Self {
            access_token,
            phone_number_id,
            api_base: CLOUD_API_BASE.to_string(),
            api_version: CLOUD_API_VERSION.to_string(),
        }
    }
}

/// How an attachment is presented to the recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Document,
}

impl MediaKind {
    fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Document => "document",
        }
    }
}

/// Guess media kind and MIME type from the file extension
fn classify_attachment(path: &Path) -> (MediaKind, &'static str) {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => (MediaKind::Image, "image/jpeg"),
        "png" => (MediaKind::Image, "image/png"),
        "pdf" => (MediaKind::Document, "application/pdf"),
        "txt" => (MediaKind::Document, "text/plain"),
        _ => (MediaKind::Document, "application/octet-stream"),
    }
}

#[derive(Debug, Clone)]
struct UploadedMedia {
    path: PathBuf,
    id: String,
    kind: MediaKind,
}

/// Cloud API sender implementation
pub struct CloudApiSender {
    config: CloudApiConfig,
    base: Url,
    client: reqwest::Client,
    // The same attachment goes to every recipient; upload it once per run
    media: Mutex<Option<UploadedMedia>>,
}

impl CloudApiSender {
    pub fn new(config: CloudApiConfig) -> Result<Self> {
        if config.access_token.is_empty() {
            bail!("Cloud API access token not configured (set WHATSAPP_ACCESS_TOKEN)");
        }
        if config.phone_number_id.is_empty() {
            bail!("Cloud API phone number ID not configured (set WHATSAPP_PHONE_NUMBER_ID)");
        }

        let base = Url::parse(&config.api_base)
            .with_context(|| format!("Invalid Cloud API base URL: {}", config.api_base))?;
        if base.cannot_be_a_base() {
            bail!("Cloud API base URL cannot carry a path: {}", config.api_base);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CLOUD_API_CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        info!(
            "Cloud API sender ready (phone_id={}, base={})",
            config.phone_number_id, base
        );

        Ok(Self {
            config,
            base,
            client,
            media: Mutex::new(None),
        })
    }

    /// `{base}/{version}/{phone_number_id}/{resource}`
    fn endpoint(&self, resource: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                self.config.api_version.as_str(),
                self.config.phone_number_id.as_str(),
                resource,
            ]);
        }
        url
    }

    async fn media_for(&self, path: &Path) -> Result<UploadedMedia, SendError> {
        let mut cached = self.media.lock().await;
        if let Some(media) = cached.as_ref()
            && media.path == path
        {
            return Ok(media.clone());
        }

        let media = self.upload_media(path).await?;
        *cached = Some(media.clone());
        Ok(media)
    }

    async fn upload_media(&self, path: &Path) -> Result<UploadedMedia, SendError> {
        let (kind, mime) = classify_attachment(path);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SendError::Attachment(format!("{}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment")
            .to_string();

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| SendError::Attachment(e.to_string()))?;
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", mime)
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint("media"))
            .bearer_auth(&self.config.access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SendError::Transport(format!("media upload failed: {e}")))?;

        let body = Self::check_response(response).await?;
        let id = body["id"]
            .as_str()
            .ok_or_else(|| SendError::Attachment("media upload returned no id".to_string()))?
            .to_string();

        debug!("Uploaded {} as media {}", path.display(), id);
        Ok(UploadedMedia {
            path: path.to_path_buf(),
            id,
            kind,
        })
    }

    async fn check_response(response: reqwest::Response) -> Result<Value, SendError> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected(format!("HTTP {}: {}", status, error_text)));
        }

        response
            .json()
            .await
            .map_err(|e| SendError::Transport(format!("invalid response body: {e}")))
    }
}

/// Build the `/messages` request body
fn message_body(to: &str, message: &str, media: Option<(MediaKind, &str)>) -> Value {
    match media {
        None => json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": message
            }
        }),
        Some((kind, media_id)) => {
            let mut body = json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": kind.as_str(),
            });
            body[kind.as_str()] = json!({
                "id": media_id,
                "caption": message
            });
            body
        }
    }
}

#[async_trait]
impl Sender for CloudApiSender {
    fn name(&self) -> &str {
        "whatsapp-cloud-api"
    }

    async fn send(
        &self,
        identity: &str,
        message: &str,
        attachment: Option<&Path>,
    ) -> Result<(), SendError> {
        let media = match attachment {
            Some(path) => Some(self.media_for(path).await?),
            None => None,
        };
        let body = message_body(
            identity,
            message,
            media.as_ref().map(|m| (m.kind, m.id.as_str())),
        );

        let response = self
            .client
            .post(self.endpoint("messages"))
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let result = Self::check_response(response).await?;
        let msg_id = result["messages"][0]["id"].as_str().unwrap_or("unknown");

        debug!("Cloud API accepted message {} for {}", msg_id, identity);
        Ok(())
    }
}
