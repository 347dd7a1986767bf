//! HTTP client for the transactional-mail API and the `MailTransport` seam the
//! batch executor sends through.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::model::value_to_text;

pub mod model;

pub use model::Message;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const SEND_PATH: &str = "api/v1/send/message";
const USER_AGENT: &str = concat!("mailgoat-rs/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("MailGoat API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        payload: Option<Value>,
    },
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("failed to read attachment {}: {source}", path.display())]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClientError {
    fn api(status: u16, message: impl Into<String>, payload: Option<Value>) -> Self {
        ClientError::Api {
            status,
            message: message.into(),
            payload,
        }
    }
}

/// Sends one message and returns the remote message id.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        from_address: Option<&str>,
    ) -> Result<String, ClientError>;
}

/// A file attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: &'static str,
    pub data: Vec<u8>,
}

impl Attachment {
    pub async fn from_path(path: &Path) -> Result<Self, ClientError> {
        let data = fs::read(path)
            .await
            .map_err(|source| ClientError::Attachment {
                path: path.to_path_buf(),
                source,
            })?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment")
            .to_string();
        Ok(Self {
            name,
            content_type: content_type_for(path),
            data,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub from_address: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Clone)]
pub struct MailGoatClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for MailGoatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailGoatClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl MailGoatClient {
    pub fn new(server: &str, api_key: &str) -> Result<Self, ClientError> {
        Self::with_timeout(server, api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(server: &str, api_key: &str, timeout: Duration) -> Result<Self, ClientError> {
        // Joining relative paths needs exactly one trailing slash.
        let normalized = format!("{}/", server.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|err| ClientError::InvalidUrl {
            url: server.to_string(),
            reason: err.to_string(),
        })?;
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|err| ClientError::InvalidUrl {
                url: format!("{}{}", self.base_url, path),
                reason: err.to_string(),
            })
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request, ClientError> {
        let mut builder = self
            .http
            .request(method, self.endpoint(path)?)
            .header("X-Server-API-Key", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().map_err(ClientError::Build)
    }

    async fn execute(
        &self,
        request: reqwest::Request,
    ) -> Result<(u16, Map<String, Value>), ClientError> {
        debug!(method = %request.method(), url = %request.url(), "mail API request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(ClientError::Network)?;
        let status = res.status().as_u16();
        let text = res.text().await.map_err(ClientError::Network)?;
        debug!(status, "mail API response");
        Ok((status, parse_response(status, &text)?))
    }

    pub async fn send_message(&self, request: &SendRequest) -> Result<String, ClientError> {
        let body = build_send_body(request);
        let http_request = self.build_request(Method::POST, SEND_PATH, Some(&body))?;
        let (status, data) = self.execute(http_request).await?;
        extract_message_id(&data).ok_or_else(|| {
            ClientError::api(
                status,
                "missing message_id in API response",
                Some(Value::Object(data)),
            )
        })
    }

    pub async fn read(&self, message_id: &str) -> Result<Message, ClientError> {
        let path = format!("api/v1/messages/{}", message_id);
        let request = self.build_request(Method::GET, &path, None)?;
        let (_, data) = self.execute(request).await?;
        // Newer servers wrap the message in a `data` envelope.
        let payload = match data.get("data") {
            Some(inner @ Value::Object(_)) => inner.clone(),
            _ => Value::Object(data),
        };
        Ok(Message::from_api(&payload))
    }
}

#[async_trait]
impl MailTransport for MailGoatClient {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        from_address: Option<&str>,
    ) -> Result<String, ClientError> {
        let request = SendRequest {
            to: vec![to.to_string()],
            subject: subject.to_string(),
            body: body.to_string(),
            from_address: from_address.map(str::to_string),
            attachments: Vec::new(),
        };
        self.send_message(&request).await
    }
}

pub fn build_send_body(request: &SendRequest) -> Value {
    let mut body = Map::new();
    body.insert("to".into(), json!(request.to));
    body.insert("subject".into(), json!(request.subject));
    body.insert("plain_body".into(), json!(request.body));
    if let Some(from) = request.from_address.as_deref().filter(|f| !f.is_empty()) {
        body.insert("from".into(), json!(from));
    }
    if !request.attachments.is_empty() {
        let encoded: Vec<Value> = request
            .attachments
            .iter()
            .map(|a| {
                json!({
                    "name": a.name,
                    "content_type": a.content_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(&a.data),
                })
            })
            .collect();
        body.insert("attachments".into(), Value::Array(encoded));
    }
    Value::Object(body)
}

/// Turn a raw response into its JSON object, mapping HTTP failures and
/// `{"status": "error"}` envelopes to `ClientError::Api`.
pub fn parse_response(status: u16, text: &str) -> Result<Map<String, Value>, ClientError> {
    let parsed: Option<Value> = serde_json::from_str(text).ok();

    if status >= 400 {
        let message = match parsed.as_ref() {
            Some(Value::Object(map)) => error_message(map),
            _ if !text.trim().is_empty() => Some(text.trim().to_string()),
            _ => None,
        }
        .unwrap_or_else(|| "unknown API error".to_string());
        warn!(status, %message, "mail API returned an error");
        return Err(ClientError::api(status, message, parsed));
    }

    let Some(Value::Object(map)) = parsed else {
        return Err(ClientError::api(
            status,
            "invalid JSON response from API",
            parsed,
        ));
    };

    if map.get("status").and_then(Value::as_str) == Some("error") {
        let message = error_message(&map).unwrap_or_else(|| "unknown API error".to_string());
        return Err(ClientError::api(status, message, Some(Value::Object(map))));
    }

    Ok(map)
}

fn error_message(map: &Map<String, Value>) -> Option<String> {
    map.get("error")
        .or_else(|| map.get("message"))
        .or_else(|| map.get("data").and_then(|d| d.get("message")))
        .and_then(value_to_text)
}

/// Locate the message id across the envelope shapes the API has used.
pub fn extract_message_id(data: &Map<String, Value>) -> Option<String> {
    let envelope = data.get("data");
    let candidates = [
        envelope
            .and_then(|d| d.get("message"))
            .and_then(|m| m.get("id")),
        envelope.and_then(|d| d.get("message_id")),
        data.get("message_id"),
        data.get("id"),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(value_to_text)
        .find(|id| !id.is_empty())
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
