use std::future::Future;
use std::io;
use std::path::Path;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Config;

pub const MAX_ATTACHMENT_BYTES: u64 = 100 * 1024 * 1024;

const LANDING_SEGMENT: &str = "tmpfiles.org/";
const DOWNLOAD_SEGMENT: &str = "tmpfiles.org/dl/";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected upload status: {0}")]
    Status(u16),
    #[error("upload response did not contain a url")]
    MissingUrl,
    #[error("attachment {name} is {size} bytes (limit 100MB)")]
    TooLarge { name: String, size: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub async fn from_path(path: &Path) -> Result<Self, UploadError> {
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "attachment file name is invalid"))?
            .to_string();
        let size = tokio::fs::metadata(path).await?.len();
        ensure_size(&file_name, size)?;

        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_string());
        let bytes = tokio::fs::read(path).await?;
        Ok(Self {
            file_name,
            mime_type,
            bytes,
        })
    }

    /// Wraps a captured audio recording the way the recorder hands it over.
    pub fn voice(bytes: Vec<u8>) -> Self {
        Self {
            file_name: "voice.webm".to_string(),
            mime_type: Some("audio/webm".to_string()),
            bytes,
        }
    }
}

/// Turns bytes into a durable URL. Never touches conversation state.
pub trait Uploader: Send + Sync {
    fn upload(&self, file: UploadFile) -> impl Future<Output = Result<String, UploadError>> + Send;
}

#[derive(Clone)]
pub struct AttachmentUploader {
    endpoint: String,
    http: Client,
}

impl AttachmentUploader {
    pub fn new(config: &Config) -> Result<Self, UploadError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            endpoint: config.upload_url.clone(),
            http,
        })
    }
}

impl Uploader for AttachmentUploader {
    async fn upload(&self, file: UploadFile) -> Result<String, UploadError> {
        ensure_size(&file.file_name, file.bytes.len() as u64)?;

        let mut part = reqwest::multipart::Part::bytes(file.bytes).file_name(file.file_name.clone());
        if let Some(mime) = file.mime_type.as_deref() {
            part = part.mime_str(mime)?;
        }
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self.http.post(&self.endpoint).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }
        let payload: UploadResponse = response.json().await?;
        let raw = payload
            .data
            .and_then(|data| data.url)
            .filter(|url| !url.trim().is_empty())
            .ok_or(UploadError::MissingUrl)?;
        let url = download_url(&raw);
        tracing::debug!(file = %file.file_name, %url, "attachment uploaded");
        Ok(url)
    }
}

/// Rewrites a hosting landing-page URL into its direct-download form.
pub fn download_url(raw: &str) -> String {
    raw.replacen(LANDING_SEGMENT, DOWNLOAD_SEGMENT, 1)
}

fn ensure_size(name: &str, size: u64) -> Result<(), UploadError> {
    if size > MAX_ATTACHMENT_BYTES {
        return Err(UploadError::TooLarge {
            name: name.to_string(),
            size,
        });
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    data: Option<UploadData>,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    url: Option<String>,
}
