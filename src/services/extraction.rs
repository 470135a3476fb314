//! Text extraction from stored essay files.
//!
//! Plain text is decoded in-process. PDF and DOCX files go to an HTTP document-conversion
//! service: the file is submitted as multipart, then the returned check URL is polled until
//! markdown is available.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::core::config::Settings;

#[derive(Debug, Clone)]
pub(crate) struct EssayFile {
    pub(crate) file_name: String,
    pub(crate) content_type: String,
    pub(crate) bytes: Vec<u8>,
}

impl EssayFile {
    fn extension(&self) -> Option<String> {
        self.file_name.rsplit_once('.').map(|(_, extension)| extension.to_ascii_lowercase())
    }
}

#[derive(Debug, Error)]
pub(crate) enum ExtractionError {
    /// Transient: the same file may extract on a later attempt.
    #[error("extraction failed: {reason}")]
    Failed { reason: String },
    /// The file itself cannot yield text; retrying will not help.
    #[error("file has no readable text: {reason}")]
    Unreadable { reason: String },
}

impl ExtractionError {
    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed { reason: reason.into() }
    }

    fn unreadable(reason: impl Into<String>) -> Self {
        Self::Unreadable { reason: reason.into() }
    }
}

#[async_trait]
pub(crate) trait TextExtractor: Send + Sync {
    async fn extract(&self, file: &EssayFile) -> Result<String, ExtractionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, file: &EssayFile) -> Result<String, ExtractionError> {
        let text = std::str::from_utf8(&file.bytes)
            .map_err(|err| ExtractionError::unreadable(format!("not valid UTF-8: {err}")))?;
        Ok(text.trim_start_matches('\u{feff}').to_string())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DocumentConverter {
    client: Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    max_poll_attempts: u32,
    max_submit_retries: u32,
}

#[derive(Debug, Clone)]
struct ConversionJob {
    request_id: String,
    check_url: String,
}

impl DocumentConverter {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let converter = settings.converter();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(converter.timeout_seconds))
            .build()
            .context("Failed to build document converter HTTP client")?;

        Ok(Self {
            client,
            api_key: converter.api_key.clone(),
            base_url: converter.base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(converter.poll_interval_seconds),
            max_poll_attempts: converter.max_poll_attempts,
            max_submit_retries: converter.max_submit_retries,
        })
    }

    async fn submit(&self, file: &EssayFile) -> Result<ConversionJob, ExtractionError> {
        let endpoint = format!("{}/marker", self.base_url);
        let mut last_error = None;

        for attempt in 0..=self.max_submit_retries {
            let part = Part::bytes(file.bytes.clone())
                .file_name(file.file_name.clone())
                .mime_str(&file.content_type)
                .map_err(|err| ExtractionError::unreadable(format!("bad content type: {err}")))?;
            let form = Form::new().part("file", part).text("output_format", "markdown");

            let response =
                self.client.post(&endpoint).header("X-Api-Key", &self.api_key).multipart(form).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body: Value = resp.json().await.unwrap_or(Value::Null);

                    if status.is_client_error() && status.as_u16() != 429 {
                        return Err(ExtractionError::unreadable(format!(
                            "converter rejected file (status {status}): {}",
                            error_message(&body)
                        )));
                    }
                    if !status.is_success() {
                        last_error = Some(format!(
                            "converter submit failed (status {status}): {}",
                            error_message(&body)
                        ));
                    } else if let Some(job) = job_reference(&self.base_url, &body) {
                        return Ok(job);
                    } else {
                        last_error = Some("converter response missing request reference".to_string());
                    }
                }
                Err(err) => {
                    last_error = Some(format!("failed to call converter: {err}"));
                }
            }

            if attempt < self.max_submit_retries {
                tokio::time::sleep(Duration::from_secs(2_u64.pow(attempt))).await;
            }
        }

        Err(ExtractionError::failed(
            last_error.unwrap_or_else(|| "unknown converter submit error".to_string()),
        ))
    }

    async fn poll(&self, job: &ConversionJob) -> Result<String, ExtractionError> {
        for attempt in 0..self.max_poll_attempts {
            let response = self
                .client
                .get(&job.check_url)
                .header("X-Api-Key", &self.api_key)
                .send()
                .await
                .map_err(|err| ExtractionError::failed(format!("converter poll failed: {err}")))?;

            let status_code = response.status();
            let body: Value = response.json().await.map_err(|err| {
                ExtractionError::failed(format!("converter poll returned non-JSON body: {err}"))
            })?;

            if !status_code.is_success() {
                return Err(ExtractionError::failed(format!(
                    "converter poll failed (status {status_code}): {}",
                    error_message(&body)
                )));
            }

            let status = body
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();

            match status.as_str() {
                "complete" | "completed" => {
                    let container = body.get("result").unwrap_or(&body);
                    return container
                        .get("markdown")
                        .or_else(|| body.get("markdown"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| ExtractionError::failed("converter result has no markdown"));
                }
                "failed" | "error" => {
                    return Err(ExtractionError::unreadable(format!(
                        "conversion {} failed: {}",
                        job.request_id,
                        error_message(&body)
                    )));
                }
                _ => {}
            }

            if attempt + 1 < self.max_poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(ExtractionError::failed(format!(
            "conversion {} not ready after {} polls",
            job.request_id, self.max_poll_attempts
        )))
    }
}

#[async_trait]
impl TextExtractor for DocumentConverter {
    async fn extract(&self, file: &EssayFile) -> Result<String, ExtractionError> {
        let job = self.submit(file).await?;
        tracing::debug!(request_id = %job.request_id, file_name = %file.file_name, "Conversion submitted");
        self.poll(&job).await
    }
}

/// Dispatches by file extension: `txt` locally, `pdf`/`docx` to the converter.
pub(crate) struct RoutingExtractor {
    plain: PlainTextExtractor,
    documents: Box<dyn TextExtractor>,
}

impl RoutingExtractor {
    pub(crate) fn new(documents: Box<dyn TextExtractor>) -> Self {
        Self { plain: PlainTextExtractor, documents }
    }

    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self::new(Box::new(DocumentConverter::from_settings(settings)?)))
    }
}

#[async_trait]
impl TextExtractor for RoutingExtractor {
    async fn extract(&self, file: &EssayFile) -> Result<String, ExtractionError> {
        match file.extension().as_deref() {
            Some("txt") => self.plain.extract(file).await,
            Some("pdf" | "docx") => self.documents.extract(file).await,
            other => Err(ExtractionError::unreadable(format!(
                "no extractor for extension {}",
                other.unwrap_or("<none>")
            ))),
        }
    }
}

fn job_reference(base_url: &str, payload: &Value) -> Option<ConversionJob> {
    let check_url = payload.get("request_check_url").and_then(Value::as_str).and_then(|raw| {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Some(raw.to_string());
        }
        reqwest::Url::parse(&format!("{base_url}/"))
            .ok()
            .and_then(|base| base.join(raw).ok())
            .map(|url| url.to_string())
    });

    let request_id = payload
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            check_url
                .as_deref()
                .and_then(|url| url.trim_end_matches('/').rsplit('/').next())
                .map(str::to_string)
        })?;

    let check_url = check_url.unwrap_or_else(|| format!("{base_url}/marker/{request_id}"));
    Some(ConversionJob { request_id, check_url })
}

fn error_message(payload: &Value) -> String {
    if let Some(detail) = payload.get("detail") {
        if let Some(text) = detail.as_str() {
            return text.to_string();
        }
        if let Some(items) = detail.as_array() {
            let joined = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ");
            if !joined.is_empty() {
                return joined;
            }
        }
    }

    payload
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| payload.get("error").and_then(Value::as_str))
        .unwrap_or("unknown_error")
        .to_string()
}
