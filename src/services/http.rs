//! HTTP clients for the assistant backend's speech endpoints.
//!
//! The backend exposes `/transcribe` (accepts the encoded utterance,
//! returns `{"text": "..."}`) and `/synthesize` (accepts
//! `{"text", "voice"}`, returns an `audio/mpeg` payload).

use crate::config::ServiceConfig;
use crate::error::{Result, VoiceError};
use crate::recording::EncodedUtterance;
use crate::services::{SpeechSynthesizer, SpeechTranscriber};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
}

/// Speech service client backed by reqwest. Implements both the
/// transcription and synthesis capabilities against one backend.
#[derive(Clone)]
pub struct HttpSpeechService {
    client: reqwest::Client,
    config: ServiceConfig,
}

impl HttpSpeechService {
    /// Build a client from service configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| VoiceError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SpeechTranscriber for HttpSpeechService {
    async fn transcribe(&self, utterance: &EncodedUtterance) -> Result<String> {
        let request_id = Uuid::new_v4();
        debug!(
            "transcribing {} bytes ({}) [request {request_id}]",
            utterance.bytes.len(),
            utterance.format.mime()
        );

        let mut request = self
            .client
            .post(self.endpoint("/transcribe"))
            .header("content-type", utterance.format.mime())
            .header("x-request-id", request_id.to_string())
            .body(utterance.bytes.clone());
        if let Some(ref language) = self.config.language {
            request = request.query(&[("language", language.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "HTTP {status}: {}",
                detail.trim()
            )));
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(format!("malformed response: {e}")))?;
        info!("transcription received ({} chars)", parsed.text.len());
        Ok(parsed.text)
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechService {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let request_id = Uuid::new_v4();
        debug!("synthesizing {} chars [request {request_id}]", text.len());

        let response = self
            .client
            .post(self.endpoint("/synthesize"))
            .header("x-request-id", request_id.to_string())
            .json(&serde_json::json!({
                "text": text,
                "voice": self.config.voice,
            }))
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "HTTP {status}: {}",
                detail.trim()
            )));
        }

        let payload = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(format!("body read failed: {e}")))?;
        info!("synthesis payload received ({} bytes)", payload.len());
        Ok(payload)
    }
}
