//! Cloud speech-to-text used to confirm wake phrase candidates

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::SttProvider;
use crate::{Error, Result};

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEEPGRAM_URL: &str = "https://api.deepgram.com/v1/listen";

#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Turns a short WAV clip into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// Whisper or Deepgram transcription client
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: SttProvider,
    endpoint: String,
}

impl SpeechToText {
    /// Create a client for `provider`
    ///
    /// # Errors
    ///
    /// Returns `Error::WakeWord` if the API key is missing or empty
    pub fn new(provider: SttProvider, api_key: Option<&str>, model: &str) -> Result<Self> {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                Error::WakeWord(format!(
                    "access key required for {provider:?} verification (set {})",
                    provider.key_env()
                ))
            })?;

        let endpoint = match provider {
            SttProvider::Whisper => WHISPER_URL,
            SttProvider::Deepgram => DEEPGRAM_URL,
        };

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key.to_string()),
            model: model.to_string(),
            provider,
            endpoint: endpoint.to_string(),
        })
    }

    /// Point the client at another endpoint, e.g. a local mock
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Map a provider rejection to `Error::Stt`
    async fn ensure_ok(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            provider = ?self.provider,
            status = %status,
            "verification request rejected"
        );
        Err(Error::Stt(format!("{:?} returned {status}: {body}", self.provider)))
    }

    async fn transcribe_whisper(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper verification");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let result: WhisperResponse = self.ensure_ok(response).await?.json().await?;
        Ok(result.text)
    }

    async fn transcribe_deepgram(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram verification");

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("model", self.model.as_str()), ("punctuate", "true")])
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await?;

        let result: DeepgramResponse = self.ensure_ok(response).await?.json().await?;
        Ok(result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        let text = match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav).await?,
            SttProvider::Deepgram => self.transcribe_deepgram(wav).await?,
        };
        tracing::trace!(transcript = %text, "verification transcript");
        Ok(text)
    }
}
