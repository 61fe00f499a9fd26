//! Assistant backend client
//!
//! Typed access to the four endpoints the client consumes: the greeting, the
//! transcription step, the voice answer and the text chat. Every call carries
//! the process session id so the backend can keep per-session memory.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::session::SessionId;
use crate::{Error, Result};

/// Greeting returned when a conversation opens
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Greeting {
    /// Greeting text, if the backend includes it
    #[serde(default)]
    pub text: Option<String>,
    /// Spoken greeting as a URL (usually a `data:` URL)
    #[serde(default)]
    pub audio: Option<String>,
}

/// Outcome of a successful transcription call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transcription {
    /// The backend understood something
    Heard(String),
    /// The backend answered but could not make out speech
    NotHeard(String),
}

/// Raw `/transcribe` body: `{ transcript }` or `{ error }`
#[derive(Deserialize)]
#[serde(untagged)]
enum TranscribeBody {
    Transcript { transcript: String },
    Failed { error: String },
}

/// Answer returned by `/chat-voice`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VoiceAnswer {
    /// Full answer text for the transcript
    #[serde(rename = "chat_answer")]
    pub answer: String,
    /// Spoken summary as a URL
    #[serde(default)]
    pub audio: Option<String>,
}

#[derive(Deserialize)]
struct ChatBody {
    answer: String,
}

/// The assistant backend as seen by the conversation loop
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the opening greeting
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    async fn greeting(&self, session: &SessionId) -> Result<Greeting>;

    /// Transcribe a WAV recording
    ///
    /// # Errors
    ///
    /// Returns error if the request fails; an unintelligible recording is
    /// `Ok(Transcription::NotHeard)`
    async fn transcribe(&self, audio: Vec<u8>, session: &SessionId) -> Result<Transcription>;

    /// Answer a spoken question
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    async fn chat_voice(&self, text: &str, session: &SessionId) -> Result<VoiceAnswer>;

    /// Answer a typed question
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    async fn chat(&self, question: &str, session: &SessionId) -> Result<String>;
}

/// HTTP implementation of [`Backend`]
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a client for the configured backend
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Turn a non-success status into a backend error
    async fn check(response: reqwest::Response, endpoint: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::error!(endpoint, status = %status, body = %body, "backend error");
        Err(Error::Backend(format!("{endpoint} returned {status}: {body}")))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn greeting(&self, session: &SessionId) -> Result<Greeting> {
        let response = self
            .client
            .get(self.url("/greeting"))
            .query(&[("session_id", session.as_str())])
            .send()
            .await?;

        let greeting: Greeting = Self::check(response, "/greeting").await?.json().await?;
        tracing::debug!(has_audio = greeting.audio.is_some(), "greeting received");
        Ok(greeting)
    }

    async fn transcribe(&self, audio: Vec<u8>, session: &SessionId) -> Result<Transcription> {
        tracing::debug!(audio_bytes = audio.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("input.wav")
                    .mime_str("audio/wav")?,
            )
            .text("session_id", session.as_str().to_string());

        let response = self
            .client
            .post(self.url("/transcribe"))
            .multipart(form)
            .send()
            .await?;

        let body: TranscribeBody = Self::check(response, "/transcribe").await?.json().await?;
        let transcription = match body {
            TranscribeBody::Transcript { transcript } if !transcript.trim().is_empty() => {
                Transcription::Heard(transcript.trim().to_string())
            }
            TranscribeBody::Transcript { .. } => {
                Transcription::NotHeard("empty transcript".to_string())
            }
            TranscribeBody::Failed { error } => Transcription::NotHeard(error),
        };

        tracing::info!(?transcription, "transcription complete");
        Ok(transcription)
    }

    async fn chat_voice(&self, text: &str, session: &SessionId) -> Result<VoiceAnswer> {
        #[derive(Serialize)]
        struct VoiceRequest<'a> {
            text: &'a str,
            session_id: &'a SessionId,
        }

        let response = self
            .client
            .post(self.url("/chat-voice"))
            .json(&VoiceRequest {
                text,
                session_id: session,
            })
            .send()
            .await?;

        let answer: VoiceAnswer = Self::check(response, "/chat-voice").await?.json().await?;
        tracing::debug!(
            answer_len = answer.answer.len(),
            has_audio = answer.audio.is_some(),
            "voice answer received"
        );
        Ok(answer)
    }

    async fn chat(&self, question: &str, session: &SessionId) -> Result<String> {
        #[derive(Serialize)]
        struct ChatRequest<'a> {
            question: &'a str,
            session_id: &'a SessionId,
        }

        let response = self
            .client
            .post(self.url("/chat"))
            .json(&ChatRequest {
                question,
                session_id: session,
            })
            .send()
            .await?;

        let body: ChatBody = Self::check(response, "/chat").await?.json().await?;
        Ok(body.answer)
    }
}
