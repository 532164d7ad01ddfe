//! Inference backend abstraction and the llama-server implementation.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::Message;

use super::ProgressFn;

/// A chat model backend, exclusively owned by the inference worker task.
///
/// Nothing outside the worker ever touches an implementation; all traffic
/// crosses the worker's message channel.
#[async_trait]
pub trait InferenceBackend: Send + 'static {
    /// Load the model, reporting coarse progress in `0.0..=1.0`. May take
    /// minutes; there is deliberately no built-in timeout.
    async fn load(&mut self, progress: &ProgressFn) -> Result<(), EngineError>;

    /// Generate a reply to `messages`, sending each output fragment over
    /// `deltas` in generation order. A closed receiver means the caller
    /// went away; implementations stop generating and return.
    async fn generate(
        &mut self,
        messages: &[Message],
        deltas: &mpsc::Sender<String>,
    ) -> Result<(), EngineError>;

    /// Release model resources. Best-effort.
    async fn unload(&mut self);
}

/// OpenAI-compatible chat completion request (llama-server flavor).
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: i32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Backend that talks to a locally-running llama-server instance over its
/// OpenAI-compatible API, streaming completions via server-sent events.
pub struct LlamaServerBackend {
    config: EngineConfig,
    client: reqwest::Client,
}

impl LlamaServerBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn health_ok(&self) -> bool {
        let url = format!("{}/health", self.config.endpoint);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl InferenceBackend for LlamaServerBackend {
    async fn load(&mut self, progress: &ProgressFn) -> Result<(), EngineError> {
        // The server does not report a model-load fraction, so progress is
        // approximated from poll attempts and snaps to 1.0 when healthy.
        progress(0.0);
        let mut attempts = 0u32;
        loop {
            if self.health_ok().await {
                progress(1.0);
                info!("llama-server ready at {}", self.config.endpoint);
                return Ok(());
            }
            attempts += 1;
            debug!("llama-server not ready yet (attempt {attempts})");
            progress((attempts as f32 * 0.05).min(0.95));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn generate(
        &mut self,
        messages: &[Message],
        deltas: &mpsc::Sender<String>,
    ) -> Result<(), EngineError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: true,
        };

        let url = format!("{}/v1/chat/completions", self.config.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Generation(format!("{status}: {text}")));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| EngineError::Generation(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are newline-delimited `data: <json>` lines.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload == "[DONE]" {
                    return Ok(());
                }
                let parsed: StreamChunk = serde_json::from_str(payload)
                    .map_err(|e| EngineError::Generation(e.to_string()))?;
                let Some(content) = parsed
                    .choices
                    .first()
                    .and_then(|c| c.delta.content.as_deref())
                else {
                    continue;
                };
                if !content.is_empty() && deltas.send(content.to_string()).await.is_err() {
                    // Receiver dropped: the caller is gone, stop generating.
                    debug!("delta receiver dropped, abandoning generation");
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    async fn unload(&mut self) {
        // The server owns the model; nothing to release on our side.
    }
}
