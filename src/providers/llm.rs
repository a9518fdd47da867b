//! Streaming response generation via OpenAI-compatible chat completions
//!
//! Providers are tried in configured order; the first one to yield a content
//! delta wins the turn. A provider that dies before producing anything falls
//! through to the next entry, a provider that dies mid-stream surfaces the
//! error to the consumer (the turn ends with whatever already streamed).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ResponseGenerator, TextStream};
use crate::config::{LlmConfig, LlmProvider};
use crate::session::Turn;
use crate::{Error, Result};

/// Chat completion request body
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
}

/// One chat message on the wire
#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

/// One SSE chunk of a streamed completion
#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parsed SSE data line
enum SseLine {
    Delta(String),
    Done,
}

/// Generates responses through a chain of OpenAI-compatible providers
#[derive(Clone)]
pub struct ChatGenerator {
    client: reqwest::Client,
    providers: Vec<LlmProvider>,
    max_tokens: u32,
    temperature: f32,
    system_prompt: String,
}

impl ChatGenerator {
    /// Create a generator from config
    ///
    /// # Errors
    ///
    /// Returns error if the provider chain is empty
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.providers.is_empty() {
            return Err(Error::Config(
                "at least one LLM provider is required".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            providers: config.providers.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
        })
    }

    /// System prompt + history + new user message
    fn build_messages(&self, history: &[Turn], user_text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage {
            role: "system",
            content: self.system_prompt.clone(),
        });
        for turn in history {
            messages.push(ChatMessage {
                role: turn.role.as_str(),
                content: turn.text.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_text.to_string(),
        });
        messages
    }

    /// Open one provider's completion stream
    async fn open_stream(&self, provider: &LlmProvider, messages: &[ChatMessage]) -> Result<DeltaReader> {
        let request = ChatRequest {
            model: provider.model.clone(),
            messages: messages.to_vec(),
            stream: true,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let url = format!(
            "{}/chat/completions",
            provider.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", provider.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("chat API error {status}: {body}")));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .map_err(Error::from)
            })
            .boxed();

        Ok(DeltaReader::new(body))
    }
}

#[async_trait]
impl ResponseGenerator for ChatGenerator {
    async fn generate(&self, history: &[Turn], user_text: &str) -> Result<TextStream> {
        let messages = self.build_messages(history, user_text);
        let (tx, rx) = mpsc::channel::<Result<String>>(32);

        let generator = self.clone();

        tokio::spawn(async move {
            generator.stream_with_fallback(&messages, tx).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

impl ChatGenerator {
    /// Try each provider until one starts streaming, forwarding its deltas
    async fn stream_with_fallback(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::Sender<Result<String>>,
    ) {
        let mut last_error: Option<Error> = None;

        for (i, provider) in self.providers.iter().enumerate() {
            tracing::debug!(
                provider = %provider.name,
                model = %provider.model,
                "trying LLM provider"
            );

            let mut reader = match self.open_stream(provider, messages).await {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::warn!(
                        provider = %provider.name,
                        error = %e,
                        remaining = self.providers.len() - i - 1,
                        "LLM provider failed to open stream"
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            // Confirm the provider with a first delta before committing to it
            let first = loop {
                match reader.next_delta().await {
                    Some(Ok(delta)) => break Some(delta),
                    Some(Err(e)) => {
                        last_error = Some(e);
                        break None;
                    }
                    None => {
                        last_error = Some(Error::Llm("empty response stream".to_string()));
                        break None;
                    }
                }
            };

            let Some(first) = first else {
                tracing::warn!(
                    provider = %provider.name,
                    remaining = self.providers.len() - i - 1,
                    "LLM provider produced no content"
                );
                continue;
            };

            tracing::debug!(provider = %provider.name, "LLM provider responding");
            if tx.send(Ok(first)).await.is_err() {
                return;
            }

            // Committed: forward the rest, surfacing mid-stream errors
            while let Some(item) = reader.next_delta().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    return;
                }
            }
            return;
        }

        let message = last_error
            .map_or_else(|| "no LLM providers configured".to_string(), |e| e.to_string());
        tracing::error!(error = %message, "all LLM providers failed");
        let _ = tx.send(Err(Error::Llm(message))).await;
    }
}

/// Incremental SSE reader producing content deltas
struct DeltaReader {
    body: BoxStream<'static, Result<String>>,
    buffer: String,
    done: bool,
}

impl DeltaReader {
    fn new(body: BoxStream<'static, Result<String>>) -> Self {
        Self {
            body,
            buffer: String::new(),
            done: false,
        }
    }

    /// Next non-empty content delta, or `None` at end of stream
    async fn next_delta(&mut self) -> Option<Result<String>> {
        loop {
            while let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                match parse_sse_line(line.trim()) {
                    Some(SseLine::Delta(delta)) => return Some(Ok(delta)),
                    Some(SseLine::Done) => {
                        self.done = true;
                        return None;
                    }
                    None => {}
                }
            }

            if self.done {
                return None;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.push_str(&chunk),
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}

/// Parse one SSE line into a content delta
fn parse_sse_line(line: &str) -> Option<SseLine> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseLine::Done);
    }

    let chunk: ChatChunk = serde_json::from_str(data).ok()?;
    let content = chunk.choices.into_iter().next()?.delta.content?;
    if content.is_empty() {
        None
    } else {
        Some(SseLine::Delta(content))
    }
}
