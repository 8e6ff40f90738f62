//! HTTP chat-completion gateway for OpenAI-compatible endpoints.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::{ChatMessage, Completion, CompletionGateway, CompletionParams, TokenStream};
use crate::types::TokenUsage;

/// Parse a response body as JSON, returning a clear error if the server
/// returned HTML (typical for proxies pointing at the wrong endpoint).
pub(crate) async fn parse_json_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(200).collect();
        return Err(anyhow!(
            "Endpoint {} returned HTML instead of JSON (HTTP {}). Response: {}",
            endpoint,
            status,
            preview
        ));
    }
    serde_json::from_str::<T>(&body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        anyhow!(
            "Failed to parse JSON from {} (HTTP {}): {}. Body: {}",
            endpoint,
            status,
            e,
            preview
        )
    })
}

pub struct HttpCompletionGateway {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

impl HttpCompletionGateway {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(300))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    fn build_request(
        messages: &[ChatMessage],
        params: &CompletionParams,
        stream: bool,
    ) -> serde_json::Value {
        let payload: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        json!({
            "model": params.model,
            "messages": payload,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "stream": stream,
        })
    }
}

#[async_trait]
impl CompletionGateway for HttpCompletionGateway {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<Completion> {
        let request = Self::build_request(messages, params, false);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Completion request to {} timed out", self.endpoint)
                } else if e.is_connect() {
                    anyhow!("Failed to connect to {}: {}", self.endpoint, e)
                } else {
                    anyhow!("Completion request to {} failed: {}", self.endpoint, e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow!("Completion API error ({}): {}", status, error));
        }

        let parsed: ChatResponse = parse_json_response(response, &self.endpoint).await?;
        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow!("Completion API returned empty choices array"))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(Completion { text, usage })
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<TokenStream> {
        let (tx, stream) = TokenStream::channel();

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let request = Self::build_request(messages, params, true);

        tokio::spawn(async move {
            stream_sse(client, endpoint, api_key, request, tx).await;
        });

        Ok(stream)
    }
}

/// Relay an OpenAI-style SSE stream into the channel. Network chunks may
/// split SSE lines, so partial lines are buffered across reads.
async fn stream_sse(
    client: Client,
    endpoint: String,
    api_key: String,
    request: serde_json::Value,
    tx: mpsc::Sender<String>,
) {
    let response = match client
        .post(&endpoint)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(endpoint = %endpoint, error = %e, "streaming request failed");
            return;
        }
    };

    if !response.status().is_success() {
        tracing::error!(
            endpoint = %endpoint,
            status = %response.status(),
            "streaming API error"
        );
        return;
    }

    let mut byte_stream = response.bytes_stream();
    let mut line_buffer = String::new();

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "stream chunk error");
                break;
            }
        };

        line_buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline_at) = line_buffer.find('\n') {
            let line: String = line_buffer.drain(..=newline_at).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                return;
            }
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) {
                if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str() {
                    if tx.send(content.to_string()).await.is_err() {
                        // Consumer went away; stop reading upstream.
                        return;
                    }
                }
            }
        }
    }
}
