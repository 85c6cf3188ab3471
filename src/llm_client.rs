// src/llm_client.rs

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{LlmBackend, LlmSection};
use crate::error::{AppError, AppResult};
use crate::llm_key::LlmKey;

/// Text generation. `system` is optional; the prompt carries everything the
/// model needs when it is `None`.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: Option<&str>, prompt: &str) -> AppResult<String>;
}

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>>;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Client for any OpenAI-compatible API: Gemini's compatibility endpoint,
/// Ollama's `/v1`, or a proxy in front of either.
pub struct OpenAiClient {
    client: Client,
    backend: LlmBackend,
    base_url: String,
    model: String,
    embedding_model: String,
    key: Arc<LlmKey>,
}

impl OpenAiClient {
    pub fn new(llm: &LlmSection, key: Arc<LlmKey>) -> AppResult<Self> {
        let endpoint = llm.endpoint();
        let client = Client::builder()
            .timeout(Duration::from_secs(llm.timeout_secs))
            .build()?;
        info!(
            backend = ?llm.backend,
            url = %endpoint.base_url,
            model = %endpoint.model,
            embedding_model = %endpoint.embedding_model,
            "LLM client configured"
        );
        Ok(Self {
            client,
            backend: llm.backend,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            model: endpoint.model.clone(),
            embedding_model: endpoint.embedding_model.clone(),
            key,
        })
    }

    /// Ollama ignores the bearer token but the API still wants one.
    fn bearer(&self) -> AppResult<String> {
        match self.backend {
            LlmBackend::Ollama => Ok("ollama".to_string()),
            LlmBackend::Remote => self.key.get(),
        }
    }

    /// Check that the Ollama server is reachable. Always true for remote
    /// backends, which are only probed by real requests.
    pub async fn check_health(&self) -> bool {
        if self.backend != LlmBackend::Ollama {
            return true;
        }
        // Ollama's health endpoint is at the root (not under /v1)
        let health_url = self.base_url.trim_end_matches("/v1");

        match self
            .client
            .get(health_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!("Ollama server is reachable");
                true
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "Ollama server returned non-OK status");
                false
            }
            Err(e) => {
                warn!(error = %e, "Ollama server not reachable");
                false
            }
        }
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> AppResult<reqwest::Response> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.bearer()?))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Llm(format!("LLM API error {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, system: Option<&str>, prompt: &str) -> AppResult<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: 0.0,
        };

        let chat_response: ChatResponse = self
            .post_json("chat/completions", &request)
            .await?
            .json()
            .await?;

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::Llm("Empty response from LLM".into()))?;
        debug!(chars = content.len(), "LLM completion received");
        Ok(content)
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiClient {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
        };
        let response: EmbeddingResponse = self
            .post_json("embeddings", &request)
            .await?
            .json()
            .await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AppError::Llm("Empty embedding response".into()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_backend_needs_key() {
        let llm = LlmSection::default();
        let client = OpenAiClient::new(&llm, Arc::new(LlmKey::new(None))).unwrap();
        assert!(matches!(client.bearer(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_ollama_backend_uses_placeholder_key() {
        let llm = LlmSection {
            backend: LlmBackend::Ollama,
            ..LlmSection::default()
        };
        let client = OpenAiClient::new(&llm, Arc::new(LlmKey::new(None))).unwrap();
        assert_eq!(client.bearer().unwrap(), "ollama");
        assert_eq!(client.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_chat_response_shape() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"{}"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "{}");
    }

    #[test]
    fn test_embedding_response_shape() {
        let raw = r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.5,-0.25]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data[0].embedding, vec![0.5, -0.25]);
    }
}
