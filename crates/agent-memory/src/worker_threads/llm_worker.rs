//! HTTP client for an OpenAI-compatible LLM backend.
//!
//! Serves as both the embedding gateway (`/v1/embeddings`) and the session
//! summarizer (`/v1/chat/completions`, asked to answer in JSON).
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::memory_db::{AiSummary, CandidatePattern, SessionEvent};
use crate::memory_engine::embedder::EmbeddingGateway;
use crate::memory_engine::summarization::{Summarizer, SummaryOutcome};
use crate::utils::TextUtils;

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("static fence pattern");
}

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize an AI agent's work session from its event log. \
Reply with a single JSON object: {\"summary\": string, \"ai_summary\": {\"key_events\": [string], \
\"decisions\": [string], \"outcomes\": [string], \"next_steps\": [string]}, \"candidate_patterns\": \
[{\"pattern_type\": \"success\"|\"failure\"|\"technical\"|\"process\", \"domain\": string, \
\"description\": string, \"action\": string, \"outcome\": string, \"context\": object}]}. \
Only propose patterns that would help another agent in a similar situation.";

/// Longest rendering of a single event's payload in the prompt.
const MAX_EVENT_CHARS: usize = 600;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

/// Lenient shape of the summarizer's JSON answer. Candidates are validated
/// one by one so a single malformed entry does not discard the rest.
#[derive(Debug, Deserialize)]
struct RawSummary {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    ai_summary: Option<AiSummary>,
    #[serde(default)]
    candidate_patterns: Vec<Value>,
}

pub struct LLMWorker {
    backend_url: String,
    embedding_model: String,
    summary_model: String,
    http_client: reqwest::Client,
}

impl LLMWorker {
    pub fn new(backend_url: &str, embedding_model: &str, summary_model: &str, request_timeout: Duration) -> Self {
        info!("LLM worker initialized with backend: {}", backend_url);
        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            embedding_model: embedding_model.to_string(),
            summary_model: summary_model.to_string(),
            http_client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        let request_timeout = config.summarize_timeout().max(config.embedding_timeout());
        Self::new(&config.backend_url, &config.embedding_model, &config.summary_model, request_timeout)
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.backend_url)
    }

    pub async fn generate_embeddings(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Generating embeddings for {} text(s)", texts.len());

        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts,
        };
        let response = self.http_client
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Embedding request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Embedding endpoint returned {}: {}", status, body));
        }
        let embedding_response: EmbeddingResponse = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {}", e))?;

        Ok(embedding_response.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn chat(&self, messages: Vec<ChatMessage>, max_tokens: u32) -> anyhow::Result<String> {
        let request = ChatCompletionRequest {
            model: self.summary_model.clone(),
            messages,
            max_tokens,
            temperature: 0.2,
            stream: false,
        };
        let response = self.http_client
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }
        let completion: ChatCompletionResponse = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;

        Ok(completion.choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl EmbeddingGateway for LLMWorker {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.generate_embeddings(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedding endpoint returned no vectors"))
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}

#[async_trait]
impl Summarizer for LLMWorker {
    async fn summarize(&self, events: &[SessionEvent]) -> anyhow::Result<Option<SummaryOutcome>> {
        if events.is_empty() {
            return Ok(None);
        }
        let messages = vec![
            ChatMessage { role: "system".to_string(), content: SUMMARY_SYSTEM_PROMPT.to_string() },
            ChatMessage { role: "user".to_string(), content: render_event_log(events) },
        ];
        let content = self.chat(messages, 1024).await?;
        Ok(parse_summary_response(&content))
    }
}

fn render_event_log(events: &[SessionEvent]) -> String {
    let mut prompt = String::from("Session event log (oldest first):\n");
    for event in events {
        let payload = event.data.to_string();
        prompt.push_str(&format!(
            "{}. [{}] {}: {}\n",
            event.seq,
            event.timestamp.to_rfc3339(),
            event.event_type,
            TextUtils::truncate_with_ellipsis(&payload, MAX_EVENT_CHARS)
        ));
    }
    prompt
}

/// Interpret the model's answer. JSON (optionally fenced) is preferred;
/// anything else is taken as a plain-text summary.
fn parse_summary_response(content: &str) -> Option<SummaryOutcome> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    let body = CODE_FENCE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    match serde_json::from_str::<RawSummary>(body) {
        Ok(raw) => {
            let candidate_patterns = raw
                .candidate_patterns
                .into_iter()
                .filter_map(|value| match serde_json::from_value::<CandidatePattern>(value) {
                    Ok(candidate) => Some(candidate),
                    Err(e) => {
                        debug!("Dropping malformed candidate pattern: {}", e);
                        None
                    }
                })
                .collect();
            Some(SummaryOutcome {
                summary: raw.summary,
                ai_summary: raw.ai_summary,
                candidate_patterns,
            })
        }
        Err(e) => {
            warn!("Summarizer did not return JSON ({}); keeping plain text", e);
            Some(SummaryOutcome {
                summary: body.to_string(),
                ai_summary: None,
                candidate_patterns: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::PatternType;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn event(seq: i64, event_type: &str) -> SessionEvent {
        SessionEvent {
            id: format!("e{}", seq),
            session_id: "s".to_string(),
            seq,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            data: json!({"file": "src/lib.rs"}),
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_embed_posts_model_and_input() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .match_body(mockito::Matcher::PartialJson(json!({"model": "embed-small", "input": ["hello"]})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[0.1,0.2,0.3]}]}"#)
            .create_async()
            .await;

        let worker = LLMWorker::new(&server.url(), "embed-small", "chat", Duration::from_secs(5));
        let vector = worker.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_embed_surfaces_backend_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let worker = LLMWorker::new(&server.url(), "m", "chat", Duration::from_secs(5));
        let err = worker.embed("hello").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_summarize_parses_fenced_json() {
        let answer = "```json\n{\"summary\":\"Fixed the bug\",\"ai_summary\":{\"key_events\":[\"patched parser\"]},\
\"candidate_patterns\":[{\"pattern_type\":\"success\",\"domain\":\"parsing\",\"description\":\"Reproduce first\",\
\"action\":\"Write a failing test\"},{\"pattern_type\":\"bogus\"}]}\n```";
        let body = json!({"choices": [{"message": {"role": "assistant", "content": answer}}]});

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let worker = LLMWorker::new(&server.url(), "m", "chat", Duration::from_secs(5));
        let outcome = worker.summarize(&[event(1, "tool_use")]).await.unwrap().unwrap();
        assert_eq!(outcome.summary, "Fixed the bug");
        assert_eq!(outcome.ai_summary.unwrap().key_events, vec!["patched parser".to_string()]);
        assert_eq!(outcome.candidate_patterns.len(), 1);
        assert_eq!(outcome.candidate_patterns[0].pattern_type, PatternType::Success);
    }

    #[tokio::test]
    async fn test_summarize_without_events_skips_backend() {
        let worker = LLMWorker::new("http://127.0.0.1:9", "m", "chat", Duration::from_millis(100));
        assert!(worker.summarize(&[]).await.unwrap().is_none());
    }

    #[test]
    fn test_plain_text_answer_becomes_summary() {
        let outcome = parse_summary_response("Refactored the handoff queue.").unwrap();
        assert_eq!(outcome.summary, "Refactored the handoff queue.");
        assert!(outcome.candidate_patterns.is_empty());
        assert!(parse_summary_response("   ").is_none());
    }

    #[test]
    fn test_event_log_rendering_truncates_payloads() {
        let mut big = event(1, "tool_use");
        big.data = json!({"blob": "x".repeat(5_000)});
        let rendered = render_event_log(&[big, event(2, "note")]);
        assert!(rendered.contains("1. ["));
        assert!(rendered.contains("2. ["));
        assert!(rendered.len() < 2_000);
    }
}
