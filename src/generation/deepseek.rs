//! DeepSeek (OpenAI 호환 chat completions) 클라이언트
//!
//! source: https://api-docs.deepseek.com/api/create-chat-completion
//!
//! 스트리밍 응답은 SSE `data: {...}` 줄 단위이며 `data: [DONE]`으로 끝납니다.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::GenerationSettings;

use super::llm::{Generation, GenerationProvider, TokenStream, TokenUsage};

/// API 키 환경변수
const API_KEY_VAR: &str = "DEEPSEEK_API_KEY";

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Debug, Default, Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChatContent,
}

// ============================================================================
// SSE Decoding
// ============================================================================

/// 바이트 청크를 줄 단위로 재조립
#[derive(Debug, Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// 완성된 줄만 반환하고 나머지는 버퍼에 보관
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(decode_line(&line));
        }
        lines
    }

    /// 스트림 종료 시 남은 데이터
    fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Some(decode_line(&line))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[derive(Debug, PartialEq)]
enum StreamLine {
    Token(String),
    Done,
    Skip,
}

/// SSE 한 줄 해석
fn parse_stream_line(line: &str) -> Result<StreamLine> {
    let Some(data) = line.strip_prefix("data:") else {
        // 빈 줄, 주석(:), event/id 필드
        return Ok(StreamLine::Skip);
    };

    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }
    if data.is_empty() {
        return Ok(StreamLine::Skip);
    }

    let chunk: ChatChunk =
        serde_json::from_str(data).with_context(|| format!("Malformed stream chunk: {}", data))?;

    let token = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty());

    Ok(token.map_or(StreamLine::Skip, StreamLine::Token))
}

/// 스트리밍 응답 해석 상태
struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// 다음 텍스트 증분 (`[DONE]` 또는 연결 종료 시 None)
async fn next_token(mut state: SseState) -> Result<Option<(String, SseState)>> {
    loop {
        if let Some(token) = state.pending.pop_front() {
            return Ok(Some((token, state)));
        }
        if state.finished {
            return Ok(None);
        }

        let lines = match state.bytes.next().await {
            Some(chunk) => state
                .decoder
                .push(&chunk.context("Failed to read completion stream")?),
            None => {
                state.finished = true;
                state.decoder.finish().into_iter().collect()
            }
        };

        for line in lines {
            match parse_stream_line(&line)? {
                StreamLine::Token(token) => state.pending.push_back(token),
                StreamLine::Done => {
                    state.finished = true;
                    break;
                }
                StreamLine::Skip => {}
            }
        }
    }
}

// ============================================================================
// DeepSeekClient
// ============================================================================

/// OpenAI 호환 chat completions 클라이언트
#[derive(Debug)]
pub struct DeepSeekClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl DeepSeekClient {
    /// # Arguments
    /// * `api_key` - API 키
    /// * `settings` - 엔드포인트, 모델, 샘플링 설정
    pub fn new(api_key: String, settings: &GenerationSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    /// `DEEPSEEK_API_KEY` 환경변수에서 API 키를 읽어 생성
    pub fn from_env(settings: &GenerationSettings) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("API key not found. Set {} environment variable.", API_KEY_VAR))?;
        Self::new(api_key, settings)
    }

    fn request<'a>(
        &'a self,
        prompt: &'a str,
        system_prompt: Option<&'a str>,
        stream: bool,
    ) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        ChatRequest {
            model: &self.model,
            messages,
            stream,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat completion API error ({}): {}", status, text);
        }

        Ok(response)
    }
}

#[async_trait]
impl GenerationProvider for DeepSeekClient {
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<Generation> {
        let response = self.send(&self.request(prompt, system_prompt, false)).await?;
        let body: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        let usage = body.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        tracing::debug!(
            "Generated {} chars ({} total tokens) with {}",
            text.len(),
            usage.total_tokens,
            self.model
        );

        Ok(Generation { text, usage })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<TokenStream> {
        let response = self.send(&self.request(prompt, system_prompt, true)).await?;
        let state = SseState {
            bytes: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            decoder: LineDecoder::default(),
            pending: VecDeque::new(),
            finished: false,
        };

        let tokens = futures::stream::try_unfold(state, next_token);
        Ok(tokens.boxed())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> DeepSeekClient {
        DeepSeekClient::new("test-key".into(), &GenerationSettings::default()).unwrap()
    }

    #[test]
    fn test_request_body() {
        let client = client();
        let body = serde_json::to_value(client.request("hello", Some("be brief"), true)).unwrap();

        assert_eq!(body["model"], "deepseek-chat");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert!(body.get("temperature").is_none());

        let body = serde_json::to_value(client.request("hello", None, false)).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_stream_lines() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_stream_line(line).unwrap(), StreamLine::Token("Hel".into()));

        assert_eq!(parse_stream_line("data: [DONE]").unwrap(), StreamLine::Done);
        assert_eq!(parse_stream_line("").unwrap(), StreamLine::Skip);
        assert_eq!(parse_stream_line(": keep-alive").unwrap(), StreamLine::Skip);

        // 역할만 있는 첫 청크, 빈 content
        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#;
        assert_eq!(parse_stream_line(role_only).unwrap(), StreamLine::Skip);

        assert!(parse_stream_line("data: {not json").is_err());
    }

    #[test]
    fn test_line_decoder_reassembles_split_chunks() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());

        let lines = decoder.push(b":1}\r\n\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"a\":1}", ""]);

        assert!(decoder.push(b"NE]").is_empty());
        assert_eq!(decoder.finish(), Some("data: [DONE]".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_parse_completion_response() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Answer [Guide, page 1]"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 8, "total_tokens": 128}
        }"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("Answer [Guide, page 1]")
        );
        assert_eq!(response.usage.unwrap().total_tokens, 128);
    }
}
