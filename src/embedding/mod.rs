//! 임베딩 모듈 - 텍스트 벡터화
//!
//! 두 가지 백엔드를 지원합니다.
//! - Gemini `batchEmbedContents` API
//! - `{"texts": [...]}` → `{"embeddings": [[...]]}` 형식의 HTTP 임베딩 서버
//!
//! 재시도는 이 모듈의 책임이며, 검색 코어는 실패를 그대로 전달합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = create_embedder(&settings.embedding)?;
//! let embedding = embedder.embed("Hello, world!").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingBackend, EmbeddingSettings};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 고정 길이 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩 (검색 쿼리용)
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (문서 청크용, 입력 순서 유지)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Retry
// ============================================================================

/// 일시적 오류(연결 실패, 429, 5xx) 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 1000;

/// POST 요청을 보내고 성공 응답 본문을 반환
///
/// 429와 5xx, 전송 오류는 지수 백오프로 재시도하고 그 외 오류는 즉시 실패합니다.
async fn post_with_retry<T: Serialize + ?Sized>(
    request: impl Fn() -> reqwest::RequestBuilder,
    body: &T,
    backend: &str,
) -> Result<String> {
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1));
            tracing::warn!(
                "{} embedding request failed, retrying in {:?} (attempt {}/{})",
                backend,
                backoff,
                attempt,
                MAX_RETRIES
            );
            tokio::time::sleep(backoff).await;
        }

        let response = match request().json(body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                last_error = Some(anyhow::anyhow!("Failed to send embedding request: {}", e));
                continue;
            }
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read response body")?;

        if status.is_success() {
            return Ok(text);
        }

        if status.as_u16() == 429 || status.is_server_error() {
            last_error = Some(anyhow::anyhow!("{} API error ({}): {}", backend, status, text));
            continue;
        }

        anyhow::bail!("{} API error ({}): {}", backend, status, text);
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("Embedding failed after {} retries", MAX_RETRIES)))
}

/// 응답 벡터 수와 차원 검증
fn check_embeddings(embeddings: &[Vec<f32>], expected: usize, dimension: usize) -> Result<()> {
    if embeddings.len() != expected {
        anyhow::bail!(
            "Embedding count mismatch: sent {} texts, got {} vectors",
            expected,
            embeddings.len()
        );
    }
    if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
        anyhow::bail!(
            "Embedding dimension mismatch: expected {}, got {}",
            dimension,
            bad.len()
        );
    }
    Ok(())
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to create HTTP client")
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini API 베이스 URL
/// source: https://ai.google.dev/gemini-api/docs/embeddings
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// batchEmbedContents 한 번에 보낼 수 있는 최대 요청 수
const GEMINI_MAX_BATCH: usize = 100;

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    model: String,
    dimension: usize,
}

impl GeminiEmbedding {
    /// 새 Gemini 임베딩 인스턴스 생성
    ///
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `settings` - 모델, 차원, 타임아웃
    pub fn new(api_key: String, settings: &EmbeddingSettings) -> Result<Self> {
        // gemini-embedding-001 MRL 권장 차원
        if ![768, 1536, 3072].contains(&settings.dimension) {
            anyhow::bail!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                settings.dimension
            );
        }

        Ok(Self {
            api_key,
            client: build_client(settings.timeout_secs)?,
            model: settings.model.clone(),
            dimension: settings.dimension,
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    pub fn from_env(settings: &EmbeddingSettings) -> Result<Self> {
        Self::new(get_api_key()?, settings)
    }

    fn batch_request(&self, texts: &[String], task_type: &'static str) -> BatchEmbedRequest {
        BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedRequest {
                    model: format!("models/{}", self.model),
                    content: EmbedContent {
                        parts: vec![EmbedPart { text: text.clone() }],
                    },
                    task_type,
                    output_dimensionality: Some(self.dimension),
                })
                .collect(),
        }
    }

    async fn embed_with_task(&self, texts: &[String], task_type: &'static str) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/{}:batchEmbedContents", GEMINI_API_BASE, self.model);
        let mut results = Vec::with_capacity(texts.len());

        for (i, batch) in texts.chunks(GEMINI_MAX_BATCH).enumerate() {
            tracing::debug!(
                "Gemini embedding batch {} ({} texts, task={})",
                i + 1,
                batch.len(),
                task_type
            );

            let request = self.batch_request(batch, task_type);
            // API 키는 URL이 아닌 헤더로 전송
            let body = post_with_retry(
                || {
                    self.client
                        .post(&url)
                        .header("x-goog-api-key", &self.api_key)
                },
                &request,
                "Gemini",
            )
            .await?;

            let response: BatchEmbedResponse =
                serde_json::from_str(&body).context("Failed to parse embedding response")?;
            let vectors: Vec<Vec<f32>> = response.embeddings.into_iter().map(|e| e.values).collect();
            check_embeddings(&vectors, batch.len(), self.dimension)?;
            results.extend(vectors);
        }

        Ok(results)
    }
}

/// Gemini batchEmbedContents 요청 본문
#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedRequest>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality", skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

/// Gemini API 응답
#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let mut vectors = self
            .embed_with_task(&[text.to_string()], "RETRIEVAL_QUERY")
            .await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Gemini returned no embedding"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.embed_with_task(texts, "RETRIEVAL_DOCUMENT").await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// HTTP Embedding Server
// ============================================================================

/// 외부 HTTP 임베딩 서버 클라이언트
#[derive(Debug)]
pub struct HttpEmbedding {
    client: reqwest::Client,
    url: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct HttpEmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct HttpEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbedding {
    /// # Arguments
    /// * `url` - 임베딩 엔드포인트
    /// * `settings` - 차원, 타임아웃
    pub fn new(url: impl Into<String>, settings: &EmbeddingSettings) -> Result<Self> {
        Ok(Self {
            client: build_client(settings.timeout_secs)?,
            url: url.into(),
            dimension: settings.dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Embedding server returned no vector"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let body = post_with_retry(
            || self.client.post(&self.url),
            &HttpEmbedRequest { texts },
            "HTTP",
        )
        .await?;

        let response: HttpEmbedResponse =
            serde_json::from_str(&body).context("Failed to parse embedding response")?;
        check_embeddings(&response.embeddings, texts.len(), self.dimension)?;
        Ok(response.embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 환경변수 (우선순위 순)
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

fn find_api_key(lookup: impl Fn(&str) -> Option<String>) -> Option<(&'static str, String)> {
    API_KEY_VARS
        .iter()
        .find_map(|var| lookup(var).filter(|k| !k.is_empty()).map(|k| (*var, k)))
}

/// API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Result<String> {
    match find_api_key(|var| std::env::var(var).ok()) {
        Some((var, key)) => {
            tracing::debug!("Using API key from {}", var);
            Ok(key)
        }
        None => anyhow::bail!(
            "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
             Get your API key at: https://aistudio.google.com/app/apikey"
        ),
    }
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    find_api_key(|var| std::env::var(var).ok()).is_some()
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 맞는 임베딩 프로바이더 생성
pub fn create_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedder: Arc<dyn EmbeddingProvider> = match settings.backend {
        EmbeddingBackend::Gemini => Arc::new(GeminiEmbedding::from_env(settings)?),
        EmbeddingBackend::Http => {
            let url = settings
                .api_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("embedding.api_url is not set"))?;
            Arc::new(HttpEmbedding::new(url, settings)?)
        }
    };

    tracing::info!(
        "Using {} embedding (dimension: {})",
        embedder.name(),
        embedder.dimension()
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================
