//! 생성 모듈 - 검색 결과 기반 인용 답변
//!
//! 검색된 청크를 프롬프트 컨텍스트로 넣고 생성 모델을 호출한 뒤,
//! 제공된 청크마다 인용을 붙입니다.
//!
//! 스트리밍은 생성 작업과 소비자 사이의 채널로 구현됩니다.
//! 0개 이상의 `AnswerEvent::Token` 뒤에 `AnswerEvent::Complete`가 정확히 한 번 옵니다.
//! 생성 중 오류가 나면 `Complete` 대신 `Err` 항목으로 끝납니다.

mod citation;
mod deepseek;
mod llm;
mod prompt;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{RagError, RagResult};
use crate::knowledge::{Chunk, HybridRetriever, SearchDebugInfo, SearchRequest};

pub use citation::{build_citations, Citation, EXCERPT_CHARS};
pub use deepseek::DeepSeekClient;
pub use llm::{Generation, GenerationProvider, TokenStream, TokenUsage};
pub use prompt::{
    format_context, PromptManager, FALLBACK_ANSWER, RAG_SYSTEM, RAG_USER, SEARCH_REFINEMENT,
};

/// 스트리밍 채널 버퍼 크기
const STREAM_BUFFER: usize = 32;

// ============================================================================
// Types
// ============================================================================

/// 블로킹 답변
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub citations: Vec<Citation>,
    /// 생성 모델을 호출하지 않았으면 None
    pub token_usage: Option<TokenUsage>,
}

impl Answer {
    fn fallback() -> Self {
        Self {
            answer: FALLBACK_ANSWER.to_string(),
            citations: Vec::new(),
            token_usage: None,
        }
    }
}

/// 스트리밍 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEvent {
    /// 텍스트 증분
    Token(String),
    /// 마지막 항목: 전체 인용 목록
    Complete { citations: Vec<Citation> },
}

/// 스트리밍 와이어 형식
///
/// `{delta, citations: null, done: false}` 반복 후
/// `{delta: "", citations: [...], done: true}` 한 번.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub citations: Option<Vec<Citation>>,
    pub done: bool,
}

impl From<AnswerEvent> for StreamChunk {
    fn from(event: AnswerEvent) -> Self {
        match event {
            AnswerEvent::Token(delta) => StreamChunk {
                delta,
                citations: None,
                done: false,
            },
            AnswerEvent::Complete { citations } => StreamChunk {
                delta: String::new(),
                citations: Some(citations),
                done: true,
            },
        }
    }
}

/// 스트리밍 답변
///
/// 드롭하면 생성 작업이 중단되고 하위 스트림도 해제됩니다.
pub struct AnswerStream {
    rx: mpsc::Receiver<RagResult<AnswerEvent>>,
    debug: SearchDebugInfo,
}

impl AnswerStream {
    /// 이 답변에 사용된 검색 디버그 정보
    pub fn debug(&self) -> &SearchDebugInfo {
        &self.debug
    }
}

impl Stream for AnswerStream {
    type Item = RagResult<AnswerEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ============================================================================
// RagPipeline
// ============================================================================

/// 검색 + 생성 파이프라인
pub struct RagPipeline {
    retriever: Arc<HybridRetriever>,
    generator: Arc<dyn GenerationProvider>,
    prompts: PromptManager,
}

impl RagPipeline {
    pub fn new(retriever: Arc<HybridRetriever>, generator: Arc<dyn GenerationProvider>) -> Self {
        Self::with_prompts(retriever, generator, PromptManager::default())
    }

    pub fn with_prompts(
        retriever: Arc<HybridRetriever>,
        generator: Arc<dyn GenerationProvider>,
        prompts: PromptManager,
    ) -> Self {
        Self {
            retriever,
            generator,
            prompts,
        }
    }

    pub fn retriever(&self) -> &Arc<HybridRetriever> {
        &self.retriever
    }

    pub fn prompts(&self) -> &PromptManager {
        &self.prompts
    }

    /// 인용 답변 생성
    ///
    /// 검색 결과가 없으면 생성 모델을 호출하지 않고 고정 답변을 반환합니다.
    pub async fn answer(&self, request: &SearchRequest) -> RagResult<Answer> {
        let (chunks, _) = self.retrieve(request).await?;
        if chunks.is_empty() {
            tracing::info!("No passages retrieved, returning fallback answer");
            return Ok(Answer::fallback());
        }

        let prompt = self.prompts.format_rag_prompt(&request.query, &chunks);
        let generation = self
            .generator
            .generate(&prompt, Some(self.prompts.system_prompt()))
            .await
            .map_err(RagError::Generation)?;

        tracing::info!(
            "Answer generated by {} from {} passages ({} tokens)",
            self.generator.model(),
            chunks.len(),
            generation.usage.total_tokens
        );

        Ok(Answer {
            answer: generation.text,
            citations: build_citations(&chunks),
            token_usage: Some(generation.usage),
        })
    }

    /// 스트리밍 인용 답변
    ///
    /// 검색과 생성 요청 시작까지는 호출 시점에 수행되어 실패가 `Err`로 바로 반환됩니다.
    /// 이후 토큰은 백그라운드 작업이 채널로 전달합니다.
    pub async fn answer_stream(&self, request: &SearchRequest) -> RagResult<AnswerStream> {
        let (chunks, debug) = self.retrieve(request).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        if chunks.is_empty() {
            tracing::info!("No passages retrieved, streaming fallback answer");
            tokio::spawn(async move {
                if tx
                    .send(Ok(AnswerEvent::Token(FALLBACK_ANSWER.to_string())))
                    .await
                    .is_ok()
                {
                    let _ = tx
                        .send(Ok(AnswerEvent::Complete {
                            citations: Vec::new(),
                        }))
                        .await;
                }
            });
            return Ok(AnswerStream { rx, debug });
        }

        let prompt = self.prompts.format_rag_prompt(&request.query, &chunks);
        let tokens = self
            .generator
            .generate_stream(&prompt, Some(self.prompts.system_prompt()))
            .await
            .map_err(RagError::Generation)?;

        // 인용은 검색 직후 확정되지만 마지막 항목으로 보냄
        let citations = build_citations(&chunks);
        tokio::spawn(forward_tokens(tokens, citations, tx));

        Ok(AnswerStream { rx, debug })
    }

    /// 검색어 개선 (search refinement 템플릿)
    pub async fn refine_query(&self, query: &str) -> RagResult<String> {
        let prompt = self.prompts.format_search_refinement(query);
        let generation = self
            .generator
            .generate(&prompt, None)
            .await
            .map_err(RagError::Generation)?;

        let refined = generation.text.trim().trim_matches('"').trim();
        if refined.is_empty() {
            return Ok(query.to_string());
        }

        tracing::debug!("Refined query: '{}' -> '{}'", query, refined);
        Ok(refined.to_string())
    }

    async fn retrieve(&self, request: &SearchRequest) -> RagResult<(Vec<Chunk>, SearchDebugInfo)> {
        let outcome = self.retriever.search(request).await?;
        let chunks = outcome.results.into_iter().map(|r| r.chunk).collect();
        Ok((chunks, outcome.debug))
    }
}

/// 생성 스트림을 채널로 전달
///
/// 수신자가 사라지면 즉시 중단하고 하위 스트림을 드롭합니다.
async fn forward_tokens(
    mut tokens: TokenStream,
    citations: Vec<Citation>,
    tx: mpsc::Sender<RagResult<AnswerEvent>>,
) {
    let mut forwarded = 0usize;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Answer stream dropped after {} tokens, cancelling generation", forwarded);
                return;
            }
            next = tokens.next() => next,
        };

        match next {
            Some(Ok(token)) => {
                if tx.send(Ok(AnswerEvent::Token(token))).await.is_err() {
                    return;
                }
                forwarded += 1;
            }
            Some(Err(e)) => {
                tracing::warn!("Generation stream failed after {} tokens: {:#}", forwarded, e);
                let _ = tx.send(Err(RagError::Generation(e))).await;
                return;
            }
            None => break,
        }
    }

    let _ = tx.send(Ok(AnswerEvent::Complete { citations })).await;
}

// ============================================================================
// Tests
// ============================================================================
