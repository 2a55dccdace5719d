//! Vector Store - 벡터 검색 트레이트 및 유틸리티
//!
//! 벡터 저장소는 청크의 원본 저장소이기도 합니다. 키워드 인덱스는 `scroll`로
//! 전체 청크를 순회해 재구축되는 파생 캐시입니다.

use anyhow::Result;
use async_trait::async_trait;

use super::chunk::{Chunk, DenseResult};
use super::filter::MetadataFilter;

// ============================================================================
// Types
// ============================================================================

/// 벡터 엔트리 (저장용)
#[derive(Debug, Clone)]
pub struct VectorEntry {
    /// 청크 (텍스트 + 메타데이터)
    pub chunk: Chunk,
    /// 임베딩 벡터
    pub embedding: Vec<f32>,
}

/// 스크롤 한 페이지
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    pub chunks: Vec<Chunk>,
    /// 다음 페이지 토큰 (마지막 페이지면 None)
    pub next_page_token: Option<String>,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
///
/// 벡터 저장소의 공통 인터페이스입니다.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 저장소 이름 (로깅용)
    fn name(&self) -> &str;

    /// 벡터 배치 저장
    ///
    /// 같은 문서의 기존 청크는 교체됩니다.
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize>;

    /// 최근접 이웃 검색
    ///
    /// # Arguments
    /// * `vector` - 쿼리 임베딩
    /// * `filters` - AND로 결합되는 메타데이터 필터
    /// * `limit` - 최대 결과 수
    ///
    /// # Returns
    /// 유사도 내림차순 결과
    async fn query(
        &self,
        vector: &[f32],
        filters: &[MetadataFilter],
        limit: usize,
    ) -> Result<Vec<DenseResult>>;

    /// 전체 청크 페이지 단위 순회
    async fn scroll(&self, page_token: Option<&str>, limit: usize) -> Result<ScrollPage>;

    /// 문서의 모든 청크 삭제
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    /// 저장된 청크 개수
    async fn count(&self) -> Result<usize>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// 텍스트를 단어 단위 청크로 분할
///
/// # Arguments
/// * `text` - 분할할 텍스트
/// * `chunk_size` - 청크 당 단어 수
/// * `overlap` - 청크 간 중첩 단어 수 (`chunk_size`보다 작아야 함)
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();

    if words.is_empty() || chunk_size == 0 {
        return vec![];
    }

    if words.len() <= chunk_size {
        return vec![words.join(" ")];
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < words.len() {
        let end = (start + chunk_size).min(words.len());
        chunks.push(words[start..end].join(" "));

        if end >= words.len() {
            break;
        }

        start += step;
    }

    chunks
}

// ============================================================================
// Tests
// ============================================================================
