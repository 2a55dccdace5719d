//! 인메모리 벡터 저장소
//!
//! 전수 코사인 유사도 검색을 사용합니다. 테스트와 소규모 코퍼스용입니다.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::chunk::DenseResult;
use super::filter::{matches_all, MetadataFilter};
use super::vector::{cosine_similarity, ScrollPage, VectorEntry, VectorStore};

/// 인메모리 벡터 저장소
#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<Vec<VectorEntry>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        let mut stored = self.entries.write().await;

        let mut documents: Vec<&str> = entries.iter().map(|e| e.chunk.document_id.as_str()).collect();
        documents.sort_unstable();
        documents.dedup();
        stored.retain(|e| documents.binary_search(&e.chunk.document_id.as_str()).is_err());

        stored.extend(entries.iter().cloned());
        Ok(entries.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        filters: &[MetadataFilter],
        limit: usize,
    ) -> Result<Vec<DenseResult>> {
        let stored = self.entries.read().await;

        let mut results: Vec<DenseResult> = stored
            .iter()
            .filter(|e| matches_all(filters, &e.chunk))
            .map(|e| DenseResult {
                chunk: e.chunk.clone(),
                score: cosine_similarity(vector, &e.embedding),
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    async fn scroll(&self, page_token: Option<&str>, limit: usize) -> Result<ScrollPage> {
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| anyhow::anyhow!("Invalid page token: {}", token))?,
            None => 0,
        };

        let stored = self.entries.read().await;
        let end = (offset + limit.max(1)).min(stored.len());
        let chunks = stored
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|e| e.chunk.clone())
            .collect();

        Ok(ScrollPage {
            chunks,
            next_page_token: (end < stored.len()).then(|| end.to_string()),
        })
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut stored = self.entries.write().await;
        let before = stored.len();
        stored.retain(|e| e.chunk.document_id != document_id);
        Ok(before - stored.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

// ============================================================================
// Tests
// ============================================================================
