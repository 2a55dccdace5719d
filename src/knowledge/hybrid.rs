//! 하이브리드 검색 - 벡터 검색 + BM25 통합
//!
//! 검색 한 번은 세 단계로 진행됩니다.
//! 1. 벡터 검색: 쿼리 임베딩 → 벡터 저장소 최근접 검색 (메타데이터 필터 적용)
//! 2. 키워드 검색: 캐시된 BM25 인덱스 (없거나 무효화되었으면 저장소 전체를 스크롤해 재구축)
//! 3. 통합: RRF 또는 가중합
//!
//! 키워드 인덱스는 벡터 저장소에서 파생된 캐시입니다. TTL은 없으며 `clear_index`로만
//! 무효화됩니다. 재구축은 단일 작성자 구간이고, 동시 검색은 완성된 스냅샷만 봅니다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::{FusionMethod, RetrievalConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, RagResult};

use super::chunk::DenseResult;
use super::filter::{matches_all, MetadataFilter};
use super::fusion::{fuse, FusedResult, FusionParams};
use super::keyword::{KeywordIndex, KeywordResult};
use super::vector::VectorStore;

// ============================================================================
// Types
// ============================================================================

/// 검색 요청
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    /// AND로 결합되는 메타데이터 필터
    pub filters: Vec<MetadataFilter>,
    /// 최종 결과 수 (없으면 설정값)
    pub top_k: Option<usize>,
    /// 통합 방식 (없으면 설정값)
    pub fusion: Option<FusionMethod>,
    /// false면 키워드 인덱스를 강제로 재구축
    pub use_cache: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: Vec::new(),
            top_k: None,
            fusion: None,
            use_cache: true,
        }
    }

    pub fn with_filters(mut self, filters: Vec<MetadataFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_fusion(mut self, fusion: FusionMethod) -> Self {
        self.fusion = Some(fusion);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// 검색 디버그 정보 (관측용, 에러 채널 아님)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDebugInfo {
    pub dense_count: usize,
    pub keyword_count: usize,
    pub fused_count: usize,
    pub fusion_method: FusionMethod,
    /// RRF 상수 (rrf 전용)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf_k: Option<f32>,
    /// 가중치 (weighted 전용)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense_weight: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_weight: Option<f32>,
    pub top_k_dense: usize,
    pub top_k_keyword: usize,
    pub final_top_k: usize,
    /// 사용한 키워드 인덱스 버전
    pub index_version: u64,
    /// 이번 검색에서 인덱스를 재구축했는지
    pub index_rebuilt: bool,
    /// 키워드 인덱스의 청크 수
    pub indexed_chunks: usize,
    /// 키워드 결과에 필터를 적용했는지
    pub keyword_filtered: bool,
}

/// 검색 결과
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<FusedResult>,
    pub debug: SearchDebugInfo,
}

/// 검색기 상태
#[derive(Debug, Clone, Serialize)]
pub struct RetrieverStats {
    pub store: String,
    pub chunk_count: usize,
    /// 캐시된 키워드 인덱스 청크 수 (미구축이면 None)
    pub indexed_chunks: Option<usize>,
    pub index_version: u64,
}

/// 버전이 붙은 읽기 전용 인덱스
#[derive(Debug)]
struct IndexSnapshot {
    index: KeywordIndex,
    version: u64,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
pub struct HybridRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    config: RetrievalConfig,
    keyword: RwLock<Option<Arc<IndexSnapshot>>>,
    rebuild_lock: Mutex<()>,
    version: AtomicU64,
}

impl HybridRetriever {
    /// 새 하이브리드 검색기 생성
    ///
    /// # Arguments
    /// * `embedder` - 쿼리 임베딩 프로바이더
    /// * `store` - 벡터 저장소 (청크 원본)
    /// * `config` - 검증된 검색 파라미터
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
            keyword: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
            version: AtomicU64::new(0),
        }
    }

    /// 하이브리드 검색
    ///
    /// 벡터 검색과 키워드 검색을 동시에 수행한 뒤 통합합니다.
    /// 결과가 없어도 에러가 아닙니다.
    pub async fn search(&self, request: &SearchRequest) -> RagResult<SearchOutcome> {
        let final_top_k = request.top_k.unwrap_or(self.config.final_top_k);
        if final_top_k == 0 {
            return Err(RagError::Config("top_k must be at least 1".into()));
        }

        let started = Instant::now();
        let (dense, (keyword, snapshot, rebuilt)) = tokio::try_join!(
            self.dense_search(&request.query, &request.filters),
            self.keyword_search(&request.query, &request.filters, request.use_cache),
        )?;

        let params = FusionParams::from_config(&self.config, request.fusion);
        let results = fuse(&dense, &keyword, &params, final_top_k);

        let weighted = params.method == FusionMethod::Weighted;
        let debug_info = SearchDebugInfo {
            dense_count: dense.len(),
            keyword_count: keyword.len(),
            fused_count: results.len(),
            fusion_method: params.method,
            rrf_k: (!weighted).then_some(params.rrf_k),
            dense_weight: weighted.then_some(params.dense_weight),
            keyword_weight: weighted.then_some(params.keyword_weight),
            top_k_dense: self.config.top_k_dense,
            top_k_keyword: self.config.top_k_keyword,
            final_top_k,
            index_version: snapshot.version,
            index_rebuilt: rebuilt,
            indexed_chunks: snapshot.index.len(),
            keyword_filtered: self.filters_keyword(&request.filters),
        };

        tracing::info!(
            "Search completed in {:?}: dense={}, keyword={}, fused={} ({})",
            started.elapsed(),
            debug_info.dense_count,
            debug_info.keyword_count,
            debug_info.fused_count,
            debug_info.fusion_method
        );

        Ok(SearchOutcome {
            results,
            debug: debug_info,
        })
    }

    /// 키워드 인덱스 무효화
    ///
    /// 다음 검색에서 재구축됩니다. 진행 중인 재구축 결과는 캐시되지 않습니다.
    pub async fn clear_index(&self) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        *self.keyword.write().await = None;
        tracing::info!("Keyword index invalidated (version {})", version);
    }

    /// 캐시 무시하고 즉시 재구축
    ///
    /// # Returns
    /// 인덱싱된 청크 수
    pub async fn rebuild_index(&self) -> RagResult<usize> {
        let (snapshot, _) = self.keyword_index(false).await?;
        Ok(snapshot.index.len())
    }

    /// 문서 삭제 (저장소에서 제거 후 인덱스 무효화)
    pub async fn delete_document(&self, document_id: &str) -> RagResult<usize> {
        let deleted = self
            .store
            .delete_document(document_id)
            .await
            .map_err(RagError::VectorStore)?;
        if deleted > 0 {
            self.clear_index().await;
        }
        Ok(deleted)
    }

    /// 검색기 상태
    pub async fn stats(&self) -> RagResult<RetrieverStats> {
        let chunk_count = self.store.count().await.map_err(RagError::VectorStore)?;
        Ok(RetrieverStats {
            store: self.store.name().to_string(),
            chunk_count,
            indexed_chunks: self.cached_snapshot().await.map(|s| s.index.len()),
            index_version: self.version.load(Ordering::SeqCst),
        })
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    // ------------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------------

    async fn dense_search(
        &self,
        query: &str,
        filters: &[MetadataFilter],
    ) -> RagResult<Vec<DenseResult>> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(RagError::Embedding)?;

        self.store
            .query(&embedding, filters, self.config.top_k_dense)
            .await
            .map_err(RagError::VectorStore)
    }

    async fn keyword_search(
        &self,
        query: &str,
        filters: &[MetadataFilter],
        use_cache: bool,
    ) -> RagResult<(Vec<KeywordResult>, Arc<IndexSnapshot>, bool)> {
        let (snapshot, rebuilt) = self.keyword_index(use_cache).await?;

        let hits = if self.filters_keyword(filters) {
            let mut hits = snapshot.index.search(query, snapshot.index.len());
            hits.retain(|hit| matches_all(filters, &hit.chunk));
            hits.truncate(self.config.top_k_keyword);
            hits
        } else {
            snapshot.index.search(query, self.config.top_k_keyword)
        };

        Ok((hits, snapshot, rebuilt))
    }

    fn filters_keyword(&self, filters: &[MetadataFilter]) -> bool {
        self.config.filter_keyword_results && !filters.is_empty()
    }

    // ------------------------------------------------------------------------
    // Keyword Index Cache
    // ------------------------------------------------------------------------

    /// 현재 버전과 일치하는 캐시된 스냅샷
    async fn cached_snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        let current = self.version.load(Ordering::SeqCst);
        self.keyword
            .read()
            .await
            .as_ref()
            .filter(|s| s.version == current)
            .cloned()
    }

    /// 사용할 인덱스 스냅샷 (필요하면 재구축)
    ///
    /// # Returns
    /// (스냅샷, 이번 호출에서 재구축했는지)
    async fn keyword_index(&self, use_cache: bool) -> RagResult<(Arc<IndexSnapshot>, bool)> {
        if use_cache {
            if let Some(snapshot) = self.cached_snapshot().await {
                return Ok((snapshot, false));
            }
        }

        let _guard = self.rebuild_lock.lock().await;

        // 대기하는 동안 다른 작업이 재구축했을 수 있음
        if use_cache {
            if let Some(snapshot) = self.cached_snapshot().await {
                return Ok((snapshot, false));
            }
        }

        let version = self.version.load(Ordering::SeqCst);
        let index = self.build_from_store().await?;
        let snapshot = Arc::new(IndexSnapshot { index, version });

        if self.version.load(Ordering::SeqCst) == version {
            *self.keyword.write().await = Some(Arc::clone(&snapshot));
        } else {
            tracing::debug!("Keyword index invalidated during rebuild, not caching");
        }

        Ok((snapshot, true))
    }

    /// 벡터 저장소 전체를 스크롤해 새 인덱스 구축
    async fn build_from_store(&self) -> RagResult<KeywordIndex> {
        let started = Instant::now();
        let mut index = KeywordIndex::from_config(&self.config);
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        let mut skipped = 0usize;

        loop {
            let page = self
                .store
                .scroll(page_token.as_deref(), self.config.scroll_batch_size)
                .await
                .map_err(RagError::VectorStore)?;
            pages += 1;

            for chunk in page.chunks {
                if chunk.text.is_empty() {
                    skipped += 1;
                    continue;
                }
                index.add_document(chunk);
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        index.build_vocabulary();

        if skipped > 0 {
            tracing::debug!("Skipped {} chunks with empty text", skipped);
        }
        tracing::info!(
            "Keyword index rebuilt: {} chunks from {} pages in {:?}",
            index.len(),
            pages,
            started.elapsed()
        );

        Ok(index)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::chunk::{Chunk, ChunkMetadata};
    use crate::knowledge::fusion::MatchSource;
    use crate::test_support::{
        seeded_store, CountingStore, FailingEmbedder, GatedStore, HashEmbedder,
    };

    fn corpus() -> Vec<Chunk> {
        let page = |p: u32| ChunkMetadata {
            title: "Handbook".into(),
            page: Some(p),
            ..Default::default()
        };
        vec![
            Chunk::new("d1", 0, "cats and dogs living together").with_metadata(page(1)),
            Chunk::new("d1", 1, "dogs only in this passage").with_metadata(page(2)),
            Chunk::new("d2", 0, "tokio runtime async executor").with_metadata(page(7)),
            Chunk::new("d2", 1, "zebra stripes pattern").with_metadata(page(9)),
            Chunk::new("d3", 0, "borrow checker lifetimes").with_metadata(page(3)),
        ]
    }

    async fn retriever_with(config: RetrievalConfig) -> (HybridRetriever, Arc<CountingStore>) {
        let store = Arc::new(CountingStore::new(seeded_store(&corpus()).await));
        let retriever = HybridRetriever::new(
            Arc::new(HashEmbedder::new(64)),
            Arc::clone(&store) as Arc<dyn VectorStore>,
            config,
        );
        (retriever, store)
    }

    #[tokio::test]
    async fn test_search_fuses_both_signals() {
        let (retriever, _) = retriever_with(RetrievalConfig::default()).await;

        let outcome = retriever.search(&SearchRequest::new("zebra")).await.unwrap();
        assert!(!outcome.results.is_empty());
        assert_eq!(outcome.results[0].chunk.key().to_string(), "d2#1");
        assert_eq!(outcome.results[0].source(), MatchSource::Both);

        let debug = &outcome.debug;
        assert_eq!(debug.fusion_method, FusionMethod::Rrf);
        assert_eq!(debug.rrf_k, Some(60.0));
        assert!(debug.dense_weight.is_none());
        assert_eq!(debug.keyword_count, 1);
        assert_eq!(debug.indexed_chunks, 5);
        assert!(debug.index_rebuilt);
        assert!(debug.fused_count <= 5);
    }

    #[tokio::test]
    async fn test_keyword_index_cached_until_cleared() {
        let (retriever, store) = retriever_with(RetrievalConfig::default()).await;

        let first = retriever.search(&SearchRequest::new("dogs")).await.unwrap();
        assert!(first.debug.index_rebuilt);
        assert_eq!(store.scroll_calls(), 1);

        let second = retriever.search(&SearchRequest::new("cats")).await.unwrap();
        assert!(!second.debug.index_rebuilt);
        assert_eq!(store.scroll_calls(), 1);

        // use_cache=false는 항상 재구축
        let forced = retriever
            .search(&SearchRequest::new("cats").without_cache())
            .await
            .unwrap();
        assert!(forced.debug.index_rebuilt);
        assert_eq!(store.scroll_calls(), 2);

        retriever.clear_index().await;
        let after_clear = retriever.search(&SearchRequest::new("cats")).await.unwrap();
        assert!(after_clear.debug.index_rebuilt);
        assert_eq!(after_clear.debug.index_version, 1);
        assert_eq!(store.scroll_calls(), 3);
    }

    #[tokio::test]
    async fn test_rebuild_paginates_store() {
        let config = RetrievalConfig {
            scroll_batch_size: 2,
            ..Default::default()
        };
        let (retriever, store) = retriever_with(config).await;

        assert_eq!(retriever.rebuild_index().await.unwrap(), 5);
        assert_eq!(store.scroll_calls(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_searches_rebuild_once() {
        let (retriever, store) = retriever_with(RetrievalConfig::default()).await;
        let retriever = Arc::new(retriever);

        let handles: Vec<_> = ["cats", "dogs", "tokio", "zebra"]
            .into_iter()
            .map(|q| {
                let retriever = Arc::clone(&retriever);
                tokio::spawn(async move { retriever.search(&SearchRequest::new(q)).await })
            })
            .collect();

        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.debug.indexed_chunks, 5);
        }
        assert_eq!(store.scroll_calls(), 1);
    }

    #[tokio::test]
    async fn test_filters_apply_to_dense_only_by_default() {
        let (retriever, _) = retriever_with(RetrievalConfig::default()).await;
        let filters: Vec<MetadataFilter> = vec!["page>=5".parse().unwrap()];

        let outcome = retriever
            .search(&SearchRequest::new("cats").with_filters(filters.clone()))
            .await
            .unwrap();

        // 키워드 전용 히트는 필터를 통과하지 않아도 남음
        let cats = outcome
            .results
            .iter()
            .find(|r| r.chunk.key().to_string() == "d1#0")
            .unwrap();
        assert_eq!(cats.source(), MatchSource::Keyword);
        assert!(outcome
            .results
            .iter()
            .filter(|r| r.dense_rank.is_some())
            .all(|r| r.chunk.metadata.page.unwrap_or(0) >= 5));
        assert!(!outcome.debug.keyword_filtered);
    }

    #[tokio::test]
    async fn test_keyword_filtering_flag() {
        let config = RetrievalConfig {
            filter_keyword_results: true,
            ..Default::default()
        };
        let (retriever, _) = retriever_with(config).await;
        let filters: Vec<MetadataFilter> = vec!["page>=5".parse().unwrap()];

        let outcome = retriever
            .search(&SearchRequest::new("cats").with_filters(filters))
            .await
            .unwrap();

        assert!(outcome.debug.keyword_filtered);
        assert_eq!(outcome.debug.keyword_count, 0);
        assert!(outcome
            .results
            .iter()
            .all(|r| r.chunk.metadata.page.unwrap_or(0) >= 5));
    }

    #[tokio::test]
    async fn test_request_overrides() {
        let (retriever, _) = retriever_with(RetrievalConfig::default()).await;

        let outcome = retriever
            .search(
                &SearchRequest::new("dogs")
                    .with_top_k(2)
                    .with_fusion(FusionMethod::Weighted),
            )
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.debug.final_top_k, 2);
        assert_eq!(outcome.debug.fusion_method, FusionMethod::Weighted);
        assert!(outcome.debug.rrf_k.is_none());
        assert_eq!(outcome.debug.dense_weight, Some(0.7));

        let err = retriever
            .search(&SearchRequest::new("dogs").with_top_k(0))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[tokio::test]
    async fn test_embedding_failure_propagates() {
        let store = Arc::new(seeded_store(&corpus()).await);
        let retriever = HybridRetriever::new(
            Arc::new(FailingEmbedder),
            store,
            RetrievalConfig::default(),
        );

        let err = retriever.search(&SearchRequest::new("cats")).await.unwrap_err();
        assert!(matches!(err, RagError::Embedding(_)));
    }

    #[tokio::test]
    async fn test_empty_store_is_not_an_error() {
        let store = Arc::new(seeded_store(&[]).await);
        let retriever = HybridRetriever::new(
            Arc::new(HashEmbedder::new(16)),
            store,
            RetrievalConfig::default(),
        );

        let outcome = retriever.search(&SearchRequest::new("anything")).await.unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.debug.indexed_chunks, 0);
    }

    #[tokio::test]
    async fn test_delete_document_invalidates_index() {
        let (retriever, store) = retriever_with(RetrievalConfig::default()).await;
        retriever.search(&SearchRequest::new("cats")).await.unwrap();

        assert_eq!(retriever.delete_document("d1").await.unwrap(), 2);
        let stats = retriever.stats().await.unwrap();
        assert_eq!(stats.chunk_count, 3);
        assert!(stats.indexed_chunks.is_none());

        let outcome = retriever.search(&SearchRequest::new("cats")).await.unwrap();
        assert!(outcome.results.iter().all(|r| r.chunk.document_id != "d1"));
        assert_eq!(store.scroll_calls(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_skips_empty_chunks() {
        let (plain, _) = retriever_with(RetrievalConfig::default()).await;

        let mut chunks = corpus();
        chunks.push(Chunk::new("d4", 0, ""));
        let padded = HybridRetriever::new(
            Arc::new(HashEmbedder::new(64)),
            Arc::new(seeded_store(&chunks).await),
            RetrievalConfig::default(),
        );

        assert_eq!(padded.store().count().await.unwrap(), 6);
        assert_eq!(padded.rebuild_index().await.unwrap(), 5);

        // 빈 청크가 N과 평균 길이에 들어가지 않으므로 BM25 점수가 같음
        let expected = plain.search(&SearchRequest::new("dogs")).await.unwrap();
        let actual = padded.search(&SearchRequest::new("dogs")).await.unwrap();
        let keyword_scores = |outcome: &SearchOutcome| {
            outcome
                .results
                .iter()
                .filter(|r| r.keyword_rank.is_some())
                .map(|r| (r.chunk.key().to_string(), r.keyword_score))
                .collect::<Vec<_>>()
        };
        assert_eq!(actual.debug.indexed_chunks, 5);
        assert_eq!(keyword_scores(&actual), keyword_scores(&expected));
    }

    #[tokio::test]
    async fn test_clear_during_rebuild_is_not_cached() {
        let store = Arc::new(GatedStore::new(seeded_store(&corpus()).await));
        let retriever = Arc::new(HybridRetriever::new(
            Arc::new(HashEmbedder::new(64)),
            Arc::clone(&store) as Arc<dyn VectorStore>,
            RetrievalConfig::default(),
        ));

        let search = tokio::spawn({
            let retriever = Arc::clone(&retriever);
            async move { retriever.search(&SearchRequest::new("zebra")).await }
        });

        // 재구축이 scroll에서 멈춘 사이 무효화
        store.wait_entered().await;
        retriever.clear_index().await;
        store.release();

        let outcome = search.await.unwrap().unwrap();
        assert!(outcome.debug.index_rebuilt);
        assert_eq!(outcome.debug.index_version, 0);
        assert_eq!(outcome.debug.keyword_count, 1);

        let stats = retriever.stats().await.unwrap();
        assert_eq!(stats.index_version, 1);
        assert!(stats.indexed_chunks.is_none());

        let next = retriever.search(&SearchRequest::new("zebra")).await.unwrap();
        assert!(next.debug.index_rebuilt);
        assert_eq!(next.debug.index_version, 1);

        let cached = retriever.search(&SearchRequest::new("zebra")).await.unwrap();
        assert!(!cached.debug.index_rebuilt);
    }
}
