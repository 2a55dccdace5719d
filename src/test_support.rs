//! 테스트용 대역 (임베딩, 벡터 저장소, 생성 모델)

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;

use crate::embedding::EmbeddingProvider;
use crate::generation::{Generation, GenerationProvider, TokenStream, TokenUsage};
use crate::knowledge::{
    tokenize, Chunk, DenseResult, MemoryVectorStore, MetadataFilter, ScrollPage, VectorEntry,
    VectorStore,
};

/// 테스트 임베딩 차원
pub const TEST_DIM: usize = 64;

// ============================================================================
// Embedders
// ============================================================================

/// 토큰 해시 버킷 임베딩 (결정적)
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() % self.dimension as u64) as usize] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash"
    }
}

/// 항상 실패하는 임베딩
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedding service unavailable")
    }

    fn dimension(&self) -> usize {
        TEST_DIM
    }

    fn name(&self) -> &str {
        "failing"
    }
}

// ============================================================================
// Stores
// ============================================================================

/// `HashEmbedder::new(TEST_DIM)`로 임베딩한 인메모리 저장소
pub async fn seeded_store(chunks: &[Chunk]) -> MemoryVectorStore {
    let embedder = HashEmbedder::new(TEST_DIM);
    let entries: Vec<VectorEntry> = chunks
        .iter()
        .map(|chunk| VectorEntry {
            embedding: embedder.vector(&chunk.text),
            chunk: chunk.clone(),
        })
        .collect();

    let store = MemoryVectorStore::new();
    store.upsert(&entries).await.unwrap();
    store
}

/// scroll 호출 횟수를 세는 저장소 래퍼
pub struct CountingStore {
    inner: MemoryVectorStore,
    scrolls: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: MemoryVectorStore) -> Self {
        Self {
            inner,
            scrolls: AtomicUsize::new(0),
        }
    }

    pub fn scroll_calls(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for CountingStore {
    fn name(&self) -> &str {
        "counting"
    }

    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        self.inner.upsert(entries).await
    }

    async fn query(
        &self,
        vector: &[f32],
        filters: &[MetadataFilter],
        limit: usize,
    ) -> Result<Vec<DenseResult>> {
        self.inner.query(vector, filters, limit).await
    }

    async fn scroll(&self, page_token: Option<&str>, limit: usize) -> Result<ScrollPage> {
        self.scrolls.fetch_add(1, Ordering::SeqCst);
        self.inner.scroll(page_token, limit).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        self.inner.delete_document(document_id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// 첫 scroll 호출에서 `release`까지 멈추는 저장소 래퍼
pub struct GatedStore {
    inner: MemoryVectorStore,
    gate_open: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl GatedStore {
    pub fn new(inner: MemoryVectorStore) -> Self {
        Self {
            inner,
            gate_open: AtomicBool::new(false),
            entered: Notify::new(),
            released: Notify::new(),
        }
    }

    /// 첫 scroll 진입 대기
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl VectorStore for GatedStore {
    fn name(&self) -> &str {
        "gated"
    }

    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        self.inner.upsert(entries).await
    }

    async fn query(
        &self,
        vector: &[f32],
        filters: &[MetadataFilter],
        limit: usize,
    ) -> Result<Vec<DenseResult>> {
        self.inner.query(vector, filters, limit).await
    }

    async fn scroll(&self, page_token: Option<&str>, limit: usize) -> Result<ScrollPage> {
        if !self.gate_open.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.released.notified().await;
        }
        self.inner.scroll(page_token, limit).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        self.inner.delete_document(document_id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

// ============================================================================
// Generator
// ============================================================================

/// 정해진 토큰을 돌려주는 생성 모델
pub struct ScriptedGenerator {
    tokens: Vec<String>,
    fail_after: Option<usize>,
    hang: bool,
    prompts: Mutex<Vec<(String, Option<String>)>>,
    upstream_dropped: Arc<AtomicBool>,
}

impl ScriptedGenerator {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            fail_after: None,
            hang: false,
            prompts: Mutex::new(Vec::new()),
            upstream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// n개 토큰 뒤 스트림 오류
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// 토큰을 모두 보낸 뒤 끝나지 않는 스트림
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// 스트림이 드롭되면 true
    pub fn upstream_dropped(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.upstream_dropped)
    }

    /// 받은 (프롬프트, 시스템 프롬프트) 기록
    pub fn prompts(&self) -> Vec<(String, Option<String>)> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn record(&self, prompt: &str, system_prompt: Option<&str>) {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((prompt.to_string(), system_prompt.map(str::to_string)));
        }
    }
}

/// 드롭 시 플래그를 세움
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<Generation> {
        self.record(prompt, system_prompt);
        let completion_tokens = self.tokens.len() as u32;
        Ok(Generation {
            text: self.tokens.concat(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens,
                total_tokens: 10 + completion_tokens,
            },
        })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<TokenStream> {
        self.record(prompt, system_prompt);

        let mut items: Vec<Result<String>> = self.tokens.iter().cloned().map(Ok).collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(anyhow::anyhow!("connection reset")));
        }

        let guard = DropFlag(Arc::clone(&self.upstream_dropped));
        let head = futures::stream::iter(items);
        let stream = if self.hang {
            head.chain(futures::stream::pending()).boxed()
        } else {
            head.boxed()
        };

        Ok(stream
            .map(move |item| {
                let _alive = &guard;
                item
            })
            .boxed())
    }

    fn model(&self) -> &str {
        "scripted"
    }
}
