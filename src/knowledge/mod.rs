//! Knowledge 모듈 - 하이브리드 검색
//!
//! - Vector: 벡터 저장소 트레이트 (LanceDB, 인메모리)
//! - Keyword: BM25 키워드 인덱스 (벡터 저장소에서 재구축되는 캐시)
//! - Fusion: RRF 또는 가중합으로 두 결과 통합
//! - Hybrid: 검색 조정자 (캐시 관리 + 병렬 검색 + 통합)

mod chunk;
mod filter;
mod fusion;
mod hybrid;
mod keyword;
mod lance;
mod memory;
mod vector;

// Re-exports
pub use chunk::{Chunk, ChunkKey, ChunkMetadata, DenseResult};
pub use filter::{matches_all, FilterValue, MetadataFilter, RangeBounds};
pub use fusion::{fuse, rrf_score, FusedResult, FusionParams, MatchSource};
pub use hybrid::{
    HybridRetriever, RetrieverStats, SearchDebugInfo, SearchOutcome, SearchRequest,
};
pub use keyword::{tokenize, CorpusStats, KeywordEntry, KeywordIndex, KeywordResult};
pub use lance::LanceVectorStore;
pub use memory::MemoryVectorStore;
pub use vector::{chunk_text, cosine_similarity, ScrollPage, VectorEntry, VectorStore};
