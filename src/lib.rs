//! citerag - 하이브리드 검색 기반 인용 답변 엔진
//!
//! 벡터 검색(LanceDB)과 BM25 키워드 검색을 RRF 또는 가중합으로 통합하고,
//! 검색된 청크를 근거로 인용이 붙은 답변을 생성합니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod knowledge;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports
pub use config::{get_data_dir, FusionMethod, RetrievalConfig, Settings};
pub use embedding::{create_embedder, get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding};
pub use error::{RagError, RagResult};
pub use generation::{
    Answer, AnswerEvent, AnswerStream, Citation, DeepSeekClient, GenerationProvider, RagPipeline,
    StreamChunk,
};
pub use ingest::{IngestReport, Ingestor};
pub use knowledge::{
    Chunk, ChunkMetadata, FusedResult, HybridRetriever, KeywordIndex, LanceVectorStore,
    MetadataFilter, SearchOutcome, SearchRequest, VectorStore,
};
