//! 청크 타입
//!
//! 청크는 검색의 최소 단위이며 `(document_id, chunk_index)`가 두 검색 신호 사이의
//! 조인/중복 제거 키입니다. 청크 자체는 외부 저장소 소유이고 코어는 읽기만 합니다.

use serde::{Deserialize, Serialize};

// ============================================================================
// Types
// ============================================================================

/// 청크 식별 키
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub document_id: String,
    pub chunk_index: u32,
}

impl ChunkKey {
    pub fn new(document_id: impl Into<String>, chunk_index: u32) -> Self {
        Self {
            document_id: document_id.into(),
            chunk_index,
        }
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.document_id, self.chunk_index)
    }
}

/// 청크 메타데이터 (평면 구조)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// 문서 제목
    #[serde(default)]
    pub title: String,
    /// 저자
    #[serde(default)]
    pub author: String,
    /// 페이지 번호 (1부터 시작, 없으면 None)
    #[serde(default)]
    pub page: Option<u32>,
    /// 섹션 이름
    #[serde(default)]
    pub section: String,
    /// 자유 태그
    #[serde(default)]
    pub tags: Vec<String>,
    /// 원본 URL
    #[serde(default)]
    pub source_url: Option<String>,
}

/// 검색 가능한 텍스트 단위
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,
    pub chunk_index: u32,
    pub text: String,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(document_id: impl Into<String>, chunk_index: u32, text: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            chunk_index,
            text: text.into(),
            metadata: ChunkMetadata::default(),
        }
    }

    /// 메타데이터 지정 (빌더)
    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// 조인 키
    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.document_id.clone(), self.chunk_index)
    }
}

/// 벡터 검색 결과 (저장소 고유 스케일의 유사도, 높을수록 유사)
#[derive(Debug, Clone, PartialEq)]
pub struct DenseResult {
    pub chunk: Chunk,
    pub score: f32,
}
