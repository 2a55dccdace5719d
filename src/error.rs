//! 에러 타입
//!
//! 외부 기능(임베딩, 벡터 저장소, 생성 모델) 호출은 `anyhow`로 문맥을 붙여 올리고,
//! 검색/답변 코어는 호출자가 실패 종류를 구분할 수 있도록 `RagError`로 감쌉니다.
//!
//! 빈 검색 결과와 아직 빌드되지 않은 키워드 인덱스는 에러가 아닙니다.

use thiserror::Error;

/// 코어 에러
#[derive(Debug, Error)]
pub enum RagError {
    /// 설정 검증 실패
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 지원하지 않는 필터 연산자 또는 값
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// 임베딩 호출 실패
    #[error("embedding request failed")]
    Embedding(#[source] anyhow::Error),

    /// 벡터 저장소 호출 실패
    #[error("vector store request failed")]
    VectorStore(#[source] anyhow::Error),

    /// 생성 모델 호출 실패
    #[error("generation request failed")]
    Generation(#[source] anyhow::Error),
}

pub type RagResult<T> = std::result::Result<T, RagError>;
