//! 생성 모델 추상화
//!
//! 프롬프트 + 시스템 프롬프트를 받아 전체 응답 또는 텍스트 증분 스트림을 반환합니다.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// 텍스트 증분 스트림
///
/// 스트림을 드롭하면 하위 HTTP 요청도 함께 중단됩니다.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// 토큰 사용량
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// 블로킹 생성 결과
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

/// 생성 모델 프로바이더 트레이트
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// 전체 응답 생성
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<Generation>;

    /// 스트리밍 생성 (빈 증분은 내보내지 않음)
    async fn generate_stream(&self, prompt: &str, system_prompt: Option<&str>)
        -> Result<TokenStream>;

    /// 모델 이름
    fn model(&self) -> &str;
}
