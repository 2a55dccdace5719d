//! 설정 모듈
//!
//! 기본값 → `<data_dir>/config.toml` → `./citerag.toml` → `CITERAG_*` 환경변수 순으로
//! 병합합니다. 중첩 키는 `__`로 구분합니다 (예: `CITERAG_RETRIEVAL__FUSION_METHOD=weighted`).
//!
//! API 키는 설정 파일에 두지 않고 환경변수에서만 읽습니다.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, RagResult};

/// 환경변수 접두사
const ENV_PREFIX: &str = "CITERAG_";

/// 작업 디렉토리 설정 파일 이름
const LOCAL_CONFIG_FILE: &str = "citerag.toml";

// ============================================================================
// Data Directory
// ============================================================================

/// 기본 데이터 디렉토리 경로 (~/.citerag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".citerag")
}

// ============================================================================
// Fusion Method
// ============================================================================

/// 결과 통합 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    /// Reciprocal Rank Fusion (순위 기반)
    #[default]
    Rrf,
    /// 최대값 정규화 후 가중합 (점수 기반)
    Weighted,
}

impl FusionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionMethod::Rrf => "rrf",
            FusionMethod::Weighted => "weighted",
        }
    }
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionMethod {
    type Err = RagError;

    fn from_str(s: &str) -> RagResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rrf" => Ok(FusionMethod::Rrf),
            "weighted" => Ok(FusionMethod::Weighted),
            other => Err(RagError::Config(format!(
                "unknown fusion method '{}' (expected 'rrf' or 'weighted')",
                other
            ))),
        }
    }
}

// ============================================================================
// Retrieval Config
// ============================================================================

/// 하이브리드 검색 파라미터
///
/// 프로세스 단위로 고정되며, 로드 시 `validate`로 검증됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// 벡터 검색 후보 수
    pub top_k_dense: usize,
    /// BM25 검색 후보 수
    pub top_k_keyword: usize,
    /// 통합 후 최종 결과 수
    pub final_top_k: usize,
    /// 통합 방식
    pub fusion_method: FusionMethod,
    /// RRF 상수 k
    pub rrf_k: f32,
    /// 벡터 점수 가중치 (weighted 전용)
    pub dense_weight: f32,
    /// 키워드 점수 가중치 (weighted 전용)
    pub keyword_weight: f32,
    /// BM25 term frequency 포화 계수
    pub bm25_k1: f32,
    /// BM25 문서 길이 정규화 계수
    pub bm25_b: f32,
    /// 키워드 전용 히트에도 메타데이터 필터 적용 여부
    ///
    /// 기본값(false)에서는 필터가 벡터 검색에만 적용됩니다.
    pub filter_keyword_results: bool,
    /// 키워드 인덱스 재구축 시 스크롤 페이지 크기
    pub scroll_batch_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_dense: 10,
            top_k_keyword: 10,
            final_top_k: 5,
            fusion_method: FusionMethod::Rrf,
            rrf_k: 60.0,
            dense_weight: 0.7,
            keyword_weight: 0.3,
            bm25_k1: 1.5,
            bm25_b: 0.75,
            filter_keyword_results: false,
            scroll_batch_size: 100,
        }
    }
}

impl RetrievalConfig {
    /// 파라미터 검증
    ///
    /// 가중치 합이 1일 필요는 없습니다.
    pub fn validate(&self) -> RagResult<()> {
        let counts = [
            ("top_k_dense", self.top_k_dense),
            ("top_k_keyword", self.top_k_keyword),
            ("final_top_k", self.final_top_k),
            ("scroll_batch_size", self.scroll_batch_size),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(RagError::Config(format!("{} must be at least 1", name)));
            }
        }

        if !self.rrf_k.is_finite() || self.rrf_k <= 0.0 {
            return Err(RagError::Config(format!(
                "rrf_k must be a positive number, got {}",
                self.rrf_k
            )));
        }

        for (name, weight) in [
            ("dense_weight", self.dense_weight),
            ("keyword_weight", self.keyword_weight),
            ("bm25_k1", self.bm25_k1),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RagError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, weight
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.bm25_b) {
            return Err(RagError::Config(format!(
                "bm25_b must be within [0, 1], got {}",
                self.bm25_b
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Provider Settings
// ============================================================================

/// 임베딩 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Google Gemini 임베딩 API
    Gemini,
    /// `{"texts": [...]}` → `{"embeddings": [...]}` 형식의 HTTP 임베딩 서버
    Http,
}

/// 임베딩 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,
    pub model: String,
    pub dimension: usize,
    /// HTTP 백엔드 엔드포인트
    pub api_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Gemini,
            model: "gemini-embedding-001".to_string(),
            dimension: 768,
            api_url: None,
            timeout_secs: 30,
        }
    }
}

/// 생성 모델 설정 (OpenAI 호환 chat completions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            temperature: None,
            max_tokens: None,
            timeout_secs: 120,
        }
    }
}

/// 수집(ingest) 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// 청크 당 단어 수
    pub chunk_words: usize,
    /// 청크 간 중첩 단어 수
    pub overlap_words: usize,
    /// 임베딩 배치 크기
    pub embed_batch_size: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            chunk_words: 200,
            overlap_words: 30,
            embed_batch_size: 32,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 데이터 디렉토리 (없으면 ~/.citerag/)
    pub data_dir: Option<PathBuf>,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingSettings,
    pub generation: GenerationSettings,
    pub ingest: IngestSettings,
}

impl Settings {
    /// 기본 위치에서 설정 로드
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment(&get_data_dir()))
    }

    /// 병합 순서가 적용된 Figment 생성
    ///
    /// # Arguments
    /// * `data_dir` - `config.toml`을 찾을 디렉토리
    pub fn figment(data_dir: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(data_dir.join("config.toml")))
            .merge(Toml::file(LOCAL_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Figment에서 추출 후 검증
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let settings: Settings = figment
            .extract()
            .context("Failed to load configuration")?;
        settings.validate()?;

        tracing::debug!(
            "Loaded settings: fusion={}, final_top_k={}",
            settings.retrieval.fusion_method,
            settings.retrieval.final_top_k
        );
        Ok(settings)
    }

    /// 전체 설정 검증
    pub fn validate(&self) -> RagResult<()> {
        self.retrieval.validate()?;

        if self.embedding.dimension == 0 {
            return Err(RagError::Config("embedding.dimension must be at least 1".into()));
        }
        if self.embedding.backend == EmbeddingBackend::Http && self.embedding.api_url.is_none() {
            return Err(RagError::Config(
                "embedding.api_url is required for the http backend".into(),
            ));
        }
        if self.ingest.chunk_words == 0 || self.ingest.overlap_words >= self.ingest.chunk_words {
            return Err(RagError::Config(
                "ingest.overlap_words must be smaller than ingest.chunk_words".into(),
            ));
        }
        if self.ingest.embed_batch_size == 0 {
            return Err(RagError::Config("ingest.embed_batch_size must be at least 1".into()));
        }

        Ok(())
    }

    /// 실제 사용할 데이터 디렉토리
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(get_data_dir)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Result<Settings> {
        Settings::from_figment(
            Figment::from(Serialized::defaults(Settings::default())).merge(Toml::string(toml)),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RetrievalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fusion_method, FusionMethod::Rrf);
        assert_eq!(config.rrf_k, 60.0);
        assert!((config.dense_weight - 0.7).abs() < f32::EPSILON);
        assert!((config.keyword_weight - 0.3).abs() < f32::EPSILON);
        assert!(!config.filter_keyword_results);
    }

    #[test]
    fn test_toml_overrides_merge_over_defaults() {
        let settings = from_toml(
            r#"
            [retrieval]
            fusion_method = "weighted"
            dense_weight = 2.0
            keyword_weight = 1.0
            final_top_k = 3
            "#,
        )
        .unwrap();

        assert_eq!(settings.retrieval.fusion_method, FusionMethod::Weighted);
        assert_eq!(settings.retrieval.final_top_k, 3);
        // 가중치 합이 1이 아니어도 허용
        assert_eq!(settings.retrieval.dense_weight, 2.0);
        // 지정하지 않은 값은 기본값 유지
        assert_eq!(settings.retrieval.top_k_dense, 10);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(from_toml("[retrieval]\nrrf_k = 0.0").is_err());
        assert!(from_toml("[retrieval]\nfinal_top_k = 0").is_err());
        assert!(from_toml("[retrieval]\nbm25_b = 1.5").is_err());
        assert!(from_toml("[retrieval]\ndense_weight = -0.1").is_err());
        assert!(from_toml("[retrieval]\nfusion_method = \"max\"").is_err());
    }

    #[test]
    fn test_http_backend_requires_url() {
        let err = from_toml("[embedding]\nbackend = \"http\"").unwrap_err();
        assert!(format!("{:#}", err).contains("api_url"));

        let ok = from_toml(
            "[embedding]\nbackend = \"http\"\napi_url = \"http://localhost:8080/embed\"",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_fusion_method_parse() {
        assert_eq!("RRF".parse::<FusionMethod>().unwrap(), FusionMethod::Rrf);
        assert_eq!(
            " weighted ".parse::<FusionMethod>().unwrap(),
            FusionMethod::Weighted
        );
        assert!("sum".parse::<FusionMethod>().is_err());
        assert_eq!(FusionMethod::Weighted.to_string(), "weighted");
    }
}
