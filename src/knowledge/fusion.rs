//! 결과 통합 (Fusion)
//!
//! 벡터 검색 순위 목록과 BM25 순위 목록을 `(document_id, chunk_index)` 키로 조인해
//! 하나의 순위 목록으로 합칩니다.
//!
//! - RRF: `1/(k + rank_dense) + 1/(k + rank_keyword)` (rank는 1부터, 없으면 항 생략)
//!   ref: https://www.elastic.co/blog/hybrid-search-rrf
//! - Weighted: 각 점수를 통합 집합 내 최대값으로 나눈 뒤 가중합
//!
//! 동점은 벡터 결과가 먼저 삽입되므로 벡터 순서가 우선합니다 (안정 정렬).

use std::collections::HashMap;

use serde::Serialize;

use crate::config::{FusionMethod, RetrievalConfig};

use super::chunk::{Chunk, ChunkKey, DenseResult};
use super::keyword::KeywordResult;

// ============================================================================
// Types
// ============================================================================

/// 결과를 반환한 검색 신호
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    /// 벡터 검색만
    Dense,
    /// BM25 키워드 검색만
    Keyword,
    /// 두 검색 모두
    Both,
}

impl MatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchSource::Dense => "dense",
            MatchSource::Keyword => "keyword",
            MatchSource::Both => "both",
        }
    }
}

/// 통합 결과
///
/// 신호가 해당 청크를 반환하지 않았다면 그 점수는 0, 순위는 None입니다.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub chunk: Chunk,
    pub dense_score: f32,
    pub keyword_score: f32,
    pub fused_score: f32,
    /// 벡터 결과 내 순위 (1부터)
    pub dense_rank: Option<usize>,
    /// 키워드 결과 내 순위 (1부터)
    pub keyword_rank: Option<usize>,
}

impl FusedResult {
    pub fn source(&self) -> MatchSource {
        match (self.dense_rank.is_some(), self.keyword_rank.is_some()) {
            (true, true) => MatchSource::Both,
            (false, true) => MatchSource::Keyword,
            _ => MatchSource::Dense,
        }
    }
}

/// 통합 파라미터
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    pub method: FusionMethod,
    pub rrf_k: f32,
    pub dense_weight: f32,
    pub keyword_weight: f32,
}

impl FusionParams {
    /// 설정값에서 생성 (요청 단위로 방식만 바꿀 수 있음)
    pub fn from_config(config: &RetrievalConfig, method: Option<FusionMethod>) -> Self {
        Self {
            method: method.unwrap_or(config.fusion_method),
            rrf_k: config.rrf_k,
            dense_weight: config.dense_weight,
            keyword_weight: config.keyword_weight,
        }
    }
}

impl Default for FusionParams {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default(), None)
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// 두 순위 목록을 통합
///
/// 같은 목록 안에서 키가 중복되면 첫 번째 항목만 사용합니다.
/// 키워드 결과는 점수가 항상 양수이고, 벡터 결과는 점수가 0이어도 순위로 참여하므로
/// 제외하지 않습니다.
///
/// # Arguments
/// * `dense` - 벡터 검색 결과 (순위순)
/// * `keyword` - BM25 결과 (순위순)
/// * `params` - 통합 방식과 상수
/// * `final_top_k` - 반환할 최대 결과 수
pub fn fuse(
    dense: &[DenseResult],
    keyword: &[KeywordResult],
    params: &FusionParams,
    final_top_k: usize,
) -> Vec<FusedResult> {
    // 삽입 순서를 보존하는 키 → 위치 맵
    let mut merged: Vec<FusedResult> = Vec::with_capacity(dense.len() + keyword.len());
    let mut positions: HashMap<ChunkKey, usize> = HashMap::new();

    for (i, result) in dense.iter().enumerate() {
        let key = result.chunk.key();
        if positions.contains_key(&key) {
            continue;
        }
        positions.insert(key, merged.len());
        merged.push(FusedResult {
            chunk: result.chunk.clone(),
            dense_score: result.score,
            keyword_score: 0.0,
            fused_score: 0.0,
            dense_rank: Some(i + 1),
            keyword_rank: None,
        });
    }

    for (i, result) in keyword.iter().enumerate() {
        let key = result.chunk.key();
        match positions.get(&key) {
            Some(&pos) => {
                let entry = &mut merged[pos];
                if entry.keyword_rank.is_none() {
                    entry.keyword_score = result.score;
                    entry.keyword_rank = Some(i + 1);
                }
            }
            None => {
                positions.insert(key, merged.len());
                merged.push(FusedResult {
                    chunk: result.chunk.clone(),
                    dense_score: 0.0,
                    keyword_score: result.score,
                    fused_score: 0.0,
                    dense_rank: None,
                    keyword_rank: Some(i + 1),
                });
            }
        }
    }

    match params.method {
        FusionMethod::Rrf => apply_rrf(&mut merged, params.rrf_k),
        FusionMethod::Weighted => {
            apply_weighted(&mut merged, params.dense_weight, params.keyword_weight)
        }
    }

    merged.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(final_top_k);

    merged
}

/// RRF 점수 (rank는 1부터)
pub fn rrf_score(k: f32, rank: usize) -> f32 {
    1.0 / (k + rank as f32)
}

fn apply_rrf(results: &mut [FusedResult], k: f32) {
    for result in results {
        result.fused_score = result.dense_rank.map_or(0.0, |r| rrf_score(k, r))
            + result.keyword_rank.map_or(0.0, |r| rrf_score(k, r));
    }
}

fn apply_weighted(results: &mut [FusedResult], dense_weight: f32, keyword_weight: f32) {
    let max_dense = results.iter().map(|r| r.dense_score).fold(f32::MIN, f32::max);
    let max_keyword = results.iter().map(|r| r.keyword_score).fold(f32::MIN, f32::max);

    let normalize = |score: f32, max: f32| if max > 0.0 { score / max } else { 0.0 };

    for result in results {
        result.fused_score = dense_weight * normalize(result.dense_score, max_dense)
            + keyword_weight * normalize(result.keyword_score, max_keyword);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(doc: &str, idx: u32, score: f32) -> DenseResult {
        DenseResult {
            chunk: Chunk::new(doc, idx, format!("{doc} {idx}")),
            score,
        }
    }

    fn keyword(doc: &str, idx: u32, score: f32) -> KeywordResult {
        KeywordResult {
            chunk: Chunk::new(doc, idx, format!("{doc} {idx}")),
            score,
        }
    }

    fn params(method: FusionMethod) -> FusionParams {
        FusionParams {
            method,
            ..FusionParams::default()
        }
    }

    #[test]
    fn test_rrf_scenario() {
        let results = fuse(
            &[dense("d1", 0, 0.9)],
            &[keyword("d1", 0, 3.2), keyword("d2", 0, 1.1)],
            &params(FusionMethod::Rrf),
            10,
        );

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.key(), ChunkKey::new("d1", 0));
        assert!((results[0].fused_score - 0.03279).abs() < 1e-5);
        assert_eq!(results[0].source(), MatchSource::Both);
        assert_eq!(results[0].keyword_score, 3.2);

        assert_eq!(results[1].chunk.key(), ChunkKey::new("d2", 0));
        assert!((results[1].fused_score - 0.01613).abs() < 1e-5);
        assert_eq!(results[1].dense_score, 0.0);
        assert_eq!(results[1].source(), MatchSource::Keyword);
    }

    #[test]
    fn test_rrf_both_lists_beats_either_term() {
        let k = 60.0;
        let both = rrf_score(k, 3) + rrf_score(k, 7);
        assert!(both > rrf_score(k, 3));
        assert!(both > rrf_score(k, 7));
    }

    #[test]
    fn test_dedup_with_duplicate_keys() {
        let results = fuse(
            &[dense("a", 0, 0.9), dense("a", 0, 0.5), dense("b", 0, 0.4)],
            &[keyword("b", 0, 2.0), keyword("a", 0, 1.0), keyword("b", 0, 0.5)],
            &params(FusionMethod::Rrf),
            10,
        );

        assert_eq!(results.len(), 2);
        let a = results.iter().find(|r| r.chunk.document_id == "a").unwrap();
        assert_eq!(a.dense_score, 0.9);
        assert_eq!(a.dense_rank, Some(1));
        assert_eq!(a.keyword_rank, Some(2));

        let b = results.iter().find(|r| r.chunk.document_id == "b").unwrap();
        assert_eq!(b.keyword_score, 2.0);
        assert_eq!(b.keyword_rank, Some(1));
    }

    #[test]
    fn test_weighted_scale_invariance() {
        let keyword_hits = [keyword("b", 0, 4.0), keyword("c", 0, 2.0)];
        let base = fuse(
            &[dense("a", 0, 0.8), dense("b", 0, 0.4)],
            &keyword_hits,
            &params(FusionMethod::Weighted),
            10,
        );
        let scaled = fuse(
            &[dense("a", 0, 80.0), dense("b", 0, 40.0)],
            &keyword_hits,
            &params(FusionMethod::Weighted),
            10,
        );

        assert_eq!(base.len(), scaled.len());
        for (x, y) in base.iter().zip(scaled.iter()) {
            assert_eq!(x.chunk.key(), y.chunk.key());
            assert!((x.fused_score - y.fused_score).abs() < 1e-6);
        }
    }

    #[test]
    fn test_weighted_uses_raw_weights() {
        let p = FusionParams {
            method: FusionMethod::Weighted,
            dense_weight: 2.0,
            keyword_weight: 1.0,
            ..FusionParams::default()
        };
        let results = fuse(&[dense("a", 0, 0.5)], &[keyword("a", 0, 3.0)], &p, 10);

        // 정규화 후 둘 다 1.0 → 2.0 + 1.0 (가중치 재정규화 없음)
        assert!((results[0].fused_score - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_non_positive_max_zeroes_component() {
        let results = fuse(
            &[dense("a", 0, -0.2), dense("b", 0, -0.5)],
            &[keyword("a", 0, 1.0)],
            &params(FusionMethod::Weighted),
            10,
        );

        let b = results.iter().find(|r| r.chunk.document_id == "b").unwrap();
        assert_eq!(b.fused_score, 0.0);
        assert!((results[0].fused_score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_zero_score_dense_hit_is_kept() {
        let dense_hits = [dense("a", 0, 0.4), dense("b", 0, 0.0)];

        let results = fuse(&dense_hits, &[], &params(FusionMethod::Rrf), 10);
        assert_eq!(results.len(), 2);
        let b = &results[1];
        assert_eq!(b.chunk.document_id, "b");
        assert_eq!((b.dense_score, b.keyword_score), (0.0, 0.0));
        assert_eq!(b.dense_rank, Some(2));
        assert!((b.fused_score - rrf_score(60.0, 2)).abs() < 1e-9);

        let results = fuse(&dense_hits, &[], &params(FusionMethod::Weighted), 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].source(), MatchSource::Dense);
        assert_eq!(results[1].fused_score, 0.0);
    }

    #[test]
    fn test_ties_keep_dense_order() {
        // 같은 순위 → 같은 RRF 점수, 벡터 결과가 먼저
        let results = fuse(
            &[dense("dense-only", 0, 0.5)],
            &[keyword("kw-only", 0, 9.0)],
            &params(FusionMethod::Rrf),
            10,
        );
        assert_eq!(results[0].fused_score, results[1].fused_score);
        assert_eq!(results[0].chunk.document_id, "dense-only");
        assert_eq!(results[1].chunk.document_id, "kw-only");
    }

    #[test]
    fn test_truncates_to_final_top_k() {
        let results = fuse(
            &[dense("a", 0, 0.9), dense("b", 0, 0.8), dense("c", 0, 0.7)],
            &[keyword("d", 0, 1.0)],
            &params(FusionMethod::Rrf),
            2,
        );
        assert_eq!(results.len(), 2);
        assert!(fuse(&[], &[], &params(FusionMethod::Weighted), 5).is_empty());
    }
}
