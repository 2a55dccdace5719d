//! BM25 키워드 인덱스
//!
//! 청크 단위 텍스트에 대한 인메모리 BM25 랭킹 구조입니다.
//! 역색인 없이 쿼리마다 전체 엔트리를 선형 스캔합니다.
//!
//! ref: https://en.wikipedia.org/wiki/Okapi_BM25
//!
//! - idf(t) = ln((N - df + 0.5) / (df + 0.5) + 1)
//! - tf 성분 = tf·(k1+1) / (tf + k1·(1 - b + b·(docLen/avgDocLen)))
//!
//! idf는 클램핑하지 않습니다.

use std::collections::HashMap;

use crate::config::RetrievalConfig;

use super::chunk::{Chunk, ChunkKey};

// ============================================================================
// Tokenizer
// ============================================================================

/// 토큰화: 소문자 변환 후 영숫자 연속 구간을 토큰으로 사용 (어간 추출 없음)
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Types
// ============================================================================

/// 인덱스에 저장된 청크 레코드
///
/// 생성 후 변경되지 않으며 `clear`로만 제거됩니다.
#[derive(Debug, Clone)]
pub struct KeywordEntry {
    pub chunk: Chunk,
    tokens: Vec<String>,
    term_freq: HashMap<String, u32>,
}

impl KeywordEntry {
    fn new(chunk: Chunk) -> Self {
        let tokens = tokenize(&chunk.text);
        let mut term_freq: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *term_freq.entry(token.clone()).or_insert(0) += 1;
        }
        Self {
            chunk,
            tokens,
            term_freq,
        }
    }

    /// 토큰 수 (문서 길이)
    pub fn length(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn term_frequency(&self, term: &str) -> u32 {
        self.term_freq.get(term).copied().unwrap_or(0)
    }
}

/// 키워드 검색 결과
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordResult {
    pub chunk: Chunk,
    pub score: f32,
}

/// 코퍼스 통계
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorpusStats {
    pub total_docs: usize,
    pub avg_doc_length: f64,
}

// ============================================================================
// KeywordIndex
// ============================================================================

/// BM25 인덱스
///
/// `add_document` 후에는 통계가 stale 상태가 되며, `build_vocabulary`로 갱신합니다.
/// 검색 시 stale이면 최신 통계를 계산해 사용합니다.
#[derive(Debug, Clone)]
pub struct KeywordIndex {
    k1: f64,
    b: f64,
    entries: Vec<KeywordEntry>,
    positions: HashMap<ChunkKey, usize>,
    doc_freq: HashMap<String, usize>,
    stats: Option<CorpusStats>,
    dirty: bool,
}

impl KeywordIndex {
    /// 새 인덱스 생성
    ///
    /// # Arguments
    /// * `k1` - term frequency 포화 계수
    /// * `b` - 문서 길이 정규화 계수
    pub fn new(k1: f32, b: f32) -> Self {
        Self {
            k1: f64::from(k1),
            b: f64::from(b),
            entries: Vec::new(),
            positions: HashMap::new(),
            doc_freq: HashMap::new(),
            stats: None,
            dirty: false,
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(config.bm25_k1, config.bm25_b)
    }

    /// 청크 추가
    ///
    /// 같은 키가 이미 있으면 해당 위치의 엔트리를 교체하고 문서 빈도를 보정합니다.
    pub fn add_document(&mut self, chunk: Chunk) {
        let key = chunk.key();
        let entry = KeywordEntry::new(chunk);

        for term in entry.term_freq.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }

        match self.positions.get(&key) {
            Some(&pos) => {
                let old = std::mem::replace(&mut self.entries[pos], entry);
                for term in old.term_freq.keys() {
                    if let Some(df) = self.doc_freq.get_mut(term) {
                        *df -= 1;
                        if *df == 0 {
                            self.doc_freq.remove(term);
                        }
                    }
                }
            }
            None => {
                self.positions.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }

        self.dirty = true;
    }

    /// 코퍼스 통계 재계산 (평균 문서 길이, 전체 문서 수)
    ///
    /// 빈 코퍼스에서는 아무것도 하지 않습니다.
    pub fn build_vocabulary(&mut self) {
        let Some(stats) = self.compute_stats() else {
            return;
        };

        self.stats = Some(stats);
        self.dirty = false;

        tracing::debug!(
            "BM25 vocabulary built: {} documents, avg length {:.2}",
            stats.total_docs,
            stats.avg_doc_length
        );
    }

    /// BM25 검색
    ///
    /// 쿼리 토큰이 없으면 빈 결과를 반환합니다. 점수가 0 이하인 문서는 제외하며,
    /// 동점은 삽입 순서를 유지합니다.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<KeywordResult> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || top_k == 0 {
            return vec![];
        }

        let stats = match (self.dirty, self.stats) {
            (false, Some(stats)) => stats,
            _ => match self.compute_stats() {
                Some(stats) => stats,
                None => return vec![],
            },
        };

        let mut scored: Vec<(usize, f64)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                let score = self.score(&query_tokens, entry, &stats);
                (score > 0.0).then_some((i, score))
            })
            .collect();

        // 안정 정렬: 동점은 삽입 순서 유지
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        scored
            .into_iter()
            .map(|(i, score)| KeywordResult {
                chunk: self.entries[i].chunk.clone(),
                score: score as f32,
            })
            .collect()
    }

    /// 모든 엔트리와 통계 초기화
    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
        self.doc_freq.clear();
        self.stats = None;
        self.dirty = false;
    }

    /// 용어의 idf (문서 빈도 0이면 None)
    pub fn idf(&self, term: &str, stats: &CorpusStats) -> Option<f64> {
        let df = *self.doc_freq.get(term)? as f64;
        let n = stats.total_docs as f64;
        Some(((n - df + 0.5) / (df + 0.5) + 1.0).ln())
    }

    /// 용어를 포함한 문서 수
    pub fn document_frequency(&self, term: &str) -> usize {
        self.doc_freq.get(term).copied().unwrap_or(0)
    }

    /// 마지막으로 빌드된 통계
    pub fn stats(&self) -> Option<CorpusStats> {
        self.stats
    }

    /// 통계 갱신 필요 여부
    pub fn is_stale(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[KeywordEntry] {
        &self.entries
    }

    fn compute_stats(&self) -> Option<CorpusStats> {
        if self.entries.is_empty() {
            return None;
        }
        let total_length: usize = self.entries.iter().map(KeywordEntry::length).sum();
        Some(CorpusStats {
            total_docs: self.entries.len(),
            avg_doc_length: total_length as f64 / self.entries.len() as f64,
        })
    }

    fn score(&self, query_tokens: &[String], entry: &KeywordEntry, stats: &CorpusStats) -> f64 {
        // 모든 문서의 토큰이 0개면 길이 비율을 정의할 수 없음
        if stats.avg_doc_length <= 0.0 {
            return 0.0;
        }

        let length_ratio = entry.length() as f64 / stats.avg_doc_length;
        let mut score = 0.0;

        for term in query_tokens {
            let tf = entry.term_frequency(term);
            if tf == 0 {
                continue;
            }
            let Some(idf) = self.idf(term, stats) else {
                continue;
            };

            let tf = f64::from(tf);
            let tf_component =
                (tf * (self.k1 + 1.0)) / (tf + self.k1 * (1.0 - self.b + self.b * length_ratio));
            score += idf * tf_component;
        }

        score
    }
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
