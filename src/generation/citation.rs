//! 인용 (Citation)
//!
//! 인용 목록은 생성된 답변이 실제로 언급한 청크가 아니라 모델에 제공된 컨텍스트를
//! 검색 순서대로 나타냅니다.

use serde::{Deserialize, Serialize};

use crate::knowledge::Chunk;

/// 인용 발췌 최대 길이 (문자 수)
pub const EXCERPT_CHARS: usize = 200;

/// 제목이 없을 때 사용하는 이름
const UNKNOWN_TITLE: &str = "Unknown";

/// 답변에 붙는 인용 (1부터 번호)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub index: usize,
    pub document_title: String,
    pub page: Option<u32>,
    pub section: String,
    /// 청크 앞부분 발췌
    pub excerpt: String,
}

impl Citation {
    /// # Arguments
    /// * `index` - 1부터 시작하는 인용 번호
    /// * `chunk` - 컨텍스트로 제공된 청크
    pub fn from_chunk(index: usize, chunk: &Chunk) -> Self {
        let meta = &chunk.metadata;
        Self {
            index,
            document_title: display_title(&meta.title).to_string(),
            page: meta.page,
            section: meta.section.clone(),
            excerpt: excerpt(&chunk.text, EXCERPT_CHARS),
        }
    }
}

/// 검색 순서대로 1..N 인용 생성
pub fn build_citations<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Vec<Citation> {
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Citation::from_chunk(i + 1, chunk))
        .collect()
}

/// 빈 제목은 "Unknown"
pub(crate) fn display_title(title: &str) -> &str {
    if title.trim().is_empty() {
        UNKNOWN_TITLE
    } else {
        title
    }
}

/// 문자 경계를 지키며 앞에서 `max_chars`자까지 자름
fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
