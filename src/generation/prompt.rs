//! 프롬프트 템플릿 관리
//!
//! 템플릿은 `{context}`, `{query}` 자리표시자를 사용합니다.

use std::collections::HashMap;

use crate::knowledge::Chunk;

use super::citation::display_title;

/// 시스템 프롬프트 템플릿 이름
pub const RAG_SYSTEM: &str = "rag_system";
/// 사용자 프롬프트 템플릿 이름
pub const RAG_USER: &str = "rag_user";
/// 검색어 개선 템플릿 이름
pub const SEARCH_REFINEMENT: &str = "search_refinement";

/// 컨텍스트가 부족할 때의 고정 답변
pub const FALLBACK_ANSWER: &str =
    "I don't have enough information in the provided documents to answer this question.";

const RAG_SYSTEM_PROMPT: &str = "You are a knowledgeable assistant that answers questions based strictly on the provided context documents.

Rules:
1. ONLY use information from the provided context to answer the question.
2. For every claim you make, add a citation footnote in the format [doc_title, page X].
3. If the context does not contain enough information, say \"I don't have enough information in the provided documents to answer this question.\"
4. Be concise and accurate.
5. Support both Arabic and English questions and answers.";

const RAG_USER_TEMPLATE: &str = "Context Documents:
{context}

---

Question: {query}

Provide a detailed answer with inline citation footnotes [doc_title, page X] for every claim.";

const SEARCH_REFINEMENT_TEMPLATE: &str = "Based on the user query below, generate an improved search query that would better retrieve relevant documents.

Original query: {query}

Improved search query:";

/// 청크 구분자
const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// 프롬프트 템플릿 저장소
#[derive(Debug, Clone)]
pub struct PromptManager {
    templates: HashMap<String, String>,
}

impl Default for PromptManager {
    fn default() -> Self {
        let templates = [
            (RAG_SYSTEM, RAG_SYSTEM_PROMPT),
            (RAG_USER, RAG_USER_TEMPLATE),
            (SEARCH_REFINEMENT, SEARCH_REFINEMENT_TEMPLATE),
        ]
        .into_iter()
        .map(|(name, template)| (name.to_string(), template.to_string()))
        .collect();

        Self { templates }
    }
}

impl PromptManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system_prompt(&self) -> &str {
        self.template(RAG_SYSTEM).unwrap_or(RAG_SYSTEM_PROMPT)
    }

    /// 검색된 청크를 컨텍스트로 넣은 사용자 프롬프트
    pub fn format_rag_prompt(&self, query: &str, chunks: &[Chunk]) -> String {
        let template = self.template(RAG_USER).unwrap_or(RAG_USER_TEMPLATE);
        fill(template, &format_context(chunks), query)
    }

    pub fn format_search_refinement(&self, query: &str) -> String {
        let template = self
            .template(SEARCH_REFINEMENT)
            .unwrap_or(SEARCH_REFINEMENT_TEMPLATE);
        fill(template, "", query)
    }

    /// 템플릿 등록 (같은 이름이면 교체)
    pub fn register_template(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.templates.insert(name.into(), template.into());
    }

    pub fn template(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(String::as_str)
    }
}

/// `{context}`와 `{query}`를 한 번에 치환 (삽입된 텍스트는 다시 검사하지 않음)
fn fill(template: &str, context: &str, query: &str) -> String {
    let mut out = String::with_capacity(template.len() + context.len() + query.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix("{context}") {
            out.push_str(context);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{query}") {
            out.push_str(query);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    out
}

/// `[Source: title, Page N, Section: S]` 헤더를 붙여 청크를 이어붙임
pub fn format_context(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|chunk| {
            let meta = &chunk.metadata;
            let page = meta
                .page
                .map_or_else(|| "?".to_string(), |p| p.to_string());

            let mut header = format!("[Source: {}, Page {}", display_title(&meta.title), page);
            if !meta.section.is_empty() {
                header.push_str(&format!(", Section: {}", meta.section));
            }
            header.push(']');

            format!("{}\n{}", header, chunk.text)
        })
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::ChunkMetadata;

    #[test]
    fn test_context_headers() {
        let chunks = vec![
            Chunk::new("a", 0, "alpha text").with_metadata(ChunkMetadata {
                title: "Guide".into(),
                page: Some(4),
                section: "Setup".into(),
                ..Default::default()
            }),
            Chunk::new("b", 0, "beta text"),
        ];

        assert_eq!(
            format_context(&chunks),
            "[Source: Guide, Page 4, Section: Setup]\nalpha text\n\n---\n\n[Source: Unknown, Page ?]\nbeta text"
        );
    }

    #[test]
    fn test_rag_prompt_fills_placeholders() {
        let manager = PromptManager::new();
        let prompt = manager.format_rag_prompt("what is rust?", &[Chunk::new("a", 0, "Rust is a language")]);

        assert!(prompt.starts_with("Context Documents:\n[Source: Unknown, Page ?]\nRust is a language"));
        assert!(prompt.contains("Question: what is rust?"));
        assert!(!prompt.contains("{context}"));
        assert!(manager.system_prompt().contains(FALLBACK_ANSWER));
    }

    #[test]
    fn test_placeholders_inside_inserted_text_are_kept() {
        let manager = PromptManager::new();
        let chunk = Chunk::new("a", 0, "literal {query} in doc");
        let prompt = manager.format_rag_prompt("what is rust", &[chunk]);

        assert!(prompt.contains("literal {query} in doc"));
        assert!(prompt.contains("Question: what is rust"));
        assert_eq!(prompt.matches("what is rust").count(), 1);

        let prompt = manager.format_rag_prompt("why {context}?", &[Chunk::new("a", 0, "body")]);
        assert!(prompt.contains("Question: why {context}?"));
        assert_eq!(prompt.matches("body").count(), 1);
    }

    #[test]
    fn test_fill_keeps_unknown_braces() {
        assert_eq!(fill("{x} {query} {", "c", "q"), "{x} q {");
        assert_eq!(fill("{{context}}", "c", "q"), "{c}");
    }

    #[test]
    fn test_register_and_lookup_templates() {
        let mut manager = PromptManager::new();
        assert!(manager.template("summary").is_none());

        manager.register_template("summary", "Summarize: {query}");
        assert_eq!(manager.template("summary"), Some("Summarize: {query}"));

        manager.register_template(RAG_USER, "Q={query} C={context}");
        let prompt = manager.format_rag_prompt("q", &[Chunk::new("a", 0, "t")]);
        assert_eq!(prompt, "Q=q C=[Source: Unknown, Page ?]\nt");

        assert!(manager
            .format_search_refinement("rust async")
            .contains("Original query: rust async"));
    }
}
