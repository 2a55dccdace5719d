//! CLI 모듈
//!
//! citerag CLI 명령어 정의 및 구현

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use crate::config::{FusionMethod, Settings};
use crate::embedding::{create_embedder, has_api_key};
use crate::generation::{Answer, AnswerEvent, Citation, DeepSeekClient, RagPipeline, StreamChunk};
use crate::ingest::Ingestor;
use crate::knowledge::{
    ChunkMetadata, FusedResult, HybridRetriever, LanceVectorStore, MetadataFilter, SearchOutcome,
    SearchRequest,
};

/// LanceDB 디렉토리 이름 (데이터 디렉토리 하위)
const LANCE_DIR: &str = "lancedb";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "citerag")]
#[command(version, about = "하이브리드 검색 기반 인용 답변 엔진", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 파일, 폴더, 또는 텍스트를 지식베이스에 추가
    Ingest {
        /// 수집할 파일 또는 폴더 (.md, .markdown, .txt)
        path: Option<PathBuf>,

        /// 직접 입력할 텍스트
        #[arg(short, long, conflicts_with = "path")]
        text: Option<String>,

        /// 텍스트의 문서 ID (같은 ID는 교체)
        #[arg(long, default_value = "direct-input")]
        id: String,

        /// 텍스트의 문서 제목
        #[arg(long)]
        title: Option<String>,
    },

    /// 하이브리드 검색
    Search {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 (기본: final_top_k)
        #[arg(short, long)]
        limit: Option<usize>,

        /// 메타데이터 필터 (예: page>=3, title=Guide, "tags in rust,async")
        #[arg(short, long = "filter")]
        filters: Vec<MetadataFilter>,

        /// 통합 방식 (rrf | weighted)
        #[arg(long)]
        fusion: Option<FusionMethod>,

        /// 키워드 인덱스 캐시 무시
        #[arg(long)]
        no_cache: bool,

        /// 검색 전에 쿼리 개선
        #[arg(long)]
        refine: bool,

        /// 디버그 정보 출력
        #[arg(long)]
        debug: bool,

        /// JSON 출력
        #[arg(long)]
        json: bool,
    },

    /// 인용이 붙은 답변 생성
    Ask {
        /// 질문
        query: String,

        /// 컨텍스트 청크 개수 (기본: final_top_k)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// 메타데이터 필터
        #[arg(short, long = "filter")]
        filters: Vec<MetadataFilter>,

        /// 통합 방식 (rrf | weighted)
        #[arg(long)]
        fusion: Option<FusionMethod>,

        /// 토큰 단위 스트리밍
        #[arg(short, long)]
        stream: bool,

        /// 검색 전에 쿼리 개선
        #[arg(long)]
        refine: bool,

        /// JSON 출력 (스트리밍이면 `data: {...}` 줄)
        #[arg(long)]
        json: bool,
    },

    /// 문서의 모든 청크 삭제
    Delete {
        /// 문서 ID
        document_id: String,
    },

    /// 키워드 인덱스 재구축
    Reindex,

    /// 상태 확인
    Status,

    /// 적용된 설정 출력
    Config,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load()?;

    match cli.command {
        Commands::Ingest {
            path,
            text,
            id,
            title,
        } => cmd_ingest(&settings, path, text, id, title).await,
        Commands::Search {
            query,
            limit,
            filters,
            fusion,
            no_cache,
            refine,
            debug,
            json,
        } => {
            let mut request = SearchRequest::new(query).with_filters(filters);
            if let Some(limit) = limit {
                request = request.with_top_k(limit);
            }
            if let Some(fusion) = fusion {
                request = request.with_fusion(fusion);
            }
            if no_cache {
                request = request.without_cache();
            }
            cmd_search(&settings, request, refine, debug, json).await
        }
        Commands::Ask {
            query,
            top_k,
            filters,
            fusion,
            stream,
            refine,
            json,
        } => {
            let mut request = SearchRequest::new(query).with_filters(filters);
            if let Some(top_k) = top_k {
                request = request.with_top_k(top_k);
            }
            if let Some(fusion) = fusion {
                request = request.with_fusion(fusion);
            }
            cmd_ask(&settings, request, stream, refine, json).await
        }
        Commands::Delete { document_id } => cmd_delete(&settings, &document_id).await,
        Commands::Reindex => cmd_reindex(&settings).await,
        Commands::Status => cmd_status(&settings).await,
        Commands::Config => cmd_config(&settings),
    }
}

/// 설정으로 검색기 생성 (LanceDB + 임베딩)
async fn open_retriever(settings: &Settings) -> Result<Arc<HybridRetriever>> {
    let embedder = create_embedder(&settings.embedding)?;
    let store = LanceVectorStore::open(&settings.data_dir().join(LANCE_DIR), embedder.dimension())
        .await
        .context("LanceDB 열기 실패")?;

    Ok(Arc::new(HybridRetriever::new(
        embedder,
        Arc::new(store),
        settings.retrieval.clone(),
    )))
}

/// 검색기 + 생성 모델 파이프라인
async fn open_pipeline(settings: &Settings) -> Result<RagPipeline> {
    let retriever = open_retriever(settings).await?;
    let generator =
        DeepSeekClient::from_env(&settings.generation).context("생성 모델 클라이언트 생성 실패")?;
    Ok(RagPipeline::new(retriever, Arc::new(generator)))
}

/// Gemini 백엔드일 때 API 키 확인
fn ensure_embedding_key(settings: &Settings) -> Result<()> {
    if settings.embedding.backend == crate::config::EmbeddingBackend::Gemini && !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey"
        );
    }
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 문서 수집 명령어 (ingest)
async fn cmd_ingest(
    settings: &Settings,
    path: Option<PathBuf>,
    text: Option<String>,
    id: String,
    title: Option<String>,
) -> Result<()> {
    ensure_embedding_key(settings)?;

    let retriever = open_retriever(settings).await?;
    let ingestor = Ingestor::new(retriever, settings.ingest.clone());

    if let Some(text) = text {
        println!("[*] 텍스트 임베딩 및 저장 중...");
        let metadata = ChunkMetadata {
            title: title.unwrap_or_default(),
            ..Default::default()
        };
        let chunks = ingestor
            .ingest_text(&id, &text, metadata)
            .await
            .context("텍스트 수집 실패")?;

        println!("[OK] 문서 '{}' 저장됨 ({} 청크)", id, chunks);
        return Ok(());
    }

    let Some(path) = path else {
        bail!("수집할 경로 또는 --text 중 하나를 지정해야 합니다");
    };

    println!("[*] 수집 중: {}", path.display());
    let report = ingestor
        .ingest_path(&path)
        .await
        .with_context(|| format!("수집 실패: {}", path.display()))?;

    if report.files == 0 {
        println!("[!] 수집된 파일이 없습니다 (건너뜀: {})", report.skipped);
        return Ok(());
    }

    println!(
        "[OK] 완료: 파일 {}, 청크 {}, 건너뜀 {}",
        report.files, report.chunks, report.skipped
    );
    Ok(())
}

/// 검색 명령어 (search)
async fn cmd_search(
    settings: &Settings,
    mut request: SearchRequest,
    refine: bool,
    debug: bool,
    json: bool,
) -> Result<()> {
    ensure_embedding_key(settings)?;

    let retriever = if refine {
        let pipeline = open_pipeline(settings).await?;
        request.query = pipeline.refine_query(&request.query).await?;
        Arc::clone(pipeline.retriever())
    } else {
        open_retriever(settings).await?
    };

    let outcome = retriever.search(&request).await.context("검색 실패")?;

    if json {
        print_json_outcome(&outcome, debug)?;
        return Ok(());
    }

    println!("[*] 검색: \"{}\"", request.query);
    if outcome.results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
    } else {
        println!("\n[OK] 검색 결과 ({} 건):\n", outcome.results.len());
        for (i, result) in outcome.results.iter().enumerate() {
            print_result(i + 1, result);
        }
    }

    if debug {
        println!("[debug] {}", serde_json::to_string_pretty(&outcome.debug)?);
    }

    Ok(())
}

fn print_json_outcome(outcome: &SearchOutcome, debug: bool) -> Result<()> {
    let mut value = serde_json::json!({ "results": outcome.results });
    if debug {
        value["debug"] = serde_json::to_value(&outcome.debug)?;
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_result(rank: usize, result: &FusedResult) {
    let meta = &result.chunk.metadata;

    println!(
        "{}. [{}] [점수: {:.4}] {}",
        rank,
        result.source().as_str(),
        result.fused_score,
        result.chunk.key()
    );

    if !meta.title.is_empty() {
        match meta.page {
            Some(page) => println!("   제목: {} (p.{})", meta.title, page),
            None => println!("   제목: {}", meta.title),
        }
    }
    println!(
        "   벡터: {:.4} | 키워드: {:.4}",
        result.dense_score, result.keyword_score
    );
    println!("   내용: {}", truncate_text(&result.chunk.text, 200));
    println!();
}

/// 답변 명령어 (ask)
async fn cmd_ask(
    settings: &Settings,
    mut request: SearchRequest,
    stream: bool,
    refine: bool,
    json: bool,
) -> Result<()> {
    ensure_embedding_key(settings)?;
    let pipeline = open_pipeline(settings).await?;

    if refine {
        request.query = pipeline.refine_query(&request.query).await?;
        tracing::info!("Using refined query: {}", request.query);
    }

    if !stream {
        let answer = pipeline.answer(&request).await.context("답변 생성 실패")?;
        if json {
            println!("{}", serde_json::to_string_pretty(&answer)?);
        } else {
            print_answer(&answer);
        }
        return Ok(());
    }

    let mut events = pipeline
        .answer_stream(&request)
        .await
        .context("답변 생성 실패")?;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        let event = event.context("스트리밍 중 오류")?;

        if json {
            let line = serde_json::to_string(&StreamChunk::from(event))?;
            writeln!(stdout, "data: {}\n", line)?;
            continue;
        }

        match event {
            AnswerEvent::Token(delta) => write!(stdout, "{}", delta)?,
            AnswerEvent::Complete { citations } => {
                writeln!(stdout)?;
                print_citations(&citations);
            }
        }
        stdout.flush()?;
    }

    if json {
        writeln!(stdout, "data: [DONE]")?;
    }
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.answer);
    print_citations(&answer.citations);

    if let Some(usage) = answer.token_usage {
        println!(
            "\n[*] 토큰: 프롬프트 {}, 생성 {}, 합계 {}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        );
    }
}

fn print_citations(citations: &[Citation]) {
    if citations.is_empty() {
        return;
    }

    println!("\n[출처]");
    for citation in citations {
        let page = citation
            .page
            .map(|p| format!(", p.{}", p))
            .unwrap_or_default();
        println!("  [{}] {}{}", citation.index, citation.document_title, page);
        println!("      {}", truncate_text(&citation.excerpt, 100));
    }
}

/// 삭제 명령어 (delete)
async fn cmd_delete(settings: &Settings, document_id: &str) -> Result<()> {
    ensure_embedding_key(settings)?;
    let retriever = open_retriever(settings).await?;

    let deleted = retriever
        .delete_document(document_id)
        .await
        .context("문서 삭제 실패")?;

    if deleted > 0 {
        println!("[OK] 문서 '{}' 삭제됨 ({} 청크)", document_id, deleted);
    } else {
        println!("[!] 삭제할 문서를 찾을 수 없습니다: {}", document_id);
    }
    Ok(())
}

/// 재색인 명령어 (reindex)
async fn cmd_reindex(settings: &Settings) -> Result<()> {
    ensure_embedding_key(settings)?;
    let retriever = open_retriever(settings).await?;

    let count = retriever
        .rebuild_index()
        .await
        .context("키워드 인덱스 재구축 실패")?;
    println!("[OK] 키워드 인덱스 재구축: {} 청크", count);
    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(settings: &Settings) -> Result<()> {
    println!("citerag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let data_dir = settings.data_dir();
    println!("[*] 데이터 디렉토리: {}", data_dir.display());
    println!(
        "[*] 저장소 크기: {}",
        format_bytes(directory_size(&data_dir.join(LANCE_DIR)) as usize)
    );
    println!(
        "[*] 검색: fusion={}, final_top_k={}",
        settings.retrieval.fusion_method, settings.retrieval.final_top_k
    );

    let gemini = settings.embedding.backend == crate::config::EmbeddingBackend::Gemini;
    if !gemini || has_api_key() {
        println!("[OK] 임베딩: {}", settings.embedding.model);
    } else {
        println!("[!] 임베딩 API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    if std::env::var("DEEPSEEK_API_KEY").is_ok_and(|k| !k.is_empty()) {
        println!("[OK] 생성 모델: {}", settings.generation.model);
    } else {
        println!("[!] 생성 모델 API 키: 미설정 (export DEEPSEEK_API_KEY=your-key)");
    }

    if gemini && !has_api_key() {
        return Ok(());
    }

    match open_retriever(settings).await {
        Ok(retriever) => match retriever.stats().await {
            Ok(stats) => {
                println!("[OK] 벡터 저장소 ({}): {} 청크", stats.store, stats.chunk_count);
            }
            Err(e) => {
                tracing::debug!("Failed to read store stats: {:#}", e);
            }
        },
        Err(e) => {
            tracing::debug!("Failed to open retriever: {:#}", e);
        }
    }

    Ok(())
}

/// 설정 출력 명령어 (config)
fn cmd_config(settings: &Settings) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// 디렉토리 전체 크기 (없으면 0)
fn directory_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search_filters() {
        let cli = Cli::parse_from([
            "citerag", "search", "tokio", "-f", "page>=3", "-f", "title=Guide", "--fusion",
            "weighted", "--no-cache",
        ]);

        match cli.command {
            Commands::Search {
                filters,
                fusion,
                no_cache,
                limit,
                ..
            } => {
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[0].field(), "page");
                assert_eq!(fusion, Some(FusionMethod::Weighted));
                assert!(no_cache);
                assert!(limit.is_none());
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_filter() {
        assert!(Cli::try_parse_from(["citerag", "search", "q", "-f", "page~3"]).is_err());
        assert!(Cli::try_parse_from(["citerag", "ask", "q", "--fusion", "mean"]).is_err());
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_truncate_unicode() {
        let korean = "안녕하세요 세계";
        let truncated = truncate_text(korean, 5);
        assert_eq!(truncated, "안녕하세요...");
    }

    #[test]
    fn test_directory_size() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), [0u8; 10]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b"), [0u8; 5]).unwrap();

        assert_eq!(directory_size(dir.path()), 15);
        assert_eq!(directory_size(&dir.path().join("missing")), 0);
    }
}
