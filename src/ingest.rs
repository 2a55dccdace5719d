//! 문서 수집 모듈
//!
//! 로컬 텍스트/마크다운 파일을 단어 단위 청크로 나누고 임베딩하여 벡터 저장소에 넣습니다.
//! 문서 ID는 정규화된 경로의 SHA-256이므로 같은 파일을 다시 넣으면 기존 청크가 교체됩니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::IngestSettings;
use crate::knowledge::{chunk_text, Chunk, ChunkMetadata, HybridRetriever, VectorEntry};

/// 수집 대상 확장자
const SUPPORTED_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

// ============================================================================
// Report
// ============================================================================

/// 수집 결과
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub files: usize,
    pub chunks: usize,
    /// 읽기 실패 또는 빈 파일
    pub skipped: usize,
}

// ============================================================================
// Ingestor
// ============================================================================

/// 문서 수집기
pub struct Ingestor {
    retriever: Arc<HybridRetriever>,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(retriever: Arc<HybridRetriever>, settings: IngestSettings) -> Self {
        Self {
            retriever,
            settings,
        }
    }

    /// 파일 또는 폴더 수집
    ///
    /// 하나라도 저장되면 키워드 인덱스 캐시를 무효화합니다.
    pub async fn ingest_path(&self, path: &Path) -> Result<IngestReport> {
        let files = collect_files(path)?;
        let mut report = IngestReport::default();

        for file in &files {
            match self.index_file(file).await {
                Ok(0) => {
                    tracing::debug!("Skipping empty file: {:?}", file);
                    report.skipped += 1;
                }
                Ok(chunks) => {
                    report.files += 1;
                    report.chunks += chunks;
                }
                Err(e) => {
                    tracing::warn!("Failed to ingest {:?}: {:#}", file, e);
                    report.skipped += 1;
                }
            }
        }

        if report.chunks > 0 {
            self.retriever.clear_index().await;
        }

        tracing::info!(
            "Ingested {} files ({} chunks, {} skipped) from {:?}",
            report.files,
            report.chunks,
            report.skipped,
            path
        );
        Ok(report)
    }

    /// 텍스트 직접 수집
    ///
    /// # Arguments
    /// * `document_id` - 문서 ID (기존 청크 교체 단위)
    /// * `text` - 원문
    /// * `metadata` - 모든 청크에 복사될 메타데이터
    pub async fn ingest_text(
        &self,
        document_id: &str,
        text: &str,
        metadata: ChunkMetadata,
    ) -> Result<usize> {
        let count = self.index_text(document_id, text, metadata).await?;
        if count > 0 {
            self.retriever.clear_index().await;
        }
        Ok(count)
    }

    async fn index_file(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {:?}", path))?;

        let metadata = ChunkMetadata {
            title: document_title(path, &text),
            source_url: Some(path.display().to_string()),
            ..Default::default()
        };

        self.index_text(&document_id(path)?, &text, metadata).await
    }

    async fn index_text(
        &self,
        document_id: &str,
        text: &str,
        metadata: ChunkMetadata,
    ) -> Result<usize> {
        let pieces = chunk_text(
            text,
            self.settings.chunk_words,
            self.settings.overlap_words,
        );
        if pieces.is_empty() {
            // 빈 문서로 재수집되면 기존 청크 제거
            let removed = self
                .retriever
                .store()
                .delete_document(document_id)
                .await
                .with_context(|| format!("Failed to remove chunks of {}", document_id))?;
            if removed > 0 {
                tracing::info!("Removed {} stale chunks for {}", removed, document_id);
                self.retriever.clear_index().await;
            }
            return Ok(0);
        }

        let embedder = self.retriever.embedder();
        let mut embeddings = Vec::with_capacity(pieces.len());
        for batch in pieces.chunks(self.settings.embed_batch_size.max(1)) {
            let vectors = embedder
                .embed_batch(batch)
                .await
                .with_context(|| format!("Failed to embed chunks of {}", document_id))?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "Embedding count mismatch for {}: expected {}, got {}",
                    document_id,
                    batch.len(),
                    vectors.len()
                );
            }
            embeddings.extend(vectors);
        }

        let entries: Vec<VectorEntry> = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| VectorEntry {
                chunk: Chunk::new(document_id, i as u32, text).with_metadata(metadata.clone()),
                embedding,
            })
            .collect();

        // 문서 단위 교체이므로 한 번에 저장
        let stored = self
            .retriever
            .store()
            .upsert(&entries)
            .await
            .with_context(|| format!("Failed to store chunks of {}", document_id))?;

        tracing::debug!("Stored {} chunks for {}", stored, document_id);
        Ok(stored)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// 수집 대상 파일 목록 (숨김 파일/폴더 제외, 경로 순)
pub fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        anyhow::bail!("Path not found: {:?}", path);
    }

    if path.is_file() {
        return Ok(if is_supported(path) {
            vec![path.to_path_buf()]
        } else {
            vec![]
        });
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Failed to read entry: {}", e);
                continue;
            }
        };

        if entry.file_type().is_file() && is_supported(entry.path()) {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

/// 정규화된 경로의 SHA-256 (hex)
pub fn document_id(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve path: {:?}", path))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// 마크다운 첫 `# ` 제목, 없으면 파일 이름
fn document_title(path: &Path, text: &str) -> String {
    let heading = text
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|h| !h.is_empty());

    match heading {
        Some(h) => h.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
    }
}

// ============================================================================
// Tests
// ============================================================================
