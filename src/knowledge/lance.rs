//! LanceDB Vector Store - 청크 원본 저장소 + ANN 검색
//!
//! 청크 텍스트와 평면 메타데이터를 임베딩과 같은 행에 저장합니다.
//! 메타데이터 필터는 `only_if` SQL 조건으로 변환되고, 결과는 한 번 더 로컬에서 검증합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;

use super::chunk::{Chunk, ChunkMetadata, DenseResult};
use super::filter::{matches_all, FilterValue, MetadataFilter, RangeBounds};
use super::vector::{ScrollPage, VectorEntry, VectorStore};

/// 청크 테이블 이름
const TABLE_NAME: &str = "chunks";

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
pub struct LanceVectorStore {
    db: Connection,
    dimension: i32,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    /// * `dimension` - 임베딩 차원
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let dimension = i32::try_from(dimension).context("Embedding dimension too large")?;

        Ok(Self { db, dimension })
    }

    /// 청크 테이블 스키마
    fn create_schema(dimension: i32) -> Schema {
        Schema::new(vec![
            Field::new("document_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::Int32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("author", DataType::Utf8, false),
            Field::new("page", DataType::Int32, true),
            Field::new("section", DataType::Utf8, false),
            // JSON 배열 문자열
            Field::new("tags", DataType::Utf8, false),
            Field::new("source_url", DataType::Utf8, true),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension,
                ),
                false,
            ),
        ])
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(&self, entries: &[VectorEntry]) -> Result<RecordBatch> {
        if entries.is_empty() {
            anyhow::bail!("Cannot create batch from empty entries");
        }

        if let Some(bad) = entries
            .iter()
            .find(|e| e.embedding.len() != self.dimension as usize)
        {
            anyhow::bail!(
                "Embedding dimension mismatch for {}: expected {}, got {}",
                bad.chunk.key(),
                self.dimension,
                bad.embedding.len()
            );
        }

        let chunks: Vec<&Chunk> = entries.iter().map(|e| &e.chunk).collect();
        let tags = chunks
            .iter()
            .map(|c| serde_json::to_string(&c.metadata.tags))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to encode tags")?;

        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            self.dimension,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        let batch = RecordBatch::try_new(
            Arc::new(Self::create_schema(self.dimension)),
            vec![
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| c.document_id.as_str()),
                )),
                Arc::new(Int32Array::from_iter_values(
                    chunks.iter().map(|c| c.chunk_index as i32),
                )),
                Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.text.as_str()))),
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| c.metadata.title.as_str()),
                )),
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| c.metadata.author.as_str()),
                )),
                Arc::new(Int32Array::from(
                    chunks
                        .iter()
                        .map(|c| c.metadata.page.map(|p| p as i32))
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| c.metadata.section.as_str()),
                )),
                Arc::new(StringArray::from_iter_values(tags.iter().map(String::as_str))),
                Arc::new(StringArray::from(
                    chunks
                        .iter()
                        .map(|c| c.metadata.source_url.as_deref())
                        .collect::<Vec<_>>(),
                )),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")?;

        Ok(batch)
    }

    /// 테이블 존재 여부 확인
    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.iter().any(|n| n == TABLE_NAME))
            .unwrap_or(false)
    }

    /// 테이블 열기 (없으면 None)
    async fn open_table(&self) -> Result<Option<lancedb::table::Table>> {
        if !self.table_exists().await {
            return Ok(None);
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open chunk table")?;
        Ok(Some(table))
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    fn name(&self) -> &str {
        "lancedb"
    }

    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let batch = self.entries_to_batch(entries)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        match self.open_table().await? {
            Some(table) => {
                let mut documents: Vec<&str> =
                    entries.iter().map(|e| e.chunk.document_id.as_str()).collect();
                documents.sort_unstable();
                documents.dedup();

                let ids = documents
                    .iter()
                    .map(|d| sql_string(d))
                    .collect::<Vec<_>>()
                    .join(", ");
                table
                    .delete(&format!("document_id IN ({})", ids))
                    .await
                    .context("Failed to remove previous chunks")?;

                table
                    .add(batches)
                    .execute()
                    .await
                    .context("Failed to add chunks to table")?;
            }
            None => {
                self.db
                    .create_table(TABLE_NAME, batches)
                    .execute()
                    .await
                    .context("Failed to create chunk table")?;
            }
        }

        Ok(entries.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        filters: &[MetadataFilter],
        limit: usize,
    ) -> Result<Vec<DenseResult>> {
        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let mut query = table
            .vector_search(vector.to_vec())
            .context("Failed to create vector search")?
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        if let Some(predicate) = filters_to_sql(filters)? {
            tracing::debug!("LanceDB filter: {}", predicate);
            query = query.only_if(predicate);
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .context("Failed to execute vector search")?
            .try_collect()
            .await
            .context("Failed to collect search results")?;

        let mut results = Vec::new();
        for batch in &batches {
            let chunks = batch_to_chunks(batch)?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for (i, chunk) in chunks.into_iter().enumerate() {
                // SQL 변환은 tags LIKE처럼 근사일 수 있으므로 로컬에서 재검증
                if !matches_all(filters, &chunk) {
                    continue;
                }
                results.push(DenseResult {
                    chunk,
                    // 코사인 거리 → 코사인 유사도
                    score: 1.0 - distances.value(i),
                });
            }
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    async fn scroll(&self, page_token: Option<&str>, limit: usize) -> Result<ScrollPage> {
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .with_context(|| format!("Invalid page token: {}", token))?,
            None => 0,
        };

        let Some(table) = self.open_table().await? else {
            return Ok(ScrollPage::default());
        };

        let limit = limit.max(1);
        let batches: Vec<RecordBatch> = table
            .query()
            .limit(limit)
            .offset(offset)
            .execute()
            .await
            .context("Failed to scan chunk table")?
            .try_collect()
            .await
            .context("Failed to collect scanned chunks")?;

        let mut chunks = Vec::new();
        for batch in &batches {
            chunks.extend(batch_to_chunks(batch)?);
        }

        let next_page_token = (chunks.len() == limit).then(|| (offset + limit).to_string());
        Ok(ScrollPage {
            chunks,
            next_page_token,
        })
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let predicate = format!("document_id = {}", sql_string(document_id));
        let matching = table
            .count_rows(Some(predicate.clone()))
            .await
            .context("Failed to count document chunks")?;

        if matching > 0 {
            table
                .delete(&predicate)
                .await
                .context("Failed to delete document chunks")?;
        }

        Ok(matching)
    }

    async fn count(&self) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        table.count_rows(None).await.context("Failed to count rows")
    }
}

// ============================================================================
// Row Decoding
// ============================================================================

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

fn batch_to_chunks(batch: &RecordBatch) -> Result<Vec<Chunk>> {
    let document_ids = string_column(batch, "document_id")?;
    let chunk_indices = int_column(batch, "chunk_index")?;
    let texts = string_column(batch, "text")?;
    let titles = string_column(batch, "title")?;
    let authors = string_column(batch, "author")?;
    let pages = int_column(batch, "page")?;
    let sections = string_column(batch, "section")?;
    let tags = string_column(batch, "tags")?;
    let source_urls = string_column(batch, "source_url")?;

    (0..batch.num_rows())
        .map(|i| {
            let metadata = ChunkMetadata {
                title: titles.value(i).to_string(),
                author: authors.value(i).to_string(),
                page: (!pages.is_null(i)).then(|| pages.value(i) as u32),
                section: sections.value(i).to_string(),
                tags: serde_json::from_str(tags.value(i)).context("Malformed tags column")?,
                source_url: (!source_urls.is_null(i)).then(|| source_urls.value(i).to_string()),
            };
            Ok(Chunk::new(
                document_ids.value(i),
                chunk_indices.value(i) as u32,
                texts.value(i),
            )
            .with_metadata(metadata))
        })
        .collect()
}

// ============================================================================
// Filter Translation
// ============================================================================

enum ColumnKind {
    Text,
    Number,
    Tags,
}

fn column_kind(field: &str) -> Result<ColumnKind> {
    match field {
        "document_id" | "title" | "author" | "section" | "source_url" => Ok(ColumnKind::Text),
        "chunk_index" | "page" => Ok(ColumnKind::Number),
        "tags" => Ok(ColumnKind::Tags),
        other => anyhow::bail!("Unknown filter field: {}", other),
    }
}

/// 작은따옴표 이스케이프된 SQL 문자열 리터럴
fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn value_predicate(field: &str, kind: &ColumnKind, value: &FilterValue) -> Result<String> {
    let predicate = match (kind, value) {
        (ColumnKind::Text, FilterValue::Text(v)) => format!("{} = {}", field, sql_string(v)),
        (ColumnKind::Number, v) => match v.as_f64() {
            Some(n) => format!("{} = {}", field, n),
            None => "false".to_string(),
        },
        (ColumnKind::Tags, FilterValue::Text(v)) => {
            let encoded = serde_json::to_string(v).context("Failed to encode tag")?;
            format!("{} LIKE {}", field, sql_string(&format!("%{}%", encoded)))
        }
        _ => "false".to_string(),
    };
    Ok(predicate)
}

fn range_predicate(field: &str, kind: &ColumnKind, bounds: &RangeBounds) -> String {
    if !matches!(kind, ColumnKind::Number) {
        return "false".to_string();
    }

    let parts: Vec<String> = [
        (">", bounds.gt),
        (">=", bounds.gte),
        ("<", bounds.lt),
        ("<=", bounds.lte),
    ]
    .into_iter()
    .filter_map(|(op, v)| v.map(|v| format!("{} {} {}", field, op, v)))
    .collect();

    if parts.is_empty() {
        format!("{} IS NOT NULL", field)
    } else {
        parts.join(" AND ")
    }
}

/// 필터 목록을 하나의 SQL 조건으로 변환 (빈 목록이면 None)
fn filters_to_sql(filters: &[MetadataFilter]) -> Result<Option<String>> {
    let mut clauses = Vec::with_capacity(filters.len());

    for filter in filters {
        let field = filter.field();
        let kind = column_kind(field)?;

        let clause = match filter {
            MetadataFilter::Eq { value, .. } => value_predicate(field, &kind, value)?,
            MetadataFilter::In { values, .. } => {
                let options = values
                    .iter()
                    .map(|v| value_predicate(field, &kind, v))
                    .collect::<Result<Vec<_>>>()?;
                if options.is_empty() {
                    "false".to_string()
                } else {
                    options.join(" OR ")
                }
            }
            MetadataFilter::Range { bounds, .. } => range_predicate(field, &kind, bounds),
        };
        clauses.push(format!("({})", clause));
    }

    Ok((!clauses.is_empty()).then(|| clauses.join(" AND ")))
}

// ============================================================================
// Tests
// ============================================================================
