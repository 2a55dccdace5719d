//! 메타데이터 필터
//!
//! 지원하는 연산자는 동등(eq), 집합 포함(in), 범위(gt/gte/lt/lte) 세 종류뿐입니다.
//! 그 외 연산자는 파싱 단계에서 `RagError::InvalidFilter`로 거부되므로
//! 저장소로 전달되는 필터는 항상 지원되는 형태입니다.
//!
//! 와이어 형식: `{"field": "page", "operator": "gte", "value": 3}`
//! CLI 형식: `page>=3`, `title=Guide`, `tags in rust,async`

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, RagResult};

use super::chunk::Chunk;

// ============================================================================
// Types
// ============================================================================

/// 필터 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FilterValue {
    /// 숫자로 해석 가능한 경우
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FilterValue::Int(v) => Some(*v as f64),
            FilterValue::Float(v) => Some(*v),
            FilterValue::Text(_) => None,
        }
    }

    /// CLI 문자열에서 값 추론 (정수 → 실수 → 문자열)
    fn infer(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(v) = raw.parse::<i64>() {
            FilterValue::Int(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            FilterValue::Float(v)
        } else {
            FilterValue::Text(raw.to_string())
        }
    }

    fn from_json(value: &serde_json::Value) -> RagResult<Self> {
        match value {
            serde_json::Value::String(s) => Ok(FilterValue::Text(s.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(FilterValue::Int)
                .or_else(|| n.as_f64().map(FilterValue::Float))
                .ok_or_else(|| RagError::InvalidFilter(format!("unsupported number {}", n))),
            other => Err(RagError::InvalidFilter(format!(
                "expected a string or number, got {}",
                other
            ))),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            FilterValue::Int(v) => serde_json::Value::from(*v),
            FilterValue::Float(v) => serde_json::Value::from(*v),
            FilterValue::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// 범위 조건 (지정된 경계는 모두 AND)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RangeBounds {
    pub gt: Option<f64>,
    pub gte: Option<f64>,
    pub lt: Option<f64>,
    pub lte: Option<f64>,
}

impl RangeBounds {
    pub fn contains(&self, v: f64) -> bool {
        self.gt.map_or(true, |b| v > b)
            && self.gte.map_or(true, |b| v >= b)
            && self.lt.map_or(true, |b| v < b)
            && self.lte.map_or(true, |b| v <= b)
    }
}

/// 메타데이터 필터 (요청 내 여러 필터는 AND로 결합)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub enum MetadataFilter {
    /// 필드 값이 일치 (리스트 필드는 원소 중 하나가 일치)
    Eq { field: String, value: FilterValue },
    /// 필드 값이 목록 중 하나와 일치
    In { field: String, values: Vec<FilterValue> },
    /// 숫자 필드가 범위 안
    Range { field: String, bounds: RangeBounds },
}

impl MetadataFilter {
    pub fn eq(field: impl Into<String>, value: FilterValue) -> Self {
        MetadataFilter::Eq {
            field: field.into(),
            value,
        }
    }

    pub fn any_of(field: impl Into<String>, values: Vec<FilterValue>) -> Self {
        MetadataFilter::In {
            field: field.into(),
            values,
        }
    }

    pub fn range(field: impl Into<String>, bounds: RangeBounds) -> Self {
        MetadataFilter::Range {
            field: field.into(),
            bounds,
        }
    }

    /// 대상 필드 이름
    pub fn field(&self) -> &str {
        match self {
            MetadataFilter::Eq { field, .. }
            | MetadataFilter::In { field, .. }
            | MetadataFilter::Range { field, .. } => field,
        }
    }

    /// 청크가 조건을 만족하는지 로컬에서 평가
    ///
    /// 알 수 없는 필드는 값이 없는 것으로 취급되어 매칭되지 않습니다.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        let field = resolve_field(chunk, self.field());
        match self {
            MetadataFilter::Eq { value, .. } => field.equals(value),
            MetadataFilter::In { values, .. } => values.iter().any(|v| field.equals(v)),
            MetadataFilter::Range { bounds, .. } => match field {
                FieldRef::Number(n) => bounds.contains(n),
                _ => false,
            },
        }
    }
}

/// 모든 필터를 만족하는지 (빈 목록은 항상 참)
pub fn matches_all(filters: &[MetadataFilter], chunk: &Chunk) -> bool {
    filters.iter().all(|f| f.matches(chunk))
}

// ============================================================================
// Field Resolution
// ============================================================================

enum FieldRef<'a> {
    Text(&'a str),
    Number(f64),
    List(&'a [String]),
    Missing,
}

impl FieldRef<'_> {
    fn equals(&self, value: &FilterValue) -> bool {
        match (self, value) {
            (FieldRef::Text(s), FilterValue::Text(v)) => *s == v.as_str(),
            (FieldRef::Number(n), v) => v.as_f64().map_or(false, |v| *n == v),
            (FieldRef::List(items), FilterValue::Text(v)) => items.iter().any(|i| i == v),
            _ => false,
        }
    }
}

fn resolve_field<'a>(chunk: &'a Chunk, field: &str) -> FieldRef<'a> {
    let meta = &chunk.metadata;
    match field {
        "document_id" => FieldRef::Text(&chunk.document_id),
        "chunk_index" => FieldRef::Number(chunk.chunk_index as f64),
        "title" => FieldRef::Text(&meta.title),
        "author" => FieldRef::Text(&meta.author),
        "section" => FieldRef::Text(&meta.section),
        "page" => meta
            .page
            .map_or(FieldRef::Missing, |p| FieldRef::Number(p as f64)),
        "tags" => FieldRef::List(&meta.tags),
        "source_url" => meta
            .source_url
            .as_deref()
            .map_or(FieldRef::Missing, FieldRef::Text),
        _ => FieldRef::Missing,
    }
}

// ============================================================================
// Wire Format
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFilter {
    field: String,
    #[serde(default = "default_operator")]
    operator: String,
    value: serde_json::Value,
}

fn default_operator() -> String {
    "eq".to_string()
}

impl TryFrom<RawFilter> for MetadataFilter {
    type Error = RagError;

    fn try_from(raw: RawFilter) -> RagResult<Self> {
        if raw.field.trim().is_empty() {
            return Err(RagError::InvalidFilter("field name is empty".into()));
        }

        match raw.operator.as_str() {
            "eq" => Ok(MetadataFilter::eq(raw.field, FilterValue::from_json(&raw.value)?)),
            "in" => {
                let items = raw.value.as_array().ok_or_else(|| {
                    RagError::InvalidFilter(format!("'in' on '{}' needs a list value", raw.field))
                })?;
                let values = items
                    .iter()
                    .map(FilterValue::from_json)
                    .collect::<RagResult<Vec<_>>>()?;
                Ok(MetadataFilter::any_of(raw.field, values))
            }
            op @ ("gt" | "gte" | "lt" | "lte") => {
                let bound = raw.value.as_f64().ok_or_else(|| {
                    RagError::InvalidFilter(format!("'{}' on '{}' needs a number", op, raw.field))
                })?;
                Ok(MetadataFilter::range(raw.field, single_bound(op, bound)))
            }
            other => Err(RagError::InvalidFilter(format!(
                "unsupported operator '{}' (supported: eq, in, gt, gte, lt, lte)",
                other
            ))),
        }
    }
}

impl From<MetadataFilter> for RawFilter {
    fn from(filter: MetadataFilter) -> Self {
        match filter {
            MetadataFilter::Eq { field, value } => RawFilter {
                field,
                operator: "eq".into(),
                value: value.to_json(),
            },
            MetadataFilter::In { field, values } => RawFilter {
                field,
                operator: "in".into(),
                value: serde_json::Value::Array(values.iter().map(FilterValue::to_json).collect()),
            },
            MetadataFilter::Range { field, bounds } => {
                // 와이어 형식은 경계 하나만 표현하므로 첫 번째로 지정된 경계를 사용
                let (op, v) = [
                    ("gt", bounds.gt),
                    ("gte", bounds.gte),
                    ("lt", bounds.lt),
                    ("lte", bounds.lte),
                ]
                .into_iter()
                .find_map(|(op, v)| v.map(|v| (op, v)))
                .unwrap_or(("gte", f64::NEG_INFINITY));
                RawFilter {
                    field,
                    operator: op.into(),
                    value: serde_json::Value::from(v),
                }
            }
        }
    }
}

fn single_bound(op: &str, v: f64) -> RangeBounds {
    let mut bounds = RangeBounds::default();
    match op {
        "gt" => bounds.gt = Some(v),
        "gte" => bounds.gte = Some(v),
        "lt" => bounds.lt = Some(v),
        _ => bounds.lte = Some(v),
    }
    bounds
}

impl FromStr for MetadataFilter {
    type Err = RagError;

    fn from_str(s: &str) -> RagResult<Self> {
        let s = s.trim();

        if let Some((field, list)) = s
            .split_once(" in ")
            .filter(|(field, _)| !field.contains(['=', '<', '>']))
        {
            let values: Vec<FilterValue> = list
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(FilterValue::infer)
                .collect();
            if values.is_empty() {
                return Err(RagError::InvalidFilter(format!("empty list in '{}'", s)));
            }
            return Ok(MetadataFilter::any_of(field.trim(), values));
        }

        // 두 글자 연산자를 먼저 확인
        for (token, op) in [(">=", "gte"), ("<=", "lte"), (">", "gt"), ("<", "lt")] {
            if let Some((field, raw)) = s.split_once(token) {
                let bound = raw.trim().parse::<f64>().map_err(|_| {
                    RagError::InvalidFilter(format!("'{}' needs a numeric bound", s))
                })?;
                return Ok(MetadataFilter::range(field.trim(), single_bound(op, bound)));
            }
        }

        if s.contains("!=") {
            return Err(RagError::InvalidFilter(format!(
                "unsupported operator '!=' in '{}'",
                s
            )));
        }

        if let Some((field, raw)) = s.split_once('=') {
            if field.trim().is_empty() {
                return Err(RagError::InvalidFilter(format!("missing field in '{}'", s)));
            }
            return Ok(MetadataFilter::eq(field.trim(), FilterValue::infer(raw)));
        }

        Err(RagError::InvalidFilter(format!(
            "cannot parse '{}' (expected field=value, field>=n, or field in a,b)",
            s
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================
