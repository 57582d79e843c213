//! 변경 로그 행과 변경 이벤트 데이터 구조 정의

use crate::error::{CdcError, Result};
use crate::offset::{EventKey, Lsn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// 변경 로그 결과의 예약 메타데이터 컬럼 위치
pub const OPERATION_COLUMN: usize = 0;
pub const POSITION_COLUMN: usize = 1;
pub const SEQUENCE_COLUMN: usize = 2;
pub const TRANSACTION_COLUMN: usize = 3;
/// 데이터 컬럼 앞에 오는 메타데이터 컬럼 수
pub const RESERVED_LEADING_COLUMNS: usize = 4;

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(String),
    Time(String),
    Decimal(String),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s) | CellValue::Decimal(s) => Some(s.clone()),
            CellValue::Int64(i) => Some(i.to_string()),
            CellValue::UInt64(u) => Some(u.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::DateTime(dt) => Some(dt.to_rfc3339()),
            CellValue::Null => Some("NULL".to_string()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            CellValue::UInt64(u) => Some(*u),
            CellValue::Int64(i) => u64::try_from(*i).ok(),
            CellValue::String(s) | CellValue::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// 이벤트 envelope에 들어갈 JSON 값
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            CellValue::Null => Value::Null,
            CellValue::Int64(i) => Value::from(*i),
            CellValue::UInt64(u) => Value::from(*u),
            CellValue::Float(f) => Value::from(*f as f64),
            CellValue::Double(d) => Value::from(*d),
            CellValue::String(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::Decimal(s) => Value::from(s.as_str()),
            CellValue::Bytes(b) => Value::from(b.clone()),
            CellValue::DateTime(dt) => Value::from(dt.to_rfc3339()),
            CellValue::Json(v) => v.clone(),
        }
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    /// 스냅샷으로 읽은 행
    Read,
    Insert,
    Update,
    Delete,
}

impl OperationType {
    /// Debezium 스타일 op 코드
    pub fn code(&self) -> &'static str {
        match self {
            OperationType::Read => "r",
            OperationType::Insert => "c",
            OperationType::Update => "u",
            OperationType::Delete => "d",
        }
    }
}

/// 변경 로그에 기록된 행 연산 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RowOperation {
    Delete = 1,
    Insert = 2,
    UpdateBefore = 3,
    UpdateAfter = 4,
}

impl RowOperation {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(RowOperation::Delete),
            2 => Some(RowOperation::Insert),
            3 => Some(RowOperation::UpdateBefore),
            4 => Some(RowOperation::UpdateAfter),
            _ => None,
        }
    }
}

/// 캡처 대상 테이블 메타데이터
///
/// 스키마 변경 시 수정하지 않고 통째로 교체합니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTableDescriptor {
    /// 원본 테이블 (e.g., "shop.orders")
    pub source_table: String,
    /// 캡처 식별자 (변경 로그 테이블 이름에 사용)
    pub capture_name: String,
    /// 데이터 컬럼 이름 (순서 유지)
    pub columns: Vec<String>,
    /// 데이터 컬럼 앞의 예약 메타데이터 컬럼 수
    pub reserved_leading: usize,
    /// 원본 테이블의 기본 키 컬럼. 스냅샷 행 순서를 고정하는 데 씁니다.
    pub key_columns: Vec<String>,
}

impl ChangeTableDescriptor {
    pub fn new(
        source_table: impl Into<String>,
        capture_name: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        ChangeTableDescriptor {
            source_table: source_table.into(),
            capture_name: capture_name.into(),
            columns,
            reserved_leading: RESERVED_LEADING_COLUMNS,
            key_columns: Vec::new(),
        }
    }

    pub fn with_key_columns(mut self, key_columns: Vec<String>) -> Self {
        self.key_columns = key_columns;
        self
    }
}

/// 변경 로그 조회 결과의 원시 행
#[derive(Debug, Clone)]
pub struct ChangeRow {
    /// 결과 컬럼 이름 (메타데이터 + 데이터 + 선택적 timestamp)
    pub columns: Arc<[String]>,
    pub values: Vec<CellValue>,
}

/// 예약 메타데이터 컬럼에서 읽은 값
#[derive(Debug, Clone, PartialEq)]
pub struct RowMetadata {
    pub operation: RowOperation,
    pub position: Lsn,
    pub sequence: u64,
    pub transaction_id: Option<String>,
}

impl RowMetadata {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.position, self.sequence)
    }
}

impl ChangeRow {
    pub fn new(columns: Arc<[String]>, values: Vec<CellValue>) -> Self {
        ChangeRow { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last(&self) -> Option<&CellValue> {
        self.values.last()
    }

    /// 메타데이터 컬럼 파싱
    pub fn metadata(&self, table: &str) -> Result<RowMetadata> {
        if self.values.len() < RESERVED_LEADING_COLUMNS {
            return Err(CdcError::schema_mismatch(
                table,
                format!(
                    "row has {} columns, expected at least {} metadata columns",
                    self.values.len(),
                    RESERVED_LEADING_COLUMNS
                ),
            ));
        }

        let code = self.values[OPERATION_COLUMN]
            .as_u64()
            .ok_or_else(|| CdcError::schema_mismatch(table, "operation column is not numeric"))?;
        let operation = RowOperation::from_code(code).ok_or_else(|| {
            CdcError::schema_mismatch(table, format!("unknown operation code {}", code))
        })?;
        let position = self.values[POSITION_COLUMN]
            .as_u64()
            .map(Lsn::new)
            .ok_or_else(|| CdcError::schema_mismatch(table, "position column is not numeric"))?;
        let sequence = self.values[SEQUENCE_COLUMN]
            .as_u64()
            .ok_or_else(|| CdcError::schema_mismatch(table, "sequence column is not numeric"))?;
        let transaction_id = match &self.values[TRANSACTION_COLUMN] {
            CellValue::Null => None,
            other => other.as_string(),
        };

        Ok(RowMetadata {
            operation,
            position,
            sequence,
            transaction_id,
        })
    }

    /// 데이터 컬럼을 이름과 짝지어 반환
    pub fn data_image(&self, names: &[String], reserved_leading: usize) -> HashMap<String, CellValue> {
        names
            .iter()
            .zip(self.values.iter().skip(reserved_leading))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// CDC 변경 이벤트 (application-level view)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// 연산 타입
    pub op: OperationType,
    /// 원본 테이블
    pub table: String,
    /// 캡처 식별자
    pub capture_name: String,
    /// 변경 전 데이터 (UPDATE/DELETE의 경우)
    pub before: Option<HashMap<String, CellValue>>,
    /// 변경 후 데이터 (READ/INSERT/UPDATE의 경우)
    pub after: Option<HashMap<String, CellValue>>,
    /// 변경이 기록된 로그 위치
    pub position: Lsn,
    /// 트랜잭션 ID (있는 경우)
    pub transaction_id: Option<String>,
    /// 트랜잭션 내 순서
    pub sequence: u64,
    /// TimestampPolicy로 계산된 타임스탬프
    pub timestamp: DateTime<Utc>,
    /// 스냅샷 중 생성된 이벤트 여부
    pub snapshot: bool,
}

impl ChangeEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.position, self.sequence)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let image = |img: &Option<HashMap<String, CellValue>>| {
            img.as_ref().map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<serde_json::Map<_, _>>()
            })
        };

        serde_json::json!({
            "op": self.op.code(),
            "before": image(&self.before),
            "after": image(&self.after),
            "source": {
                "table": self.table,
                "capture": self.capture_name,
                "lsn": self.position.to_hex(),
                "seq": self.sequence,
                "txid": self.transaction_id,
                "snapshot": self.snapshot,
                "ts_ms": self.timestamp.timestamp_millis(),
            },
            "ts_ms": self.timestamp.timestamp_millis(),
        })
    }
}
