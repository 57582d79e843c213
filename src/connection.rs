//! MySQL 데이터베이스 연결 관리와 변경 로그 조회
//!
//! 캡처 대상 테이블 `<schema>.<table>`마다 같은 스키마에 트리거로 채워지는 변경 로그 테이블
//! `cdc_<capture>`가 있다고 가정합니다. 변경 로그 테이블의 컬럼 순서는 다음과 같습니다.
//!
//! ```text
//! __op, __start_lsn, __seqval, __txid, <데이터 컬럼...>, __commit_time
//! ```

use crate::error::{CdcError, Result};
use crate::events::{CellValue, ChangeRow, ChangeTableDescriptor};
use crate::offset::Lsn;
use crate::source::{ChangeSource, SnapshotScan};
use crate::timestamp::COMMIT_TIME_COLUMN;
use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, IsolationLevel, Opts, OptsBuilder, Pool, Row, TxOpts, Value};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 변경 로그 테이블 이름 접두사
pub const CHANGE_TABLE_PREFIX: &str = "cdc_";

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 스키마 없이 지정된 테이블에 쓰이는 기본 데이터베이스
    pub database: Option<String>,
    pub timeout: Duration,
    /// 서버가 시간대 변환을 못 할 때 commit 시각 해석에 쓰는 UTC 오프셋.
    /// 없으면 연결 시 서버에 물어봅니다.
    pub server_time_zone: Option<FixedOffset>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            timeout: Duration::from_secs(30),
            server_time_zone: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,63}$").expect("valid identifier regex"))
}

pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    if !identifier_pattern().is_match(name) {
        return Err(CdcError::ConfigError(format!("invalid identifier '{}'", name)));
    }
    Ok(())
}

/// 쿼리에 직접 넣을 식별자 검증 후 backtick 인용
fn quote_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name))
}

fn quote_columns(columns: &[String]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

fn max_position_query(schema: &str, capture_name: &str) -> Result<String> {
    Ok(format!(
        "SELECT COALESCE(MAX(`__start_lsn`), 0) FROM {}.{}",
        quote_identifier(schema)?,
        quote_identifier(&format!("{}{}", CHANGE_TABLE_PREFIX, capture_name))?
    ))
}

fn changes_query(schema: &str, table: &ChangeTableDescriptor, timestamp_fragment: &str) -> Result<String> {
    Ok(format!(
        "SELECT `__op`, `__start_lsn`, `__seqval`, `__txid`, {}{} FROM {}.{} \
         WHERE `__start_lsn` BETWEEN ? AND ? \
         ORDER BY `__start_lsn`, `__seqval`, `__op`",
        quote_columns(&table.columns)?,
        timestamp_fragment,
        quote_identifier(schema)?,
        quote_identifier(&format!("{}{}", CHANGE_TABLE_PREFIX, table.capture_name))?
    ))
}

/// 원본 테이블 전체 조회문. 기본 키가 없으면 전체 컬럼 순으로 정렬합니다.
fn snapshot_query(
    schema: &str,
    table_name: &str,
    columns: &[String],
    key_columns: &[String],
) -> Result<String> {
    let order_by = if key_columns.is_empty() {
        columns
    } else {
        key_columns
    };
    Ok(format!(
        "SELECT {} FROM {}.{} ORDER BY {}",
        quote_columns(columns)?,
        quote_identifier(schema)?,
        quote_identifier(table_name)?,
        quote_columns(order_by)?
    ))
}

/// UTC 오프셋 파싱 ("+09:00", "-0530", "UTC")
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return Ok(Utc.fix());
    }
    value
        .parse::<FixedOffset>()
        .map_err(|e| CdcError::ConfigError(format!("invalid time zone offset '{}': {}", value, e)))
}

/// MySQL 값을 셀 값으로 변환
///
/// 바이너리 프로토콜 기준입니다. DATETIME/TIMESTAMP는 일단 UTC로 읽고,
/// 세션 시간대 보정은 [`session_to_utc`]에서 합니다.
pub(crate) fn to_cell_value(value: Value) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(i) => CellValue::Int64(i),
        Value::UInt(u) => CellValue::UInt64(u),
        Value::Float(f) => CellValue::Float(f),
        Value::Double(d) => CellValue::Double(d),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => CellValue::String(s),
            Err(e) => CellValue::Bytes(e.into_bytes()),
        },
        Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                .and_then(|d| d.and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros))
                .map(|dt| CellValue::DateTime(dt.and_utc()))
                // 0000-00-00 같은 값은 문자열로 보존
                .unwrap_or_else(|| {
                    CellValue::Date(format!(
                        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                        year, month, day, hour, minute, second, micros
                    ))
                })
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => CellValue::Time(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if negative { "-" } else { "" },
            days * 24 + hours as u32,
            minutes,
            seconds,
            micros
        )),
    }
}

/// 컬럼 타입을 고려한 변환. DECIMAL과 JSON은 텍스트로 오므로 여기서 구분합니다.
pub(crate) fn typed_cell_value(value: Value, column_type: ColumnType) -> CellValue {
    match (column_type, value) {
        (_, Value::NULL) => CellValue::Null,
        (ColumnType::MYSQL_TYPE_NEWDECIMAL | ColumnType::MYSQL_TYPE_DECIMAL, Value::Bytes(bytes)) => {
            match String::from_utf8(bytes) {
                Ok(s) => CellValue::Decimal(s),
                Err(e) => CellValue::Bytes(e.into_bytes()),
            }
        }
        (ColumnType::MYSQL_TYPE_JSON, Value::Bytes(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(json) => CellValue::Json(json),
            Err(e) => {
                warn!("Malformed JSON column value: {}", e);
                to_cell_value(Value::Bytes(bytes))
            }
        },
        (_, value) => to_cell_value(value),
    }
}

/// 세션 시간대로 기록된 DATETIME을 UTC로 옮김
pub(crate) fn session_to_utc(value: CellValue, offset: FixedOffset) -> CellValue {
    match value {
        CellValue::DateTime(dt) => match offset.from_local_datetime(&dt.naive_utc()).single() {
            Some(local) => CellValue::DateTime(local.with_timezone(&Utc)),
            None => CellValue::DateTime(dt),
        },
        other => other,
    }
}

fn row_values(mut row: Row) -> Vec<CellValue> {
    let types: Vec<ColumnType> = row.columns_ref().iter().map(|c| c.column_type()).collect();
    types
        .into_iter()
        .enumerate()
        .map(|(i, column_type)| typed_cell_value(row.take::<Value, _>(i).unwrap_or(Value::NULL), column_type))
        .collect()
}

/// MySQL 변경 로그 테이블 기반 [`ChangeSource`]
pub struct MySqlChangeSource {
    pool: Pool,
    config: ConnectionConfig,
    normalization: bool,
    /// 정규화가 안 될 때 commit 시각에 적용할 세션 오프셋
    session_offset: Option<FixedOffset>,
}

impl MySqlChangeSource {
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let pool = Pool::new(config.build_opts());

        let mut source = MySqlChangeSource {
            pool,
            config,
            normalization: false,
            session_offset: None,
        };

        let mut conn = source.get_conn().await?;
        source.normalization = check_timezone_support(&mut conn).await?;
        if !source.normalization {
            let offset = match source.config.server_time_zone {
                Some(offset) => offset,
                None => session_utc_offset(&mut conn).await?,
            };
            warn!(
                "Server cannot convert session time zone to UTC, reading commit timestamps as {}",
                offset
            );
            source.session_offset = Some(offset);
        }
        info!(
            "Connected to MySQL {}:{} (timestamp normalization: {})",
            source.config.hostname, source.config.port, source.normalization
        );

        Ok(source)
    }

    async fn get_conn(&self) -> Result<Conn> {
        match tokio::time::timeout(self.config.timeout, self.pool.get_conn()).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(CdcError::Transient(format!(
                "timed out connecting to {}:{}",
                self.config.hostname, self.config.port
            ))),
        }
    }

    /// "schema.table" 분리. 스키마가 없으면 기본 데이터베이스 사용
    fn split_table_name(&self, source_table: &str) -> Result<(String, String)> {
        match source_table.split_once('.') {
            Some((schema, table)) => Ok((schema.to_string(), table.to_string())),
            None => match &self.config.database {
                Some(db) => Ok((db.clone(), source_table.to_string())),
                None => Err(CdcError::ConfigError(format!(
                    "table '{}' has no schema and no default database is set",
                    source_table
                ))),
            },
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.pool.clone().disconnect().await?;
        Ok(())
    }
}

/// 세션 시간대에서 UTC로의 변환이 가능한지 확인
async fn check_timezone_support(conn: &mut Conn) -> Result<bool> {
    let converted: Option<Option<String>> = conn
        .query_first("SELECT CONVERT_TZ('2000-01-01 00:00:00', @@session.time_zone, '+00:00')")
        .await?;
    Ok(matches!(converted, Some(Some(_))))
}

/// 현재 세션 시각과 UTC의 차이
async fn session_utc_offset(conn: &mut Conn) -> Result<FixedOffset> {
    let seconds: Option<i64> = conn
        .query_first("SELECT TIMESTAMPDIFF(SECOND, UTC_TIMESTAMP(), NOW())")
        .await?;
    let seconds = seconds.unwrap_or(0);
    i32::try_from(seconds)
        .ok()
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| CdcError::QueryError(format!("session time zone offset out of range: {}s", seconds)))
}

#[async_trait]
impl ChangeSource for MySqlChangeSource {
    async fn current_max_position(&self, table: &ChangeTableDescriptor) -> Result<Lsn> {
        let (schema, _) = self.split_table_name(&table.source_table)?;
        let query = max_position_query(&schema, &table.capture_name)?;

        let mut conn = self.get_conn().await?;
        let max: Option<u64> = conn.query_first(query).await?;
        Ok(Lsn::new(max.unwrap_or(0)))
    }

    async fn retrieve_changes(
        &self,
        table: &ChangeTableDescriptor,
        low: Lsn,
        high: Lsn,
        timestamp_fragment: &str,
    ) -> Result<Vec<ChangeRow>> {
        let (schema, _) = self.split_table_name(&table.source_table)?;
        let query = changes_query(&schema, table, timestamp_fragment)?;
        debug!("Retrieving changes for {} in [{}, {}]", table.source_table, low, high);

        let mut conn = self.get_conn().await?;
        let rows: Vec<Row> = conn.exec(query, (low.value(), high.value())).await?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect::<Vec<_>>()
            .into();

        let session_offset = self
            .session_offset
            .filter(|_| columns.last().map(|c| c == COMMIT_TIME_COLUMN).unwrap_or(false));

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut values = row_values(row);
                if let (Some(offset), Some(last)) = (session_offset, values.pop()) {
                    values.push(session_to_utc(last, offset));
                }
                ChangeRow::new(columns.clone(), values)
            })
            .collect())
    }

    async fn snapshot(&self, table: &ChangeTableDescriptor) -> Result<SnapshotScan> {
        let (schema, table_name) = self.split_table_name(&table.source_table)?;
        let max_query = max_position_query(&schema, &table.capture_name)?;
        let query = snapshot_query(&schema, &table_name, &table.columns, &table.key_columns)?;

        let mut conn = self.get_conn().await?;
        let mut tx_opts = TxOpts::default();
        tx_opts
            .with_consistent_snapshot(true)
            .with_isolation_level(IsolationLevel::RepeatableRead)
            .with_readonly(Some(true));

        // 최대 위치와 행을 같은 read view에서 읽음
        let mut tx = conn.start_transaction(tx_opts).await?;
        let max: Option<u64> = tx.query_first(max_query).await?;
        let rows: Vec<Row> = tx.exec(query, ()).await?;
        tx.commit().await?;

        let position = Lsn::new(max.unwrap_or(0));
        debug!(
            "Read {} snapshot rows from {} at position {}",
            rows.len(),
            table.source_table,
            position
        );
        Ok(SnapshotScan {
            position,
            rows: rows.into_iter().map(row_values).collect(),
        })
    }

    async fn describe_table(&self, source_table: &str, capture_name: &str) -> Result<ChangeTableDescriptor> {
        let (schema, table_name) = self.split_table_name(source_table)?;
        let change_table = format!("{}{}", CHANGE_TABLE_PREFIX, capture_name);

        let mut conn = self.get_conn().await?;
        let names: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (schema.as_str(), change_table.as_str()),
            )
            .await?;

        let columns: Vec<String> = names.into_iter().filter(|n| !n.starts_with("__")).collect();
        if columns.is_empty() {
            return Err(CdcError::QueryError(format!(
                "change table {}.{} not found or has no data columns",
                schema, change_table
            )));
        }

        let key_columns: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY ORDINAL_POSITION",
                (schema.as_str(), table_name.as_str()),
            )
            .await?;
        if key_columns.is_empty() {
            warn!("{} has no primary key, snapshot rows are ordered by all columns", source_table);
        }

        Ok(ChangeTableDescriptor::new(source_table, capture_name, columns).with_key_columns(key_columns))
    }

    fn supports_timestamp_normalization(&self) -> bool {
        self.normalization
    }
}
