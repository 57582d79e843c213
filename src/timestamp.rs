//! 이벤트 타임스탬프 결정 전략
//!
//! 타임스탬프를 어디서 가져오는지와 변경 로그 조회 결과에 어떤 컬럼이 추가되는지는
//! 항상 함께 바뀌어야 하므로 한 곳([`TimestampPolicy`])에서 관리합니다.

use crate::error::{CdcError, Result};
use crate::events::{CellValue, ChangeRow};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// 변경 로그 테이블의 commit 시각 컬럼
pub const COMMIT_TIME_COLUMN: &str = "__commit_time";

/// 현재 시각 공급자 (테스트에서 고정 시각 주입용)
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 실제 시스템 시계
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 이벤트 타임스탬프 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPolicy {
    /// 변경이 DB에 commit된 시각 (조회 결과의 마지막 컬럼)
    #[default]
    Commit,
    /// 커넥터가 이벤트를 처리한 시각
    Processing,
}

impl TimestampPolicy {
    pub fn value(&self) -> &'static str {
        match self {
            TimestampPolicy::Commit => "commit",
            TimestampPolicy::Processing => "processing",
        }
    }

    /// 설정 값 파싱. 알 수 없는 값은 기본값(commit)으로 대체합니다.
    pub fn from_mode(mode: &str) -> Self {
        mode.parse().unwrap_or_else(|_| {
            warn!("Unknown timestamp mode '{}', falling back to 'commit'", mode);
            TimestampPolicy::default()
        })
    }

    /// 조회 결과 끝에 추가되는 컬럼 수
    pub fn trailing_columns(&self) -> usize {
        match self {
            TimestampPolicy::Commit => 1,
            TimestampPolicy::Processing => 0,
        }
    }

    /// 이벤트 타임스탬프 계산
    pub fn derive_timestamp(
        &self,
        table: &str,
        row: &ChangeRow,
        clock: &dyn Clock,
    ) -> Result<DateTime<Utc>> {
        match self {
            TimestampPolicy::Processing => Ok(clock.now()),
            TimestampPolicy::Commit => {
                let has_column = row
                    .columns
                    .last()
                    .map(|c| c == COMMIT_TIME_COLUMN)
                    .unwrap_or(false);
                if !has_column || row.len() != row.columns.len() {
                    return Err(CdcError::schema_mismatch(
                        table,
                        format!("commit timestamp column {} missing from result", COMMIT_TIME_COLUMN),
                    ));
                }
                match row.last() {
                    Some(CellValue::DateTime(dt)) => Ok(*dt),
                    Some(CellValue::String(s)) => parse_commit_time(s).ok_or_else(|| {
                        CdcError::schema_mismatch(table, format!("unparsable commit time '{}'", s))
                    }),
                    other => Err(CdcError::schema_mismatch(
                        table,
                        format!("commit time has unexpected value {:?}", other),
                    )),
                }
            }
        }
    }

    /// 변경 로그 조회문에 끼워 넣을 SELECT 조각
    ///
    /// 서버가 지원하면 commit 시각을 UTC로 변환해서 가져옵니다.
    pub fn query_timestamp_fragment(&self, supports_normalization: bool) -> String {
        match self {
            TimestampPolicy::Processing => String::new(),
            TimestampPolicy::Commit if supports_normalization => format!(
                ", CONVERT_TZ(`{col}`, @@session.time_zone, '+00:00') AS `{col}`",
                col = COMMIT_TIME_COLUMN
            ),
            TimestampPolicy::Commit => format!(", `{}`", COMMIT_TIME_COLUMN),
        }
    }

    /// 조회 결과 컬럼 중 실제 데이터 컬럼 이름
    ///
    /// 앞쪽 예약 컬럼과, Commit 모드에서는 마지막 timestamp 컬럼을 제외합니다.
    pub fn data_column_names(&self, columns: &[String], leading_reserved: usize) -> Vec<String> {
        let count = columns
            .len()
            .saturating_sub(leading_reserved)
            .saturating_sub(self.trailing_columns());
        columns
            .iter()
            .skip(leading_reserved)
            .take(count)
            .cloned()
            .collect()
    }
}

/// 정규화된 commit 시각 문자열 파싱 (RFC 3339 또는 MySQL DATETIME 형식)
fn parse_commit_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

impl fmt::Display for TimestampPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

impl FromStr for TimestampPolicy {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commit" => Ok(TimestampPolicy::Commit),
            "processing" => Ok(TimestampPolicy::Processing),
            other => Err(CdcError::ConfigError(format!(
                "unknown timestamp mode '{}', expected commit or processing",
                other
            ))),
        }
    }
}
