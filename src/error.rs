//! CDC 관련 에러 타입
//!
//! 모든 에러는 일시적(Transient) 에러와 치명적(fatal) 에러로 분류됩니다.
//! 일시적 에러는 poller가 backoff 후 재시도하고, 치명적 에러는 해당 테이블의 루프만 종료시킵니다.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("일시적 에러: {0}")]
    Transient(String),

    #[error("{table} 테이블 스키마 불일치: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("{table} 테이블 오프셋 손상: {reason}")]
    CorruptOffset { table: String, reason: String },

    #[error("{table} 테이블 캡처 정체: {polls}회 연속 상한 위치가 그대로입니다")]
    StalledCapture { table: String, polls: u32 },

    #[error("싱크 일시적 에러: {0}")]
    SinkTransient(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("취소되었습니다")]
    Cancelled,

    #[error("{0} 테이블 태스크가 비정상 종료되었습니다")]
    TaskAborted(String),
}

impl CdcError {
    pub fn schema_mismatch(table: impl Into<String>, detail: impl Into<String>) -> Self {
        CdcError::SchemaMismatch {
            table: table.into(),
            detail: detail.into(),
        }
    }

    pub fn corrupt_offset(table: impl Into<String>, reason: impl Into<String>) -> Self {
        CdcError::CorruptOffset {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// backoff 후 재시도 가능한 에러인지 여부
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CdcError::Transient(_) | CdcError::SinkTransient(_) | CdcError::ConnectionError(_)
        )
    }

    /// 해당 테이블의 스트리밍을 중단시켜야 하는 에러인지 여부
    ///
    /// StalledCapture는 운영자에게 보고만 하고 루프는 계속 돌아갑니다.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient() && !matches!(self, CdcError::StalledCapture { .. })
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Io(e) => CdcError::Transient(e.to_string()),
            mysql_async::Error::Driver(e) => CdcError::Transient(e.to_string()),
            mysql_async::Error::Server(ref e) if is_transient_server_code(e.code) => {
                CdcError::Transient(err.to_string())
            }
            other => CdcError::QueryError(other.to_string()),
        }
    }
}

/// 재시도로 해결될 수 있는 MySQL 서버 에러 코드
fn is_transient_server_code(code: u16) -> bool {
    matches!(
        code,
        1040 // ER_CON_COUNT_ERROR
            | 1053 // ER_SERVER_SHUTDOWN
            | 1205 // ER_LOCK_WAIT_TIMEOUT
            | 1213 // ER_LOCK_DEADLOCK
    )
}

pub type Result<T> = std::result::Result<T, CdcError>;
