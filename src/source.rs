//! 변경 로그 조회 기능 (query-execution capability)
//!
//! 여러 테이블 루프가 동시에 사용하므로 구현체는 `Send + Sync`여야 합니다.

use crate::error::Result;
use crate::events::{CellValue, ChangeRow, ChangeTableDescriptor};
use crate::offset::Lsn;
use async_trait::async_trait;

/// 스냅샷 읽기 결과
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotScan {
    /// 행을 읽은 시점의 최대 로그 위치
    pub position: Lsn,
    /// descriptor 컬럼 순서의 행, 기본 키 순서
    pub rows: Vec<Vec<CellValue>>,
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// 현재 조회 가능한 가장 큰 로그 위치
    async fn current_max_position(&self, table: &ChangeTableDescriptor) -> Result<Lsn>;

    /// `[low, high]` 범위의 변경 행 조회
    ///
    /// `timestamp_fragment`는 [`crate::timestamp::TimestampPolicy::query_timestamp_fragment`]의 결과입니다.
    async fn retrieve_changes(
        &self,
        table: &ChangeTableDescriptor,
        low: Lsn,
        high: Lsn,
        timestamp_fragment: &str,
    ) -> Result<Vec<ChangeRow>>;

    /// 같은 읽기 시점의 최대 위치와 원본 테이블 행 전체
    ///
    /// 위치와 행이 한 시점이어야 스캔에 보인 변경이 스트리밍에서 다시 나오지 않고,
    /// 스캔에 안 보인 변경은 위치 이후로 스트리밍됩니다.
    async fn snapshot(&self, table: &ChangeTableDescriptor) -> Result<SnapshotScan>;

    /// 캡처 대상 테이블의 현재 컬럼 목록
    async fn describe_table(&self, source_table: &str, capture_name: &str)
        -> Result<ChangeTableDescriptor>;

    /// commit 시각을 UTC로 정규화할 수 있는지 여부
    fn supports_timestamp_normalization(&self) -> bool {
        false
    }

    /// 조회 결과가 (위치, sequence) 순서로 정렬되어 반환됨이 보장되는지 여부
    fn guarantees_order(&self) -> bool {
        true
    }
}
