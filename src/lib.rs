//! MySQL 변경 로그 테이블 기반 CDC (Change Data Capture) 스트리밍 핵심 구현
//!
//! 이 라이브러리는 트리거로 채워지는 변경 로그 테이블을 주기적으로 조회해 변경 이벤트를 전달합니다.
//! 주요 기능:
//! - 로그 위치(LSN) 기반 window polling과 순서 보장
//! - commit 시각 / 처리 시각 타임스탬프 정책
//! - 초기 스냅샷과 스트리밍 사이 빈틈 없는 전환
//! - 테이블별 오프셋 저장과 재시작 시 이어받기

pub mod cdc_engine;
pub mod connection;
pub mod error;
pub mod events;
pub mod offset;
pub mod offset_store;
pub mod poller;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod timestamp;

#[cfg(test)]
mod testing;

pub use cdc_engine::{CaptureTable, CdcConfig, CdcEngine, TableOutcome};
pub use connection::{ConnectionConfig, MySqlChangeSource};
pub use error::{CdcError, Result};
pub use events::{CellValue, ChangeEvent, ChangeRow, ChangeTableDescriptor, OperationType};
pub use offset::{EventKey, Lsn, OffsetRecord, ProcessingState};
pub use offset_store::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
pub use poller::{ChangeStreamPoller, PollOutcome, PollerConfig};
pub use sink::{ChannelSink, EventSink};
pub use snapshot::{SnapshotCoordinator, SnapshotMode};
pub use source::{ChangeSource, SnapshotScan};
pub use timestamp::{Clock, SystemClock, TimestampPolicy};
