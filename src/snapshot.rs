//! 초기 스냅샷과 스트리밍 전환
//!
//! 저장된 오프셋이 없는 테이블에 대해 한 번만 실행됩니다.
//! 최대 위치 P0와 행 전체를 한 읽기 시점에서 가져오고, 스냅샷이 끝나면 P0를 스트리밍 시작점으로 저장합니다.
//! 스캔과 동시에 commit된 변경은 P0 이전이면 스냅샷에만, 이후면 스트리밍에만 나타납니다.
//! 스냅샷 이벤트 키는 (P0, 기본 키 순서의 행 번호)라서 재실행해도 같은 행은 같은 키를 가집니다.

use crate::error::{CdcError, Result};
use crate::events::{CellValue, ChangeEvent, ChangeTableDescriptor, OperationType};
use crate::offset::{Lsn, OffsetRecord};
use crate::offset_store::OffsetStore;
use crate::poller::cancellable;
use crate::sink::EventSink;
use crate::source::ChangeSource;
use crate::timestamp::Clock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 스냅샷 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// 오프셋이 없으면 전체 행을 읽은 뒤 스트리밍
    #[default]
    Initial,
    /// 행은 읽지 않고 현재 위치부터 스트리밍
    SchemaOnly,
}

impl SnapshotMode {
    pub fn from_mode(mode: &str) -> Result<Self> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "initial" => Ok(SnapshotMode::Initial),
            "schema_only" | "no_data" => Ok(SnapshotMode::SchemaOnly),
            other => Err(CdcError::ConfigError(format!("unknown snapshot mode '{}'", other))),
        }
    }
}

pub struct SnapshotCoordinator {
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn OffsetStore>,
    clock: Arc<dyn Clock>,
    mode: SnapshotMode,
    cancel: CancellationToken,
}

impl SnapshotCoordinator {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn OffsetStore>,
        clock: Arc<dyn Clock>,
        mode: SnapshotMode,
        cancel: CancellationToken,
    ) -> Self {
        SnapshotCoordinator {
            source,
            sink,
            store,
            clock,
            mode,
            cancel,
        }
    }

    /// 스트리밍 시작 오프셋 결정
    ///
    /// 저장된 오프셋이 있으면 그대로 반환하고, 없으면 스냅샷 후 시드한 오프셋을 반환합니다.
    /// 스냅샷이 중간에 끊기면 오프셋을 저장하지 않으므로 다음 실행에서 처음부터 다시 합니다.
    pub async fn prepare(&self, descriptor: &ChangeTableDescriptor) -> Result<OffsetRecord> {
        let table = &descriptor.source_table;

        if let Some(offset) = self.store.load(table).await? {
            info!("Resuming {} from stored offset {}", table, offset);
            return Ok(offset);
        }

        let position = match self.mode {
            SnapshotMode::Initial => {
                let scan = cancellable(&self.cancel, self.source.snapshot(descriptor)).await?;
                info!(
                    "No offset for {}, snapshotting {} rows at position {}",
                    table,
                    scan.rows.len(),
                    scan.position
                );
                self.emit_rows(descriptor, scan.position, scan.rows).await?;
                info!("Snapshot complete for {}", table);
                scan.position
            }
            SnapshotMode::SchemaOnly => {
                let position =
                    cancellable(&self.cancel, self.source.current_max_position(descriptor)).await?;
                debug!("Snapshot mode is SchemaOnly, streaming {} from {}", table, position);
                position
            }
        };

        let offset = OffsetRecord::at_position(position);
        self.store.store(table, &offset).await?;
        Ok(offset)
    }

    async fn emit_rows(
        &self,
        descriptor: &ChangeTableDescriptor,
        position: Lsn,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<()> {
        let table = &descriptor.source_table;
        for (ordinal, values) in rows.into_iter().enumerate() {
            if values.len() != descriptor.columns.len() {
                return Err(CdcError::schema_mismatch(
                    table,
                    format!(
                        "snapshot row has {} values for {} columns",
                        values.len(),
                        descriptor.columns.len()
                    ),
                ));
            }

            let after = descriptor.columns.iter().cloned().zip(values).collect();
            let event = ChangeEvent {
                op: OperationType::Read,
                table: table.clone(),
                capture_name: descriptor.capture_name.clone(),
                before: None,
                after: Some(after),
                position,
                transaction_id: None,
                sequence: ordinal as u64,
                timestamp: self.clock.now(),
                snapshot: true,
            };
            cancellable(&self.cancel, self.sink.emit(event)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::EventKey;
    use crate::offset_store::MemoryOffsetStore;
    use crate::poller::{ChangeStreamPoller, PollerConfig};
    use crate::testing::{FakeSource, ManualClock, RecordingSink};
    use crate::timestamp::TimestampPolicy;
    use chrono::Utc;

    const CAPTURE: &str = "shop_orders";

    struct Harness {
        source: Arc<FakeSource>,
        sink: Arc<RecordingSink>,
        store: Arc<MemoryOffsetStore>,
        clock: Arc<ManualClock>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                source: Arc::new(FakeSource::new()),
                sink: Arc::new(RecordingSink::new()),
                store: Arc::new(MemoryOffsetStore::new()),
                clock: Arc::new(ManualClock::new(Utc::now())),
                cancel: CancellationToken::new(),
            }
        }

        fn coordinator(&self, mode: SnapshotMode) -> SnapshotCoordinator {
            SnapshotCoordinator::new(
                self.source.clone(),
                self.sink.clone(),
                self.store.clone(),
                self.clock.clone(),
                mode,
                self.cancel.clone(),
            )
        }

        fn poller(&self, start: OffsetRecord) -> ChangeStreamPoller {
            ChangeStreamPoller::new(
                Arc::new(self.source.descriptor(CAPTURE)),
                TimestampPolicy::Commit,
                PollerConfig::default(),
                self.source.clone(),
                self.sink.clone(),
                self.store.clone(),
                self.clock.clone(),
                self.cancel.clone(),
                start,
            )
        }
    }

    fn row(id: i64, name: &str) -> Vec<CellValue> {
        vec![CellValue::Int64(id), CellValue::String(name.to_string())]
    }

    #[tokio::test]
    async fn test_snapshot_seeds_offset_at_captured_position() {
        let h = Harness::new();
        h.source.seed_row(CAPTURE, row(1, "kim"));
        h.source.insert(CAPTURE, 40, 0, "tx-a", row(2, "lee"));

        let descriptor = h.source.descriptor(CAPTURE);
        let offset = h.coordinator(SnapshotMode::Initial).prepare(&descriptor).await.unwrap();

        assert_eq!(offset, OffsetRecord::at_position(Lsn::new(40)));
        assert_eq!(h.store.load("shop.orders").await.unwrap(), Some(offset));

        let events = h.sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.op == OperationType::Read && e.snapshot));
        assert!(events.iter().all(|e| e.position == Lsn::new(40)));
        assert_eq!(events[1].sequence, 1);
    }

    #[tokio::test]
    async fn test_stored_offset_skips_snapshot() {
        let h = Harness::new();
        h.source.seed_row(CAPTURE, row(1, "kim"));
        let stored = OffsetRecord::at_event(Lsn::new(7), Some("tx".into()), 2);
        h.store.store("shop.orders", &stored).await.unwrap();

        let descriptor = h.source.descriptor(CAPTURE);
        let offset = h.coordinator(SnapshotMode::Initial).prepare(&descriptor).await.unwrap();

        assert_eq!(offset, stored);
        assert!(h.sink.events().is_empty());
        assert_eq!(h.source.snapshot_calls(), 0);
    }

    #[tokio::test]
    async fn test_schema_only_reads_no_rows() {
        let h = Harness::new();
        h.source.seed_row(CAPTURE, row(1, "kim"));
        h.source.insert(CAPTURE, 3, 0, "tx-a", row(2, "lee"));

        let descriptor = h.source.descriptor(CAPTURE);
        let offset = h
            .coordinator(SnapshotMode::SchemaOnly)
            .prepare(&descriptor)
            .await
            .unwrap();

        assert_eq!(offset, OffsetRecord::at_position(Lsn::new(3)));
        assert!(h.sink.events().is_empty());
        assert_eq!(h.source.snapshot_calls(), 0);
    }

    fn deliveries_of(events: &[ChangeEvent], id: i64) -> Vec<&ChangeEvent> {
        events
            .iter()
            .filter(|e| e.after.as_ref().map(|a| a["id"] == CellValue::Int64(id)).unwrap_or(false))
            .collect()
    }

    #[tokio::test]
    async fn test_change_committed_after_scan_streams_once() {
        let h = Harness::new();
        h.source.seed_row(CAPTURE, row(1, "kim"));
        h.source.insert(CAPTURE, 10, 0, "tx-a", row(2, "lee"));
        h.source.during_snapshot(false, |state| {
            state.insert(CAPTURE, 11, 0, "tx-late", row(3, "park"));
        });

        let descriptor = h.source.descriptor(CAPTURE);
        let offset = h.coordinator(SnapshotMode::Initial).prepare(&descriptor).await.unwrap();
        assert_eq!(offset.position, Lsn::new(10));

        let mut poller = h.poller(offset);
        poller.poll_once().await.unwrap();

        let events = h.sink.events();
        for id in 1..=3 {
            assert_eq!(deliveries_of(&events, id).len(), 1, "row {} delivered more than once", id);
        }

        let late = deliveries_of(&events, 3);
        assert_eq!(late[0].op, OperationType::Insert);
        assert!(!late[0].snapshot);
        assert_eq!(late[0].key(), EventKey::new(Lsn::new(11), 0));
        assert_eq!(h.sink.dedup_keys().len(), events.len());
    }

    #[tokio::test]
    async fn test_change_committed_before_scan_is_snapshotted_once() {
        let h = Harness::new();
        h.source.seed_row(CAPTURE, row(1, "kim"));
        h.source.insert(CAPTURE, 10, 0, "tx-a", row(2, "lee"));
        h.source.during_snapshot(true, |state| {
            state.insert(CAPTURE, 11, 0, "tx-late", row(3, "park"));
        });

        let descriptor = h.source.descriptor(CAPTURE);
        let offset = h.coordinator(SnapshotMode::Initial).prepare(&descriptor).await.unwrap();
        // 위치와 행이 같은 시점이므로 늦은 commit도 시드 위치에 포함됨
        assert_eq!(offset.position, Lsn::new(11));

        let mut poller = h.poller(offset);
        poller.poll_once().await.unwrap();

        let events = h.sink.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.snapshot && e.position == Lsn::new(11)));
        for id in 1..=3 {
            assert_eq!(deliveries_of(&events, id).len(), 1, "row {} delivered more than once", id);
        }
        assert_eq!(
            h.sink.materialize()[&("shop.orders".to_string(), 3)]["name"],
            CellValue::String("park".into())
        );
    }

    #[tokio::test]
    async fn test_snapshot_ordinals_follow_key_order() {
        let h = Harness::new();
        h.source.seed_row(CAPTURE, row(30, "choi"));
        h.source.seed_row(CAPTURE, row(10, "kim"));
        h.source.seed_row(CAPTURE, row(20, "lee"));

        let descriptor = h.source.descriptor(CAPTURE);
        h.coordinator(SnapshotMode::Initial).prepare(&descriptor).await.unwrap();

        let ids: Vec<_> = h
            .sink
            .events()
            .iter()
            .map(|e| (e.sequence, e.after.as_ref().unwrap()["id"].clone()))
            .collect();
        assert_eq!(
            ids,
            vec![
                (0, CellValue::Int64(10)),
                (1, CellValue::Int64(20)),
                (2, CellValue::Int64(30)),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_snapshot_stores_no_offset() {
        let h = Harness::new();
        h.source.seed_row(CAPTURE, row(1, "kim"));
        h.cancel.cancel();

        let descriptor = h.source.descriptor(CAPTURE);
        let err = h
            .coordinator(SnapshotMode::Initial)
            .prepare(&descriptor)
            .await
            .unwrap_err();

        assert!(matches!(err, CdcError::Cancelled));
        assert!(h.store.load("shop.orders").await.unwrap().is_none());
    }

    #[test]
    fn test_snapshot_mode_parsing() {
        assert_eq!(SnapshotMode::from_mode("INITIAL").unwrap(), SnapshotMode::Initial);
        assert_eq!(SnapshotMode::from_mode("schema_only").unwrap(), SnapshotMode::SchemaOnly);
        assert!(SnapshotMode::from_mode("always").is_err());
    }
}
