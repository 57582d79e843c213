//! 테스트용 메모리 변경 로그, 기록 싱크, 수동 시계

use crate::error::{CdcError, Result};
use crate::events::{CellValue, ChangeEvent, ChangeRow, ChangeTableDescriptor, OperationType, RowOperation};
use crate::offset::{EventKey, Lsn};
use crate::sink::EventSink;
use crate::source::{ChangeSource, SnapshotScan};
use crate::timestamp::{Clock, COMMIT_TIME_COLUMN};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;

pub(crate) fn commit_time_of(lsn: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + lsn as i64, 0).unwrap()
}

fn source_table_of(capture: &str) -> String {
    capture.replacen('_', ".", 1)
}

fn row_id(values: &[CellValue]) -> i64 {
    match values.first() {
        Some(CellValue::Int64(id)) => *id,
        other => panic!("test rows must start with an Int64 id, got {:?}", other),
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    capture: String,
    op: RowOperation,
    lsn: u64,
    seq: u64,
    txid: String,
    values: Vec<CellValue>,
}

type SnapshotHook = Box<dyn FnOnce(&mut FakeState) + Send>;

pub(crate) struct FakeState {
    log: Vec<LogEntry>,
    tables: HashMap<String, BTreeMap<i64, Vec<CellValue>>>,
    guarantees_order: bool,
    reverse_results: bool,
    drop_commit_time: bool,
    broken_captures: HashSet<String>,
    retrieve_failures: VecDeque<CdcError>,
    retrieve_calls: Vec<Instant>,
    snapshot_hook: Option<(bool, SnapshotHook)>,
    snapshot_calls: usize,
}

impl FakeState {
    fn push(&mut self, capture: &str, op: RowOperation, lsn: u64, seq: u64, txid: &str, values: Vec<CellValue>) {
        self.log.push(LogEntry {
            capture: capture.to_string(),
            op,
            lsn,
            seq,
            txid: txid.to_string(),
            values,
        });
    }

    fn table(&mut self, capture: &str) -> &mut BTreeMap<i64, Vec<CellValue>> {
        self.tables.entry(capture.to_string()).or_default()
    }

    fn max_position(&self, capture: &str) -> Lsn {
        let max = self
            .log
            .iter()
            .filter(|e| e.capture == capture)
            .map(|e| e.lsn)
            .max()
            .unwrap_or(0);
        Lsn::new(max)
    }

    pub(crate) fn insert(&mut self, capture: &str, lsn: u64, seq: u64, txid: &str, values: Vec<CellValue>) {
        self.table(capture).insert(row_id(&values), values.clone());
        self.push(capture, RowOperation::Insert, lsn, seq, txid, values);
    }

    pub(crate) fn update(
        &mut self,
        capture: &str,
        lsn: u64,
        seq: u64,
        txid: &str,
        before: Vec<CellValue>,
        after: Vec<CellValue>,
    ) {
        self.table(capture).insert(row_id(&after), after.clone());
        self.push(capture, RowOperation::UpdateBefore, lsn, seq, txid, before);
        self.push(capture, RowOperation::UpdateAfter, lsn, seq, txid, after);
    }

    pub(crate) fn delete(&mut self, capture: &str, lsn: u64, seq: u64, txid: &str, values: Vec<CellValue>) {
        self.table(capture).remove(&row_id(&values));
        self.push(capture, RowOperation::Delete, lsn, seq, txid, values);
    }
}

/// 메모리 변경 로그. 모든 테이블은 `id`, `name` 두 컬럼을 가집니다.
pub(crate) struct FakeSource {
    state: Mutex<FakeState>,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        FakeSource {
            state: Mutex::new(FakeState {
                log: Vec::new(),
                tables: HashMap::new(),
                guarantees_order: true,
                reverse_results: false,
                drop_commit_time: false,
                broken_captures: HashSet::new(),
                retrieve_failures: VecDeque::new(),
                retrieve_calls: Vec::new(),
                snapshot_hook: None,
                snapshot_calls: 0,
            }),
        }
    }

    pub(crate) fn descriptor(&self, capture: &str) -> ChangeTableDescriptor {
        ChangeTableDescriptor::new(
            source_table_of(capture),
            capture,
            vec!["id".to_string(), "name".to_string()],
        )
        .with_key_columns(vec!["id".to_string()])
    }

    pub(crate) fn insert(&self, capture: &str, lsn: u64, seq: u64, txid: &str, values: Vec<CellValue>) {
        self.state.lock().insert(capture, lsn, seq, txid, values);
    }

    pub(crate) fn update(
        &self,
        capture: &str,
        lsn: u64,
        seq: u64,
        txid: &str,
        before: Vec<CellValue>,
        after: Vec<CellValue>,
    ) {
        self.state.lock().update(capture, lsn, seq, txid, before, after);
    }

    pub(crate) fn delete(&self, capture: &str, lsn: u64, seq: u64, txid: &str, values: Vec<CellValue>) {
        self.state.lock().delete(capture, lsn, seq, txid, values);
    }

    /// 변경 로그에 남지 않은 기존 행
    pub(crate) fn seed_row(&self, capture: &str, values: Vec<CellValue>) {
        self.state.lock().table(capture).insert(row_id(&values), values);
    }

    pub(crate) fn commit_time_of(&self, lsn: u64) -> DateTime<Utc> {
        commit_time_of(lsn)
    }

    pub(crate) fn set_guarantees_order(&self, guaranteed: bool) {
        self.state.lock().guarantees_order = guaranteed;
    }

    pub(crate) fn set_reverse_results(&self, reverse: bool) {
        self.state.lock().reverse_results = reverse;
    }

    pub(crate) fn set_drop_commit_time(&self, drop: bool) {
        self.state.lock().drop_commit_time = drop;
    }

    /// 해당 캡처의 조회 결과에서 commit 시각 컬럼을 빼버림
    pub(crate) fn break_capture(&self, capture: &str) {
        self.state.lock().broken_captures.insert(capture.to_string());
    }

    pub(crate) fn fail_next_retrieve(&self, error: CdcError) {
        self.state.lock().retrieve_failures.push_back(error);
    }

    pub(crate) fn retrieve_calls(&self) -> Vec<Instant> {
        self.state.lock().retrieve_calls.clone()
    }

    /// 스냅샷과 동시에 commit되는 변경.
    /// `before_read`면 읽기 시점 이전에 commit되어 위치와 행 모두에 반영되고,
    /// 아니면 읽기 시점 이후라 둘 다에 반영되지 않습니다.
    pub(crate) fn during_snapshot<F>(&self, before_read: bool, hook: F)
    where
        F: FnOnce(&mut FakeState) + Send + 'static,
    {
        self.state.lock().snapshot_hook = Some((before_read, Box::new(hook)));
    }

    pub(crate) fn snapshot_calls(&self) -> usize {
        self.state.lock().snapshot_calls
    }
}

#[async_trait]
impl ChangeSource for FakeSource {
    async fn current_max_position(&self, table: &ChangeTableDescriptor) -> Result<Lsn> {
        Ok(self.state.lock().max_position(&table.capture_name))
    }

    async fn retrieve_changes(
        &self,
        table: &ChangeTableDescriptor,
        low: Lsn,
        high: Lsn,
        timestamp_fragment: &str,
    ) -> Result<Vec<ChangeRow>> {
        let mut state = self.state.lock();
        state.retrieve_calls.push(Instant::now());
        if let Some(err) = state.retrieve_failures.pop_front() {
            return Err(err);
        }

        let with_commit_time = !timestamp_fragment.is_empty()
            && !state.drop_commit_time
            && !state.broken_captures.contains(&table.capture_name);

        let mut names = vec![
            "__op".to_string(),
            "__start_lsn".to_string(),
            "__seqval".to_string(),
            "__txid".to_string(),
        ];
        names.extend(table.columns.iter().cloned());
        if with_commit_time {
            names.push(COMMIT_TIME_COLUMN.to_string());
        }
        let columns: Arc<[String]> = names.into();

        let mut entries: Vec<&LogEntry> = state
            .log
            .iter()
            .filter(|e| e.capture == table.capture_name && e.lsn >= low.value() && e.lsn <= high.value())
            .collect();
        entries.sort_by_key(|e| (e.lsn, e.seq, e.op));
        if state.reverse_results {
            entries.reverse();
        }

        Ok(entries
            .into_iter()
            .map(|e| {
                let mut values = vec![
                    CellValue::Int64(e.op as i64),
                    CellValue::UInt64(e.lsn),
                    CellValue::UInt64(e.seq),
                    CellValue::String(e.txid.clone()),
                ];
                values.extend(e.values.iter().cloned());
                if with_commit_time {
                    values.push(CellValue::DateTime(commit_time_of(e.lsn)));
                }
                ChangeRow::new(columns.clone(), values)
            })
            .collect())
    }

    async fn snapshot(&self, table: &ChangeTableDescriptor) -> Result<SnapshotScan> {
        let mut state = self.state.lock();
        state.snapshot_calls += 1;
        let (before_read, mut hook) = match state.snapshot_hook.take() {
            Some((before_read, hook)) => (before_read, Some(hook)),
            None => (false, None),
        };

        if before_read {
            if let Some(h) = hook.take() {
                h(&mut *state);
            }
        }
        // 위치와 행을 같은 잠금 안에서 읽어 한 시점으로 맞춤
        let position = state.max_position(&table.capture_name);
        let rows = state.table(&table.capture_name).values().cloned().collect();
        if let Some(h) = hook {
            h(&mut *state);
        }

        Ok(SnapshotScan { position, rows })
    }

    async fn describe_table(&self, source_table: &str, capture_name: &str) -> Result<ChangeTableDescriptor> {
        let descriptor = self.descriptor(capture_name);
        if descriptor.source_table != source_table {
            return Err(CdcError::QueryError(format!("unknown table {}", source_table)));
        }
        Ok(descriptor)
    }

    fn supports_timestamp_normalization(&self) -> bool {
        true
    }

    fn guarantees_order(&self) -> bool {
        self.state.lock().guarantees_order
    }
}

struct SinkState {
    events: Vec<ChangeEvent>,
    fail_after: Option<(usize, CdcError)>,
    block_after: Option<usize>,
}

/// 받은 이벤트를 모두 기록하는 싱크
pub(crate) struct RecordingSink {
    state: Mutex<SinkState>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        RecordingSink {
            state: Mutex::new(SinkState {
                events: Vec::new(),
                fail_after: None,
                block_after: None,
            }),
        }
    }

    pub(crate) fn events(&self) -> Vec<ChangeEvent> {
        self.state.lock().events.clone()
    }

    /// `count`개를 받은 뒤 다음 emit 한 번을 실패시킴
    pub(crate) fn fail_after(&self, count: usize, error: CdcError) {
        self.state.lock().fail_after = Some((count, error));
    }

    pub(crate) fn clear_failure(&self) {
        self.state.lock().fail_after = None;
    }

    /// `count`개를 받은 뒤부터 emit이 영원히 대기
    pub(crate) fn block_after(&self, count: usize) {
        self.state.lock().block_after = Some(count);
    }

    pub(crate) fn dedup_keys(&self) -> BTreeSet<(String, EventKey)> {
        self.state
            .lock()
            .events
            .iter()
            .map(|e| (e.table.clone(), e.key()))
            .collect()
    }

    /// 이벤트를 순서대로 적용한 테이블별 최종 상태 (id 기준)
    pub(crate) fn materialize(&self) -> BTreeMap<(String, i64), HashMap<String, CellValue>> {
        let mut state = BTreeMap::new();
        for event in self.state.lock().events.iter() {
            match event.op {
                OperationType::Delete => {
                    if let Some(before) = &event.before {
                        state.remove(&(event.table.clone(), image_id(before)));
                    }
                }
                _ => {
                    if let Some(after) = &event.after {
                        state.insert((event.table.clone(), image_id(after)), after.clone());
                    }
                }
            }
        }
        state
    }
}

fn image_id(image: &HashMap<String, CellValue>) -> i64 {
    match image.get("id") {
        Some(CellValue::Int64(id)) => *id,
        other => panic!("image without Int64 id: {:?}", other),
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        let blocked = {
            let mut state = self.state.lock();
            match state.block_after {
                Some(n) if state.events.len() >= n => true,
                _ => {
                    if let Some((n, _)) = &state.fail_after {
                        if state.events.len() >= *n {
                            let (_, err) = state.fail_after.take().unwrap();
                            return Err(err);
                        }
                    }
                    state.events.push(event);
                    false
                }
            }
        };

        if blocked {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// 수동으로 움직이는 시계
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        ManualClock { now: Mutex::new(now) }
    }

    pub(crate) fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
