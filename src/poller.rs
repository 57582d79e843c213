//! 변경 로그 polling 루프
//!
//! 테이블 하나당 poller 하나가 다음 순서로 반복합니다:
//! 1. Windowing: `[offset 다음 위치, 현재 최대 위치]` 범위 계산
//! 2. Retrieving: 범위 안의 변경 행 조회
//! 3. Emitting: 행을 이벤트로 변환해 싱크로 전달
//! 4. Committing: 싱크가 받아들인 이벤트까지 오프셋 저장
//!
//! 일시적 에러는 지수 backoff 후 재시도하고, 취소 신호는 sleep/조회/전달 중 언제든 확인합니다.

use crate::error::{CdcError, Result};
use crate::events::{
    CellValue, ChangeEvent, ChangeRow, ChangeTableDescriptor, OperationType, RowMetadata,
    RowOperation,
};
use crate::offset::{Lsn, OffsetRecord};
use crate::offset_store::OffsetStore;
use crate::sink::EventSink;
use crate::source::ChangeSource;
use crate::timestamp::{Clock, TimestampPolicy};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// poller 설정
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// 새 변경이 없을 때 다음 poll까지 대기 시간
    pub poll_interval: Duration,
    /// 일시적 에러 후 최초 대기 시간
    pub backoff_min: Duration,
    /// 일시적 에러 후 최대 대기 시간
    pub backoff_max: Duration,
    /// 상한 위치가 이 횟수만큼 연속으로 그대로면 capture 정체로 보고
    pub stall_threshold: u32,
    /// 이 개수만큼 이벤트가 전달될 때마다 오프셋 저장 (window 끝에서는 항상 저장)
    pub commit_batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            poll_interval: Duration::from_millis(500),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            stall_threshold: 10,
            commit_batch_size: 1,
        }
    }
}

impl PollerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(CdcError::ConfigError("poll interval must be > 0".into()));
        }
        if self.backoff_min.is_zero() || self.backoff_min > self.backoff_max {
            return Err(CdcError::ConfigError(
                "backoff bounds must satisfy 0 < min <= max".into(),
            ));
        }
        if self.stall_threshold == 0 {
            return Err(CdcError::ConfigError("stall threshold must be > 0".into()));
        }
        if self.commit_batch_size == 0 {
            return Err(CdcError::ConfigError("commit batch size must be > 0".into()));
        }
        Ok(())
    }
}

/// 상한이 있는 지수 backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    /// 다음 대기 시간. 호출할 때마다 두 배씩 늘어나며 `max`를 넘지 않습니다.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .min
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// poller 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Windowing,
    Retrieving,
    Emitting,
    Committing,
    Backoff,
    Stopped,
}

/// 한 번의 poll 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// 전달된 이벤트 수
    Emitted(usize),
    /// 새 변경 없음
    Empty,
    /// 상한 위치가 `polls`번 연속으로 그대로임 (프로세스에는 치명적이지 않음)
    Stalled { polls: u32 },
}

pub struct ChangeStreamPoller {
    descriptor: Arc<ChangeTableDescriptor>,
    policy: TimestampPolicy,
    config: PollerConfig,
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn OffsetStore>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    /// 싱크가 받아들인 마지막 이벤트
    cursor: OffsetRecord,
    /// 싱크가 받아들였지만 아직 저장하지 않은 이벤트 수
    uncommitted: usize,
    /// 다음 window 하한. 끝까지 처리한 window의 마지막 위치 다음으로 올라갑니다.
    next_low: Lsn,
    last_high: Option<Lsn>,
    stalled_polls: u32,
    backoff: Backoff,
    state: PollState,
}

impl ChangeStreamPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: Arc<ChangeTableDescriptor>,
        policy: TimestampPolicy,
        config: PollerConfig,
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn OffsetStore>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        start: OffsetRecord,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_min, config.backoff_max);
        ChangeStreamPoller {
            descriptor,
            policy,
            config,
            source,
            sink,
            store,
            clock,
            cancel,
            next_low: start.resume_low(),
            cursor: start,
            uncommitted: 0,
            last_high: None,
            stalled_polls: 0,
            backoff,
            state: PollState::Idle,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// 싱크가 받아들인 마지막 위치
    pub fn cursor(&self) -> &OffsetRecord {
        &self.cursor
    }

    pub fn descriptor(&self) -> &Arc<ChangeTableDescriptor> {
        &self.descriptor
    }

    /// 스키마 변경 시 descriptor 교체
    pub fn replace_descriptor(&mut self, descriptor: Arc<ChangeTableDescriptor>) {
        info!(
            "Replacing descriptor for {}: {} -> {} columns",
            self.descriptor.source_table,
            self.descriptor.columns.len(),
            descriptor.columns.len()
        );
        self.descriptor = descriptor;
    }

    fn table(&self) -> &str {
        &self.descriptor.source_table
    }

    /// 취소될 때까지 polling. 정상 종료 시 `Ok(())`, 치명적 에러 시 `Err`.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Starting change stream for {} from {} ({} timestamps)",
            self.table(),
            self.cursor,
            self.policy
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let pause = match self.poll_once().await {
                Ok(outcome) => {
                    self.backoff.reset();
                    match outcome {
                        PollOutcome::Emitted(n) if n > 0 => None,
                        PollOutcome::Emitted(_) | PollOutcome::Empty => Some(self.config.poll_interval),
                        PollOutcome::Stalled { polls } => {
                            let report = CdcError::StalledCapture {
                                table: self.table().to_string(),
                                polls,
                            };
                            warn!("{}", report);
                            Some(self.config.poll_interval)
                        }
                    }
                }
                Err(CdcError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    error!("Stopping change stream for {}: {}", self.table(), e);
                    self.state = PollState::Stopped;
                    return Err(e);
                }
                Err(e) => {
                    self.state = PollState::Backoff;
                    let delay = self.backoff.next_delay();
                    warn!(
                        "Retryable failure on {} (attempt {}), retrying in {:?}: {}",
                        self.table(),
                        self.backoff.attempt(),
                        delay,
                        e
                    );
                    Some(delay)
                }
            };

            if let Some(delay) = pause {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.state = PollState::Stopped;
        info!("Change stream for {} stopped at {}", self.table(), self.cursor);
        Ok(())
    }

    /// poll 한 번 수행
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        self.state = PollState::Windowing;
        let low = self.next_low.max(self.cursor.resume_low());
        let high = cancellable(
            &self.cancel,
            self.source.current_max_position(&self.descriptor),
        )
        .await?;

        let stalled = self.track_upper_bound(high);

        let emitted = if high < low {
            trace!("No new changes for {} (low={}, high={})", self.table(), low, high);
            0
        } else {
            self.state = PollState::Retrieving;
            let fragment = self
                .policy
                .query_timestamp_fragment(self.source.supports_timestamp_normalization());
            let rows = cancellable(
                &self.cancel,
                self.source
                    .retrieve_changes(&self.descriptor, low, high, &fragment),
            )
            .await?;
            trace!("Window [{}, {}] returned {} rows for {}", low, high, rows.len(), self.table());

            self.state = PollState::Emitting;
            let events = self.build_events(rows)?;
            let emitted = self.emit_all(events).await?;

            // 이 window에서 본 cursor 위치의 변경은 모두 처리됨.
            // 늦게 보이는 변경을 위해 high가 아니라 cursor 기준으로만 올립니다.
            if self.cursor.position >= low {
                self.next_low = self.cursor.position.increment();
            }
            emitted
        };

        self.state = PollState::Idle;

        if emitted > 0 {
            debug!("Emitted {} events for {}, cursor {}", emitted, self.table(), self.cursor);
            return Ok(PollOutcome::Emitted(emitted));
        }
        match stalled {
            Some(polls) => Ok(PollOutcome::Stalled { polls }),
            None if high < low => Ok(PollOutcome::Empty),
            None => Ok(PollOutcome::Emitted(0)),
        }
    }

    /// 상한 위치가 이전 window와 같으면 정체 횟수 증가.
    /// 임계값에 도달할 때마다 `Some(횟수)` 반환.
    fn track_upper_bound(&mut self, high: Lsn) -> Option<u32> {
        if self.last_high == Some(high) {
            self.stalled_polls += 1;
            debug!(
                "Upper bound {} unchanged for {} ({} polls)",
                high,
                self.table(),
                self.stalled_polls
            );
        } else {
            self.stalled_polls = 0;
            self.last_high = Some(high);
        }

        if self.stalled_polls > 0 && self.stalled_polls % self.config.stall_threshold == 0 {
            Some(self.stalled_polls)
        } else {
            None
        }
    }

    /// 조회 결과를 검증, 정렬하고 이벤트로 변환
    fn build_events(&self, rows: Vec<ChangeRow>) -> Result<Vec<ChangeEvent>> {
        let table = self.table().to_string();
        let descriptor = &self.descriptor;

        if let Some(first) = rows.first() {
            let names = self
                .policy
                .data_column_names(&first.columns, descriptor.reserved_leading);
            if names != descriptor.columns {
                return Err(CdcError::schema_mismatch(
                    &table,
                    format!(
                        "result columns {:?} do not match captured columns {:?}",
                        names, descriptor.columns
                    ),
                ));
            }
        }

        let mut rows = rows
            .into_iter()
            .map(|row| {
                if row.len() != row.columns.len() {
                    return Err(CdcError::schema_mismatch(
                        &table,
                        format!("row has {} values for {} columns", row.len(), row.columns.len()),
                    ));
                }
                Ok((row.metadata(&table)?, row))
            })
            .collect::<Result<Vec<_>>>()?;

        if !self.source.guarantees_order() {
            let sorted = rows
                .windows(2)
                .all(|w| order_key(&w[0].0) <= order_key(&w[1].0));
            if !sorted {
                warn!("Change rows for {} arrived out of order, re-sorting", table);
                rows.sort_by_key(|(meta, _)| order_key(meta));
            }
        }

        let mut events = Vec::with_capacity(rows.len());
        let mut pending_before: Option<(RowMetadata, ChangeRow)> = None;

        for (meta, row) in rows {
            if self.cursor.is_processed(&meta.key()) {
                trace!("Skipping already processed change {} on {}", meta.key(), table);
                continue;
            }

            match meta.operation {
                RowOperation::UpdateBefore => {
                    if let Some((orphan, _)) = pending_before.replace((meta, row)) {
                        warn!("Dropping unpaired update before-image {} on {}", orphan.key(), table);
                    }
                }
                RowOperation::UpdateAfter => {
                    let before = match pending_before.take() {
                        Some((before_meta, before_row)) if before_meta.key() == meta.key() => {
                            Some(before_row.data_image(&descriptor.columns, descriptor.reserved_leading))
                        }
                        Some((orphan, _)) => {
                            warn!("Dropping unpaired update before-image {} on {}", orphan.key(), table);
                            None
                        }
                        None => None,
                    };
                    events.push(self.to_event(OperationType::Update, before, &meta, &row)?);
                }
                RowOperation::Insert | RowOperation::Delete => {
                    if let Some((orphan, _)) = pending_before.take() {
                        warn!("Dropping unpaired update before-image {} on {}", orphan.key(), table);
                    }
                    let op = if meta.operation == RowOperation::Insert {
                        OperationType::Insert
                    } else {
                        OperationType::Delete
                    };
                    events.push(self.to_event(op, None, &meta, &row)?);
                }
            }
        }

        if let Some((orphan, _)) = pending_before {
            warn!("Dropping unpaired update before-image {} on {}", orphan.key(), table);
        }

        Ok(events)
    }

    fn to_event(
        &self,
        op: OperationType,
        before: Option<HashMap<String, CellValue>>,
        meta: &RowMetadata,
        row: &ChangeRow,
    ) -> Result<ChangeEvent> {
        let descriptor = &self.descriptor;
        let timestamp = self
            .policy
            .derive_timestamp(&descriptor.source_table, row, self.clock.as_ref())?;
        let image = row.data_image(&descriptor.columns, descriptor.reserved_leading);
        let (before, after) = match op {
            OperationType::Delete => (Some(image), None),
            _ => (before, Some(image)),
        };

        Ok(ChangeEvent {
            op,
            table: descriptor.source_table.clone(),
            capture_name: descriptor.capture_name.clone(),
            before,
            after,
            position: meta.position,
            transaction_id: meta.transaction_id.clone(),
            sequence: meta.sequence,
            timestamp,
            snapshot: false,
        })
    }

    /// 이벤트를 순서대로 전달하고 오프셋 저장. 에러가 나도 이미 전달된 이벤트의 오프셋은 저장합니다.
    async fn emit_all(&mut self, events: Vec<ChangeEvent>) -> Result<usize> {
        let mut emitted = 0;
        let mut failure = None;

        for event in events {
            if self.cancel.is_cancelled() {
                failure = Some(CdcError::Cancelled);
                break;
            }

            let position = event.position;
            let sequence = event.sequence;
            let transaction_id = event.transaction_id.clone();

            if let Err(e) = cancellable(&self.cancel, self.sink.emit(event)).await {
                failure = Some(e);
                break;
            }

            self.cursor = OffsetRecord::at_event(position, transaction_id, sequence);
            self.uncommitted += 1;
            emitted += 1;

            if self.uncommitted >= self.config.commit_batch_size {
                self.commit().await?;
                self.state = PollState::Emitting;
            }
        }

        self.commit().await?;

        match failure {
            Some(e) => Err(e),
            None => Ok(emitted),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        if self.uncommitted == 0 {
            return Ok(());
        }
        self.state = PollState::Committing;
        self.store.store(self.table(), &self.cursor).await?;
        trace!("Committed offset {} for {}", self.cursor, self.table());
        self.uncommitted = 0;
        Ok(())
    }
}

/// 커밋 순서, 트랜잭션 내 순서, before-image가 after-image보다 먼저
fn order_key(meta: &RowMetadata) -> (Lsn, u64, RowOperation) {
    (meta.position, meta.sequence, meta.operation)
}

/// 취소 신호와 경쟁시켜 future 실행
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CdcError::Cancelled),
        result = fut => result,
    }
}
