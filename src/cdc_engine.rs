//! CDC 엔진 - 테이블별 스냅샷 및 스트리밍 처리
//!
//! 테이블마다 독립적인 태스크가 다음 단계로 진행됩니다:
//! 1. 변경 로그 테이블 컬럼 조회
//! 2. 저장된 오프셋이 없으면 초기 스냅샷
//! 3. 변경 로그 polling
//!
//! 한 테이블의 치명적 에러는 다른 테이블 태스크를 멈추지 않습니다.

use crate::connection::{parse_utc_offset, validate_identifier, ConnectionConfig};
use crate::error::{CdcError, Result};
use crate::offset::ProcessingState;
use crate::offset_store::OffsetStore;
use crate::poller::{Backoff, ChangeStreamPoller, PollerConfig};
use crate::sink::EventSink;
use crate::snapshot::{SnapshotCoordinator, SnapshotMode};
use crate::source::ChangeSource;
use crate::timestamp::{Clock, SystemClock, TimestampPolicy};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// 캡처 대상 테이블
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTable {
    /// "schema.table"
    pub source_table: String,
    /// 변경 로그 테이블 `cdc_<capture_name>`의 이름
    pub capture_name: String,
}

impl CaptureTable {
    /// 캡처 이름은 "schema.table"의 '.'을 '_'로 바꿔 만듭니다.
    pub fn new(source_table: impl Into<String>) -> Self {
        let source_table = source_table.into();
        let capture_name = source_table.replace('.', "_");
        CaptureTable {
            source_table,
            capture_name,
        }
    }

    pub fn with_capture_name(source_table: impl Into<String>, capture_name: impl Into<String>) -> Self {
        CaptureTable {
            source_table: source_table.into(),
            capture_name: capture_name.into(),
        }
    }

    /// "shop.orders,shop.items:items_log" 형식 파싱
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| match entry.split_once(':') {
                Some((table, capture)) if !table.is_empty() && !capture.is_empty() => {
                    Ok(CaptureTable::with_capture_name(table, capture))
                }
                Some(_) => Err(CdcError::ConfigError(format!("invalid table entry '{}'", entry))),
                None => Ok(CaptureTable::new(entry)),
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        for part in self.source_table.split('.') {
            validate_identifier(part)?;
        }
        validate_identifier(&self.capture_name)
    }
}

/// CDC 엔진 설정
#[derive(Debug, Clone)]
pub struct CdcConfig {
    pub connection: ConnectionConfig,
    pub tables: Vec<CaptureTable>,
    pub snapshot_mode: SnapshotMode,
    pub timestamp_policy: TimestampPolicy,
    pub poller: PollerConfig,
    /// 없으면 메모리 오프셋 저장소 사용
    pub offset_dir: Option<PathBuf>,
    /// 채널 싱크 큐 크기
    pub sink_capacity: usize,
}

impl Default for CdcConfig {
    fn default() -> Self {
        CdcConfig {
            connection: ConnectionConfig::default(),
            tables: Vec::new(),
            snapshot_mode: SnapshotMode::Initial,
            timestamp_policy: TimestampPolicy::Commit,
            poller: PollerConfig::default(),
            offset_dir: None,
            sink_capacity: 1024,
        }
    }
}

impl CdcConfig {
    /// 환경 변수에서 설정 읽기
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port = get("DB_PORT", "3306");
        let port = port
            .parse()
            .map_err(|_| CdcError::ConfigError(format!("invalid DB_PORT '{}'", port)))?;

        let connection = ConnectionConfig {
            hostname: get("DB_HOST", "localhost"),
            port,
            username: get("DB_USER", "testuser"),
            password: get("DB_PASSWORD", "testpass"),
            database: Some(get("DB_NAME", "testdb")),
            timeout: Duration::from_secs(30),
            server_time_zone: lookup("DB_TIME_ZONE")
                .filter(|tz| !tz.trim().is_empty())
                .map(|tz| parse_utc_offset(&tz))
                .transpose()?,
        };

        Ok(CdcConfig {
            connection,
            tables: CaptureTable::parse_list(&get("CDC_TABLES", ""))?,
            snapshot_mode: SnapshotMode::from_mode(&get("CDC_SNAPSHOT_MODE", "initial"))?,
            timestamp_policy: TimestampPolicy::from_mode(&get("SOURCE_TIMESTAMP_MODE", "commit")),
            poller: PollerConfig::default(),
            offset_dir: lookup("CDC_OFFSET_DIR").filter(|d| !d.is_empty()).map(PathBuf::from),
            sink_capacity: 1024,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(CdcError::ConfigError("no tables configured".into()));
        }
        if self.sink_capacity == 0 {
            return Err(CdcError::ConfigError("sink capacity must be > 0".into()));
        }
        for table in &self.tables {
            table.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.source_table.as_str()) {
                return Err(CdcError::ConfigError(format!(
                    "table {} configured twice",
                    table.source_table
                )));
            }
        }
        self.poller.validate()
    }
}

/// 테이블 태스크 종료 결과
#[derive(Debug)]
pub struct TableOutcome {
    pub table: String,
    pub result: Result<()>,
}

type StateMap = Arc<RwLock<HashMap<String, ProcessingState>>>;

/// MySQL CDC 엔진
pub struct CdcEngine {
    config: CdcConfig,
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn OffsetStore>,
    clock: Arc<dyn Clock>,
    states: StateMap,
}

impl CdcEngine {
    /// 새 CDC 엔진 생성
    pub fn new(
        config: CdcConfig,
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn OffsetStore>,
    ) -> Self {
        CdcEngine {
            config,
            source,
            sink,
            store,
            clock: Arc::new(SystemClock),
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CdcConfig {
        &self.config
    }

    /// 테이블별 현재 처리 상태
    pub fn states(&self) -> HashMap<String, ProcessingState> {
        self.states.read().clone()
    }

    pub fn state(&self, table: &str) -> Option<ProcessingState> {
        self.states.read().get(table).copied()
    }

    /// 모든 테이블 태스크가 끝날 때까지 실행
    ///
    /// `cancel`이 취소되면 각 태스크가 정리 후 종료합니다. 반환값은 테이블별 결과입니다.
    pub async fn run(&self, cancel: CancellationToken) -> Result<Vec<TableOutcome>> {
        self.config.validate()?;

        info!(
            "Starting CDC Engine for {} tables ({} timestamps, {:?} snapshot)",
            self.config.tables.len(),
            self.config.timestamp_policy,
            self.config.snapshot_mode
        );

        let mut tasks = JoinSet::new();

        for table in &self.config.tables {
            let task = TableTask {
                table: table.clone(),
                snapshot_mode: self.config.snapshot_mode,
                policy: self.config.timestamp_policy,
                poller: self.config.poller.clone(),
                source: self.source.clone(),
                sink: self.sink.clone(),
                store: self.store.clone(),
                clock: self.clock.clone(),
                cancel: cancel.clone(),
                states: self.states.clone(),
            };
            task.set_state(ProcessingState::Snapshotting);

            let span = info_span!("table", table = %table.source_table);
            tasks.spawn(task.run().instrument(span));
        }

        let mut outcomes = Vec::with_capacity(self.config.tables.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Table task aborted: {}", e),
            }
        }

        // 결과 없이 끝난 태스크는 panic으로 중단된 것
        for table in &self.config.tables {
            if outcomes.iter().all(|o| o.table != table.source_table) {
                self.states
                    .write()
                    .insert(table.source_table.clone(), ProcessingState::Stopped);
                outcomes.push(TableOutcome {
                    table: table.source_table.clone(),
                    result: Err(CdcError::TaskAborted(table.source_table.clone())),
                });
            }
        }

        info!("CDC Engine stopped");
        Ok(outcomes)
    }
}

struct TableTask {
    table: CaptureTable,
    snapshot_mode: SnapshotMode,
    policy: TimestampPolicy,
    poller: PollerConfig,
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn OffsetStore>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    states: StateMap,
}

impl TableTask {
    fn set_state(&self, state: ProcessingState) {
        self.states
            .write()
            .insert(self.table.source_table.clone(), state);
    }

    async fn run(self) -> TableOutcome {
        let result = match self.capture().await {
            Err(CdcError::Cancelled) => Ok(()),
            other => other,
        };

        if let Err(e) = &result {
            error!("Capture for {} failed: {}", self.table.source_table, e);
        }
        self.set_state(ProcessingState::Stopped);

        TableOutcome {
            table: self.table.source_table.clone(),
            result,
        }
    }

    async fn capture(&self) -> Result<()> {
        let table = &self.table;
        let descriptor = self
            .retry("describe", || {
                self.source
                    .describe_table(&table.source_table, &table.capture_name)
            })
            .await?;

        let coordinator = SnapshotCoordinator::new(
            self.source.clone(),
            self.sink.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.snapshot_mode,
            self.cancel.clone(),
        );
        let start = self
            .retry("snapshot", || coordinator.prepare(&descriptor))
            .await?;

        self.set_state(ProcessingState::Streaming);

        let poller = ChangeStreamPoller::new(
            Arc::new(descriptor),
            self.policy,
            self.poller.clone(),
            self.source.clone(),
            self.sink.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.cancel.clone(),
            start,
        );
        poller.run().await
    }

    /// 치명적이지 않은 에러는 backoff 후 재시도
    async fn retry<T, F, Fut>(&self, step: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = Backoff::new(self.poller.backoff_min, self.poller.backoff_max);
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(CdcError::Cancelled) => return Err(CdcError::Cancelled),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Transient failure during {} of {} (attempt {}), retrying in {:?}: {}",
                        step,
                        self.table.source_table,
                        backoff.attempt(),
                        delay,
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(CdcError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
