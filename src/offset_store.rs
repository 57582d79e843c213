//! 테이블별 오프셋 영속화
//!
//! 한 테이블의 오프셋은 그 테이블의 루프만 기록하므로 키 단위 원자성만 보장하면 됩니다.
//! 파일 저장소는 임시 파일에 쓰고 fsync 후 rename해서, 중간에 죽더라도
//! 이전 값 또는 새 값 중 하나만 남습니다.

use crate::error::{CdcError, Result};
use crate::offset::OffsetRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// 저장된 오프셋. `None`이면 스냅샷부터 시작해야 합니다.
    async fn load(&self, table: &str) -> Result<Option<OffsetRecord>>;

    /// 오프셋 저장. 싱크가 해당 이벤트를 받아들인 뒤에만 호출됩니다.
    async fn store(&self, table: &str, offset: &OffsetRecord) -> Result<()>;
}

/// 메모리 기반 저장소 (테스트, 일회성 실행용)
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<HashMap<String, OffsetRecord>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self, table: &str) -> Result<Option<OffsetRecord>> {
        Ok(self.offsets.lock().get(table).cloned())
    }

    async fn store(&self, table: &str, offset: &OffsetRecord) -> Result<()> {
        self.offsets.lock().insert(table.to_string(), offset.clone());
        Ok(())
    }
}

/// 파일에 기록되는 형태
#[derive(Debug, Serialize, Deserialize)]
struct StoredOffset {
    table: String,
    #[serde(flatten)]
    offset: OffsetRecord,
}

/// 테이블마다 JSON 파일 하나를 쓰는 저장소
///
/// ```text
/// offset_dir/
///   shop.orders.json
/// ```
#[derive(Debug, Clone)]
pub struct FileOffsetStore {
    base_dir: PathBuf,
    fsync: bool,
}

impl FileOffsetStore {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(FileOffsetStore { base_dir, fsync })
    }

    fn file_path(&self, table: &str) -> Result<PathBuf> {
        if table.is_empty() || table.contains('/') || table.contains('\\') || table.contains("..") {
            return Err(CdcError::ConfigError(format!("invalid offset key '{}'", table)));
        }
        Ok(self.base_dir.join(format!("{}.json", table)))
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self, table: &str) -> Result<Option<OffsetRecord>> {
        let path = self.file_path(table)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredOffset = serde_json::from_str(&contents)
            .map_err(|e| CdcError::corrupt_offset(table, e.to_string()))?;

        if stored.table != table {
            return Err(CdcError::corrupt_offset(
                table,
                format!("file belongs to table '{}'", stored.table),
            ));
        }
        if stored.offset.sequence.is_none() && stored.offset.transaction_id.is_some() {
            return Err(CdcError::corrupt_offset(
                table,
                "transaction id recorded without a sequence number",
            ));
        }

        Ok(Some(stored.offset))
    }

    async fn store(&self, table: &str, offset: &OffsetRecord) -> Result<()> {
        let path = self.file_path(table)?;
        let temp_path = path.with_extension("json.tmp");

        let stored = StoredOffset {
            table: table.to_string(),
            offset: offset.clone(),
        };
        let json = serde_json::to_string_pretty(&stored)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &path).await?;

        debug!("Stored offset for {}: {}", table, offset);
        Ok(())
    }
}
