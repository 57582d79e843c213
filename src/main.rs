/// MySQL 변경 로그 CDC 실행 파일
///
/// 환경 변수로 설정한 테이블의 변경 이벤트를 JSON 한 줄씩 표준 출력으로 내보냅니다.
use cdc_stream::cdc_engine::{CdcConfig, CdcEngine};
use cdc_stream::connection::MySqlChangeSource;
use cdc_stream::offset_store::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
use cdc_stream::sink::ChannelSink;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화 (RUST_LOG, 기본 info)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = CdcConfig::from_env()?;
    config.validate()?;

    info!("Starting MySQL CDC");
    info!(
        "Connecting to {}:{}",
        config.connection.hostname, config.connection.port
    );

    let source = Arc::new(MySqlChangeSource::connect(config.connection.clone()).await?);

    let store: Arc<dyn OffsetStore> = match &config.offset_dir {
        Some(dir) => {
            info!("Storing offsets in {}", dir.display());
            Arc::new(FileOffsetStore::new(dir).await?)
        }
        None => {
            warn!("CDC_OFFSET_DIR not set, offsets are kept in memory only");
            Arc::new(MemoryOffsetStore::new())
        }
    };

    let (sink, mut events) = ChannelSink::new(config.sink_capacity);
    let consumer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", event.to_json());
        }
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    let engine = CdcEngine::new(config, source.clone(), Arc::new(sink), store);
    let outcomes = engine.run(cancel).await?;
    drop(engine);

    // 모든 sender가 사라지면 consumer가 남은 이벤트를 출력하고 끝남
    consumer.await?;
    source.disconnect().await?;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(()) => info!("{}: stopped", outcome.table),
            Err(e) => {
                error!("{}: {}", outcome.table, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} tables failed", failed, outcomes.len()).into());
    }
    Ok(())
}
