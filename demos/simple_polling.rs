/// MySQL 변경 감지 - 변경 로그 테이블 폴링 예제
///
/// 트리거가 채우는 `cdc_users` 변경 로그를 만들고, CDC 엔진으로 스냅샷 후 스트리밍하면서
/// 데이터 변경 작업이 이벤트로 나오는 것을 확인합니다.
use cdc_stream::{CaptureTable, CdcConfig, CdcEngine, ChannelSink, MemoryOffsetStore, MySqlChangeSource};
use mysql_async::prelude::*;
use mysql_async::Pool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = CdcConfig::from_env()?;
    let database = config
        .connection
        .database
        .clone()
        .unwrap_or_else(|| "testdb".to_string());
    config.tables = vec![CaptureTable::with_capture_name(
        format!("{}.users", database),
        "users",
    )];
    config.validate()?;

    info!("=== MySQL 변경 감지 테스트 (변경 로그 폴링) ===");
    info!(
        "연결: {}:{}/{}",
        config.connection.hostname, config.connection.port, database
    );

    let pool = Pool::new(
        mysql_async::OptsBuilder::default()
            .ip_or_hostname(config.connection.hostname.clone())
            .tcp_port(config.connection.port)
            .user(Some(config.connection.username.clone()))
            .pass(Some(config.connection.password.clone()))
            .db_name(Some(database.clone())),
    );

    // 테스트 테이블과 변경 로그 준비
    setup_test_tables(&pool).await?;

    let source = Arc::new(MySqlChangeSource::connect(config.connection.clone()).await?);
    let (sink, mut events) = ChannelSink::new(config.sink_capacity);

    let monitor_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("📨 [{:?}] {}", event.op, event.to_json());
        }
    });

    // 변경 감지 시작 (백그라운드)
    let cancel = CancellationToken::new();
    let engine = CdcEngine::new(
        config,
        source.clone(),
        Arc::new(sink),
        Arc::new(MemoryOffsetStore::new()),
    );
    let engine_cancel = cancel.clone();
    let engine_handle = tokio::spawn(async move { engine.run(engine_cancel).await });

    sleep(Duration::from_secs(2)).await;
    info!("=== 데이터 변경 작업 시작 ===");

    perform_changes(&pool).await?;

    // 마지막 변경이 전달될 때까지 조금 더 대기
    sleep(Duration::from_secs(3)).await;

    cancel.cancel();
    for outcome in engine_handle.await?? {
        info!("{} 종료: {:?}", outcome.table, outcome.result);
    }
    monitor_handle.await?;

    source.disconnect().await?;
    pool.disconnect().await?;
    info!("=== 테스트 완료 ===");

    Ok(())
}

async fn setup_test_tables(pool: &Pool) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = pool.get_conn().await?;

    info!("테스트 테이블 생성...");
    conn.query_drop(
        "CREATE TABLE IF NOT EXISTS users (
            id INT AUTO_INCREMENT PRIMARY KEY,
            name VARCHAR(100) NOT NULL,
            email VARCHAR(100) NOT NULL
        )",
    )
    .await?;

    conn.query_drop(
        "CREATE TABLE IF NOT EXISTS cdc_users (
            __op TINYINT NOT NULL,
            __start_lsn BIGINT UNSIGNED NOT NULL,
            __seqval BIGINT UNSIGNED NOT NULL,
            __txid VARCHAR(64) NULL,
            id INT NOT NULL,
            name VARCHAR(100) NOT NULL,
            email VARCHAR(100) NOT NULL,
            __commit_time DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
            KEY (__start_lsn, __seqval)
        )",
    )
    .await?;

    for trigger in ["users_cdc_insert", "users_cdc_update", "users_cdc_delete"] {
        conn.query_drop(format!("DROP TRIGGER IF EXISTS {}", trigger)).await?;
    }

    // 단일 세션 데모라 MAX + 1로 위치를 매김
    conn.query_drop(
        "CREATE TRIGGER users_cdc_insert AFTER INSERT ON users FOR EACH ROW
         INSERT INTO cdc_users (__op, __start_lsn, __seqval, __txid, id, name, email)
         SELECT 2, COALESCE(MAX(__start_lsn), 0) + 1, 0, CONNECTION_ID(), NEW.id, NEW.name, NEW.email
         FROM cdc_users",
    )
    .await?;
    conn.query_drop(
        "CREATE TRIGGER users_cdc_update AFTER UPDATE ON users FOR EACH ROW
         BEGIN
            DECLARE lsn BIGINT UNSIGNED;
            SELECT COALESCE(MAX(__start_lsn), 0) + 1 INTO lsn FROM cdc_users;
            INSERT INTO cdc_users (__op, __start_lsn, __seqval, __txid, id, name, email)
            VALUES (3, lsn, 0, CONNECTION_ID(), OLD.id, OLD.name, OLD.email),
                   (4, lsn, 0, CONNECTION_ID(), NEW.id, NEW.name, NEW.email);
         END",
    )
    .await?;
    conn.query_drop(
        "CREATE TRIGGER users_cdc_delete AFTER DELETE ON users FOR EACH ROW
         INSERT INTO cdc_users (__op, __start_lsn, __seqval, __txid, id, name, email)
         SELECT 1, COALESCE(MAX(__start_lsn), 0) + 1, 0, CONNECTION_ID(), OLD.id, OLD.name, OLD.email
         FROM cdc_users",
    )
    .await?;

    conn.query_drop("TRUNCATE TABLE users").await?;
    conn.query_drop("TRUNCATE TABLE cdc_users").await?;

    // 스냅샷으로 읽힐 기존 행
    conn.query_drop("INSERT INTO users (name, email) VALUES ('관리자', 'admin@example.com')")
        .await?;
    info!("테이블 준비 완료");

    Ok(())
}

async fn perform_changes(pool: &Pool) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = pool.get_conn().await?;

    // INSERT 테스트
    conn.query_drop("INSERT INTO users (name, email) VALUES ('홍길동', 'hong@example.com')")
        .await?;
    info!("✅ 사용자 추가: 홍길동");

    sleep(Duration::from_secs(1)).await;
    conn.query_drop("INSERT INTO users (name, email) VALUES ('김철수', 'kim@example.com')")
        .await?;
    info!("✅ 사용자 추가: 김철수");

    // UPDATE 테스트
    sleep(Duration::from_secs(1)).await;
    conn.query_drop("UPDATE users SET email = 'hong_new@example.com' WHERE name = '홍길동'")
        .await?;
    info!("✅ 홍길동 이메일 업데이트");

    // DELETE 테스트
    sleep(Duration::from_secs(1)).await;
    conn.query_drop("DELETE FROM users WHERE name = '김철수'").await?;
    info!("✅ 김철수 삭제");

    info!("모든 변경 작업 완료");

    Ok(())
}
