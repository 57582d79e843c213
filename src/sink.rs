//! 변경 이벤트 전달 대상 (sink capability)

use crate::error::{CdcError, Result};
use crate::events::ChangeEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 이벤트 싱크
///
/// `emit`이 `Ok`를 반환하면 싱크가 이벤트를 받아들인 것(acknowledgment)으로 간주하고
/// 그 뒤에야 오프셋을 저장합니다.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ChangeEvent) -> Result<()>;
}

/// CDC 이벤트 수신자
pub type CdcEventReceiver = mpsc::Receiver<ChangeEvent>;

/// 제한된 크기의 채널로 이벤트를 넘기는 싱크
///
/// 채널이 가득 차면 `emit`이 대기하므로 느린 소비자가 poll 속도를 자연스럽게 늦춥니다.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ChangeEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, CdcEventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChannelSink { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| CdcError::ChannelClosed)
    }
}
