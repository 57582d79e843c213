//! 변경 로그 위치 추적 (LogPosition 및 Offset)
//!
//! 변경 로그의 한 지점은 [`Lsn`]으로 표현되며, 같은 LSN 안에서는 sequence 번호로 순서가 정해집니다.
//! 재시작 시 [`OffsetRecord`]로부터 다음 미처리 이벤트 위치를 정확히 계산합니다.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// 변경 로그 위치 (Log Sequence Number)
///
/// 16자리 hex 문자열로 직렬화됩니다 (e.g., "00000000000004d2").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(u64);

impl Lsn {
    /// 가장 작은 위치 (아무 변경도 기록되지 않은 상태)
    pub const MIN: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// 바로 다음 위치 (window 하한 계산용 epsilon)
    pub fn increment(&self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }

    pub fn max(self, other: Lsn) -> Lsn {
        Ord::max(self, other)
    }

    pub fn min(self, other: Lsn) -> Lsn {
        Ord::min(self, other)
    }

    pub fn is_min(&self) -> bool {
        self.0 == 0
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(hex: &str) -> std::result::Result<Self, String> {
        if hex.is_empty() || hex.len() > 16 {
            return Err(format!("LSN hex must be 1-16 characters, got {}", hex.len()));
        }
        u64::from_str_radix(hex, 16)
            .map(Lsn)
            .map_err(|e| format!("invalid LSN hex '{}': {}", hex, e))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Lsn::from_hex(s)
    }
}

impl TryFrom<String> for Lsn {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Lsn::from_hex(&value)
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> Self {
        lsn.to_hex()
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// 이벤트 정렬 키: (commit 위치, 트랜잭션 내 sequence)
///
/// 싱크 측 중복 제거에도 이 키를 사용합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub position: Lsn,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(position: Lsn, sequence: u64) -> Self {
        EventKey { position, sequence }
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.position, self.sequence)
    }
}

/// 테이블별 처리 오프셋 (상태 저장용)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    /// 마지막으로 처리된 위치
    pub position: Lsn,
    /// 마지막으로 처리된 이벤트의 트랜잭션 ID
    pub transaction_id: Option<String>,
    /// 마지막으로 처리된 이벤트의 sequence.
    /// `None`이면 `position`의 모든 변경이 처리된 상태입니다.
    pub sequence: Option<u64>,
}

impl OffsetRecord {
    /// `position`까지 모두 처리된 오프셋 (스냅샷 직후 시드 값)
    pub fn at_position(position: Lsn) -> Self {
        OffsetRecord {
            position,
            transaction_id: None,
            sequence: None,
        }
    }

    /// 특정 이벤트까지 처리된 오프셋
    pub fn at_event(position: Lsn, transaction_id: Option<String>, sequence: u64) -> Self {
        OffsetRecord {
            position,
            transaction_id,
            sequence: Some(sequence),
        }
    }

    /// 재시작 시 첫 window의 하한
    ///
    /// 트랜잭션 중간에서 멈췄을 수 있으므로 sequence가 있으면 같은 위치부터 다시 읽고
    /// [`OffsetRecord::is_processed`]로 이미 처리된 이벤트를 건너뜁니다.
    pub fn resume_low(&self) -> Lsn {
        match self.sequence {
            Some(_) => self.position,
            None => self.position.increment(),
        }
    }

    /// 해당 키의 이벤트가 이미 처리되었는지 여부 (같은 키도 처리된 것으로 간주)
    pub fn is_processed(&self, key: &EventKey) -> bool {
        match self.sequence {
            Some(seq) => *key <= EventKey::new(self.position, seq),
            None => key.position <= self.position,
        }
    }
}

impl fmt::Display for OffsetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence {
            Some(seq) => write!(f, "{}:{}", self.position, seq),
            None => write!(f, "{}:*", self.position),
        }
    }
}

/// CDC 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    /// 스냅샷 처리 중
    Snapshotting,
    /// 스트리밍 처리 중
    Streaming,
    /// 중단됨
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_ordering_and_helpers() {
        let a = Lsn::new(10);
        let b = Lsn::new(11);
        assert!(a < b);
        assert_eq!(a.increment(), b);
        assert_eq!(a.max(b), b);
        assert_eq!(a.min(b), a);
        assert_eq!(Lsn::MAX.increment(), Lsn::MAX);
        assert!(Lsn::MIN.is_min());
    }

    #[test]
    fn test_lsn_hex() {
        let lsn = Lsn::new(1234);
        assert_eq!(lsn.to_hex(), "00000000000004d2");
        assert_eq!(Lsn::from_hex("00000000000004d2").unwrap(), lsn);
        assert!(Lsn::from_hex("").is_err());
        assert!(Lsn::from_hex("zz").is_err());
        assert!(Lsn::from_hex("00000000000000000001").is_err());
    }

    #[test]
    fn test_event_key_ordering() {
        let k1 = EventKey::new(Lsn::new(5), 2);
        let k2 = EventKey::new(Lsn::new(5), 3);
        let k3 = EventKey::new(Lsn::new(6), 0);
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn test_offset_resume_after_complete_position() {
        let offset = OffsetRecord::at_position(Lsn::new(100));
        assert_eq!(offset.resume_low(), Lsn::new(101));
        assert!(offset.is_processed(&EventKey::new(Lsn::new(100), 7)));
        assert!(!offset.is_processed(&EventKey::new(Lsn::new(101), 0)));
    }

    #[test]
    fn test_offset_resume_mid_transaction() {
        let offset = OffsetRecord::at_event(Lsn::new(100), Some("tx-9".into()), 2);
        assert_eq!(offset.resume_low(), Lsn::new(100));
        assert!(offset.is_processed(&EventKey::new(Lsn::new(100), 2)));
        assert!(!offset.is_processed(&EventKey::new(Lsn::new(100), 3)));
    }

    #[test]
    fn test_offset_json_round_trip() {
        let offset = OffsetRecord::at_event(Lsn::new(42), Some("tx-1".into()), 3);
        let json = serde_json::to_string(&offset).unwrap();
        assert!(json.contains("\"000000000000002a\""));
        let restored: OffsetRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, offset);
    }
}
