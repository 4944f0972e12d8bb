//! 서버 전송 테이블
//!
//! - 업로드: 전송 ID별 프래그먼트 누적 (엔드포인트당 하나)
//! - 완료된 업로드: 종료 응답 보관 (응답 유실 시 재전송용)
//! - 다운로드: 엔드포인트별 송신 프래그먼트 보관 (NACK 재전송용)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::fragment::{Fragment, FragmentId, Inserted, Reassembly};
use crate::packet::Packet;
use crate::stats::TransferStats;
use crate::{Error, Result};

/// 업로드 전송 ID 생성
pub fn new_transfer_id() -> String {
    format!("put-{:016x}", rand::random::<u64>())
}

/// 진행 중인 업로드
#[derive(Debug)]
pub struct UploadRecord {
    pub transfer_id: String,
    pub filename: String,

    /// 루트 검사를 통과한 실제 저장 경로
    pub target_path: PathBuf,

    pub owner: SocketAddr,
    pub reassembly: Reassembly,
    pub stats: TransferStats,
    pub last_activity: Instant,
}

impl UploadRecord {
    pub fn expected_fragments(&self) -> u32 {
        self.reassembly.expected()
    }

    pub fn received_count(&self) -> u32 {
        self.reassembly.received_count()
    }

    /// 완성된 파일 데이터 (누락 시 `FragmentGap`)
    pub fn into_payload(self) -> Result<Bytes> {
        self.reassembly.finish()
    }
}

/// 프래그먼트 수신 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    Accepted { complete: bool },
    Duplicate,
}

/// 저장이 끝난 업로드
///
/// 마지막 ACK나 종료 응답이 유실되면 클라이언트가 프래그먼트를 다시 보내므로
/// 만료 전까지 같은 종료 응답으로 답한다
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub transfer_id: String,
    pub expected_fragments: u32,

    /// 클라이언트에 보낸 종료 응답 (id 0)
    pub terminal: Packet,

    pub finished_at: Instant,
}

impl CompletedUpload {
    /// 이 업로드에 속한 프래그먼트 ID인지
    pub fn covers(&self, id: FragmentId) -> bool {
        id >= 1 && id <= self.expected_fragments
    }
}

/// 업로드 테이블
pub struct TransferTable {
    uploads: DashMap<String, UploadRecord>,
    by_endpoint: DashMap<SocketAddr, String>,
    completed: DashMap<SocketAddr, CompletedUpload>,
    idle_timeout: Duration,
}

impl TransferTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            uploads: DashMap::new(),
            by_endpoint: DashMap::new(),
            completed: DashMap::new(),
            idle_timeout,
        }
    }

    /// 새 업로드 등록 (같은 엔드포인트의 이전 업로드는 폐기)
    pub fn begin_upload(
        &self,
        owner: SocketAddr,
        filename: &str,
        target_path: PathBuf,
        expected_fragments: u32,
    ) -> String {
        self.completed.remove(&owner);
        if let Some((_, old_id)) = self.by_endpoint.remove(&owner) {
            if self.uploads.remove(&old_id).is_some() {
                warn!("이전 업로드 폐기: {} ({})", old_id, owner);
            }
        }

        let transfer_id = new_transfer_id();
        let record = UploadRecord {
            transfer_id: transfer_id.clone(),
            filename: filename.to_string(),
            target_path,
            owner,
            reassembly: Reassembly::new(1, expected_fragments),
            stats: TransferStats::new(expected_fragments, 0),
            last_activity: Instant::now(),
        };

        self.uploads.insert(transfer_id.clone(), record);
        self.by_endpoint.insert(owner, transfer_id.clone());
        transfer_id
    }

    /// 엔드포인트의 업로드 ID
    pub fn upload_for(&self, owner: &SocketAddr) -> Option<String> {
        self.by_endpoint.get(owner).map(|id| id.clone())
    }

    /// 프래그먼트 누적
    pub fn accept_fragment(&self, owner: &SocketAddr, fragment: &Fragment) -> Result<FragmentOutcome> {
        let transfer_id = self
            .upload_for(owner)
            .ok_or_else(|| Error::NotFound(format!("{}의 업로드", owner)))?;
        let mut record = self
            .uploads
            .get_mut(&transfer_id)
            .ok_or_else(|| Error::NotFound(transfer_id.clone()))?;

        record.last_activity = Instant::now();
        match record.reassembly.insert(fragment)? {
            Inserted::New => {
                record.stats.record_fragment(fragment.data.len());
                record.stats.total_bytes += fragment.data.len() as u64;
                debug!(
                    "프래그먼트 {} 수신 ({}/{})",
                    fragment.id,
                    record.received_count(),
                    record.expected_fragments()
                );
                Ok(FragmentOutcome::Accepted {
                    complete: record.reassembly.is_complete(),
                })
            }
            Inserted::Duplicate => {
                record.stats.duplicate_fragments += 1;
                Ok(FragmentOutcome::Duplicate)
            }
        }
    }

    /// 체크섬 불일치 기록
    pub fn record_corrupt(&self, owner: &SocketAddr) {
        if let Some(id) = self.upload_for(owner) {
            if let Some(mut record) = self.uploads.get_mut(&id) {
                record.stats.corrupt_fragments += 1;
                record.stats.total_nacks += 1;
                record.last_activity = Instant::now();
            }
        }
    }

    /// 업로드 제거 후 반환
    pub fn take(&self, transfer_id: &str) -> Option<UploadRecord> {
        let (_, record) = self.uploads.remove(transfer_id)?;
        self.by_endpoint
            .remove_if(&record.owner, |_, id| id.as_str() == transfer_id);
        Some(record)
    }

    pub fn contains(&self, transfer_id: &str) -> bool {
        self.uploads.contains_key(transfer_id)
    }

    /// 종료 응답 보관 (엔드포인트당 마지막 하나)
    pub fn complete(&self, owner: SocketAddr, transfer_id: &str, expected_fragments: u32, terminal: Packet) {
        self.completed.insert(
            owner,
            CompletedUpload {
                transfer_id: transfer_id.to_string(),
                expected_fragments,
                terminal,
                finished_at: Instant::now(),
            },
        );
    }

    pub fn completed_for(&self, owner: &SocketAddr) -> Option<CompletedUpload> {
        self.completed.get(owner).map(|done| done.clone())
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    /// 프래그먼트가 끊긴 업로드와 오래된 종료 응답 정리
    pub fn evict_idle(&self, now: Instant) -> usize {
        self.completed
            .retain(|_, done| now.saturating_duration_since(done.finished_at) < self.idle_timeout);

        let stale: Vec<String> = self
            .uploads
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_activity) >= self.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            if let Some(record) = self.take(id) {
                warn!(
                    "업로드 중단 정리: {} ({}), {}/{} 프래그먼트",
                    record.filename,
                    id,
                    record.received_count(),
                    record.expected_fragments()
                );
            }
        }
        stale.len()
    }
}

/// 진행 중인 다운로드 (서버 → 클라이언트)
#[derive(Debug)]
pub struct DownloadRecord {
    pub filename: String,
    fragments: Vec<Fragment>,
    acked: Vec<bool>,
    acked_count: usize,
    pub last_activity: Instant,
}

impl DownloadRecord {
    fn index(&self, id: FragmentId) -> Option<usize> {
        let first = self.fragments.first()?.id;
        let idx = id.checked_sub(first)? as usize;
        (idx < self.fragments.len()).then_some(idx)
    }

    pub fn is_fully_acked(&self) -> bool {
        self.acked_count >= self.fragments.len()
    }
}

/// 다운로드 테이블
pub struct DownloadTable {
    downloads: DashMap<SocketAddr, DownloadRecord>,
    idle_timeout: Duration,
}

impl DownloadTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            downloads: DashMap::new(),
            idle_timeout,
        }
    }

    /// 다운로드 등록 (같은 엔드포인트의 이전 다운로드는 대체)
    pub fn begin(&self, owner: SocketAddr, filename: &str, fragments: Vec<Fragment>) {
        let acked = vec![false; fragments.len()];
        self.downloads.insert(
            owner,
            DownloadRecord {
                filename: filename.to_string(),
                fragments,
                acked,
                acked_count: 0,
                last_activity: Instant::now(),
            },
        );
    }

    /// ACK 기록, 모두 확인되면 레코드 제거 후 true
    pub fn ack(&self, owner: &SocketAddr, id: FragmentId) -> bool {
        let finished = match self.downloads.get_mut(owner) {
            Some(mut record) => {
                record.last_activity = Instant::now();
                if let Some(idx) = record.index(id) {
                    if !record.acked[idx] {
                        record.acked[idx] = true;
                        record.acked_count += 1;
                    }
                }
                record.is_fully_acked()
            }
            None => return false,
        };

        if finished {
            if let Some((_, record)) = self.downloads.remove(owner) {
                debug!("다운로드 확인 완료: {} ({})", record.filename, owner);
            }
        }
        finished
    }

    /// NACK 받은 프래그먼트 재전송용 조회
    pub fn fragment(&self, owner: &SocketAddr, id: FragmentId) -> Option<Fragment> {
        let mut record = self.downloads.get_mut(owner)?;
        record.last_activity = Instant::now();
        let idx = record.index(id)?;
        Some(record.fragments[idx].clone())
    }

    pub fn contains(&self, owner: &SocketAddr) -> bool {
        self.downloads.contains_key(owner)
    }

    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }

    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.downloads.len();
        self.downloads
            .retain(|_, record| now.saturating_duration_since(record.last_activity) < self.idle_timeout);
        before - self.downloads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::fragment;
    use crate::packet::PacketType;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_upload_completes_after_all_fragments() {
        let table = TransferTable::new(Duration::from_secs(60));
        let data: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();
        let fragments = fragment(&data, PacketType::PutData, 1);

        let id = table.begin_upload(addr(5000), "a.bin", PathBuf::from("/tmp/a.bin"), 3);
        assert!(id.starts_with("put-"));

        assert_eq!(
            table.accept_fragment(&addr(5000), &fragments[2]).unwrap(),
            FragmentOutcome::Accepted { complete: false }
        );
        assert_eq!(
            table.accept_fragment(&addr(5000), &fragments[2]).unwrap(),
            FragmentOutcome::Duplicate
        );
        table.accept_fragment(&addr(5000), &fragments[0]).unwrap();
        assert_eq!(
            table.accept_fragment(&addr(5000), &fragments[1]).unwrap(),
            FragmentOutcome::Accepted { complete: true }
        );

        let record = table.take(&id).unwrap();
        assert_eq!(record.into_payload().unwrap().as_ref(), data.as_slice());
        assert!(table.is_empty());
        assert!(table.upload_for(&addr(5000)).is_none());
    }

    #[test]
    fn test_fragment_without_upload() {
        let table = TransferTable::new(Duration::from_secs(60));
        let f = Fragment::new(1, PacketType::PutData, Bytes::from_static(b"x"));
        assert!(matches!(table.accept_fragment(&addr(5000), &f), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_new_upload_replaces_previous() {
        let table = TransferTable::new(Duration::from_secs(60));
        let first = table.begin_upload(addr(5000), "a", PathBuf::from("/tmp/a"), 2);
        let second = table.begin_upload(addr(5000), "b", PathBuf::from("/tmp/b"), 2);

        assert!(!table.contains(&first));
        assert!(table.contains(&second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_upload_idle_eviction() {
        let table = TransferTable::new(Duration::from_secs(5));
        table.begin_upload(addr(5000), "a", PathBuf::from("/tmp/a"), 2);

        assert_eq!(table.evict_idle(Instant::now()), 0);
        assert_eq!(table.evict_idle(Instant::now() + Duration::from_secs(6)), 1);
        assert!(table.upload_for(&addr(5000)).is_none());
    }

    #[test]
    fn test_completed_upload_kept_until_idle() {
        let table = TransferTable::new(Duration::from_secs(5));
        let terminal = Packet::new(0, PacketType::PutResponse, "SUCCESS 5 907060870");
        table.complete(addr(5000), "put-1", 1, terminal.clone());

        let done = table.completed_for(&addr(5000)).unwrap();
        assert_eq!(done.terminal, terminal);
        assert!(done.covers(1));
        assert!(!done.covers(0));
        assert!(!done.covers(2));

        table.evict_idle(Instant::now() + Duration::from_secs(6));
        assert!(table.completed_for(&addr(5000)).is_none());
    }

    #[test]
    fn test_new_upload_clears_completed() {
        let table = TransferTable::new(Duration::from_secs(60));
        let terminal = Packet::new(0, PacketType::PutResponse, "SUCCESS 0 0");
        table.complete(addr(5000), "put-1", 0, terminal);

        table.begin_upload(addr(5000), "b", PathBuf::from("/tmp/b"), 1);
        assert!(table.completed_for(&addr(5000)).is_none());
    }

    #[test]
    fn test_download_ack_and_resend() {
        let table = DownloadTable::new(Duration::from_secs(60));
        let data = vec![7u8; 2000];
        table.begin(addr(6000), "b.bin", fragment(&data, PacketType::GetData, 1));

        let resend = table.fragment(&addr(6000), 2).unwrap();
        assert_eq!(resend.id, 2);
        assert!(table.fragment(&addr(6000), 3).is_none());

        assert!(!table.ack(&addr(6000), 1));
        assert!(!table.ack(&addr(6000), 1));
        assert!(table.ack(&addr(6000), 2));
        assert!(!table.contains(&addr(6000)));
    }
}
