//! 전송 통계

use std::time::{Duration, Instant};

/// 단일 전송(업로드/다운로드) 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전체 프래그먼트 수
    pub total_fragments: u32,

    /// 처리 완료된 (보냄/받음) 고유 프래그먼트 수
    pub completed_fragments: u32,

    /// 전체 페이로드 바이트
    pub total_bytes: u64,

    /// 처리 완료된 페이로드 바이트
    pub transferred_bytes: u64,

    /// 재전송 프래그먼트 수
    pub retransmitted_fragments: u64,

    /// 중복 수신 프래그먼트 수
    pub duplicate_fragments: u64,

    /// 체크섬 불일치로 버린 프래그먼트 수
    pub corrupt_fragments: u64,

    /// 보내거나 받은 NACK 수
    pub total_nacks: u64,

    /// 재전송 라운드 수
    pub retry_rounds: u32,
}

impl TransferStats {
    pub fn new(total_fragments: u32, total_bytes: u64) -> Self {
        Self {
            start_time: Instant::now(),
            total_fragments,
            completed_fragments: 0,
            total_bytes,
            transferred_bytes: 0,
            retransmitted_fragments: 0,
            duplicate_fragments: 0,
            corrupt_fragments: 0,
            total_nacks: 0,
            retry_rounds: 0,
        }
    }

    /// 고유 프래그먼트 처리 기록
    pub fn record_fragment(&mut self, size: usize) {
        self.completed_fragments += 1;
        self.transferred_bytes += size as u64;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 진행률 (0 ~ 100)
    pub fn progress_percent(&self) -> u8 {
        if self.total_fragments == 0 {
            return 100;
        }
        let ratio = self.completed_fragments as f64 / self.total_fragments as f64;
        (ratio * 100.0).round().min(100.0) as u8
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Fragments: {}/{} | Bytes: {}/{} | Throughput: {:.2} KB/s | Retransmits: {} | NACKs: {}",
            self.elapsed().as_secs_f64(),
            self.completed_fragments,
            self.total_fragments,
            self.transferred_bytes,
            self.total_bytes,
            self.throughput() / 1000.0,
            self.retransmitted_fragments,
            self.total_nacks,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let mut stats = TransferStats::new(3, 2500);
        assert_eq!(stats.progress_percent(), 0);

        stats.record_fragment(992);
        assert_eq!(stats.progress_percent(), 33);

        stats.record_fragment(992);
        stats.record_fragment(516);
        assert_eq!(stats.progress_percent(), 100);
        assert_eq!(stats.transferred_bytes, 2500);
    }

    #[test]
    fn test_empty_transfer_is_complete() {
        assert_eq!(TransferStats::default().progress_percent(), 100);
    }
}
