//! 응답 대기 요청 테이블
//!
//! 보낸 요청 ID와 응답(또는 타임아웃)을 짝짓는 유일한 장치.
//! 항목은 응답 도착이나 만료 중 먼저 일어나는 쪽에서 제거된다.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::packet::PacketType;

/// 요청 ID 생성기 (1부터 증가, 0은 건너뜀)
#[derive(Debug)]
pub struct RequestIds {
    next: u32,
}

impl RequestIds {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        id
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// 대기 중인 요청
#[derive(Debug)]
pub struct PendingRequest<C> {
    /// 보낸 요청 타입
    pub kind: PacketType,

    pub sent_at: Instant,

    pub deadline: Instant,

    /// 응답 도착 시 이어서 할 일
    pub continuation: C,
}

impl<C> PendingRequest<C> {
    /// 이 요청에 대한 응답으로 받아들일 수 있는 패킷 타입인지
    pub fn accepts(&self, packet_type: PacketType) -> bool {
        packet_type == PacketType::Error || self.kind.response_type() == Some(packet_type)
    }
}

/// 요청 테이블
#[derive(Debug)]
pub struct PendingRequests<C> {
    entries: HashMap<u32, PendingRequest<C>>,
    timeout: Duration,
}

impl<C> PendingRequests<C> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// `now`부터 타임아웃을 잡아 등록
    pub fn insert(&mut self, id: u32, kind: PacketType, now: Instant, continuation: C) {
        self.entries.insert(
            id,
            PendingRequest {
                kind,
                sent_at: now,
                deadline: now + self.timeout,
                continuation,
            },
        );
    }

    /// 응답 처리를 위해 꺼냄
    pub fn take(&mut self, id: u32) -> Option<PendingRequest<C>> {
        self.entries.remove(&id)
    }

    /// 꺼냈던 항목을 그대로 되돌림
    pub fn restore(&mut self, id: u32, request: PendingRequest<C>) {
        self.entries.insert(id, request);
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// 기한이 지난 요청 제거 후 반환
    pub fn expire(&mut self, now: Instant) -> Vec<(u32, PendingRequest<C>)> {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|req| (id, req)))
            .collect()
    }

    /// 남은 요청 전부 제거 (연결 종료)
    pub fn drain(&mut self) -> Vec<(u32, PendingRequest<C>)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::REQUEST_TIMEOUT_MS;

    #[test]
    fn test_request_ids_start_at_one() {
        let mut ids = RequestIds::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_request_ids_skip_zero_on_wrap() {
        let mut ids = RequestIds { next: u32::MAX };
        assert_eq!(ids.next_id(), u32::MAX);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_login_expires_after_timeout() {
        let mut pending = PendingRequests::new(Duration::from_millis(REQUEST_TIMEOUT_MS));
        let t0 = Instant::now();
        pending.insert(1, PacketType::Login, t0, "login");

        assert!(pending.expire(t0 + Duration::from_millis(4999)).is_empty());
        assert!(pending.contains(1));

        let expired = pending.expire(t0 + Duration::from_millis(5000));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);
        assert_eq!(expired[0].1.continuation, "login");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_response_removes_entry() {
        let mut pending = PendingRequests::new(Duration::from_secs(5));
        let t0 = Instant::now();
        pending.insert(4, PacketType::Ls, t0, ());

        let request = pending.take(4).unwrap();
        assert!(request.accepts(PacketType::LsResponse));
        assert!(request.accepts(PacketType::Error));
        assert!(!request.accepts(PacketType::CdResponse));

        // 응답 후에는 만료될 것이 없음
        assert!(pending.expire(t0 + Duration::from_secs(10)).is_empty());
    }
}
