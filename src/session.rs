//! 서버 세션 저장소
//!
//! 원격 주소(IP:port)별 인증 상태와 현재 디렉토리. 디스패처가 소유하며
//! 일정 시간 활동이 없는 세션은 주기적으로 만료시킨다.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::info;

use crate::vpath::VirtualPath;

/// 인증된 원격 엔드포인트 상태
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,

    /// 현재 작업 디렉토리 (가상 경로)
    pub current_dir: VirtualPath,

    pub created_at: Instant,

    pub last_seen: Instant,
}

impl Session {
    pub fn new(username: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            username: username.into(),
            current_dir: VirtualPath::root(),
            created_at: now,
            last_seen: now,
        }
    }
}

/// 세션 저장소
pub struct SessionStore {
    sessions: DashMap<SocketAddr, Session>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// 로그인 성공 시 세션 생성 (기존 세션은 덮어씀)
    pub fn login(&self, addr: SocketAddr, username: &str) -> Session {
        let session = Session::new(username);
        self.sessions.insert(addr, session.clone());
        session
    }

    /// 인증된 세션 조회 (활동 시간 갱신)
    pub fn touch(&self, addr: &SocketAddr) -> Option<Session> {
        let mut entry = self.sessions.get_mut(addr)?;
        entry.last_seen = Instant::now();
        Some(entry.clone())
    }

    pub fn is_authenticated(&self, addr: &SocketAddr) -> bool {
        self.sessions.contains_key(addr)
    }

    pub fn set_current_dir(&self, addr: &SocketAddr, dir: VirtualPath) {
        if let Some(mut entry) = self.sessions.get_mut(addr) {
            entry.current_dir = dir;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// `now` 기준 유휴 세션 제거, 제거된 수 반환
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|addr, session| {
            let idle = now.saturating_duration_since(session.last_seen);
            if idle >= self.idle_timeout {
                info!("세션 만료: {} ({}), idle {:.1}s", addr, session.username, idle.as_secs_f64());
                false
            } else {
                true
            }
        });
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_login_starts_at_root() {
        let store = SessionStore::new(Duration::from_secs(60));
        let session = store.login(addr(4000), "alice");

        assert_eq!(session.username, "alice");
        assert!(session.current_dir.is_root());
        assert!(store.is_authenticated(&addr(4000)));
        assert!(!store.is_authenticated(&addr(4001)));
    }

    #[test]
    fn test_relogin_overwrites_session() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.login(addr(4000), "alice");
        store.set_current_dir(&addr(4000), VirtualPath::parse("/docs").unwrap());

        store.login(addr(4000), "bob");
        let session = store.touch(&addr(4000)).unwrap();
        assert_eq!(session.username, "bob");
        assert!(session.current_dir.is_root());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_evict_idle() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.login(addr(4000), "alice");
        store.login(addr(4001), "bob");

        let now = Instant::now();
        assert_eq!(store.evict_idle(now), 0);

        assert_eq!(store.evict_idle(now + Duration::from_secs(61)), 2);
        assert!(store.is_empty());
    }
}
