//! 프로토콜 설정

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result, MAX_RETRIES, REQUEST_TIMEOUT_MS};

/// DFTP 프로토콜 설정 (클라이언트/서버 공용)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 요청 응답 대기 타임아웃 (밀리초)
    pub request_timeout_ms: u64,

    /// 프래그먼트 전송 간격 (밀리초)
    /// 흐름 제어가 아닌 단순 스로틀링
    pub fragment_interval_ms: u64,

    /// 재전송 라운드 최대 횟수
    pub max_retries: u32,

    /// 유휴 세션 만료 시간 (밀리초, 서버)
    pub session_idle_timeout_ms: u64,

    /// 프래그먼트가 끊긴 전송 정리 시간 (밀리초, 서버)
    pub transfer_idle_timeout_ms: u64,

    /// 만료 검사 주기 (밀리초, 서버)
    pub housekeeping_interval_ms: u64,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 전송 하나에 허용하는 최대 프래그먼트 수
    /// PUT 요청과 GET 응답의 개수가 이보다 크면 거부
    pub max_fragments: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            fragment_interval_ms: 10,
            max_retries: MAX_RETRIES,
            session_idle_timeout_ms: 30 * 60 * 1000, // 30분
            transfer_idle_timeout_ms: 60 * 1000,     // 1분
            housekeeping_interval_ms: 1000,
            recv_buffer_size: 65535,
            max_fragments: 1 << 20, // 약 1 GiB
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn fragment_interval(&self) -> Duration {
        Duration::from_millis(self.fragment_interval_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn transfer_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_idle_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms.max(1))
    }

    /// 로컬 네트워크용 설정
    pub fn lan() -> Self {
        Self {
            request_timeout_ms: 2000,
            fragment_interval_ms: 1,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            request_timeout_ms: 10_000,
            fragment_interval_ms: 20,
            max_retries: 6,
            transfer_idle_timeout_ms: 5 * 60 * 1000,
            ..Self::default()
        }
    }
}

/// 서버 설정 (TOML 파일)
///
/// ```toml
/// bind = "0.0.0.0:21000"
/// root = "./data/server-files"
///
/// [users]
/// alice = "alice123"
///
/// [protocol]
/// fragment_interval_ms = 10
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,

    /// 서버 루트 디렉토리 (가상 경로 `/`)
    pub root: PathBuf,

    /// 사용자 → 비밀번호
    pub users: HashMap<String, String>,

    pub protocol: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
            root: PathBuf::from("./data/server-files"),
            users: HashMap::new(),
            protocol: Config::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// 사용자 추가 (builder)
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_millis(5000));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.fragment_interval(), Duration::from_millis(10));
        assert_eq!(config.max_fragments, 1 << 20);
    }

    #[test]
    fn test_presets_keep_fragment_limit() {
        assert_eq!(Config::lan().fragment_interval_ms, 1);
        assert_eq!(Config::lan().max_fragments, Config::default().max_fragments);
        assert_eq!(Config::unstable_network().max_retries, 6);
    }

    #[test]
    fn test_server_config_from_toml() {
        let config = ServerConfig::from_toml(
            r#"
            bind = "127.0.0.1:21001"
            root = "/srv/dftp"

            [users]
            alice = "alice123"
            bob = "bob123"

            [protocol]
            request_timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.port(), 21001);
        assert_eq!(config.root, PathBuf::from("/srv/dftp"));
        assert_eq!(config.users.get("alice").map(String::as_str), Some("alice123"));
        assert_eq!(config.protocol.request_timeout_ms, 1500);
        // 지정하지 않은 값은 기본값
        assert_eq!(config.protocol.fragment_interval_ms, 10);
    }

    #[test]
    fn test_server_config_rejects_bad_toml() {
        assert!(matches!(
            ServerConfig::from_toml("bind = 12"),
            Err(Error::Config(_))
        ));
    }
}
