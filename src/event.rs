//! 클라이언트 이벤트
//!
//! UI 등 외부 수집기는 `connect`가 돌려준 수신기로 이벤트를 받는다

use tokio::sync::mpsc;

/// 이벤트 수신기 타입
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// 세션/전송 알림
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected {
        server: std::net::SocketAddr,
    },

    Disconnected,

    Authenticated {
        username: String,
    },

    /// 요청 결과로 돌려줄 수 없는 에러 (전송 실패, 서버의 비요청 ERROR, 소켓 에러)
    Error {
        message: String,
    },

    UploadProgress {
        name: String,
        sent: u32,
        total: u32,
        percent: u8,
    },

    /// 서버가 파일 저장을 확인함
    UploadComplete {
        name: String,
        bytes: u64,
    },

    DownloadStarted {
        name: String,
        expected_fragments: u32,
    },

    DownloadProgress {
        name: String,
        received: u32,
        total: u32,
        percent: u8,
    },

    DownloadComplete {
        name: String,
        bytes: u64,
    },
}
