//! 에러 타입 정의

use thiserror::Error;

use crate::status::Status;

/// 로그인 실패 원인
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// 등록되지 않은 사용자
    UserNotFound,

    /// 비밀번호 불일치
    WrongPassword,

    /// 그 외 서버 응답 (원문 그대로)
    Other(String),
}

impl AuthFailure {
    /// LOGIN_RESPONSE 페이로드에서 실패 원인 도출
    pub fn from_response(payload: &str) -> Self {
        match payload.trim().parse::<Status>() {
            Ok(Status::UserNotFound) => AuthFailure::UserNotFound,
            Ok(Status::WrongPassword) => AuthFailure::WrongPassword,
            _ => AuthFailure::Other(payload.trim().to_string()),
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::UserNotFound => write!(f, "사용자를 찾을 수 없음"),
            AuthFailure::WrongPassword => write!(f, "비밀번호 불일치"),
            AuthFailure::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// DFTP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("패킷이 너무 짧음: {len} bytes (헤더 {header} bytes 필요)")]
    PacketTooShort { len: usize, header: usize },

    #[error("잘린 패킷: 선언 {declared} bytes, 실제 {available} bytes")]
    TruncatedPacket { declared: usize, available: usize },

    #[error("패킷 타입 태그가 너무 김: {0}")]
    TypeTooLong(String),

    #[error("알 수 없는 패킷 타입: {0:?}")]
    UnknownPacketType(String),

    #[error("형식 에러: {0}")]
    Format(String),

    #[error("서버에 연결되지 않음")]
    NotConnected,

    #[error("인증되지 않음")]
    NotAuthenticated,

    #[error("인증 실패: {0}")]
    Auth(AuthFailure),

    #[error("찾을 수 없음: {0}")]
    NotFound(String),

    #[error("이미 존재함: {0}")]
    AlreadyExists(String),

    #[error("디렉토리가 비어있지 않음: {0}")]
    NotEmpty(String),

    #[error("권한 없음: {0}")]
    PermissionDenied(String),

    #[error("서버 에러 ({status}): {message}")]
    Remote { status: Status, message: String },

    #[error("응답 타임아웃: request_id={request_id}")]
    Timeout { request_id: u32 },

    #[error("체크섬 불일치: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("무결성 검증 실패: {0}")]
    Integrity(String),

    #[error("프래그먼트 누락: {missing:?}")]
    FragmentGap { missing: Vec<u32> },

    #[error("범위를 벗어난 프래그먼트 ID: {id} (허용 {first}..={last})")]
    FragmentOutOfRange { id: u32, first: u32, last: u32 },

    #[error("루트 밖 경로 접근: {0}")]
    PathEscape(String),

    #[error("이미 진행 중인 전송이 있음")]
    TransferInProgress,

    #[error("채널 에러")]
    ChannelError,

    #[error("설정 에러: {0}")]
    Config(String),
}

impl Error {
    /// 서버 응답 상태 코드를 에러로 변환
    pub fn from_status(status: Status, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            Status::FileNotFound | Status::DirectoryNotFound => Error::NotFound(message),
            Status::AlreadyExists => Error::AlreadyExists(message),
            Status::NotEmpty => Error::NotEmpty(message),
            Status::PermissionDenied => Error::PermissionDenied(message),
            Status::UserNotFound | Status::WrongPassword => {
                Error::Auth(AuthFailure::from_response(status.as_str()))
            }
            Status::Success | Status::Error => Error::Remote { status, message },
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_from_status() {
        assert_eq!(AuthFailure::from_response("USER_NOT_FOUND"), AuthFailure::UserNotFound);
        assert_eq!(AuthFailure::from_response("WRONG_PASSWORD"), AuthFailure::WrongPassword);
        assert_eq!(
            AuthFailure::from_response("ERROR Invalid format"),
            AuthFailure::Other("ERROR Invalid format".into())
        );
    }

    #[test]
    fn test_status_to_error() {
        assert!(matches!(
            Error::from_status(Status::NotEmpty, "docs"),
            Error::NotEmpty(ref name) if name == "docs"
        ));
        assert!(matches!(
            Error::from_status(Status::FileNotFound, "a.txt"),
            Error::NotFound(_)
        ));
    }
}
