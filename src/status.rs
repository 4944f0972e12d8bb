//! 응답 상태 코드
//!
//! 응답 페이로드는 `<STATUS>` 또는 `<STATUS> <detail>` 형태 (LS는 `SUCCESS\n<listing>`)

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// 서버 응답 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Error,
    UserNotFound,
    WrongPassword,
    FileNotFound,
    DirectoryNotFound,
    PermissionDenied,
    AlreadyExists,
    NotEmpty,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Success,
        Status::Error,
        Status::UserNotFound,
        Status::WrongPassword,
        Status::FileNotFound,
        Status::DirectoryNotFound,
        Status::PermissionDenied,
        Status::AlreadyExists,
        Status::NotEmpty,
    ];

    /// 와이어 표기
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::Error => "ERROR",
            Status::UserNotFound => "USER_NOT_FOUND",
            Status::WrongPassword => "WRONG_PASSWORD",
            Status::FileNotFound => "FILE_NOT_FOUND",
            Status::DirectoryNotFound => "DIRECTORY_NOT_FOUND",
            Status::PermissionDenied => "PERMISSION_DENIED",
            Status::AlreadyExists => "ALREADY_EXISTS",
            Status::NotEmpty => "NOT_EMPTY",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Format(format!("알 수 없는 상태 코드: {:?}", s)))
    }
}

/// 파싱된 응답 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,

    /// 상태 코드 뒤의 내용 (구분자 제외)
    pub detail: String,
}

impl Response {
    pub fn new(status: Status, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    /// 상태 코드만 있는 응답
    pub fn status(status: Status) -> Self {
        Self::new(status, String::new())
    }

    /// 페이로드 파싱 (상태 코드는 첫 공백 또는 개행까지)
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(payload);
        let (head, detail) = match text.find(|c: char| c == ' ' || c == '\n') {
            Some(pos) => (&text[..pos], &text[pos + 1..]),
            None => (&text[..], ""),
        };

        Ok(Self {
            status: head.trim().parse()?,
            detail: detail.to_string(),
        })
    }

    /// 와이어 페이로드로 변환
    pub fn to_payload(&self) -> String {
        if self.detail.is_empty() {
            self.status.as_str().to_string()
        } else {
            format!("{} {}", self.status, self.detail)
        }
    }

    /// 실패 상태를 에러로 변환
    pub fn into_result(self) -> Result<String> {
        if self.status.is_success() {
            Ok(self.detail)
        } else {
            let message = if self.detail.is_empty() {
                self.status.as_str().to_string()
            } else {
                self.detail
            };
            Err(Error::from_status(self.status, message))
        }
    }
}
