//! 패킷 코덱
//!
//! 고정 32바이트 헤더 + 가변 페이로드
//!
//! ```text
//! 0      4                     24       28        32
//! +------+---------------------+--------+---------+----------------+
//! | id   | type (ASCII, 공백패딩) | len    | checksum| payload[len]   |
//! | u32be| 20 bytes            | u32be  | u32be   |                |
//! +------+---------------------+--------+---------+----------------+
//! ```

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::{Error, Result, HEADER_SIZE};

/// 타입 태그 필드 길이
pub const TYPE_TAG_LEN: usize = 20;

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Login,
    LoginResponse,
    Put,
    PutData,
    PutResponse,
    Get,
    GetData,
    GetResponse,
    Ls,
    LsResponse,
    Cd,
    CdResponse,
    Mkdir,
    MkdirResponse,
    Rmdir,
    RmdirResponse,
    Ack,
    Nack,
    Error,
}

impl PacketType {
    pub const ALL: [PacketType; 19] = [
        PacketType::Login,
        PacketType::LoginResponse,
        PacketType::Put,
        PacketType::PutData,
        PacketType::PutResponse,
        PacketType::Get,
        PacketType::GetData,
        PacketType::GetResponse,
        PacketType::Ls,
        PacketType::LsResponse,
        PacketType::Cd,
        PacketType::CdResponse,
        PacketType::Mkdir,
        PacketType::MkdirResponse,
        PacketType::Rmdir,
        PacketType::RmdirResponse,
        PacketType::Ack,
        PacketType::Nack,
        PacketType::Error,
    ];

    /// 와이어 태그
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Login => "LOGIN",
            PacketType::LoginResponse => "LOGIN_RESPONSE",
            PacketType::Put => "PUT",
            PacketType::PutData => "PUT_DATA",
            PacketType::PutResponse => "PUT_RESPONSE",
            PacketType::Get => "GET",
            PacketType::GetData => "GET_DATA",
            PacketType::GetResponse => "GET_RESPONSE",
            PacketType::Ls => "LS",
            PacketType::LsResponse => "LS_RESPONSE",
            PacketType::Cd => "CD",
            PacketType::CdResponse => "CD_RESPONSE",
            PacketType::Mkdir => "MKDIR",
            PacketType::MkdirResponse => "MKDIR_RESPONSE",
            PacketType::Rmdir => "RMDIR",
            PacketType::RmdirResponse => "RMDIR_RESPONSE",
            PacketType::Ack => "ACK",
            PacketType::Nack => "NACK",
            PacketType::Error => "ERROR",
        }
    }

    /// 요청 타입에 대응하는 응답 타입
    pub fn response_type(&self) -> Option<PacketType> {
        match self {
            PacketType::Login => Some(PacketType::LoginResponse),
            PacketType::Put => Some(PacketType::PutResponse),
            PacketType::Get => Some(PacketType::GetResponse),
            PacketType::Ls => Some(PacketType::LsResponse),
            PacketType::Cd => Some(PacketType::CdResponse),
            PacketType::Mkdir => Some(PacketType::MkdirResponse),
            PacketType::Rmdir => Some(PacketType::RmdirResponse),
            _ => None,
        }
    }

    /// 서버가 보내는 응답 전용 타입 여부
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            PacketType::LoginResponse
                | PacketType::PutResponse
                | PacketType::GetResponse
                | PacketType::GetData
                | PacketType::LsResponse
                | PacketType::CdResponse
                | PacketType::MkdirResponse
                | PacketType::RmdirResponse
                | PacketType::Error
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PacketType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PacketType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownPacketType(s.to_string()))
    }
}

/// 디코딩된 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 시퀀스/상관 ID (0 = 요청 없는 메시지)
    pub id: u32,

    /// 패킷 타입
    pub packet_type: PacketType,

    /// 헤더의 체크섬 값
    pub checksum: u32,

    /// 페이로드
    pub payload: Bytes,
}

impl Packet {
    /// 체크섬 없는 제어 패킷
    pub fn new(id: u32, packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            packet_type,
            checksum: 0,
            payload: payload.into(),
        }
    }

    /// 페이로드 체크섬을 채운 패킷
    pub fn with_checksum(id: u32, packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            id,
            packet_type,
            checksum: checksum(&payload),
            payload,
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        write_header(
            &mut buf,
            self.id,
            self.packet_type.as_str().as_bytes(),
            self.payload.len() as u32,
            self.checksum,
        );
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }

    /// 헤더 체크섬과 페이로드 체크섬 비교
    pub fn verify_checksum(&self) -> Result<()> {
        let got = checksum(&self.payload);
        if got != self.checksum {
            return Err(Error::ChecksumMismatch {
                expected: self.checksum,
                got,
            });
        }
        Ok(())
    }

    /// 페이로드를 텍스트로
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

fn write_header(buf: &mut Vec<u8>, id: u32, tag: &[u8], len: u32, checksum: u32) {
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(tag);
    buf.resize(4 + TYPE_TAG_LEN, b' ');
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
}

/// 임의 타입 태그로 패킷 인코딩
pub fn encode(id: u32, packet_type: &str, payload: &[u8], checksum: u32) -> Result<Vec<u8>> {
    let tag = packet_type.as_bytes();
    if tag.len() > TYPE_TAG_LEN || !packet_type.is_ascii() {
        return Err(Error::TypeTooLong(packet_type.to_string()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    write_header(&mut buf, id, tag, payload.len() as u32, checksum);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// 패킷 디코딩
///
/// 선언된 길이보다 실제 바이트가 적으면 `TruncatedPacket`, 초과분은 무시
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::PacketTooShort {
            len: bytes.len(),
            header: HEADER_SIZE,
        });
    }

    let id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let tag = String::from_utf8_lossy(&bytes[4..4 + TYPE_TAG_LEN]);
    let packet_type: PacketType = tag.trim_matches(|c: char| c == ' ' || c == '\0').parse()?;
    let declared = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]) as usize;
    let checksum = u32::from_be_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);

    let available = bytes.len() - HEADER_SIZE;
    if declared > available {
        return Err(Error::TruncatedPacket {
            declared,
            available,
        });
    }

    Ok(Packet {
        id,
        packet_type,
        checksum,
        payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + declared]),
    })
}

/// 단순 합산 체크섬 (mod 65536)
///
/// 바이트 순서와 무관하므로 전치 오류는 검출하지 못함
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |sum, &b| (sum + b as u32) % 65536)
}
