//! # DFTP (Datagram File Transfer Protocol)
//!
//! UDP 기반 요청/응답 + 프래그먼트 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **고정 헤더**: 32바이트 헤더 (id, 타입 태그, 길이, 체크섬)
//! - **프래그먼트 전송**: 파일을 992바이트 조각으로 나눠 간격을 두고 전송
//! - **ACK/NACK 재전송**: 체크섬 불일치나 누락 조각만 다시 요청
//! - **세션**: 원격 엔드포인트별 인증과 가상 작업 디렉토리
//! - **루트 격리**: 모든 경로는 서버 루트 안으로 한정

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod fragment;
pub mod packet;
pub mod pending;
pub mod server;
pub mod session;
pub mod stats;
pub mod status;
pub mod transfer;
pub mod vpath;

pub use client::{Client, EntryKind, RemoteEntry, UploadReceipt};
pub use config::{Config, ServerConfig};
pub use dispatcher::{Dispatcher, Outbound};
pub use error::{AuthFailure, Error, Result};
pub use event::{ClientEvent, EventReceiver};
pub use fragment::{fragment, reassemble, Fragment, FragmentId, Reassembly};
pub use packet::{checksum, decode, encode, Packet, PacketType};
pub use server::{Server, ShutdownHandle};
pub use stats::TransferStats;
pub use status::{Response, Status};

/// 패킷 최대 크기 (바이트)
pub const PACKET_SIZE: usize = 1024;

/// 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 32;

/// 프래그먼트당 데이터 크기 (바이트)
pub const DATA_SIZE: usize = PACKET_SIZE - HEADER_SIZE;

/// 요청 응답 대기 시간 (밀리초)
pub const REQUEST_TIMEOUT_MS: u64 = 5000;

/// 재전송 라운드 최대 횟수
pub const MAX_RETRIES: u32 = 3;

/// 기본 서버 포트
pub const DEFAULT_PORT: u16 = 21000;
