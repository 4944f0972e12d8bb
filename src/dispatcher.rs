//! 서버 명령 디스패처
//!
//! 수신 데이터그램 하나를 해석해서 보낼 패킷 목록을 돌려준다.
//! 실패는 모두 핸들러 경계에서 응답 패킷으로 바뀌므로 수신 루프는 멈추지 않는다.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{Config, ServerConfig};
use crate::fragment::{fragment, Fragment};
use crate::packet::{Packet, PacketType};
use crate::session::{Session, SessionStore};
use crate::status::{Response, Status};
use crate::transfer::{DownloadTable, FragmentOutcome, TransferTable, UploadRecord};
use crate::vpath::ServerRoot;
use crate::{Error, Result};

/// 인증 없이 요청했을 때의 ERROR 문구
pub const NOT_AUTHENTICATED: &str = "Not authenticated";

/// 디스패처가 만든 송신 작업
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// 즉시 보낼 제어 패킷 (우선순위 큐)
    Reply(Packet),

    /// 간격을 두고 순서대로 보낼 데이터 프래그먼트
    Stream(Vec<Fragment>),
}

/// 만료 정리 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evicted {
    pub sessions: usize,
    pub uploads: usize,
    pub downloads: usize,
}

fn reply(id: u32, packet_type: PacketType, response: Response) -> Outbound {
    Outbound::Reply(Packet::new(id, packet_type, response.to_payload()))
}

fn error_packet(id: u32, message: impl AsRef<str>) -> Outbound {
    reply(id, PacketType::Error, Response::new(Status::Error, message.as_ref()))
}

/// 에러 → 응답 상태
fn status_of(err: &Error) -> Status {
    match err {
        Error::PathEscape(_) | Error::PermissionDenied(_) => Status::PermissionDenied,
        Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => Status::PermissionDenied,
        _ => Status::Error,
    }
}

/// 서버 디스패처
pub struct Dispatcher {
    root: ServerRoot,
    users: HashMap<String, String>,
    sessions: SessionStore,
    uploads: TransferTable,
    downloads: DownloadTable,
    max_fragments: u32,
}

impl Dispatcher {
    /// 루트 디렉토리를 준비하고 디스패처 생성
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let root = ServerRoot::open(&config.root)?;
        info!("서버 루트: {}", root.path().display());
        Ok(Self::with_root(root, config.users.clone(), &config.protocol))
    }

    pub fn with_root(root: ServerRoot, users: HashMap<String, String>, config: &Config) -> Self {
        Self {
            root,
            users,
            sessions: SessionStore::new(config.session_idle_timeout()),
            uploads: TransferTable::new(config.transfer_idle_timeout()),
            downloads: DownloadTable::new(config.transfer_idle_timeout()),
            max_fragments: config.max_fragments,
        }
    }

    pub fn root(&self) -> &ServerRoot {
        &self.root
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn uploads(&self) -> &TransferTable {
        &self.uploads
    }

    pub fn downloads(&self) -> &DownloadTable {
        &self.downloads
    }

    /// 원시 데이터그램 처리
    pub async fn dispatch(&self, datagram: &[u8], from: SocketAddr) -> Vec<Outbound> {
        match Packet::from_bytes(datagram) {
            Ok(packet) => self.handle(packet, from).await,
            Err(e) => {
                warn!("잘못된 패킷 ({}, {} bytes): {}", from, datagram.len(), e);
                vec![error_packet(0, "Invalid packet format")]
            }
        }
    }

    /// 디코딩된 패킷 처리
    pub async fn handle(&self, packet: Packet, from: SocketAddr) -> Vec<Outbound> {
        debug!(
            "수신 {} id={} len={} from {}",
            packet.packet_type,
            packet.id,
            packet.payload.len(),
            from
        );

        let id = packet.id;
        let packet_type = packet.packet_type;

        if packet_type == PacketType::Login {
            return self.handle_login(&packet, from);
        }

        if packet_type.is_response() {
            warn!("응답 타입 패킷 수신: {} from {}", packet_type, from);
            return vec![error_packet(0, format!("Unexpected packet type {}", packet_type))];
        }

        let Some(session) = self.sessions.touch(&from) else {
            debug!("미인증 요청 거부: {} from {}", packet_type, from);
            return vec![error_packet(id, NOT_AUTHENTICATED)];
        };

        let result = match packet_type {
            PacketType::Put => self.handle_put(&packet, from, &session).await,
            PacketType::PutData => self.handle_put_data(packet, from).await,
            PacketType::Get => self.handle_get(&packet, from, &session).await,
            PacketType::Ls => self.handle_ls(&packet, &session).await,
            PacketType::Cd => self.handle_cd(&packet, from, &session).await,
            PacketType::Mkdir => self.handle_mkdir(&packet, &session).await,
            PacketType::Rmdir => self.handle_rmdir(&packet, &session).await,
            PacketType::Ack => Ok(self.handle_ack(&packet, from)),
            PacketType::Nack => Ok(self.handle_nack(&packet, from)),
            other => Err(Error::Format(format!("처리할 수 없는 타입: {}", other))),
        };

        result.unwrap_or_else(|e| {
            warn!("{} 처리 실패 ({}): {}", packet_type, from, e);
            let response = Response::new(status_of(&e), e.to_string());
            match packet_type.response_type() {
                Some(response_type) => vec![reply(id, response_type, response)],
                None => vec![reply(0, PacketType::Error, response)],
            }
        })
    }

    /// 유휴 세션과 끊긴 전송 정리
    pub fn housekeeping(&self, now: Instant) -> Evicted {
        let evicted = Evicted {
            sessions: self.sessions.evict_idle(now),
            uploads: self.uploads.evict_idle(now),
            downloads: self.downloads.evict_idle(now),
        };
        if evicted != Evicted::default() {
            debug!("만료 정리: {:?}", evicted);
        }
        evicted
    }

    fn handle_login(&self, packet: &Packet, from: SocketAddr) -> Vec<Outbound> {
        let text = packet.payload_str();
        let parts: Vec<&str> = text.split(' ').collect();

        let response = match parts.as_slice() {
            [username, password] => match self.users.get(*username) {
                None => {
                    info!("로그인 실패 (사용자 없음): {} from {}", username, from);
                    Response::status(Status::UserNotFound)
                }
                Some(expected) if expected.as_str() != *password => {
                    info!("로그인 실패 (비밀번호): {} from {}", username, from);
                    Response::status(Status::WrongPassword)
                }
                Some(_) => {
                    self.sessions.login(from, username);
                    info!("로그인: {} from {}", username, from);
                    Response::status(Status::Success)
                }
            },
            _ => Response::new(Status::Error, "Invalid format"),
        };

        vec![reply(packet.id, PacketType::LoginResponse, response)]
    }

    async fn handle_put(
        &self,
        packet: &Packet,
        from: SocketAddr,
        session: &Session,
    ) -> Result<Vec<Outbound>> {
        let text = packet.payload_str();
        let (name, count) = text
            .trim()
            .rsplit_once(' ')
            .ok_or_else(|| Error::Format("PUT <filename> <count>".into()))?;
        let count: u32 = count
            .parse()
            .map_err(|_| Error::Format(format!("잘못된 프래그먼트 수: {:?}", count)))?;
        if count > self.max_fragments {
            return Err(Error::Format(format!(
                "프래그먼트 수 초과: {} (최대 {})",
                count, self.max_fragments
            )));
        }
        let name = name.trim();

        let vpath = session.current_dir.join(name)?;
        if vpath.is_root() || name.is_empty() {
            return Err(Error::Format(format!("잘못된 파일 이름: {:?}", name)));
        }

        let target = self.root.resolve_checked(&vpath).await?;
        if let Ok(meta) = tokio::fs::metadata(&target).await {
            if meta.is_dir() {
                return Ok(vec![reply(
                    packet.id,
                    PacketType::PutResponse,
                    Response::new(Status::Error, "Is a directory"),
                )]);
            }
        }

        let transfer_id = self.uploads.begin_upload(from, name, target, count);
        info!(
            "업로드 시작: {} ({} 프래그먼트, {}) from {}",
            vpath, count, transfer_id, from
        );

        let mut out = vec![reply(
            packet.id,
            PacketType::PutResponse,
            Response::new(Status::Success, transfer_id.as_str()),
        )];
        if count == 0 {
            out.extend(self.finalize_upload(&transfer_id).await);
        }
        Ok(out)
    }

    async fn handle_put_data(&self, packet: Packet, from: SocketAddr) -> Result<Vec<Outbound>> {
        let id = packet.id;
        if self.uploads.upload_for(&from).is_none() {
            return Ok(self.replay_completion(id, from));
        }

        let fragment = match Fragment::from_packet(packet) {
            Ok(fragment) => fragment,
            Err(Error::ChecksumMismatch { expected, got }) => {
                warn!(
                    "체크섬 불일치: fragment={} expected={} got={} from {}",
                    id, expected, got, from
                );
                self.uploads.record_corrupt(&from);
                return Ok(vec![Outbound::Reply(Packet::new(id, PacketType::Nack, Bytes::new()))]);
            }
            Err(e) => return Err(e),
        };

        let ack = Outbound::Reply(Packet::new(id, PacketType::Ack, Bytes::new()));
        let outcome = match self.uploads.accept_fragment(&from, &fragment) {
            Ok(outcome) => outcome,
            Err(e @ Error::FragmentOutOfRange { .. }) => {
                debug!("프래그먼트 폐기 ({}): {}", from, e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        match outcome {
            FragmentOutcome::Accepted { complete: false } | FragmentOutcome::Duplicate => Ok(vec![ack]),
            FragmentOutcome::Accepted { complete: true } => {
                let mut out = vec![ack];
                if let Some(transfer_id) = self.uploads.upload_for(&from) {
                    out.extend(self.finalize_upload(&transfer_id).await);
                }
                Ok(out)
            }
        }
    }

    /// 끝난 업로드에 늦게 도착한 프래그먼트: ACK와 보관한 종료 응답을 다시 보냄
    fn replay_completion(&self, id: u32, from: SocketAddr) -> Vec<Outbound> {
        match self.uploads.completed_for(&from) {
            Some(done) if done.covers(id) => {
                debug!(
                    "완료된 업로드 {}의 프래그먼트 {} 재수신, 종료 응답 재전송 ({})",
                    done.transfer_id, id, from
                );
                vec![
                    Outbound::Reply(Packet::new(id, PacketType::Ack, Bytes::new())),
                    Outbound::Reply(done.terminal),
                ]
            }
            _ => vec![error_packet(0, "Transfer not found")],
        }
    }

    /// 업로드 완료 처리: 파일 저장 후 종료 응답 (id 0)
    async fn finalize_upload(&self, transfer_id: &str) -> Vec<Outbound> {
        let Some(record) = self.uploads.take(transfer_id) else {
            return Vec::new();
        };

        let filename = record.filename.clone();
        let owner = record.owner;
        let expected = record.expected_fragments();
        let summary = record.stats.summary();

        let terminal = match Self::write_upload(record).await {
            Ok((size, crc)) => {
                info!("업로드 완료: {} ({} bytes, crc32={:08x}) | {}", filename, size, crc, summary);
                Packet::new(
                    0,
                    PacketType::PutResponse,
                    Response::new(Status::Success, format!("{} {}", size, crc)).to_payload(),
                )
            }
            Err(e) => {
                warn!("업로드 저장 실패: {}: {}", filename, e);
                Packet::new(
                    0,
                    PacketType::Error,
                    Response::new(Status::Error, format!("Failed to save file: {}", e)).to_payload(),
                )
            }
        };

        self.uploads.complete(owner, transfer_id, expected, terminal.clone());
        vec![Outbound::Reply(terminal)]
    }

    async fn write_upload(record: UploadRecord) -> Result<(u64, u32)> {
        let target = record.target_path.clone();
        let data = record.into_payload()?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;

        let size = tokio::fs::metadata(&target).await?.len();
        if size != data.len() as u64 {
            return Err(Error::Integrity(format!(
                "저장된 크기 {} != 수신 크기 {}",
                size,
                data.len()
            )));
        }
        Ok((size, crc32fast::hash(&data)))
    }

    async fn handle_get(
        &self,
        packet: &Packet,
        from: SocketAddr,
        session: &Session,
    ) -> Result<Vec<Outbound>> {
        let name = packet.payload_str().trim().to_string();
        let not_found = || {
            vec![reply(
                packet.id,
                PacketType::GetResponse,
                Response::new(Status::FileNotFound, name.as_str()),
            )]
        };

        if name.is_empty() {
            return Ok(not_found());
        }

        let vpath = session.current_dir.join(&name)?;
        let path = self.root.resolve_checked(&vpath).await?;
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            debug!("GET 대상 없음: {} from {}", vpath, from);
            return Ok(not_found());
        }

        let data = tokio::fs::read(&path).await?;
        let fragments = fragment(&data, PacketType::GetData, 1);
        info!(
            "다운로드 시작: {} ({} bytes, {} 프래그먼트) to {}",
            vpath,
            data.len(),
            fragments.len(),
            from
        );

        let mut out = vec![reply(
            packet.id,
            PacketType::GetResponse,
            Response::new(Status::Success, fragments.len().to_string()),
        )];
        if !fragments.is_empty() {
            self.downloads.begin(from, &name, fragments.clone());
            out.push(Outbound::Stream(fragments));
        }
        Ok(out)
    }

    async fn handle_ls(&self, packet: &Packet, session: &Session) -> Result<Vec<Outbound>> {
        let dir = self.root.resolve_checked(&session.current_dir).await?;
        let mut reader = tokio::fs::read_dir(&dir).await?;

        let mut entries: Vec<(String, String)> = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("메타데이터 조회 실패: {}: {}", name, e);
                    continue;
                }
            };
            let line = if meta.is_dir() {
                format!("DIR {} 0", name)
            } else {
                format!("FILE {} {}", name, meta.len())
            };
            entries.push((name, line));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let listing: Vec<String> = entries.into_iter().map(|(_, line)| line).collect();
        let payload = format!("{}\n{}", Status::Success, listing.join("\n"));
        Ok(vec![Outbound::Reply(Packet::new(packet.id, PacketType::LsResponse, payload))])
    }

    async fn handle_cd(
        &self,
        packet: &Packet,
        from: SocketAddr,
        session: &Session,
    ) -> Result<Vec<Outbound>> {
        let name = packet.payload_str().trim().to_string();
        let not_found = || {
            vec![reply(
                packet.id,
                PacketType::CdResponse,
                Response::new(Status::DirectoryNotFound, name.as_str()),
            )]
        };

        let target = if name == ".." {
            session.current_dir.parent()
        } else {
            session.current_dir.join(&name)?
        };

        let path = match self.root.resolve_checked(&target).await {
            Ok(path) => path,
            Err(Error::PathEscape(_)) => return Ok(not_found()),
            Err(e) => return Err(e),
        };
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Ok(not_found());
        }

        debug!("CD {} -> {} ({})", session.current_dir, target, from);
        self.sessions.set_current_dir(&from, target.clone());
        Ok(vec![reply(
            packet.id,
            PacketType::CdResponse,
            Response::new(Status::Success, target.to_string()),
        )])
    }

    async fn handle_mkdir(&self, packet: &Packet, session: &Session) -> Result<Vec<Outbound>> {
        let name = packet.payload_str().trim().to_string();
        let respond = |status: Status| {
            vec![reply(
                packet.id,
                PacketType::MkdirResponse,
                Response::new(status, name.as_str()),
            )]
        };

        if name.is_empty() {
            return Err(Error::Format("MKDIR <name>".into()));
        }
        let vpath = session.current_dir.join(&name)?;
        if vpath.is_root() {
            return Ok(respond(Status::AlreadyExists));
        }

        let path = self.root.resolve_checked(&vpath).await?;
        if tokio::fs::symlink_metadata(&path).await.is_ok() {
            return Ok(respond(Status::AlreadyExists));
        }

        match tokio::fs::create_dir(&path).await {
            Ok(()) => {
                info!("디렉토리 생성: {}", vpath);
                Ok(vec![reply(
                    packet.id,
                    PacketType::MkdirResponse,
                    Response::status(Status::Success),
                )])
            }
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => Ok(respond(Status::DirectoryNotFound)),
                io::ErrorKind::AlreadyExists => Ok(respond(Status::AlreadyExists)),
                _ => Err(e.into()),
            },
        }
    }

    async fn handle_rmdir(&self, packet: &Packet, session: &Session) -> Result<Vec<Outbound>> {
        let name = packet.payload_str().trim().to_string();
        let respond = |status: Status| {
            vec![reply(
                packet.id,
                PacketType::RmdirResponse,
                Response::new(status, name.as_str()),
            )]
        };

        if name.is_empty() {
            return Err(Error::Format("RMDIR <name>".into()));
        }
        let vpath = session.current_dir.join(&name)?;
        if vpath.is_root() {
            return Ok(respond(Status::PermissionDenied));
        }

        let path = self.root.resolve_checked(&vpath).await?;
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(respond(Status::DirectoryNotFound))
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Ok(vec![reply(
                packet.id,
                PacketType::RmdirResponse,
                Response::new(Status::Error, "Not a directory"),
            )]);
        }

        let mut reader = tokio::fs::read_dir(&path).await?;
        if reader.next_entry().await?.is_some() {
            return Ok(respond(Status::NotEmpty));
        }

        tokio::fs::remove_dir(&path).await?;
        info!("디렉토리 삭제: {}", vpath);
        Ok(vec![reply(
            packet.id,
            PacketType::RmdirResponse,
            Response::status(Status::Success),
        )])
    }

    fn handle_ack(&self, packet: &Packet, from: SocketAddr) -> Vec<Outbound> {
        if self.downloads.ack(&from, packet.id) {
            info!("다운로드 전달 확인 완료: {}", from);
        }
        Vec::new()
    }

    fn handle_nack(&self, packet: &Packet, from: SocketAddr) -> Vec<Outbound> {
        match self.downloads.fragment(&from, packet.id) {
            Some(fragment) => {
                debug!("NACK 재전송: fragment={} to {}", packet.id, from);
                vec![Outbound::Reply(fragment.to_packet())]
            }
            None => {
                debug!("NACK 대상 없음: fragment={} from {}", packet.id, from);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::packet::checksum;
    use tempfile::TempDir;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn setup() -> (TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(dir.path())
            .with_user("alice", "alice123")
            .with_user("bob", "bob123");
        let dispatcher = Dispatcher::new(&config).unwrap();
        (dir, dispatcher)
    }

    fn request(id: u32, packet_type: PacketType, payload: &str) -> Packet {
        Packet::new(id, packet_type, payload.to_string())
    }

    fn single_reply(out: Vec<Outbound>) -> Packet {
        assert_eq!(out.len(), 1, "{:?}", out);
        match out.into_iter().next() {
            Some(Outbound::Reply(packet)) => packet,
            other => panic!("unexpected outbound: {:?}", other),
        }
    }

    async fn login(dispatcher: &Dispatcher, from: SocketAddr) {
        let packet = single_reply(dispatcher.handle(request(1, PacketType::Login, "alice alice123"), from).await);
        assert_eq!(packet.payload.as_ref(), b"SUCCESS");
    }

    #[tokio::test]
    async fn test_login_outcomes() {
        let (_dir, dispatcher) = setup();

        let ok = single_reply(dispatcher.handle(request(1, PacketType::Login, "alice alice123"), addr(1)).await);
        assert_eq!(ok.id, 1);
        assert_eq!(ok.packet_type, PacketType::LoginResponse);
        assert_eq!(ok.payload.as_ref(), b"SUCCESS");

        let wrong = single_reply(dispatcher.handle(request(2, PacketType::Login, "alice nope"), addr(2)).await);
        assert_eq!(wrong.payload.as_ref(), b"WRONG_PASSWORD");

        let unknown = single_reply(dispatcher.handle(request(3, PacketType::Login, "mallory x"), addr(3)).await);
        assert_eq!(unknown.payload.as_ref(), b"USER_NOT_FOUND");

        let malformed = single_reply(dispatcher.handle(request(4, PacketType::Login, "alice"), addr(4)).await);
        assert_eq!(malformed.payload.as_ref(), b"ERROR Invalid format");

        assert!(dispatcher.sessions().is_authenticated(&addr(1)));
        assert!(!dispatcher.sessions().is_authenticated(&addr(2)));
    }

    #[tokio::test]
    async fn test_requires_authentication() {
        let (_dir, dispatcher) = setup();

        let packet = single_reply(dispatcher.handle(request(9, PacketType::Ls, ""), addr(1)).await);
        assert_eq!(packet.id, 9);
        assert_eq!(packet.packet_type, PacketType::Error);
        assert_eq!(packet.payload_str(), "ERROR Not authenticated");
    }

    #[tokio::test]
    async fn test_garbage_datagram() {
        let (_dir, dispatcher) = setup();

        let packet = single_reply(dispatcher.dispatch(b"nonsense", addr(1)).await);
        assert_eq!(packet.id, 0);
        assert_eq!(packet.packet_type, PacketType::Error);
    }

    #[tokio::test]
    async fn test_upload_writes_file() {
        let (dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        let data: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();
        let fragments = fragment(&data, PacketType::PutData, 1);
        assert_eq!(fragments.len(), 3);

        let grant = single_reply(dispatcher.handle(request(2, PacketType::Put, "report v2.bin 3"), from).await);
        assert_eq!(grant.packet_type, PacketType::PutResponse);
        assert!(grant.payload_str().starts_with("SUCCESS put-"));

        let mut last = Vec::new();
        for f in &fragments {
            last = dispatcher.handle(f.to_packet(), from).await;
        }

        // 마지막 프래그먼트: ACK + 종료 응답
        assert_eq!(last.len(), 2);
        let terminal = match &last[1] {
            Outbound::Reply(packet) => packet.clone(),
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(terminal.id, 0);
        assert_eq!(
            terminal.payload_str(),
            format!("SUCCESS 2500 {}", crc32fast::hash(&data))
        );

        let written = std::fs::read(dir.path().join("report v2.bin")).unwrap();
        assert_eq!(written, data);
        assert!(dispatcher.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_empty_upload_finishes_immediately() {
        let (dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        let out = dispatcher.handle(request(2, PacketType::Put, "empty.txt 0"), from).await;
        assert_eq!(out.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("empty.txt")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_fragment_is_nacked() {
        let (dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        dispatcher.handle(request(2, PacketType::Put, "a.bin 1"), from).await;

        let mut packet = Fragment::new(1, PacketType::PutData, Bytes::from_static(b"hello")).to_packet();
        packet.checksum = checksum(b"hellp");
        let nack = single_reply(dispatcher.handle(packet, from).await);
        assert_eq!(nack.packet_type, PacketType::Nack);
        assert_eq!(nack.id, 1);
        assert!(!dir.path().join("a.bin").exists());

        let out = dispatcher
            .handle(Fragment::new(1, PacketType::PutData, Bytes::from_static(b"hello")).to_packet(), from)
            .await;
        assert_eq!(out.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_put_data_without_upload() {
        let (_dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        let f = Fragment::new(1, PacketType::PutData, Bytes::from_static(b"x"));
        let packet = single_reply(dispatcher.handle(f.to_packet(), from).await);
        assert_eq!(packet.id, 0);
        assert_eq!(packet.payload_str(), "ERROR Transfer not found");
    }

    #[tokio::test]
    async fn test_put_rejects_oversized_fragment_count() {
        let (_dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        let packet = single_reply(dispatcher.handle(request(2, PacketType::Put, "x 4294967295"), from).await);
        assert_eq!(packet.id, 2);
        assert_eq!(packet.packet_type, PacketType::PutResponse);
        assert!(packet.payload_str().starts_with("ERROR"), "{}", packet.payload_str());
        assert!(dispatcher.uploads().is_empty());

        // 한도 안쪽은 그대로 허용
        let limit = Config::default().max_fragments;
        let ok = single_reply(
            dispatcher
                .handle(request(3, PacketType::Put, &format!("x {}", limit)), from)
                .await,
        );
        assert!(ok.payload_str().starts_with("SUCCESS put-"));
    }

    #[tokio::test]
    async fn test_late_fragment_after_finalize_replays_receipt() {
        let (_dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        dispatcher.handle(request(2, PacketType::Put, "a.bin 1"), from).await;
        let f = Fragment::new(1, PacketType::PutData, Bytes::from_static(b"hello"));
        let first = dispatcher.handle(f.to_packet(), from).await;
        assert_eq!(first.len(), 2);

        // ACK와 종료 응답이 유실되어 같은 프래그먼트를 다시 보냄
        let again = dispatcher.handle(f.to_packet(), from).await;
        assert_eq!(again, first);
        match &again[1] {
            Outbound::Reply(packet) => {
                assert_eq!(packet.id, 0);
                assert_eq!(packet.packet_type, PacketType::PutResponse);
                assert_eq!(packet.payload_str(), format!("SUCCESS 5 {}", crc32fast::hash(b"hello")));
            }
            other => panic!("unexpected: {:?}", other),
        }

        // 범위 밖 ID는 여전히 대응 업로드 없음
        let stray = Fragment::new(2, PacketType::PutData, Bytes::from_static(b"x"));
        let packet = single_reply(dispatcher.handle(stray.to_packet(), from).await);
        assert_eq!(packet.payload_str(), "ERROR Transfer not found");

        // 만료 후에는 보관하지 않음
        dispatcher.housekeeping(Instant::now() + Duration::from_secs(120));
        let packet = single_reply(dispatcher.handle(f.to_packet(), from).await);
        assert_eq!(packet.payload_str(), "ERROR Transfer not found");
    }

    #[tokio::test]
    async fn test_out_of_range_fragment_is_dropped() {
        let (dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        dispatcher.handle(request(2, PacketType::Put, "b.bin 2"), from).await;
        let stray = Fragment::new(7, PacketType::PutData, Bytes::from_static(b"x"));
        assert!(dispatcher.handle(stray.to_packet(), from).await.is_empty());

        // 업로드는 계속 진행 가능
        for (id, data) in [(1, &b"ab"[..]), (2, &b"cd"[..])] {
            dispatcher
                .handle(Fragment::new(id, PacketType::PutData, Bytes::copy_from_slice(data)).to_packet(), from)
                .await;
        }
        assert_eq!(std::fs::read(dir.path().join("b.bin")).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_get_missing_file() {
        let (_dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        let packet = single_reply(dispatcher.handle(request(5, PacketType::Get, "nope.txt"), from).await);
        assert_eq!(packet.packet_type, PacketType::GetResponse);
        assert!(packet.payload_str().starts_with("FILE_NOT_FOUND"));
        assert!(dispatcher.downloads().is_empty());
    }

    #[tokio::test]
    async fn test_get_streams_fragments_and_resends_on_nack() {
        let (dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;
        std::fs::write(dir.path().join("b.bin"), vec![3u8; 2000]).unwrap();

        let out = dispatcher.handle(request(6, PacketType::Get, "b.bin"), from).await;
        assert_eq!(out.len(), 2);
        match &out[0] {
            Outbound::Reply(packet) => assert_eq!(packet.payload_str(), "SUCCESS 3"),
            other => panic!("unexpected: {:?}", other),
        }
        match &out[1] {
            Outbound::Stream(fragments) => {
                assert_eq!(fragments.len(), 3);
                assert_eq!(fragments[0].packet_type, PacketType::GetData);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let resent = single_reply(dispatcher.handle(Packet::new(2, PacketType::Nack, Bytes::new()), from).await);
        assert_eq!(resent.id, 2);
        assert_eq!(resent.packet_type, PacketType::GetData);
        assert!(resent.verify_checksum().is_ok());

        for id in 1..=3 {
            dispatcher.handle(Packet::new(id, PacketType::Ack, Bytes::new()), from).await;
        }
        assert!(dispatcher.downloads().is_empty());
    }

    #[tokio::test]
    async fn test_directory_commands() {
        let (dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        let mk = single_reply(dispatcher.handle(request(2, PacketType::Mkdir, "docs"), from).await);
        assert_eq!(mk.payload_str(), "SUCCESS");
        let again = single_reply(dispatcher.handle(request(3, PacketType::Mkdir, "docs"), from).await);
        assert!(again.payload_str().starts_with("ALREADY_EXISTS"));
        let orphan = single_reply(dispatcher.handle(request(4, PacketType::Mkdir, "x/y"), from).await);
        assert!(orphan.payload_str().starts_with("DIRECTORY_NOT_FOUND"));

        std::fs::write(dir.path().join("notes.txt"), b"12345").unwrap();
        let ls = single_reply(dispatcher.handle(request(5, PacketType::Ls, ""), from).await);
        assert_eq!(ls.payload_str(), "SUCCESS\nDIR docs 0\nFILE notes.txt 5");

        let cd = single_reply(dispatcher.handle(request(6, PacketType::Cd, "docs"), from).await);
        assert_eq!(cd.payload_str(), "SUCCESS /docs");
        let up = single_reply(dispatcher.handle(request(7, PacketType::Cd, ".."), from).await);
        assert_eq!(up.payload_str(), "SUCCESS /");
        let missing = single_reply(dispatcher.handle(request(8, PacketType::Cd, "nowhere"), from).await);
        assert!(missing.payload_str().starts_with("DIRECTORY_NOT_FOUND"));

        std::fs::write(dir.path().join("docs").join("a.txt"), b"a").unwrap();
        let full = single_reply(dispatcher.handle(request(9, PacketType::Rmdir, "docs"), from).await);
        assert!(full.payload_str().starts_with("NOT_EMPTY"));
        let file = single_reply(dispatcher.handle(request(10, PacketType::Rmdir, "notes.txt"), from).await);
        assert_eq!(file.payload_str(), "ERROR Not a directory");
        let root = single_reply(dispatcher.handle(request(11, PacketType::Rmdir, "/"), from).await);
        assert!(root.payload_str().starts_with("PERMISSION_DENIED"));

        std::fs::remove_file(dir.path().join("docs").join("a.txt")).unwrap();
        let rm = single_reply(dispatcher.handle(request(12, PacketType::Rmdir, "docs"), from).await);
        assert_eq!(rm.payload_str(), "SUCCESS");
        assert!(!dir.path().join("docs").exists());
    }

    #[tokio::test]
    async fn test_cd_traversal_stays_in_root() {
        let (_dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        let cd = single_reply(dispatcher.handle(request(2, PacketType::Cd, "../../.."), from).await);
        assert_eq!(cd.payload_str(), "SUCCESS /");

        let escape = single_reply(dispatcher.handle(request(3, PacketType::Cd, "../../etc"), from).await);
        assert!(escape.payload_str().starts_with("DIRECTORY_NOT_FOUND"));
        assert!(dispatcher.sessions().touch(&from).unwrap().current_dir.is_root());
    }

    #[tokio::test]
    async fn test_response_type_from_client_rejected() {
        let (_dir, dispatcher) = setup();
        let from = addr(1);
        login(&dispatcher, from).await;

        let packet = single_reply(dispatcher.handle(request(2, PacketType::LsResponse, "SUCCESS"), from).await);
        assert_eq!(packet.packet_type, PacketType::Error);
        assert_eq!(packet.id, 0);
    }
}
