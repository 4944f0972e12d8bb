//! DFTP 클라이언트
//!
//! - 요청/응답: 요청 ID별 대기 테이블과 타임아웃
//! - 업로드: 간격을 둔 프래그먼트 전송, ACK/NACK 기반 재전송
//! - 다운로드: 재조립, 정체 시 누락분 NACK
//!
//! 세션 상태는 모두 단일 태스크(`ClientInner`)가 소유하고
//! 사용자 호출, 수신 데이터그램, 타이머 틱은 명령 채널로 들어온다.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatcher::NOT_AUTHENTICATED;
use crate::event::{ClientEvent, EventReceiver};
use crate::fragment::{fragment, Fragment, FragmentId, Inserted, Reassembly};
use crate::packet::{Packet, PacketType};
use crate::pending::{PendingRequests, RequestIds};
use crate::stats::TransferStats;
use crate::status::{Response, Status};
use crate::{AuthFailure, Error, Result, PACKET_SIZE};

/// 원격 목록 항목 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

/// LS 결과 한 줄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub kind: EntryKind,
    pub name: String,

    /// 파일 크기 (디렉토리는 0)
    pub size: u64,
}

impl RemoteEntry {
    /// `"<DIR|FILE> <name> <size>"` 파싱 (이름에 공백 허용)
    pub fn parse(line: &str) -> Result<Self> {
        let bad = || Error::Format(format!("잘못된 목록 항목: {:?}", line));

        let (kind, rest) = line.trim().split_once(' ').ok_or_else(bad)?;
        let (name, size) = rest.rsplit_once(' ').ok_or_else(bad)?;
        let kind = match kind {
            "DIR" => EntryKind::Dir,
            "FILE" => EntryKind::File,
            _ => return Err(bad()),
        };

        Ok(Self {
            kind,
            name: name.to_string(),
            size: size.parse().map_err(|_| bad())?,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// 서버가 확인한 업로드 결과
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub name: String,

    /// 서버에 저장된 크기
    pub bytes: u64,

    pub crc32: u32,
    pub fragments: u32,
    pub stats: TransferStats,
}

/// 핸들과 내부 태스크가 공유하는 세션 플래그
#[derive(Debug, Default)]
struct SessionState {
    authenticated: bool,
    username: Option<String>,
}

/// 내부 명령
enum ClientCmd {
    Request {
        packet_type: PacketType,
        payload: Bytes,
        reply: oneshot::Sender<Result<Packet>>,
    },
    Upload {
        name: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<UploadReceipt>>,
    },
    Download {
        name: String,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Datagram(Packet),
    Tick,
    PendingCount(oneshot::Sender<usize>),
    Stop(oneshot::Sender<()>),
}

/// 응답 도착 시 이어서 할 일
enum Continuation {
    Reply(oneshot::Sender<Result<Packet>>),
    UploadGrant,
    DownloadGrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadPhase {
    AwaitingGrant,
    Sending,
    AwaitingCompletion,
}

/// 진행 중인 업로드
struct UploadState {
    name: String,
    request_id: u32,
    fragments: Vec<Fragment>,
    acked: Vec<bool>,
    sent: Vec<bool>,

    /// 보낼 프래그먼트 인덱스
    queue: VecDeque<usize>,

    phase: UploadPhase,
    next_send_at: Instant,

    /// 종료 응답 대기 기한 (AwaitingCompletion)
    deadline: Instant,

    /// 연속 무응답 라운드 수
    retries: u32,

    payload_len: u64,
    crc32: u32,
    stats: TransferStats,
    reply: oneshot::Sender<Result<UploadReceipt>>,
}

impl UploadState {
    fn index(&self, id: FragmentId) -> Option<usize> {
        let idx = id.checked_sub(1)? as usize;
        (idx < self.fragments.len()).then_some(idx)
    }

    /// ACK 받지 못한 프래그먼트를 다시 큐에 넣음
    fn requeue_unacked(&mut self) -> usize {
        let mut count = 0;
        for idx in 0..self.fragments.len() {
            if !self.acked[idx] && !self.queue.contains(&idx) {
                self.queue.push_back(idx);
                count += 1;
            }
        }
        count
    }

    /// 서버의 `"<bytes> <crc32>"`를 보낸 데이터와 대조
    fn verify_receipt(&self, detail: &str) -> Result<UploadReceipt> {
        let bad = || Error::Format(format!("잘못된 업로드 완료 응답: {:?}", detail));
        let (bytes, crc) = detail.trim().split_once(' ').ok_or_else(bad)?;
        let bytes: u64 = bytes.parse().map_err(|_| bad())?;
        let crc32: u32 = crc.trim().parse().map_err(|_| bad())?;

        if bytes != self.payload_len {
            return Err(Error::Integrity(format!(
                "서버 저장 크기 {} != 보낸 크기 {}",
                bytes, self.payload_len
            )));
        }
        if crc32 != self.crc32 {
            return Err(Error::Integrity(format!(
                "crc32 불일치: server={:08x} local={:08x}",
                crc32, self.crc32
            )));
        }

        Ok(UploadReceipt {
            name: self.name.clone(),
            bytes,
            crc32,
            fragments: self.fragments.len() as u32,
            stats: self.stats.clone(),
        })
    }
}

/// 진행 중인 다운로드
struct DownloadState {
    name: String,
    request_id: u32,

    /// None = 아직 GET 응답 대기
    reassembly: Option<Reassembly>,

    last_activity: Instant,

    /// 연속 정체 라운드 수
    retries: u32,

    stats: TransferStats,
    reply: oneshot::Sender<Result<Bytes>>,
}

enum ActiveTransfer {
    Upload(UploadState),
    Download(DownloadState),
}

/// ERROR 패킷 → 에러
fn remote_error(packet: &Packet) -> Error {
    let (status, message) = match Response::parse(&packet.payload) {
        Ok(response) => (response.status, response.detail),
        Err(_) => (Status::Error, packet.payload_str().into_owned()),
    };
    if message == NOT_AUTHENTICATED {
        Error::NotAuthenticated
    } else {
        Error::Remote { status, message }
    }
}

/// 응답 패킷의 성공 detail 또는 에러
fn response_detail(packet: &Packet) -> Result<String> {
    if packet.packet_type == PacketType::Error {
        return Err(remote_error(packet));
    }
    Response::parse(&packet.payload)?.into_result()
}

/// 클라이언트 내부 상태 (단일 태스크에서만 접근)
struct ClientInner {
    config: Config,
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    ids: RequestIds,
    pending: PendingRequests<Continuation>,
    active: Option<ActiveTransfer>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientInner {
    fn new(
        config: Config,
        socket: Arc<UdpSocket>,
        server_addr: SocketAddr,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            pending: PendingRequests::new(config.request_timeout()),
            config,
            socket,
            server_addr,
            ids: RequestIds::new(),
            active: None,
            events,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ClientCmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ClientCmd::Request {
                    packet_type,
                    payload,
                    reply,
                } => self.start_request(packet_type, payload, reply).await,
                ClientCmd::Upload {
                    name,
                    payload,
                    reply,
                } => self.start_upload(name, payload, reply).await,
                ClientCmd::Download { name, reply } => self.start_download(name, reply).await,
                ClientCmd::Datagram(packet) => self.handle_packet(packet).await,
                ClientCmd::Tick => self.on_tick(Instant::now()).await,
                ClientCmd::PendingCount(reply) => {
                    let _ = reply.send(self.pending.len());
                }
                ClientCmd::Stop(done) => {
                    self.close();
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        self.socket.send_to(&packet.to_bytes(), self.server_addr).await?;
        Ok(())
    }

    async fn send_control(&self, id: FragmentId, packet_type: PacketType) {
        if let Err(e) = self.send(&Packet::new(id, packet_type, Bytes::new())).await {
            warn!("{} 전송 실패 (id={}): {}", packet_type, id, e);
        }
    }

    /// 요청 전송 후 대기 테이블 등록
    async fn send_request(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
        continuation: Continuation,
    ) -> Result<u32> {
        let id = self.ids.next_id();
        self.send(&Packet::new(id, packet_type, payload)).await?;
        self.pending.insert(id, packet_type, Instant::now(), continuation);
        debug!("요청 전송: {} id={}", packet_type, id);
        Ok(id)
    }

    async fn start_request(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
        reply: oneshot::Sender<Result<Packet>>,
    ) {
        let id = self.ids.next_id();
        match self.send(&Packet::new(id, packet_type, payload)).await {
            Ok(()) => {
                debug!("요청 전송: {} id={}", packet_type, id);
                self.pending
                    .insert(id, packet_type, Instant::now(), Continuation::Reply(reply));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn start_upload(
        &mut self,
        name: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<UploadReceipt>>,
    ) {
        if self.active.is_some() {
            let _ = reply.send(Err(Error::TransferInProgress));
            return;
        }

        let fragments = fragment(&payload, PacketType::PutData, 1);
        let count = fragments.len() as u32;
        let request = Bytes::from(format!("{} {}", name, count));

        let request_id = match self
            .send_request(PacketType::Put, request, Continuation::UploadGrant)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        info!(
            "업로드 요청: {} ({} bytes, {} 프래그먼트)",
            name,
            payload.len(),
            count
        );

        let now = Instant::now();
        self.active = Some(ActiveTransfer::Upload(UploadState {
            name,
            request_id,
            acked: vec![false; fragments.len()],
            sent: vec![false; fragments.len()],
            fragments,
            queue: VecDeque::new(),
            phase: UploadPhase::AwaitingGrant,
            next_send_at: now,
            deadline: now,
            retries: 0,
            payload_len: payload.len() as u64,
            crc32: crc32fast::hash(&payload),
            stats: TransferStats::new(count, payload.len() as u64),
            reply,
        }));
    }

    async fn start_download(&mut self, name: String, reply: oneshot::Sender<Result<Bytes>>) {
        if self.active.is_some() {
            let _ = reply.send(Err(Error::TransferInProgress));
            return;
        }

        let request = Bytes::from(name.clone());
        let request_id = match self
            .send_request(PacketType::Get, request, Continuation::DownloadGrant)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        info!("다운로드 요청: {}", name);
        self.active = Some(ActiveTransfer::Download(DownloadState {
            name,
            request_id,
            reassembly: None,
            last_activity: Instant::now(),
            retries: 0,
            stats: TransferStats::default(),
            reply,
        }));
    }

    fn take_upload(&mut self) -> Option<UploadState> {
        match self.active.take() {
            Some(ActiveTransfer::Upload(state)) => Some(state),
            other => {
                self.active = other;
                None
            }
        }
    }

    fn take_download(&mut self) -> Option<DownloadState> {
        match self.active.take() {
            Some(ActiveTransfer::Download(state)) => Some(state),
            other => {
                self.active = other;
                None
            }
        }
    }

    fn has_upload(&self) -> bool {
        matches!(self.active, Some(ActiveTransfer::Upload(_)))
    }

    fn has_download(&self) -> bool {
        matches!(self.active, Some(ActiveTransfer::Download(_)))
    }

    /// 수신 패킷 라우팅
    async fn handle_packet(&mut self, packet: Packet) {
        debug!("수신 {} id={} len={}", packet.packet_type, packet.id, packet.payload.len());

        match packet.packet_type {
            PacketType::GetData if self.has_download() => {
                self.on_download_fragment(packet).await;
                return;
            }
            PacketType::Ack | PacketType::Nack if self.has_upload() => {
                self.on_upload_feedback(&packet);
                return;
            }
            PacketType::PutResponse if packet.id == 0 && self.has_upload() => {
                self.on_upload_terminal(&packet);
                return;
            }
            PacketType::Error if packet.id == 0 => {
                self.on_unsolicited_error(&packet);
                return;
            }
            _ => {}
        }

        match self.pending.take(packet.id) {
            Some(request) if request.accepts(packet.packet_type) => match request.continuation {
                Continuation::Reply(reply) => {
                    let _ = reply.send(Ok(packet));
                }
                Continuation::UploadGrant => self.on_upload_grant(&packet),
                Continuation::DownloadGrant => self.on_download_grant(&packet),
            },
            Some(request) => {
                debug!(
                    "응답 타입 불일치 ({} 요청에 {}), 폐기",
                    request.kind, packet.packet_type
                );
                self.pending.restore(packet.id, request);
            }
            None => {
                debug!("대응 요청 없음, 폐기: {} id={}", packet.packet_type, packet.id);
            }
        }
    }

    fn on_unsolicited_error(&mut self, packet: &Packet) {
        let err = remote_error(packet);
        match self.take_upload() {
            Some(state) if state.phase != UploadPhase::AwaitingGrant => self.fail_upload(state, err),
            other => {
                if let Some(state) = other {
                    self.active = Some(ActiveTransfer::Upload(state));
                }
                warn!("서버 에러: {}", err);
                self.emit(ClientEvent::Error {
                    message: err.to_string(),
                });
            }
        }
    }

    fn on_upload_grant(&mut self, packet: &Packet) {
        let Some(mut state) = self.take_upload() else {
            return;
        };

        let transfer_id = match response_detail(packet) {
            Ok(detail) => detail,
            Err(e) => {
                self.fail_upload(state, e);
                return;
            }
        };

        info!("업로드 허가: {} ({})", state.name, transfer_id.trim());
        let now = Instant::now();
        state.queue = (0..state.fragments.len()).collect();
        state.next_send_at = now;
        if state.queue.is_empty() {
            state.phase = UploadPhase::AwaitingCompletion;
            state.deadline = now + self.config.request_timeout();
        } else {
            state.phase = UploadPhase::Sending;
        }
        self.active = Some(ActiveTransfer::Upload(state));
    }

    fn on_upload_feedback(&mut self, packet: &Packet) {
        let Some(mut state) = self.take_upload() else {
            return;
        };

        if state.phase != UploadPhase::AwaitingGrant {
            if let Some(idx) = state.index(packet.id) {
                match packet.packet_type {
                    PacketType::Ack => {
                        if !state.acked[idx] {
                            state.acked[idx] = true;
                            state.retries = 0;
                        }
                    }
                    PacketType::Nack => {
                        state.stats.total_nacks += 1;
                        if !state.acked[idx] && !state.queue.contains(&idx) {
                            debug!("NACK 수신, 재전송 예약: fragment={}", packet.id);
                            state.queue.push_back(idx);
                            if state.phase == UploadPhase::AwaitingCompletion {
                                state.phase = UploadPhase::Sending;
                                state.next_send_at = Instant::now();
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.active = Some(ActiveTransfer::Upload(state));
    }

    /// 서버의 저장 완료 응답 (id 0)
    fn on_upload_terminal(&mut self, packet: &Packet) {
        let Some(state) = self.take_upload() else {
            return;
        };
        if state.phase == UploadPhase::AwaitingGrant {
            self.pending.take(state.request_id);
        }

        let result = response_detail(packet).and_then(|detail| state.verify_receipt(&detail));
        match result {
            Ok(receipt) => {
                info!(
                    "업로드 완료: {} ({} bytes, crc32={:08x}) | {}",
                    receipt.name,
                    receipt.bytes,
                    receipt.crc32,
                    state.stats.summary()
                );
                self.emit(ClientEvent::UploadComplete {
                    name: receipt.name.clone(),
                    bytes: receipt.bytes,
                });
                let _ = state.reply.send(Ok(receipt));
            }
            Err(e) => self.fail_upload(state, e),
        }
    }

    fn on_download_grant(&mut self, packet: &Packet) {
        let Some(mut state) = self.take_download() else {
            return;
        };

        let count = response_detail(packet).and_then(|detail| {
            detail
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::Format(format!("잘못된 프래그먼트 수: {:?}", detail)))
        });
        let count = match count {
            Ok(count) if count > self.config.max_fragments => Err(Error::Format(format!(
                "프래그먼트 수 초과: {} (최대 {})",
                count, self.config.max_fragments
            ))),
            other => other,
        };
        let count = match count {
            Ok(count) => count,
            Err(e) => {
                self.fail_download(state, e);
                return;
            }
        };

        info!("다운로드 시작: {} ({} 프래그먼트)", state.name, count);
        state.reassembly = Some(Reassembly::new(1, count));
        state.stats = TransferStats::new(count, 0);
        state.last_activity = Instant::now();
        self.emit(ClientEvent::DownloadStarted {
            name: state.name.clone(),
            expected_fragments: count,
        });

        if count == 0 {
            self.finish_download(state);
        } else {
            self.active = Some(ActiveTransfer::Download(state));
        }
    }

    async fn on_download_fragment(&mut self, packet: Packet) {
        let Some(mut state) = self.take_download() else {
            return;
        };
        let Some(reassembly) = state.reassembly.as_mut() else {
            debug!("GET 응답 전 GET_DATA 폐기: id={}", packet.id);
            self.active = Some(ActiveTransfer::Download(state));
            return;
        };

        let id = packet.id;
        match Fragment::from_packet(packet) {
            Err(e) => {
                warn!("손상된 프래그먼트 {}: {}", id, e);
                state.stats.corrupt_fragments += 1;
                state.stats.total_nacks += 1;
                self.send_control(id, PacketType::Nack).await;
            }
            Ok(fragment) => match reassembly.insert(&fragment) {
                Ok(Inserted::New) => {
                    state.stats.record_fragment(fragment.data.len());
                    state.stats.total_bytes += fragment.data.len() as u64;
                    state.last_activity = Instant::now();
                    state.retries = 0;
                    self.send_control(id, PacketType::Ack).await;
                    self.emit(ClientEvent::DownloadProgress {
                        name: state.name.clone(),
                        received: reassembly.received_count(),
                        total: reassembly.expected(),
                        percent: state.stats.progress_percent(),
                    });
                }
                Ok(Inserted::Duplicate) => {
                    state.stats.duplicate_fragments += 1;
                    self.send_control(id, PacketType::Ack).await;
                }
                Err(e) => debug!("프래그먼트 폐기: {}", e),
            },
        }

        if reassembly.is_complete() {
            self.finish_download(state);
        } else {
            self.active = Some(ActiveTransfer::Download(state));
        }
    }

    fn finish_download(&mut self, mut state: DownloadState) {
        let reassembly = state
            .reassembly
            .take()
            .unwrap_or_else(|| Reassembly::new(1, 0));

        match reassembly.finish() {
            Ok(data) => {
                info!(
                    "다운로드 완료: {} ({} bytes) | {}",
                    state.name,
                    data.len(),
                    state.stats.summary()
                );
                self.emit(ClientEvent::DownloadComplete {
                    name: state.name.clone(),
                    bytes: data.len() as u64,
                });
                let _ = state.reply.send(Ok(data));
            }
            Err(e) => self.fail_download(state, e),
        }
    }

    fn fail_upload(&mut self, state: UploadState, err: Error) {
        if state.phase == UploadPhase::AwaitingGrant {
            self.pending.take(state.request_id);
        }
        warn!("업로드 실패: {}: {}", state.name, err);
        self.emit(ClientEvent::Error {
            message: format!("upload {}: {}", state.name, err),
        });
        let _ = state.reply.send(Err(err));
    }

    fn fail_download(&mut self, state: DownloadState, err: Error) {
        if state.reassembly.is_none() {
            self.pending.take(state.request_id);
        }
        warn!("다운로드 실패: {}: {}", state.name, err);
        self.emit(ClientEvent::Error {
            message: format!("download {}: {}", state.name, err),
        });
        let _ = state.reply.send(Err(err));
    }

    /// 타임아웃 만료, 업로드 전송 간격, 재전송 라운드
    async fn on_tick(&mut self, now: Instant) {
        for (id, request) in self.pending.expire(now) {
            warn!("요청 타임아웃: {} id={}", request.kind, id);
            let err = Error::Timeout { request_id: id };
            match request.continuation {
                Continuation::Reply(reply) => {
                    let _ = reply.send(Err(err));
                }
                Continuation::UploadGrant => {
                    if let Some(state) = self.take_upload() {
                        self.fail_upload(state, err);
                    }
                }
                Continuation::DownloadGrant => {
                    if let Some(state) = self.take_download() {
                        self.fail_download(state, err);
                    }
                }
            }
        }

        match self.active.take() {
            Some(ActiveTransfer::Upload(state)) => self.tick_upload(state, now).await,
            Some(ActiveTransfer::Download(state)) => self.tick_download(state, now).await,
            None => {}
        }
    }

    async fn tick_upload(&mut self, mut state: UploadState, now: Instant) {
        match state.phase {
            UploadPhase::AwaitingGrant => {}
            UploadPhase::Sending => {
                if now >= state.next_send_at {
                    if let Some(idx) = state.queue.pop_front() {
                        let packet = state.fragments[idx].to_packet();
                        if let Err(e) = self.send(&packet).await {
                            warn!("프래그먼트 {} 전송 실패: {}", packet.id, e);
                        }

                        if state.sent[idx] {
                            state.stats.retransmitted_fragments += 1;
                        } else {
                            state.sent[idx] = true;
                            state.stats.record_fragment(packet.payload.len());
                            self.emit(ClientEvent::UploadProgress {
                                name: state.name.clone(),
                                sent: state.stats.completed_fragments,
                                total: state.stats.total_fragments,
                                percent: state.stats.progress_percent(),
                            });
                        }
                        state.next_send_at = now + self.config.fragment_interval();
                    }

                    if state.queue.is_empty() {
                        state.phase = UploadPhase::AwaitingCompletion;
                        state.deadline = now + self.config.request_timeout();
                    }
                }
            }
            UploadPhase::AwaitingCompletion => {
                if now >= state.deadline {
                    if state.retries >= self.config.max_retries {
                        let request_id = state.request_id;
                        self.fail_upload(state, Error::Timeout { request_id });
                        return;
                    }

                    state.retries += 1;
                    state.stats.retry_rounds += 1;
                    let requeued = state.requeue_unacked();
                    warn!(
                        "업로드 완료 응답 없음, 재전송 라운드 {}/{}: {} 프래그먼트",
                        state.retries, self.config.max_retries, requeued
                    );

                    if requeued > 0 {
                        state.phase = UploadPhase::Sending;
                        state.next_send_at = now;
                    } else if let Some(last) = state.fragments.len().checked_sub(1) {
                        // 모두 ACK됨: 종료 응답만 유실, 서버가 다시 보내도록 마지막 조각 재전송
                        debug!("종료 응답 재요청: fragment={}", state.fragments[last].id);
                        state.queue.push_back(last);
                        state.phase = UploadPhase::Sending;
                        state.next_send_at = now;
                    } else {
                        // 빈 파일은 PUT부터 다시
                        let request = Bytes::from(format!("{} 0", state.name));
                        match self
                            .send_request(PacketType::Put, request, Continuation::UploadGrant)
                            .await
                        {
                            Ok(id) => {
                                state.request_id = id;
                                state.phase = UploadPhase::AwaitingGrant;
                            }
                            Err(e) => {
                                self.fail_upload(state, e);
                                return;
                            }
                        }
                    }
                }
            }
        }

        self.active = Some(ActiveTransfer::Upload(state));
    }

    async fn tick_download(&mut self, mut state: DownloadState, now: Instant) {
        let timeout = self.config.request_timeout();
        let stalled = state
            .reassembly
            .as_ref()
            .filter(|_| now.saturating_duration_since(state.last_activity) >= timeout)
            .map(Reassembly::missing_ids);

        if let Some(missing) = stalled {
            if state.retries >= self.config.max_retries {
                self.fail_download(state, Error::FragmentGap { missing });
                return;
            }

            state.retries += 1;
            state.stats.retry_rounds += 1;
            state.stats.total_nacks += missing.len() as u64;
            warn!(
                "다운로드 정체, NACK 라운드 {}/{}: {} 프래그먼트 누락",
                state.retries,
                self.config.max_retries,
                missing.len()
            );
            for id in missing {
                self.send_control(id, PacketType::Nack).await;
            }
            state.last_activity = now;
        }

        self.active = Some(ActiveTransfer::Download(state));
    }

    /// 연결 종료: 대기 중인 요청과 전송을 모두 실패 처리
    fn close(&mut self) {
        for (_, request) in self.pending.drain() {
            if let Continuation::Reply(reply) = request.continuation {
                let _ = reply.send(Err(Error::NotConnected));
            }
        }
        match self.active.take() {
            Some(ActiveTransfer::Upload(state)) => {
                let _ = state.reply.send(Err(Error::NotConnected));
            }
            Some(ActiveTransfer::Download(state)) => {
                let _ = state.reply.send(Err(Error::NotConnected));
            }
            None => {}
        }
    }
}

/// 수신 태스크: 서버 주소에서 온 데이터그램만 디코딩해서 전달
async fn recv_loop(
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    cmd_tx: mpsc::Sender<ClientCmd>,
    events: mpsc::UnboundedSender<ClientEvent>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size.max(PACKET_SIZE)];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from != server_addr {
                    debug!("서버가 아닌 주소에서 수신, 폐기: {}", from);
                    continue;
                }
                match Packet::from_bytes(&buf[..len]) {
                    Ok(packet) => {
                        if cmd_tx.send(ClientCmd::Datagram(packet)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("패킷 디코딩 실패 ({} bytes): {}", len, e),
                }
            }
            Err(e) => {
                warn!("수신 에러: {}", e);
                let _ = events.send(ClientEvent::Error {
                    message: e.to_string(),
                });
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// DFTP 클라이언트 핸들
pub struct Client {
    cmd_tx: mpsc::Sender<ClientCmd>,
    state: Arc<RwLock<SessionState>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// 소켓을 열고 내부 태스크 시작 (네트워크 왕복 없음)
    pub async fn connect(server_addr: SocketAddr, config: Config) -> Result<(Self, EventReceiver)> {
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<ClientCmd>(1000);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!("DFTP Client started on {}, server: {}", local_addr, server_addr);

        // 수신 태스크
        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            server_addr,
            cmd_tx.clone(),
            events_tx.clone(),
            config.recv_buffer_size,
        ));

        // 타이머 태스크 (전송 간격 + 타임아웃 검사)
        let tick = config
            .fragment_interval()
            .min(Duration::from_millis(10))
            .max(Duration::from_millis(1));
        let cmd_tx_tick = cmd_tx.clone();
        let tick_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(mpsc::error::TrySendError::Closed(_)) = cmd_tx_tick.try_send(ClientCmd::Tick) {
                    break;
                }
            }
        });

        // 메인 처리 태스크
        let inner = ClientInner::new(config, socket, server_addr, events_tx.clone());
        let main_task = tokio::spawn(inner.run(cmd_rx));

        let _ = events_tx.send(ClientEvent::Connected {
            server: server_addr,
        });

        let client = Self {
            cmd_tx,
            state: Arc::new(RwLock::new(SessionState::default())),
            events: events_tx,
            server_addr,
            local_addr,
            tasks: vec![recv_task, tick_task, main_task],
        };
        Ok((client, events_rx))
    }

    /// 호스트 이름으로 연결
    pub async fn connect_to(host: &str, port: u16, config: Config) -> Result<(Self, EventReceiver)> {
        let server_addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::NotFound(format!("{}:{}", host, port)))?;
        Self::connect(server_addr, config).await
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().authenticated
    }

    pub fn current_user(&self) -> Option<String> {
        self.state.read().username.clone()
    }

    async fn command<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ClientCmd,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 요청 하나를 보내고 응답 패킷을 기다림 (ERROR 패킷은 에러로)
    async fn request(&self, packet_type: PacketType, payload: impl Into<Bytes>) -> Result<Packet> {
        let payload = payload.into();
        let packet = self
            .command(|reply| ClientCmd::Request {
                packet_type,
                payload,
                reply,
            })
            .await?;

        if packet.packet_type == PacketType::Error {
            return Err(remote_error(&packet));
        }
        Ok(packet)
    }

    fn require_auth(&self) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(Error::NotAuthenticated)
        }
    }

    /// 로그인
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() || username.contains(' ') || password.contains(' ') {
            return Err(Error::Format("사용자 이름/비밀번호에 공백 불가".into()));
        }

        let packet = self
            .request(PacketType::Login, format!("{} {}", username, password))
            .await?;
        let text = packet.payload_str();

        if text.trim() != Status::Success.as_str() {
            info!("인증 실패: {} ({})", username, text.trim());
            return Err(Error::Auth(AuthFailure::from_response(&text)));
        }

        {
            let mut state = self.state.write();
            state.authenticated = true;
            state.username = Some(username.to_string());
        }
        info!("인증 성공: {}", username);
        let _ = self.events.send(ClientEvent::Authenticated {
            username: username.to_string(),
        });
        Ok(())
    }

    /// 현재 디렉토리 목록
    pub async fn list_directory(&self) -> Result<Vec<RemoteEntry>> {
        self.require_auth()?;
        let packet = self.request(PacketType::Ls, Bytes::new()).await?;
        let listing = response_detail(&packet)?;

        listing
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(RemoteEntry::parse)
            .collect()
    }

    /// 디렉토리 이동, 새 가상 경로 반환
    pub async fn change_directory(&self, name: &str) -> Result<String> {
        self.require_auth()?;
        let packet = self.request(PacketType::Cd, name.to_string()).await?;
        Ok(response_detail(&packet)?.trim().to_string())
    }

    pub async fn make_directory(&self, name: &str) -> Result<()> {
        self.require_auth()?;
        let packet = self.request(PacketType::Mkdir, name.to_string()).await?;
        response_detail(&packet).map(|_| ())
    }

    pub async fn remove_directory(&self, name: &str) -> Result<()> {
        self.require_auth()?;
        let packet = self.request(PacketType::Rmdir, name.to_string()).await?;
        response_detail(&packet).map(|_| ())
    }

    /// 메모리의 데이터를 `remote_name`으로 업로드
    ///
    /// 서버의 저장 완료 응답(크기, CRC32)을 확인한 뒤에 반환한다.
    pub async fn upload(&self, payload: impl Into<Bytes>, remote_name: &str) -> Result<UploadReceipt> {
        self.require_auth()?;
        let name = remote_name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Format("빈 파일 이름".into()));
        }

        let payload = payload.into();
        self.command(|reply| ClientCmd::Upload {
            name,
            payload,
            reply,
        })
        .await
    }

    /// 로컬 파일 업로드 (원격 이름 생략 시 파일 이름 사용)
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        remote_name: Option<&str>,
    ) -> Result<UploadReceipt> {
        let path = path.as_ref();
        let name = match remote_name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::Format(format!("파일 이름 없음: {}", path.display())))?,
        };

        let data = tokio::fs::read(path).await?;
        self.upload(data, &name).await
    }

    /// 원격 파일 다운로드
    pub async fn download(&self, remote_name: &str) -> Result<Bytes> {
        self.require_auth()?;
        let name = remote_name.trim().to_string();
        self.command(|reply| ClientCmd::Download { name, reply }).await
    }

    /// 원격 파일을 로컬 경로에 저장, 바이트 수 반환
    pub async fn download_to(&self, remote_name: &str, path: impl AsRef<Path>) -> Result<u64> {
        let data = self.download(remote_name).await?;
        tokio::fs::write(path.as_ref(), &data).await?;
        Ok(data.len() as u64)
    }

    /// 응답 대기 중인 요청 수
    pub async fn pending_requests(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCmd::PendingCount(tx))
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::ChannelError)
    }

    /// 연결 종료
    pub async fn disconnect(self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ClientCmd::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }

        {
            let mut state = self.state.write();
            state.authenticated = false;
            state.username = None;
        }
        info!("DFTP Client disconnected from {}", self.server_addr);
        let _ = self.events.send(ClientEvent::Disconnected);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
