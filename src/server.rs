//! DFTP 서버 (소켓 루프)
//!
//! - 수신 루프: 데이터그램을 도착 순서대로 디스패처에 전달
//! - 송신 태스크: 우선순위 큐(제어 응답) 먼저, 그 다음 데이터 큐
//! - 주기 작업: 유휴 세션과 끊긴 전송 정리

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{Config, ServerConfig};
use crate::dispatcher::{Dispatcher, Outbound};
use crate::fragment::Fragment;
use crate::{Error, Result};

type Datagram = (Vec<u8>, SocketAddr);

/// 실행 중인 서버를 멈추는 핸들
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// DFTP 서버
pub struct Server {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    config: Config,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// 루트 준비 후 소켓 바인딩
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(&config)?);
        let socket = Arc::new(UdpSocket::bind(config.bind).await?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("DFTP Server bound on {}", socket.local_addr()?);
        info!("Registered users: {}", config.users.len());

        Ok(Self {
            socket,
            dispatcher,
            config: config.protocol,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// 다른 태스크에서 `run`을 멈출 때 사용
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// 수신 루프 실행 (shutdown까지)
    pub async fn run(&self) -> Result<()> {
        // ═══════════════════════════════════════════════════════════════
        // 송신 큐: 우선순위 큐 + 데이터 큐
        // ═══════════════════════════════════════════════════════════════
        let (priority_tx, priority_rx) = mpsc::channel::<Datagram>(1000);
        let (data_tx, data_rx) = mpsc::channel::<Datagram>(100_000);
        let send_task = tokio::spawn(send_loop(self.socket.clone(), priority_rx, data_rx));

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval());
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; self.config.recv_buffer_size.max(crate::PACKET_SIZE)];

        info!("DFTP Server listening on {}", self.local_addr()?);

        while !*shutdown_rx.borrow() {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            let outbound = self.dispatcher.dispatch(&buf[..len], addr).await;
                            self.enqueue(outbound, addr, &priority_tx, &data_tx).await?;
                        }
                        Err(e) => {
                            // ICMP 에러 등, 루프는 유지
                            warn!("수신 에러: {}", e);
                        }
                    }
                }
                _ = housekeeping.tick() => {
                    self.dispatcher.housekeeping(Instant::now());
                }
            }
        }

        info!("DFTP Server stopping");
        drop(priority_tx);
        drop(data_tx);
        send_task.abort();
        Ok(())
    }

    async fn enqueue(
        &self,
        outbound: Vec<Outbound>,
        addr: SocketAddr,
        priority_tx: &mpsc::Sender<Datagram>,
        data_tx: &mpsc::Sender<Datagram>,
    ) -> Result<()> {
        for item in outbound {
            match item {
                Outbound::Reply(packet) => {
                    debug!("송신 {} id={} to {}", packet.packet_type, packet.id, addr);
                    priority_tx
                        .send((packet.to_bytes(), addr))
                        .await
                        .map_err(|_| Error::ChannelError)?;
                }
                Outbound::Stream(fragments) => {
                    tokio::spawn(stream_fragments(
                        fragments,
                        addr,
                        data_tx.clone(),
                        self.config.fragment_interval(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// 송신 태스크: 우선순위 큐 먼저, 그 다음 데이터 큐
async fn send_loop(
    socket: Arc<UdpSocket>,
    mut priority_rx: mpsc::Receiver<Datagram>,
    mut data_rx: mpsc::Receiver<Datagram>,
) {
    loop {
        match priority_rx.try_recv() {
            Ok((bytes, addr)) => {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    warn!("송신 실패 ({}): {}", addr, e);
                }
                continue;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }

        let (bytes, addr) = tokio::select! {
            Some(item) = priority_rx.recv() => item,
            Some(item) = data_rx.recv() => item,
            else => break,
        };
        if let Err(e) = socket.send_to(&bytes, addr).await {
            warn!("송신 실패 ({}): {}", addr, e);
        }
    }
}

/// 다운로드 프래그먼트를 일정 간격으로 데이터 큐에 넣음
async fn stream_fragments(
    fragments: Vec<Fragment>,
    addr: SocketAddr,
    data_tx: mpsc::Sender<Datagram>,
    interval: Duration,
) {
    let total = fragments.len();
    for (idx, fragment) in fragments.iter().enumerate() {
        if idx > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        if data_tx.send((fragment.to_bytes(), addr)).await.is_err() {
            return;
        }
    }
    debug!("다운로드 스트림 전송 완료: {} 프래그먼트 to {}", total, addr);
}
