//! DFTP 서버 - Datagram File Transfer Protocol
//!
//! 서버 루트 디렉토리를 UDP로 공개하는 파일 서버
//! - 세션별 인증 + 가상 작업 디렉토리
//! - 프래그먼트 업로드/다운로드 + ACK/NACK 재전송
//!
//! 사용법:
//!   cargo run --release --bin dftp-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 포트(21000), 사용자 지정
//!   cargo run --release --bin dftp-server -- --root ./files --user alice:alice123
//!
//!   # TOML 설정 파일 + 바인드 주소 덮어쓰기
//!   cargo run --release --bin dftp-server -- -c dftp.toml -b 127.0.0.1:21001

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dftp::{Server, ServerConfig};

/// 커맨드라인 옵션 (설정 파일 값을 덮어씀)
#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    bind: Option<SocketAddr>,
    root: Option<PathBuf>,
    users: Vec<(String, String)>,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 옵션에 값이 필요합니다", flag))
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => {
                parsed.config_path = Some(PathBuf::from(value(&args, i, flag)?));
                i += 1;
            }
            "--bind" | "-b" => {
                let raw = value(&args, i, flag)?;
                parsed.bind = Some(raw.parse().map_err(|_| format!("유효한 주소 필요: {}", raw))?);
                i += 1;
            }
            "--root" | "-r" => {
                parsed.root = Some(PathBuf::from(value(&args, i, flag)?));
                i += 1;
            }
            "--user" | "-u" => {
                let raw = value(&args, i, flag)?;
                let (name, password) = raw
                    .split_once(':')
                    .ok_or_else(|| format!("NAME:PASSWORD 형식 필요: {}", raw))?;
                parsed.users.push((name.to_string(), password.to_string()));
                i += 1;
            }
            "--interval" => {
                let raw = value(&args, i, flag)?;
                parsed.interval_ms = Some(raw.parse().map_err(|_| format!("유효한 숫자 필요: {}", raw))?);
                i += 1;
            }
            "--timeout" => {
                let raw = value(&args, i, flag)?;
                parsed.timeout_ms = Some(raw.parse().map_err(|_| format!("유효한 숫자 필요: {}", raw))?);
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"DFTP Server - Datagram File Transfer Protocol 서버

서버 루트 디렉토리를 UDP로 공개하는 파일 서버
- 세션별 인증 + 가상 작업 디렉토리
- 992바이트 프래그먼트 업로드/다운로드, ACK/NACK 재전송

사용법:
  cargo run --release --bin dftp-server -- [OPTIONS]

옵션:
  -c, --config <PATH>       TOML 설정 파일
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:21000)
  -r, --root <DIR>          서버 루트 디렉토리 (기본: ./data/server-files)
  -u, --user <NAME:PASS>    사용자 추가 (여러 번 지정 가능)
  --interval <MS>           다운로드 프래그먼트 간격 (기본: 10)
  --timeout <MS>            요청 타임아웃 (기본: 5000)
  -h, --help                이 도움말 출력

로그 레벨은 RUST_LOG 환경변수로 지정 (기본: info)

예시:
  # 사용자 두 명으로 시작
  cargo run --release --bin dftp-server -- -r ./files -u alice:alice123 -u bob:bob123

  # 설정 파일 사용
  cargo run --release --bin dftp-server -- --config dftp.toml
"#
                );
                std::process::exit(0);
            }
            other => {
                warn!("알 수 없는 옵션 무시: {}", other);
            }
        }
        i += 1;
    }

    Ok(parsed)
}

fn build_config(args: Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config_path {
        Some(path) => {
            info!("Loading config: {:?}", path);
            ServerConfig::from_file(path)?
        }
        None => ServerConfig::default(),
    };

    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(root) = args.root {
        config.root = root;
    }
    for (name, password) in args.users {
        config.users.insert(name, password);
    }
    if let Some(ms) = args.interval_ms {
        config.protocol.fragment_interval_ms = ms;
    }
    if let Some(ms) = args.timeout_ms {
        config.protocol.request_timeout_ms = ms;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };
    let config = build_config(args)?;

    info!("DFTP Server starting...");
    info!("Root directory: {:?}", config.root);
    info!("Fragment interval: {} ms", config.protocol.fragment_interval_ms);
    info!("Request timeout: {} ms", config.protocol.request_timeout_ms);
    if config.users.is_empty() {
        warn!("등록된 사용자가 없습니다. 모든 로그인이 거부됩니다 (--user NAME:PASS)");
    }

    let server = Server::bind(config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    info!("DFTP Server stopped");
    Ok(())
}
