//! DFTP 클라이언트 - Datagram File Transfer Protocol
//!
//! 한 줄씩 명령을 읽어 서버에 요청하는 간단한 셸
//!
//! 사용법:
//!   cargo run --release --bin dftp-client -- [OPTIONS]
//!
//! 예시:
//!   # 접속 후 바로 로그인
//!   cargo run --release --bin dftp-client -- -s 127.0.0.1 -p 21000 --user alice --password alice123

use std::io::Write;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dftp::{Client, ClientEvent, Config, EntryKind, EventReceiver};

/// 클라이언트 설정
struct ClientArgs {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    config: Config,
}

impl Default for ClientArgs {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: dftp::DEFAULT_PORT,
            user: None,
            password: None,
            config: Config::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 옵션에 값이 필요합니다", flag))
}

fn parse_args() -> Result<ClientArgs, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ClientArgs::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--server" | "-s" => {
                parsed.host = value(&args, i, flag)?.to_string();
                i += 1;
            }
            "--port" | "-p" => {
                let raw = value(&args, i, flag)?;
                parsed.port = raw.parse().map_err(|_| format!("유효한 포트 필요: {}", raw))?;
                i += 1;
            }
            "--user" | "-u" => {
                parsed.user = Some(value(&args, i, flag)?.to_string());
                i += 1;
            }
            "--password" => {
                parsed.password = Some(value(&args, i, flag)?.to_string());
                i += 1;
            }
            "--timeout" => {
                let raw = value(&args, i, flag)?;
                parsed.config.request_timeout_ms =
                    raw.parse().map_err(|_| format!("유효한 숫자 필요: {}", raw))?;
                i += 1;
            }
            "--interval" => {
                let raw = value(&args, i, flag)?;
                parsed.config.fragment_interval_ms =
                    raw.parse().map_err(|_| format!("유효한 숫자 필요: {}", raw))?;
                i += 1;
            }
            "--lan" => {
                parsed.config = Config::lan();
            }
            "--unstable" => {
                parsed.config = Config::unstable_network();
            }
            "--help" | "-h" => {
                println!(
                    r#"DFTP Client - Datagram File Transfer Protocol 클라이언트

사용법:
  cargo run --release --bin dftp-client -- [OPTIONS]

옵션:
  -s, --server <HOST>       서버 호스트 (기본: 127.0.0.1)
  -p, --port <PORT>         서버 포트 (기본: 21000)
  -u, --user <NAME>         시작 시 로그인할 사용자
  --password <PASS>         로그인 비밀번호
  --timeout <MS>            요청 타임아웃 (기본: 5000)
  --interval <MS>           업로드 프래그먼트 간격 (기본: 10)
  --lan                     로컬 네트워크 프리셋 (짧은 타임아웃, 1ms 간격)
  --unstable                불안정 네트워크 프리셋
  -h, --help                이 도움말 출력

명령:
  login <user> <password>   로그인
  ls                        현재 디렉토리 목록
  cd <dir>                  디렉토리 이동 (.. 가능)
  mkdir <dir>               디렉토리 생성
  rmdir <dir>               빈 디렉토리 삭제
  put <local> [remote]      파일 업로드
  get <remote> [local]      파일 다운로드
  quit                      종료
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

/// 이벤트를 로그로 출력
async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connected { server } => info!("Connected to {}", server),
            ClientEvent::Disconnected => info!("Disconnected"),
            ClientEvent::Authenticated { username } => info!("Logged in as {}", username),
            ClientEvent::Error { message } => warn!("{}", message),
            ClientEvent::UploadProgress { name, sent, total, percent } => {
                debug!("업로드 {}: {}/{} ({}%)", name, sent, total, percent)
            }
            ClientEvent::UploadComplete { name, bytes } => {
                info!("Upload complete: {} ({} bytes)", name, bytes)
            }
            ClientEvent::DownloadStarted { name, expected_fragments } => {
                info!("Download started: {} ({} fragments)", name, expected_fragments)
            }
            ClientEvent::DownloadProgress { name, received, total, percent } => {
                debug!("다운로드 {}: {}/{} ({}%)", name, received, total, percent)
            }
            ClientEvent::DownloadComplete { name, bytes } => {
                info!("Download complete: {} ({} bytes)", name, bytes)
            }
        }
    }
}

/// 명령 한 줄 실행, `quit`이면 false
async fn run_command(client: &Client, line: &str) -> dftp::Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(true);
    };
    let rest: Vec<&str> = parts.collect();

    match (command, rest.as_slice()) {
        ("quit" | "exit", _) => return Ok(false),
        ("login", [user, password]) => {
            client.authenticate(user, password).await?;
        }
        ("ls", []) => {
            let entries = client.list_directory().await?;
            if entries.is_empty() {
                println!("(empty)");
            }
            for entry in entries {
                match entry.kind {
                    EntryKind::Dir => println!("  {}/", entry.name),
                    EntryKind::File => println!("  {:<40} {:>12}", entry.name, entry.size),
                }
            }
        }
        ("cd", [_, ..]) => {
            let cwd = client.change_directory(&rest.join(" ")).await?;
            println!("{}", cwd);
        }
        ("mkdir", [_, ..]) => client.make_directory(&rest.join(" ")).await?,
        ("rmdir", [_, ..]) => client.remove_directory(&rest.join(" ")).await?,
        ("put", [local]) => {
            let receipt = client.upload_file(local, None).await?;
            println!(
                "{}: {} bytes, {} fragments, crc32 {:08x}",
                receipt.name, receipt.bytes, receipt.fragments, receipt.crc32
            );
        }
        ("put", [local, remote @ ..]) => {
            let remote = remote.join(" ");
            let receipt = client.upload_file(local, Some(remote.as_str())).await?;
            println!("{}: {} bytes, {} fragments", receipt.name, receipt.bytes, receipt.fragments);
        }
        ("get", [remote]) => {
            let local = Path::new(remote)
                .file_name()
                .map(|n| n.to_owned())
                .unwrap_or_else(|| std::ffi::OsString::from("download.bin"));
            let bytes = client.download_to(remote, &local).await?;
            println!("{} bytes -> {}", bytes, Path::new(&local).display());
        }
        ("get", [remote, local]) => {
            let bytes = client.download_to(remote, local).await?;
            println!("{} bytes -> {}", bytes, local);
        }
        _ => println!("알 수 없는 명령: {} (도움말: --help)", line.trim()),
    }
    Ok(true)
}

fn prompt(client: &Client) {
    let user = client.current_user().unwrap_or_else(|| "-".to_string());
    print!("dftp[{}]> ", user);
    let _ = std::io::stdout().flush();
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

    info!("DFTP Client starting...");
    info!("Server: {}:{}", args.host, args.port);

    let (client, events) = Client::connect_to(&args.host, args.port, args.config).await?;
    tokio::spawn(log_events(events));

    if let (Some(user), Some(password)) = (&args.user, &args.password) {
        if let Err(e) = client.authenticate(user, password).await {
            warn!("로그인 실패: {}", e);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt(&client);
    while let Some(line) = lines.next_line().await? {
        match run_command(&client, &line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {}", e),
        }
        prompt(&client);
    }

    client.disconnect().await;
    Ok(())
}
