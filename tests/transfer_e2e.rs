use anyhow::Result;
use ftlink::config::{ClientConfig, ServerConfig};
use ftlink::error::FtError;
use ftlink::log::{TransferLog, TransferStatus};
use ftlink::net_async::client::{self, CommandOutcome};
use ftlink::net_async::server::{self, ServerContext};
use ftlink::payload::parse_listing;
use ftlink::protocol::{payload_kind, CommandRequest, UnrecognizedRequest};
use ftlink::protocol_core::build_data_header;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

fn write_file(path: &Path, size: usize) -> Result<Vec<u8>> {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(path, &data)?;
    Ok(data)
}

fn free_port() -> Result<u16> {
    let sock = std::net::TcpListener::bind("127.0.0.1:0")?;
    let p = sock.local_addr()?.port();
    drop(sock);
    Ok(p)
}

fn server_config(root: &Path) -> ServerConfig {
    let mut cfg = ServerConfig::default();
    cfg.root = root.to_path_buf();
    cfg.data_bind_host = "127.0.0.1".to_string();
    cfg.accept_timeout_ms = 3_000;
    cfg.io_timeout_ms = 5_000;
    cfg
}

fn client_config(download_dir: &Path) -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.download_dir = download_dir.to_path_buf();
    cfg.connect_timeout_ms = 3_000;
    cfg.ready_timeout_ms = 5_000;
    cfg.io_timeout_ms = 5_000;
    cfg
}

// The control listener is bound before the accept loop starts, so clients
// may connect as soon as this returns
async fn start_server(ctx: ServerContext) -> Result<(u16, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let ctx = Arc::new(ctx);
    let task = tokio::spawn(async move {
        let _ = server::serve_listener(listener, ctx).await;
    });
    Ok((port, task))
}

async fn retrieve(port: u16, data_port: u16, name: &str, cfg: &ClientConfig) -> ftlink::error::Result<CommandOutcome> {
    let mut sink = Vec::new();
    client::run_command("127.0.0.1", port, &CommandRequest::retrieve(data_port, name), cfg, &mut sink).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retrieve_round_trip_is_byte_exact() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    // Several transfer buffers plus a ragged tail
    let data = write_file(&srv.path().join("data.bin"), 1_100_000)?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;

    let mut console = Vec::new();
    let request = CommandRequest::retrieve(free_port()?, "data.bin");
    let outcome = client::run_command("127.0.0.1", port, &request, &client_config(cli.path()), &mut console).await?;
    assert_eq!(console, b"Receiving data.bin from server, please wait...\n");
    let saved = match outcome {
        CommandOutcome::File(saved) => saved,
        other => panic!("expected a file, got {:?}", other),
    };
    assert!(!saved.renamed);
    assert_eq!(saved.path, cli.path().join("data.bin"));
    assert_eq!(std::fs::read(&saved.path)?, data);
    assert_eq!(saved.summary.bytes, data.len() as u64);
    assert_eq!(saved.summary.digest, blake3::hash(&data).to_hex().to_string());

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retrieve_empty_file() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    std::fs::write(srv.path().join("empty"), b"")?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;

    retrieve(port, free_port()?, "empty", &client_config(cli.path())).await?;
    assert_eq!(std::fs::read(cli.path().join("empty"))?.len(), 0);

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collision_saves_copy_and_keeps_original() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    std::fs::write(srv.path().join("report.txt"), b"from the server")?;
    std::fs::write(cli.path().join("report.txt"), b"local original")?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;

    let outcome = retrieve(port, free_port()?, "report.txt", &client_config(cli.path())).await?;
    let CommandOutcome::File(saved) = outcome else {
        panic!("expected a file");
    };
    assert!(saved.renamed);
    assert_eq!(saved.path, cli.path().join("report.txt-COPY"));
    assert_eq!(std::fs::read(cli.path().join("report.txt"))?, b"local original");
    assert_eq!(std::fs::read(cli.path().join("report.txt-COPY"))?, b"from the server");

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_returns_exact_sorted_entries() -> Result<()> {
    let srv = tempfile::tempdir()?;
    std::fs::write(srv.path().join("b.txt"), b"b")?;
    std::fs::write(srv.path().join("a.txt"), b"a")?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;

    let mut out = Vec::new();
    let cfg = client_config(srv.path());
    let outcome = client::run_command("127.0.0.1", port, &CommandRequest::list(free_port()?), &cfg, &mut out).await?;
    assert!(matches!(outcome, CommandOutcome::Listing(ref s) if s.bytes == out.len() as u64));
    assert_eq!(parse_listing(&out), vec!["a.txt".to_string(), "b.txt".to_string()]);

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_of_empty_directory_is_empty() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;

    let mut out = Vec::new();
    let cfg = client_config(srv.path());
    let outcome = client::run_command("127.0.0.1", port, &CommandRequest::list(free_port()?), &cfg, &mut out).await?;
    assert!(matches!(outcome, CommandOutcome::Listing(ref s) if s.bytes == 0));
    assert!(out.is_empty());

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_file_is_rejected_without_data_connection() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;

    // Hold the data port ourselves: any client connect attempt would land here
    let data_watch = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let data_port = data_watch.local_addr()?.port();

    let err = retrieve(port, data_port, "missing.txt", &client_config(cli.path()))
        .await
        .unwrap_err();
    match err {
        FtError::InvalidCommand(msg) => assert_eq!(msg, "Error: file not found: missing.txt"),
        other => panic!("expected InvalidCommand, got {:?}", other),
    }
    assert!(
        timeout(Duration::from_millis(300), data_watch.accept()).await.is_err(),
        "client must not attempt a data connection after a rejection"
    );
    assert_eq!(std::fs::read_dir(cli.path())?.count(), 0);

    task.abort();
    Ok(())
}

async fn raw_exchange(port: u16, request: &str) -> Result<Vec<String>> {
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    let mut control = BufReader::new(stream);
    control.get_mut().write_all(request.as_bytes()).await?;
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), control.read_line(&mut line)).await??;
        if n == 0 {
            break;
        }
        lines.push(line.trim_end().to_string());
    }
    Ok(lines)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_rejections_never_send_ready() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;
    let data_port = free_port()?;

    let missing = raw_exchange(port, &format!("-g {} missing.txt\n", data_port)).await?;
    assert_eq!(missing, vec!["Error: file not found: missing.txt".to_string()]);

    let unknown = raw_exchange(port, &format!("-x {} a.txt\n", data_port)).await?;
    assert_eq!(unknown.len(), 1);
    assert!(unknown[0].contains("invalid command \"-x\""));

    let spaced = raw_exchange(port, &format!("-g {} my file.txt\n", data_port)).await?;
    assert_eq!(spaced.len(), 1);
    assert!(spaced[0].contains("whitespace"));

    let traversal = raw_exchange(port, &format!("-g {} ../secret\n", data_port)).await?;
    assert_eq!(traversal.len(), 1);
    assert!(traversal[0].starts_with("Error:"));

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_data_port_is_rejected() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let data_port = occupied.local_addr()?.port();

    let mut out = Vec::new();
    let cfg = client_config(srv.path());
    let err = client::run_command("127.0.0.1", port, &CommandRequest::list(data_port), &cfg, &mut out)
        .await
        .unwrap_err();
    match err {
        FtError::InvalidCommand(msg) => assert!(msg.contains("cannot open data port")),
        other => panic!("expected InvalidCommand, got {:?}", other),
    }

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_times_out_when_data_channel_never_connects() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let mut cfg = server_config(srv.path());
    cfg.accept_timeout_ms = 300;
    let (port, task) = start_server(ServerContext::new(cfg)).await?;

    let lines = raw_exchange(port, &format!("-l {} -\n", free_port()?)).await?;
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "READY");
    assert!(lines[1].contains("not established within 300 ms"));

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rendezvous_is_deterministic_over_many_commands() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    std::fs::write(srv.path().join("a.txt"), b"alpha")?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;
    let cfg = client_config(cli.path());

    // Same data port every time: each command must bind it afresh
    let data_port = free_port()?;
    for i in 0..100 {
        let mut out = Vec::new();
        let res = client::run_command("127.0.0.1", port, &CommandRequest::list(data_port), &cfg, &mut out).await;
        match res {
            Ok(CommandOutcome::Listing(_)) => assert_eq!(out, b"a.txt\n"),
            Ok(other) => panic!("iteration {}: unexpected outcome {:?}", i, other),
            Err(e) => panic!("iteration {}: {}", i, e),
        }
    }

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transfer_log_records_completed_and_rejected_commands() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    let logs = tempfile::tempdir()?;
    let data = write_file(&srv.path().join("notes.md"), 4096)?;
    let log_path = logs.path().join("transfers.jsonl");
    let ctx = ServerContext::new(server_config(srv.path())).with_transfer_log(TransferLog::new(&log_path));
    let (port, task) = start_server(ctx).await?;
    let cfg = client_config(cli.path());

    retrieve(port, free_port()?, "notes.md", &cfg).await?;
    assert!(retrieve(port, free_port()?, "absent.md", &cfg).await.is_err());

    // The server writes its record after closing the data channel
    let reader = TransferLog::new(&log_path);
    let mut entries = Vec::new();
    for _ in 0..100u32 {
        entries = reader.read_log()?;
        if entries.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(entries.len(), 2);

    let done = entries
        .iter()
        .find(|e| e.status == TransferStatus::Completed)
        .expect("completed entry");
    assert_eq!(done.file_name.as_deref(), Some("notes.md"));
    assert_eq!(done.bytes_transferred, data.len() as u64);
    assert_eq!(done.blake3.as_deref(), Some(blake3::hash(&data).to_hex().as_str()));

    let rejected = entries
        .iter()
        .find(|e| e.status == TransferStatus::Rejected)
        .expect("rejected entry");
    assert_eq!(rejected.error.as_deref(), Some("Error: file not found: absent.md"));

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_server_is_connection_error() -> Result<()> {
    let cli = tempfile::tempdir()?;
    let port = free_port()?;
    let err = client::run_command(
        "127.0.0.1",
        port,
        &CommandRequest::list(free_port()?),
        &client_config(cli.path()),
        &mut Vec::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, FtError::Connection { .. }));
    assert_eq!(err.exit_code(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_flag_is_answered_by_the_server() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let (port, task) = start_server(ServerContext::new(server_config(srv.path()))).await?;

    let request = UnrecognizedRequest {
        flag: "-x".to_string(),
        data_port: free_port()?,
        file_name: Some("a.txt".to_string()),
    };
    let err = client::run_unrecognized("127.0.0.1", port, &request, &client_config(srv.path()))
        .await
        .unwrap_err();
    match err {
        FtError::InvalidCommand(msg) => assert!(msg.starts_with("Error: invalid command \"-x\"")),
        other => panic!("expected InvalidCommand, got {:?}", other),
    }

    task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_server_hits_ready_timeout() -> Result<()> {
    let cli = tempfile::tempdir()?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    // Accept and hold the connection without ever answering
    let silent = tokio::spawn(async move {
        let held = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(held);
    });

    let mut cfg = client_config(cli.path());
    cfg.ready_timeout_ms = 200;
    let err = client::run_command("127.0.0.1", port, &CommandRequest::list(free_port()?), &cfg, &mut Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FtError::DataChannelTimeout { stage: "readiness wait", ms: 200 }
    ));
    assert_eq!(err.exit_code(), 5);

    silent.abort();
    Ok(())
}

// Sends READY, VALID_COMMAND and the first `sent` bytes of a `len`-byte file,
// then stalls with both channels open
async fn stalling_server(len: u64, sent: usize) -> Result<(u16, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let task = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let mut control = BufReader::new(stream);
        let mut line = String::new();
        if control.read_line(&mut line).await.is_err() {
            return;
        }
        let Some(data_port) = line.split_whitespace().nth(1).and_then(|p| p.parse::<u16>().ok()) else {
            return;
        };
        let Ok(data_listener) = tokio::net::TcpListener::bind(("127.0.0.1", data_port)).await else {
            return;
        };
        let _ = control.get_mut().write_all(b"READY\n").await;
        let Ok((mut data, _)) = data_listener.accept().await else { return };
        let _ = control.get_mut().write_all(b"VALID_COMMAND\n").await;
        let _ = data.write_all(&build_data_header(payload_kind::FILE, len)).await;
        let _ = data.write_all(&vec![b'z'; sent]).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(data);
    });
    Ok((port, task))
}

async fn wait_for_partial_file(dir: &Path) {
    loop {
        let partial = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .any(|e| e.file_name().to_string_lossy().ends_with(".part"))
            })
            .unwrap_or(false);
        if partial {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_download_leaves_no_partial_file() -> Result<()> {
    let cli = tempfile::tempdir()?;
    let (port, task) = stalling_server(1000, 10).await?;
    let cfg = client_config(cli.path());

    let mut console = Vec::new();
    let request = CommandRequest::retrieve(free_port()?, "big.bin");
    let res = timeout(
        Duration::from_secs(5),
        client::until_cancelled(
            client::run_command("127.0.0.1", port, &request, &cfg, &mut console),
            wait_for_partial_file(cli.path()),
        ),
    )
    .await?;

    let err = res.unwrap_err();
    assert!(matches!(err, FtError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(std::fs::read_dir(cli.path())?.count(), 0);

    task.abort();
    Ok(())
}
