//! Async (Tokio) transport for ftlink: the control channel and the
//! data-channel rendezvous.
//!
//! Ordering for one command:
//! request → server validates → server listens on the data port → `READY`
//! → client connects → server accepts → `VALID_COMMAND` → payload →
//! half-close. The client never connects before the server is listening,
//! so there is no connect race to paper over.

use std::path::Path;
use std::time::Instant;

use tokio::io::{AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::error::{FtError, Result};
use crate::protocol::{Verdict, MAX_CONTROL_LINE, READY};
use crate::protocol_core::{read_line_bounded, write_all_timed};

/// Read the next control line, treating a closed connection as an error
async fn expect_line(
    control: &mut BufReader<TcpStream>,
    ms: u64,
    stage: &'static str,
) -> Result<String> {
    read_line_bounded(control, MAX_CONTROL_LINE, ms, stage)
        .await?
        .ok_or_else(|| FtError::Protocol(format!("control channel closed by peer ({})", stage)))
}

async fn send_line(
    control: &mut BufReader<TcpStream>,
    line: &str,
    ms: u64,
    stage: &'static str,
) -> Result<()> {
    write_all_timed(control.get_mut(), line.as_bytes(), ms, stage).await
}

pub mod server {
    use super::*;
    use std::io;
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpSocket};

    use crate::config::ServerConfig;
    use crate::log::{TransferLog, TransferLogEntry, TransferStatus};
    use crate::logger::{Logger, NoopLogger};
    use crate::payload::{self, PayloadSource, TransferSummary};
    use crate::protocol::CommandRequest;

    const DATA_BACKLOG: u32 = 1;

    /// Everything a connection handler needs, shared across tasks
    pub struct ServerContext {
        pub config: ServerConfig,
        pub logger: Arc<dyn Logger>,
        pub transfer_log: Option<TransferLog>,
    }

    impl ServerContext {
        pub fn new(config: ServerConfig) -> Self {
            Self {
                config,
                logger: Arc::new(NoopLogger),
                transfer_log: None,
            }
        }

        pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
            self.logger = logger;
            self
        }

        pub fn with_transfer_log(mut self, log: TransferLog) -> Self {
            self.transfer_log = Some(log);
            self
        }

        fn record(&self, entry: &TransferLogEntry) {
            if let Some(log) = &self.transfer_log {
                if let Err(e) = log.add_entry(entry) {
                    eprintln!("transfer log write failed: {}", e);
                }
            }
        }
    }

    /// Bind the control port from the config and serve until the task is
    /// dropped
    pub async fn serve(ctx: Arc<ServerContext>) -> Result<()> {
        let addr = ctx.config.control_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| FtError::Connection { addr: addr.clone(), source })?;
        eprintln!(
            "ftserver listening on {} root={}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or(addr),
            ctx.config.root.display()
        );
        serve_listener(listener, ctx).await
    }

    /// Accept loop over an already-bound control listener; one task per
    /// control connection
    pub async fn serve_listener(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    eprintln!("accept error: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let peer = peer.to_string();
            eprintln!("conn from {}", peer);
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                if let Err(e) = handle_conn(stream, &peer, &ctx).await {
                    eprintln!("connection error ({}): {}", peer, e);
                    ctx.logger.error("handle_conn", &peer, &e.to_string());
                }
            });
        }
    }

    /// Listening socket for one command's data channel
    async fn bind_data_listener(host: &str, port: u16) -> io::Result<TcpListener> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address"))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        // Data ports are reused command after command
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(DATA_BACKLOG)
    }

    async fn reject(
        control: &mut BufReader<TcpStream>,
        ctx: &ServerContext,
        peer: &str,
        mut entry: TransferLogEntry,
        reason: String,
    ) -> Result<()> {
        eprintln!("rejecting {}: {}", peer, reason);
        ctx.logger.rejected(peer, &reason);
        entry.status = TransferStatus::Rejected;
        entry.error = Some(reason.clone());
        ctx.record(&entry);
        let verdict = Verdict::Invalid(reason).to_line();
        send_line(control, &verdict, ctx.config.io_timeout_ms, "verdict write").await
    }

    /// One control connection: read the request, validate, rendezvous on the
    /// data port, stream the payload
    pub async fn handle_conn(stream: TcpStream, peer: &str, ctx: &ServerContext) -> Result<()> {
        ctx.logger.connection(peer);
        let io_ms = ctx.config.io_timeout_ms;
        let mut control = BufReader::new(stream);

        let line = expect_line(&mut control, io_ms, "request read").await?;
        ctx.logger.request(peer, &line);

        let request = match CommandRequest::parse_line(&line) {
            Ok(r) => r,
            Err(reason) => {
                let entry = TransferLogEntry::new(peer, None);
                return reject(&mut control, ctx, peer, entry, reason).await;
            }
        };
        let mut entry = TransferLogEntry::new(peer, Some(&request));

        // Validation happens before any data socket exists
        let source = match payload::prepare(&ctx.config.root, &request).await {
            Ok(s) => s,
            Err(reason) => return reject(&mut control, ctx, peer, entry, reason).await,
        };
        let listener = match bind_data_listener(&ctx.config.data_bind_host, request.data_port).await {
            Ok(l) => l,
            Err(e) => {
                let reason = format!("Error: cannot open data port {}: {}", request.data_port, e);
                return reject(&mut control, ctx, peer, entry, reason).await;
            }
        };

        let started = Instant::now();
        match transfer(&mut control, listener, source, peer, &request, ctx).await {
            Ok(summary) => {
                let seconds = started.elapsed().as_secs_f64();
                let name = request.file_name.as_deref().unwrap_or("-");
                eprintln!(
                    "{} {} {} done: {} bytes in {:.3}s",
                    peer, request.kind, name, summary.bytes, seconds
                );
                ctx.logger.transfer_done(peer, request.kind, name, summary.bytes, seconds);
                entry.status = TransferStatus::Completed;
                entry.bytes_transferred = summary.bytes;
                entry.blake3 = Some(summary.digest);
                ctx.record(&entry);
                Ok(())
            }
            Err(e) => {
                entry.error = Some(e.to_string());
                ctx.record(&entry);
                Err(e)
            }
        }
    }

    async fn transfer(
        control: &mut BufReader<TcpStream>,
        listener: TcpListener,
        source: PayloadSource,
        peer: &str,
        request: &CommandRequest,
        ctx: &ServerContext,
    ) -> Result<TransferSummary> {
        let io_ms = ctx.config.io_timeout_ms;
        let accept_ms = ctx.config.accept_timeout_ms;

        // Listener is up: only now may the client connect
        send_line(control, &format!("{}\n", READY), io_ms, "ready write").await?;
        ctx.logger.data_ready(peer, request.data_port);

        let (mut data, data_peer) = match timeout(Duration::from_millis(accept_ms), listener.accept()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                let verdict = Verdict::Invalid(format!("Error: data connection failed: {}", e));
                let _ = send_line(control, &verdict.to_line(), io_ms, "verdict write").await;
                return Err(e.into());
            }
            Err(_) => {
                let verdict = Verdict::Invalid(format!(
                    "Error: data connection not established within {} ms",
                    accept_ms
                ));
                let _ = send_line(control, &verdict.to_line(), io_ms, "verdict write").await;
                return Err(FtError::DataChannelTimeout { stage: "data accept", ms: accept_ms });
            }
        };
        // Exactly one data connection per command
        drop(listener);
        let _ = data.set_nodelay(true);
        eprintln!("data channel from {} for {}", data_peer, peer);

        send_line(control, &Verdict::Valid.to_line(), io_ms, "verdict write").await?;
        let summary = payload::send_payload(&mut data, source, io_ms).await?;
        data.shutdown().await?;
        Ok(summary)
    }
}

pub mod client {
    use super::*;
    use std::future::Future;

    use tokio::io::AsyncWriteExt;

    use crate::config::ClientConfig;
    use crate::payload::{self, SavedFile, TransferSummary};
    use crate::progress::TransferProgress;
    use crate::protocol::{CommandKind, CommandRequest, UnrecognizedRequest};

    /// First control line after a request
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Rendezvous {
        Ready,
        Rejected(String),
    }

    /// Result of one successful command
    #[derive(Debug, Clone)]
    pub enum CommandOutcome {
        Listing(TransferSummary),
        File(SavedFile),
    }

    async fn connect_timed(host: &str, port: u16, ms: u64, stage: &'static str) -> Result<TcpStream> {
        let addr = format!("{}:{}", host, port);
        let stream = match timeout(Duration::from_millis(ms), TcpStream::connect((host, port))).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => return Err(FtError::Connection { addr, source }),
            Err(_) => return Err(FtError::DataChannelTimeout { stage, ms }),
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// The client's end of the control connection
    pub struct ControlChannel {
        stream: BufReader<TcpStream>,
        io_ms: u64,
    }

    impl ControlChannel {
        /// Connect to the server's control port. No retry.
        pub async fn connect(host: &str, port: u16, config: &ClientConfig) -> Result<Self> {
            let stream = connect_timed(host, port, config.connect_timeout_ms, "control connect").await?;
            Ok(Self {
                stream: BufReader::new(stream),
                io_ms: config.io_timeout_ms,
            })
        }

        pub async fn send_request(&mut self, request: &CommandRequest) -> Result<()> {
            send_line(&mut self.stream, &request.to_line(), self.io_ms, "request write").await
        }

        pub async fn send_unrecognized(&mut self, request: &UnrecognizedRequest) -> Result<()> {
            send_line(&mut self.stream, &request.to_line(), self.io_ms, "request write").await
        }

        /// Wait for `READY`; any other line is the server's rejection
        pub async fn await_readiness(&mut self, ms: u64) -> Result<Rendezvous> {
            let line = expect_line(&mut self.stream, ms, "readiness wait").await?;
            if line == READY {
                Ok(Rendezvous::Ready)
            } else {
                Ok(Rendezvous::Rejected(line))
            }
        }

        pub async fn receive_verdict(&mut self, ms: u64) -> Result<Verdict> {
            let line = expect_line(&mut self.stream, ms, "verdict wait").await?;
            Ok(Verdict::parse(&line))
        }
    }

    /// Open the data channel; only called after `READY`
    pub async fn connect_data(host: &str, port: u16, ms: u64) -> Result<TcpStream> {
        connect_timed(host, port, ms, "data connect").await
    }

    /// Run one command end to end. A listing and status lines are written to
    /// `console`; a file lands in `config.download_dir`.
    pub async fn run_command<W>(
        host: &str,
        control_port: u16,
        request: &CommandRequest,
        config: &ClientConfig,
        console: &mut W,
    ) -> Result<CommandOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        let mut control = ControlChannel::connect(host, control_port, config).await?;
        control.send_request(request).await?;

        match control.await_readiness(config.ready_timeout_ms).await? {
            Rendezvous::Ready => {}
            Rendezvous::Rejected(reason) => return Err(FtError::InvalidCommand(reason)),
        }
        let mut data = connect_data(host, request.data_port, config.connect_timeout_ms).await?;
        if let Verdict::Invalid(reason) = control.receive_verdict(config.ready_timeout_ms).await? {
            return Err(FtError::InvalidCommand(reason));
        }

        let io_ms = config.io_timeout_ms;
        let outcome = match (request.kind, request.file_name.as_deref()) {
            (CommandKind::ListDirectory, _) => {
                let progress = TransferProgress::new(config.progress, "listing");
                let summary = payload::receive_payload(
                    &mut data,
                    request.kind.payload_kind(),
                    console,
                    Path::new("<listing output>"),
                    io_ms,
                    &progress,
                )
                .await;
                progress.finish();
                CommandOutcome::Listing(summary?)
            }
            (CommandKind::RetrieveFile, Some(name)) => {
                let notice = format!("Receiving {} from server, please wait...\n", name);
                console
                    .write_all(notice.as_bytes())
                    .await
                    .map_err(|e| FtError::local_io("<console>", e))?;
                console.flush().await.map_err(|e| FtError::local_io("<console>", e))?;
                let progress = TransferProgress::new(config.progress, name);
                let saved = payload::receive_file(&mut data, name, &config.download_dir, io_ms, &progress).await;
                progress.finish();
                CommandOutcome::File(saved?)
            }
            (CommandKind::RetrieveFile, None) => {
                return Err(FtError::Usage("\"-g\" requires a file name".into()));
            }
        };
        Ok(outcome)
    }

    /// Send a request with a flag this client does not know and surface the
    /// server's rejection
    pub async fn run_unrecognized(
        host: &str,
        control_port: u16,
        request: &UnrecognizedRequest,
        config: &ClientConfig,
    ) -> Result<()> {
        let mut control = ControlChannel::connect(host, control_port, config).await?;
        control.send_unrecognized(request).await?;
        match control.await_readiness(config.ready_timeout_ms).await? {
            Rendezvous::Rejected(reason) => Err(FtError::InvalidCommand(reason)),
            Rendezvous::Ready => Err(FtError::Protocol(format!(
                "server accepted unknown command \"{}\"",
                request.flag
            ))),
        }
    }

    /// Drive `work` until it finishes or `cancel` fires. On cancel the work is
    /// dropped, which closes both channels and removes a partial download.
    pub async fn until_cancelled<T, F, C>(work: F, cancel: C) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        C: Future<Output = ()>,
    {
        tokio::select! {
            res = work => res,
            _ = cancel => Err(FtError::Interrupted),
        }
    }
}
