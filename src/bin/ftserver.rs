use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use ftlink::cli::DaemonOpts;
use ftlink::log::TransferLog;
use ftlink::logger::{Logger, NoopLogger, TextLogger};
use ftlink::net_async::server::{self, ServerContext};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let mut config = opts
        .server_config()
        .context("Invalid server configuration")?;

    // Canonicalize the root for logging and containment checks
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    println!("Starting ftserver:");
    println!("  Root: {}", config.root.display());
    println!("  Control: {}", config.control_addr());
    println!("  Data listeners: {}:<client data port>", config.data_bind_host);

    if config.bind_host == "0.0.0.0" {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the served directory to all network interfaces");
        eprintln!("   There is no authentication or encryption; only use on trusted networks");
    }

    let logger: Arc<dyn Logger> = match &config.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("Failed to open log file {}", p.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };
    let transfer_log = config.transfer_log.as_deref().map(TransferLog::new);

    let mut ctx = ServerContext::new(config).with_logger(logger);
    if let Some(log) = transfer_log {
        ctx = ctx.with_transfer_log(log);
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        tokio::select! {
            res = server::serve(Arc::new(ctx)) => res.map_err(anyhow::Error::from),
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nInterrupted. Shutting down ftserver.");
                Ok(())
            }
        }
    })
}
