//! ftclient - one command per invocation
//!
//! ftclient <serverHost> <controlPort> (-l|-g) <dataPort> [<fileName>]

use clap::Parser;
use std::sync::Arc;
use tokio::sync::Notify;

use ftlink::checksum::hash_file_blake3;
use ftlink::cli::{ClientArgs, Invocation};
use ftlink::error::{FtError, Result};
use ftlink::net_async::client::{self, CommandOutcome};

const USAGE: &str = "Usage: ftclient <serverHost> <controlPort> -l|-g <dataPort> [fileName]";

fn main() {
    // The command in flight is dropped on Ctrl-C so a partial download is
    // cleaned up before exit
    let interrupted = Arc::new(Notify::new());
    let on_signal = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || on_signal.notify_one()) {
        eprintln!("warning: cannot install Ctrl-C handler: {}", e);
    }

    let args = ClientArgs::parse();

    let code = match run(&args, &interrupted) {
        Ok(()) => 0,
        Err(e) => {
            match &e {
                // The server's own words
                FtError::InvalidCommand(msg) => println!("{}", msg),
                FtError::Usage(msg) => {
                    eprintln!("{}", msg);
                    eprintln!("{}", USAGE);
                }
                FtError::Interrupted => eprintln!("\nInterrupted by user. Exiting (Ctrl-C)..."),
                other => eprintln!("ftclient: {}", other),
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(args: &ClientArgs, interrupted: &Notify) -> Result<()> {
    let invocation = args.request()?;
    let config = args.client_config()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let request = match invocation {
        Invocation::Command(request) => request,
        Invocation::Unrecognized(raw) => {
            return rt.block_on(client::until_cancelled(
                client::run_unrecognized(&args.server_host, args.control_port, &raw, &config),
                interrupted.notified(),
            ));
        }
    };

    let mut stdout = tokio::io::stdout();
    let outcome = rt.block_on(client::until_cancelled(
        client::run_command(&args.server_host, args.control_port, &request, &config, &mut stdout),
        interrupted.notified(),
    ))?;

    match outcome {
        CommandOutcome::Listing(summary) => {
            if summary.bytes == 0 {
                println!("The directory is empty.");
            }
            if config.verbose {
                eprintln!("listing: {} bytes blake3={}", summary.bytes, summary.digest);
            }
        }
        CommandOutcome::File(saved) => {
            if saved.renamed {
                println!("File already exists. File saved as {}", saved.path.display());
            }
            println!("File transfer completed.");
            if config.verbose {
                eprintln!(
                    "{}: {} bytes blake3={}",
                    saved.path.display(),
                    saved.summary.bytes,
                    saved.summary.digest
                );
                match hash_file_blake3(&saved.path) {
                    Ok(on_disk) if on_disk == saved.summary.digest => eprintln!("verified on disk"),
                    Ok(on_disk) => eprintln!("warning: on-disk digest differs: {}", on_disk),
                    Err(e) => eprintln!("warning: cannot verify {}: {:#}", saved.path.display(), e),
                }
            }
        }
    }
    Ok(())
}
