//! ticketshare command line
//!
//! ```bash
//! # Terminal 1
//! TICKETSHARE_CONFIG_DIR=/tmp/ts1 ticketshare send photo.jpg
//!
//! # Terminal 2
//! TICKETSHARE_CONFIG_DIR=/tmp/ts2 ticketshare receive '<ticket>' -o photo.jpg
//! ```

use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ticketshare::net::{
    Endpoint, IrohTransport, TicketMetadata, TransferEvent, TransferId, TransferStatus,
};
use ticketshare::{TransferConfig, TransferManager};

/// Share files by ticket.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a file and print its ticket, serving until interrupted.
    Send {
        path: String,
    },
    /// Download the file behind a ticket.
    Receive {
        ticket: String,

        /// Destination path; defaults to the name embedded in the ticket.
        #[arg(short, long)]
        output: Option<String>,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
    /// Show the file name and size embedded in a ticket.
    Inspect {
        ticket: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = TransferConfig::from_env();

    if let Command::Inspect { ticket } = &args.command {
        inspect(ticket, &config);
        return Ok(ExitCode::SUCCESS);
    }

    let endpoint = Endpoint::bind().await?;
    let transport = Arc::new(IrohTransport::new(&endpoint)?);
    let manager = TransferManager::new(transport.clone(), config);

    let code = match args.command {
        Command::Send { path } => send(&manager, &path).await?,
        Command::Receive { ticket, output, yes } => receive(&manager, &ticket, output, yes).await?,
        Command::Inspect { .. } => ExitCode::SUCCESS,
    };

    transport.shutdown().await;
    endpoint.shutdown().await;
    Ok(code)
}

fn inspect(ticket: &str, config: &TransferConfig) {
    match ticketshare::net::ticket::parse_metadata_only(ticket) {
        Ok(meta) => println!("{} ({} bytes)", meta.file_name, meta.file_size),
        Err(e) => println!("{e}; will be saved as '{}'", config.placeholder_file_name),
    }
}

async fn send(manager: &TransferManager, path: &str) -> Result<ExitCode> {
    let sent = manager
        .send(path)
        .await
        .with_context(|| format!("failed to share {path}"))?;

    info!(transfer_id = %sent.transfer_id, "Sharing file");
    println!("{}", sent.ticket);
    eprintln!("Serving {} ({} bytes). Press Ctrl-C to stop.", sent.file_name, sent.file_size);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    Ok(ExitCode::SUCCESS)
}

async fn receive(
    manager: &TransferManager,
    ticket: &str,
    output: Option<String>,
    yes: bool,
) -> Result<ExitCode> {
    let metadata = manager.parse_metadata(ticket).ok();
    let output = match output {
        Some(output) => output,
        None => match &metadata {
            Some(meta) => meta.file_name.to_string(),
            None => manager.config().placeholder_file_name.to_string(),
        },
    };

    // Ask before entering the engine; the prompt blocks on stdin.
    let approved = yes || {
        let output = output.clone();
        tokio::task::spawn_blocking(move || confirm(metadata.as_ref(), &output, &mut std::io::stdin().lock()))
            .await
            .context("confirmation prompt failed")?
    };

    let id = manager
        .receive_with_approval(ticket, &output, |_| approved)
        .await?;

    match id {
        Some(id) => watch(manager, id).await,
        None => {
            eprintln!("Declined.");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn confirm(meta: Option<&TicketMetadata>, output: &str, input: &mut impl BufRead) -> bool {
    match meta {
        Some(meta) => eprint!("Receive {} ({} bytes) into {output}? [y/N] ", meta.file_name, meta.file_size),
        None => eprint!("Receive an unnamed file into {output}? [y/N] "),
    }
    let _ = std::io::stderr().flush();

    let mut answer = String::new();
    if input.read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn watch(manager: &TransferManager, id: TransferId) -> Result<ExitCode> {
    let (mut record, mut subscription) = manager.subscribe(id)?;

    while let Some(event) = subscription.next().await {
        if let TransferEvent::Progress(progress) = &event {
            eprintln!(
                "{:>3}%  {}/{} bytes  {:.1} KiB/s",
                progress.percent(),
                progress.bytes_transferred,
                progress.file_size,
                progress.speed_bytes_per_second / 1024.0
            );
        }
        record = event.record().clone();
    }

    match record.status {
        TransferStatus::Completed => {
            eprintln!("Received {} ({} bytes)", record.file_name, record.file_size);
            Ok(ExitCode::SUCCESS)
        }
        status => {
            let reason = record.error.as_deref().unwrap_or(status.as_str());
            eprintln!("Transfer {status}: {reason}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ticketshare=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
