mod cli;
mod config;
mod output;

use crate::{cli::Args, config::AppConfig, output::OutputManager};
use anyhow::{Context, Result};
use clap::Parser;
#[cfg(feature = "colored-output")]
use colored::*;
use danmaku::{BilibiliApi, LiveClient, RoomStatus};
use std::{process, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        #[cfg(feature = "colored-output")]
        {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
        }
        #[cfg(not(feature = "colored-output"))]
        {
            eprintln!("Error: {:#}", e);
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let config = AppConfig::load(args.config.as_deref())?;

    let mut api = BilibiliApi::new(config.live.http_timeout())?;
    if let Some(cookies) = args.cookies.or(config.cookies) {
        api = api.with_cookies(cookies);
    }

    let output = OutputManager::new(args.output, args.all);
    let client = LiveClient::new(Arc::new(api), config.live, move |event| {
        output.print(&event)
    });
    let mut status = client.subscribe();

    client
        .enter_room(args.room_id)
        .await
        .with_context(|| format!("Failed to enter room {}", args.room_id))?;
    info!(room_id = args.room_id, "Connected, press Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Stopping");
                break Ok(());
            }
            received = status.recv() => match received {
                Ok(RoomStatus::Failed { room_id, reason }) => {
                    break Err(anyhow::anyhow!("Room {room_id} failed: {reason}"));
                }
                Ok(RoomStatus::Reconnecting { attempt, max_attempts, .. }) => {
                    warn!("Connection lost, reconnecting ({attempt}/{max_attempts})");
                }
                Ok(other) => info!(status = ?other, "Room status"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Status updates lagged"),
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    client.leave_room().await;
    client.dispose();
    result
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}
