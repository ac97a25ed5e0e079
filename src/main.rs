//! Headset Bridge - Entry Point
//!
//! Line-oriented driver: reads softphone commands from stdin, forwards them to the
//! headset service, and prints canonical events as JSON lines.

use anyhow::Result;
use clap::Parser;
use headset_bridge::{registry::build_default_vendors, CallInfo, Config, HeadsetService, VendorEventBus};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "headset-bridge", about = "Headset call-control bridge")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Active microphone label to select a vendor at startup
    #[arg(long)]
    mic: Option<String>,
}

const HELP: &str = "commands: mic <label> | incoming <id> [contact] | outgoing <id> [contact] | \
answer <id> | reject <id> | end <id> | endall | mute | unmute | hold <id> | resume <id> | \
status | retry | quit";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded");

    let bus = VendorEventBus::new();
    let vendors = build_default_vendors(&config, &bus);
    let service = HeadsetService::new(&config.service, bus, vendors);

    let events = service.subscribe();
    tokio::spawn(print_events(events));

    let mut label = cli.mic.unwrap_or_default();
    if !label.is_empty() {
        if let Err(e) = service.active_mic_change(&label).await {
            error!("Failed to select headset for '{}': {}", label, e);
        }
    }

    info!("Ready. {}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_command(&service, &mut label, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    // Release the device before exiting
    if let Err(e) = service.change_implementation(None, "").await {
        warn!("Failed to release headset: {}", e);
    }
    info!("Shutting down");
    Ok(())
}

/// Returns `Ok(false)` when the driver should exit
async fn run_command(service: &HeadsetService, label: &mut String, line: &str) -> Result<bool> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let mut args = rest.split_whitespace();
    let mut id = || args.next().unwrap_or_default().to_string();

    match command {
        "" => {}
        "mic" => {
            *label = rest.trim().to_string();
            service.active_mic_change(label).await?;
        }
        "incoming" | "outgoing" => {
            let mut info = CallInfo::new(id());
            let contact = id();
            if !contact.is_empty() {
                info = info.with_contact(contact);
            }
            if command == "incoming" {
                let others = !service.conversation_ids().is_empty();
                service.incoming_call(&info, others).await?;
            } else {
                service.outgoing_call(&info).await?;
            }
        }
        "answer" => service.answer_call(&id(), false).await?,
        "reject" => service.reject_call(&id()).await?,
        "end" => {
            let conversation = id();
            let others = service
                .conversation_ids()
                .iter()
                .any(|other| *other != conversation);
            service.end_call(&conversation, others).await?;
        }
        "endall" => service.end_all_calls().await?,
        "mute" => service.set_mute(true).await?,
        "unmute" => service.set_mute(false).await?,
        "hold" => service.set_hold(&id(), true).await?,
        "resume" => service.set_hold(&id(), false).await?,
        "status" => {
            let vendor = service
                .selected_vendor()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "{}",
                serde_json::json!({
                    "vendor": vendor,
                    "connection": service.connection_status().to_string(),
                    "conversations": service
                        .conversation_ids()
                        .iter()
                        .map(|id| (id.clone(), service.conversation_state(id)))
                        .collect::<std::collections::BTreeMap<_, _>>(),
                })
            );
        }
        "retry" => service.retry_connection(label).await?,
        "quit" | "exit" => return Ok(false),
        other => warn!("Unknown command '{}'. {}", other, HELP),
    }
    Ok(true)
}

async fn print_events(mut events: broadcast::Receiver<headset_bridge::HeadsetEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to encode {}: {}", event.event_name(), e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event printer lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
