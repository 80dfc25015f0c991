//! nostr-tail - print events from Nostr relays until every relay sent EOSE

use clap::Parser;
use nostr_subscriptions::{Client, ClientConfig, Filter, SubscriptionNotification};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nostr-tail")]
#[command(about = "Subscribe to Nostr relays and print matching events", long_about = None)]
struct Cli {
    /// Relay URLs (defaults to NOSTR_RELAYS or the built-in list)
    #[arg(short, long)]
    relay: Vec<String>,

    /// Event kinds to match
    #[arg(short, long, value_delimiter = ',')]
    kinds: Vec<u16>,

    /// Hex public keys to match
    #[arg(short, long)]
    author: Vec<String>,

    /// Maximum stored events per relay
    #[arg(short, long, default_value_t = 20)]
    limit: u64,

    /// Seconds to wait for EOSE
    #[arg(short, long, default_value_t = 15)]
    timeout: u64,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nostr-tail: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ClientConfig::from_env();
    if !cli.relay.is_empty() {
        config.relays = cli.relay.clone();
    }

    let client = Client::new(config);
    let report = client.connect().await?;
    for failed in &report.failed {
        warn!(
            "Could not connect to {}: {}",
            failed.relay_url,
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }
    info!("Connected to {} relays", report.connected.len());

    let mut filter = Filter::new().limit(cli.limit);
    if !cli.kinds.is_empty() {
        filter = filter.kinds(cli.kinds.clone());
    }
    if !cli.author.is_empty() {
        filter = filter.authors(cli.author.clone());
    }

    let options = client
        .default_options()
        .timeout(Some(Duration::from_secs(cli.timeout)));
    let (result, mut notifications) = client.subscribe_channel(vec![filter], options).await?;
    if !result.success {
        let message = result
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "subscription failed".to_string());
        client.shutdown().await?;
        return Err(message.into());
    }

    let id = result.id().unwrap_or_default().to_string();
    let mut pending_relays = result.relay_results.iter().filter(|r| r.success).count();

    while let Some(notification) = notifications.recv().await {
        match notification {
            SubscriptionNotification::Event { event, .. } => {
                if cli.json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    println!("[{}] {} kind={} {}", event.created_at, &event.pubkey[..8.min(event.pubkey.len())], event.kind, event.content);
                }
            }
            SubscriptionNotification::Eose { relay_url, .. } => {
                info!("EOSE from {}", relay_url);
                pending_relays = pending_relays.saturating_sub(1);
                if pending_relays == 0 {
                    break;
                }
            }
            SubscriptionNotification::Error { error, .. } => {
                warn!("Subscription {} failed: {}", id, error);
            }
            SubscriptionNotification::Closed { reason, .. } => {
                info!("Subscription {} closed: {}", id, reason.unwrap_or_default());
                break;
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}
