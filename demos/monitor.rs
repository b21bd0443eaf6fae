//! Watch an AZM processor: zone gains over TCP and source meters over UDP.
//!
//! Usage: cargo run --example monitor -- <host> [zones]
//!
//! Set RUST_LOG=atlas_azm=debug to see wire traffic.

use atlas_azm::{AzmClient, ClientConfig, FormatTag, Subscription};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(host) = args.next() else {
        eprintln!("usage: monitor <host> [zones]");
        std::process::exit(2);
    };
    let zones = args.next().map(|z| z.parse::<usize>()).transpose()?.unwrap_or(4);

    let client = AzmClient::start(ClientConfig::new(host)).await?;

    let mut subscriptions = Vec::new();
    for zone in 0..zones {
        subscriptions.push(client.subscribe(format!("ZoneName_{}", zone), FormatTag::Str)?);
        subscriptions.push(client.subscribe(format!("ZoneGain_{}", zone), FormatTag::Val)?);
        subscriptions.push(client.subscribe(format!("ZoneMute_{}", zone), FormatTag::Val)?);
        subscriptions.push(client.subscribe_meter(format!("SourceMeter_{}", zone), FormatTag::Val)?);
    }

    // Funnel every subscription into one stream
    let (tx, mut rx) = mpsc::unbounded_channel();
    for subscription in subscriptions {
        tokio::spawn(forward(subscription, tx.clone()));
    }
    drop(tx);

    let mut states = client.state_changes();
    let mut errors = client.device_errors();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(line) = rx.recv() => println!("{}", line),
            Ok(state) = states.recv() => println!("-- connection {}", state),
            Ok(error) = errors.recv() => println!("-- device error: {}", error.message),
        }
    }

    client.shutdown().await;
    println!("{} parameters cached", client.cache().len());
    Ok(())
}

async fn forward(mut subscription: Subscription, tx: mpsc::UnboundedSender<String>) {
    while let Ok(update) = subscription.recv().await {
        if tx
            .send(format!("{:<16} {:>8}", update.param, update.value))
            .is_err()
        {
            return;
        }
    }
}
