//! relay - publish a batch to a queue, then consume it with a processor.
//
//  $ relay --config relay.toml --count 4 --run-for 2
//  $ RELAY_CONFIG=relay.toml relay          # runs until Ctrl-C
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use relay_core::{
    HandlerError, LoggingErrorHandler, MessageBatch, MessageHandler, ProcessMessageContext,
    QueueCounts, RelayClient, RelayConfig, load_config,
};

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Batch publish and push-style consume over a queue")]
struct Cli {
    /// Path to config TOML. Built-in defaults are used when absent.
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `connection.endpoint`.
    #[arg(long)]
    endpoint: Option<String>,

    /// Overrides `connection.queue`.
    #[arg(long)]
    queue: Option<String>,

    /// Number of messages to publish ("0", "1", ...).
    #[arg(long, default_value_t = 4)]
    count: usize,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    run_for: Option<f64>,
}

/// Logs every body and completes the message.
struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, ctx: &ProcessMessageContext) -> Result<(), HandlerError> {
        let message = ctx.message();
        info!("Received: {}", message.body_text());
        ctx.complete(message).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    endpoint: &'a str,
    queue: &'a str,
    published: usize,
    counts: QueueCounts,
}

fn resolve_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(endpoint) = &cli.endpoint {
        config.connection.endpoint = endpoint.clone();
    }
    if let Some(queue) = &cli.queue {
        config.connection.queue = queue.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Adds messages `0..count`. Fails on the first one that does not fit.
fn fill_batch(batch: &mut MessageBatch, count: usize) -> anyhow::Result<()> {
    for i in 0..count {
        if !batch.try_add(i.to_string()) {
            bail!(
                "message {i} does not fit the batch ({} of {} messages, {} bytes left)",
                batch.len(),
                batch.limits().max_messages,
                batch.remaining_bytes()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging()?;
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let queue = config.connection.queue.as_str();

    info!("begin");

    let client = RelayClient::connect(&config).await?;
    let sender = client.create_sender(queue);

    let mut batch = sender.create_batch();
    fill_batch(&mut batch, cli.count)?;
    let published = batch.len();
    sender.send_batch(batch).await?;
    info!(count = published, "sent a batch of messages to the queue");

    let mut processor = client
        .create_processor(queue)
        .options(config.processor.options())
        .on_message(EchoHandler)
        .on_error(LoggingErrorHandler)
        .build()?;

    match cli.run_for {
        Some(secs) => {
            let duration = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid --run-for value {secs}"))?;
            processor.run_for(duration).await?;
        }
        None => {
            info!("processing; press Ctrl-C to stop");
            processor.run_until(tokio::signal::ctrl_c()).await?;
        }
    }
    info!("stopped receiving messages");

    let summary = RunSummary {
        endpoint: client.endpoint(),
        queue,
        published,
        counts: client.queue_counts(queue).await?,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    processor.dispose().await;
    client.dispose().await?;

    info!("end");
    Ok(())
}
