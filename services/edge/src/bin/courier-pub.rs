// Publish one payload file as a courier request and optionally wait for its result.
use anyhow::{Context, Result};
use clap::Parser;
use courier_client::{Correlator, Publisher, Subscriber};
use edge::cli::{self, ConnectionArgs};
use edge::observability::init_observability;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "courier-pub")]
#[command(about = "Publish a payload file on the courier request channel")]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Payload file to publish
    #[arg(long)]
    file: PathBuf,

    /// Seconds to wait for the matching result (0 = do not wait)
    #[arg(long, default_value = "0")]
    wait: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.connection.load()?;
    init_observability(&config.log_level);

    let payload = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("read {}", args.file.display()))?;
    let codec = config.codec();
    let session = cli::session(&config);
    let correlator = Correlator::new(config.pending_ttl);
    let publisher = Publisher::new(session.clone(), &config.request_channel, codec)
        .with_correlator(correlator.clone())
        .with_device_id(&config.client_id);
    // The envelope is built in full before any connection is made.
    let request = publisher
        .prepare(&payload)
        .with_context(|| format!("{} cannot be sent", args.file.display()))?;
    info!(
        file = %args.file.display(),
        bytes = payload.len(),
        envelope_bytes = request.envelope().len(),
        host = %config.host,
        port = config.port,
        channel = %config.request_channel,
        "publishing request"
    );

    cli::open(&session, &config).await?;

    let mut results = None;
    if args.wait > 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        Subscriber::new(session.clone(), &config.response_channel, codec)
            .with_correlator(correlator)
            .listen(move |result| {
                let _ = tx.send(result);
            })
            .await
            .context("subscribe to results")?;
        results = Some(rx);
    }

    let id = publisher
        .send_prepared(request, config.quality)
        .await
        .context("publish request")?;
    info!(correlation_id = %id, "request published");

    if let Some(mut rx) = results {
        match tokio::time::timeout(Duration::from_secs(args.wait), rx.recv()).await {
            Ok(Some(result)) => println!("{}", cli::result_json(&result)),
            Ok(None) => warn!("result stream closed"),
            Err(_) => warn!(wait_secs = args.wait, correlation_id = %id, "no result received"),
        }
    }

    session.disconnect().await;
    Ok(())
}
