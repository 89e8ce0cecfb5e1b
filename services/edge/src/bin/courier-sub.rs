// Print courier results from the response channel as they arrive.
use anyhow::{Context, Result};
use clap::Parser;
use courier_client::Subscriber;
use edge::cli::{self, ConnectionArgs};
use edge::observability::init_observability;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "courier-sub")]
#[command(about = "Print decoded results from the courier response channel")]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Stop after this many results (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    count: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.connection.load()?;
    init_observability(&config.log_level);
    info!(
        host = %config.host,
        port = config.port,
        channel = %config.response_channel,
        "starting subscriber"
    );

    let session = cli::connect(&config).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    // Malformed envelopes are logged by the default error handler.
    Subscriber::new(session.clone(), &config.response_channel, config.codec())
        .listen(move |result| {
            let _ = tx.send(result);
        })
        .await
        .context("subscribe to results")?;

    let mut seen = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            result = rx.recv() => {
                let Some(result) = result else { break };
                println!("{}", cli::result_json(&result));
                seen += 1;
                if args.count > 0 && seen >= args.count {
                    break;
                }
            }
        }
    }

    info!(results = seen, "subscriber stopping");
    session.disconnect().await;
    Ok(())
}
