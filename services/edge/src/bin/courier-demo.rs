// Console demo: device, bridging stage and broker in one process.
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use courier_client::{
    Attribution, Bridge, Codec, ConnectionState, Correlator, InferenceError, Prediction,
    Publisher, Quality, Session, SessionConfig, Subscriber,
};
use courier_transport::{ConnectOptions, Endpoint, MemoryBroker, ReconnectPolicy};
use edge::cli;
use edge::observability::init_observability;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const REQUESTS: &str = "device/image/request";
const RESPONSES: &str = "device/image/response";
const LABELS: [&str; 3] = ["cat", "dog", "bird"];

#[derive(Parser, Debug)]
#[command(name = "courier-demo")]
#[command(about = "Loopback demo of courier request/response correlation")]
struct Args {
    /// Number of requests to send before the simulated drop
    #[arg(long, default_value = "3")]
    count: usize,
}

// Deterministic stand-in for a model.
fn classify(payload: &[u8]) -> std::result::Result<Prediction, InferenceError> {
    let first = payload
        .first()
        .copied()
        .ok_or_else(|| InferenceError::new("empty image"))?;
    Ok(Prediction {
        label: LABELS[first as usize % LABELS.len()].to_string(),
        confidence: 0.5 + (payload.len() % 50) as f64 / 100.0,
    })
}

async fn connect(broker: &MemoryBroker, client_id: &str) -> Result<Session> {
    let config = SessionConfig {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            ..ReconnectPolicy::default()
        },
        ..SessionConfig::default()
    };
    let session = Session::new(Arc::new(broker.clone()), config);
    session
        .connect(ConnectOptions::new(client_id, Endpoint::new("loopback", 0)))
        .await
        .with_context(|| format!("connect {client_id}"))?;
    Ok(session)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_observability("warn");
    println!("== courier loopback demo ==");
    println!("A device sends images, a bridging stage classifies them and replies.");

    println!("Step 1/5: booting in-memory broker and bridging stage.");
    let broker = MemoryBroker::new();
    let bridge_session = connect(&broker, "bridge").await?;
    let bridge = Bridge::new(bridge_session, REQUESTS, RESPONSES, classify)
        .start()
        .await?;

    println!("Step 2/5: connecting the device and listening for results.");
    let device = connect(&broker, "basicPubSub").await?;
    let correlator = Correlator::new(Duration::from_secs(60));
    let publisher = Publisher::new(device.clone(), REQUESTS, Codec::default())
        .with_correlator(correlator.clone());
    let (tx, mut results) = mpsc::unbounded_channel();
    Subscriber::new(device.clone(), RESPONSES, Codec::default())
        .with_correlator(correlator.clone())
        .listen(move |result| {
            let _ = tx.send(result);
        })
        .await?;

    println!("Step 3/5: sending {} requests back to back.", args.count);
    for index in 0..args.count {
        let payload = vec![index as u8; 1024 + index * 7];
        let id = publisher.send(&payload, Quality::AtLeastOnce).await?;
        println!("  sent {} bytes as {id}", payload.len());
    }
    for _ in 0..args.count {
        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .context("waiting for result")?
            .context("result stream closed")?;
        let matched = match result.attribution {
            Attribution::Matched(id) => format!("matched {id}"),
            Attribution::Assumed(id) => format!("assumed {id}"),
            Attribution::Unattributed => "unattributed".to_string(),
        };
        println!("  result {} ({matched})", cli::result_json(&result));
    }

    println!("Step 4/5: broker drops the device; the session reconnects on its own.");
    let mut state = device.watch_state();
    broker.drop_client("basicPubSub");
    for wanted in [ConnectionState::Reconnecting, ConnectionState::Connected] {
        tokio::time::timeout(Duration::from_secs(10), state.wait_for(|state| *state == wanted))
            .await
            .context("waiting for reconnect")??;
        println!("  device is {wanted}");
    }
    println!("  reconnected; subscriptions: {:?}", device.subscriptions());
    broker
        .inject(RESPONSES, Bytes::from_static(br#"{"label":"cat","confidence":"high"}"#))
        .await;
    println!("  injected a malformed result (logged and skipped).");
    let id = publisher.send(b"\x02after-reconnect", Quality::AtLeastOnce).await?;
    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .context("waiting for result")?
        .context("result stream closed")?;
    println!("  request {id} answered: {}", cli::result_json(&result));

    println!("Step 5/5: shutting down.");
    bridge.stop().await;
    device.disconnect().await;
    println!("Outstanding requests: {}", correlator.outstanding());
    Ok(())
}
