// Tracing setup shared by the edge binaries.
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a fmt subscriber. `RUST_LOG` wins over `default_level`; an
/// unparsable level falls back to `info`.
pub fn init_observability(default_level: &str) {
    let filter = build_filter(default_level);
    let fmt_layer = tracing_subscriber::fmt::layer();
    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
    {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
