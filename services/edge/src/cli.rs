// Connection flags and helpers shared by courier-pub and courier-sub.
use anyhow::{Context, Result};
use courier_client::{ClientConfig, InferenceResult, Quality, Session};
use courier_transport::MqttConnector;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Flags that override the loaded client configuration.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// YAML config file (defaults to $COURIER_CLIENT_CONFIG)
    #[arg(long)]
    pub config: Option<String>,

    /// Broker host
    #[arg(long)]
    pub host: Option<String>,

    /// Broker port
    #[arg(long)]
    pub port: Option<u16>,

    /// Client identity presented at connect
    #[arg(long)]
    pub client_id: Option<String>,

    /// CA certificate (PEM); enables TLS
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Client certificate (PEM)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Channel requests are published on
    #[arg(long)]
    pub request_channel: Option<String>,

    /// Channel results arrive on
    #[arg(long)]
    pub response_channel: Option<String>,

    /// Delivery quality: 0 (at most once) or 1 (at least once)
    #[arg(long, value_parser = parse_quality)]
    pub quality: Option<Quality>,

    /// HTTP CONNECT proxy host
    #[arg(long)]
    pub proxy_host: Option<String>,

    /// HTTP CONNECT proxy port (defaults to 8080)
    #[arg(long)]
    pub proxy_port: Option<u16>,

    /// Log level used when RUST_LOG is not set
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ConnectionArgs {
    pub fn load(&self) -> Result<ClientConfig> {
        let mut config =
            ClientConfig::from_env_or_yaml(self.config.as_deref()).context("load client config")?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(client_id) = &self.client_id {
            config.client_id = client_id.clone();
        }
        if let Some(ca) = &self.ca {
            config.ca_path = Some(ca.clone());
        }
        if let Some(cert) = &self.cert {
            config.cert_path = Some(cert.clone());
        }
        if let Some(key) = &self.key {
            config.key_path = Some(key.clone());
        }
        if let Some(channel) = &self.request_channel {
            config.request_channel = channel.clone();
        }
        if let Some(channel) = &self.response_channel {
            config.response_channel = channel.clone();
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(host) = &self.proxy_host {
            config.proxy_host = Some(host.clone());
        }
        if let Some(port) = self.proxy_port {
            config.proxy_port = Some(port);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config.validate().context("check connection flags")?;
        Ok(config)
    }
}

fn parse_quality(value: &str) -> std::result::Result<Quality, String> {
    Quality::parse(value).ok_or_else(|| format!("unknown quality {value:?}; use 0 or 1"))
}

/// An MQTT-backed session that has not connected yet.
pub fn session(config: &ClientConfig) -> Session {
    Session::new(Arc::new(MqttConnector::new()), config.session_config())
}

/// Connect `session` and log its state changes.
pub async fn open(session: &Session, config: &ClientConfig) -> Result<()> {
    session
        .connect(config.connect_options())
        .await
        .with_context(|| format!("connect to {}:{}", config.host, config.port))?;
    let mut state = session.watch_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            tracing::info!(state = %current, "connection state changed");
        }
    });
    Ok(())
}

pub async fn connect(config: &ClientConfig) -> Result<Session> {
    let session = session(config);
    open(&session, config).await?;
    Ok(session)
}

pub fn result_json(result: &InferenceResult) -> serde_json::Value {
    json!({
        "label": result.label,
        "confidence": result.confidence,
        "correlation_id": result.correlation_id.map(|id| id.to_string()),
    })
}
