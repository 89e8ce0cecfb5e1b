// Client defaults and environment/YAML configuration.
use courier_transport::{
    ConnectOptions, Credentials, Endpoint, Quality, ReconnectPolicy, SessionConfig,
};
use courier_wire::{Codec, DEFAULT_MAX_ENVELOPE_BYTES};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8883;
pub const DEFAULT_CLIENT_ID: &str = "basicPubSub";
pub const DEFAULT_REQUEST_CHANNEL: &str = "device/image/request";
pub const DEFAULT_RESPONSE_CHANNEL: &str = "device/image/response";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub(crate) const DEFAULT_MAX_PACKET_BYTES: usize = 256 * 1024;
pub(crate) const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub request_channel: String,
    pub response_channel: String,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub quality: Quality,
    pub log_level: String,
    pub max_envelope_bytes: usize,
    pub max_packet_bytes: usize,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    // How long a sent request waits for its response before it is forgotten.
    pub pending_ttl: Duration,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    ca_path: Option<PathBuf>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    request_channel: Option<String>,
    response_channel: Option<String>,
    proxy_host: Option<String>,
    proxy_port: Option<u16>,
    quality: Option<String>,
    log_level: Option<String>,
    max_envelope_bytes: Option<usize>,
    max_packet_bytes: Option<usize>,
    keep_alive_secs: Option<u64>,
    connect_timeout_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
    reconnect_max_attempts: Option<u32>,
    pending_ttl_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            ca_path: None,
            cert_path: None,
            key_path: None,
            request_channel: DEFAULT_REQUEST_CHANNEL.to_string(),
            response_channel: DEFAULT_RESPONSE_CHANNEL.to_string(),
            proxy_host: None,
            proxy_port: None,
            quality: Quality::AtLeastOnce,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            pending_ttl: DEFAULT_PENDING_TTL,
        }
    }
}

impl ClientConfig {
    /// Defaults, then `COURIER_*` variables, then the YAML file named by
    /// `config_path` or `COURIER_CLIENT_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path).map_err(|source| Error::Io {
                path: PathBuf::from(path),
                source,
            })?;
            let override_cfg: ClientConfigOverride = serde_yaml::from_str(&contents)
                .map_err(|err| Error::Config(format!("parse client config yaml {path}: {err}")))?;
            override_cfg.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_string_env("COURIER_HOST") {
            config.host = value;
        }
        if let Some(value) = read_parsed_env::<u16>("COURIER_PORT") {
            config.port = value;
        }
        if let Some(value) = read_string_env("COURIER_CLIENT_ID") {
            config.client_id = value;
        }
        if let Some(value) = read_string_env("COURIER_CA_PATH") {
            config.ca_path = Some(value.into());
        }
        if let Some(value) = read_string_env("COURIER_CERT_PATH") {
            config.cert_path = Some(value.into());
        }
        if let Some(value) = read_string_env("COURIER_KEY_PATH") {
            config.key_path = Some(value.into());
        }
        if let Some(value) = read_string_env("COURIER_REQUEST_CHANNEL") {
            config.request_channel = value;
        }
        if let Some(value) = read_string_env("COURIER_RESPONSE_CHANNEL") {
            config.response_channel = value;
        }
        if let Some(value) = read_string_env("COURIER_PROXY_HOST") {
            config.proxy_host = Some(value);
        }
        if let Some(value) = read_parsed_env::<u16>("COURIER_PROXY_PORT") {
            config.proxy_port = Some(value);
        }
        if let Some(value) = read_string_env("COURIER_QUALITY").and_then(|v| Quality::parse(&v)) {
            config.quality = value;
        }
        if let Some(value) = read_string_env("COURIER_LOG_LEVEL") {
            config.log_level = value;
        }
        if let Some(value) = read_parsed_env::<usize>("COURIER_MAX_ENVELOPE_BYTES") {
            config.max_envelope_bytes = value;
        }
        if let Some(value) = read_parsed_env::<usize>("COURIER_MAX_PACKET_BYTES") {
            config.max_packet_bytes = value;
        }
        if let Some(value) = read_parsed_env::<u64>("COURIER_KEEP_ALIVE_SECS") {
            config.keep_alive = Duration::from_secs(value);
        }
        if let Some(value) = read_parsed_env::<u64>("COURIER_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_parsed_env::<u64>("COURIER_ACK_TIMEOUT_MS") {
            config.ack_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_parsed_env::<u64>("COURIER_RECONNECT_INITIAL_MS") {
            config.reconnect.initial_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_parsed_env::<u64>("COURIER_RECONNECT_MAX_MS") {
            config.reconnect.max_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_parsed_env::<f64>("COURIER_RECONNECT_MULTIPLIER") {
            config.reconnect.multiplier = value;
        }
        // Zero is meaningful here: never retry after a drop.
        if let Some(value) = read_env::<u32>("COURIER_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = Some(value);
        }
        if let Some(value) = read_parsed_env::<u64>("COURIER_PENDING_TTL_SECS") {
            config.pending_ttl = Duration::from_secs(value);
        }
        config
    }

    /// Checks the cross-field rules; run again after applying flag overrides.
    pub fn validate(&self) -> Result<()> {
        if self.request_channel == self.response_channel {
            return Err(Error::Config(format!(
                "request and response channels must differ (both are {})",
                self.request_channel
            )));
        }
        if self.proxy_port.is_some() && self.proxy_host.is_none() {
            return Err(Error::Config("proxy_port is set without proxy_host".to_string()));
        }
        self.credentials()
            .check()
            .map_err(|reason| Error::Config(reason.to_string()))?;
        Ok(())
    }

    pub fn codec(&self) -> Codec {
        Codec::new(self.max_envelope_bytes)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new(
            self.client_id.clone(),
            Endpoint::new(self.host.clone(), self.port),
        );
        options.credentials = self.credentials();
        options.keep_alive = self.keep_alive;
        options.max_packet_bytes = self.max_packet_bytes;
        // Plain HTTP CONNECT proxies conventionally listen on 8080.
        options.proxy = self
            .proxy_host
            .as_ref()
            .map(|host| Endpoint::new(host.clone(), self.proxy_port.unwrap_or(8080)));
        options
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            ca: self.ca_path.clone(),
            cert: self.cert_path.clone(),
            key: self.key_path.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
            reconnect: self.reconnect.clone(),
            subscribe_quality: self.quality,
        }
    }
}

impl ClientConfigOverride {
    fn apply(self, config: &mut ClientConfig) {
        if let Some(value) = self.host
            && !value.is_empty()
        {
            config.host = value;
        }
        if let Some(value) = self.port
            && value > 0
        {
            config.port = value;
        }
        if let Some(value) = self.client_id
            && !value.is_empty()
        {
            config.client_id = value;
        }
        if let Some(value) = self.ca_path {
            config.ca_path = Some(value);
        }
        if let Some(value) = self.cert_path {
            config.cert_path = Some(value);
        }
        if let Some(value) = self.key_path {
            config.key_path = Some(value);
        }
        if let Some(value) = self.request_channel
            && !value.is_empty()
        {
            config.request_channel = value;
        }
        if let Some(value) = self.response_channel
            && !value.is_empty()
        {
            config.response_channel = value;
        }
        if let Some(value) = self.proxy_host
            && !value.is_empty()
        {
            config.proxy_host = Some(value);
        }
        if let Some(value) = self.proxy_port
            && value > 0
        {
            config.proxy_port = Some(value);
        }
        if let Some(value) = self.quality
            && let Some(parsed) = Quality::parse(&value)
        {
            config.quality = parsed;
        }
        if let Some(value) = self.log_level
            && !value.is_empty()
        {
            config.log_level = value;
        }
        if let Some(value) = self.max_envelope_bytes
            && value > 0
        {
            config.max_envelope_bytes = value;
        }
        if let Some(value) = self.max_packet_bytes
            && value > 0
        {
            config.max_packet_bytes = value;
        }
        if let Some(value) = self.keep_alive_secs
            && value > 0
        {
            config.keep_alive = Duration::from_secs(value);
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            config.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.ack_timeout_ms
            && value > 0
        {
            config.ack_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.reconnect_initial_ms
            && value > 0
        {
            config.reconnect.initial_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.reconnect_max_ms
            && value > 0
        {
            config.reconnect.max_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.reconnect_multiplier
            && value > 0.0
        {
            config.reconnect.multiplier = value;
        }
        if let Some(value) = self.reconnect_max_attempts {
            config.reconnect.max_attempts = Some(value);
        }
        if let Some(value) = self.pending_ttl_secs
            && value > 0
        {
            config.pending_ttl = Duration::from_secs(value);
        }
    }
}

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse::<T>().ok())
}

// Zero and negative values mean "unset" for every numeric key that reads
// through here.
fn read_parsed_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    read_env::<T>(key).filter(|value| *value > T::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ENV_KEYS: &[&str] = &[
        "COURIER_CLIENT_CONFIG",
        "COURIER_HOST",
        "COURIER_PORT",
        "COURIER_CLIENT_ID",
        "COURIER_QUALITY",
        "COURIER_RECONNECT_MAX_ATTEMPTS",
        "COURIER_ACK_TIMEOUT_MS",
        "COURIER_CA_PATH",
        "COURIER_CERT_PATH",
        "COURIER_KEY_PATH",
    ];

    struct EnvGuard;

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            unsafe {
                for key in ENV_KEYS {
                    std::env::remove_var(key);
                }
            }
        }
    }

    #[test]
    #[serial_test::serial]
    fn defaults_match_the_device_script() {
        let _env_guard = EnvGuard;
        let config = ClientConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id, "basicPubSub");
        assert_eq!(config.request_channel, "device/image/request");
        assert_eq!(config.response_channel, "device/image/response");
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.quality, Quality::AtLeastOnce);
        assert_eq!(config.max_envelope_bytes, 128 * 1024);
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_defaults_and_ignores_zero() {
        let _env_guard = EnvGuard;
        unsafe {
            std::env::set_var("COURIER_HOST", "iot.example.com");
            std::env::set_var("COURIER_PORT", "0");
            std::env::set_var("COURIER_CLIENT_ID", "cam-7");
            std::env::set_var("COURIER_QUALITY", "at_most_once");
            std::env::set_var("COURIER_RECONNECT_MAX_ATTEMPTS", "5");
        }
        let config = ClientConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(config.host, "iot.example.com");
        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id, "cam-7");
        assert_eq!(config.quality, Quality::AtMostOnce);
        assert_eq!(config.reconnect.max_attempts, Some(5));
    }

    #[test]
    #[serial_test::serial]
    fn yaml_overrides_env() {
        let _env_guard = EnvGuard;
        unsafe {
            std::env::set_var("COURIER_ACK_TIMEOUT_MS", "500");
            std::env::set_var("COURIER_CLIENT_ID", "from-env");
        }
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "client_id: from-yaml\nport: 1883\nmax_envelope_bytes: 0\nproxy_host: proxy.local\nresponse_channel: results/cam"
        )
        .expect("write");
        let path = file.path().to_str().expect("utf8 path").to_string();
        let config = ClientConfig::from_env_or_yaml(Some(&path)).expect("config");
        assert_eq!(config.client_id, "from-yaml");
        assert_eq!(config.port, 1883);
        assert_eq!(config.max_envelope_bytes, DEFAULT_MAX_ENVELOPE_BYTES);
        assert_eq!(config.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.response_channel, "results/cam");

        let options = config.connect_options();
        assert_eq!(options.client_id, "from-yaml");
        assert_eq!(options.proxy, Some(Endpoint::new("proxy.local", 8080)));
    }

    #[test]
    #[serial_test::serial]
    fn config_path_from_env_var() {
        let _env_guard = EnvGuard;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "host: broker.internal").expect("write");
        unsafe {
            std::env::set_var("COURIER_CLIENT_CONFIG", file.path());
        }
        let config = ClientConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(config.host, "broker.internal");
    }

    #[test]
    #[serial_test::serial]
    fn unreadable_or_invalid_yaml_is_an_error() {
        let _env_guard = EnvGuard;
        let err = ClientConfig::from_env_or_yaml(Some("/nonexistent/courier.yaml"))
            .expect_err("missing");
        assert!(matches!(err, Error::Io { .. }));

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "port: [not, a, port]").expect("write");
        let path = file.path().to_str().expect("utf8 path").to_string();
        let err = ClientConfig::from_env_or_yaml(Some(&path)).expect_err("invalid");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[serial_test::serial]
    fn identical_channels_are_rejected() {
        let _env_guard = EnvGuard;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "response_channel: device/image/request").expect("write");
        let path = file.path().to_str().expect("utf8 path").to_string();
        let err = ClientConfig::from_env_or_yaml(Some(&path)).expect_err("same channel");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn session_config_carries_timeouts() {
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(3),
            ack_timeout: Duration::from_secs(4),
            ..ClientConfig::default()
        };
        let session = config.session_config();
        assert_eq!(session.connect_timeout, Duration::from_secs(3));
        assert_eq!(session.ack_timeout, Duration::from_secs(4));
        assert_eq!(config.codec().max_envelope_bytes(), DEFAULT_MAX_ENVELOPE_BYTES);
    }

    #[test]
    #[serial_test::serial]
    fn zero_reconnect_attempts_is_kept() {
        let _env_guard = EnvGuard;
        unsafe {
            std::env::set_var("COURIER_RECONNECT_MAX_ATTEMPTS", "0");
        }
        let config = ClientConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(config.reconnect.max_attempts, Some(0));
    }

    #[test]
    #[serial_test::serial]
    fn client_material_without_ca_is_rejected() {
        let _env_guard = EnvGuard;
        unsafe {
            std::env::set_var("COURIER_CERT_PATH", "/etc/courier/device.pem.crt");
            std::env::set_var("COURIER_KEY_PATH", "/etc/courier/device.private.key");
        }
        let err = ClientConfig::from_env_or_yaml(None).expect_err("no ca");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[serial_test::serial]
    fn certificate_without_key_is_rejected() {
        let _env_guard = EnvGuard;
        unsafe {
            std::env::set_var("COURIER_CA_PATH", "/etc/courier/root-CA.crt");
            std::env::set_var("COURIER_CERT_PATH", "/etc/courier/device.pem.crt");
        }
        let err = ClientConfig::from_env_or_yaml(None).expect_err("no key");
        assert!(matches!(err, Error::Config(_)));

        unsafe {
            std::env::set_var("COURIER_KEY_PATH", "/etc/courier/device.private.key");
        }
        let config = ClientConfig::from_env_or_yaml(None).expect("full credentials");
        assert_eq!(
            config.connect_options().credentials.key,
            Some(PathBuf::from("/etc/courier/device.private.key"))
        );
    }
}
