use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------- Errors ----------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------- Data structures ----------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    pub delay: DelayConfig,
    pub messages: MessagesConfig,
    pub logging: LoggingConfig,
    pub honeypot_logging: HoneypotLoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Where the decoy listens for connections.
    pub host: String,
    pub port: u16,
    /// Hard cap on concurrent live sessions.
    pub max_connections: usize,
    pub read_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Mirror a real server's status payload instead of the synthesized one.
    pub enabled: bool,
    /// IP, host:port, bare hostname, or a name carrying minecraft SRV records.
    pub address: String,
    pub sync_interval_secs: u64,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub retry_interval_secs: u64,
    /// Replace version.name / version.protocol in mirrored payloads.
    pub override_version: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admitted requests per second from a single source address.
    pub ip_limit: u32,
    /// Admitted requests per second across all sources.
    pub global_limit: u32,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    pub base_delay_ms: u64,
    pub max_ip_penalty_ms: u64,
    pub max_global_penalty_ms: u64,
    pub ip_frequency_factor: f64,
    pub global_load_factor: f64,
    pub ip_rate_multiplier: f64,
    pub global_rate_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub motd: String,
    pub kick_message: String,
    pub version_name: String,
    pub protocol_version: i32,
    pub max_players: u32,
    pub online_players: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HoneypotLoggingConfig {
    pub enabled: bool,
    pub file_path: String,
    /// "json" (one object per line) or "csv".
    pub format: String,
    /// Rotate the event file after this many megabytes.
    pub max_size: u64,
    pub max_backups: usize,
    /// Prune rotated files older than this many days. 0 keeps them forever.
    pub max_age: u64,
    pub compress: bool,
}

// ---------- Defaults ----------

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 25565,
            max_connections: 10_000,
            read_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            sync_interval_secs: 60,
            timeout_secs: 5,
            retry_count: 3,
            retry_interval_secs: 5,
            override_version: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip_limit: 5,
            global_limit: 100,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_ip_penalty_ms: 5_000,
            max_global_penalty_ms: 2_000,
            ip_frequency_factor: 1.5,
            global_load_factor: 1.2,
            ip_rate_multiplier: 2.0,
            global_rate_multiplier: 1.5,
        }
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            motd: "§6A Minecraft Server".to_string(),
            kick_message: "§cServer is under maintenance. Try again later.".to_string(),
            version_name: "1.20.6".to_string(),
            protocol_version: 766,
            max_players: 100,
            online_players: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for HoneypotLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_path: "honeypot_events.log".to_string(),
            format: "json".to_string(),
            max_size: 100,
            max_backups: 5,
            max_age: 30,
            compress: false,
        }
    }
}

// ---------- Duration accessors ----------

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl UpstreamConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl RateLimitConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl DelayConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_ip_penalty(&self) -> Duration {
        Duration::from_millis(self.max_ip_penalty_ms)
    }

    pub fn max_global_penalty(&self) -> Duration {
        Duration::from_millis(self.max_global_penalty_ms)
    }
}

// ---------- Loading ----------

impl Config {
    /// Loads and validates the YAML configuration. A missing file is
    /// materialized from the default template; a malformed file is fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "config file {} not found, writing the default template",
                    path.display()
                );
                let template = default_config();
                fs::write(path, &template)?;
                template
            }
            Err(err) => return Err(err.into()),
        };

        let config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be nonzero".into()));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be at least 1".into(),
            ));
        }
        if self.rate_limit.ip_limit == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.ip_limit must be at least 1".into(),
            ));
        }
        if self.rate_limit.global_limit == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.global_limit must be at least 1".into(),
            ));
        }
        if self.delay.ip_frequency_factor <= 0.0 {
            return Err(ConfigError::Invalid(
                "delay.ip_frequency_factor must be positive".into(),
            ));
        }
        if self.delay.global_load_factor <= 0.0 {
            return Err(ConfigError::Invalid(
                "delay.global_load_factor must be positive".into(),
            ));
        }
        if self.messages.protocol_version < 1 {
            return Err(ConfigError::Invalid(
                "messages.protocol_version must be positive".into(),
            ));
        }
        match self.honeypot_logging.format.to_ascii_lowercase().as_str() {
            "json" | "csv" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "honeypot_logging.format must be json or csv, got {:?}",
                    other
                )))
            }
        }
        if self.upstream.enabled && self.upstream.address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.address is required when upstream.enabled is set".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

// A default config for first runs, so the binary comes up with something
// sensible instead of refusing to start.
fn default_config() -> String {
    r#"# minetrap configuration

server:
  host: "0.0.0.0"
  port: 25565
  # Hard cap on concurrent live sessions.
  max_connections: 10000
  read_timeout_secs: 30
  idle_timeout_secs: 600

# Mirror a real server so the decoy is indistinguishable from it.
upstream:
  enabled: false
  # IP, host:port, or a hostname carrying _minecraft._tcp SRV records.
  address: ""
  sync_interval_secs: 60
  timeout_secs: 5
  retry_count: 3
  retry_interval_secs: 5
  override_version: false

rate_limit:
  # Admitted requests per second from a single source address.
  ip_limit: 5
  # Admitted requests per second across all sources.
  global_limit: 100
  cleanup_interval_secs: 60

delay:
  base_delay_ms: 100
  max_ip_penalty_ms: 5000
  max_global_penalty_ms: 2000
  ip_frequency_factor: 1.5
  global_load_factor: 1.2
  ip_rate_multiplier: 2.0
  global_rate_multiplier: 1.5

messages:
  motd: "§6A Minecraft Server"
  kick_message: "§cServer is under maintenance. Try again later."
  version_name: "1.20.6"
  protocol_version: 766
  max_players: 100
  online_players: 0

logging:
  level: "info"

honeypot_logging:
  enabled: false
  file_path: "honeypot_events.log"
  # json (one object per line) or csv
  format: "json"
  # Rotate after this many megabytes; keep max_backups rotated files
  # and prune anything older than max_age days.
  max_size: 100
  max_backups: 5
  max_age: 30
  compress: false
"#
    .to_string()
}
