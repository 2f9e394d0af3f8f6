// ===========================================
// Honeypot event sink
// ===========================================
// Structured records of everything the decoy observes, appended to a
// rotated file as JSON lines or CSV. Deliberately omitted: packet
// bytes, kick messages, and connection identifiers. The file exists
// for forensic counting, not replay.
use crate::config_loader::HoneypotLoggingConfig;
use crate::rotate::RotatingWriter;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

pub const CSV_HEADER: [&str; 13] = [
    "timestamp",
    "client_ip",
    "event_type",
    "protocol_version",
    "server_address",
    "server_port",
    "next_state",
    "username",
    "delay_applied_ms",
    "ip_frequency",
    "error_message",
    "user_agent",
    "geo_location",
];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event log i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode event row: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connection,
    Handshake,
    LoginAttempt,
    StatusQuery,
    ProtocolViolation,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connection => "connection",
            EventKind::Handshake => "handshake",
            EventKind::LoginAttempt => "login_attempt",
            EventKind::StatusQuery => "status_query",
            EventKind::ProtocolViolation => "protocol_violation",
        }
    }
}

/// One observed interaction. Absent fields are omitted in JSON mode and
/// written as empty / zero columns in CSV mode.
#[derive(Debug, Clone, Serialize)]
pub struct HoneypotEvent {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub event_type: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_state: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_applied_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_frequency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_location: Option<String>,
}

impl HoneypotEvent {
    fn new(client_ip: &str, event_type: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            event_type,
            protocol_version: None,
            server_address: None,
            server_port: None,
            next_state: None,
            username: None,
            delay_applied_ms: None,
            ip_frequency: None,
            error_message: None,
            user_agent: None,
            geo_location: None,
        }
    }

    pub fn connection(client_ip: &str, delay_ms: u64, ip_frequency: f64) -> Self {
        Self {
            delay_applied_ms: Some(delay_ms),
            ip_frequency: Some(ip_frequency),
            ..Self::new(client_ip, EventKind::Connection)
        }
    }

    pub fn handshake(
        client_ip: &str,
        protocol_version: i32,
        server_address: &str,
        server_port: u16,
        next_state: i32,
    ) -> Self {
        Self {
            protocol_version: Some(protocol_version),
            server_address: Some(server_address.to_string()),
            server_port: Some(server_port),
            next_state: Some(next_state),
            ..Self::new(client_ip, EventKind::Handshake)
        }
    }

    pub fn login_attempt(client_ip: &str, username: &str, delay_ms: u64, ip_frequency: f64) -> Self {
        Self {
            username: Some(username.to_string()),
            delay_applied_ms: Some(delay_ms),
            ip_frequency: Some(ip_frequency),
            ..Self::new(client_ip, EventKind::LoginAttempt)
        }
    }

    pub fn status_query(
        client_ip: &str,
        protocol_version: Option<i32>,
        server_address: Option<&str>,
        server_port: Option<u16>,
    ) -> Self {
        Self {
            protocol_version,
            server_address: server_address.map(str::to_string),
            server_port,
            next_state: Some(1),
            ..Self::new(client_ip, EventKind::StatusQuery)
        }
    }

    pub fn protocol_violation(client_ip: &str, error_message: &str) -> Self {
        Self {
            error_message: Some(error_message.to_string()),
            ..Self::new(client_ip, EventKind::ProtocolViolation)
        }
    }

    fn csv_record(&self) -> [String; 13] {
        [
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.client_ip.clone(),
            self.event_type.as_str().to_string(),
            self.protocol_version.unwrap_or(0).to_string(),
            self.server_address.clone().unwrap_or_default(),
            self.server_port.unwrap_or(0).to_string(),
            self.next_state.unwrap_or(0).to_string(),
            self.username.clone().unwrap_or_default(),
            self.delay_applied_ms.unwrap_or(0).to_string(),
            format!("{:.2}", self.ip_frequency.unwrap_or(0.0)),
            self.error_message.clone().unwrap_or_default(),
            self.user_agent.clone().unwrap_or_default(),
            self.geo_location.clone().unwrap_or_default(),
        ]
    }
}

enum SinkWriter {
    Json(RotatingWriter),
    Csv(csv::Writer<RotatingWriter>),
}

/// The event sink. Either disabled (every log call is a no-op) or
/// attached to a rotated writer; at most one event is in flight to the
/// file at a time.
pub struct HoneypotLogger {
    sink: Option<Mutex<SinkWriter>>,
}

impl HoneypotLogger {
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn from_config(config: &HoneypotLoggingConfig) -> Result<Self, SinkError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let writer = RotatingWriter::open(
            Path::new(&config.file_path),
            config.max_size,
            config.max_backups,
            config.max_age,
            config.compress,
        )?;
        let sink = match config.format.to_ascii_lowercase().as_str() {
            "csv" => {
                let mut csv_writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(writer);
                csv_writer.write_record(CSV_HEADER)?;
                csv_writer.flush()?;
                SinkWriter::Csv(csv_writer)
            }
            _ => SinkWriter::Json(writer),
        };
        Ok(Self {
            sink: Some(Mutex::new(sink)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Appends one event. Errors are returned to the caller, whose path
    /// decides whether to continue (it always does).
    pub fn log_event(&self, event: &HoneypotEvent) -> Result<(), SinkError> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let mut sink = sink.lock().unwrap();
        match &mut *sink {
            SinkWriter::Json(writer) => {
                let mut line = serde_json::to_vec(event)?;
                line.push(b'\n');
                writer.write_all(&line)?;
                writer.flush()?;
            }
            SinkWriter::Csv(writer) => {
                writer.write_record(&event.csv_record())?;
                writer.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_loader::HoneypotLoggingConfig;
    use std::fs;

    fn sink_config(path: &Path, format: &str) -> HoneypotLoggingConfig {
        HoneypotLoggingConfig {
            enabled: true,
            file_path: path.to_string_lossy().into_owned(),
            format: format.to_string(),
            ..HoneypotLoggingConfig::default()
        }
    }

    #[test]
    fn disabled_sink_swallows_events() {
        let logger = HoneypotLogger::disabled();
        assert!(!logger.is_enabled());
        logger
            .log_event(&HoneypotEvent::connection("198.51.100.1", 100, 0.0))
            .unwrap();
    }

    #[test]
    fn json_lines_omit_absent_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let logger = HoneypotLogger::from_config(&sink_config(&path, "json")).unwrap();

        logger
            .log_event(&HoneypotEvent::handshake("198.51.100.1", 766, "mc.example.com", 25565, 2))
            .unwrap();
        logger
            .log_event(&HoneypotEvent::login_attempt("198.51.100.1", "alice", 137, 2.5))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let handshake: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(handshake["event_type"], "handshake");
        assert_eq!(handshake["protocol_version"], 766);
        assert_eq!(handshake["next_state"], 2);
        assert!(handshake.get("username").is_none());
        assert!(handshake.get("error_message").is_none());

        let login: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(login["event_type"], "login_attempt");
        assert_eq!(login["username"], "alice");
        assert_eq!(login["delay_applied_ms"], 137);
        assert!(login.get("server_address").is_none());
    }

    #[test]
    fn csv_file_has_the_header_and_thirteen_columns_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");
        let logger = HoneypotLogger::from_config(&sink_config(&path, "csv")).unwrap();

        logger
            .log_event(&HoneypotEvent::handshake("198.51.100.1", 766, "mc.example.com", 25565, 1))
            .unwrap();
        logger
            .log_event(&HoneypotEvent::protocol_violation(
                "203.0.113.9",
                "frame length 600 exceeds 512 byte window, dropped",
            ))
            .unwrap();
        logger
            .log_event(&HoneypotEvent::login_attempt("198.51.100.1", "alice", 0, 0.0))
            .unwrap();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 4);
        for row in &rows {
            assert_eq!(row.len(), 13);
        }
        assert_eq!(rows[0].iter().collect::<Vec<_>>(), CSV_HEADER.to_vec());

        // numeric zero fields are emitted, not blanked
        assert_eq!(&rows[3][8], "0");
        assert_eq!(&rows[3][9], "0.00");
        // a comma inside a field must not change the column count
        assert!(rows[1][10].contains("exceeds"));
    }
}
