// ===========================================
// Upstream status mirror
// ===========================================
// Periodically performs a real status exchange against the configured
// server and caches the raw payload byte-for-byte, so the decoy serves
// exactly what the genuine server would. When the upstream is down the
// last good payload is rewritten once to advertise zero online players.
use crate::codec;
use crate::config_loader::Config;
use hickory_resolver::TokioAsyncResolver;
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

const DEFAULT_MINECRAFT_PORT: u16 = 25565;
// status payloads run a few KiB; favicons push them toward 64 KiB
const MAX_STATUS_PAYLOAD: usize = 2 * 1024 * 1024;

pub struct UpstreamMirror {
    config: Arc<Config>,
    cached_response: RwLock<Arc<Vec<u8>>>,
    unavailable: AtomicBool,
}

impl UpstreamMirror {
    /// Seeds the cache with a payload synthesized from static
    /// configuration. If mirroring is disabled this seed is the
    /// permanent answer.
    pub fn new(config: Arc<Config>) -> Self {
        let seed = default_status_payload(&config);
        Self {
            config,
            cached_response: RwLock::new(Arc::new(seed)),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Snapshot of the current payload. Callers that hold it across
    /// further polls see the payload from the moment of the call.
    pub fn raw_response(&self) -> Arc<Vec<u8>> {
        self.cached_response.read().unwrap().clone()
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Relaxed)
    }

    /// Poller loop. Syncs immediately, then once per configured
    /// interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.upstream.enabled {
            info!("upstream mirroring disabled, serving the synthesized status payload");
            return;
        }
        info!(
            "starting upstream status sync against {} every {}s",
            self.config.upstream.address, self.config.upstream.sync_interval_secs
        );

        self.sync_once().await;
        let mut ticker = tokio::time::interval(self.config.upstream.sync_interval());
        ticker.tick().await; // the immediate tick; the sync above covered it
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn sync_once(&self) {
        let started = Instant::now();
        let (host, port) = match self.resolve_address().await {
            Ok(resolved) => resolved,
            Err(err) => {
                if !self.is_unavailable() {
                    warn!("failed to resolve upstream address: {}", err);
                }
                self.mark_offline();
                return;
            }
        };

        let mut last_err = None;
        for attempt in 0..=self.config.upstream.retry_count {
            if attempt > 0 {
                debug!("retrying upstream sync (attempt {})", attempt);
                tokio::time::sleep(self.config.upstream.retry_interval()).await;
            }
            match self.ping_upstream(&host, port).await {
                Ok(payload) => {
                    self.store_payload(payload);
                    info!(
                        "upstream sync ok ({}:{}, {} ms)",
                        host,
                        port,
                        started.elapsed().as_millis()
                    );
                    return;
                }
                Err(err) => {
                    debug!("upstream sync attempt {} failed: {}", attempt, err);
                    last_err = Some(err);
                }
            }
        }

        if !self.is_unavailable() {
            warn!(
                "upstream sync exhausted {} retries against {}:{}: {}",
                self.config.upstream.retry_count,
                host,
                port,
                last_err.map(|e| e.to_string()).unwrap_or_default()
            );
        }
        self.mark_offline();
    }

    /// Splits `host:port` when an explicit port is given; a bare name
    /// is resolved through minecraft SRV records first and falls back
    /// to the default port.
    async fn resolve_address(&self) -> Result<(String, u16), String> {
        let address = self.config.upstream.address.trim();
        if address.is_empty() {
            return Err("upstream address is empty".to_string());
        }
        if let Some((host, port)) = address.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Ok((host.to_string(), port));
            }
        }
        match lookup_minecraft_srv(address).await {
            Some((host, port)) => Ok((host, port)),
            None => Ok((address.to_string(), DEFAULT_MINECRAFT_PORT)),
        }
    }

    /// One "ping and list" exchange: handshake with next_state=1, a
    /// status request, then the status response.
    async fn ping_upstream(&self, host: &str, port: u16) -> io::Result<Vec<u8>> {
        timeout(self.config.upstream.timeout(), self.ping_inner(host, port))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream ping timed out"))?
    }

    async fn ping_inner(&self, host: &str, port: u16) -> io::Result<Vec<u8>> {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let handshake =
            build_handshake_packet(host, self.config.messages.protocol_version, port);
        stream.write_all(&handshake).await?;
        stream.write_all(&build_status_request_packet()).await?;
        stream.flush().await?;

        read_status_response(&mut stream).await
    }

    fn store_payload(&self, raw: Vec<u8>) {
        let payload = if self.config.upstream.override_version {
            match apply_version_override(
                &raw,
                &self.config.messages.version_name,
                self.config.messages.protocol_version,
            ) {
                Ok(rewritten) => rewritten,
                Err(err) => {
                    warn!("version override failed, keeping the raw payload: {}", err);
                    raw
                }
            }
        } else {
            raw
        };
        *self.cached_response.write().unwrap() = Arc::new(payload);
        self.unavailable.store(false, Ordering::Relaxed);
    }

    /// Degrades the cache exactly once per outage: the last good
    /// payload keeps its version fields but advertises zero players.
    fn mark_offline(&self) {
        if self.unavailable.swap(true, Ordering::Relaxed) {
            return;
        }
        let current = self.raw_response();
        match zero_online_players(&current) {
            Ok(rewritten) => {
                *self.cached_response.write().unwrap() = Arc::new(rewritten);
                info!("upstream unavailable, advertising zero online players");
            }
            Err(err) => {
                warn!("failed to rewrite cached payload for the outage: {}", err);
            }
        }
    }
}

// ===========================================
// Address resolution
// ===========================================

async fn lookup_minecraft_srv(host: &str) -> Option<(String, u16)> {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(err) => {
            debug!("system resolver unavailable: {}", err);
            return None;
        }
    };
    match resolver
        .srv_lookup(format!("_minecraft._tcp.{}", host))
        .await
    {
        Ok(lookup) => lookup.iter().next().map(|srv| {
            let mut target = srv.target().to_utf8();
            if target.ends_with('.') {
                target.pop();
            }
            (target, srv.port())
        }),
        Err(err) => {
            debug!("srv lookup for {} failed: {}", host, err);
            None
        }
    }
}

// ===========================================
// Outbound packet builders / readers
// ===========================================

/// [VarInt len][id 0x00][VarInt protocol][String address][u16 port][VarInt 1]
fn build_handshake_packet(server_address: &str, protocol_version: i32, port: u16) -> Vec<u8> {
    let mut body = Vec::new();
    codec::write_varint(protocol_version, &mut body);
    codec::write_string(server_address, &mut body);
    codec::write_u16_be(port, &mut body);
    codec::write_varint(1, &mut body);
    codec::frame_packet(0x00, &body)
}

fn build_status_request_packet() -> Vec<u8> {
    codec::frame_packet(0x00, &[])
}

/// Reads [VarInt len][id 0x00][VarInt json_len][json bytes] and returns
/// the JSON bytes untouched.
async fn read_status_response(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let packet_len = codec::read_varint_async(stream)
        .await
        .map_err(invalid_data)? as usize;
    if packet_len == 0 || packet_len > MAX_STATUS_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "implausible status response length",
        ));
    }
    let mut packet = vec![0u8; packet_len];
    stream.read_exact(&mut packet).await?;

    let mut cursor = Cursor::new(packet.as_slice());
    let packet_id = codec::read_varint(&mut cursor).map_err(invalid_data)?;
    if packet_id != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected packet id in status response",
        ));
    }
    let json_len = codec::read_varint(&mut cursor).map_err(invalid_data)? as usize;
    let offset = cursor.position() as usize;
    if json_len > packet.len() - offset {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "status response json overruns the frame",
        ));
    }
    Ok(packet[offset..offset + json_len].to_vec())
}

fn invalid_data(err: codec::CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

// ===========================================
// Payload rewriting
// ===========================================

fn default_status_payload(config: &Config) -> Vec<u8> {
    let messages = &config.messages;
    serde_json::to_vec(&json!({
        "version": { "name": messages.version_name, "protocol": messages.protocol_version },
        "players": { "max": messages.max_players, "online": messages.online_players },
        "description": { "text": messages.motd },
        "favicon": "",
    }))
    .unwrap_or_else(|_| {
        br#"{"version":{"name":"1.20.6","protocol":766},"players":{"max":100,"online":0},"description":{"text":"Minecraft Server"}}"#.to_vec()
    })
}

fn apply_version_override(
    raw: &[u8],
    version_name: &str,
    protocol_version: i32,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut root: Map<String, Value> = serde_json::from_slice(raw)?;
    match root.get_mut("version") {
        Some(Value::Object(version)) => {
            version.insert("name".to_string(), json!(version_name));
            version.insert("protocol".to_string(), json!(protocol_version));
        }
        _ => {
            root.insert(
                "version".to_string(),
                json!({ "name": version_name, "protocol": protocol_version }),
            );
        }
    }
    serde_json::to_vec(&root)
}

fn zero_online_players(raw: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let mut root: Map<String, Value> = serde_json::from_slice(raw)?;
    if let Some(Value::Object(players)) = root.get_mut("players") {
        players.insert("online".to_string(), json!(0));
    }
    serde_json::to_vec(&root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror_with(override_version: bool) -> UpstreamMirror {
        let mut config = Config::default();
        config.upstream.enabled = true;
        config.upstream.address = "mc.example.com".to_string();
        config.upstream.override_version = override_version;
        config.messages.version_name = "X".to_string();
        config.messages.protocol_version = 42;
        UpstreamMirror::new(Arc::new(config))
    }

    #[test]
    fn seed_payload_reflects_the_configured_messages() {
        let mut config = Config::default();
        config.messages.motd = "Hi there".to_string();
        config.messages.max_players = 64;
        config.messages.online_players = 3;
        let mirror = UpstreamMirror::new(Arc::new(config));

        let payload = mirror.raw_response();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["version"]["name"], "1.20.6");
        assert_eq!(value["version"]["protocol"], 766);
        assert_eq!(value["players"]["max"], 64);
        assert_eq!(value["players"]["online"], 3);
        assert_eq!(value["description"]["text"], "Hi there");
        assert_eq!(value["favicon"], "");
    }

    #[test]
    fn stored_payload_is_byte_identical_without_override() {
        let mirror = mirror_with(false);
        let upstream = br#"{"version": {"name": "Paper", "protocol": 765},  "players":{"max":100,"online":7},"description":{"text":"Hi"}}"#;
        mirror.store_payload(upstream.to_vec());
        assert_eq!(mirror.raw_response().as_slice(), upstream.as_slice());
        assert!(!mirror.is_unavailable());
    }

    #[test]
    fn version_override_rewrites_only_the_version_fields() {
        let mirror = mirror_with(true);
        let upstream =
            br#"{"version":{"name":"Paper","protocol":765},"players":{"max":100,"online":7},"description":{"text":"Hi"}}"#;
        mirror.store_payload(upstream.to_vec());

        let value: Value = serde_json::from_slice(&mirror.raw_response()).unwrap();
        assert_eq!(value["version"]["name"], "X");
        assert_eq!(value["version"]["protocol"], 42);
        assert_eq!(value["players"]["max"], 100);
        assert_eq!(value["players"]["online"], 7);
        assert_eq!(value["description"]["text"], "Hi");
    }

    #[test]
    fn version_override_adds_the_section_when_missing() {
        let rewritten =
            apply_version_override(br#"{"players":{"max":10,"online":1}}"#, "X", 42).unwrap();
        let value: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["version"]["name"], "X");
        assert_eq!(value["version"]["protocol"], 42);
        assert_eq!(value["players"]["max"], 10);
    }

    #[test]
    fn outage_rewrites_the_cache_exactly_once() {
        let mirror = mirror_with(false);
        let upstream =
            br#"{"version":{"name":"Paper","protocol":765},"players":{"max":100,"online":7},"description":{"text":"Hi"}}"#;
        mirror.store_payload(upstream.to_vec());

        mirror.mark_offline();
        assert!(mirror.is_unavailable());
        let degraded = mirror.raw_response();
        let value: Value = serde_json::from_slice(&degraded).unwrap();
        assert_eq!(value["players"]["online"], 0);
        assert_eq!(value["version"]["name"], "Paper");
        assert_eq!(value["version"]["protocol"], 765);

        // repeated failures leave the cache alone
        mirror.mark_offline();
        assert_eq!(mirror.raw_response().as_slice(), degraded.as_slice());

        // recovery overwrites normally and clears the flag
        mirror.store_payload(upstream.to_vec());
        assert!(!mirror.is_unavailable());
        assert_eq!(mirror.raw_response().as_slice(), upstream.as_slice());
    }

    #[test]
    fn handshake_packet_carries_status_intent() {
        let packet = build_handshake_packet("h", 766, 25565);
        let mut cursor = Cursor::new(packet.as_slice());
        let len = codec::read_varint(&mut cursor).unwrap() as usize;
        assert_eq!(len, packet.len() - 1);
        assert_eq!(codec::read_varint(&mut cursor).unwrap(), 0x00);
        assert_eq!(codec::read_varint(&mut cursor).unwrap(), 766);
        assert_eq!(codec::read_string(&mut cursor, 128).unwrap(), "h");
        assert_eq!(codec::read_u16_be(&mut cursor).unwrap(), 25565);
        assert_eq!(codec::read_varint(&mut cursor).unwrap(), 1);
    }
}
