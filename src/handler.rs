// ===========================================
// Protocol handler
// ===========================================
// Drives one connection through the handshake state machine:
//
//   (start) --accept--> Handshaking
//   Handshaking --next_state=1--> Status ----> (closed)
//   Handshaking --next_state=2--> Login  ----> (closed)
//   Handshaking --violation-----> (closed, event emitted)
//
// Every connection is one-shot. The decoy prefers to look functional:
// probes it cannot classify still get a status payload.
use crate::codec::{self, CodecError, MAX_PACKET_SIZE, MAX_STRING_LEN};
use crate::config_loader::Config;
use crate::honeypot_log::{HoneypotEvent, HoneypotLogger};
use crate::rate_limiter::RateLimiter;
use crate::server::{Connection, ConnectionState};
use crate::upstream::UpstreamMirror;
use log::{debug, warn};
use serde_json::json;
use std::io::{self, Cursor};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Deadline for the very first read of a session.
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Protocol versions the handshake validator accepts (1.8 onward, with
/// headroom for snapshots).
const MIN_PROTOCOL_VERSION: i32 = 47;
const MAX_PROTOCOL_VERSION: i32 = 1000;
/// Window for the best-effort writability probe.
const WRITABLE_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("read timed out")]
    Timeout,
}

/// Immutable once parsed from the first packet.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

/// What the opening bytes of a session turned out to be.
#[derive(Debug)]
pub(crate) enum FirstPacket {
    /// Declared frame length exceeds the read window. Silent rejection.
    Oversize(usize),
    /// A structurally valid handshake that failed validation.
    Violation(String),
    /// A valid handshake.
    Handshake { info: HandshakeInfo, consumed: usize },
    /// Packet id 0x00 but not a parseable handshake, or a single-byte
    /// opener. Some scanners start this way; answer with a status.
    StatusProbe,
    /// Packet id 0x01 with whatever payload arrived.
    LoosePing,
    /// Anything else.
    Unknown,
}

// ===========================================
// Session entry point
// ===========================================

pub async fn handle_session(
    mut stream: TcpStream,
    conn: &Connection,
    config: &Config,
    limiter: &RateLimiter,
    mirror: &UpstreamMirror,
    honeypot: &HoneypotLogger,
) -> Result<(), SessionError> {
    if let Err(denied) = limiter.allow(&conn.remote_ip) {
        debug!("session {}: admission denied ({:?})", conn.id, denied);
        return Ok(());
    }

    let delay = limiter.calculate_delay(&conn.remote_ip);
    tokio::time::sleep(delay).await;

    // one chunk into a fixed window; the handshake fits comfortably
    let mut chunk = vec![0u8; MAX_PACKET_SIZE];
    let n = match timeout(HANDSHAKE_READ_TIMEOUT, stream.read(&mut chunk)).await {
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(n)) => n,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => {
            debug!("session {}: handshake read timed out", conn.id);
            return Ok(());
        }
    };
    chunk.truncate(n);

    match classify_first_packet(&chunk) {
        FirstPacket::Oversize(declared) => {
            emit(
                honeypot,
                conn,
                HoneypotEvent::protocol_violation(
                    &conn.remote_ip,
                    &format!(
                        "frame length {} exceeds the {} byte window",
                        declared, MAX_PACKET_SIZE
                    ),
                ),
            );
            Ok(())
        }
        FirstPacket::Violation(reason) => {
            debug!("session {}: protocol violation: {}", conn.id, reason);
            emit(
                honeypot,
                conn,
                HoneypotEvent::protocol_violation(&conn.remote_ip, &reason),
            );
            Ok(())
        }
        FirstPacket::Handshake { info, consumed } => {
            debug!(
                "session {}: handshake protocol={} address={} port={} next_state={}",
                conn.id, info.protocol_version, info.server_address, info.server_port,
                info.next_state
            );
            emit(
                honeypot,
                conn,
                HoneypotEvent::handshake(
                    &conn.remote_ip,
                    info.protocol_version,
                    &info.server_address,
                    info.server_port,
                    info.next_state,
                ),
            );
            let leftover = chunk[consumed.min(chunk.len())..].to_vec();
            if info.next_state == 2 {
                conn.set_state(ConnectionState::Login);
                login_arm(&mut stream, conn, config, limiter, honeypot, leftover).await
            } else {
                conn.set_state(ConnectionState::Status);
                status_arm(&mut stream, conn, config, mirror, honeypot, Some(&info), leftover)
                    .await
            }
        }
        FirstPacket::StatusProbe | FirstPacket::Unknown => {
            conn.set_state(ConnectionState::Status);
            status_arm(&mut stream, conn, config, mirror, honeypot, None, Vec::new()).await
        }
        FirstPacket::LoosePing => loose_pong(&mut stream, &chunk).await,
    }
}

// ===========================================
// Classification
// ===========================================

pub(crate) fn classify_first_packet(chunk: &[u8]) -> FirstPacket {
    // lenient-compat rule: some scanners open with a single byte
    if chunk.len() == 1 {
        return FirstPacket::StatusProbe;
    }

    let header = codec::try_parse_frame_header(chunk).ok().flatten();
    if let Some((length, _)) = header {
        if length > MAX_PACKET_SIZE {
            return FirstPacket::Oversize(length);
        }
    }

    let packet_id = header.and_then(|(_, prefix_len)| chunk.get(prefix_len).copied());
    match packet_id {
        Some(0x00) => {
            if chunk.len() >= 7 {
                match parse_handshake(chunk) {
                    Ok((info, consumed)) => {
                        if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION)
                            .contains(&info.protocol_version)
                        {
                            return FirstPacket::Violation(format!(
                                "unsupported protocol version {}",
                                info.protocol_version
                            ));
                        }
                        if info.next_state != 1 && info.next_state != 2 {
                            return FirstPacket::Violation(format!(
                                "invalid next state {}",
                                info.next_state
                            ));
                        }
                        return FirstPacket::Handshake { info, consumed };
                    }
                    Err(err @ CodecError::FieldTooLong { .. }) => {
                        return FirstPacket::Violation(err.to_string());
                    }
                    // malformed packet id 0x00 content: suspected status probe
                    Err(_) => {}
                }
            }
            FirstPacket::StatusProbe
        }
        Some(0x01) => FirstPacket::LoosePing,
        _ => FirstPacket::Unknown,
    }
}

fn parse_handshake(chunk: &[u8]) -> Result<(HandshakeInfo, usize), CodecError> {
    let (frame_len, prefix_len) = match codec::try_parse_frame_header(chunk)? {
        Some(header) => header,
        None => return Err(CodecError::MalformedFrame("incomplete frame header")),
    };
    let consumed = (prefix_len + frame_len).min(chunk.len());

    let mut cursor = Cursor::new(chunk);
    let _frame_len = codec::read_varint(&mut cursor)?;
    let _packet_id = codec::read_varint(&mut cursor)?;
    let protocol_version = codec::read_varint(&mut cursor)?;
    let server_address = codec::read_string(&mut cursor, MAX_STRING_LEN)?;
    let server_port = codec::read_u16_be(&mut cursor)?;
    let next_state = codec::read_varint(&mut cursor)?;

    Ok((
        HandshakeInfo {
            protocol_version,
            server_address,
            server_port,
            next_state,
        },
        consumed,
    ))
}

// ===========================================
// Status arm
// ===========================================

#[allow(clippy::too_many_arguments)]
async fn status_arm(
    stream: &mut TcpStream,
    conn: &Connection,
    config: &Config,
    mirror: &UpstreamMirror,
    honeypot: &HoneypotLogger,
    info: Option<&HandshakeInfo>,
    leftover: Vec<u8>,
) -> Result<(), SessionError> {
    if !connection_writable(stream).await {
        return Ok(());
    }

    let payload = mirror.raw_response();
    let mut body = Vec::with_capacity(payload.len() + 5);
    codec::write_varint(payload.len() as i32, &mut body);
    body.extend_from_slice(&payload);
    stream.write_all(&codec::frame_packet(0x00, &body)).await?;
    stream.flush().await?;
    debug!("session {}: sent status response", conn.id);

    emit(
        honeypot,
        conn,
        HoneypotEvent::status_query(
            &conn.remote_ip,
            info.map(|i| i.protocol_version),
            info.map(|i| i.server_address.as_str()),
            info.map(|i| i.server_port),
        ),
    );

    // wait for a ping, tolerating repeated status requests
    let mut reader = FrameReader::new(leftover);
    loop {
        let frame = match reader.next_frame(stream, config.server.read_timeout()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(SessionError::Timeout) => {
                debug!("session {}: status arm idle, closing", conn.id);
                return Ok(());
            }
            Err(err) => {
                debug!("session {}: status arm read failed: {}", conn.id, err);
                return Ok(());
            }
        };
        match frame.packet_id {
            0x00 => debug!("session {}: extra status request", conn.id),
            0x01 => {
                let mut ts = [0u8; 8];
                if frame.body.len() >= 8 {
                    ts.copy_from_slice(&frame.body[..8]);
                } else {
                    for (i, byte) in ts.iter_mut().enumerate() {
                        *byte = i as u8;
                    }
                }
                if !connection_writable(stream).await {
                    return Ok(());
                }
                stream.write_all(&codec::frame_packet(0x01, &ts)).await?;
                stream.flush().await?;
                debug!("session {}: sent pong", conn.id);
                return Ok(());
            }
            other => {
                debug!(
                    "session {}: unexpected packet 0x{:02X} during status, closing",
                    conn.id, other
                );
                return Ok(());
            }
        }
    }
}

/// Answers a ping that arrived without any handshake. Echoes the
/// timestamp bytes when the peer sent them, otherwise the fixed
/// incrementing pattern.
async fn loose_pong(stream: &mut TcpStream, chunk: &[u8]) -> Result<(), SessionError> {
    let mut ts = [0u8; 8];
    if chunk.len() >= 10 {
        ts.copy_from_slice(&chunk[2..10]);
    } else {
        for (i, byte) in ts.iter_mut().enumerate() {
            *byte = i as u8;
        }
    }
    if !connection_writable(stream).await {
        return Ok(());
    }
    stream.write_all(&codec::frame_packet(0x01, &ts)).await?;
    stream.flush().await?;
    Ok(())
}

// ===========================================
// Login arm
// ===========================================

async fn login_arm(
    stream: &mut TcpStream,
    conn: &Connection,
    config: &Config,
    limiter: &RateLimiter,
    honeypot: &HoneypotLogger,
    leftover: Vec<u8>,
) -> Result<(), SessionError> {
    // the tar-pit: login sessions pay the adaptive delay a second time
    let delay = limiter.calculate_delay(&conn.remote_ip);
    tokio::time::sleep(delay).await;

    let mut reader = FrameReader::new(leftover);
    let username = match reader.next_frame(stream, config.server.read_timeout()).await {
        Ok(Some(frame)) if frame.packet_id == 0x00 => {
            parse_login_start(&frame.body).unwrap_or_default()
        }
        // unparseable or absent: the disconnect still goes out
        _ => String::new(),
    };

    if !connection_writable(stream).await {
        return Ok(());
    }
    let kick = json!({ "text": config.messages.kick_message }).to_string();
    let mut body = Vec::with_capacity(kick.len() + 5);
    codec::write_string(&kick, &mut body);
    if let Err(err) = stream.write_all(&codec::frame_packet(0x00, &body)).await {
        // the write failed, so no login_attempt is recorded for it
        debug!("session {}: disconnect write failed: {}", conn.id, err);
        return Ok(());
    }
    let _ = stream.flush().await;
    debug!("session {}: sent login disconnect to {:?}", conn.id, username);

    emit(
        honeypot,
        conn,
        HoneypotEvent::login_attempt(
            &conn.remote_ip,
            &username,
            delay.as_millis() as u64,
            limiter.ip_frequency(&conn.remote_ip),
        ),
    );
    Ok(())
}

fn parse_login_start(body: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(body);
    codec::read_string(&mut cursor, codec::MAX_GENERAL_STRING_LEN).ok()
}

// ===========================================
// Framed continuation reads
// ===========================================

struct Frame {
    packet_id: i32,
    body: Vec<u8>,
}

/// Reassembles length-prefixed frames from whatever the first chunk
/// left behind plus further socket reads.
struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    fn new(leftover: Vec<u8>) -> Self {
        Self { buffer: leftover }
    }

    async fn next_frame(
        &mut self,
        stream: &mut TcpStream,
        read_timeout: Duration,
    ) -> Result<Option<Frame>, SessionError> {
        loop {
            if let Some((length, prefix_len)) = codec::try_parse_frame_header(&self.buffer)? {
                if length > MAX_PACKET_SIZE {
                    return Err(CodecError::MalformedFrame("frame exceeds the read window").into());
                }
                if self.buffer.len() >= prefix_len + length {
                    let frame: Vec<u8> = self.buffer.drain(..prefix_len + length).collect();
                    let mut cursor = Cursor::new(&frame[prefix_len..]);
                    let packet_id = codec::read_varint(&mut cursor)?;
                    let body = frame[prefix_len + cursor.position() as usize..].to_vec();
                    return Ok(Some(Frame { packet_id, body }));
                }
            }

            let mut tmp = [0u8; 256];
            let n = match timeout(read_timeout, stream.read(&mut tmp)).await {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(SessionError::Timeout),
            };
            self.buffer.extend_from_slice(&tmp[..n]);
        }
    }
}

// ===========================================
// Small helpers
// ===========================================

/// Best-effort probe that the peer can still receive a response.
async fn connection_writable(stream: &TcpStream) -> bool {
    matches!(
        timeout(WRITABLE_PROBE_TIMEOUT, stream.writable()).await,
        Ok(Ok(()))
    )
}

fn emit(honeypot: &HoneypotLogger, conn: &Connection, event: HoneypotEvent) {
    if let Err(err) = honeypot.log_event(&event) {
        warn!("session {}: failed to record honeypot event: {}", conn.id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_chunk(protocol: i32, address: &str, port: u16, next_state: i32) -> Vec<u8> {
        let mut body = Vec::new();
        codec::write_varint(protocol, &mut body);
        codec::write_string(address, &mut body);
        codec::write_u16_be(port, &mut body);
        codec::write_varint(next_state, &mut body);
        codec::frame_packet(0x00, &body)
    }

    #[test]
    fn valid_status_handshake_is_classified() {
        let chunk = handshake_chunk(766, "mc.example.com", 25565, 1);
        match classify_first_packet(&chunk) {
            FirstPacket::Handshake { info, consumed } => {
                assert_eq!(info.protocol_version, 766);
                assert_eq!(info.server_address, "mc.example.com");
                assert_eq!(info.server_port, 25565);
                assert_eq!(info.next_state, 1);
                assert_eq!(consumed, chunk.len());
            }
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    #[test]
    fn trailing_login_start_is_not_part_of_the_handshake() {
        let mut chunk = handshake_chunk(766, "mc.example.com", 25565, 2);
        let handshake_len = chunk.len();
        let mut login_body = Vec::new();
        codec::write_string("alice", &mut login_body);
        login_body.extend_from_slice(&[0u8; 16]);
        chunk.extend_from_slice(&codec::frame_packet(0x00, &login_body));

        match classify_first_packet(&chunk) {
            FirstPacket::Handshake { info, consumed } => {
                assert_eq!(info.next_state, 2);
                assert_eq!(consumed, handshake_len);
            }
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    #[test]
    fn single_byte_openers_are_treated_as_status_probes() {
        assert!(matches!(classify_first_packet(&[0xFE]), FirstPacket::StatusProbe));
        assert!(matches!(classify_first_packet(&[0x01]), FirstPacket::StatusProbe));
    }

    #[test]
    fn oversize_declared_length_is_rejected() {
        // 600 = 0xD8 0x04, followed by a nominal packet id
        match classify_first_packet(&[0xD8, 0x04, 0x00]) {
            FirstPacket::Oversize(declared) => assert_eq!(declared, 600),
            other => panic!("expected oversize, got {:?}", other),
        }
    }

    #[test]
    fn out_of_range_protocol_is_a_violation() {
        let chunk = handshake_chunk(46, "mc.example.com", 25565, 1);
        match classify_first_packet(&chunk) {
            FirstPacket::Violation(reason) => assert!(reason.contains("unsupported protocol")),
            other => panic!("expected violation, got {:?}", other),
        }
        let chunk = handshake_chunk(1001, "mc.example.com", 25565, 1);
        assert!(matches!(classify_first_packet(&chunk), FirstPacket::Violation(_)));
    }

    #[test]
    fn bad_intent_is_a_violation() {
        let chunk = handshake_chunk(766, "mc.example.com", 25565, 3);
        match classify_first_packet(&chunk) {
            FirstPacket::Violation(reason) => assert!(reason.contains("invalid next state")),
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn overlong_address_is_a_violation() {
        let chunk = handshake_chunk(766, &"a".repeat(MAX_STRING_LEN + 1), 25565, 1);
        match classify_first_packet(&chunk) {
            FirstPacket::Violation(reason) => assert!(reason.contains("field too long")),
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn malformed_short_zero_id_packet_falls_back_to_status() {
        // packet id 0x00 but garbage fields
        let chunk = [0x06, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(classify_first_packet(&chunk), FirstPacket::StatusProbe));
    }

    #[test]
    fn ping_opener_is_a_loose_ping() {
        let chunk = codec::frame_packet(0x01, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(matches!(classify_first_packet(&chunk), FirstPacket::LoosePing));
    }

    #[test]
    fn unknown_openers_still_get_a_status_answer() {
        let chunk = codec::frame_packet(0x42, &[9, 9]);
        assert!(matches!(classify_first_packet(&chunk), FirstPacket::Unknown));
    }

    #[test]
    fn login_start_username_is_extracted() {
        let mut body = Vec::new();
        codec::write_string("alice", &mut body);
        body.extend_from_slice(&[0u8; 16]);
        assert_eq!(parse_login_start(&body).as_deref(), Some("alice"));
        assert_eq!(parse_login_start(&[0xFF, 0xFF]), None);
    }
}
