// ===========================================
// Minecraft wire primitives
// ===========================================
// Frames before compression/encryption are negotiated look like:
// [VarInt length][VarInt packet_id][payload], where length counts
// everything from the packet id onward.
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame this server is willing to buffer.
pub const MAX_PACKET_SIZE: usize = 512;
/// Cap for advertised server addresses in the handshake.
pub const MAX_STRING_LEN: usize = 128;
/// Cap for every other length-prefixed string.
pub const MAX_GENERAL_STRING_LEN: usize = 255;
/// Largest VarInt value any packet in the pre-login phases carries.
pub const MAX_VARINT_VALUE: i32 = 100_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("field too long: {len} bytes (cap {cap})")]
    FieldTooLong { len: usize, cap: usize },
}

// ===========================================
// VarInt
// ===========================================

/// Reads a VarInt: 7 data bits per byte, little-endian groups, the high
/// bit marks continuation. Fails on a sixth continuation byte or a
/// truncated stream.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<i32, CodecError> {
    let mut num_read = 0u32;
    let mut result = 0u64;
    loop {
        let mut buf = [0u8; 1];
        reader
            .read_exact(&mut buf)
            .map_err(|_| CodecError::MalformedFrame("truncated varint"))?;
        let byte = buf[0];
        result |= ((byte & 0x7F) as u64) << (7 * num_read);
        num_read += 1;
        if num_read > 5 {
            return Err(CodecError::MalformedFrame("varint longer than five bytes"));
        }
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(result as u32 as i32)
}

/// Async twin of [`read_varint`] for reading straight off a socket.
pub async fn read_varint_async<R>(reader: &mut R) -> Result<i32, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut num_read = 0u32;
    let mut result = 0u64;
    loop {
        let mut buf = [0u8; 1];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|_| CodecError::MalformedFrame("truncated varint"))?;
        let byte = buf[0];
        result |= ((byte & 0x7F) as u64) << (7 * num_read);
        num_read += 1;
        if num_read > 5 {
            return Err(CodecError::MalformedFrame("varint longer than five bytes"));
        }
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(result as u32 as i32)
}

/// Writes the minimal VarInt representation of `value`.
pub fn write_varint(value: i32, buf: &mut Vec<u8>) {
    let mut value = value as u32;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Attempts to decode a frame-length prefix from the start of `data`.
/// Returns `Ok(Some((length, prefix_len)))` once the prefix is complete,
/// `Ok(None)` while more bytes are needed.
pub fn try_parse_frame_header(data: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut length = 0usize;
    let mut num_read = 0usize;
    for byte in data.iter().copied() {
        length |= ((byte & 0x7F) as usize) << (7 * num_read);
        num_read += 1;
        if num_read > 5 {
            return Err(CodecError::MalformedFrame("frame length varint too long"));
        }
        if byte & 0x80 == 0 {
            return Ok(Some((length, num_read)));
        }
    }
    Ok(None)
}

// ===========================================
// Strings and shorts
// ===========================================

/// Reads a VarInt-prefixed UTF-8 string, refusing anything over `cap`
/// bytes before allocating.
pub fn read_string<R: Read>(reader: &mut R, cap: usize) -> Result<String, CodecError> {
    let len = read_varint(reader)?;
    if len < 0 {
        return Err(CodecError::MalformedFrame("negative string length"));
    }
    let len = len as usize;
    if len > cap {
        return Err(CodecError::FieldTooLong { len, cap });
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|_| CodecError::MalformedFrame("truncated string"))?;
    String::from_utf8(buf).map_err(|_| CodecError::MalformedFrame("string is not valid utf-8"))
}

/// Appends a VarInt length and the UTF-8 bytes of `s`.
pub fn write_string(s: &str, buf: &mut Vec<u8>) {
    write_varint(s.len() as i32, buf);
    buf.extend_from_slice(s.as_bytes());
}

pub fn read_u16_be<R: Read>(reader: &mut R) -> Result<u16, CodecError> {
    reader
        .read_u16::<BigEndian>()
        .map_err(|_| CodecError::MalformedFrame("truncated unsigned short"))
}

pub fn write_u16_be(value: u16, buf: &mut Vec<u8>) {
    buf.push((value >> 8) as u8);
    buf.push((value & 0xFF) as u8);
}

// ===========================================
// Frames
// ===========================================

/// Wraps a packet id and body in a length-prefixed frame. Never emits a
/// partial frame.
pub fn frame_packet(packet_id: i32, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(body.len() + 2);
    write_varint(packet_id, &mut data);
    data.extend_from_slice(body);

    let mut packet = Vec::with_capacity(data.len() + 2);
    write_varint(data.len() as i32, &mut packet);
    packet.extend_from_slice(&data);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn varint_roundtrip_within_protocol_range() {
        for value in [0, 1, 2, 127, 128, 255, 300, 754, 766, 25565, 99_999, MAX_VARINT_VALUE] {
            let mut buf = Vec::new();
            write_varint(value, &mut buf);
            assert!((1..=3).contains(&buf.len()), "value {} used {} bytes", value, buf.len());
            let decoded = read_varint(&mut Cursor::new(&buf)).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn varint_encoding_is_minimal() {
        let mut buf = Vec::new();
        write_varint(0, &mut buf);
        assert_eq!(buf, [0x00]);

        buf.clear();
        write_varint(127, &mut buf);
        assert_eq!(buf, [0x7F]);

        buf.clear();
        write_varint(128, &mut buf);
        assert_eq!(buf, [0x80, 0x01]);

        buf.clear();
        write_varint(25565, &mut buf);
        assert_eq!(buf, [0xDD, 0xC7, 0x01]);
    }

    #[test]
    fn varint_rejects_six_continuation_bytes() {
        let data = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x80];
        let err = read_varint(&mut Cursor::new(&data)).unwrap_err();
        assert_eq!(err, CodecError::MalformedFrame("varint longer than five bytes"));
    }

    #[test]
    fn varint_rejects_truncated_stream() {
        let data = [0x80u8, 0x80];
        let err = read_varint(&mut Cursor::new(&data)).unwrap_err();
        assert_eq!(err, CodecError::MalformedFrame("truncated varint"));
    }

    #[test]
    fn string_roundtrip() {
        for s in ["", "a", "play.example.com", "ユーザー名"] {
            let mut buf = Vec::new();
            write_string(s, &mut buf);
            let decoded = read_string(&mut Cursor::new(&buf), MAX_GENERAL_STRING_LEN).unwrap();
            assert_eq!(decoded, s);
        }
    }

    #[test]
    fn string_over_cap_is_rejected_before_allocation() {
        let long = "x".repeat(MAX_STRING_LEN + 1);
        let mut buf = Vec::new();
        write_string(&long, &mut buf);
        let err = read_string(&mut Cursor::new(&buf), MAX_STRING_LEN).unwrap_err();
        assert_eq!(
            err,
            CodecError::FieldTooLong { len: MAX_STRING_LEN + 1, cap: MAX_STRING_LEN }
        );
    }

    #[test]
    fn unsigned_short_is_big_endian() {
        let mut buf = Vec::new();
        write_u16_be(25565, &mut buf);
        assert_eq!(buf, [0x63, 0xDD]);
        assert_eq!(read_u16_be(&mut Cursor::new(&buf)).unwrap(), 25565);
    }

    #[test]
    fn frame_header_parses_incrementally() {
        assert_eq!(try_parse_frame_header(&[]).unwrap(), None);
        assert_eq!(try_parse_frame_header(&[0x80]).unwrap(), None);
        assert_eq!(try_parse_frame_header(&[0x05]).unwrap(), Some((5, 1)));
        // 600 = 0xD8 0x04
        assert_eq!(try_parse_frame_header(&[0xD8, 0x04]).unwrap(), Some((600, 2)));
    }

    #[test]
    fn frame_packet_wraps_id_and_body() {
        let packet = frame_packet(0x00, b"abc");
        // length 4 = id (1 byte) + body (3 bytes)
        assert_eq!(packet, [0x04, 0x00, b'a', b'b', b'c']);
    }
}
