// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket client framing and upgrade handshake (RFC6455).
//!
//! Client-originated frames are masked as the RFC requires; the mask key
//! is fixed at zero so the payload bytes are unchanged on the wire.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |     (16/64, if len=126/127)   |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                      Masking key (client frames)              |
//! +---------------------------------------------------------------+
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::digest;

use crate::buffer::ByteBuf;
use crate::codec::packet::MqttVersion;
use crate::{Error, Result};

/// GUID appended to the client key when computing the accept digest.
pub const SERVER_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Length of the random client key before Base64 encoding.
const CLIENT_KEY_LEN: usize = 16;

/// Header + mask size when the payload length fits 7 bits (< 126).
pub const MIN_FRAME_HEADER: usize = 2 + 4;

/// Header + mask size with a 16-bit extended length (< 65536).
pub const MID_FRAME_HEADER: usize = 4 + 4;

/// Header + mask size with a 64-bit extended length.
pub const MAX_FRAME_HEADER: usize = 10 + 4;

/// Payload threshold above which the 16-bit extended length is used.
const LEN_16_THRESHOLD: usize = 126;

/// Payload threshold above which the 64-bit extended length is used.
const LEN_64_THRESHOLD: usize = 65_536;

const OP_BINARY: u8 = 0x2;
const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

/// WebSocket frame opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Opcode> {
        Ok(match bits {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return Err(Error::MalformedPacket("reserved WebSocket opcode")),
        })
    }

    /// Data frames carry MQTT bytes; control frames do not.
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Binary | Opcode::Text | Opcode::Continuation)
    }
}

// ============================================================================
// Outbound framing
// ============================================================================

/// Header + mask size for a payload of `len` bytes.
pub fn header_len(len: usize) -> usize {
    if len < LEN_16_THRESHOLD {
        MIN_FRAME_HEADER
    } else if len < LEN_64_THRESHOLD {
        MID_FRAME_HEADER
    } else {
        MAX_FRAME_HEADER
    }
}

/// Prepend a client data-frame header to an encoded MQTT packet.
///
/// The packet encoders reserve [`MAX_FRAME_HEADER`] bytes of headroom by
/// placing the MQTT bytes at that offset; this back-fills the header
/// immediately before the payload and moves the read cursor to the frame
/// start.
pub fn finish_frame(buf: &mut ByteBuf) -> Result<()> {
    debug_assert!(buf.read_pos() == MAX_FRAME_HEADER);
    let payload_len = buf.write_pos() - MAX_FRAME_HEADER;
    let hlen = header_len(payload_len);
    let start = MAX_FRAME_HEADER - hlen;

    let mut hdr = [0u8; MAX_FRAME_HEADER];
    hdr[0] = FIN_BIT | OP_BINARY;
    let mask_off = match hlen {
        MIN_FRAME_HEADER => {
            hdr[1] = MASK_BIT | payload_len as u8;
            2
        }
        MID_FRAME_HEADER => {
            hdr[1] = MASK_BIT | 126;
            hdr[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
            4
        }
        _ => {
            hdr[1] = MASK_BIT | 127;
            hdr[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
            10
        }
    };
    // Mask key is fixed zero; the payload is already in place unmodified.
    buf.overwrite(start, &hdr[..mask_off + 4])?;
    buf.set_read(start);
    Ok(())
}

// ============================================================================
// Inbound framing
// ============================================================================

/// Parsed server frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: Opcode,
    pub header_len: usize,
    pub payload_len: usize,
}

/// Parse a server frame header from the start of `data`.
///
/// Returns `Ok(None)` when more bytes are needed. Server-to-client frames
/// must not be masked.
pub fn parse_header(data: &[u8]) -> Result<Option<FrameHeader>> {
    if data.len() < 2 {
        return Ok(None);
    }
    let opcode = Opcode::from_bits(data[0] & 0x0F)?;
    if data[1] & MASK_BIT != 0 {
        return Err(Error::MalformedPacket("masked server WebSocket frame"));
    }
    let len7 = usize::from(data[1] & 0x7F);
    let (header_len, payload_len) = match len7 {
        126 => {
            if data.len() < 4 {
                return Ok(None);
            }
            (4, usize::from(u16::from_be_bytes([data[2], data[3]])))
        }
        127 => {
            if data.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&data[2..10]);
            let len = u64::from_be_bytes(len_bytes);
            if len > usize::MAX as u64 {
                return Err(Error::MalformedPacket("WebSocket frame too large"));
            }
            (10, len as usize)
        }
        n => (2, n),
    };
    Ok(Some(FrameHeader {
        opcode,
        header_len,
        payload_len,
    }))
}

// ============================================================================
// Upgrade handshake
// ============================================================================

/// Client state for the HTTP upgrade exchange.
#[derive(Debug)]
pub struct WsHandshake {
    /// Base64-encoded client key sent in `Sec-WebSocket-Key`.
    pub key: String,
    /// Expected `Sec-WebSocket-Accept` value.
    pub accept: String,
    /// The full upgrade request.
    pub request: Vec<u8>,
    /// Bytes of the request already written to the socket.
    pub sent: usize,
    /// Accumulated server response.
    pub response: Vec<u8>,
}

/// Compute the accept value for a Base64 client key.
pub fn compute_accept(key: &str) -> String {
    let mut input = String::with_capacity(key.len() + SERVER_GUID.len());
    input.push_str(key);
    input.push_str(SERVER_GUID);
    let sha1 = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    BASE64.encode(sha1.as_ref())
}

/// Generate the client key and upgrade request for one connection.
///
/// The MQTT subprotocol name depends on the protocol version: v3.1 brokers
/// expect `mqttv3.1`, later versions `mqtt`.
pub fn start_handshake(host: &str, version: MqttVersion) -> WsHandshake {
    const CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut raw_key = [0u8; CLIENT_KEY_LEN];
    for b in raw_key.iter_mut() {
        *b = CHARSET[fastrand::usize(..CHARSET.len())];
    }
    let key = BASE64.encode(raw_key);
    let accept = compute_accept(&key);

    let protocol = if version == MqttVersion::V3 {
        "mqttv3.1"
    } else {
        "mqtt"
    };
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Host: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {}\r\n\
         Sec-WebSocket-Key: {}\r\n\r\n",
        host, protocol, key
    )
    .into_bytes();

    WsHandshake {
        key,
        accept,
        request,
        sent: 0,
        response: Vec::new(),
    }
}

/// Check whether the accumulated response contains the full header block.
pub fn response_complete(response: &[u8]) -> Option<usize> {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}

/// Validate the server's 101 response against the expected accept value.
///
/// Returns the offset of the first byte after the headers; any trailing
/// bytes already belong to the data stream.
pub fn verify_response(hs: &WsHandshake) -> Result<usize> {
    let end = response_complete(&hs.response)
        .ok_or(Error::MalformedPacket("incomplete upgrade response"))?;
    let headers = &hs.response[..end];
    let text = std::str::from_utf8(headers)
        .map_err(|_| Error::MalformedPacket("non-UTF8 upgrade response"))?;

    let mut lines = text.split("\r\n");
    let status = lines.next().unwrap_or("");
    if !status.starts_with("HTTP/1.1 101") {
        return Err(Error::Protocol("upgrade refused by server"));
    }

    for line in lines {
        if let Some(value) = line.strip_prefix("Sec-WebSocket-Accept: ") {
            if value.trim() == hs.accept {
                return Ok(end);
            }
            return Err(Error::Protocol("WebSocket accept mismatch"));
        }
    }
    Err(Error::Protocol("missing Sec-WebSocket-Accept header"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload_len: usize) -> ByteBuf {
        let mut buf = ByteBuf::with_capacity(MAX_FRAME_HEADER + payload_len + 16);
        buf.set_cursors(MAX_FRAME_HEADER);
        for i in 0..payload_len {
            buf.put_u8((i % 251) as u8).unwrap();
        }
        finish_frame(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_len_thresholds() {
        assert_eq!(header_len(0), MIN_FRAME_HEADER);
        assert_eq!(header_len(125), MIN_FRAME_HEADER);
        assert_eq!(header_len(126), MID_FRAME_HEADER);
        assert_eq!(header_len(65_535), MID_FRAME_HEADER);
        assert_eq!(header_len(65_536), MAX_FRAME_HEADER);
    }

    #[test]
    fn test_frame_sizes_on_wire() {
        // 125-byte payload: 2-byte header + 4-byte mask.
        let buf = framed(125);
        assert_eq!(buf.remaining(), MIN_FRAME_HEADER + 125);

        // 126: 16-bit extended length.
        let buf = framed(126);
        assert_eq!(buf.remaining(), MID_FRAME_HEADER + 126);

        // 65536: 64-bit extended length.
        let buf = framed(65_536);
        assert_eq!(buf.remaining(), MAX_FRAME_HEADER + 65_536);
    }

    #[test]
    fn test_frame_bits() {
        let buf = framed(5);
        let bytes = buf.bytes();
        assert_eq!(bytes[0], 0x82); // FIN + binary
        assert_eq!(bytes[1], 0x80 | 5); // masked, 7-bit length
        assert_eq!(&bytes[2..6], &[0, 0, 0, 0]); // zero mask key
    }

    #[test]
    fn test_frame_roundtrip_through_parser() {
        for &len in &[0usize, 1, 125, 126, 300, 65_535, 65_536] {
            let buf = framed(len);
            // Server frames are unmasked; strip the mask bit and key to
            // simulate the inbound direction.
            let mut wire = buf.bytes().to_vec();
            wire[1] &= 0x7F;
            let mask_start = header_len(len) - 4;
            wire.drain(mask_start..mask_start + 4);

            let hdr = parse_header(&wire).unwrap().unwrap();
            assert_eq!(hdr.opcode, Opcode::Binary);
            assert_eq!(hdr.payload_len, len, "len={}", len);
            assert_eq!(wire.len(), hdr.header_len + len);
        }
    }

    #[test]
    fn test_parse_needs_more() {
        assert_eq!(parse_header(&[]).unwrap(), None);
        assert_eq!(parse_header(&[0x82]).unwrap(), None);
        assert_eq!(parse_header(&[0x82, 126, 0x01]).unwrap(), None);
    }

    #[test]
    fn test_masked_server_frame_rejected() {
        let err = parse_header(&[0x82, 0x85, 0, 0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }

    #[test]
    fn test_compute_accept_rfc_vector() {
        // Example from RFC6455 section 1.3.
        assert_eq!(
            compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_handshake_verification() {
        let mut hs = start_handshake("broker.example:1883", MqttVersion::V311);
        assert!(String::from_utf8_lossy(&hs.request).contains("Sec-WebSocket-Protocol: mqtt\r\n"));

        hs.response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            hs.accept
        )
        .into_bytes();
        assert_eq!(verify_response(&hs).unwrap(), hs.response.len());
    }

    #[test]
    fn test_handshake_accept_mismatch() {
        let mut hs = start_handshake("broker.example:1883", MqttVersion::V5);
        hs.response = b"HTTP/1.1 101 Switching Protocols\r\n\
             Sec-WebSocket-Accept: bm90LXRoZS1yaWdodC1kaWdlc3Q=\r\n\r\n"
            .to_vec();
        assert!(verify_response(&hs).is_err());
    }

    #[test]
    fn test_handshake_refused() {
        let mut hs = start_handshake("broker.example:1883", MqttVersion::V5);
        hs.response = b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec();
        assert!(matches!(verify_response(&hs), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_v31_subprotocol() {
        let hs = start_handshake("h:1", MqttVersion::V3);
        assert!(
            String::from_utf8_lossy(&hs.request).contains("Sec-WebSocket-Protocol: mqttv3.1\r\n")
        );
    }

    #[test]
    fn test_trailing_bytes_after_headers() {
        let mut hs = start_handshake("h:1", MqttVersion::V311);
        let mut resp = format!(
            "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            hs.accept
        )
        .into_bytes();
        let header_end = resp.len();
        resp.extend_from_slice(&[0x82, 0x02, 0x20, 0x02]); // first data frame
        hs.response = resp;

        assert_eq!(verify_response(&hs).unwrap(), header_end);
    }
}
