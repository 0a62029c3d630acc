// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound frame splitting and control-packet parsing.
//!
//! TCP delivers a byte stream with no message boundaries; the
//! [`FrameSplitter`] accumulates raw reads, optionally unwraps the
//! WebSocket framing layer, and yields one MQTT control packet at a time.
//! Partial frames across reads are the normal case at high connection
//! counts, so the splitter keeps its position between calls and compacts
//! the accumulator once the consumed prefix grows large.

use crate::codec::packet::{MqttVersion, QoS};
use crate::codec::properties::{self, validate};
use crate::codec::{varint, ws, PacketType};
use crate::{Error, Result};

// ============================================================================
// Frame splitter
// ============================================================================

/// A complete MQTT frame split out of the stream.
#[derive(Debug)]
pub struct RawPacket {
    pub ptype: PacketType,
    pub flags: u8,
    pub body: Vec<u8>,
}

/// Incremental frame reassembly over raw socket reads.
#[derive(Debug)]
pub struct FrameSplitter {
    /// MQTT byte stream (post WebSocket unwrap when enabled).
    acc: Vec<u8>,
    pos: usize,
    /// Raw WebSocket byte stream, before frame unwrap.
    ws_acc: Vec<u8>,
    ws_pos: usize,
    websocket: bool,
    max_packet: usize,
    /// Set when the server sent a WebSocket close frame.
    peer_closed: bool,
}

impl FrameSplitter {
    pub fn new(websocket: bool, max_packet: usize) -> Self {
        Self {
            acc: Vec::with_capacity(4096),
            pos: 0,
            ws_acc: Vec::new(),
            ws_pos: 0,
            websocket,
            max_packet,
            peer_closed: false,
        }
    }

    /// Feed one socket read into the splitter.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        if self.websocket {
            compact(&mut self.ws_acc, &mut self.ws_pos);
            self.ws_acc.extend_from_slice(data);
            self.unwrap_ws_frames()
        } else {
            compact(&mut self.acc, &mut self.pos);
            self.acc.extend_from_slice(data);
            Ok(())
        }
    }

    /// Whether the server closed the WebSocket layer.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Split the next complete MQTT packet out of the accumulator.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        let avail = &self.acc[self.pos..];
        if avail.len() < 2 {
            return Ok(None);
        }
        let header = avail[0];
        let ptype = PacketType::from_header(header)
            .ok_or(Error::MalformedPacket("reserved packet type"))?;
        let (remaining, vlen) = match varint::decode(&avail[1..])? {
            Some(v) => v,
            None => return Ok(None),
        };
        if remaining as usize > self.max_packet {
            return Err(Error::MalformedPacket("packet exceeds maximum size"));
        }
        let total = 1 + vlen + remaining as usize;
        if avail.len() < total {
            return Ok(None);
        }

        let body = avail[1 + vlen..total].to_vec();
        self.pos += total;
        Ok(Some(RawPacket {
            ptype,
            flags: header & 0x0F,
            body,
        }))
    }

    /// Drop all buffered state (used when a connection is reset).
    pub fn reset(&mut self) {
        self.acc.clear();
        self.pos = 0;
        self.ws_acc.clear();
        self.ws_pos = 0;
        self.peer_closed = false;
    }

    fn unwrap_ws_frames(&mut self) -> Result<()> {
        loop {
            let avail = &self.ws_acc[self.ws_pos..];
            let hdr = match ws::parse_header(avail)? {
                Some(h) => h,
                None => return Ok(()),
            };
            let total = hdr.header_len + hdr.payload_len;
            if avail.len() < total {
                return Ok(());
            }
            let payload = &avail[hdr.header_len..total];
            if hdr.opcode.is_data() {
                compact(&mut self.acc, &mut self.pos);
                self.acc.extend_from_slice(payload);
            } else if hdr.opcode == ws::Opcode::Close {
                self.peer_closed = true;
            }
            // Ping/pong control frames carry nothing we need.
            self.ws_pos += total;
        }
    }
}

/// Drop the consumed prefix once it dominates the buffer.
fn compact(acc: &mut Vec<u8>, pos: &mut usize) {
    if *pos > 0 && *pos > acc.len() / 2 {
        acc.drain(..*pos);
        *pos = 0;
    }
}

// ============================================================================
// Packet parsing
// ============================================================================

/// An inbound PUBLISH.
#[derive(Debug, PartialEq, Eq)]
pub struct InboundPublish {
    pub topic: String,
    pub msg_id: u16,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub payload: Vec<u8>,
}

/// A parsed inbound control packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet {
    ConnAck { session_present: bool, reason: u8 },
    Publish(InboundPublish),
    PubAck { msg_id: u16 },
    PubRec { msg_id: u16 },
    PubRel { msg_id: u16 },
    PubComp { msg_id: u16 },
    SubAck { msg_id: u16, codes: Vec<u8> },
    UnsubAck { msg_id: u16 },
    PingResp,
    Disconnect { reason: u8 },
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(Error::MalformedPacket("truncated packet"));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(Error::MalformedPacket("truncated packet"));
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::MalformedPacket("truncated packet"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn lp_string(&mut self) -> Result<&'a str> {
        let len = usize::from(self.u16()?);
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::MalformedPacket("invalid UTF-8 string"))
    }

    /// Read and validate a v5 property area for the given context.
    fn properties(&mut self, context: u16) -> Result<()> {
        let (len, consumed) = varint::decode(&self.data[self.pos..])?
            .ok_or(Error::MalformedPacket("truncated property length"))?;
        self.pos += consumed;
        let area = self.bytes(len as usize)?;
        validate(area, context, None)
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.data[self.pos..];
        self.pos = self.data.len();
        s
    }
}

/// Parse a raw frame into a typed packet.
///
/// v5 property areas are structurally validated and then skipped; the
/// engine reacts to packet-level fields only.
pub fn parse_packet(raw: &RawPacket, version: MqttVersion) -> Result<Packet> {
    let v5 = version.has_properties();
    let mut r = Reader::new(&raw.body);

    let packet = match raw.ptype {
        PacketType::ConnAck => {
            let flags = r.u8()?;
            let reason = r.u8()?;
            if v5 && r.remaining() > 0 {
                r.properties(properties::ctx::CONNACK)?;
            }
            Packet::ConnAck {
                session_present: flags & 0x01 != 0,
                reason,
            }
        }
        PacketType::Publish => {
            let qos = QoS::from_bits((raw.flags >> 1) & 0x03)?;
            let topic = r.lp_string()?.to_owned();
            let msg_id = if qos.is_acked() { r.u16()? } else { 0 };
            if v5 {
                r.properties(properties::ctx::PUBLISH)?;
            }
            Packet::Publish(InboundPublish {
                topic,
                msg_id,
                qos,
                retain: raw.flags & 0x01 != 0,
                dup: raw.flags & 0x08 != 0,
                payload: r.rest().to_vec(),
            })
        }
        PacketType::PubAck | PacketType::PubRec | PacketType::PubRel | PacketType::PubComp => {
            let msg_id = r.u16()?;
            // The v5 long form carries a reason code and properties.
            if v5 && r.remaining() > 0 {
                let _reason = r.u8()?;
                if r.remaining() > 0 {
                    r.properties(properties::ctx::PUBACK)?;
                }
            }
            match raw.ptype {
                PacketType::PubAck => Packet::PubAck { msg_id },
                PacketType::PubRec => Packet::PubRec { msg_id },
                PacketType::PubRel => Packet::PubRel { msg_id },
                _ => Packet::PubComp { msg_id },
            }
        }
        PacketType::SubAck => {
            let msg_id = r.u16()?;
            if v5 {
                r.properties(properties::ctx::SUBACK)?;
            }
            let codes = r.rest().to_vec();
            if codes.is_empty() {
                return Err(Error::MalformedPacket("SUBACK without return codes"));
            }
            Packet::SubAck { msg_id, codes }
        }
        PacketType::UnsubAck => {
            let msg_id = r.u16()?;
            if v5 {
                r.properties(properties::ctx::UNSUBACK)?;
            }
            Packet::UnsubAck { msg_id }
        }
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => {
            let reason = if r.remaining() > 0 { r.u8()? } else { 0 };
            if v5 && r.remaining() > 0 {
                r.properties(properties::ctx::DISCONNECT)?;
            }
            Packet::Disconnect { reason }
        }
        PacketType::Connect
        | PacketType::Subscribe
        | PacketType::Unsubscribe
        | PacketType::PingReq
        | PacketType::Auth => {
            return Err(Error::MalformedPacket("unexpected client-bound packet"));
        }
    };
    Ok(packet)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuf;
    use crate::codec::packet::{self, FrameOpts, PublishMessage};

    fn splitter() -> FrameSplitter {
        FrameSplitter::new(false, 1024 * 1024)
    }

    fn encoded_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut buf = ByteBuf::with_capacity(512);
        packet::publish(
            &mut buf,
            &PublishMessage::new(topic, payload),
            FrameOpts::default(),
        )
        .unwrap();
        buf.bytes().to_vec()
    }

    #[test]
    fn test_split_single_packet() {
        let mut s = splitter();
        s.feed(&encoded_publish("t", b"abc")).unwrap();

        let raw = s.next_packet().unwrap().unwrap();
        assert_eq!(raw.ptype, PacketType::Publish);
        assert!(s.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_split_partial_across_reads() {
        let wire = encoded_publish("topic/a", b"payload");
        let mut s = splitter();

        // One byte at a time: every prefix yields None, the full frame one
        // packet.
        for b in &wire[..wire.len() - 1] {
            s.feed(std::slice::from_ref(b)).unwrap();
            assert!(s.next_packet().unwrap().is_none());
        }
        s.feed(&wire[wire.len() - 1..]).unwrap();
        assert!(s.next_packet().unwrap().is_some());
    }

    #[test]
    fn test_split_back_to_back() {
        let mut wire = encoded_publish("a", b"1");
        wire.extend(encoded_publish("b", b"2"));
        wire.extend(&[0xD0, 0x00]); // PINGRESP

        let mut s = splitter();
        s.feed(&wire).unwrap();
        assert_eq!(s.next_packet().unwrap().unwrap().ptype, PacketType::Publish);
        assert_eq!(s.next_packet().unwrap().unwrap().ptype, PacketType::Publish);
        assert_eq!(s.next_packet().unwrap().unwrap().ptype, PacketType::PingResp);
        assert!(s.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_split_rejects_oversize() {
        let mut s = FrameSplitter::new(false, 16);
        s.feed(&encoded_publish("t", &[0u8; 64])).unwrap();
        assert!(s.next_packet().is_err());
    }

    #[test]
    fn test_split_rejects_bad_type() {
        let mut s = splitter();
        s.feed(&[0x00, 0x00]).unwrap();
        assert!(s.next_packet().is_err());
    }

    #[test]
    fn test_ws_unwrap() {
        // Wrap a PINGRESP in an unmasked server frame.
        let mut s = FrameSplitter::new(true, 1024);
        s.feed(&[0x82, 0x02, 0xD0, 0x00]).unwrap();
        assert_eq!(s.next_packet().unwrap().unwrap().ptype, PacketType::PingResp);
    }

    #[test]
    fn test_ws_unwrap_split_frame() {
        let mut s = FrameSplitter::new(true, 1024);
        s.feed(&[0x82, 0x02, 0xD0]).unwrap();
        assert!(s.next_packet().unwrap().is_none());
        s.feed(&[0x00]).unwrap();
        assert_eq!(s.next_packet().unwrap().unwrap().ptype, PacketType::PingResp);
    }

    #[test]
    fn test_ws_close_frame_flagged() {
        let mut s = FrameSplitter::new(true, 1024);
        s.feed(&[0x88, 0x00]).unwrap();
        assert!(s.peer_closed());
    }

    #[test]
    fn test_parse_connack() {
        let raw = RawPacket {
            ptype: PacketType::ConnAck,
            flags: 0,
            body: vec![0x01, 0x00],
        };
        assert_eq!(
            parse_packet(&raw, MqttVersion::V311).unwrap(),
            Packet::ConnAck {
                session_present: true,
                reason: 0
            }
        );
    }

    #[test]
    fn test_parse_connack_v5_with_properties() {
        // flags, reason, props len 3: ReceiveMaximum = 10
        let raw = RawPacket {
            ptype: PacketType::ConnAck,
            flags: 0,
            body: vec![0x00, 0x00, 0x03, properties::RECEIVE_MAXIMUM, 0x00, 0x0A],
        };
        assert_eq!(
            parse_packet(&raw, MqttVersion::V5).unwrap(),
            Packet::ConnAck {
                session_present: false,
                reason: 0
            }
        );
    }

    #[test]
    fn test_parse_connack_v5_bad_property_context() {
        // TopicAlias is not a CONNACK property.
        let raw = RawPacket {
            ptype: PacketType::ConnAck,
            flags: 0,
            body: vec![0x00, 0x00, 0x03, properties::TOPIC_ALIAS, 0x00, 0x01],
        };
        assert!(parse_packet(&raw, MqttVersion::V5).is_err());
    }

    #[test]
    fn test_parse_suback() {
        let raw = RawPacket {
            ptype: PacketType::SubAck,
            flags: 0,
            body: vec![0x00, 0x07, 0x01],
        };
        assert_eq!(
            parse_packet(&raw, MqttVersion::V311).unwrap(),
            Packet::SubAck {
                msg_id: 7,
                codes: vec![1]
            }
        );
    }

    #[test]
    fn test_parse_puback_forms() {
        // Short two-byte form.
        let raw = RawPacket {
            ptype: PacketType::PubAck,
            flags: 0,
            body: vec![0x00, 0x01],
        };
        assert_eq!(
            parse_packet(&raw, MqttVersion::V5).unwrap(),
            Packet::PubAck { msg_id: 1 }
        );

        // v5 long form with reason code and empty properties.
        let raw = RawPacket {
            ptype: PacketType::PubAck,
            flags: 0,
            body: vec![0x00, 0x01, 0x10, 0x00],
        };
        assert_eq!(
            parse_packet(&raw, MqttVersion::V5).unwrap(),
            Packet::PubAck { msg_id: 1 }
        );
    }

    #[test]
    fn test_parse_disconnect() {
        let raw = RawPacket {
            ptype: PacketType::Disconnect,
            flags: 0,
            body: vec![],
        };
        assert_eq!(
            parse_packet(&raw, MqttVersion::V5).unwrap(),
            Packet::Disconnect { reason: 0 }
        );

        let raw = RawPacket {
            ptype: PacketType::Disconnect,
            flags: 0,
            body: vec![0x8E],
        };
        assert_eq!(
            parse_packet(&raw, MqttVersion::V5).unwrap(),
            Packet::Disconnect { reason: 0x8E }
        );
    }

    #[test]
    fn test_parse_truncated_is_malformed() {
        let raw = RawPacket {
            ptype: PacketType::SubAck,
            flags: 0,
            body: vec![0x00],
        };
        assert!(matches!(
            parse_packet(&raw, MqttVersion::V311),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_parse_unexpected_direction() {
        let raw = RawPacket {
            ptype: PacketType::Connect,
            flags: 0,
            body: vec![],
        };
        assert!(parse_packet(&raw, MqttVersion::V311).is_err());
    }
}
