// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-type MQTT control-packet encoders.
//!
//! Each encoder computes the remaining length as a closed-form sum of the
//! fixed and variable segments before writing anything, so a short buffer
//! fails the capacity check instead of producing a truncated frame. When
//! WebSocket framing is requested the MQTT bytes are written at a reserved
//! offset and the frame header is back-filled by [`ws::finish_frame`].

use crate::buffer::ByteBuf;
use crate::codec::properties::{self, PropertyBlock};
use crate::codec::{varint, ws, PacketType, MSGID_SIZE, STRING_LEN_SIZE};
use crate::{Error, Result};

// ============================================================================
// Protocol versions and QoS
// ============================================================================

/// MQTT protocol version, carrying the wire-level value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MqttVersion {
    /// MQTT v3.1 ("MQIsdp").
    V3 = 3,
    /// MQTT v3.1.1 ("MQTT").
    #[default]
    V311 = 4,
    /// MQTT v5 ("MQTT"), adds the properties sub-block.
    V5 = 5,
}

impl MqttVersion {
    /// Protocol name written in the CONNECT variable header.
    pub fn protocol_name(self) -> &'static [u8] {
        match self {
            MqttVersion::V3 => b"MQIsdp",
            MqttVersion::V311 | MqttVersion::V5 => b"MQTT",
        }
    }

    /// Protocol level byte.
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn has_properties(self) -> bool {
        self >= MqttVersion::V5
    }
}

impl std::fmt::Display for MqttVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MqttVersion::V3 => f.write_str("3.1"),
            MqttVersion::V311 => f.write_str("3.1.1"),
            MqttVersion::V5 => f.write_str("5"),
        }
    }
}

/// MQTT Quality of Service level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_bits(bits: u8) -> Result<QoS> {
        Ok(match bits {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return Err(Error::MalformedPacket("invalid QoS bits")),
        })
    }

    /// Whether an acknowledgment cycle (and a message id) is required.
    pub fn is_acked(self) -> bool {
        self != QoS::AtMostOnce
    }
}

/// Per-connection framing options applied to every encoder call.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameOpts {
    pub version: MqttVersion,
    pub websocket: bool,
}

impl FrameOpts {
    /// Headroom reserved in front of the MQTT bytes.
    fn reserve(&self) -> usize {
        if self.websocket {
            ws::MAX_FRAME_HEADER
        } else {
            0
        }
    }
}

fn begin(buf: &mut ByteBuf, fo: FrameOpts) {
    buf.set_cursors(fo.reserve());
}

fn finish(buf: &mut ByteBuf, fo: FrameOpts) -> Result<()> {
    if fo.websocket {
        ws::finish_frame(buf)?;
    }
    Ok(())
}

/// Check that `remaining` plus fixed header fits the buffer before writing.
fn check_capacity(buf: &ByteBuf, fo: FrameOpts, remaining: u32) -> Result<()> {
    let need = fo.reserve() + 1 + varint::encoded_len(remaining) + remaining as usize;
    if need > buf.capacity() {
        return Err(Error::BufferOverflow);
    }
    Ok(())
}

// ============================================================================
// CONNECT
// ============================================================================

/// Will message carried in the CONNECT payload.
#[derive(Clone, Debug)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Fields of an outbound CONNECT packet.
#[derive(Debug, Default)]
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub clean_start: bool,
    pub keepalive_secs: u16,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    pub will: Option<&'a WillMessage>,
    /// v5 CONNECT properties; ignored for earlier versions.
    pub properties: Option<&'a PropertyBlock>,
}

/// Variable-header length by version: protocol name, level, flags,
/// keepalive. v3.1 carries the longer "MQIsdp" name.
fn connect_var_header_len(version: MqttVersion) -> u32 {
    STRING_LEN_SIZE + version.protocol_name().len() as u32 + 1 + 1 + 2
}

/// Encode a CONNECT packet.
pub fn connect(buf: &mut ByteBuf, opts: &ConnectOptions<'_>, fo: FrameOpts) -> Result<()> {
    let version = fo.version;
    let empty_props = PropertyBlock::new();
    let props = opts.properties.unwrap_or(&empty_props);

    let mut remaining = connect_var_header_len(version);
    if version.has_properties() {
        remaining += props.wire_len();
    }
    remaining += STRING_LEN_SIZE + opts.client_id.len() as u32;

    if let Some(will) = opts.will {
        if version.has_properties() {
            remaining += 1; // empty will-properties block
        }
        remaining += STRING_LEN_SIZE + will.topic.len() as u32;
        remaining += STRING_LEN_SIZE + will.payload.len() as u32;
    }
    if let Some(username) = opts.username {
        remaining += STRING_LEN_SIZE + username.len() as u32;
    }
    if let Some(password) = opts.password {
        remaining += STRING_LEN_SIZE + password.len() as u32;
    }

    check_capacity(buf, fo, remaining)?;
    begin(buf, fo);

    buf.put_u8((PacketType::Connect as u8) << 4)?;
    varint::encode_into(buf, remaining)?;

    buf.put_lp_bytes(version.protocol_name())?;
    buf.put_u8(version.level())?;

    let mut flags = 0u8;
    if opts.clean_start {
        flags |= 0x02;
    }
    if let Some(will) = opts.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if opts.password.is_some() {
        flags |= 0x40;
    }
    if opts.username.is_some() {
        flags |= 0x80;
    }
    buf.put_u8(flags)?;
    buf.put_u16(opts.keepalive_secs)?;

    if version.has_properties() {
        props.write_to(buf)?;
    }

    buf.put_lp_bytes(opts.client_id.as_bytes())?;

    if let Some(will) = opts.will {
        if version.has_properties() {
            buf.put_u8(0)?; // no will properties
        }
        buf.put_lp_bytes(will.topic.as_bytes())?;
        buf.put_lp_bytes(&will.payload)?;
    }
    if let Some(username) = opts.username {
        buf.put_lp_bytes(username.as_bytes())?;
    }
    if let Some(password) = opts.password {
        buf.put_lp_bytes(password)?;
    }

    finish(buf, fo)
}

// ============================================================================
// PUBLISH
// ============================================================================

/// Description of an outbound PUBLISH, consumed by the encoder.
#[derive(Debug)]
pub struct PublishMessage<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub msg_id: u16,
    /// v5 properties (topic alias, user properties, ...).
    pub properties: Option<&'a PropertyBlock>,
}

impl<'a> PublishMessage<'a> {
    pub fn new(topic: &'a str, payload: &'a [u8]) -> Self {
        Self {
            topic,
            payload,
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            msg_id: 0,
            properties: None,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn msg_id(mut self, msg_id: u16) -> Self {
        self.msg_id = msg_id;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    pub fn properties(mut self, props: &'a PropertyBlock) -> Self {
        self.properties = Some(props);
        self
    }
}

/// Encode a PUBLISH packet.
pub fn publish(buf: &mut ByteBuf, msg: &PublishMessage<'_>, fo: FrameOpts) -> Result<()> {
    if msg.qos.is_acked() && msg.msg_id == 0 {
        return Err(Error::InvalidState("QoS>0 publish requires a message id"));
    }

    let mut remaining = STRING_LEN_SIZE + msg.topic.len() as u32 + msg.payload.len() as u32;
    if msg.qos.is_acked() {
        remaining += MSGID_SIZE;
    }
    if fo.version.has_properties() {
        remaining += msg.properties.map_or(1, |p| p.wire_len());
    }

    check_capacity(buf, fo, remaining)?;
    begin(buf, fo);

    let mut header = (PacketType::Publish as u8) << 4;
    header |= (msg.qos as u8) << 1;
    if msg.retain {
        header |= 0x01;
    }
    if msg.dup {
        header |= 0x08;
    }
    buf.put_u8(header)?;
    varint::encode_into(buf, remaining)?;

    buf.put_lp_bytes(msg.topic.as_bytes())?;
    if msg.qos.is_acked() {
        buf.put_u16(msg.msg_id)?;
    }
    if fo.version.has_properties() {
        match msg.properties {
            Some(props) => props.write_to(buf)?,
            None => buf.put_u8(0)?,
        }
    }
    buf.put_slice(msg.payload)?;

    finish(buf, fo)
}

// ============================================================================
// SUBSCRIBE / UNSUBSCRIBE
// ============================================================================

/// One topic subscription, with the v5 subscription options.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
    /// v5 subscription identifier property.
    pub sub_id: Option<u32>,
    pub no_local: bool,
    pub retain_as_published: bool,
    /// v5 retain-handling option (0-2).
    pub retain_handling: u8,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
            sub_id: None,
            no_local: false,
            retain_as_published: false,
            retain_handling: 0,
        }
    }
}

/// Encode a SUBSCRIBE packet for a single topic filter.
pub fn subscribe(buf: &mut ByteBuf, msg_id: u16, sub: &Subscription, fo: FrameOpts) -> Result<()> {
    let mut props = PropertyBlock::new();
    if fo.version.has_properties() {
        if let Some(sub_id) = sub.sub_id {
            props.put_int(properties::SUBSCRIPTION_ID, sub_id)?;
        }
    }

    let mut remaining = MSGID_SIZE + STRING_LEN_SIZE + sub.topic.len() as u32 + 1;
    if fo.version.has_properties() {
        remaining += props.wire_len();
    }

    check_capacity(buf, fo, remaining)?;
    begin(buf, fo);

    // Bit 1 of the fixed header is mandatory for SUBSCRIBE.
    buf.put_u8(((PacketType::Subscribe as u8) << 4) | 0x02)?;
    varint::encode_into(buf, remaining)?;
    buf.put_u16(msg_id)?;
    if fo.version.has_properties() {
        props.write_to(buf)?;
    }
    buf.put_lp_bytes(sub.topic.as_bytes())?;

    if fo.version.has_properties() {
        let mut opts = sub.qos as u8;
        if sub.no_local {
            opts |= 0x04;
        }
        if sub.retain_as_published {
            opts |= 0x08;
        }
        opts |= (sub.retain_handling & 0x03) << 4;
        buf.put_u8(opts)?;
    } else {
        buf.put_u8(sub.qos as u8)?;
    }

    finish(buf, fo)
}

/// Encode an UNSUBSCRIBE packet for a single topic filter.
pub fn unsubscribe(buf: &mut ByteBuf, msg_id: u16, topic: &str, fo: FrameOpts) -> Result<()> {
    let mut remaining = MSGID_SIZE + STRING_LEN_SIZE + topic.len() as u32;
    if fo.version.has_properties() {
        remaining += 1; // empty properties block
    }

    check_capacity(buf, fo, remaining)?;
    begin(buf, fo);

    buf.put_u8(((PacketType::Unsubscribe as u8) << 4) | 0x02)?;
    varint::encode_into(buf, remaining)?;
    buf.put_u16(msg_id)?;
    if fo.version.has_properties() {
        buf.put_u8(0)?;
    }
    buf.put_lp_bytes(topic.as_bytes())?;

    finish(buf, fo)
}

// ============================================================================
// Acks, DISCONNECT, PINGREQ
// ============================================================================

/// Acknowledgment packet kind for the QoS 1/2 cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    PubAck,
    PubRec,
    PubRel,
    PubComp,
}

impl AckKind {
    fn header(self) -> u8 {
        match self {
            AckKind::PubAck => (PacketType::PubAck as u8) << 4,
            AckKind::PubRec => (PacketType::PubRec as u8) << 4,
            // PUBREL carries the reserved-bit pattern 0010.
            AckKind::PubRel => ((PacketType::PubRel as u8) << 4) | 0x02,
            AckKind::PubComp => (PacketType::PubComp as u8) << 4,
        }
    }
}

/// Encode a PUBACK/PUBREC/PUBREL/PUBCOMP packet.
///
/// The two-byte form (no reason code) is valid for every version.
pub fn ack(buf: &mut ByteBuf, kind: AckKind, msg_id: u16, fo: FrameOpts) -> Result<()> {
    check_capacity(buf, fo, MSGID_SIZE)?;
    begin(buf, fo);
    buf.put_u8(kind.header())?;
    varint::encode_into(buf, MSGID_SIZE)?;
    buf.put_u16(msg_id)?;
    finish(buf, fo)
}

/// Encode a DISCONNECT packet.
///
/// v5 carries a reason code and optionally a reason-string property;
/// earlier versions have an empty variable header.
pub fn disconnect(
    buf: &mut ByteBuf,
    reason_code: u8,
    reason: Option<&str>,
    fo: FrameOpts,
) -> Result<()> {
    if !fo.version.has_properties() {
        check_capacity(buf, fo, 0)?;
        begin(buf, fo);
        buf.put_u8((PacketType::Disconnect as u8) << 4)?;
        buf.put_u8(0)?;
        return finish(buf, fo);
    }

    let mut props = PropertyBlock::new();
    if let Some(reason) = reason {
        props.put_string(properties::REASON_STRING, reason)?;
    }
    let remaining = 1 + props.wire_len();

    check_capacity(buf, fo, remaining)?;
    begin(buf, fo);
    buf.put_u8((PacketType::Disconnect as u8) << 4)?;
    varint::encode_into(buf, remaining)?;
    buf.put_u8(reason_code)?;
    props.write_to(buf)?;
    finish(buf, fo)
}

/// Encode a PINGREQ packet.
pub fn pingreq(buf: &mut ByteBuf, fo: FrameOpts) -> Result<()> {
    check_capacity(buf, fo, 0)?;
    begin(buf, fo);
    buf.put_u8((PacketType::PingReq as u8) << 4)?;
    buf.put_u8(0)?;
    finish(buf, fo)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode::{parse_packet, Packet, RawPacket};

    fn opts(version: MqttVersion) -> FrameOpts {
        FrameOpts {
            version,
            websocket: false,
        }
    }

    fn split_raw(buf: &ByteBuf) -> RawPacket {
        let bytes = buf.bytes();
        let header = bytes[0];
        let (remaining, consumed) = varint::decode(&bytes[1..]).unwrap().unwrap();
        let body = bytes[1 + consumed..].to_vec();
        assert_eq!(body.len(), remaining as usize, "remaining length mismatch");
        RawPacket {
            ptype: PacketType::from_header(header).unwrap(),
            flags: header & 0x0F,
            body,
        }
    }

    #[test]
    fn test_connect_v311_layout() {
        let mut buf = ByteBuf::with_capacity(256);
        let connect_opts = ConnectOptions {
            client_id: "cid",
            clean_start: true,
            keepalive_secs: 60,
            ..Default::default()
        };
        connect(&mut buf, &connect_opts, opts(MqttVersion::V311)).unwrap();

        let bytes = buf.bytes();
        assert_eq!(bytes[0], 0x10);
        // remaining = 10 (var header) + 2 + 3 (client id)
        assert_eq!(bytes[1], 15);
        assert_eq!(&bytes[2..4], &[0, 4]);
        assert_eq!(&bytes[4..8], b"MQTT");
        assert_eq!(bytes[8], 4); // level
        assert_eq!(bytes[9], 0x02); // clean session
        assert_eq!(&bytes[10..12], &[0, 60]); // keepalive
        assert_eq!(&bytes[12..14], &[0, 3]);
        assert_eq!(&bytes[14..], b"cid");
    }

    #[test]
    fn test_connect_v3_protocol_name() {
        let mut buf = ByteBuf::with_capacity(256);
        let connect_opts = ConnectOptions {
            client_id: "c",
            keepalive_secs: 30,
            ..Default::default()
        };
        connect(&mut buf, &connect_opts, opts(MqttVersion::V3)).unwrap();

        let bytes = buf.bytes();
        assert_eq!(&bytes[2..4], &[0, 6]);
        assert_eq!(&bytes[4..10], b"MQIsdp");
        assert_eq!(bytes[10], 3);
    }

    #[test]
    fn test_connect_full_payload_order() {
        let will = WillMessage {
            topic: "last/will".into(),
            payload: b"gone".to_vec(),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        let connect_opts = ConnectOptions {
            client_id: "cid",
            clean_start: false,
            keepalive_secs: 10,
            username: Some("user"),
            password: Some(b"pass"),
            will: Some(&will),
            properties: None,
        };

        let mut buf = ByteBuf::with_capacity(512);
        connect(&mut buf, &connect_opts, opts(MqttVersion::V311)).unwrap();
        let raw = split_raw(&buf);
        assert_eq!(raw.ptype, PacketType::Connect);

        let flags = raw.body[7];
        assert_eq!(flags & 0x02, 0); // clean off
        assert_ne!(flags & 0x04, 0); // will
        assert_eq!((flags >> 3) & 0x03, 1); // will qos
        assert_ne!(flags & 0x20, 0); // will retain
        assert_ne!(flags & 0x40, 0); // password
        assert_ne!(flags & 0x80, 0); // username

        // Payload: client id, will topic, will payload, username, password.
        let payload = &raw.body[10..];
        let mut off = 0;
        for expected in [&b"cid"[..], b"last/will", b"gone", b"user", b"pass"] {
            let len = usize::from(u16::from_be_bytes([payload[off], payload[off + 1]]));
            assert_eq!(&payload[off + 2..off + 2 + len], expected);
            off += 2 + len;
        }
        assert_eq!(off, payload.len());
    }

    #[test]
    fn test_connect_v5_properties_block() {
        let mut props = PropertyBlock::new();
        props.put_int(properties::SESSION_EXPIRY, 120).unwrap();

        let connect_opts = ConnectOptions {
            client_id: "cid",
            clean_start: true,
            keepalive_secs: 60,
            properties: Some(&props),
            ..Default::default()
        };
        let mut buf = ByteBuf::with_capacity(256);
        connect(&mut buf, &connect_opts, opts(MqttVersion::V5)).unwrap();

        let raw = split_raw(&buf);
        // Properties start after name(6) + level(1) + flags(1) + keepalive(2).
        assert_eq!(raw.body[10], 5); // property area length
        assert_eq!(raw.body[11], properties::SESSION_EXPIRY);
    }

    #[test]
    fn test_publish_remaining_length_qos1() {
        // remaining = 2 + topiclen + 2 (msgid) + payloadlen
        let topic = "bench/t/0";
        let mut buf = ByteBuf::with_capacity(256);
        let msg = PublishMessage::new(topic, b"hello")
            .qos(QoS::AtLeastOnce)
            .msg_id(1);
        publish(&mut buf, &msg, opts(MqttVersion::V311)).unwrap();

        let bytes = buf.bytes();
        assert_eq!(bytes[0], 0x32); // PUBLISH, qos1
        assert_eq!(
            u32::from(bytes[1]),
            2 + topic.len() as u32 + 2 + 5
        );

        // v5 adds one byte for the empty property block.
        let mut buf5 = ByteBuf::with_capacity(256);
        publish(&mut buf5, &msg, opts(MqttVersion::V5)).unwrap();
        assert_eq!(u32::from(buf5.bytes()[1]), 2 + topic.len() as u32 + 2 + 5 + 1);
    }

    #[test]
    fn test_publish_qos0_omits_msg_id() {
        let mut buf = ByteBuf::with_capacity(128);
        publish(
            &mut buf,
            &PublishMessage::new("t", b"x"),
            opts(MqttVersion::V311),
        )
        .unwrap();
        // remaining = 2 + 1 + 1
        assert_eq!(buf.bytes()[1], 4);
    }

    #[test]
    fn test_publish_qos1_requires_msg_id() {
        let mut buf = ByteBuf::with_capacity(128);
        let msg = PublishMessage::new("t", b"x").qos(QoS::AtLeastOnce);
        assert!(matches!(
            publish(&mut buf, &msg, opts(MqttVersion::V311)),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_publish_flags() {
        let mut buf = ByteBuf::with_capacity(128);
        let msg = PublishMessage::new("t", b"x")
            .qos(QoS::ExactlyOnce)
            .msg_id(9)
            .retain(true)
            .dup(true);
        publish(&mut buf, &msg, opts(MqttVersion::V311)).unwrap();
        assert_eq!(buf.bytes()[0], 0x30 | 0x08 | 0x04 | 0x01);
    }

    #[test]
    fn test_subscribe_v311() {
        let mut buf = ByteBuf::with_capacity(128);
        let sub = Subscription::new("a/b", QoS::AtLeastOnce);
        subscribe(&mut buf, 7, &sub, opts(MqttVersion::V311)).unwrap();

        let bytes = buf.bytes();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(bytes[1], 2 + 2 + 3 + 1);
        assert_eq!(&bytes[2..4], &[0, 7]); // msg id
        assert_eq!(&bytes[4..6], &[0, 3]);
        assert_eq!(&bytes[6..9], b"a/b");
        assert_eq!(bytes[9], 1); // requested qos
    }

    #[test]
    fn test_subscribe_v5_options_byte() {
        let mut sub = Subscription::new("a/b", QoS::ExactlyOnce);
        sub.sub_id = Some(3);
        sub.no_local = true;
        sub.retain_as_published = true;
        sub.retain_handling = 2;

        let mut buf = ByteBuf::with_capacity(128);
        subscribe(&mut buf, 7, &sub, opts(MqttVersion::V5)).unwrap();

        let raw = split_raw(&buf);
        assert_eq!(raw.body[2], 2); // property area: varint sub id
        assert_eq!(raw.body[3], properties::SUBSCRIPTION_ID);
        assert_eq!(raw.body[4], 3);
        let opts_byte = *raw.body.last().unwrap();
        assert_eq!(opts_byte & 0x03, 2);
        assert_ne!(opts_byte & 0x04, 0);
        assert_ne!(opts_byte & 0x08, 0);
        assert_eq!((opts_byte >> 4) & 0x03, 2);
    }

    #[test]
    fn test_unsubscribe() {
        let mut buf = ByteBuf::with_capacity(128);
        unsubscribe(&mut buf, 11, "a/b", opts(MqttVersion::V311)).unwrap();
        let bytes = buf.bytes();
        assert_eq!(bytes[0], 0xA2);
        assert_eq!(bytes[1], 2 + 2 + 3);

        let mut buf5 = ByteBuf::with_capacity(128);
        unsubscribe(&mut buf5, 11, "a/b", opts(MqttVersion::V5)).unwrap();
        assert_eq!(buf5.bytes()[1], 2 + 1 + 2 + 3);
    }

    #[test]
    fn test_acks() {
        for (kind, header) in [
            (AckKind::PubAck, 0x40),
            (AckKind::PubRec, 0x50),
            (AckKind::PubRel, 0x62),
            (AckKind::PubComp, 0x70),
        ] {
            let mut buf = ByteBuf::with_capacity(64);
            ack(&mut buf, kind, 0x1234, opts(MqttVersion::V311)).unwrap();
            assert_eq!(buf.bytes(), &[header, 2, 0x12, 0x34], "{:?}", kind);
        }
    }

    #[test]
    fn test_disconnect_versions() {
        let mut buf = ByteBuf::with_capacity(64);
        disconnect(&mut buf, 0, None, opts(MqttVersion::V311)).unwrap();
        assert_eq!(buf.bytes(), &[0xE0, 0]);

        let mut buf = ByteBuf::with_capacity(64);
        disconnect(&mut buf, 0, None, opts(MqttVersion::V5)).unwrap();
        assert_eq!(buf.bytes(), &[0xE0, 2, 0, 0]);

        let mut buf = ByteBuf::with_capacity(256);
        disconnect(&mut buf, 0x04, Some("keep will"), opts(MqttVersion::V5)).unwrap();
        let raw = split_raw(&buf);
        assert_eq!(raw.body[0], 0x04);
        assert_eq!(raw.body[2], properties::REASON_STRING);
    }

    #[test]
    fn test_pingreq() {
        let mut buf = ByteBuf::with_capacity(16);
        pingreq(&mut buf, opts(MqttVersion::V311)).unwrap();
        assert_eq!(buf.bytes(), &[0xC0, 0]);
    }

    #[test]
    fn test_websocket_wrapped_publish() {
        let fo = FrameOpts {
            version: MqttVersion::V311,
            websocket: true,
        };
        let mut buf = ByteBuf::with_capacity(256);
        publish(&mut buf, &PublishMessage::new("t", b"hello"), fo).unwrap();

        let bytes = buf.bytes();
        assert_eq!(bytes[0], 0x82); // FIN + binary
        let mqtt_len = 2 + (2 + 1 + 5); // fixed header + body
        assert_eq!(usize::from(bytes[1] & 0x7F), mqtt_len);
        assert_eq!(bytes.len(), ws::MIN_FRAME_HEADER + mqtt_len);
        assert_eq!(bytes[6], 0x30); // MQTT PUBLISH behind the frame
    }

    #[test]
    fn test_capacity_check_rejects_small_buffer() {
        let mut buf = ByteBuf::with_capacity(8);
        let msg = PublishMessage::new("topic/long/enough", &[0u8; 64]);
        assert!(matches!(
            publish(&mut buf, &msg, opts(MqttVersion::V311)),
            Err(Error::BufferOverflow)
        ));
        // Nothing was written.
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_all_versions() {
        for version in [MqttVersion::V3, MqttVersion::V311, MqttVersion::V5] {
            let fo = opts(version);
            let mut buf = ByteBuf::with_capacity(512);
            let msg = PublishMessage::new("bench/rt", b"payload-bytes")
                .qos(QoS::AtLeastOnce)
                .msg_id(42)
                .retain(true);
            publish(&mut buf, &msg, fo).unwrap();

            let raw = split_raw(&buf);
            match parse_packet(&raw, version).unwrap() {
                Packet::Publish(p) => {
                    assert_eq!(p.topic, "bench/rt");
                    assert_eq!(p.msg_id, 42);
                    assert_eq!(p.qos, QoS::AtLeastOnce);
                    assert!(p.retain);
                    assert!(!p.dup);
                    assert_eq!(p.payload, b"payload-bytes");
                }
                other => panic!("expected publish, got {:?}", other),
            }
        }
    }
}
