// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT and WebSocket wire-format codec.
//!
//! Pure encode/decode routines writing directly into caller-supplied
//! [`crate::ByteBuf`]s. Encoders compute the remaining length as a
//! closed-form sum of fixed and variable segments before writing, so a
//! single capacity check up front guarantees the cursor invariant
//! `read <= write <= capacity` on return.
//!
//! Wire formats covered:
//! - MQTT v3.1 (protocol name `MQIsdp`, level 3)
//! - MQTT v3.1.1 (`MQTT`, level 4)
//! - MQTT v5 (`MQTT`, level 5) including the length-prefixed properties
//!   sub-block
//! - RFC6455 client framing (masked data frames, HTTP upgrade handshake)

pub mod decode;
pub mod packet;
pub mod properties;
pub mod varint;
pub mod ws;

// ============================================================================
// Control packet types
// ============================================================================

/// MQTT control packet type (upper nibble of the fixed header).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    /// Decode the packet type from a fixed-header byte.
    pub fn from_header(byte: u8) -> Option<PacketType> {
        Some(match byte >> 4 {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            15 => PacketType::Auth,
            _ => return None,
        })
    }

    /// Index usable for per-type counter arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PacketType::Connect => "CONNECT",
            PacketType::ConnAck => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::PubAck => "PUBACK",
            PacketType::PubRec => "PUBREC",
            PacketType::PubRel => "PUBREL",
            PacketType::PubComp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::SubAck => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::UnsubAck => "UNSUBACK",
            PacketType::PingReq => "PINGREQ",
            PacketType::PingResp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::Auth => "AUTH",
        };
        f.write_str(s)
    }
}

/// Number of distinct control packet types (for counter arrays).
pub const NUM_PACKET_TYPES: usize = 16;

/// Size of a two-byte message-id field.
pub const MSGID_SIZE: u32 = 2;

/// Size of a UTF-8 string length prefix.
pub const STRING_LEN_SIZE: u32 = 2;
