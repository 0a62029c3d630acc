// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT v5 properties: encoding helpers and the validating parser.
//!
//! Every property ID is checked against a static table carrying its wire
//! type and the control-packet contexts it is permitted in. The parser
//! rejects unknown IDs, IDs outside the current context, duplicated
//! single-valued properties, and values whose declared length does not fit
//! the remaining area — all as [`crate::Error::MalformedPacket`].

use crate::buffer::ByteBuf;
use crate::codec::varint;
use crate::{Error, Result};

// ============================================================================
// Contexts
// ============================================================================

/// Packet-context bits for property validity checks.
pub mod ctx {
    pub const CONNECT: u16 = 1 << 0;
    pub const CONNACK: u16 = 1 << 1;
    pub const PUBLISH: u16 = 1 << 2;
    pub const WILL: u16 = 1 << 3;
    pub const PUBACK: u16 = 1 << 4;
    pub const SUBSCRIBE: u16 = 1 << 5;
    pub const SUBACK: u16 = 1 << 6;
    pub const UNSUBSCRIBE: u16 = 1 << 7;
    pub const UNSUBACK: u16 = 1 << 8;
    pub const DISCONNECT: u16 = 1 << 9;
    pub const AUTH: u16 = 1 << 10;

    /// Contexts in which user properties are allowed (all of them).
    pub const ALL: u16 = (1 << 11) - 1;
}

// ============================================================================
// Property table
// ============================================================================

/// Wire type of a property value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropType {
    Bool,
    Int1,
    Int2,
    Int4,
    String,
    Bytes,
    NamePair,
    VarInt,
}

/// Static description of one property ID.
#[derive(Debug)]
pub struct PropertySpec {
    pub id: u8,
    pub name: &'static str,
    pub ty: PropType,
    pub contexts: u16,
    /// Whether the property may appear more than once in a packet.
    pub multi: bool,
}

/// Well-known property IDs.
pub const PAYLOAD_FORMAT: u8 = 1;
pub const MESSAGE_EXPIRY: u8 = 2;
pub const CONTENT_TYPE: u8 = 3;
pub const RESPONSE_TOPIC: u8 = 8;
pub const CORRELATION_DATA: u8 = 9;
pub const SUBSCRIPTION_ID: u8 = 11;
pub const SESSION_EXPIRY: u8 = 17;
pub const ASSIGNED_CLIENT_ID: u8 = 18;
pub const SERVER_KEEPALIVE: u8 = 19;
pub const AUTH_METHOD: u8 = 21;
pub const AUTH_DATA: u8 = 22;
pub const REQUEST_PROBLEM_INFO: u8 = 23;
pub const WILL_DELAY: u8 = 24;
pub const REQUEST_RESPONSE_INFO: u8 = 25;
pub const RESPONSE_INFO: u8 = 26;
pub const SERVER_REFERENCE: u8 = 28;
pub const REASON_STRING: u8 = 31;
pub const RECEIVE_MAXIMUM: u8 = 33;
pub const TOPIC_ALIAS_MAXIMUM: u8 = 34;
pub const TOPIC_ALIAS: u8 = 35;
pub const MAXIMUM_QOS: u8 = 36;
pub const RETAIN_AVAILABLE: u8 = 37;
pub const USER_PROPERTY: u8 = 38;
pub const MAXIMUM_PACKET_SIZE: u8 = 39;
pub const WILDCARD_SUB_AVAILABLE: u8 = 40;
pub const SUB_ID_AVAILABLE: u8 = 41;
pub const SHARED_SUB_AVAILABLE: u8 = 42;

const ACKS: u16 = ctx::PUBACK | ctx::SUBACK | ctx::UNSUBACK;

static PROPERTIES: &[PropertySpec] = &[
    PropertySpec { id: PAYLOAD_FORMAT, name: "PayloadFormatIndicator", ty: PropType::Int1, contexts: ctx::PUBLISH | ctx::WILL, multi: false },
    PropertySpec { id: MESSAGE_EXPIRY, name: "MessageExpiryInterval", ty: PropType::Int4, contexts: ctx::PUBLISH | ctx::WILL, multi: false },
    PropertySpec { id: CONTENT_TYPE, name: "ContentType", ty: PropType::String, contexts: ctx::PUBLISH | ctx::WILL, multi: false },
    PropertySpec { id: RESPONSE_TOPIC, name: "ResponseTopic", ty: PropType::String, contexts: ctx::PUBLISH | ctx::WILL, multi: false },
    PropertySpec { id: CORRELATION_DATA, name: "CorrelationData", ty: PropType::Bytes, contexts: ctx::PUBLISH | ctx::WILL, multi: false },
    PropertySpec { id: SUBSCRIPTION_ID, name: "SubscriptionIdentifier", ty: PropType::VarInt, contexts: ctx::PUBLISH | ctx::SUBSCRIBE, multi: true },
    PropertySpec { id: SESSION_EXPIRY, name: "SessionExpiryInterval", ty: PropType::Int4, contexts: ctx::CONNECT | ctx::CONNACK | ctx::DISCONNECT, multi: false },
    PropertySpec { id: ASSIGNED_CLIENT_ID, name: "AssignedClientIdentifier", ty: PropType::String, contexts: ctx::CONNACK, multi: false },
    PropertySpec { id: SERVER_KEEPALIVE, name: "ServerKeepAlive", ty: PropType::Int2, contexts: ctx::CONNACK, multi: false },
    PropertySpec { id: AUTH_METHOD, name: "AuthenticationMethod", ty: PropType::String, contexts: ctx::CONNECT | ctx::CONNACK | ctx::AUTH, multi: false },
    PropertySpec { id: AUTH_DATA, name: "AuthenticationData", ty: PropType::Bytes, contexts: ctx::CONNECT | ctx::CONNACK | ctx::AUTH, multi: false },
    PropertySpec { id: REQUEST_PROBLEM_INFO, name: "RequestProblemInformation", ty: PropType::Int1, contexts: ctx::CONNECT, multi: false },
    PropertySpec { id: WILL_DELAY, name: "WillDelayInterval", ty: PropType::Int4, contexts: ctx::WILL, multi: false },
    PropertySpec { id: REQUEST_RESPONSE_INFO, name: "RequestResponseInformation", ty: PropType::Int1, contexts: ctx::CONNECT, multi: false },
    PropertySpec { id: RESPONSE_INFO, name: "ResponseInformation", ty: PropType::String, contexts: ctx::CONNACK, multi: false },
    PropertySpec { id: SERVER_REFERENCE, name: "ServerReference", ty: PropType::String, contexts: ctx::CONNACK | ctx::DISCONNECT, multi: false },
    PropertySpec { id: REASON_STRING, name: "ReasonString", ty: PropType::String, contexts: ctx::CONNACK | ACKS | ctx::DISCONNECT | ctx::AUTH, multi: false },
    PropertySpec { id: RECEIVE_MAXIMUM, name: "ReceiveMaximum", ty: PropType::Int2, contexts: ctx::CONNECT | ctx::CONNACK, multi: false },
    PropertySpec { id: TOPIC_ALIAS_MAXIMUM, name: "TopicAliasMaximum", ty: PropType::Int2, contexts: ctx::CONNECT | ctx::CONNACK, multi: false },
    PropertySpec { id: TOPIC_ALIAS, name: "TopicAlias", ty: PropType::Int2, contexts: ctx::PUBLISH, multi: false },
    PropertySpec { id: MAXIMUM_QOS, name: "MaximumQoS", ty: PropType::Int1, contexts: ctx::CONNACK, multi: false },
    PropertySpec { id: RETAIN_AVAILABLE, name: "RetainAvailable", ty: PropType::Int1, contexts: ctx::CONNACK, multi: false },
    PropertySpec { id: USER_PROPERTY, name: "UserProperty", ty: PropType::NamePair, contexts: ctx::ALL, multi: true },
    PropertySpec { id: MAXIMUM_PACKET_SIZE, name: "MaximumPacketSize", ty: PropType::Int4, contexts: ctx::CONNECT | ctx::CONNACK, multi: false },
    PropertySpec { id: WILDCARD_SUB_AVAILABLE, name: "WildcardSubscriptionAvailable", ty: PropType::Int1, contexts: ctx::CONNACK, multi: false },
    PropertySpec { id: SUB_ID_AVAILABLE, name: "SubscriptionIdentifierAvailable", ty: PropType::Int1, contexts: ctx::CONNACK, multi: false },
    PropertySpec { id: SHARED_SUB_AVAILABLE, name: "SharedSubscriptionAvailable", ty: PropType::Int1, contexts: ctx::CONNACK, multi: false },
];

/// Highest property ID in the table.
const MAX_PROP_ID: usize = 42;

/// Look up a property ID in the static table.
pub fn lookup(id: u8) -> Option<&'static PropertySpec> {
    PROPERTIES.iter().find(|p| p.id == id)
}

// ============================================================================
// Encoding
// ============================================================================

/// Staging area for building a property sub-block before the packet's
/// remaining length is known. Fixed-capacity, no heap allocation.
#[derive(Debug)]
pub struct PropertyBlock {
    data: [u8; PropertyBlock::CAPACITY],
    len: usize,
}

impl PropertyBlock {
    pub const CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self {
            data: [0u8; Self::CAPACITY],
            len: 0,
        }
    }

    /// Encoded length of the property area (without its varint prefix).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes on the wire plus the varint length prefix.
    ///
    /// An empty block still costs one byte (the zero length).
    pub fn wire_len(&self) -> u32 {
        varint::encoded_len(self.len as u32) as u32 + self.len as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.len + bytes.len() > Self::CAPACITY {
            return Err(Error::BufferOverflow);
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Append an integer-typed property, encoded per its declared type.
    pub fn put_int(&mut self, id: u8, value: u32) -> Result<()> {
        let spec = lookup(id).ok_or(Error::MalformedPacket("unknown property id"))?;
        self.push(&[id])?;
        match spec.ty {
            PropType::Bool => Ok(()),
            PropType::Int1 => self.push(&[value as u8]),
            PropType::Int2 => self.push(&(value as u16).to_be_bytes()),
            PropType::Int4 => self.push(&value.to_be_bytes()),
            PropType::VarInt => {
                let mut tmp = [0u8; 4];
                let mut v = value;
                let mut n = 0;
                loop {
                    let mut b = (v % 128) as u8;
                    v >>= 7;
                    if v > 0 {
                        b |= 0x80;
                    }
                    tmp[n] = b;
                    n += 1;
                    if v == 0 {
                        break;
                    }
                }
                self.push(&tmp[..n])
            }
            _ => Err(Error::MalformedPacket("property is not integer typed")),
        }
    }

    /// Append a string-typed property.
    pub fn put_string(&mut self, id: u8, value: &str) -> Result<()> {
        self.push(&[id])?;
        self.push(&(value.len() as u16).to_be_bytes())?;
        self.push(value.as_bytes())
    }

    /// Append a binary-typed property.
    pub fn put_bytes(&mut self, id: u8, value: &[u8]) -> Result<()> {
        self.push(&[id])?;
        self.push(&(value.len() as u16).to_be_bytes())?;
        self.push(value)
    }

    /// Append a user property name/value pair.
    pub fn put_user_property(&mut self, name: &str, value: &str) -> Result<()> {
        self.push(&[USER_PROPERTY])?;
        self.push(&(name.len() as u16).to_be_bytes())?;
        self.push(name.as_bytes())?;
        self.push(&(value.len() as u16).to_be_bytes())?;
        self.push(value.as_bytes())
    }

    /// Write the varint length prefix and the property area into `buf`.
    pub fn write_to(&self, buf: &mut ByteBuf) -> Result<()> {
        varint::encode_into(buf, self.len as u32)?;
        buf.put_slice(self.as_bytes())
    }
}

impl Default for PropertyBlock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Per-property callback for context-specific checks. Receives the spec,
/// the raw value bytes, and the decoded integer value (type dependent).
pub type PropertyChecker<'a> = &'a mut dyn FnMut(&PropertySpec, &[u8], u32) -> Result<()>;

/// Validate a property area against a packet context.
///
/// Walks every property, checking that the ID is known, permitted in
/// `contexts`, not duplicated unless multi-valued, and that its declared
/// length fits the remaining area. `checker`, when supplied, is invoked
/// per property after the structural checks pass.
pub fn validate(
    mut area: &[u8],
    contexts: u16,
    mut checker: Option<PropertyChecker<'_>>,
) -> Result<()> {
    let mut seen = [false; MAX_PROP_ID + 1];

    while !area.is_empty() {
        let id = area[0];
        area = &area[1..];

        let spec = lookup(id).ok_or(Error::MalformedPacket("unknown property id"))?;
        if spec.contexts & contexts == 0 {
            return Err(Error::MalformedPacket("property invalid in this context"));
        }
        if seen[id as usize] && !spec.multi {
            return Err(Error::MalformedPacket("duplicate property"));
        }
        seen[id as usize] = true;

        let mut value: u32 = 0;
        let datalen: usize = match spec.ty {
            PropType::Bool => {
                value = 1;
                0
            }
            PropType::Int1 => {
                if let Some(&b) = area.first() {
                    value = u32::from(b);
                }
                1
            }
            PropType::Int2 => {
                if area.len() >= 2 {
                    value = u32::from(u16::from_be_bytes([area[0], area[1]]));
                }
                2
            }
            PropType::Int4 => {
                if area.len() >= 4 {
                    value = u32::from_be_bytes([area[0], area[1], area[2], area[3]]);
                }
                4
            }
            PropType::String | PropType::Bytes => {
                if area.len() < 2 {
                    return Err(Error::MalformedPacket("truncated property length"));
                }
                let len = usize::from(u16::from_be_bytes([area[0], area[1]]));
                area = &area[2..];
                len
            }
            PropType::NamePair => {
                if area.len() < 4 {
                    return Err(Error::MalformedPacket("truncated name pair"));
                }
                let name_len = usize::from(u16::from_be_bytes([area[0], area[1]]));
                if name_len + 4 > area.len() {
                    return Err(Error::MalformedPacket("name pair name too long"));
                }
                let val_off = 2 + name_len;
                let val_len =
                    usize::from(u16::from_be_bytes([area[val_off], area[val_off + 1]]));
                if name_len + val_len + 4 > area.len() {
                    return Err(Error::MalformedPacket("name pair value too long"));
                }
                value = name_len as u32;
                name_len + val_len + 4
            }
            PropType::VarInt => match varint::decode(area)? {
                Some((v, consumed)) => {
                    value = v;
                    consumed
                }
                None => return Err(Error::MalformedPacket("truncated varint property")),
            },
        };

        if area.len() < datalen {
            return Err(Error::MalformedPacket("property data past end of area"));
        }
        if let Some(check) = checker.as_mut() {
            check(spec, &area[..datalen], value)?;
        }
        area = &area[datalen..];
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup(USER_PROPERTY).unwrap().name, "UserProperty");
        assert_eq!(lookup(TOPIC_ALIAS).unwrap().ty, PropType::Int2);
        assert!(lookup(0).is_none());
        assert!(lookup(99).is_none());
    }

    #[test]
    fn test_block_int_encodings() {
        let mut block = PropertyBlock::new();
        block.put_int(TOPIC_ALIAS, 7).unwrap();
        assert_eq!(block.as_bytes(), &[TOPIC_ALIAS, 0, 7]);

        let mut block = PropertyBlock::new();
        block.put_int(SESSION_EXPIRY, 300).unwrap();
        assert_eq!(block.as_bytes(), &[SESSION_EXPIRY, 0, 0, 1, 44]);

        let mut block = PropertyBlock::new();
        block.put_int(SUBSCRIPTION_ID, 200).unwrap();
        assert_eq!(block.as_bytes(), &[SUBSCRIPTION_ID, 0xC8, 0x01]);
    }

    #[test]
    fn test_block_validates_clean() {
        let mut block = PropertyBlock::new();
        block.put_int(TOPIC_ALIAS, 4).unwrap();
        block.put_user_property("ts", "12345").unwrap();
        block.put_user_property("seq", "1").unwrap();

        validate(block.as_bytes(), ctx::PUBLISH, None).unwrap();
    }

    #[test]
    fn test_unknown_id_rejected() {
        let area = [0x63u8, 0x00]; // 99 is not a property
        let err = validate(&area, ctx::PUBLISH, None).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }

    #[test]
    fn test_wrong_context_rejected() {
        let mut block = PropertyBlock::new();
        block.put_int(TOPIC_ALIAS, 4).unwrap();
        // TopicAlias is a PUBLISH property, not valid in CONNECT.
        let err = validate(block.as_bytes(), ctx::CONNECT, None).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }

    #[test]
    fn test_duplicate_single_valued_rejected() {
        let mut block = PropertyBlock::new();
        block.put_int(TOPIC_ALIAS, 4).unwrap();
        block.put_int(TOPIC_ALIAS, 5).unwrap();
        let err = validate(block.as_bytes(), ctx::PUBLISH, None).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }

    #[test]
    fn test_duplicate_multi_valued_allowed() {
        let mut block = PropertyBlock::new();
        block.put_user_property("a", "1").unwrap();
        block.put_user_property("b", "2").unwrap();
        validate(block.as_bytes(), ctx::PUBLISH, None).unwrap();
    }

    #[test]
    fn test_truncated_string_rejected() {
        // ContentType with declared length 10 but only 3 bytes present.
        let area = [CONTENT_TYPE, 0x00, 0x0A, b'a', b'b', b'c'];
        let err = validate(&area, ctx::PUBLISH, None).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }

    #[test]
    fn test_truncated_name_pair_rejected() {
        let area = [USER_PROPERTY, 0x00, 0x05, b'x'];
        assert!(validate(&area, ctx::PUBLISH, None).is_err());
    }

    #[test]
    fn test_checker_invoked_with_values() {
        let mut block = PropertyBlock::new();
        block.put_int(TOPIC_ALIAS, 42).unwrap();
        block.put_string(CONTENT_TYPE, "json").unwrap();

        let mut ids = Vec::new();
        let mut check = |spec: &PropertySpec, data: &[u8], value: u32| {
            ids.push((spec.id, value, data.len()));
            Ok(())
        };
        validate(block.as_bytes(), ctx::PUBLISH, Some(&mut check)).unwrap();

        assert_eq!(ids, vec![(TOPIC_ALIAS, 42, 2), (CONTENT_TYPE, 0, 4)]);
    }

    #[test]
    fn test_checker_error_propagates() {
        let mut block = PropertyBlock::new();
        block.put_int(MAXIMUM_QOS, 1).unwrap();

        let mut check = |_: &PropertySpec, _: &[u8], value: u32| {
            if value > 0 {
                Err(Error::Protocol("QoS downgrade not supported"))
            } else {
                Ok(())
            }
        };
        let err = validate(block.as_bytes(), ctx::CONNACK, Some(&mut check)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_wire_len_includes_prefix() {
        let block = PropertyBlock::new();
        assert_eq!(block.wire_len(), 1); // just the zero-length byte

        let mut block = PropertyBlock::new();
        block.put_int(TOPIC_ALIAS, 1).unwrap();
        assert_eq!(block.wire_len(), 1 + 3);
    }
}
