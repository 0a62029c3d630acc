// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client MQTT protocol state.
//!
//! The transport layer delivers raw bytes; this module reassembles them
//! into control packets, drives the protocol handshake (CONNECT/CONNACK,
//! SUBSCRIBE/SUBACK), answers the QoS 1/2 acknowledgment cycles, tracks
//! the per-connection message-id window, and reports every transition to
//! the metrics sink.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::codec::decode::{parse_packet, InboundPublish, Packet};
use crate::codec::packet::{self, AckKind, ConnectOptions, QoS};
use crate::codec::properties::PropertyBlock;
use crate::codec::PacketType;
use crate::transport::engine::ProcCtx;
use crate::transport::{Conn, IoOutcome, Modifiers, Phase, Transport};
use crate::Error;

/// Missed PINGRESPs tolerated before the connection is considered dead.
const MAX_PING_RETRIES: u32 = 3;

// ============================================================================
// Protocol state
// ============================================================================

/// MQTT protocol state of one client, orthogonal to the transport phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolState {
    #[default]
    Unknown = 0,
    /// CONNECT sent, CONNACK outstanding.
    ConnectInProcess = 1,
    /// CONNACK accepted.
    Connected = 2,
    /// All configured subscriptions acknowledged; steady state.
    PubSub = 3,
    /// Unsubscribe requested (teardown path).
    DoUnsubscribe = 4,
    UnsubscribeInProcess = 5,
    /// DISCONNECT queued or sent.
    Disconnecting = 6,
    Disconnected = 7,
}

impl ProtocolState {
    pub(crate) fn from_u8(v: u8) -> ProtocolState {
        match v {
            1 => ProtocolState::ConnectInProcess,
            2 => ProtocolState::Connected,
            3 => ProtocolState::PubSub,
            4 => ProtocolState::DoUnsubscribe,
            5 => ProtocolState::UnsubscribeInProcess,
            6 => ProtocolState::Disconnecting,
            7 => ProtocolState::Disconnected,
            _ => ProtocolState::Unknown,
        }
    }

    /// Whether the MQTT session is up and traffic may flow.
    pub fn is_active(&self) -> bool {
        matches!(self, ProtocolState::Connected | ProtocolState::PubSub)
    }
}

/// Session bookkeeping owned by the connection.
#[derive(Debug)]
pub(crate) struct Session {
    pub state: ProtocolState,
    /// SUBACKs outstanding before the session reaches PubSub.
    pub pending_subacks: usize,
    /// UNSUBACKs outstanding during teardown.
    pub pending_unsubacks: usize,
    pub ping_outstanding: u32,
    pub connect_sent_at: Option<Instant>,
    /// Message ids used for SUBSCRIBE/UNSUBSCRIBE, matched on the acks.
    pub control_msg_ids: Vec<u16>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: ProtocolState::Unknown,
            pending_subacks: 0,
            pending_unsubacks: 0,
            ping_outstanding: 0,
            connect_sent_at: None,
            control_msg_ids: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

// ============================================================================
// Inflight message-id table
// ============================================================================

/// State of one QoS > 0 message id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum SlotState {
    #[default]
    Free,
    /// PUBACK (QoS 1) or PUBREC (QoS 2) outstanding.
    AwaitAck,
    /// PUBREL sent, PUBCOMP outstanding.
    AwaitComp,
}

/// Per-connection message-id window for QoS > 0 publishes.
///
/// Ids rotate through `1..=capacity`; id 0 is reserved by the protocol.
#[derive(Debug)]
pub(crate) struct InflightTable {
    slots: Vec<SlotState>,
    next: u16,
    in_use: usize,
}

impl InflightTable {
    pub fn new(capacity: u16) -> Self {
        Self {
            slots: vec![SlotState::Free; usize::from(capacity) + 1],
            next: 1,
            in_use: 0,
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Allocate the next free id, or `None` when the window is full.
    pub fn alloc(&mut self) -> Option<u16> {
        let capacity = self.slots.len() - 1;
        for _ in 0..capacity {
            let id = self.next;
            self.next = if usize::from(self.next) >= capacity {
                1
            } else {
                self.next + 1
            };
            if self.slots[usize::from(id)] == SlotState::Free {
                self.slots[usize::from(id)] = SlotState::AwaitAck;
                self.in_use += 1;
                return Some(id);
            }
        }
        None
    }

    /// PUBACK: frees a QoS 1 slot.
    pub fn on_puback(&mut self, id: u16) -> Result<(), Error> {
        self.free_from(id, SlotState::AwaitAck)
    }

    /// PUBREC: moves a QoS 2 slot to the PUBCOMP wait state.
    pub fn on_pubrec(&mut self, id: u16) -> Result<(), Error> {
        match self.slots.get_mut(usize::from(id)) {
            Some(slot) if *slot == SlotState::AwaitAck => {
                *slot = SlotState::AwaitComp;
                Ok(())
            }
            _ => Err(Error::Protocol("PUBREC for unknown message id")),
        }
    }

    /// PUBCOMP: frees a QoS 2 slot.
    pub fn on_pubcomp(&mut self, id: u16) -> Result<(), Error> {
        self.free_from(id, SlotState::AwaitComp)
    }

    pub fn reset(&mut self) {
        self.slots.fill(SlotState::Free);
        self.next = 1;
        self.in_use = 0;
    }

    fn free_from(&mut self, id: u16, expect: SlotState) -> Result<(), Error> {
        match self.slots.get_mut(usize::from(id)) {
            Some(slot) if *slot == expect => {
                *slot = SlotState::Free;
                self.in_use -= 1;
                Ok(())
            }
            _ => Err(Error::Protocol("acknowledgment for unknown message id")),
        }
    }
}

// ============================================================================
// Outbound submissions (called from the owning processor thread)
// ============================================================================

/// Queue an encoded packet on the connection's pending-send FIFO.
pub(crate) fn push_outbound(
    trans: &Arc<Transport>,
    buf: crate::buffer::ByteBuf,
    ptype: PacketType,
    ctx: &ProcCtx<'_>,
) {
    let mut pq = trans.pending.lock();
    pq.bytes += buf.remaining();
    pq.queue.push_back(buf);
    ctx.shared.metrics.record_tx_packet(ptype);
}

/// Build and queue the CONNECT packet.
pub(crate) fn submit_mqtt_connect(
    trans: &Arc<Transport>,
    c: &mut Conn,
    ctx: &ProcCtx<'_>,
) -> IoOutcome {
    let cfg = &trans.cfg;

    let mut props = PropertyBlock::new();
    let mut props_ref = None;
    if cfg.version.has_properties() && !cfg.user_properties.is_empty() {
        for (name, value) in &cfg.user_properties {
            if props.put_user_property(name, value).is_err() {
                ctx.shared.metrics.record_internal_error();
                break;
            }
        }
        props_ref = Some(&props);
    }

    let opts = ConnectOptions {
        client_id: &cfg.client_id,
        clean_start: cfg.clean_start,
        keepalive_secs: cfg.keepalive_secs,
        username: cfg.username.as_deref(),
        password: cfg.password.as_deref(),
        will: cfg.will.as_ref(),
        properties: props_ref,
    };

    // Force acquisition: the CONNECT must go out even under pool pressure.
    let Some(mut buf) = ctx.tx_pool.acquire(1024, true) else {
        ctx.shared.metrics.record_pool_exhausted();
        return IoOutcome::Continue;
    };
    if let Err(e) = packet::connect(&mut buf, &opts, trans.frame_opts()) {
        ctx.shared.metrics.record_internal_error();
        warn!("client {} CONNECT encode failed: {}", cfg.client_id, e);
        return IoOutcome::Continue;
    }

    c.session.connect_sent_at = Some(Instant::now());
    trans.set_protocol(c, ProtocolState::ConnectInProcess);
    push_outbound(trans, buf, PacketType::Connect, ctx);
    debug!(
        "client {} submitting MQTT CONNECT (version {})",
        cfg.client_id, cfg.version
    );
    IoOutcome::Continue
}

/// Queue a PINGREQ; called from the keepalive timer.
pub(crate) fn submit_ping(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) {
    if !c.session.state.is_active() {
        return;
    }
    if c.session.ping_outstanding >= MAX_PING_RETRIES {
        warn!(
            "client {} missed {} PINGRESPs, tearing connection down",
            trans.cfg.client_id, c.session.ping_outstanding
        );
        c.mods.set(Modifiers::SOCK_ERROR);
        return;
    }

    let Some(mut buf) = ctx.tx_pool.acquire(16, true) else {
        ctx.shared.metrics.record_pool_exhausted();
        return;
    };
    if packet::pingreq(&mut buf, trans.frame_opts()).is_err() {
        ctx.shared.metrics.record_internal_error();
        return;
    }
    c.session.ping_outstanding += 1;
    push_outbound(trans, buf, PacketType::PingReq, ctx);
}

/// Queue SUBSCRIBE packets for every configured subscription.
fn submit_subscriptions(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) {
    c.session.pending_subacks = 0;
    c.session.control_msg_ids.clear();

    for sub in &trans.cfg.subscriptions {
        let Ok(msg_id) = trans.alloc_msg_id() else {
            warn!(
                "client {} cannot allocate id for SUBSCRIBE",
                trans.cfg.client_id
            );
            c.mods.set(Modifiers::SOCK_ERROR);
            return;
        };
        let Some(mut buf) = ctx.tx_pool.acquire(256 + sub.topic.len(), true) else {
            ctx.shared.metrics.record_pool_exhausted();
            return;
        };
        if let Err(e) = packet::subscribe(&mut buf, msg_id, sub, trans.frame_opts()) {
            ctx.shared.metrics.record_internal_error();
            warn!(
                "client {} SUBSCRIBE encode failed: {}",
                trans.cfg.client_id, e
            );
            return;
        }
        c.session.control_msg_ids.push(msg_id);
        c.session.pending_subacks += 1;
        push_outbound(trans, buf, PacketType::Subscribe, ctx);
    }
}

/// Queue UNSUBSCRIBE packets for the teardown path.
pub(crate) fn submit_unsubscribe_all(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) {
    trans.set_protocol(c, ProtocolState::UnsubscribeInProcess);
    c.session.pending_unsubacks = 0;
    c.session.control_msg_ids.clear();

    for sub in &trans.cfg.subscriptions {
        let Ok(msg_id) = trans.alloc_msg_id() else {
            c.mods.set(Modifiers::SOCK_ERROR);
            return;
        };
        let Some(mut buf) = ctx.tx_pool.acquire(64 + sub.topic.len(), true) else {
            ctx.shared.metrics.record_pool_exhausted();
            return;
        };
        if packet::unsubscribe(&mut buf, msg_id, &sub.topic, trans.frame_opts()).is_err() {
            ctx.shared.metrics.record_internal_error();
            return;
        }
        c.session.control_msg_ids.push(msg_id);
        c.session.pending_unsubacks += 1;
        push_outbound(trans, buf, PacketType::Unsubscribe, ctx);
    }

    if c.session.pending_unsubacks == 0 {
        begin_disconnect(trans, c, ctx);
    }
}

/// Queue the graceful DISCONNECT and mark the session as draining.
pub(crate) fn begin_disconnect(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) {
    if !c.session.state.is_active()
        && c.session.state != ProtocolState::UnsubscribeInProcess
    {
        trans.set_phase(c, Phase::ShuttingDown, ctx.shared);
        return;
    }

    let Some(mut buf) = ctx.tx_pool.acquire(64, true) else {
        ctx.shared.metrics.record_pool_exhausted();
        trans.set_phase(c, Phase::ShuttingDown, ctx.shared);
        return;
    };
    if packet::disconnect(&mut buf, 0, None, trans.frame_opts()).is_err() {
        ctx.shared.metrics.record_internal_error();
        trans.set_phase(c, Phase::ShuttingDown, ctx.shared);
        return;
    }
    trans.set_protocol(c, ProtocolState::Disconnecting);
    push_outbound(trans, buf, PacketType::Disconnect, ctx);
    debug!("client {} submitted DISCONNECT", trans.cfg.client_id);
}

/// Queue a bare acknowledgment packet.
fn submit_ack(trans: &Arc<Transport>, kind: AckKind, msg_id: u16, ctx: &ProcCtx<'_>) {
    let Some(mut buf) = ctx.tx_pool.acquire(32, true) else {
        ctx.shared.metrics.record_pool_exhausted();
        return;
    };
    if packet::ack(&mut buf, kind, msg_id, trans.frame_opts()).is_err() {
        ctx.shared.metrics.record_internal_error();
        return;
    }
    let ptype = match kind {
        AckKind::PubAck => PacketType::PubAck,
        AckKind::PubRec => PacketType::PubRec,
        AckKind::PubRel => PacketType::PubRel,
        AckKind::PubComp => PacketType::PubComp,
    };
    push_outbound(trans, buf, ptype, ctx);
}

// ============================================================================
// Inbound dispatch
// ============================================================================

/// Feed one socket read into the reassembly buffer and dispatch every
/// complete packet.
pub(crate) fn on_data(
    trans: &Arc<Transport>,
    c: &mut Conn,
    ctx: &ProcCtx<'_>,
    data: &[u8],
) -> IoOutcome {
    if let Err(e) = c.splitter.feed(data) {
        ctx.shared.metrics.record_malformed_packet();
        warn!("client {} malformed frame: {}", trans.cfg.client_id, e);
        c.mods.set(Modifiers::SOCK_ERROR);
        return IoOutcome::Continue;
    }

    loop {
        let raw = match c.splitter.next_packet() {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                ctx.shared.metrics.record_malformed_packet();
                warn!("client {} malformed packet: {}", trans.cfg.client_id, e);
                c.mods.set(Modifiers::SOCK_ERROR);
                return IoOutcome::Continue;
            }
        };
        ctx.shared.metrics.record_rx_packet(raw.ptype);

        let packet = match parse_packet(&raw, trans.cfg.version) {
            Ok(p) => p,
            Err(e) => {
                ctx.shared.metrics.record_malformed_packet();
                warn!(
                    "client {} malformed {} packet: {}",
                    trans.cfg.client_id, raw.ptype, e
                );
                c.mods.set(Modifiers::SOCK_ERROR);
                return IoOutcome::Continue;
            }
        };

        handle_packet(trans, c, ctx, packet);
        if c.mods.contains(Modifiers::SOCK_ERROR) {
            return IoOutcome::Continue;
        }
    }

    // A WebSocket close frame ends the session once everything in front
    // of it has been dispatched.
    if c.splitter.peer_closed() {
        trans.set_protocol(c, ProtocolState::Disconnected);
        c.mods.set(Modifiers::SOCK_ERROR);
    }
    IoOutcome::Continue
}

fn handle_packet(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>, packet: Packet) {
    match packet {
        Packet::ConnAck {
            session_present: _,
            reason,
        } => on_connack(trans, c, ctx, reason),

        Packet::Publish(publish) => on_publish(trans, c, ctx, publish),

        Packet::PubAck { msg_id } => {
            if let Err(e) = trans.ids.lock().on_puback(msg_id) {
                warn!("client {}: {}", trans.cfg.client_id, e);
            }
        }
        Packet::PubRec { msg_id } => {
            match trans.ids.lock().on_pubrec(msg_id) {
                Ok(()) => submit_ack(trans, AckKind::PubRel, msg_id, ctx),
                Err(e) => warn!("client {}: {}", trans.cfg.client_id, e),
            }
        }
        Packet::PubComp { msg_id } => {
            if let Err(e) = trans.ids.lock().on_pubcomp(msg_id) {
                warn!("client {}: {}", trans.cfg.client_id, e);
            }
        }
        Packet::PubRel { msg_id } => {
            // QoS 2 receive side: complete the cycle.
            submit_ack(trans, AckKind::PubComp, msg_id, ctx);
        }

        Packet::SubAck { msg_id, codes } => on_suback(trans, c, msg_id, &codes),

        Packet::UnsubAck { msg_id } => {
            if let Some(pos) = c.session.control_msg_ids.iter().position(|&id| id == msg_id) {
                c.session.control_msg_ids.swap_remove(pos);
                let _ = trans.ids.lock().on_puback(msg_id);
                c.session.pending_unsubacks = c.session.pending_unsubacks.saturating_sub(1);
                if c.session.pending_unsubacks == 0
                    && c.session.state == ProtocolState::UnsubscribeInProcess
                {
                    begin_disconnect(trans, c, ctx);
                }
            }
        }

        Packet::PingResp => {
            c.session.ping_outstanding = 0;
        }

        Packet::Disconnect { reason } => {
            info!(
                "client {} received server DISCONNECT (reason 0x{:02X})",
                trans.cfg.client_id, reason
            );
            trans.set_protocol(c, ProtocolState::Disconnected);
            c.mods.set(Modifiers::SOCK_ERROR);
        }
    }
}

fn on_connack(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>, reason: u8) {
    if c.session.state != ProtocolState::ConnectInProcess {
        warn!(
            "client {} unexpected CONNACK in state {:?}",
            trans.cfg.client_id, c.session.state
        );
        return;
    }
    if reason != 0 {
        warn!(
            "client {} CONNECT rejected by server (reason 0x{:02X})",
            trans.cfg.client_id, reason
        );
        trans.set_protocol(c, ProtocolState::Disconnected);
        c.mods.set(Modifiers::SOCK_ERROR);
        return;
    }

    let elapsed = c
        .session
        .connect_sent_at
        .map(|t| t.elapsed())
        .unwrap_or_default();
    ctx.shared.metrics.record_mqtt_connect(elapsed);
    trans.set_protocol(c, ProtocolState::Connected);
    debug!("client {} MQTT session established", trans.cfg.client_id);

    // Keepalive pings ride the shared timer thread. Armed once per
    // transport; the rate timer survives reconnects.
    if trans.cfg.keepalive_secs > 0 && !c.ping_timer_armed {
        ctx.shared.timer.set_rate(
            std::time::Duration::from_secs(u64::from(trans.cfg.keepalive_secs)),
            crate::timer::TimerEvent::Ping(Arc::clone(trans)),
        );
        c.ping_timer_armed = true;
    }

    if trans.cfg.subscriptions.is_empty() {
        trans.set_protocol(c, ProtocolState::PubSub);
    } else {
        submit_subscriptions(trans, c, ctx);
    }
}

fn on_suback(trans: &Arc<Transport>, c: &mut Conn, msg_id: u16, codes: &[u8]) {
    let Some(pos) = c.session.control_msg_ids.iter().position(|&id| id == msg_id) else {
        warn!(
            "client {} SUBACK for unknown message id {}",
            trans.cfg.client_id, msg_id
        );
        return;
    };
    c.session.control_msg_ids.swap_remove(pos);
    let _ = trans.ids.lock().on_puback(msg_id);

    for &code in codes {
        if code >= 0x80 {
            warn!(
                "client {} subscription refused (reason 0x{:02X})",
                trans.cfg.client_id, code
            );
        }
    }

    c.session.pending_subacks = c.session.pending_subacks.saturating_sub(1);
    if c.session.pending_subacks == 0 && c.session.state == ProtocolState::Connected {
        trans.set_protocol(c, ProtocolState::PubSub);
        debug!("client {} reached PubSub state", trans.cfg.client_id);
    }
}

fn on_publish(trans: &Arc<Transport>, _c: &mut Conn, ctx: &ProcCtx<'_>, publish: InboundPublish) {
    // Payload content is the measurement layer's concern; the engine only
    // answers the acknowledgment cycle.
    match publish.qos {
        QoS::AtMostOnce => {}
        QoS::AtLeastOnce => submit_ack(trans, AckKind::PubAck, publish.msg_id, ctx),
        QoS::ExactlyOnce => submit_ack(trans, AckKind::PubRec, publish.msg_id, ctx),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_state_roundtrip() {
        for state in [
            ProtocolState::Unknown,
            ProtocolState::ConnectInProcess,
            ProtocolState::Connected,
            ProtocolState::PubSub,
            ProtocolState::DoUnsubscribe,
            ProtocolState::UnsubscribeInProcess,
            ProtocolState::Disconnecting,
            ProtocolState::Disconnected,
        ] {
            assert_eq!(ProtocolState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_protocol_state_active() {
        assert!(ProtocolState::Connected.is_active());
        assert!(ProtocolState::PubSub.is_active());
        assert!(!ProtocolState::ConnectInProcess.is_active());
        assert!(!ProtocolState::Disconnected.is_active());
    }

    #[test]
    fn test_inflight_alloc_unique() {
        let mut table = InflightTable::new(8);
        let a = table.alloc().unwrap();
        let b = table.alloc().unwrap();
        assert_ne!(a, b);
        assert!(a >= 1 && b >= 1);
        assert_eq!(table.in_use(), 2);
    }

    #[test]
    fn test_inflight_puback_frees_slot() {
        let mut table = InflightTable::new(2);
        let a = table.alloc().unwrap();
        let b = table.alloc().unwrap();
        assert!(table.alloc().is_none()); // window full

        table.on_puback(a).unwrap();
        assert_eq!(table.in_use(), 1);

        // Slot is reusable.
        let c = table.alloc().unwrap();
        assert_ne!(c, b);
    }

    #[test]
    fn test_inflight_qos2_cycle() {
        let mut table = InflightTable::new(4);
        let id = table.alloc().unwrap();

        // PUBACK is invalid once the slot moved past AwaitAck.
        table.on_pubrec(id).unwrap();
        assert!(table.on_puback(id).is_err());
        assert_eq!(table.in_use(), 1);

        table.on_pubcomp(id).unwrap();
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn test_inflight_unknown_id_rejected() {
        let mut table = InflightTable::new(4);
        assert!(table.on_puback(1).is_err());
        assert!(table.on_pubrec(9).is_err());
        assert!(table.on_pubcomp(0).is_err());
    }

    #[test]
    fn test_inflight_reset() {
        let mut table = InflightTable::new(4);
        let _ = table.alloc().unwrap();
        let _ = table.alloc().unwrap();
        table.reset();
        assert_eq!(table.in_use(), 0);
        assert_eq!(table.alloc(), Some(1));
    }

    #[test]
    fn test_inflight_window_wraps() {
        let mut table = InflightTable::new(3);
        let ids: Vec<u16> = (0..3).map(|_| table.alloc().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        table.on_puback(2).unwrap();
        assert_eq!(table.alloc(), Some(2));
    }

    #[test]
    fn test_session_reset() {
        let mut session = Session::new();
        session.state = ProtocolState::PubSub;
        session.ping_outstanding = 2;
        session.control_msg_ids.push(7);

        session.reset();
        assert_eq!(session.state, ProtocolState::Unknown);
        assert_eq!(session.ping_outstanding, 0);
        assert!(session.control_msg_ids.is_empty());
    }
}
