// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection transport and its state machine.
//!
//! A [`Transport`] owns one socket (plain or TLS), its pending-send FIFO,
//! receive reassembly state and the connection state descriptor. It is
//! serviced by exactly one processor thread at a time (enforced by the
//! `in_processing` flag) and referenced, not owned, by its listener thread
//! through the poll registration.
//!
//! # State machine
//!
//! ```text
//!   NeedCreate -> NeedConnect -> Handshaking -> [ws upgrade] -> Connected
//!        ^                                                          |
//!        |            schedule_reconnect (backoff timer)            v
//!        +------------------------- error <---------------- ShuttingDown
//!                                                                  |
//!                                                                  v
//!                                                            Disconnected
//! ```
//!
//! Orthogonal modifier flags (CanRead/CanWrite/want-read/want-write/...)
//! track readiness separately from the phase; would-block conditions are
//! recorded there and retried on the next epoll event, never surfaced as
//! errors.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, warn};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::ByteBuf;
use crate::codec::decode::FrameSplitter;
use crate::codec::packet::FrameOpts;
use crate::codec::ws;
use crate::config::{ClientConfig, EngineConfig};
use crate::reconnect::{schedule_reconnect, BackoffPolicy};
use crate::session::{self, InflightTable, ProtocolState, Session};
use crate::transport::engine::{EngineShared, ProcCtx};
use crate::transport::stream::{
    HandshakeOutcome, NetStream, PlainStream, ReadOutcome, TlsStream, WriteOutcome,
};
use crate::{Error, Result};

pub mod engine;
pub mod listener;
pub mod processor;
pub mod stream;

/// Socket errors are logged every Nth occurrence to avoid log storms at
/// very high connection counts.
pub(crate) const ERROR_LOG_INTERVAL: u64 = 5000;

// ============================================================================
// Phase and modifiers
// ============================================================================

/// Primary connection phase. Exactly one at all times.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    /// No socket exists yet (initial state, and reconnect re-entry point).
    #[default]
    NeedCreate = 0,
    /// Socket created, `connect()` not yet issued.
    NeedConnect = 1,
    /// TCP and, when enabled, TLS handshake in progress.
    Handshaking = 2,
    /// Transport established; MQTT traffic flows.
    Connected = 3,
    /// Orderly teardown in progress.
    ShuttingDown = 4,
    /// Terminal until a reconnect re-creates the socket.
    Disconnected = 5,
}

impl Phase {
    pub(crate) fn from_u8(v: u8) -> Phase {
        match v {
            1 => Phase::NeedConnect,
            2 => Phase::Handshaking,
            3 => Phase::Connected,
            4 => Phase::ShuttingDown,
            5 => Phase::Disconnected,
            _ => Phase::NeedCreate,
        }
    }

    /// Whether the connection is still being established.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Phase::NeedCreate | Phase::NeedConnect | Phase::Handshaking
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::NeedCreate => "NeedCreate",
            Phase::NeedConnect => "NeedConnect",
            Phase::Handshaking => "Handshaking",
            Phase::Connected => "Connected",
            Phase::ShuttingDown => "ShuttingDown",
            Phase::Disconnected => "Disconnected",
        };
        f.write_str(s)
    }
}

/// Orthogonal state modifier flags.
///
/// Kept separate from [`Phase`] so invalid phase combinations stay
/// unrepresentable while readiness can overlay any phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Modifiers(u16);

impl Modifiers {
    pub const CAN_READ: u16 = 1 << 0;
    pub const CAN_WRITE: u16 = 1 << 1;
    /// TLS read needs a readable socket.
    pub const READ_WANT_READ: u16 = 1 << 2;
    /// TLS read needs a writable socket (renegotiation traffic).
    pub const READ_WANT_WRITE: u16 = 1 << 3;
    /// TLS write needs a readable socket.
    pub const WRITE_WANT_READ: u16 = 1 << 4;
    /// TLS write needs a writable socket.
    pub const WRITE_WANT_WRITE: u16 = 1 << 5;
    /// WebSocket upgrade response outstanding.
    pub const WS_IN_PROCESS: u16 = 1 << 6;
    /// A socket-level error was observed.
    pub const SOCK_ERROR: u16 = 1 << 7;
    /// Graceful shutdown deferred until pending sends flush.
    pub const DEFERRED_SHUTDOWN: u16 = 1 << 8;

    pub fn empty() -> Modifiers {
        Modifiers(0)
    }

    pub fn set(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn clear(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    pub fn contains(&self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Outcome of one state-machine step, consumed only by the processor loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IoOutcome {
    /// Keep the connection in the processor's local run list.
    Continue,
    /// Drop from the run list until the next readiness event or timer job.
    AwaitEvent,
    /// Tear the connection down.
    Shutdown,
}

// ============================================================================
// Transport
// ============================================================================

/// Pending-send FIFO shared between the submission path and the owning
/// processor thread.
pub(crate) struct PendingQueue {
    pub queue: std::collections::VecDeque<ByteBuf>,
    pub bytes: usize,
}

/// One simulated client connection.
pub struct Transport {
    pub(crate) id: u64,
    pub(crate) cfg: Arc<ClientConfig>,
    pub(crate) listener_idx: usize,
    pub(crate) processor_idx: usize,

    /// Set while the connection sits in a processor's active run list;
    /// prevents two processors servicing it concurrently.
    pub(crate) in_processing: AtomicBool,

    // Lock-free snapshots for external reporting and the timer scan.
    phase_tag: AtomicU8,
    proto_tag: AtomicU8,
    phase_changed_ms: AtomicU64,

    pub(crate) pending: Mutex<PendingQueue>,
    pub(crate) ids: Mutex<InflightTable>,
    pub(crate) conn: Mutex<Conn>,
}

impl Transport {
    pub(crate) fn new(
        id: u64,
        cfg: Arc<ClientConfig>,
        listener_idx: usize,
        processor_idx: usize,
        econfig: &EngineConfig,
    ) -> Self {
        let conn = Conn::new(&cfg, econfig);
        let max_inflight = cfg.max_inflight;
        Self {
            id,
            cfg,
            listener_idx,
            processor_idx,
            in_processing: AtomicBool::new(false),
            phase_tag: AtomicU8::new(Phase::NeedCreate as u8),
            proto_tag: AtomicU8::new(ProtocolState::Unknown as u8),
            phase_changed_ms: AtomicU64::new(0),
            pending: Mutex::new(PendingQueue {
                queue: std::collections::VecDeque::new(),
                bytes: 0,
            }),
            ids: Mutex::new(InflightTable::new(max_inflight)),
            conn: Mutex::new(conn),
        }
    }

    /// Engine-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The client configuration behind this connection.
    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    /// Current primary phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase_tag.load(Ordering::Acquire))
    }

    /// Current MQTT protocol state.
    pub fn protocol_state(&self) -> ProtocolState {
        ProtocolState::from_u8(self.proto_tag.load(Ordering::Acquire))
    }

    /// Milliseconds (engine epoch) of the last phase change.
    pub(crate) fn phase_changed_ms(&self) -> u64 {
        self.phase_changed_ms.load(Ordering::Acquire)
    }

    /// Framing options for codec calls on this connection.
    pub fn frame_opts(&self) -> FrameOpts {
        FrameOpts {
            version: self.cfg.version,
            websocket: self.cfg.websocket,
        }
    }

    /// Allocate a message id for a QoS > 0 publish.
    ///
    /// Ids are unique per connection, not globally; the slot is freed when
    /// the matching PUBACK (QoS 1) or PUBCOMP (QoS 2) arrives.
    pub fn alloc_msg_id(&self) -> Result<u16> {
        self.ids
            .lock()
            .alloc()
            .ok_or(Error::InvalidState("message-id window exhausted"))
    }

    /// Number of QoS > 0 messages awaiting acknowledgment.
    pub fn inflight(&self) -> usize {
        self.ids.lock().in_use()
    }

    pub(crate) fn set_phase(&self, c: &mut Conn, phase: Phase, shared: &EngineShared) {
        if c.phase != phase {
            c.phase = phase;
            self.phase_tag.store(phase as u8, Ordering::Release);
            self.phase_changed_ms
                .store(shared.now_ms(), Ordering::Release);
        }
    }

    pub(crate) fn set_protocol(&self, c: &mut Conn, state: ProtocolState) {
        c.session.state = state;
        self.proto_tag.store(state as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("client_id", &self.cfg.client_id)
            .field("phase", &self.phase())
            .field("protocol", &self.protocol_state())
            .finish()
    }
}

// ============================================================================
// Conn: processor-owned connection state
// ============================================================================

/// Mutable connection state, held under the transport's lock and in
/// practice touched only by the owning processor thread.
pub(crate) struct Conn {
    pub stream: Option<Box<dyn NetStream>>,
    /// Socket between creation and the `connect()` call.
    pub raw_sock: Option<Socket>,

    pub phase: Phase,
    pub mods: Modifiers,
    pub token: Option<mio::Token>,

    /// One-time socket setup done (guarded: the handshake entry point is
    /// revisited for TLS).
    pub sock_inited: bool,
    pub src_port: u16,

    pub ws: Option<ws::WsHandshake>,
    pub splitter: FrameSplitter,
    /// Send accumulation buffer; pending messages are batched into it.
    pub tx: Option<ByteBuf>,

    pub session: Session,

    pub connect_retries: u32,
    pub backoff: BackoffPolicy,
    pub connect_started: Option<Instant>,
    /// Failure logging suppressed after the retry ceiling.
    pub stop_logging: bool,
    /// Application requested removal; reconnect must not re-arm.
    pub removed: bool,
    pub ping_timer_armed: bool,
}

impl Conn {
    fn new(cfg: &ClientConfig, econfig: &EngineConfig) -> Self {
        Self {
            stream: None,
            raw_sock: None,
            phase: Phase::NeedCreate,
            mods: Modifiers::empty(),
            token: None,
            sock_inited: false,
            src_port: 0,
            ws: None,
            splitter: FrameSplitter::new(cfg.websocket, econfig.max_packet_size),
            tx: None,
            session: Session::new(),
            connect_retries: 0,
            backoff: BackoffPolicy::new(cfg.reconnect.initial_delay, cfg.reconnect.factor),
            connect_started: None,
            stop_logging: false,
            removed: false,
            ping_timer_armed: false,
        }
    }
}

// ============================================================================
// State machine driver
// ============================================================================

/// Drive one connection as far as the current readiness allows.
///
/// This is the single place that decides retry vs. shutdown vs. reconnect,
/// based on the modifiers, the reconnect flag and the retry counters.
pub(crate) fn process_io_request(
    trans: &Arc<Transport>,
    c: &mut Conn,
    ctx: &ProcCtx<'_>,
) -> IoOutcome {
    // Error/teardown triage first.
    if c.mods.contains(Modifiers::SOCK_ERROR)
        || matches!(c.phase, Phase::ShuttingDown | Phase::Disconnected)
    {
        if trans.cfg.reconnect.enabled
            && !c.removed
            && !ctx.shared.is_stopping()
            && c.phase != Phase::NeedCreate
        {
            schedule_reconnect(trans, c, ctx);
            return IoOutcome::AwaitEvent;
        }
        return connection_shutdown(trans, c, ctx);
    }

    match c.phase {
        Phase::Handshaking => return on_connect(trans, c, ctx),
        Phase::NeedCreate => return create_socket(trans, c, ctx),
        Phase::NeedConnect => return create_connection(trans, c, ctx),
        _ => {}
    }

    if c.mods.contains(Modifiers::WS_IN_PROCESS) {
        return on_ws_connect(trans, c, ctx);
    }

    if c.session.state == ProtocolState::DoUnsubscribe {
        session::submit_unsubscribe_all(trans, c, ctx);
        return IoOutcome::Continue;
    }

    if c.mods.contains(Modifiers::CAN_READ) {
        let rc = read_data(trans, c, ctx);
        if rc != IoOutcome::Continue {
            return rc;
        }
    }

    if c.mods.contains(Modifiers::CAN_WRITE) {
        let rc = write_data(trans, c, ctx);
        if rc != IoOutcome::Continue {
            return rc;
        }
    }

    let flushed = output_flushed(trans, c);

    if c.mods.contains(Modifiers::DEFERRED_SHUTDOWN) && flushed {
        c.mods.clear(Modifiers::DEFERRED_SHUTDOWN);
        session::begin_disconnect(trans, c, ctx);
        return IoOutcome::Continue;
    }

    if c.session.state == ProtocolState::Disconnecting && flushed {
        trans.set_phase(c, Phase::ShuttingDown, ctx.shared);
        return IoOutcome::Continue;
    }

    if c.mods.contains(Modifiers::CAN_READ)
        || (!flushed && c.mods.contains(Modifiers::CAN_WRITE))
    {
        IoOutcome::Continue
    } else {
        IoOutcome::AwaitEvent
    }
}

/// Whether every queued byte has left through the socket.
fn output_flushed(trans: &Transport, c: &Conn) -> bool {
    if !trans.pending.lock().queue.is_empty() {
        return false;
    }
    if c.tx.as_ref().is_some_and(|t| !t.is_empty()) {
        return false;
    }
    !c.stream.as_ref().is_some_and(|s| s.has_buffered_tx())
}

// ============================================================================
// Socket creation and connect
// ============================================================================

fn open_socket(cfg: &ClientConfig, econfig: &EngineConfig) -> std::io::Result<Socket> {
    let domain = if cfg.server_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // Tests that cycle connections rapidly reuse ports in TIME_WAIT.
    sock.set_reuse_address(true)?;
    if let Some(src) = cfg.source {
        sock.bind(&src.into())?;
    }
    if econfig.socket_recv_buffer > 0 {
        sock.set_recv_buffer_size(econfig.socket_recv_buffer)?;
    }
    if econfig.socket_send_buffer > 0 {
        sock.set_send_buffer_size(econfig.socket_send_buffer)?;
    }
    if econfig.nodelay {
        sock.set_nodelay(true)?;
    }
    if econfig.keepalive {
        sock.set_keepalive(true)?;
    }
    sock.set_nonblocking(true)?;
    Ok(sock)
}

fn create_socket(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) -> IoOutcome {
    match open_socket(&trans.cfg, &ctx.shared.config) {
        Ok(sock) => {
            c.raw_sock = Some(sock);
            trans.set_phase(c, Phase::NeedConnect, ctx.shared);
            IoOutcome::Continue
        }
        Err(e) => {
            ctx.shared.metrics.record_conn_failure();
            if ctx.shared.metrics.record_socket_error() % ERROR_LOG_INTERVAL == 0 {
                error!(
                    "client {} failed to create socket: {}",
                    trans.cfg.client_id, e
                );
            }
            if trans.cfg.reconnect.enabled && !c.removed {
                schedule_reconnect(trans, c, ctx);
                IoOutcome::AwaitEvent
            } else {
                connection_shutdown(trans, c, ctx)
            }
        }
    }
}

fn sni_name(cfg: &ClientConfig) -> std::result::Result<ServerName<'static>, ()> {
    match &cfg.server_name {
        Some(name) => ServerName::try_from(name.clone()).map_err(|_| ()),
        None => Ok(ServerName::from(cfg.server_addr.ip())),
    }
}

fn create_connection(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) -> IoOutcome {
    let Some(sock) = c.raw_sock.take() else {
        trans.set_phase(c, Phase::NeedCreate, ctx.shared);
        return IoOutcome::Continue;
    };

    c.connect_started = Some(Instant::now());
    ctx.shared.metrics.record_conn_attempt();

    let addr: socket2::SockAddr = trans.cfg.server_addr.into();
    if let Err(e) = sock.connect(&addr) {
        // EINPROGRESS is not failure: completion is signalled by the first
        // writable event after the socket joins the poll set.
        let in_progress = e.raw_os_error() == Some(libc::EINPROGRESS)
            || e.kind() == std::io::ErrorKind::WouldBlock;
        if !in_progress {
            c.connect_retries += 1;
            ctx.shared.metrics.record_conn_failure();
            if c.connect_retries >= trans.cfg.reconnect.max_attempts && !c.stop_logging {
                error!(
                    "client {} exceeded {} connection attempts to {}: {}",
                    trans.cfg.client_id, trans.cfg.reconnect.max_attempts, trans.cfg.server_addr, e
                );
                c.stop_logging = true;
            }
            if trans.cfg.reconnect.enabled && !c.removed {
                schedule_reconnect(trans, c, ctx);
                return IoOutcome::AwaitEvent;
            }
            return connection_shutdown(trans, c, ctx);
        }
    }

    let std_stream: std::net::TcpStream = sock.into();
    let mio_stream = mio::net::TcpStream::from_std(std_stream);

    let mut stream: Box<dyn NetStream> = if trans.cfg.secure {
        let Some(tls_config) = ctx.tls else {
            ctx.shared.fail(Error::Config("secure client without TLS settings"));
            return connection_shutdown(trans, c, ctx);
        };
        let Ok(name) = sni_name(&trans.cfg) else {
            error!(
                "client {} has an invalid TLS server name, refusing insecure fallback",
                trans.cfg.client_id
            );
            c.mods.set(Modifiers::SOCK_ERROR);
            return IoOutcome::Continue;
        };
        match TlsStream::new(mio_stream, Arc::clone(tls_config), name) {
            Ok(s) => Box::new(s),
            Err(e) => {
                warn!(
                    "client {} TLS session setup failed: {}",
                    trans.cfg.client_id, e
                );
                c.mods.set(Modifiers::SOCK_ERROR);
                return IoOutcome::Continue;
            }
        }
    } else {
        Box::new(PlainStream::new(mio_stream))
    };

    // Hand the socket to the listener's poll set; completion arrives as a
    // readiness event.
    let lst = &ctx.shared.listeners[trans.listener_idx];
    match lst.attach(trans, &mut stream) {
        Ok(token) => {
            c.stream = Some(stream);
            c.token = Some(token);
            trans.set_phase(c, Phase::Handshaking, ctx.shared);
            c.mods = Modifiers::empty();
            IoOutcome::AwaitEvent
        }
        Err(e) => {
            error!(
                "client {} unable to add socket to poll set: {}",
                trans.cfg.client_id, e
            );
            c.stream = Some(stream);
            c.mods.set(Modifiers::SOCK_ERROR);
            IoOutcome::Continue
        }
    }
}

// ============================================================================
// Handshake progression
// ============================================================================

fn on_connect(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) -> IoOutcome {
    let Some(stream) = c.stream.as_mut() else {
        c.mods.set(Modifiers::SOCK_ERROR);
        return IoOutcome::Continue;
    };

    // One-time socket checks; this entry point is revisited for TLS.
    if !c.sock_inited {
        match stream.take_error() {
            Ok(Some(e)) => {
                c.connect_retries += 1;
                ctx.shared.metrics.record_conn_failure();
                if ctx.shared.metrics.record_socket_error() % ERROR_LOG_INTERVAL == 0 {
                    warn!(
                        "client {} failed to connect to {}: {}",
                        trans.cfg.client_id, trans.cfg.server_addr, e
                    );
                }
                c.mods.set(Modifiers::SOCK_ERROR);
                return IoOutcome::Continue;
            }
            Ok(None) => {
                if let Ok(addr) = stream.local_addr() {
                    c.src_port = addr.port();
                }
                c.sock_inited = true;
            }
            Err(e) => {
                warn!(
                    "client {} could not read SO_ERROR: {}",
                    trans.cfg.client_id, e
                );
                c.mods.set(Modifiers::SOCK_ERROR);
                return IoOutcome::Continue;
            }
        }
    }

    if stream.is_tls() {
        match stream.handshake() {
            HandshakeOutcome::Done => {
                ctx.shared.metrics.record_tls_connect();
            }
            HandshakeOutcome::WantRead => {
                c.mods.set(Modifiers::READ_WANT_READ);
                c.mods.clear(Modifiers::CAN_READ);
                return IoOutcome::AwaitEvent;
            }
            HandshakeOutcome::WantWrite => {
                c.mods.set(Modifiers::WRITE_WANT_WRITE);
                c.mods.clear(Modifiers::CAN_WRITE);
                return IoOutcome::AwaitEvent;
            }
            HandshakeOutcome::Fatal(e) => {
                // Trust-store misconfiguration poisons every measurement;
                // stop the whole run.
                error!(
                    "client {} TLS verification failed against {}: {}",
                    trans.cfg.client_id, trans.cfg.server_addr, e
                );
                ctx.shared.fail(e);
                return connection_shutdown(trans, c, ctx);
            }
            HandshakeOutcome::Err(e) => {
                if ctx.shared.metrics.record_socket_error() % ERROR_LOG_INTERVAL == 0 {
                    warn!(
                        "client {} TLS handshake failed: {}",
                        trans.cfg.client_id, e
                    );
                }
                c.mods.set(Modifiers::SOCK_ERROR);
                return IoOutcome::Continue;
            }
        }
    }

    trans.set_phase(c, Phase::Connected, ctx.shared);
    c.mods.set(Modifiers::CAN_READ | Modifiers::CAN_WRITE);
    c.connect_retries = 0;
    c.backoff.reset();
    c.stop_logging = false;

    let elapsed = c
        .connect_started
        .map(|t| t.elapsed())
        .unwrap_or_default();
    ctx.shared.metrics.record_tcp_connect(elapsed);
    debug!(
        "client {} transport connected to {} (src port {})",
        trans.cfg.client_id, trans.cfg.server_addr, c.src_port
    );

    if trans.cfg.websocket {
        create_websocket(trans, c, ctx)
    } else {
        session::submit_mqtt_connect(trans, c, ctx)
    }
}

fn create_websocket(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) -> IoOutcome {
    if c.ws.is_none() {
        c.ws = Some(ws::start_handshake(&trans.cfg.host(), trans.cfg.version));
    }
    let Conn { stream, ws, mods, .. } = c;
    let (Some(stream), Some(hs)) = (stream.as_mut(), ws.as_mut()) else {
        mods.set(Modifiers::SOCK_ERROR);
        return IoOutcome::Continue;
    };

    while hs.sent < hs.request.len() {
        match stream.write(&hs.request[hs.sent..]) {
            WriteOutcome::Wrote(n) => hs.sent += n,
            WriteOutcome::WouldBlock => {
                mods.set(Modifiers::WRITE_WANT_WRITE);
                mods.clear(Modifiers::CAN_WRITE);
                return IoOutcome::AwaitEvent;
            }
            WriteOutcome::Err(e) => {
                warn!(
                    "client {} WebSocket upgrade write failed: {}",
                    trans.cfg.client_id, e
                );
                mods.set(Modifiers::SOCK_ERROR);
                return IoOutcome::Continue;
            }
        }
    }

    c.mods.set(Modifiers::WS_IN_PROCESS);
    IoOutcome::Continue
}

fn on_ws_connect(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) -> IoOutcome {
    let Conn { stream, ws, mods, .. } = c;
    let (Some(stream), Some(hs)) = (stream.as_mut(), ws.as_mut()) else {
        mods.set(Modifiers::SOCK_ERROR);
        return IoOutcome::Continue;
    };

    let mut tmp = [0u8; 1024];
    match stream.read(&mut tmp) {
        ReadOutcome::Data(n) => hs.response.extend_from_slice(&tmp[..n]),
        ReadOutcome::WouldBlock => {
            mods.set(Modifiers::READ_WANT_READ);
            mods.clear(Modifiers::CAN_READ);
            return IoOutcome::AwaitEvent;
        }
        ReadOutcome::Closed => {
            mods.set(Modifiers::SOCK_ERROR);
            return IoOutcome::Continue;
        }
        ReadOutcome::Err(e) => {
            warn!(
                "client {} WebSocket upgrade read failed: {}",
                trans.cfg.client_id, e
            );
            mods.set(Modifiers::SOCK_ERROR);
            return IoOutcome::Continue;
        }
        ReadOutcome::Fatal(e) => {
            ctx.shared.fail(e);
            return connection_shutdown(trans, c, ctx);
        }
    }

    let Some(end) = ws::response_complete(&hs.response) else {
        return IoOutcome::Continue;
    };

    match ws::verify_response(hs) {
        Ok(_) => {
            ctx.shared.metrics.record_ws_connect();
            debug!(
                "client {} completed the WebSocket handshake",
                trans.cfg.client_id
            );
            let trailing = hs.response.split_off(end);
            c.mods.clear(Modifiers::WS_IN_PROCESS);
            if !trailing.is_empty() {
                if let Err(e) = c.splitter.feed(&trailing) {
                    warn!(
                        "client {} bad data after upgrade: {}",
                        trans.cfg.client_id, e
                    );
                    c.mods.set(Modifiers::SOCK_ERROR);
                    return IoOutcome::Continue;
                }
            }
            session::submit_mqtt_connect(trans, c, ctx)
        }
        Err(e) => {
            warn!(
                "client {} WebSocket upgrade rejected: {}",
                trans.cfg.client_id, e
            );
            mods.set(Modifiers::SOCK_ERROR);
            IoOutcome::Continue
        }
    }
}

// ============================================================================
// Read / write paths
// ============================================================================

fn read_data(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) -> IoOutcome {
    // Do not wait on the pool here: exhaustion is backpressure and the
    // connection simply retries on the next loop iteration.
    let Some(mut buf) = ctx
        .rx_pool
        .acquire(ctx.shared.config.rx_buffer_size, false)
    else {
        ctx.shared.metrics.record_pool_exhausted();
        return IoOutcome::Continue;
    };

    c.mods
        .clear(Modifiers::READ_WANT_READ | Modifiers::READ_WANT_WRITE);

    let Some(stream) = c.stream.as_mut() else {
        c.mods.set(Modifiers::SOCK_ERROR);
        return IoOutcome::Continue;
    };

    match stream.read(buf.spare_mut()) {
        ReadOutcome::Data(n) => {
            buf.advance_write(n);
            ctx.shared.metrics.record_bytes_received(n);
            session::on_data(trans, c, ctx, buf.bytes())
        }
        ReadOutcome::WouldBlock => {
            c.mods.clear(Modifiers::CAN_READ);
            c.mods.set(Modifiers::READ_WANT_READ);
            IoOutcome::Continue
        }
        ReadOutcome::Closed => {
            if ctx.shared.metrics.record_socket_error() % ERROR_LOG_INTERVAL == 0 {
                warn!(
                    "server closed connection for client {} ({} active)",
                    trans.cfg.client_id,
                    ctx.shared.metrics.active_connections()
                );
            }
            trans.set_protocol(c, ProtocolState::Disconnected);
            c.mods.set(Modifiers::SOCK_ERROR);
            IoOutcome::Continue
        }
        ReadOutcome::Err(e) => {
            if ctx.shared.metrics.record_socket_error() % ERROR_LOG_INTERVAL == 0 {
                warn!("client {} read failed: {}", trans.cfg.client_id, e);
            }
            trans.set_protocol(c, ProtocolState::Disconnected);
            c.mods.set(Modifiers::SOCK_ERROR);
            IoOutcome::Continue
        }
        ReadOutcome::Fatal(e) => {
            ctx.shared.fail(e);
            connection_shutdown(trans, c, ctx)
        }
    }
}

fn write_data(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) -> IoOutcome {
    let Some(stream) = c.stream.as_mut() else {
        c.mods.set(Modifiers::SOCK_ERROR);
        return IoOutcome::Continue;
    };

    // Ciphertext from an earlier write may still be queued inside TLS.
    if stream.has_buffered_tx() {
        match stream.flush() {
            WriteOutcome::Wrote(_) => {}
            WriteOutcome::WouldBlock => {
                ctx.shared.metrics.record_would_block_write();
                c.mods.set(Modifiers::WRITE_WANT_WRITE);
                c.mods.clear(Modifiers::CAN_WRITE);
                return IoOutcome::Continue;
            }
            WriteOutcome::Err(e) => {
                if ctx.shared.metrics.record_socket_error() % ERROR_LOG_INTERVAL == 0 {
                    warn!("client {} flush failed: {}", trans.cfg.client_id, e);
                }
                c.mods.set(Modifiers::SOCK_ERROR);
                return IoOutcome::Continue;
            }
        }
    }

    if c.tx.is_none() {
        c.tx = Some(ByteBuf::with_capacity(ctx.shared.config.send_buffer_size));
    }
    let Some(tx) = c.tx.as_mut() else {
        return IoOutcome::Continue;
    };

    // Batch pending messages into the send buffer, in submission order.
    if tx.is_empty() {
        tx.clear();
        let mut pq = trans.pending.lock();
        loop {
            let Some(front_len) = pq.queue.front().map(|b| b.remaining()) else {
                break;
            };
            if front_len > tx.writable() {
                break;
            }
            let Some(b) = pq.queue.pop_front() else {
                break;
            };
            pq.bytes = pq.bytes.saturating_sub(front_len);
            if tx.put_slice(b.bytes()).is_err() {
                // Cannot happen: the length was checked against writable().
                ctx.shared.metrics.record_internal_error();
                error!("internal error: send batch overflow");
                break;
            }
            // b drops here and returns to its pool.
        }
    }

    if tx.is_empty() {
        return IoOutcome::Continue;
    }

    c.mods
        .clear(Modifiers::WRITE_WANT_WRITE | Modifiers::WRITE_WANT_READ);

    match stream.write(tx.bytes()) {
        WriteOutcome::Wrote(n) => {
            tx.advance_read(n);
            ctx.shared.metrics.record_bytes_sent(n);
        }
        WriteOutcome::WouldBlock => {
            ctx.shared.metrics.record_would_block_write();
            c.mods.set(Modifiers::WRITE_WANT_WRITE);
            c.mods.clear(Modifiers::CAN_WRITE);
        }
        WriteOutcome::Err(e) => {
            if ctx.shared.metrics.record_socket_error() % ERROR_LOG_INTERVAL == 0 {
                warn!("client {} write failed: {}", trans.cfg.client_id, e);
            }
            c.mods.set(Modifiers::SOCK_ERROR);
        }
    }
    IoOutcome::Continue
}

// ============================================================================
// Teardown
// ============================================================================

/// Close the stream and remove it from the listener's poll set.
pub(crate) fn connection_shutdown(
    trans: &Arc<Transport>,
    c: &mut Conn,
    ctx: &ProcCtx<'_>,
) -> IoOutcome {
    if let Some(stream) = c.stream.as_mut() {
        stream.close();
    }
    ctx.shared.listeners[trans.listener_idx].detach(c);
    IoOutcome::Shutdown
}

/// Finalize a shutdown decided by [`process_io_request`].
pub(crate) fn on_shutdown(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) {
    transport_cleanup(trans, c);
    trans.set_phase(c, Phase::Disconnected, ctx.shared);
    trans.set_protocol(c, ProtocolState::Disconnected);
    ctx.shared.metrics.record_disconnect();
}

/// Release per-connection resources while keeping what reconnect needs.
pub(crate) fn transport_cleanup(trans: &Arc<Transport>, c: &mut Conn) {
    c.stream = None;
    c.raw_sock = None;
    c.tx = None;
    c.ws = None;
    c.splitter.reset();
    c.sock_inited = false;
    c.src_port = 0;
    c.session.reset();
    trans.ids.lock().reset();

    let mut pq = trans.pending.lock();
    pq.queue.clear();
    pq.bytes = 0;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip() {
        for phase in [
            Phase::NeedCreate,
            Phase::NeedConnect,
            Phase::Handshaking,
            Phase::Connected,
            Phase::ShuttingDown,
            Phase::Disconnected,
        ] {
            assert_eq!(Phase::from_u8(phase as u8), phase);
        }
    }

    #[test]
    fn test_phase_queries() {
        assert!(Phase::NeedCreate.is_connecting());
        assert!(Phase::Handshaking.is_connecting());
        assert!(!Phase::Connected.is_connecting());
        assert!(!Phase::Disconnected.is_connecting());
    }

    #[test]
    fn test_modifiers() {
        let mut mods = Modifiers::empty();
        assert!(!mods.contains(Modifiers::CAN_READ));

        mods.set(Modifiers::CAN_READ | Modifiers::CAN_WRITE);
        assert!(mods.contains(Modifiers::CAN_READ));
        assert!(mods.contains(Modifiers::CAN_WRITE));

        mods.clear(Modifiers::CAN_READ);
        assert!(!mods.contains(Modifiers::CAN_READ));
        assert!(mods.contains(Modifiers::CAN_WRITE));

        // Want-flags are independent of the readiness flags.
        mods.set(Modifiers::READ_WANT_WRITE);
        assert!(mods.contains(Modifiers::READ_WANT_WRITE));
        assert!(!mods.contains(Modifiers::READ_WANT_READ));
    }

    #[test]
    fn test_transport_snapshots() {
        let cfg = Arc::new(crate::ClientConfig::new(
            "c0",
            "127.0.0.1:1883".parse().unwrap(),
        ));
        let trans = Transport::new(1, cfg, 0, 0, &crate::EngineConfig::default());

        assert_eq!(trans.phase(), Phase::NeedCreate);
        assert_eq!(trans.protocol_state(), ProtocolState::Unknown);
        assert_eq!(trans.inflight(), 0);
    }

    #[test]
    fn test_msg_id_allocation() {
        let cfg = Arc::new(crate::ClientConfig::new(
            "c0",
            "127.0.0.1:1883".parse().unwrap(),
        ));
        let trans = Transport::new(1, cfg, 0, 0, &crate::EngineConfig::default());

        let a = trans.alloc_msg_id().unwrap();
        let b = trans.alloc_msg_id().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_eq!(trans.inflight(), 2);
    }
}
