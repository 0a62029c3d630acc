// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine context and thread lifecycle.
//!
//! [`Engine`] owns the listener, processor and timer threads plus every
//! per-thread resource (buffer pools, TLS configurations). All state that
//! the original design kept global lives in the explicit [`EngineShared`]
//! context passed to every entry point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use mio::Poll;
use parking_lot::Mutex;

use crate::buffer::{BufferPool, ByteBuf};
use crate::codec::ws;
use crate::codec::PacketType;
use crate::config::{ClientConfig, EngineConfig};
use crate::metrics::EngineMetrics;
use crate::timer::{self, TimerCtx, TimerEvent, TimerHandle};
use crate::transport::listener::{run_listener, ListenerShared};
use crate::transport::processor::{
    run_processor, Job, JobQueue, EV_DISCONNECT_REQ,
};
use crate::transport::{Phase, Transport};
use crate::{Error, Result};

// ============================================================================
// Shared context
// ============================================================================

/// Buffer pools owned by one processor thread.
///
/// Separate instances per processor keep the hot acquisition path free of
/// cross-thread contention; the submission path reaches into the owning
/// processor's TX pool only.
pub(crate) struct ProcessorPools {
    pub tx: BufferPool,
    pub rx: BufferPool,
}

/// Engine state shared by every thread.
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub metrics: Arc<EngineMetrics>,
    pub listeners: Vec<ListenerShared>,
    pub queues: Vec<Arc<JobQueue>>,
    pub pools: Vec<ProcessorPools>,
    /// One TLS client configuration per processor thread, instantiated
    /// from the same settings to avoid cross-thread contention inside the
    /// TLS library. Empty when TLS is not configured.
    pub tls: Vec<Arc<rustls::ClientConfig>>,
    pub timer: TimerHandle,
    pub transports: Arc<Mutex<Vec<Arc<Transport>>>>,
    pub shutdown: Arc<AtomicBool>,

    fatal: Mutex<Option<Error>>,
    next_conn_id: AtomicU64,
    epoch: Instant,
}

impl EngineShared {
    /// Milliseconds since engine start (used for lock-free timestamps).
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Record a run-fatal error and stop the engine. Continuing after a
    /// systemic failure would yield meaningless measurements.
    pub fn fail(&self, err: Error) {
        error!("fatal engine error: {}", err);
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.shutdown.store(true, Ordering::Release);
        for lst in &self.listeners {
            let _ = lst.waker.wake();
        }
    }
}

/// Per-processor view handed into the state machine.
pub(crate) struct ProcCtx<'a> {
    pub shared: &'a Arc<EngineShared>,
    pub tx_pool: &'a BufferPool,
    pub rx_pool: &'a BufferPool,
    pub tls: Option<&'a Arc<rustls::ClientConfig>>,
}

impl<'a> ProcCtx<'a> {
    pub fn new(shared: &'a Arc<EngineShared>, idx: usize) -> Self {
        Self {
            shared,
            tx_pool: &shared.pools[idx].tx,
            rx_pool: &shared.pools[idx].rx,
            tls: shared.tls.get(idx),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The transport engine: a fixed set of listener and processor threads, a
/// timer thread, and the connections they drive.
pub struct Engine {
    shared: Arc<EngineShared>,
    listener_joins: Vec<JoinHandle<()>>,
    processor_joins: Vec<JoinHandle<()>>,
    timer_join: Option<JoinHandle<()>>,
}

impl Engine {
    /// Validate the configuration, allocate per-thread resources and
    /// start all engine threads.
    pub fn start(config: EngineConfig) -> Result<Engine> {
        config.validate().map_err(Error::Config)?;

        let metrics = Arc::new(EngineMetrics::new());

        // Listener polls must exist before their shared halves.
        let mut polls = Vec::with_capacity(config.num_listeners);
        let mut listeners = Vec::with_capacity(config.num_listeners);
        for _ in 0..config.num_listeners {
            let poll = Poll::new()?;
            listeners.push(ListenerShared::new(&poll)?);
            polls.push(poll);
        }

        let queues: Vec<Arc<JobQueue>> = (0..config.num_processors)
            .map(|_| Arc::new(JobQueue::new()))
            .collect();

        let pools: Vec<ProcessorPools> = (0..config.num_processors)
            .map(|_| ProcessorPools {
                tx: BufferPool::new(&config.tx_pool_classes),
                rx: BufferPool::new(&[(config.rx_buffer_size, config.rx_pool_buffers)]),
            })
            .collect();

        let tls: Vec<Arc<rustls::ClientConfig>> = match &config.tls {
            Some(settings) => (0..config.num_processors)
                .map(|_| settings.build_client_config())
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let transports = Arc::new(Mutex::new(Vec::new()));

        let (timer, timer_join) = timer::spawn(TimerCtx {
            queues: queues.clone(),
            transports: Arc::clone(&transports),
            shutdown: Arc::clone(&shutdown),
            metrics: Arc::clone(&metrics),
        })?;
        timer.set_rate(config.scan_interval, TimerEvent::Scan);

        let shared = Arc::new(EngineShared {
            config,
            metrics,
            listeners,
            queues,
            pools,
            tls,
            timer,
            transports,
            shutdown,
            fatal: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
            epoch: Instant::now(),
        });

        let mut listener_joins = Vec::with_capacity(polls.len());
        for (idx, poll) in polls.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            listener_joins.push(
                std::thread::Builder::new()
                    .name(format!("mqload-iol-{}", idx))
                    .spawn(move || run_listener(poll, shared, idx))?,
            );
        }

        let mut processor_joins = Vec::with_capacity(shared.config.num_processors);
        for idx in 0..shared.config.num_processors {
            let shared = Arc::clone(&shared);
            processor_joins.push(
                std::thread::Builder::new()
                    .name(format!("mqload-iop-{}", idx))
                    .spawn(move || run_processor(shared, idx))?,
            );
        }

        info!(
            "engine started: {} listeners, {} processors",
            shared.config.num_listeners, shared.config.num_processors
        );

        Ok(Engine {
            shared,
            listener_joins,
            processor_joins,
            timer_join: Some(timer_join),
        })
    }

    /// Create a connection for one simulated client and begin connecting.
    ///
    /// The client is assigned to a listener and a processor round-robin;
    /// the socket-creation job is queued immediately.
    pub fn add_client(&self, cfg: ClientConfig) -> Result<Arc<Transport>> {
        cfg.validate().map_err(Error::Config)?;
        if cfg.secure && self.shared.tls.is_empty() {
            return Err(Error::Config("secure client requires engine TLS settings"));
        }
        if self.shared.is_stopping() {
            return Err(Error::InvalidState("engine is shutting down"));
        }

        let id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let listener_idx = (id as usize) % self.shared.config.num_listeners;
        let processor_idx = (id as usize) % self.shared.config.num_processors;

        let trans = Arc::new(Transport::new(
            id,
            Arc::new(cfg),
            listener_idx,
            processor_idx,
            &self.shared.config,
        ));

        self.shared.transports.lock().push(Arc::clone(&trans));
        self.shared.queues[processor_idx].push(Job::process(Arc::clone(&trans)));
        Ok(trans)
    }

    /// Acquire one TX buffer from the pool owned by the connection's
    /// processor thread.
    pub fn acquire_tx(&self, trans: &Arc<Transport>, size: usize) -> Result<ByteBuf> {
        let size = size + if trans.cfg.websocket { ws::MAX_FRAME_HEADER } else { 0 };
        match self.shared.pools[trans.processor_idx].tx.acquire(size, false) {
            Some(buf) => Ok(buf),
            None => {
                self.shared.metrics.record_pool_exhausted();
                Err(Error::PoolExhausted)
            }
        }
    }

    /// Acquire a batch of TX buffers (all-or-nothing).
    pub fn acquire_tx_batch(
        &self,
        trans: &Arc<Transport>,
        size: usize,
        count: usize,
    ) -> Result<Vec<ByteBuf>> {
        let size = size + if trans.cfg.websocket { ws::MAX_FRAME_HEADER } else { 0 };
        match self.shared.pools[trans.processor_idx]
            .tx
            .acquire_batch(size, count, false)
        {
            Some(bufs) => Ok(bufs),
            None => {
                self.shared.metrics.record_pool_exhausted();
                Err(Error::PoolExhausted)
            }
        }
    }

    /// Enqueue an encoded outbound frame on a connection.
    ///
    /// Frames flush in submission order. The call fails when the
    /// connection cannot currently accept traffic; the buffer returns to
    /// its pool either way.
    pub fn submit_io_job(&self, trans: &Arc<Transport>, buf: ByteBuf) -> Result<()> {
        if trans.phase() != Phase::Connected {
            warn!(
                "client {} rejected submit in phase {}",
                trans.cfg.client_id,
                trans.phase()
            );
            return Err(Error::InvalidState("connection is not established"));
        }

        if let Some(ptype) = peek_packet_type(&buf, trans.cfg.websocket) {
            self.shared.metrics.record_tx_packet(ptype);
        }

        let was_empty = {
            let mut pq = trans.pending.lock();
            let was_empty = pq.queue.is_empty();
            pq.bytes += buf.remaining();
            pq.queue.push_back(buf);
            was_empty
        };
        // Only the first frame needs to wake the processor; a queued
        // connection is already marked for processing.
        if was_empty {
            self.shared.queues[trans.processor_idx].push(Job::process(Arc::clone(trans)));
        }
        Ok(())
    }

    /// Request graceful teardown of one connection.
    ///
    /// With a linger configured the DISCONNECT is delayed, giving
    /// in-flight traffic time to complete; otherwise the teardown job is
    /// queued immediately. Reconnect is disarmed either way.
    pub fn remove_transport(&self, trans: &Arc<Transport>) {
        if trans.phase() == Phase::Disconnected {
            return;
        }
        if let Some(linger) = trans.cfg.linger {
            if trans.protocol_state().is_active() {
                self.shared
                    .timer
                    .set_once(linger, TimerEvent::Linger(Arc::clone(trans)));
                return;
            }
        }
        self.shared.queues[trans.processor_idx]
            .push(Job::events(Arc::clone(trans), EV_DISCONNECT_REQ));
    }

    /// Engine metrics.
    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// The fatal error that stopped the engine, if any.
    pub fn take_fatal(&self) -> Option<Error> {
        self.shared.fatal.lock().take()
    }

    /// Whether the engine observed a fatal error or was asked to stop.
    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Stop all engine threads, waiting up to `timeout` for each group.
    pub fn shutdown(mut self, timeout: Duration) {
        self.shutdown_inner(timeout);
    }

    fn shutdown_inner(&mut self, timeout: Duration) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.timer.stop();
        for lst in &self.shared.listeners {
            let _ = lst.waker.wake();
        }

        let deadline = Instant::now() + timeout;
        let joins = self
            .listener_joins
            .drain(..)
            .chain(self.processor_joins.drain(..))
            .chain(self.timer_join.take());
        for handle in joins {
            join_with_deadline(handle, deadline);
        }
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.listener_joins.is_empty() || self.timer_join.is_some() {
            self.shutdown_inner(Duration::from_secs(5));
        }
    }
}

/// Join a thread, abandoning it with a warning once the deadline passes.
fn join_with_deadline(handle: JoinHandle<()>, deadline: Instant) {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                "thread {:?} did not stop in time, detaching",
                handle.thread().name()
            );
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        warn!("engine thread panicked during shutdown");
    }
}

/// Identify the MQTT packet type of an encoded frame, looking through the
/// WebSocket header when present.
pub(crate) fn peek_packet_type(buf: &ByteBuf, websocket: bool) -> Option<PacketType> {
    let bytes = buf.bytes();
    let header = if websocket {
        let len7 = bytes.get(1)? & 0x7F;
        let hdr_len = match len7 {
            126 => 8,
            127 => 14,
            _ => 6,
        };
        *bytes.get(hdr_len)?
    } else {
        *bytes.first()?
    };
    PacketType::from_header(header)
}

// ============================================================================
// Test harness
// ============================================================================

/// Thread-less engine context for state-machine unit tests: one listener
/// shell, one processor slot, a captured timer channel.
#[cfg(test)]
pub(crate) struct TestHarness {
    pub shared: Arc<EngineShared>,
    pub timer_rx: crossbeam::channel::Receiver<crate::timer::TimerCmd>,
    _poll: Poll,
}

#[cfg(test)]
pub(crate) fn test_harness(config: EngineConfig) -> TestHarness {
    let (timer, timer_rx) = crate::timer::test_handle();
    let poll = Poll::new().expect("poll");
    let rx_size = config.rx_buffer_size;
    let shared = Arc::new(EngineShared {
        config,
        metrics: Arc::new(EngineMetrics::new()),
        listeners: vec![ListenerShared::new(&poll).expect("listener")],
        queues: vec![Arc::new(JobQueue::new())],
        pools: vec![ProcessorPools {
            tx: BufferPool::new(&[(256, 64), (2048, 16)]),
            rx: BufferPool::new(&[(rx_size, 16)]),
        }],
        tls: Vec::new(),
        timer,
        transports: Arc::new(Mutex::new(Vec::new())),
        shutdown: Arc::new(AtomicBool::new(false)),
        fatal: Mutex::new(None),
        next_conn_id: AtomicU64::new(1),
        epoch: Instant::now(),
    });
    TestHarness {
        shared,
        timer_rx,
        _poll: poll,
    }
}

// ============================================================================
// Tests
// ============================================================================
