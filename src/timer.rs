// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timer service.
//!
//! One dedicated thread holds a deadline heap and turns expirations into
//! processor jobs: reconnect re-entry, keepalive pings, linger-delayed
//! disconnects and the periodic stuck-connection scan. Supports one-shot
//! and repeating timers plus cancellation by id.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use parking_lot::Mutex;

use crate::metrics::EngineMetrics;
use crate::session::ProtocolState;
use crate::transport::processor::{Job, JobAction, JobQueue};
use crate::transport::{Phase, Transport};

/// Idle wait when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_millis(200);

// ============================================================================
// Events and commands
// ============================================================================

/// What to do when a timer fires.
#[derive(Clone)]
pub(crate) enum TimerEvent {
    /// Re-enter the connection into its processor's job queue.
    Reconnect(Arc<Transport>),
    /// Submit a keepalive ping.
    Ping(Arc<Transport>),
    /// Begin the deferred graceful disconnect.
    Linger(Arc<Transport>),
    /// Scan all connections for ones stuck in a handshake phase.
    Scan,
}

pub(crate) enum TimerCmd {
    Once {
        id: u64,
        after: Duration,
        event: TimerEvent,
    },
    Rate {
        id: u64,
        every: Duration,
        event: TimerEvent,
    },
    Cancel(u64),
    Stop,
}

/// Handle used by the engine and the state machine to arm timers.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    tx: Sender<TimerCmd>,
    next_id: Arc<AtomicU64>,
}

impl TimerHandle {
    /// Arm a one-shot timer; returns its id for cancellation.
    pub fn set_once(&self, after: Duration, event: TimerEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(TimerCmd::Once { id, after, event });
        id
    }

    /// Arm a repeating timer; returns its id for cancellation.
    pub fn set_rate(&self, every: Duration, event: TimerEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(TimerCmd::Rate { id, every, event });
        id
    }

    pub fn cancel(&self, id: u64) {
        let _ = self.tx.send(TimerCmd::Cancel(id));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(TimerCmd::Stop);
    }
}

// ============================================================================
// Timer thread
// ============================================================================

/// Everything the timer thread needs; deliberately not the whole engine
/// context, to keep ownership acyclic.
pub(crate) struct TimerCtx {
    pub queues: Vec<Arc<JobQueue>>,
    pub transports: Arc<Mutex<Vec<Arc<Transport>>>>,
    pub shutdown: Arc<AtomicBool>,
    pub metrics: Arc<EngineMetrics>,
}

struct Entry {
    at: Instant,
    seq: u64,
    id: u64,
    every: Option<Duration>,
    event: TimerEvent,
}

// Heap ordering on deadline, then insertion order.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Handle wired to a bare channel, for unit tests that assert on the
/// commands a code path arms.
#[cfg(test)]
pub(crate) fn test_handle() -> (TimerHandle, Receiver<TimerCmd>) {
    let (tx, rx) = unbounded();
    (
        TimerHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        rx,
    )
}

/// Spawn the timer thread.
pub(crate) fn spawn(ctx: TimerCtx) -> std::io::Result<(TimerHandle, JoinHandle<()>)> {
    let (tx, rx) = unbounded();
    let handle = TimerHandle {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
    };

    let join = std::thread::Builder::new()
        .name("mqload-timer".to_string())
        .spawn(move || run(ctx, rx))?;

    Ok((handle, join))
}

fn run(ctx: TimerCtx, rx: Receiver<TimerCmd>) {
    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    let mut cancelled: HashSet<u64> = HashSet::new();
    let mut seq: u64 = 0;

    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            return;
        }

        let wait = heap
            .peek()
            .map(|Reverse(e)| e.at.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);

        match rx.recv_timeout(wait) {
            Ok(TimerCmd::Once { id, after, event }) => {
                seq += 1;
                heap.push(Reverse(Entry {
                    at: Instant::now() + after,
                    seq,
                    id,
                    every: None,
                    event,
                }));
            }
            Ok(TimerCmd::Rate { id, every, event }) => {
                seq += 1;
                heap.push(Reverse(Entry {
                    at: Instant::now() + every,
                    seq,
                    id,
                    every: Some(every),
                    event,
                }));
            }
            Ok(TimerCmd::Cancel(id)) => {
                cancelled.insert(id);
            }
            Ok(TimerCmd::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|Reverse(e)| e.at <= now) {
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            if cancelled.remove(&entry.id) {
                continue;
            }
            let keep = dispatch(&ctx, &entry.event);
            if keep {
                if let Some(every) = entry.every {
                    seq += 1;
                    heap.push(Reverse(Entry {
                        at: now + every,
                        seq,
                        id: entry.id,
                        every: Some(every),
                        event: entry.event,
                    }));
                }
            }
        }
    }
}

/// Turn an expiration into processor work. Returns whether a repeating
/// timer should stay armed.
fn dispatch(ctx: &TimerCtx, event: &TimerEvent) -> bool {
    match event {
        TimerEvent::Reconnect(trans) => {
            debug!(
                "client {} reconnect delay expired, re-queueing",
                trans.cfg.client_id
            );
            ctx.queues[trans.processor_idx].push(Job::process(Arc::clone(trans)));
            false
        }
        TimerEvent::Ping(trans) => {
            let phase = trans.phase();
            if phase == Phase::Disconnected && !trans.cfg.reconnect.enabled {
                return false; // connection is gone for good
            }
            if trans.protocol_state().is_active() {
                ctx.queues[trans.processor_idx]
                    .push(Job::callback(Arc::clone(trans), JobAction::Ping));
            }
            true
        }
        TimerEvent::Linger(trans) => {
            ctx.queues[trans.processor_idx]
                .push(Job::callback(Arc::clone(trans), JobAction::Disconnect));
            false
        }
        TimerEvent::Scan => {
            scan(ctx);
            true
        }
    }
}

/// Find connections stuck in a handshake or disconnect phase longer than
/// their timeout and force-reschedule them.
fn scan(ctx: &TimerCtx) {
    let now_ms = ctx.metrics.uptime().as_millis() as u64;
    let transports = ctx.transports.lock();

    for trans in transports.iter() {
        let timeout = trans.cfg.connection_timeout;
        if timeout.is_zero() {
            continue;
        }
        let phase = trans.phase();
        let proto = trans.protocol_state();

        let in_process = matches!(phase, Phase::Handshaking | Phase::NeedCreate)
            || proto == ProtocolState::ConnectInProcess
            || proto == ProtocolState::Disconnecting;
        if !in_process {
            continue;
        }

        let waited_ms = now_ms.saturating_sub(trans.phase_changed_ms());
        if waited_ms <= timeout.as_millis() as u64 {
            continue;
        }

        debug!(
            "client {} stuck for {} ms in phase {} (protocol {:?}), forcing reconnect",
            trans.cfg.client_id, waited_ms, phase, proto
        );
        ctx.metrics.record_stuck_rescheduled();

        let action = if phase == Phase::NeedCreate {
            // The reconnect timer was lost; re-drive socket creation.
            JobAction::Process
        } else {
            JobAction::Reconnect
        };
        match action {
            JobAction::Process => {
                ctx.queues[trans.processor_idx].push(Job::process(Arc::clone(trans)))
            }
            action => ctx.queues[trans.processor_idx]
                .push(Job::callback(Arc::clone(trans), action)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> (TimerCtx, Vec<Arc<JobQueue>>) {
        let queues = vec![Arc::new(JobQueue::new())];
        let ctx = TimerCtx {
            queues: queues.clone(),
            transports: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(EngineMetrics::new()),
        };
        (ctx, queues)
    }

    fn test_transport() -> Arc<Transport> {
        Arc::new(Transport::new(
            1,
            Arc::new(crate::ClientConfig::new(
                "t0",
                "127.0.0.1:1883".parse().unwrap(),
            )),
            0,
            0,
            &crate::EngineConfig::default(),
        ))
    }

    fn drain(q: &JobQueue) -> Vec<Job> {
        let mut jobs = Vec::new();
        q.swap(&mut jobs);
        jobs
    }

    #[test]
    fn test_one_shot_fires_once() {
        let (ctx, queues) = test_ctx();
        let (handle, join) = spawn(ctx).unwrap();

        let trans = test_transport();
        handle.set_once(Duration::from_millis(5), TimerEvent::Reconnect(trans));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(drain(&queues[0]).len(), 1);

        std::thread::sleep(Duration::from_millis(30));
        assert!(drain(&queues[0]).is_empty());

        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_cancel_before_expiry() {
        let (ctx, queues) = test_ctx();
        let (handle, join) = spawn(ctx).unwrap();

        let trans = test_transport();
        let id = handle.set_once(Duration::from_millis(50), TimerEvent::Reconnect(trans));
        handle.cancel(id);

        std::thread::sleep(Duration::from_millis(120));
        assert!(drain(&queues[0]).is_empty());

        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_ping_skips_inactive_connection() {
        let (ctx, _queues) = test_ctx();
        let trans = test_transport();
        // Protocol state is Unknown: the ping is suppressed but the timer
        // stays armed (reconnect may revive the session).
        assert!(dispatch(&ctx, &TimerEvent::Ping(trans)));
        assert!(drain(&ctx.queues[0]).is_empty());
    }

    #[test]
    fn test_scan_skips_recent_connections() {
        let (ctx, queues) = test_ctx();
        let trans = test_transport();
        ctx.transports.lock().push(trans);

        // Phase NeedCreate but well within the timeout.
        scan(&ctx);
        assert!(drain(&queues[0]).is_empty());
    }
}
