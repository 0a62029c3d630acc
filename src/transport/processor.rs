// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! I/O processor threads.
//!
//! Each processor owns a double-buffered job queue and drives the state
//! machine for its shard of connections. Producers (listeners, the timer
//! thread, the submission path) append under the queue lock; the
//! processor swaps the whole list out under the same lock and then works
//! off its local copy lock-free. Connections whose step returns
//! `Continue` stay in the local run list for the next iteration; the
//! `in_processing` flag guarantees a connection is never present in two
//! run lists at once.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::session::{self, ProtocolState};
use crate::transport::engine::{EngineShared, ProcCtx};
use crate::transport::{
    on_shutdown, process_io_request, Conn, IoOutcome, Modifiers, Phase, Transport,
    ERROR_LOG_INTERVAL,
};

// Event bits carried by a job.
pub(crate) const EV_READABLE: u8 = 1 << 0;
pub(crate) const EV_WRITABLE: u8 = 1 << 1;
pub(crate) const EV_ERROR: u8 = 1 << 2;
pub(crate) const EV_HUP: u8 = 1 << 3;
/// Application requested teardown (graceful removal path).
pub(crate) const EV_DISCONNECT_REQ: u8 = 1 << 4;

// ============================================================================
// Jobs
// ============================================================================

/// Callback flavor of a job. The engine's job callbacks form a small
/// closed set, so an enum replaces the original's function pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JobAction {
    /// Fold events and run the state machine.
    Process,
    /// Invoke reconnect scheduling (stuck-connection scan).
    Reconnect,
    /// Submit a keepalive ping.
    Ping,
    /// Begin a graceful disconnect (linger expiry).
    Disconnect,
}

/// Unit of work queued to a processor.
pub(crate) struct Job {
    pub trans: Arc<Transport>,
    pub events: u8,
    pub action: JobAction,
}

impl Job {
    pub fn process(trans: Arc<Transport>) -> Job {
        Job {
            trans,
            events: 0,
            action: JobAction::Process,
        }
    }

    pub fn events(trans: Arc<Transport>, events: u8) -> Job {
        Job {
            trans,
            events,
            action: JobAction::Process,
        }
    }

    pub fn callback(trans: Arc<Transport>, action: JobAction) -> Job {
        Job {
            trans,
            events: 0,
            action,
        }
    }
}

/// Double-buffered job list.
///
/// `push` appends under the lock; `swap` exchanges the filled list for the
/// processor's drained local list, so producers never contend with job
/// execution.
pub(crate) struct JobQueue {
    jobs: Mutex<Vec<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, job: Job) {
        self.jobs.lock().push(job);
    }

    /// Exchange the queued jobs for the caller's (empty) local list.
    pub fn swap(&self, local: &mut Vec<Job>) {
        debug_assert!(local.is_empty());
        std::mem::swap(&mut *self.jobs.lock(), local);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}

// ============================================================================
// Event folding
// ============================================================================

/// Fold a job's readiness events into the connection's modifier flags.
fn apply_events(trans: &Arc<Transport>, c: &mut Conn, events: u8, ctx: &ProcCtx<'_>) {
    if events & EV_DISCONNECT_REQ != 0 {
        c.removed = true;
        if c.session.state.is_active() {
            // Let queued messages drain before the DISCONNECT goes out.
            c.mods.set(Modifiers::DEFERRED_SHUTDOWN);
        } else if c.phase != Phase::Disconnected {
            trans.set_phase(c, Phase::ShuttingDown, ctx.shared);
        }
    }

    if events & EV_READABLE != 0 {
        c.mods.set(Modifiers::CAN_READ);
    }
    if events & EV_WRITABLE != 0 {
        c.mods.set(Modifiers::CAN_WRITE);
    }

    if events & (EV_ERROR | EV_HUP) != 0 {
        let so_error = c
            .stream
            .as_mut()
            .and_then(|s| s.take_error().ok().flatten());
        if ctx.shared.metrics.record_socket_error() % ERROR_LOG_INTERVAL == 0 {
            warn!(
                "client {} poll error events 0x{:x} (phase {}, SO_ERROR {:?})",
                trans.cfg.client_id,
                events,
                c.phase,
                so_error.as_ref().map(|e| e.to_string())
            );
        }
        if events & EV_HUP != 0 {
            trans.set_protocol(c, ProtocolState::Disconnected);
        }
        c.mods.set(Modifiers::SOCK_ERROR);
    }
}

// ============================================================================
// Processor loop
// ============================================================================

/// Run one processor thread until engine shutdown.
pub(crate) fn run_processor(shared: Arc<EngineShared>, idx: usize) {
    let queue = Arc::clone(&shared.queues[idx]);
    let ctx = ProcCtx::new(&shared, idx);

    let mut local_jobs: Vec<Job> = Vec::new();
    let mut run_list: Vec<Arc<Transport>> = Vec::new();
    let mut next_run: Vec<Arc<Transport>> = Vec::new();

    while !shared.is_stopping() {
        queue.swap(&mut local_jobs);

        for job in local_jobs.drain(..) {
            let trans = job.trans;
            match job.action {
                JobAction::Process => {
                    {
                        let mut c = trans.conn.lock();
                        apply_events(&trans, &mut c, job.events, &ctx);
                    }
                    if !trans.in_processing.swap(true, Ordering::AcqRel) {
                        run_list.push(trans);
                    }
                }
                JobAction::Reconnect => {
                    let mut c = trans.conn.lock();
                    if trans.cfg.reconnect.enabled && !c.removed {
                        crate::reconnect::schedule_reconnect(&trans, &mut c, &ctx);
                    } else {
                        trans.set_phase(&mut c, Phase::ShuttingDown, ctx.shared);
                        drop(c);
                        if !trans.in_processing.swap(true, Ordering::AcqRel) {
                            run_list.push(trans);
                        }
                    }
                }
                JobAction::Ping => {
                    {
                        let mut c = trans.conn.lock();
                        session::submit_ping(&trans, &mut c, &ctx);
                    }
                    if !trans.in_processing.swap(true, Ordering::AcqRel) {
                        run_list.push(trans);
                    }
                }
                JobAction::Disconnect => {
                    {
                        let mut c = trans.conn.lock();
                        c.removed = true;
                        if c.session.state.is_active() {
                            c.mods.set(Modifiers::DEFERRED_SHUTDOWN);
                        } else if c.phase != Phase::Disconnected {
                            trans.set_phase(&mut c, Phase::ShuttingDown, ctx.shared);
                        }
                    }
                    if !trans.in_processing.swap(true, Ordering::AcqRel) {
                        run_list.push(trans);
                    }
                }
            }
        }

        // Work the local run list; Continue keeps a connection in it.
        for trans in run_list.drain(..) {
            let outcome = {
                let mut c = trans.conn.lock();
                process_io_request(&trans, &mut c, &ctx)
            };
            match outcome {
                IoOutcome::Continue => next_run.push(trans),
                IoOutcome::AwaitEvent => {
                    trans.in_processing.store(false, Ordering::Release);
                }
                IoOutcome::Shutdown => {
                    {
                        let mut c = trans.conn.lock();
                        on_shutdown(&trans, &mut c, &ctx);
                    }
                    trans.in_processing.store(false, Ordering::Release);
                }
            }
        }
        std::mem::swap(&mut run_list, &mut next_run);

        // Pacing: an explicit batching delay trades latency for larger
        // write batches; the default yields to keep latency minimal.
        match shared.config.batching_delay {
            Some(delay) => std::thread::sleep(delay),
            None => {
                std::thread::yield_now();
                std::thread::yield_now();
                std::thread::yield_now();
            }
        }
    }

    // Drop the in-processing claim on anything still in flight so a
    // future engine could hand these off.
    for trans in run_list.drain(..) {
        trans.in_processing.store(false, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================
