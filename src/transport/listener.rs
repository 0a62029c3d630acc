// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! I/O listener threads.
//!
//! Each listener owns one `mio::Poll` instance (one epoll set) and
//! demultiplexes readiness for its shard of connections into [`Job`]s on
//! the owning processor's queue. Listeners never run connection logic:
//! state lives with the processors, the listener only translates events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::transport::engine::EngineShared;
use crate::transport::processor::{self, Job};
use crate::transport::stream::NetStream;
use crate::transport::{Conn, Transport};

/// Token reserved for the shutdown waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// First token handed to connections.
const CONNECTION_TOKEN_START: usize = 1;

/// Poll timeout; bounds shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Events processed per poll call.
const MAX_EVENTS: usize = 1024;

// ============================================================================
// Shared listener state
// ============================================================================

/// The part of a listener that other threads interact with: processors
/// register and deregister sockets here, the engine wakes it for shutdown.
pub(crate) struct ListenerShared {
    pub registry: Registry,
    pub waker: Waker,
    tokens: Mutex<HashMap<Token, Arc<Transport>>>,
    next_token: AtomicUsize,
}

impl ListenerShared {
    pub fn new(poll: &Poll) -> std::io::Result<Self> {
        Ok(Self {
            registry: poll.registry().try_clone()?,
            waker: Waker::new(poll.registry(), WAKER_TOKEN)?,
            tokens: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(CONNECTION_TOKEN_START),
        })
    }

    /// Register a connection's socket with this listener's poll set.
    pub fn attach(
        &self,
        trans: &Arc<Transport>,
        stream: &mut Box<dyn NetStream>,
    ) -> std::io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        stream.register(&self.registry, token)?;
        self.tokens.lock().insert(token, Arc::clone(trans));
        Ok(token)
    }

    /// Remove a connection from the poll set. Safe to call when the
    /// connection was never attached.
    pub fn detach(&self, c: &mut Conn) {
        if let Some(token) = c.token.take() {
            self.tokens.lock().remove(&token);
        }
        if let Some(stream) = c.stream.as_mut() {
            let _ = stream.deregister(&self.registry);
        }
    }

    fn lookup(&self, token: Token) -> Option<Arc<Transport>> {
        self.tokens.lock().get(&token).cloned()
    }

    /// Connections currently registered with this listener.
    pub fn registered(&self) -> usize {
        self.tokens.lock().len()
    }
}

// ============================================================================
// Listener loop
// ============================================================================

/// Run one listener thread until engine shutdown.
pub(crate) fn run_listener(mut poll: Poll, shared: Arc<EngineShared>, idx: usize) {
    let mut events = Events::with_capacity(MAX_EVENTS);
    let me = &shared.listeners[idx];

    while !shared.is_stopping() {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                warn!("listener {} poll failed: {}", idx, e);
            }
            continue;
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue; // shutdown is re-checked at the loop head
            }
            let Some(trans) = me.lookup(event.token()) else {
                // Deregistered while the event was in flight.
                continue;
            };

            let mut ev = 0u8;
            if event.is_readable() {
                ev |= processor::EV_READABLE;
            }
            if event.is_writable() {
                ev |= processor::EV_WRITABLE;
            }
            if event.is_error() {
                ev |= processor::EV_ERROR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                ev |= processor::EV_HUP;
            }

            shared.queues[trans.processor_idx].push(Job::events(trans, ev));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stream::mock::MockStream;

    fn test_transport() -> Arc<Transport> {
        Arc::new(Transport::new(
            1,
            Arc::new(crate::ClientConfig::new(
                "l0",
                "127.0.0.1:1883".parse().unwrap(),
            )),
            0,
            0,
            &crate::EngineConfig::default(),
        ))
    }

    #[test]
    fn test_attach_assigns_unique_tokens() {
        let poll = Poll::new().unwrap();
        let shared = ListenerShared::new(&poll).unwrap();
        let trans = test_transport();

        let mut s1: Box<dyn NetStream> = Box::new(MockStream::new());
        let mut s2: Box<dyn NetStream> = Box::new(MockStream::new());
        let t1 = shared.attach(&trans, &mut s1).unwrap();
        let t2 = shared.attach(&trans, &mut s2).unwrap();

        assert_ne!(t1, t2);
        assert_ne!(t1, WAKER_TOKEN);
        assert_eq!(shared.registered(), 2);
        assert!(shared.lookup(t1).is_some());
    }

    #[test]
    fn test_detach_clears_token() {
        let poll = Poll::new().unwrap();
        let shared = ListenerShared::new(&poll).unwrap();
        let trans = test_transport();

        let mut stream: Box<dyn NetStream> = Box::new(MockStream::new());
        let token = shared.attach(&trans, &mut stream).unwrap();

        let mut c = trans.conn.lock();
        c.stream = Some(stream);
        c.token = Some(token);
        shared.detach(&mut c);

        assert_eq!(shared.registered(), 0);
        assert!(c.token.is_none());
        assert!(shared.lookup(token).is_none());

        // Detaching again is harmless.
        shared.detach(&mut c);
    }
}
