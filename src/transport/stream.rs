// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream abstraction over plain TCP and TLS sockets.
//!
//! The engine selects one implementation per connection at creation time
//! and never changes it. Both implementations are readiness-oriented:
//! would-block conditions (OS or TLS) are returned as distinct outcomes,
//! never as errors, so the state machine can encode them as modifier flags
//! and resume on the next epoll event.
//!
//! The TLS implementation drives a `rustls::ClientConnection`; the
//! asymmetric `WantRead`/`WantWrite` handshake results mirror what the
//! session needs from the socket next.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::pki_types::ServerName;

use crate::Error;

// ============================================================================
// Outcomes
// ============================================================================

/// Result of a stream read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` plaintext bytes were produced.
    Data(usize),
    /// No data available; wait for the next readable event.
    WouldBlock,
    /// The peer closed the connection.
    Closed,
    /// Socket-level error.
    Err(io::Error),
    /// Run-fatal error (TLS trust verification).
    Fatal(Error),
}

/// Result of a stream write.
#[derive(Debug)]
pub enum WriteOutcome {
    /// `n` plaintext bytes were accepted.
    Wrote(usize),
    /// The socket (or the TLS transmit buffer) is full.
    WouldBlock,
    /// Socket-level error.
    Err(io::Error),
}

/// Result of driving the handshake.
#[derive(Debug)]
pub enum HandshakeOutcome {
    Done,
    /// Re-enter when the socket becomes readable.
    WantRead,
    /// Re-enter when the socket becomes writable.
    WantWrite,
    /// Run-fatal error (trust-store verification failure).
    Fatal(Error),
    /// Per-connection error.
    Err(io::Error),
}

// ============================================================================
// NetStream
// ============================================================================

/// Closed interface over the two transport stream kinds.
pub trait NetStream: Send {
    /// Register the socket with a listener's poll registry.
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;

    /// Remove the socket from the poll registry.
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Take the pending SO_ERROR, if any.
    fn take_error(&mut self) -> io::Result<Option<io::Error>>;

    /// Local address after the socket is bound/connected.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Drive the protocol handshake. Plain TCP completes immediately.
    fn handshake(&mut self) -> HandshakeOutcome;

    /// Read plaintext into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;

    /// Write plaintext from `buf`.
    fn write(&mut self, buf: &[u8]) -> WriteOutcome;

    /// Whether ciphertext is buffered and waiting for a writable socket.
    fn has_buffered_tx(&self) -> bool {
        false
    }

    /// Push buffered ciphertext to the socket.
    fn flush(&mut self) -> WriteOutcome {
        WriteOutcome::Wrote(0)
    }

    /// Best-effort orderly shutdown.
    fn close(&mut self);

    fn is_tls(&self) -> bool {
        false
    }
}

// ============================================================================
// Plain TCP
// ============================================================================

/// Plain (non-TLS) stream.
pub struct PlainStream {
    sock: TcpStream,
}

impl PlainStream {
    pub fn new(sock: TcpStream) -> Self {
        Self { sock }
    }
}

impl NetStream for PlainStream {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut self.sock,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.sock)
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        self.sock.take_error()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    fn handshake(&mut self) -> HandshakeOutcome {
        HandshakeOutcome::Done
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        loop {
            return match self.sock.read(buf) {
                Ok(0) => ReadOutcome::Closed,
                Ok(n) => ReadOutcome::Data(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => ReadOutcome::Err(e),
            };
        }
    }

    fn write(&mut self, buf: &[u8]) -> WriteOutcome {
        loop {
            return match self.sock.write(buf) {
                Ok(0) => WriteOutcome::Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed",
                )),
                Ok(n) => WriteOutcome::Wrote(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => WriteOutcome::Err(e),
            };
        }
    }

    fn close(&mut self) {
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
    }
}

// ============================================================================
// TLS
// ============================================================================

/// TLS stream over a non-blocking socket.
pub struct TlsStream {
    sock: TcpStream,
    tls: rustls::ClientConnection,
    /// Socket reached EOF on the read side.
    eof: bool,
}

impl TlsStream {
    pub fn new(
        sock: TcpStream,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, rustls::Error> {
        let tls = rustls::ClientConnection::new(config, server_name)?;
        Ok(Self {
            sock,
            tls,
            eof: false,
        })
    }

    /// Pull one batch of ciphertext from the socket into the session.
    ///
    /// Returns `Err` with the failure mapped for the caller; `Ok(true)` if
    /// progress was made, `Ok(false)` on would-block.
    fn pump_read(&mut self) -> Result<bool, ReadOutcome> {
        loop {
            return match self.tls.read_tls(&mut self.sock) {
                Ok(0) => {
                    self.eof = true;
                    Ok(false)
                }
                Ok(_) => match self.tls.process_new_packets() {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        // Flush the alert describing why we are hanging up.
                        let _ = self.tls.write_tls(&mut self.sock);
                        let mapped: Error = e.into();
                        if mapped.is_fatal() {
                            Err(ReadOutcome::Fatal(mapped))
                        } else {
                            Err(ReadOutcome::Err(io::Error::other(mapped.to_string())))
                        }
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(ReadOutcome::Err(e)),
            };
        }
    }

    /// Push pending ciphertext to the socket.
    ///
    /// Returns `Ok(true)` when everything was flushed, `Ok(false)` on
    /// would-block.
    fn pump_write(&mut self) -> io::Result<bool> {
        while self.tls.wants_write() {
            loop {
                match self.tls.write_tls(&mut self.sock) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "connection closed",
                        ))
                    }
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(true)
    }
}

impl NetStream for TlsStream {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut self.sock,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.sock)
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        self.sock.take_error()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    fn handshake(&mut self) -> HandshakeOutcome {
        loop {
            match self.pump_write() {
                Ok(true) => {}
                Ok(false) => return HandshakeOutcome::WantWrite,
                Err(e) => return HandshakeOutcome::Err(e),
            }
            if !self.tls.is_handshaking() {
                return HandshakeOutcome::Done;
            }
            match self.pump_read() {
                Ok(true) => continue,
                Ok(false) => {
                    if self.eof {
                        return HandshakeOutcome::Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "server closed connection during TLS handshake",
                        ));
                    }
                    return HandshakeOutcome::WantRead;
                }
                Err(ReadOutcome::Fatal(e)) => return HandshakeOutcome::Fatal(e),
                Err(ReadOutcome::Err(e)) => return HandshakeOutcome::Err(e),
                Err(_) => return HandshakeOutcome::WantRead,
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if let Err(outcome) = self.pump_read() {
            return outcome;
        }
        // Handshake or ack traffic generated by the read.
        if let Err(e) = self.pump_write() {
            return ReadOutcome::Err(e);
        }

        match self.tls.reader().read(buf) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => ReadOutcome::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if self.eof {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::WouldBlock
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => ReadOutcome::Closed,
            Err(e) => ReadOutcome::Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> WriteOutcome {
        // Drain pending ciphertext first; refusing new plaintext while the
        // socket lags bounds memory at high connection counts.
        match self.pump_write() {
            Ok(true) => {}
            Ok(false) => return WriteOutcome::WouldBlock,
            Err(e) => return WriteOutcome::Err(e),
        }

        let n = match self.tls.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return WriteOutcome::Err(e),
        };
        match self.pump_write() {
            Ok(_) => WriteOutcome::Wrote(n),
            Err(e) => WriteOutcome::Err(e),
        }
    }

    fn has_buffered_tx(&self) -> bool {
        self.tls.wants_write()
    }

    fn flush(&mut self) -> WriteOutcome {
        match self.pump_write() {
            Ok(true) => WriteOutcome::Wrote(0),
            Ok(false) => WriteOutcome::WouldBlock,
            Err(e) => WriteOutcome::Err(e),
        }
    }

    fn close(&mut self) {
        self.tls.send_close_notify();
        let _ = self.pump_write();
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
    }

    fn is_tls(&self) -> bool {
        true
    }
}

// ============================================================================
// Test mock
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Shared script/capture state, so tests keep a handle after the
    /// stream is boxed into a connection.
    #[derive(Default)]
    pub struct MockState {
        pub read_data: Mutex<VecDeque<u8>>,
        pub written: Mutex<Vec<u8>>,
        pub read_error: Mutex<Option<io::ErrorKind>>,
        pub write_error: Mutex<Option<io::ErrorKind>>,
        /// SO_ERROR returned by the next `take_error` call.
        pub so_error: Mutex<Option<io::Error>>,
        pub connected: Mutex<bool>,
        /// Cap on bytes accepted per write (None = unlimited).
        pub write_limit: Mutex<Option<usize>>,
        pub closed: Mutex<bool>,
    }

    impl MockState {
        pub fn feed(&self, data: &[u8]) {
            self.read_data.lock().unwrap().extend(data);
        }

        pub fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }

        pub fn set_so_error(&self, e: io::Error) {
            *self.so_error.lock().unwrap() = Some(e);
        }

        pub fn disconnect(&self) {
            *self.connected.lock().unwrap() = false;
        }
    }

    /// Scriptable stream for state-machine tests.
    pub struct MockStream {
        pub state: Arc<MockState>,
        pub local: SocketAddr,
        pub registered: bool,
    }

    impl MockStream {
        pub fn new() -> Self {
            let state = Arc::new(MockState {
                connected: Mutex::new(true),
                ..Default::default()
            });
            Self::with_state(state)
        }

        pub fn with_state(state: Arc<MockState>) -> Self {
            Self {
                state,
                local: "127.0.0.1:34567".parse().unwrap(),
                registered: false,
            }
        }

        /// New stream plus a handle to its shared state.
        pub fn pair() -> (Self, Arc<MockState>) {
            let stream = Self::new();
            let state = Arc::clone(&stream.state);
            (stream, state)
        }

        pub fn feed(&self, data: &[u8]) {
            self.state.feed(data);
        }

        pub fn written(&self) -> Vec<u8> {
            self.state.written()
        }
    }

    impl Default for MockStream {
        fn default() -> Self {
            Self::new()
        }
    }

    impl NetStream for MockStream {
        fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
            self.registered = true;
            Ok(())
        }

        fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
            self.registered = false;
            Ok(())
        }

        fn take_error(&mut self) -> io::Result<Option<io::Error>> {
            Ok(self.state.so_error.lock().unwrap().take())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }

        fn handshake(&mut self) -> HandshakeOutcome {
            HandshakeOutcome::Done
        }

        fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
            if let Some(kind) = self.state.read_error.lock().unwrap().take() {
                return ReadOutcome::Err(io::Error::new(kind, "injected"));
            }
            if !*self.state.connected.lock().unwrap() {
                return ReadOutcome::Closed;
            }
            let mut data = self.state.read_data.lock().unwrap();
            if data.is_empty() {
                return ReadOutcome::WouldBlock;
            }
            let n = buf.len().min(data.len());
            for (i, b) in data.drain(..n).enumerate() {
                buf[i] = b;
            }
            ReadOutcome::Data(n)
        }

        fn write(&mut self, buf: &[u8]) -> WriteOutcome {
            if let Some(kind) = self.state.write_error.lock().unwrap().take() {
                return WriteOutcome::Err(io::Error::new(kind, "injected"));
            }
            if !*self.state.connected.lock().unwrap() {
                return WriteOutcome::Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "not connected",
                ));
            }
            let n = match *self.state.write_limit.lock().unwrap() {
                Some(0) => return WriteOutcome::WouldBlock,
                Some(limit) => buf.len().min(limit),
                None => buf.len(),
            };
            self.state.written.lock().unwrap().extend_from_slice(&buf[..n]);
            WriteOutcome::Wrote(n)
        }

        fn close(&mut self) {
            *self.state.closed.lock().unwrap() = true;
            *self.state.connected.lock().unwrap() = false;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockStream;
    use super::*;

    #[test]
    fn test_trait_is_object_safe() {
        fn assert_boxed(_s: &dyn NetStream) {}
        let s = MockStream::new();
        assert_boxed(&s);
    }

    #[test]
    fn test_mock_read_write() {
        let mut s = MockStream::new();
        let mut buf = [0u8; 8];

        assert!(matches!(s.read(&mut buf), ReadOutcome::WouldBlock));

        s.feed(b"hello");
        match s.read(&mut buf) {
            ReadOutcome::Data(5) => assert_eq!(&buf[..5], b"hello"),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(s.write(b"out"), WriteOutcome::Wrote(3)));
        assert_eq!(s.written(), b"out");
    }

    #[test]
    fn test_mock_partial_write() {
        let mut s = MockStream::new();
        *s.state.write_limit.lock().unwrap() = Some(2);
        assert!(matches!(s.write(b"abcdef"), WriteOutcome::Wrote(2)));
        assert_eq!(s.written(), b"ab");

        *s.state.write_limit.lock().unwrap() = Some(0);
        assert!(matches!(s.write(b"cdef"), WriteOutcome::WouldBlock));
    }

    #[test]
    fn test_mock_error_injection() {
        let mut s = MockStream::new();
        *s.state.read_error.lock().unwrap() = Some(io::ErrorKind::ConnectionReset);
        let mut buf = [0u8; 4];
        assert!(matches!(s.read(&mut buf), ReadOutcome::Err(_)));

        // Error is one-shot.
        s.feed(b"x");
        assert!(matches!(s.read(&mut buf), ReadOutcome::Data(1)));
    }

    #[test]
    fn test_mock_peer_close() {
        let mut s = MockStream::new();
        s.state.disconnect();
        let mut buf = [0u8; 4];
        assert!(matches!(s.read(&mut buf), ReadOutcome::Closed));
        assert!(matches!(s.write(b"x"), WriteOutcome::Err(_)));
    }

    #[test]
    fn test_mock_so_error() {
        let mut s = MockStream::new();
        s.state.set_so_error(io::Error::from_raw_os_error(111)); // ECONNREFUSED
        assert!(s.take_error().unwrap().is_some());
        assert!(s.take_error().unwrap().is_none());
    }
}
