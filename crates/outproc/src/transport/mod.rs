// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pair (one-to-one) datagram transport over `ipc://` endpoints.
//!
//! Each endpoint names a Unix rendezvous path; frames travel over
//! `AF_UNIX`/`SOCK_SEQPACKET` sockets, which preserve message boundaries
//! while keeping the connection-style pair semantics the binding needs.
//!
//! # Roles
//!
//! - [`PairSocket`] in the *dialer* role (the proxy side) stores its
//!   endpoint and re-dials on demand: an unreachable peer is not an error
//!   at connect time, and a lost peer is re-dialed transparently on the
//!   next send or receive. Dial attempts are rate-limited by
//!   [`RECONNECT_IVL`].
//! - [`PairListener`] (the host side) binds the rendezvous path; accepted
//!   connections are [`PairSocket`]s in the *accepted* role, which never
//!   re-dial -- peer loss surfaces as [`TransportError::Disconnected`] and
//!   the owner accepts a fresh connection.
//!
//! Send and close retry on `EINTR`; receives size their buffer from the
//! incoming message via `MSG_PEEK | MSG_TRUNC`, so no fixed maximum frame
//! size exists at this layer.

use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use socket2::{Domain, SockAddr, Socket, Type};

/// Minimum interval between dial attempts to an unreachable peer.
pub const RECONNECT_IVL: Duration = Duration::from_millis(100);

/// Upper bound for an endpoint path, bounded by `sun_path`.
pub const MAX_ENDPOINT_PATH: usize = 107;

const IPC_SCHEME: &str = "ipc://";

/// Blocking behavior of a single send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Wait, bounded by the socket's receive timeout where one is set.
    Blocking,
    /// Return [`TransportError::WouldBlock`] instead of waiting.
    NonBlocking,
}

/// Transport-level error.
#[derive(Debug)]
pub enum TransportError {
    /// Non-blocking operation would have waited.
    WouldBlock,
    /// Blocking receive hit the configured timeout.
    TimedOut,
    /// Peer is gone or not yet reachable. Transient: a dialer re-dials on
    /// the next operation, a listener owner re-accepts.
    Disconnected,
    /// Socket was shut down locally. Fatal.
    Closed,
    /// Malformed endpoint string.
    Addr(String),
    /// Unrecoverable I/O error.
    Io(io::Error),
}

impl TransportError {
    /// True for errors the data path treats as retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::WouldBlock | TransportError::TimedOut | TransportError::Disconnected
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::WouldBlock => write!(f, "operation would block"),
            TransportError::TimedOut => write!(f, "receive timed out"),
            TransportError::Disconnected => write!(f, "peer disconnected"),
            TransportError::Closed => write!(f, "socket closed"),
            TransportError::Addr(reason) => write!(f, "invalid endpoint: {}", reason),
            TransportError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// Parse an `ipc://<path>` endpoint into its rendezvous path.
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf, TransportError> {
    let path = endpoint
        .strip_prefix(IPC_SCHEME)
        .ok_or_else(|| TransportError::Addr(format!("'{}' is not an ipc:// endpoint", endpoint)))?;
    if path.is_empty() {
        return Err(TransportError::Addr("empty endpoint path".into()));
    }
    if path.len() > MAX_ENDPOINT_PATH {
        return Err(TransportError::Addr(format!(
            "endpoint path exceeds {} bytes",
            MAX_ENDPOINT_PATH
        )));
    }
    Ok(PathBuf::from(path))
}

enum Role {
    /// Proxy side: owns the endpoint path and re-dials on demand.
    Dialer { path: PathBuf },
    /// Host side: handed an established connection by the listener.
    Accepted,
}

struct DialState {
    conn: Option<Arc<Socket>>,
    last_attempt: Option<Instant>,
}

/// One end of a pair datagram channel. All operations take `&self`; the
/// underlying descriptor is shared behind an `Arc` snapshot so no lock is
/// held across I/O.
pub struct PairSocket {
    role: Role,
    state: Mutex<DialState>,
    recv_timeout: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl PairSocket {
    /// Create a dialer for `endpoint` and attempt an eager dial. Failure to
    /// reach the peer is not an error here: the peer may not have bound the
    /// rendezvous yet, and every send/receive re-dials as needed.
    pub fn connect(endpoint: &str) -> Result<PairSocket, TransportError> {
        let path = parse_endpoint(endpoint)?;
        let socket = PairSocket {
            role: Role::Dialer { path },
            state: Mutex::new(DialState {
                conn: None,
                last_attempt: None,
            }),
            recv_timeout: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        match socket.current() {
            Ok(_) => log::debug!("[PAIR] connected to {}", endpoint),
            Err(e) if e.is_transient() => {
                log::debug!("[PAIR] {} not reachable yet, will re-dial", endpoint);
            }
            Err(e) => return Err(e),
        }
        Ok(socket)
    }

    fn from_accepted(conn: Socket) -> PairSocket {
        PairSocket {
            role: Role::Accepted,
            state: Mutex::new(DialState {
                conn: Some(Arc::new(conn)),
                last_attempt: None,
            }),
            recv_timeout: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Snapshot the current connection, dialing if this is a dialer without
    /// one. Rate-limited by [`RECONNECT_IVL`].
    fn current(&self) -> Result<Arc<Socket>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut state = lock_unpoisoned(&self.state);
        if let Some(conn) = &state.conn {
            return Ok(Arc::clone(conn));
        }
        let path = match &self.role {
            Role::Dialer { path } => path,
            Role::Accepted => return Err(TransportError::Disconnected),
        };
        if let Some(last) = state.last_attempt {
            if last.elapsed() < RECONNECT_IVL {
                return Err(TransportError::Disconnected);
            }
        }
        state.last_attempt = Some(Instant::now());
        match dial(path, *lock_unpoisoned(&self.recv_timeout)) {
            Ok(conn) => {
                let conn = Arc::new(conn);
                state.conn = Some(Arc::clone(&conn));
                Ok(conn)
            }
            Err(e) => {
                log::debug!("[PAIR] dial {} failed: {}", path.display(), e);
                Err(TransportError::Disconnected)
            }
        }
    }

    /// Drop the connection snapshot `conn` was taken from, unless a newer
    /// one has already replaced it. Clears the dial backoff so a dialer
    /// retries immediately.
    fn mark_disconnected(&self, conn: &Arc<Socket>) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(current) = &state.conn {
            if Arc::ptr_eq(current, conn) {
                state.conn = None;
                state.last_attempt = None;
            }
        }
    }

    /// Send one message. Retries `EINTR`; an unreachable peer maps to
    /// [`TransportError::WouldBlock`] in non-blocking mode.
    pub fn send(&self, buf: &[u8], mode: IoMode) -> Result<usize, TransportError> {
        let conn = match self.current() {
            Ok(conn) => conn,
            Err(TransportError::Disconnected) if mode == IoMode::NonBlocking => {
                return Err(TransportError::WouldBlock);
            }
            Err(e) => return Err(e),
        };
        let mut flags = libc::MSG_NOSIGNAL;
        if mode == IoMode::NonBlocking {
            flags |= libc::MSG_DONTWAIT;
        }
        loop {
            match conn.send_with_flags(buf, flags) {
                Ok(sent) => return Ok(sent),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TransportError::WouldBlock);
                }
                Err(e) if is_peer_loss(&e) => {
                    self.mark_disconnected(&conn);
                    return Err(TransportError::Disconnected);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Receive one message into a buffer sized from the message itself.
    ///
    /// Blocking receives are bounded by the timeout set via
    /// [`set_recv_timeout`](Self::set_recv_timeout). `EINTR` is retried
    /// internally; peer loss maps to the transient
    /// [`TransportError::Disconnected`].
    pub fn recv(&self, mode: IoMode) -> Result<Vec<u8>, TransportError> {
        let conn = match self.current() {
            Ok(conn) => conn,
            Err(TransportError::Disconnected) if mode == IoMode::NonBlocking => {
                return Err(TransportError::WouldBlock);
            }
            Err(e) => return Err(e),
        };
        let mut flags = 0;
        if mode == IoMode::NonBlocking {
            flags |= libc::MSG_DONTWAIT;
        }
        loop {
            // Probe the size of the pending message without consuming it.
            let mut probe = [0u8; 1];
            let len = match recv_into(&conn, &mut probe, flags | libc::MSG_PEEK | libc::MSG_TRUNC)
            {
                Ok(0) => {
                    // SEQPACKET end-of-stream; this protocol never sends
                    // empty messages.
                    self.mark_disconnected(&conn);
                    return Err(TransportError::Disconnected);
                }
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(match mode {
                        IoMode::NonBlocking => TransportError::WouldBlock,
                        IoMode::Blocking => TransportError::TimedOut,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(TransportError::TimedOut);
                }
                Err(e) if is_peer_loss(&e) => {
                    self.mark_disconnected(&conn);
                    return Err(TransportError::Disconnected);
                }
                Err(e) => return Err(TransportError::Io(e)),
            };

            let mut buf = vec![0u8; len];
            match recv_into(&conn, &mut buf, flags) {
                Ok(0) => {
                    self.mark_disconnected(&conn);
                    return Err(TransportError::Disconnected);
                }
                Ok(got) => {
                    buf.truncate(got);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Another reader consumed the probed message.
                    return Err(match mode {
                        IoMode::NonBlocking => TransportError::WouldBlock,
                        IoMode::Blocking => TransportError::TimedOut,
                    });
                }
                Err(e) if is_peer_loss(&e) => {
                    self.mark_disconnected(&conn);
                    return Err(TransportError::Disconnected);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Set the receive timeout for blocking receives. Sticky: re-applied to
    /// every re-dialed connection.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        let timeout = timeout.filter(|d| !d.is_zero());
        *lock_unpoisoned(&self.recv_timeout) = timeout;
        let conn = lock_unpoisoned(&self.state).conn.as_ref().map(Arc::clone);
        if let Some(conn) = conn {
            if let Err(e) = conn.set_read_timeout(timeout) {
                log::warn!("[PAIR] unable to set receive timeout: {}", e);
            }
        }
    }

    /// True once a live connection to the peer exists (dialing if needed).
    pub fn ready(&self) -> bool {
        self.current().is_ok()
    }

    /// Shut the channel down. Wakes any thread blocked in [`recv`](Self::recv)
    /// on either end; every subsequent operation fails with
    /// [`TransportError::Closed`].
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = lock_unpoisoned(&self.state).conn.take();
        if let Some(conn) = conn {
            // Retry on interrupt, like the close path.
            loop {
                match conn.shutdown(std::net::Shutdown::Both) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    _ => break,
                }
            }
        }
    }
}

impl fmt::Debug for PairSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Role::Dialer { path } => write!(f, "PairSocket(dial {})", path.display()),
            Role::Accepted => write!(f, "PairSocket(accepted)"),
        }
    }
}

/// Listening end of a pair channel. Owns the rendezvous path; the socket
/// file is removed again on drop.
pub struct PairListener {
    path: PathBuf,
    socket: Socket,
}

impl PairListener {
    /// Bind and listen on `endpoint`, replacing any stale socket file left
    /// behind by a previous process.
    pub fn bind(endpoint: &str) -> Result<PairListener, TransportError> {
        let path = parse_endpoint(endpoint)?;
        match std::fs::remove_file(&path) {
            Ok(()) => log::debug!("[PAIR] removed stale socket file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(TransportError::Io(e)),
        }
        let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None).map_err(TransportError::Io)?;
        let addr = SockAddr::unix(&path).map_err(TransportError::Io)?;
        socket.bind(&addr).map_err(TransportError::Io)?;
        socket.listen(4).map_err(TransportError::Io)?;
        socket.set_nonblocking(true).map_err(TransportError::Io)?;
        log::debug!("[PAIR] listening on {}", path.display());
        Ok(PairListener { path, socket })
    }

    /// Accept one peer connection, non-blocking.
    pub fn accept(&self) -> Result<PairSocket, TransportError> {
        loop {
            match self.socket.accept() {
                Ok((conn, _)) => {
                    // Accepted descriptors may inherit O_NONBLOCK; per-call
                    // flags decide blocking behavior instead.
                    conn.set_nonblocking(false).map_err(TransportError::Io)?;
                    log::debug!("[PAIR] accepted peer on {}", self.path.display());
                    return Ok(PairSocket::from_accepted(conn));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TransportError::WouldBlock);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PairListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl fmt::Debug for PairListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairListener({})", self.path.display())
    }
}

fn dial(path: &Path, recv_timeout: Option<Duration>) -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
    socket.connect(&SockAddr::unix(path)?)?;
    socket.set_read_timeout(recv_timeout)?;
    Ok(socket)
}

fn recv_into(socket: &Socket, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    // SAFETY: `u8` and `MaybeUninit<u8>` have identical layout, and `buf` is
    // fully initialized before and after the call.
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv_with_flags(uninit, flags)
}

/// Errno patterns that mean the peer went away rather than a local fault.
fn is_peer_loss(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
    )
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn endpoint(dir: &tempfile::TempDir, name: &str) -> String {
        format!("ipc://{}/{}", dir.path().display(), name)
    }

    #[test]
    fn parse_endpoint_accepts_ipc_scheme() {
        assert_eq!(
            parse_endpoint("ipc:///tmp/ctl").unwrap(),
            PathBuf::from("/tmp/ctl")
        );
    }

    #[test]
    fn parse_endpoint_rejects_bad_input() {
        assert!(matches!(
            parse_endpoint("tcp://127.0.0.1:80"),
            Err(TransportError::Addr(_))
        ));
        assert!(matches!(
            parse_endpoint("ipc://"),
            Err(TransportError::Addr(_))
        ));
        let long = format!("ipc:///{}", "x".repeat(MAX_ENDPOINT_PATH + 1));
        assert!(matches!(
            parse_endpoint(&long),
            Err(TransportError::Addr(_))
        ));
    }

    #[test]
    fn send_and_recv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "rt.sock");
        let listener = PairListener::bind(&ep).unwrap();
        let dialer = PairSocket::connect(&ep).unwrap();

        dialer.send(b"hello", IoMode::Blocking).unwrap();
        let accepted = listener.accept().unwrap();
        assert_eq!(accepted.recv(IoMode::Blocking).unwrap(), b"hello");

        accepted.send(b"world", IoMode::Blocking).unwrap();
        assert_eq!(dialer.recv(IoMode::Blocking).unwrap(), b"world");
    }

    #[test]
    fn message_boundaries_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "bounds.sock");
        let listener = PairListener::bind(&ep).unwrap();
        let dialer = PairSocket::connect(&ep).unwrap();
        let accepted = {
            dialer.send(b"a", IoMode::Blocking).unwrap();
            listener.accept().unwrap()
        };
        dialer.send(&vec![7u8; 4096], IoMode::Blocking).unwrap();
        assert_eq!(accepted.recv(IoMode::Blocking).unwrap(), b"a");
        assert_eq!(accepted.recv(IoMode::Blocking).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn nonblocking_recv_would_block_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "nb.sock");
        let listener = PairListener::bind(&ep).unwrap();
        let dialer = PairSocket::connect(&ep).unwrap();
        dialer.send(b"x", IoMode::Blocking).unwrap();
        let accepted = listener.accept().unwrap();
        accepted.recv(IoMode::Blocking).unwrap();
        assert!(matches!(
            accepted.recv(IoMode::NonBlocking),
            Err(TransportError::WouldBlock)
        ));
    }

    #[test]
    fn dialer_without_peer_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "nopeer.sock");
        let dialer = PairSocket::connect(&ep).unwrap();
        assert!(matches!(
            dialer.send(b"x", IoMode::NonBlocking),
            Err(TransportError::WouldBlock)
        ));
        assert!(!dialer.ready());
    }

    #[test]
    fn dialer_reaches_peer_that_binds_late() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "late.sock");
        let dialer = PairSocket::connect(&ep).unwrap();
        assert!(matches!(
            dialer.send(b"x", IoMode::NonBlocking),
            Err(TransportError::WouldBlock)
        ));

        let listener = PairListener::bind(&ep).unwrap();
        // Wait out the dial backoff, then the send must go through.
        thread::sleep(RECONNECT_IVL + Duration::from_millis(20));
        dialer.send(b"x", IoMode::NonBlocking).unwrap();
        let accepted = listener.accept().unwrap();
        assert_eq!(accepted.recv(IoMode::Blocking).unwrap(), b"x");
    }

    #[test]
    fn blocking_recv_honors_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "timeout.sock");
        let listener = PairListener::bind(&ep).unwrap();
        let dialer = PairSocket::connect(&ep).unwrap();
        dialer.set_recv_timeout(Some(Duration::from_millis(50)));
        dialer.send(b"x", IoMode::Blocking).unwrap();
        let _accepted = listener.accept().unwrap();

        let start = Instant::now();
        assert!(matches!(
            dialer.recv(IoMode::Blocking),
            Err(TransportError::TimedOut)
        ));
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn shutdown_wakes_blocked_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "wake.sock");
        let listener = PairListener::bind(&ep).unwrap();
        let dialer = Arc::new(PairSocket::connect(&ep).unwrap());
        dialer.send(b"x", IoMode::Blocking).unwrap();
        let accepted = listener.accept().unwrap();
        accepted.recv(IoMode::Blocking).unwrap();

        let blocked = Arc::clone(&dialer);
        let handle = thread::spawn(move || blocked.recv(IoMode::Blocking));
        thread::sleep(Duration::from_millis(50));
        dialer.shutdown();
        let result = handle.join().unwrap();
        assert!(result.is_err());
        assert!(matches!(
            dialer.recv(IoMode::Blocking),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn peer_close_is_disconnected_and_redial_works() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "redial.sock");
        let listener = PairListener::bind(&ep).unwrap();
        let dialer = PairSocket::connect(&ep).unwrap();
        dialer.send(b"x", IoMode::Blocking).unwrap();
        let accepted = listener.accept().unwrap();
        accepted.recv(IoMode::Blocking).unwrap();
        drop(accepted);

        // First operation after peer loss reports Disconnected...
        let mut saw_disconnect = false;
        for _ in 0..50 {
            match dialer.send(b"y", IoMode::NonBlocking) {
                Err(TransportError::Disconnected) => {
                    saw_disconnect = true;
                    break;
                }
                Ok(_) | Err(TransportError::WouldBlock) => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(saw_disconnect);

        // ...and a later one reaches a re-accepted connection.
        thread::sleep(RECONNECT_IVL + Duration::from_millis(20));
        dialer.send(b"z", IoMode::NonBlocking).unwrap();
        let accepted = listener.accept().unwrap();
        assert_eq!(accepted.recv(IoMode::Blocking).unwrap(), b"z");
    }

    #[test]
    fn listener_drop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir, "cleanup.sock");
        let listener = PairListener::bind(&ep).unwrap();
        let path = listener.path().to_path_buf();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
