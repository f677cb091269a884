//! Connection-tracking wrapper over an inherited TCP listener.
//!
//! The master owns the real sockets for its whole lifetime; each slave
//! generation only borrows duplicates. [`DrainableListener`] tracks the
//! connections a slave has accepted so that, during a handoff, the
//! outgoing generation can stop accepting immediately and close its
//! borrowed descriptor once the last connection drains (or a deadline
//! expires), while the incoming generation accepts on the same port.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::debug;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Cloneable handle to a drainable listening socket.
///
/// Clones share one underlying socket and one connection count; the
/// first element of `State::listeners` is republished as
/// `State::listener` for convenience.
#[derive(Clone)]
pub struct DrainableListener {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    released: AtomicBool,
    conns: Mutex<usize>,
    drained: Condvar,
}

impl DrainableListener {
    pub(crate) fn new(listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            shared: Arc::new(Shared {
                listener: Mutex::new(Some(listener)),
                local_addr,
                released: AtomicBool::new(false),
                conns: Mutex::new(0),
                drained: Condvar::new(),
            }),
        })
    }

    /// Address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Number of accepted connections still open.
    pub fn open_connections(&self) -> usize {
        *self.shared.conns.lock().expect("connection count poisoned")
    }

    /// Whether [`release`](Self::release) has been invoked.
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Accepts the next connection.
    ///
    /// Returns `ErrorKind::ConnectionAborted` once the listener has been
    /// released; the program body should treat that as "stop serving".
    pub fn accept(&self) -> io::Result<(TrackedStream, SocketAddr)> {
        loop {
            if self.shared.released.load(Ordering::SeqCst) {
                return Err(released_error());
            }
            {
                let guard = self.shared.listener.lock().expect("listener poisoned");
                let Some(listener) = guard.as_ref() else {
                    return Err(released_error());
                };
                match listener.accept() {
                    Ok((stream, peer)) => {
                        stream.set_nonblocking(false)?;
                        let mut conns =
                            self.shared.conns.lock().expect("connection count poisoned");
                        *conns += 1;
                        return Ok((
                            TrackedStream {
                                stream,
                                shared: Arc::clone(&self.shared),
                            },
                            peer,
                        ));
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(err),
                }
            }
            thread::sleep(ACCEPT_POLL);
        }
    }

    /// Stops accepting immediately; closes the socket once every open
    /// connection has drained or `timeout` has elapsed, whichever comes
    /// first. The drain-and-close wait runs on a background thread so
    /// the caller can report the release to the master without waiting
    /// out the drain.
    pub fn release(&self, timeout: Duration) {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("releasing listener on {}", self.shared.local_addr);
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || shared.drain_and_close(timeout));
    }
}

impl Shared {
    fn drain_and_close(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut conns = self.conns.lock().expect("connection count poisoned");
        while *conns > 0 {
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "drain deadline reached with {} connection(s) open on {}",
                    *conns, self.local_addr
                );
                break;
            }
            let (guard, _result) = self
                .drained
                .wait_timeout(conns, deadline - now)
                .expect("connection count poisoned");
            conns = guard;
        }
        drop(conns);
        // Closes this process's borrowed descriptor only; the master's
        // original keeps the port bound.
        self.listener.lock().expect("listener poisoned").take();
        debug!("listener on {} closed", self.local_addr);
    }
}

fn released_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "listener released")
}

/// An accepted connection whose lifetime counts toward the drain.
///
/// Dropping the stream is what marks the connection closed.
#[derive(Debug)]
pub struct TrackedStream {
    stream: TcpStream,
    shared: Arc<Shared>,
}

impl TrackedStream {
    /// Peer address of the connection.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Shuts down the underlying stream without dropping it.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    /// Access to the raw stream for timeouts and socket options.
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

impl Read for TrackedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TrackedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        let mut conns = self.shared.conns.lock().expect("connection count poisoned");
        *conns = conns.saturating_sub(1);
        if *conns == 0 {
            self.shared.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    fn bound() -> DrainableListener {
        let raw = TcpListener::bind("127.0.0.1:0").expect("bind");
        DrainableListener::new(raw).expect("wrap")
    }

    #[test]
    fn accept_tracks_open_connections() {
        let listener = bound();
        let addr = listener.local_addr();

        let client = TcpStream::connect(addr).expect("connect");
        let (conn, _peer) = listener.accept().expect("accept");
        assert_eq!(listener.open_connections(), 1);

        drop(conn);
        drop(client);
        assert_eq!(listener.open_connections(), 0);
    }

    #[test]
    fn release_stops_accepting_immediately() {
        let listener = bound();
        listener.release(Duration::from_millis(50));

        let err = listener.accept().expect_err("accept after release");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(listener.is_released());
    }

    #[test]
    fn release_returns_before_drain_completes() {
        let listener = bound();
        let addr = listener.local_addr();

        let client = TcpStream::connect(addr).expect("connect");
        let (conn, _peer) = listener.accept().expect("accept");

        let begun = Instant::now();
        listener.release(Duration::from_secs(5));
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(listener.open_connections(), 1);

        drop(conn);
        drop(client);

        // The background waiter closes the socket once drained.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if listener.shared.listener.lock().expect("listener poisoned").is_none() {
                break;
            }
            if Instant::now() >= deadline {
                panic!("listener was not closed after drain");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn drain_deadline_closes_with_connections_open() {
        let listener = bound();
        let addr = listener.local_addr();

        let _client = TcpStream::connect(addr).expect("connect");
        let (_conn, _peer) = listener.accept().expect("accept");

        listener.release(Duration::from_millis(100));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if listener.shared.listener.lock().expect("listener poisoned").is_none() {
                break;
            }
            if Instant::now() >= deadline {
                panic!("listener was not closed after the drain deadline");
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(listener.open_connections(), 1);
    }
}
