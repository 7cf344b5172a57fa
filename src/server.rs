//! TCP listener for the echo service.
//!
//! The listener is an explicit value with a three step lifecycle:
//! [`Listener::open`] binds the socket, [`Listener::serve`] accepts
//! connections until shutdown is requested, and [`Listener::close`] releases
//! the socket and waits for in-flight handlers to finish on their own.
//!
//! Every accepted connection is moved into its own OS thread running
//! [`handle_connection`], so a slow client never blocks the next accept.

use crate::config::{ConfigError, ServerConfig};
use crate::connection::{handle_connection, HandlerSettings, Session};
use crate::shutdown::ShutdownHandle;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

const EVENT_CAPACITY: usize = 64;

/// Listener errors. All of them are fatal to the server process.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("Event loop error: {0}")]
    Poll(io::Error),
}

/// An open listening socket plus the handlers it has spawned.
pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    shutdown: ShutdownHandle,
    settings: HandlerSettings,
    handlers: Slab<JoinHandle<Session>>,
}

impl Listener {
    /// Bind the address described by `config`.
    pub fn open(config: &ServerConfig) -> Result<Self, ServerError> {
        let addr = config.bind_addr()?;
        Self::bind(addr, config.backlog, config.handler_settings())
    }

    /// Bind `addr` and listen with the given backlog. No retry on failure.
    pub fn bind(
        addr: SocketAddr,
        backlog: i32,
        settings: HandlerSettings,
    ) -> Result<Self, ServerError> {
        let socket = create_listener(addr, backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(
                &mut SourceFd(&socket.as_raw_fd()),
                LISTENER_TOKEN,
                Interest::READABLE,
            )
            .map_err(ServerError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Poll)?;

        info!(
            addr = %local_addr,
            backlog,
            idle_timeout_ms = settings.idle_timeout.as_millis() as u64,
            buffer_size = settings.buffer_size,
            "Server listening"
        );

        Ok(Listener {
            socket,
            local_addr,
            poll,
            shutdown: ShutdownHandle::new(Arc::new(waker)),
            settings,
            handlers: Slab::new(),
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops [`Listener::serve`] from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is requested.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        loop {
            if self.shutdown.is_requested() {
                info!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }

            debug!("Waiting for connections");
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Poll(e));
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    token => warn!(?token, "Unexpected event"),
                }
            }

            self.reap_finished();
        }
    }

    /// Close the listening socket, then wait for in-flight handlers.
    ///
    /// Handlers are not cancelled; each ends on disconnect, error, or its
    /// idle timeout.
    pub fn close(self) {
        let Listener {
            socket,
            local_addr,
            poll,
            handlers,
            ..
        } = self;

        if let Err(e) = poll
            .registry()
            .deregister(&mut SourceFd(&socket.as_raw_fd()))
        {
            debug!(error = %e, "Failed to deregister listener");
        }
        drop(socket);
        info!(addr = %local_addr, in_flight = handlers.len(), "Listener closed");

        for (conn_id, handle) in handlers {
            join_handler(conn_id, handle);
        }
        info!("Server stopped");
    }

    fn accept_connections(&mut self) {
        loop {
            match self.socket.accept() {
                Ok((stream, peer)) => {
                    // Accepted sockets may inherit O_NONBLOCK from the listener.
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!(peer = %peer, error = %e, "Failed to configure connection");
                        continue;
                    }

                    let entry = self.handlers.vacant_entry();
                    let conn_id = entry.key();
                    let settings = self.settings;

                    let spawned = thread::Builder::new()
                        .name(format!("conn-{conn_id}"))
                        .spawn(move || handle_connection(stream, peer, &settings));

                    match spawned {
                        Ok(handle) => {
                            entry.insert(handle);
                            info!(conn_id, peer = %peer, "Client connected");
                        }
                        Err(e) => {
                            error!(peer = %peer, error = %e, "Failed to spawn handler");
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_per_connection_error(e.kind()) => {
                    debug!(error = %e, "Pending connection failed before accept");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn reap_finished(&mut self) {
        let finished: Vec<usize> = self
            .handlers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(conn_id, _)| conn_id)
            .collect();

        for conn_id in finished {
            let handle = self.handlers.remove(conn_id);
            join_handler(conn_id, handle);
        }
    }
}

/// Accept failures that only concern one queued connection. Anything else
/// (descriptor or memory exhaustion) ends the current drain.
fn is_per_connection_error(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

fn join_handler(conn_id: usize, handle: JoinHandle<Session>) {
    match handle.join() {
        Ok(session) => debug!(
            conn_id,
            peer = %session.peer,
            reason = ?session.reason,
            messages = session.messages,
            bytes = session.bytes,
            "Handler finished"
        ),
        Err(_) => error!(conn_id, "Handler panicked"),
    }
}

/// Create a non-blocking IPv4/IPv6 listening socket with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::send_message;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn settings(idle_timeout: Duration) -> HandlerSettings {
        HandlerSettings {
            idle_timeout,
            buffer_size: 1024,
        }
    }

    fn start(settings: HandlerSettings) -> (SocketAddr, ShutdownHandle, JoinHandle<Listener>) {
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 5, settings).unwrap();
        let addr = listener.local_addr();
        let shutdown = listener.shutdown_handle();

        let join = thread::spawn(move || {
            listener.serve().unwrap();
            listener
        });

        (addr, shutdown, join)
    }

    fn stop(shutdown: ShutdownHandle, join: JoinHandle<Listener>) {
        shutdown.trigger().unwrap();
        join.join().unwrap().close();
    }

    #[test]
    fn test_hello_round_trip() {
        let (addr, shutdown, join) = start(settings(Duration::from_secs(5)));

        let reply = send_message(addr, b"Hello, Server!", 1024).unwrap();
        assert_eq!(&reply[..], b"Hello, Server!");

        stop(shutdown, join);
    }

    #[test]
    fn test_binary_payload_unchanged() {
        let (addr, shutdown, join) = start(settings(Duration::from_secs(5)));

        let payload = b"\n\t\r\x00\xff\x80binary";
        let reply = send_message(addr, payload, 1024).unwrap();
        assert_eq!(&reply[..], payload);

        stop(shutdown, join);
    }

    #[test]
    fn test_empty_message_returns_empty_reply() {
        let (addr, shutdown, join) = start(settings(Duration::from_millis(200)));

        // Nothing is sent, so the server idles out and closes the connection.
        let reply = send_message(addr, b"", 1024).unwrap();
        assert!(reply.is_empty());

        stop(shutdown, join);
    }

    #[test]
    fn test_concurrent_clients_no_cross_talk() {
        let (addr, shutdown, join) = start(settings(Duration::from_secs(5)));

        let clients: Vec<_> = (1..=3)
            .map(|i| {
                thread::spawn(move || {
                    let message = format!("Client {i}");
                    let reply = send_message(addr, message.as_bytes(), 1024).unwrap();
                    (message, reply)
                })
            })
            .collect();

        for client in clients {
            let (message, reply) = client.join().unwrap();
            assert_eq!(&reply[..], message.as_bytes());
        }

        stop(shutdown, join);
    }

    #[test]
    fn test_server_echoes_repeatedly_on_one_connection() {
        let (addr, shutdown, join) = start(settings(Duration::from_secs(5)));

        let mut stream = TcpStream::connect(addr).unwrap();
        let mut buf = [0u8; 64];
        for message in [&b"first"[..], b"second", b"third"] {
            stream.write_all(message).unwrap();
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], message);
        }
        drop(stream);

        stop(shutdown, join);
    }

    #[test]
    fn test_idle_connection_does_not_block_others() {
        let idle_timeout = Duration::from_millis(500);
        let (addr, shutdown, join) = start(settings(idle_timeout));

        let mut idle = TcpStream::connect(addr).unwrap();
        let started = Instant::now();

        let reply = send_message(addr, b"still served", 1024).unwrap();
        assert_eq!(&reply[..], b"still served");

        // The silent connection is closed by the server after the timeout.
        let mut buf = [0u8; 16];
        assert_eq!(idle.read(&mut buf).unwrap(), 0);
        assert!(started.elapsed() >= idle_timeout / 2);

        // And the server keeps accepting afterwards.
        let reply = send_message(addr, b"after timeout", 1024).unwrap();
        assert_eq!(&reply[..], b"after timeout");

        stop(shutdown, join);
    }

    #[test]
    fn test_bind_conflict_fails_fast() {
        let first = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            5,
            HandlerSettings::default(),
        )
        .unwrap();

        let result = Listener::bind(first.local_addr(), 5, HandlerSettings::default());
        match result {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, first.local_addr()),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("second bind unexpectedly succeeded"),
        }

        first.close();
    }

    #[test]
    fn test_shutdown_stops_accepting() {
        let (addr, shutdown, join) = start(settings(Duration::from_secs(5)));

        shutdown.trigger().unwrap();
        let listener = join.join().unwrap();
        listener.close();

        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_close_waits_for_in_flight_handlers() {
        let idle_timeout = Duration::from_millis(300);
        let (addr, shutdown, join) = start(settings(idle_timeout));

        let started = Instant::now();
        let mut idle = TcpStream::connect(addr).unwrap();
        // Make sure the idle connection has been accepted before shutdown.
        let reply = send_message(addr, b"sync", 1024).unwrap();
        assert_eq!(&reply[..], b"sync");

        shutdown.trigger().unwrap();
        join.join().unwrap().close();

        // close() returned only after the idle handler timed out on its own.
        assert!(started.elapsed() >= idle_timeout / 2);

        // The handler has already closed its side; no further wait is needed.
        idle.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(idle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_reset_peer_does_not_affect_listener() {
        let (addr, shutdown, join) = start(settings(Duration::from_secs(5)));

        let mut aborted = TcpStream::connect(addr).unwrap();
        aborted.write_all(b"x").unwrap();
        // Linger of zero turns close into a reset.
        socket2::SockRef::from(&aborted)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(aborted);

        let reply = send_message(addr, b"still alive", 1024).unwrap();
        assert_eq!(&reply[..], b"still alive");

        stop(shutdown, join);
    }

    #[test]
    fn test_accept_error_classification() {
        assert!(is_per_connection_error(io::ErrorKind::ConnectionAborted));
        assert!(is_per_connection_error(io::ErrorKind::ConnectionReset));
        assert!(!is_per_connection_error(io::ErrorKind::OutOfMemory));
        assert!(!is_per_connection_error(io::ErrorKind::Other));
    }
}
