//! Per-connection echo handler.
//!
//! Each accepted connection is owned by exactly one handler thread. The
//! handler reads up to `buffer_size` bytes at a time and writes the same
//! bytes back until the peer disconnects, the idle timeout elapses, or a
//! socket error occurs. Nothing escapes the handler: every ending is
//! reported as a [`CloseReason`].

use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Settings shared by every handler spawned from one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSettings {
    /// Maximum time a read may wait for data before the connection is closed.
    pub idle_timeout: Duration,
    /// Maximum bytes read per call.
    pub buffer_size: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            buffer_size: 1024,
        }
    }
}

/// Result of a single read step.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Peer closed its side (zero-length read).
    Disconnected,
    /// No data arrived within the idle timeout.
    TimedOut,
    /// Bytes to echo.
    DataReceived(Bytes),
    /// Any other socket failure.
    Errored(io::Error),
}

/// Why a handler stopped serving its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Disconnected,
    TimedOut,
    Errored(io::ErrorKind),
}

/// Summary of a finished connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub peer: SocketAddr,
    pub reason: CloseReason,
    /// Number of reads echoed back.
    pub messages: usize,
    /// Total bytes echoed back.
    pub bytes: usize,
}

/// Read once from `stream` into `buf` and classify the result.
///
/// `Interrupted` reads are retried. A read timeout surfaces as `WouldBlock`
/// on Unix and `TimedOut` on Windows; both map to [`ReadOutcome::TimedOut`].
pub fn read_step<R: Read>(stream: &mut R, buf: &mut [u8]) -> ReadOutcome {
    loop {
        match stream.read(buf) {
            Ok(0) => return ReadOutcome::Disconnected,
            Ok(n) => return ReadOutcome::DataReceived(Bytes::copy_from_slice(&buf[..n])),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                return ReadOutcome::TimedOut
            }
            Err(e) => return ReadOutcome::Errored(e),
        }
    }
}

/// Run the echo loop on an already configured stream.
///
/// Returns the close reason together with the number of echoed messages and
/// bytes.
pub fn echo_loop<S: Read + Write>(
    stream: &mut S,
    peer: SocketAddr,
    buffer_size: usize,
) -> (CloseReason, usize, usize) {
    let mut buf = vec![0u8; buffer_size];
    let mut messages = 0;
    let mut bytes = 0;

    loop {
        match read_step(stream, &mut buf) {
            ReadOutcome::DataReceived(data) => {
                debug!(peer = %peer, bytes = data.len(), "Received");
                trace!(peer = %peer, data = %String::from_utf8_lossy(&data), "Payload");

                if let Err(e) = stream.write_all(&data).and_then(|_| stream.flush()) {
                    warn!(peer = %peer, error = %e, "Echo write failed");
                    return (CloseReason::Errored(e.kind()), messages, bytes);
                }

                messages += 1;
                bytes += data.len();
                debug!(peer = %peer, bytes = data.len(), "Echoed");
            }
            ReadOutcome::Disconnected => {
                debug!(peer = %peer, "Client disconnected");
                return (CloseReason::Disconnected, messages, bytes);
            }
            ReadOutcome::TimedOut => {
                info!(peer = %peer, "Client sent no data within the idle timeout");
                return (CloseReason::TimedOut, messages, bytes);
            }
            ReadOutcome::Errored(e) => {
                warn!(peer = %peer, error = %e, "Read failed");
                return (CloseReason::Errored(e.kind()), messages, bytes);
            }
        }
    }
}

/// Handle a single client connection until it disconnects, idles out, or
/// fails. The stream is closed when this returns.
pub fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: &HandlerSettings,
) -> Session {
    let (reason, messages, bytes) = match stream.set_read_timeout(Some(settings.idle_timeout)) {
        Ok(()) => echo_loop(&mut stream, peer, settings.buffer_size),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to set read timeout");
            (CloseReason::Errored(e.kind()), 0, 0)
        }
    };

    drop(stream);
    info!(peer = %peer, reason = ?reason, messages, bytes, "Connection closed");

    Session {
        peer,
        reason,
        messages,
        bytes,
    }
}
