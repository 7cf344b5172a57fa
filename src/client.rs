//! One-shot echo client.
//!
//! Connects, sends a single message, performs a single read of the reply and
//! closes the connection on every path.

use crate::config::{ClientConfig, ConfigError};
use bytes::Bytes;
use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use tracing::{debug, error, info};

/// Client errors
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("Failed to send message: {0}")]
    Send(io::Error),

    #[error("Failed to receive reply: {0}")]
    Receive(io::Error),

    #[error("Failed to read message from stdin: {0}")]
    Input(io::Error),
}

/// Send `message` to `addr` and return the bytes of a single read.
///
/// An empty result means the server closed the connection without replying.
pub fn send_message(
    addr: SocketAddr,
    message: &[u8],
    buffer_size: usize,
) -> Result<Bytes, ClientError> {
    let mut stream =
        TcpStream::connect(addr).map_err(|source| ClientError::Connect { addr, source })?;
    info!(addr = %addr, "Connected to server");

    let result = exchange(&mut stream, message, buffer_size);

    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!(error = %e, "Shutdown after exchange failed");
    }
    drop(stream);
    info!(addr = %addr, "Connection to server closed");

    result
}

fn exchange(
    stream: &mut TcpStream,
    message: &[u8],
    buffer_size: usize,
) -> Result<Bytes, ClientError> {
    debug!(bytes = message.len(), "Sending message");
    stream.write_all(message).map_err(ClientError::Send)?;
    stream.flush().map_err(ClientError::Send)?;

    let mut buf = vec![0u8; buffer_size];
    let n = loop {
        match stream.read(&mut buf) {
            Ok(n) => break n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ClientError::Receive(e)),
        }
    };
    debug!(bytes = n, "Received reply");

    buf.truncate(n);
    Ok(Bytes::from(buf))
}

/// Read one line from `input`, without its line terminator.
fn read_message<R: BufRead>(mut input: R) -> io::Result<String> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Run the client: obtain the message, exchange it, print the reply.
pub fn run(config: &ClientConfig, message: Option<String>) -> Result<(), ClientError> {
    let addr = config.target_addr()?;

    let message = match message {
        Some(message) => message,
        None => {
            print!("Enter a message to send to the server: ");
            io::stdout().flush().map_err(ClientError::Input)?;
            read_message(io::stdin().lock()).map_err(ClientError::Input)?
        }
    };

    match send_message(addr, message.as_bytes(), config.buffer_size) {
        Ok(reply) => {
            println!("{}", String::from_utf8_lossy(&reply));
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Echo exchange failed");
            Err(e)
        }
    }
}
