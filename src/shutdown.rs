//! Operator-initiated shutdown.
//!
//! The accept loop blocks in `mio::Poll::poll`. A [`ShutdownHandle`] sets a
//! flag and wakes that poll through a `mio::Waker`, so the listener notices
//! the request without a timeout-driven busy loop.

use mio::Waker;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Cloneable handle used to ask a listener to stop accepting.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    /// Request shutdown and wake the accept loop.
    pub fn trigger(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::SeqCst);
        self.waker.wake()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Exit status used when a second interrupt cuts the graceful shutdown short.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Trigger `handle` on the first interrupt; resolve on the second.
///
/// `interrupt` yields one future per expected signal.
async fn await_interrupts<F, Fut>(mut interrupt: F, handle: &ShutdownHandle) -> io::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    interrupt().await?;
    info!("Interrupt received, shutting down");
    if let Err(e) = handle.trigger() {
        error!(error = %e, "Failed to wake listener");
    }

    interrupt().await?;
    warn!("Second interrupt received, exiting without waiting for connections");
    Ok(())
}

/// Trigger `handle` when the process receives Ctrl-C.
///
/// The signal is awaited on a dedicated thread driving a current-thread
/// tokio runtime; the server itself stays on plain OS threads. A second
/// Ctrl-C exits the process with [`FORCED_EXIT_CODE`].
pub fn watch_interrupt(handle: ShutdownHandle) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            match runtime.block_on(await_interrupts(tokio::signal::ctrl_c, &handle)) {
                Ok(()) => std::process::exit(FORCED_EXIT_CODE),
                Err(e) => error!(error = %e, "Failed to listen for interrupt"),
            }
        })?;

    Ok(())
}
