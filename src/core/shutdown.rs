//! Process shutdown flag and event-loop wakeups
//!
//! SIGINT/SIGTERM and the control surface both end up here. The protocol
//! thread sleeps in `poll`, so every request to it is paired with a byte
//! written to a socket pair whose read end it polls alongside the display fd.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

/// Global flag for graceful shutdown on SIGINT/SIGTERM
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Write end the signal handler pokes; -1 until handlers are installed
static SIGNAL_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Keeps the write end behind `SIGNAL_WAKE_FD` open for the process lifetime
static SIGNAL_WAKER: OnceLock<Waker> = OnceLock::new();

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Ask the protocol thread to shut down; later calls are no-ops
pub fn request_shutdown(waker: &Waker) {
    if !SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
        log::info!("Shutdown requested");
    }
    waker.wake();
}

/// Route SIGINT and SIGTERM to the shutdown flag
pub fn install_signal_handlers(waker: &Waker) {
    if SIGNAL_WAKER.set(waker.clone()).is_err() {
        return;
    }
    if let Some(installed) = SIGNAL_WAKER.get() {
        SIGNAL_WAKE_FD.store(installed.inner.as_raw_fd(), Ordering::SeqCst);
    }

    unsafe {
        let handler = signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
}

extern "C" fn signal_handler(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    let fd = SIGNAL_WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // Only async-signal-safe calls here.
        unsafe {
            libc::write(fd, [1u8].as_ptr().cast(), 1);
        }
    }
}

/// Write end of the wakeup socket pair
#[derive(Clone)]
pub struct Waker {
    inner: Arc<UnixStream>,
}

impl Waker {
    pub fn wake(&self) {
        // A full socket buffer already guarantees a pending wakeup.
        if let Err(e) = (&*self.inner).write(&[1]) {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::warn!("Failed to wake event loop: {}", e);
            }
        }
    }
}

/// Read end, polled by the protocol thread
pub struct WakeReceiver {
    inner: UnixStream,
}

impl WakeReceiver {
    /// Consume pending wakeups; returns whether there were any
    pub fn drain(&self) -> bool {
        let mut woken = false;
        let mut scratch = [0u8; 64];
        loop {
            match (&self.inner).read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => woken = true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        woken
    }
}

impl AsFd for WakeReceiver {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

pub fn wake_pair() -> io::Result<(Waker, WakeReceiver)> {
    let (tx, rx) = UnixStream::pair()?;
    tx.set_nonblocking(true)?;
    rx.set_nonblocking(true)?;
    Ok((Waker { inner: Arc::new(tx) }, WakeReceiver { inner: rx }))
}
