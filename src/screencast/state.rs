//! Capture session state and its publication to observers

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Lifecycle state of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    AwaitingGlobals,
    Ready,
    Recording,
    Draining,
    /// The compositor cannot record; terminal
    Failed,
    /// Shut down; terminal
    Terminated,
}

impl SessionState {
    /// Integer code exposed on the control surface
    pub fn code(self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::AwaitingGlobals => 1,
            Self::Ready => 2,
            Self::Recording => 3,
            Self::Draining => 4,
            Self::Failed => 5,
            Self::Terminated => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingGlobals => "awaiting-globals",
            Self::Ready => "ready",
            Self::Recording => "recording",
            Self::Draining => "draining",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct Inner {
    current: SessionState,
    subscribers: Vec<mpsc::UnboundedSender<SessionState>>,
}

/// Current session state plus change notification
///
/// Written by the protocol thread on every transition, read and subscribed
/// to by the control surface.
#[derive(Default)]
pub struct StatusPublisher {
    inner: Mutex<Inner>,
}

impl StatusPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> SessionState {
        self.lock().current
    }

    /// Receive every state published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    pub(crate) fn publish(&self, state: SessionState) {
        let mut inner = self.lock();
        inner.current = state;
        inner.subscribers.retain(|tx| tx.send(state).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
