use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;

/// POSIX signals the lifecycle manager can install handlers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Hangup,
    Interrupt,
    Quit,
    Abort,
    User1,
    User2,
    Alarm,
    Terminate,
    Child,
}

impl Signal {
    pub fn raw(self) -> i32 {
        match self {
            Signal::Hangup => 1,
            Signal::Interrupt => 2,
            Signal::Quit => 3,
            Signal::Abort => 6,
            Signal::User1 => 10,
            Signal::User2 => 12,
            Signal::Alarm => 14,
            Signal::Terminate => 15,
            Signal::Child => 17,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Signal::Hangup),
            2 => Some(Signal::Interrupt),
            3 => Some(Signal::Quit),
            6 => Some(Signal::Abort),
            10 => Some(Signal::User1),
            12 => Some(Signal::User2),
            14 => Some(Signal::Alarm),
            15 => Some(Signal::Terminate),
            17 => Some(Signal::Child),
            _ => None,
        }
    }

    fn kind(self) -> SignalKind {
        match self {
            Signal::Hangup => SignalKind::hangup(),
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Quit => SignalKind::quit(),
            Signal::User1 => SignalKind::user_defined1(),
            Signal::User2 => SignalKind::user_defined2(),
            Signal::Alarm => SignalKind::alarm(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Child => SignalKind::child(),
            Signal::Abort => SignalKind::from_raw(Signal::Abort.raw()),
        }
    }
}

pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback ledger for a server: three ordered lists fired on startup,
/// shutdown, and failure, plus the table of installed signal handlers.
///
/// Each list is append-only and fires in registration order without
/// stopping early. Signal handlers run their callback on a background
/// task per delivery; removal aborts that task.
#[derive(Default)]
pub struct LifecycleManager {
    startup: Mutex<Vec<LifecycleCallback>>,
    shutdown: Mutex<Vec<LifecycleCallback>>,
    failure: Mutex<Vec<LifecycleCallback>>,
    signals: Mutex<HashMap<Signal, JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_startup(&self, callback: LifecycleCallback) {
        self.startup.lock().push(callback);
    }

    pub fn add_shutdown(&self, callback: LifecycleCallback) {
        self.shutdown.lock().push(callback);
    }

    pub fn add_failure(&self, callback: LifecycleCallback) {
        self.failure.lock().push(callback);
    }

    pub fn fire_startup(&self) {
        Self::fire(&self.startup);
    }

    pub fn fire_shutdown(&self) {
        Self::fire(&self.shutdown);
    }

    pub fn fire_failure(&self) {
        Self::fire(&self.failure);
    }

    fn fire(list: &Mutex<Vec<LifecycleCallback>>) {
        let snapshot: Vec<LifecycleCallback> = list.lock().clone();
        for callback in snapshot {
            callback();
        }
    }

    /// Install `callback` to run on every delivery of `sig`. Installing
    /// over an existing handler replaces it. Must be called from within
    /// a tokio runtime.
    pub fn install_signal(&self, sig: Signal, callback: LifecycleCallback) -> Result<()> {
        let mut stream = signal(sig.kind())?;
        let handle = tokio::spawn(async move {
            while stream.recv().await.is_some() {
                debug!(signal = sig.raw(), "signal received");
                callback();
            }
        });
        if let Some(previous) = self.signals.lock().insert(sig, handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn remove_signal(&self, sig: Signal) {
        if let Some(handle) = self.signals.lock().remove(&sig) {
            handle.abort();
        }
    }

    pub fn installed_signals(&self) -> Vec<Signal> {
        self.signals.lock().keys().copied().collect()
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        for (_, handle) in self.signals.lock().drain() {
            handle.abort();
        }
    }
}
