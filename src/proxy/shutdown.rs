//! Interrupt tokens and the process-wide signal watcher shared by engines.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cloneable "interrupt requested" flag.
///
/// Every clone observes the same state; once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

static PROCESS_INTERRUPT: Lazy<ShutdownSignal> = Lazy::new(ShutdownSignal::new);
static RUNTIME_STATE: Lazy<Mutex<RuntimeState>> = Lazy::new(|| Mutex::new(RuntimeState::default()));
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct RuntimeState {
    refs: usize,
    watcher: Option<JoinHandle<()>>,
}

/// The token set when the process receives Ctrl-C.
pub fn process_interrupt() -> ShutdownSignal {
    PROCESS_INTERRUPT.clone()
}

/// Reference-counted handle on process-wide networking state.
///
/// The first live handle installs the Ctrl-C watcher; dropping the last one
/// removes it again. Each handle carries a unique instance id.
#[derive(Debug)]
pub struct NetworkRuntime {
    instance_id: u64,
}

impl NetworkRuntime {
    /// Must be called from within a Tokio runtime.
    pub fn acquire() -> Self {
        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let mut state = RUNTIME_STATE.lock();
        state.refs += 1;
        if state.refs == 1 {
            state.watcher = Some(spawn_interrupt_watcher());
            info!(instance = instance_id, "network runtime initialised");
        }
        debug!(instance = instance_id, refs = state.refs, "network runtime acquired");
        Self { instance_id }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Number of live handles in this process.
    pub fn live_instances() -> usize {
        RUNTIME_STATE.lock().refs
    }
}

impl Drop for NetworkRuntime {
    fn drop(&mut self) {
        let mut state = RUNTIME_STATE.lock();
        state.refs = state.refs.saturating_sub(1);
        if state.refs > 0 {
            return;
        }
        match state.watcher.take() {
            Some(watcher) => {
                watcher.abort();
                info!(instance = self.instance_id, "network runtime released");
            }
            None => warn!(
                instance = self.instance_id,
                "network runtime released without an interrupt watcher"
            ),
        }
    }
}

fn spawn_interrupt_watcher() -> JoinHandle<()> {
    tokio::spawn(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; draining");
                PROCESS_INTERRUPT.trigger();
            }
            Err(err) => warn!(error = %err, "failed to listen for Ctrl-C"),
        }
    })
}
