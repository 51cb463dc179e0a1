use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::Result;
use tracing::debug;

/// Cooperative cancellation flag carried through every blocking call.
///
/// Cloning shares the underlying flag. Blocking loops poll `is_canceled`
/// between frames; the RPC layer closes its transport when the flag trips.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

/// The process installs one Ctrl-C handler; every armed token's flag is
/// registered here and tripped by it.
static ARMED: Mutex<Vec<Weak<AtomicBool>>> = Mutex::new(Vec::new());
static HANDLER: OnceLock<()> = OnceLock::new();

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trip this token on Ctrl-C. Safe to call from several call sites in
    /// one invocation; the handler is installed once and fans out to every
    /// live armed token.
    pub fn arm_ctrlc(&self) -> Result<()> {
        ARMED
            .lock()
            .expect("cancel registry poisoned")
            .push(Arc::downgrade(&self.flag));

        if HANDLER.set(()).is_ok() {
            ctrlc::set_handler(|| {
                debug!("interrupt received, canceling");
                let mut registry = ARMED.lock().expect("cancel registry poisoned");
                registry.retain(|weak| {
                    weak.upgrade().inspect(|flag| flag.store(true, Ordering::SeqCst)).is_some()
                });
            })?;
        }
        Ok(())
    }
}
