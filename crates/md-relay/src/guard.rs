use crate::Result;
use std::sync::Mutex;
use tracing::error;

/// Runs actions one at a time. A failing action is logged and reported as
/// `None`; it never reaches the caller as an error.
#[derive(Default)]
pub struct ExclusiveGuard {
    lock: Mutex<()>,
}

impl ExclusiveGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run<T>(&self, label: &str, action: impl FnOnce() -> Result<T>) -> Option<T> {
        let _held = self.lock.lock().unwrap();
        match action() {
            Ok(value) => Some(value),
            Err(e) => {
                error!(action = label, error = %e, "guarded action failed");
                None
            }
        }
    }
}
