//! Cooperative cancellation.
//!
//! The signal handler never touches child processes itself. It only flips
//! a [`CancelToken`]; the supervisor loop polling the token does the
//! killing and cleanup.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CancelError {
    #[error("Failed to install the signal handler: {0}")]
    Install(#[from] ctrlc::Error),
}

/// Shared flag requesting that a run stops. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::SeqCst))
    }

    /// A token that is cancelled together with `self` but can also be
    /// cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: Some(self.cancelled.clone()),
        }
    }
}

static SIGNAL_TOKEN: Mutex<Option<CancelToken>> = Mutex::new(None);

/// Installs the process-wide SIGINT/SIGTERM/SIGHUP handler on first use
/// and returns the token it cancels. Later calls return the same token.
pub fn install_signal_handler() -> Result<CancelToken, CancelError> {
    let mut installed = SIGNAL_TOKEN.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(token) = installed.as_ref() {
        return Ok(token.clone());
    }
    let token = CancelToken::new();
    let flag = token.clone();
    ctrlc::set_handler(move || {
        info!("Received termination signal, stopping");
        flag.cancel();
    })?;
    *installed = Some(token.clone());
    Ok(token)
}
