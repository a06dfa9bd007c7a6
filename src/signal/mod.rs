//! Signal handling and run cancellation (SIGINT/SIGTERM)
//!
//! On the first SIGINT or SIGTERM the run is cancelled:
//! 1. Running containers are terminated by their runners
//! 2. Pending entries are recorded as cancelled without side effects
//! 3. Publishes that have not started are skipped
//! 4. The run report is still written and the process exits with code 80
//!
//! A second signal requests immediate exit.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Exit code for cancelled runs
pub const EXIT_CODE_CANCELLED: i32 = 80;

/// Shared cancellation state
#[derive(Debug, Default)]
pub struct SignalState {
    cancel_requested: AtomicBool,
    immediate_exit: AtomicBool,
    signal_count: AtomicU8,
    /// Names of containers currently running
    running: Mutex<Vec<String>>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a delivered signal and decide what to do with it
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        match count {
            0 => {
                self.cancel_requested.store(true, Ordering::SeqCst);
                SignalAction::InitiateCancellation
            }
            1 => {
                self.immediate_exit.store(true, Ordering::SeqCst);
                SignalAction::ImmediateExit
            }
            _ => SignalAction::Ignore,
        }
    }

    /// Programmatic cancellation, equivalent to a first signal
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn register_container(&self, name: String) {
        if let Ok(mut running) = self.running.lock() {
            running.push(name);
        }
    }

    pub fn unregister_container(&self, name: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.retain(|n| n != name);
        }
    }

    pub fn running_containers(&self) -> Vec<String> {
        self.running.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    InitiateCancellation,
    ImmediateExit,
    Ignore,
}

/// Installs the process signal handler over a [`SignalState`]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn with_state(state: Arc<SignalState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Coordinator sharing this handler's state
    pub fn coordinator(&self) -> CancellationCoordinator {
        CancellationCoordinator::new(self.state())
    }

    /// Install handlers for SIGINT and SIGTERM. Call once at startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::InitiateCancellation => {
                warn!("received interrupt, cancelling run");
            }
            SignalAction::ImmediateExit => {
                warn!("received second interrupt, exiting immediately");
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            SignalAction::Ignore => {}
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle the pipeline uses to observe and request cancellation
#[derive(Debug, Clone, Default)]
pub struct CancellationCoordinator {
    state: Arc<SignalState>,
}

impl CancellationCoordinator {
    pub fn new(state: Arc<SignalState>) -> Self {
        Self { state }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancel_requested()
    }

    pub fn cancel(&self) {
        self.state.request_cancel();
    }

    pub fn register_container(&self, name: &str) {
        self.state.register_container(name.to_string());
    }

    pub fn unregister_container(&self, name: &str) {
        self.state.unregister_container(name);
    }

    /// Containers that were running when this was called
    pub fn running_containers(&self) -> Vec<String> {
        self.state.running_containers()
    }
}
