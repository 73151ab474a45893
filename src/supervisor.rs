//! Cooperative shutdown glue
//!
//! Every protocol loop polls a [`RunFlag`] at the head of each iteration
//! and exits cleanly once it flips. The flag is flipped by OS signals,
//! by the subscriber's stall timer, or programmatically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

/// Cloneable cancellation token shared by loops, workers, and handlers
#[derive(Clone, Debug)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    /// New flag in the running state
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// True until [`stop`](Self::stop) is called
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Request cooperative shutdown; idempotent
    pub fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Flip `flag` on SIGINT/SIGTERM/SIGHUP.
///
/// Installing twice in one process fails inside `ctrlc`; callers
/// install once and share the flag.
pub fn on_termination(flag: &RunFlag) -> Result<(), ctrlc::Error> {
    let flag = flag.clone();
    ctrlc::set_handler(move || {
        info!("termination signal, shutting down");
        flag.stop();
    })
}

/// Seconds since the Unix epoch; the stall timer's clock
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flag_flips_once() {
        let flag = RunFlag::new();
        assert!(flag.is_running());
        let shared = flag.clone();
        shared.stop();
        assert!(!flag.is_running());
        shared.stop();
        assert!(!flag.is_running());
    }

    #[test]
    fn test_epoch_secs_is_sane() {
        // after 2020-01-01, before the sequence space runs out
        assert!(epoch_secs() > 1_577_836_800);
    }
}
