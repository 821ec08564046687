//! Abort signaling (§4.L): a single-shot flag polled at every suspension
//! point in the evaluation loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sa_domain::error::{Error, Result};

/// A cooperative, single-shot abort signal shared across every task spawned
/// for one evaluation (SSE reader, tool futures, guardrail future).
///
/// Once set, it stays set — an evaluation is aborted at most once, and a
/// fresh `AbortFlag` must be created for the next `evaluate()` call.
#[derive(Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise [`Error::AbortEvaluation`] if the flag is set. Called at every
    /// documented suspension point (§5): SSE reads, tool-future waits,
    /// guardrail waits, queue/steer takes.
    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(Error::AbortEvaluation)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_flag_checks_clean() {
        let flag = AbortFlag::new();
        assert!(flag.check().is_ok());
    }

    #[test]
    fn set_flag_raises_abort_evaluation() {
        let flag = AbortFlag::new();
        flag.set();
        let err = flag.check().unwrap_err();
        assert!(err.is_abort());
    }

    #[test]
    fn clone_shares_the_same_signal() {
        let flag = AbortFlag::new();
        let clone = flag.clone();
        clone.set();
        assert!(flag.is_set());
    }
}
