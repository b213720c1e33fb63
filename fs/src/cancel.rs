//! Cancellation tokens: every dispatcher operation
//! receives one, and every suspension point (channel send/recv, remote
//! call, interruptible file I/O) checks it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{FsError, FsResult};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
}

/// A cheaply-cloneable cancellation flag, set by a kernel `Interrupt`
/// request and observed cooperatively.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Checked at every suspension point. Honours `ignore_interrupts`
    ///: when set, a cancelled token never surfaces as
    /// `EINTR` from kernel-originated interrupts — callers that need
    /// to suppress it simply skip calling `check` on that path and use
    /// `is_cancelled` for informational purposes only.
    pub fn check(&self) -> FsResult<()> {
        if self.is_cancelled() {
            Err(FsError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Wraps a `CancelToken` together with the `ignore-interrupts` mount
/// option: when `ignore_interrupts` is true, `checked` never
/// propagates cancellation that arrived through a kernel `Interrupt`.
#[derive(Debug, Clone)]
pub struct CancelPolicy {
    pub token: CancelToken,
    pub ignore_interrupts: bool,
}

impl CancelPolicy {
    pub fn check(&self) -> FsResult<()> {
        if self.ignore_interrupts {
            return Ok(());
        }
        self.token.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_token_fails_check() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(FsError::Interrupted)));
    }

    #[test]
    fn ignore_interrupts_suppresses_cancellation() {
        let policy = CancelPolicy {
            token: CancelToken::new(),
            ignore_interrupts: true,
        };
        policy.token.cancel();
        assert!(policy.check().is_ok());
    }

    #[test]
    fn clone_shares_the_same_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
