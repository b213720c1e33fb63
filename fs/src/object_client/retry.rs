//! Retry classifier.
//!
//! Grounded on `internal/storage/storageutil/custom_retry.go`: the
//! first `503` a process observes is reported without retry so a
//! failure in the write path surfaces quickly; every other retryable
//! error (including all subsequent `503`s, and `401`/`UNAUTHENTICATED`,
//! which also forces a token refresh upstream) is retried.

use std::sync::atomic::{AtomicBool, Ordering};

use super::ObjectError;

/// Process-wide (really: per-mount, since one `ObjectClientFacade` is
/// constructed per mount) counter modelling the quirky first-503 rule.
/// A single atomic flag is enough: we only care whether *a* 503 has
/// been seen yet, not how many.
#[derive(Debug, Default)]
pub struct RetryClassifier {
    first_503_seen: AtomicBool,
}

impl RetryClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `err` should be retried. Mutates the
    /// first-503 flag as a side effect, exactly once per process
    /// lifetime (cleared only by constructing a new facade, i.e. at
    /// unmount/remount).
    pub fn should_retry(&self, err: &ObjectError) -> bool {
        match err {
            ObjectError::Transient { status } => {
                if *status == 503 {
                    // SeqCst compare-exchange so concurrent writers
                    // agree on exactly one "first" 503.
                    let was_first = self
                        .first_503_seen
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                    if was_first {
                        tracing::info!(status = 503, "not retrying first 503 observed this mount");
                        return false;
                    }
                }
                tracing::info!(?err, "retrying");
                true
            }
            ObjectError::Unauthenticated => {
                tracing::info!("retrying after UNAUTHENTICATED (token refresh)");
                true
            }
            ObjectError::PreconditionFailed => false,
            ObjectError::NotFound => false,
            ObjectError::Other(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_503_is_not_retried_but_later_ones_are() {
        let classifier = RetryClassifier::new();
        let err = ObjectError::Transient { status: 503 };
        assert!(!classifier.should_retry(&err));
        assert!(classifier.should_retry(&err));
        assert!(classifier.should_retry(&err));
    }

    #[test]
    fn non_503_transient_status_always_retries() {
        let classifier = RetryClassifier::new();
        let err = ObjectError::Transient { status: 500 };
        assert!(classifier.should_retry(&err));
        assert!(classifier.should_retry(&err));
    }

    #[test]
    fn unauthenticated_always_retries() {
        let classifier = RetryClassifier::new();
        assert!(classifier.should_retry(&ObjectError::Unauthenticated));
        assert!(classifier.should_retry(&ObjectError::Unauthenticated));
    }

    #[test]
    fn precondition_and_not_found_never_retry() {
        let classifier = RetryClassifier::new();
        assert!(!classifier.should_retry(&ObjectError::PreconditionFailed));
        assert!(!classifier.should_retry(&ObjectError::NotFound));
    }
}
