use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag for cooperative task termination.
///
/// Cloning yields a handle to the same flag. The transition is monotonic:
/// once set, a token never resets. Workers observe the token between
/// suspension points (before starting, and between poll sleeps); in-flight
/// HTTP calls are bounded by their own timeouts instead.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_shared_and_monotonic() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_set());

        token.set();
        assert!(other.is_set());

        // Setting again is a no-op.
        other.set();
        assert!(token.is_set());
    }
}
