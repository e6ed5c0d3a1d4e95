//! Session id allocation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// First id handed out.
pub const FIRST_SESSION_ID: u32 = 100_000;

/// Largest id handed out before wrapping back to [`FIRST_SESSION_ID`].
pub const MAX_SESSION_ID: u32 = u32::MAX - FIRST_SESSION_ID;

/// Monotonic session id counter.
///
/// Ids are post-incremented; the counter wraps to [`FIRST_SESSION_ID`] after
/// handing out [`MAX_SESSION_ID`].
#[derive(Debug)]
pub struct SessionIdGenerator {
    next: AtomicU32,
}

impl SessionIdGenerator {
    /// Creates a counter starting at [`FIRST_SESSION_ID`].
    pub const fn new() -> Self {
        Self::starting_at(FIRST_SESSION_ID)
    }

    /// Creates a counter starting at `first`.
    pub const fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Returns the process-wide counter.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<SessionIdGenerator>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(SessionIdGenerator::new())))
    }

    /// Allocates the next id.
    pub fn generate(&self) -> u32 {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                Some(if cur >= MAX_SESSION_ID { FIRST_SESSION_ID } else { cur + 1 })
            })
            .unwrap_or_else(|cur| cur)
    }

    /// Returns `true` if `id` lies in the range this counter hands out.
    pub fn is_valid(id: u32) -> bool {
        (FIRST_SESSION_ID..=MAX_SESSION_ID).contains(&id)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_increment() {
        let ids = SessionIdGenerator::new();
        assert_eq!(ids.generate(), FIRST_SESSION_ID);
        assert_eq!(ids.generate(), FIRST_SESSION_ID + 1);
    }

    #[test]
    fn test_wraps_after_max() {
        let ids = SessionIdGenerator::starting_at(MAX_SESSION_ID);
        assert_eq!(ids.generate(), MAX_SESSION_ID);
        assert_eq!(ids.generate(), FIRST_SESSION_ID);
    }

    #[test]
    fn test_valid_range() {
        assert!(SessionIdGenerator::is_valid(FIRST_SESSION_ID));
        assert!(!SessionIdGenerator::is_valid(42));
        assert!(!SessionIdGenerator::is_valid(u32::MAX));
    }

    #[test]
    fn test_shared_is_singleton() {
        let a = SessionIdGenerator::shared();
        let b = SessionIdGenerator::shared();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
