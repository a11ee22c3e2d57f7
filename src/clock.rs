//! Time source shared by rules and storage backends.
//!
//! Production code uses the system clock; tests pin a fixed clock and
//! advance it manually, which keeps rate-limit assertions deterministic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Milliseconds since the Unix epoch from the system clock.
pub fn system_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

#[derive(Debug)]
enum ClockKind {
    System,
    Fixed(AtomicU64),
}

/// A cloneable time source.
///
/// Clones of a fixed clock share the same underlying instant, so
/// advancing one advances all of them.
#[derive(Debug, Clone)]
pub struct Clock {
    kind: Arc<ClockKind>,
}

impl Clock {
    /// The real system clock.
    pub fn system() -> Self {
        Self {
            kind: Arc::new(ClockKind::System),
        }
    }

    /// A fixed clock pinned at `now_ms`, advanced manually.
    pub fn fixed(now_ms: u64) -> Self {
        Self {
            kind: Arc::new(ClockKind::Fixed(AtomicU64::new(now_ms))),
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        match &*self.kind {
            ClockKind::System => system_now_ms(),
            ClockKind::Fixed(ms) => ms.load(Ordering::Acquire),
        }
    }

    /// Advance a fixed clock. No-op on the system clock.
    pub fn advance_ms(&self, delta: u64) {
        if let ClockKind::Fixed(ms) = &*self.kind {
            ms.fetch_add(delta, Ordering::AcqRel);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_advances() {
        let clock = Clock::fixed(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
    }

    #[test]
    fn test_fixed_clock_clones_share_state() {
        let clock = Clock::fixed(0);
        let other = clock.clone();
        clock.advance_ms(42);
        assert_eq!(other.now_ms(), 42);
    }

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = Clock::system();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
