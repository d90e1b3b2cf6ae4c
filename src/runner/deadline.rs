use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Longest single sleep taken by [`Deadline::sleep`] before re-checking.
pub const POLL_STEP: Duration = Duration::from_millis(100);

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn now_millis() -> u64 {
    saturating_millis(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
    )
}

/// Shared wall-clock stop time.
///
/// Every worker reads it at the top of each iteration; only the
/// orchestrator writes it, and a write can only move it earlier. Stale
/// reads are harmless: a worker notices a forced stop one iteration late.
#[derive(Debug, Clone)]
pub struct Deadline {
    end_millis: Arc<AtomicU64>,
}

impl Deadline {
    pub fn after(runtime: Duration) -> Self {
        Self {
            end_millis: Arc::new(AtomicU64::new(
                now_millis().saturating_add(saturating_millis(runtime)),
            )),
        }
    }

    pub fn expired(&self) -> bool {
        now_millis() >= self.end_millis.load(Ordering::Relaxed)
    }

    /// Unix timestamp in milliseconds.
    pub fn end_millis(&self) -> u64 {
        self.end_millis.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.end_millis().saturating_sub(now_millis()))
    }

    /// Stop every holder as soon as it next looks.
    pub fn force_now(&self) {
        self.force_at(now_millis());
    }

    /// Move the deadline to `end_millis` if that is earlier. Never extends.
    pub fn force_at(&self, end_millis: u64) {
        self.end_millis.fetch_min(end_millis, Ordering::Relaxed);
    }

    /// Sleep for `duration`, waking early once the deadline passes.
    pub fn sleep(&self, duration: Duration) {
        let mut left = duration;
        while !left.is_zero() && !self.expired() {
            let step = left.min(POLL_STEP);
            std::thread::sleep(step);
            left = left.saturating_sub(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Instant;

    #[test]
    fn fresh_deadline_is_not_expired() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.expired());
        assert!(deadline.remaining() > Duration::from_secs(58));
    }

    #[test]
    fn force_now_expires_all_clones() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let worker_view = deadline.clone();
        deadline.force_now();
        assert!(worker_view.expired());
        assert_eq!(worker_view.remaining(), Duration::ZERO);
    }

    #[test]
    fn huge_runtime_saturates_instead_of_wrapping() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.expired());
        assert_eq!(deadline.end_millis(), u64::MAX);
    }

    #[test]
    fn forcing_later_is_ignored() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let before = deadline.end_millis();
        deadline.force_at(before + 60_000);
        assert_eq!(deadline.end_millis(), before);
    }

    #[test]
    fn sleep_wakes_up_on_forced_deadline() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let forcer = deadline.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            forcer.force_now();
        });
        let started = Instant::now();
        deadline.sleep(Duration::from_secs(30));
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn forced_updates_are_monotonic(writes in prop::collection::vec(0u64..u64::MAX, 1..50)) {
            let deadline = Deadline::after(Duration::from_secs(3600));
            let mut previous = deadline.end_millis();
            for end in writes {
                deadline.force_at(end);
                let current = deadline.end_millis();
                prop_assert!(current <= previous);
                prop_assert_eq!(current, previous.min(end));
                previous = current;
            }
        }
    }
}
