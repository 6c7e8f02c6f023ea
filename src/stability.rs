// stability.rs — C10: Stability Heuristic.
//
// Pure functions parameterized by `now_ms` throughout (the teacher has no
// analogue; grounded in the pack's memory-fault crate's style of testing
// time-windowed logic by passing the clock in rather than reading it), so
// the cooldown arithmetic is testable without a real clock and without
// `std::time` inside `#[cfg(test)]`.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const FAULT_COOLDOWN_MS: u32 = 2_000;
const COUNT_CHANGE_COOLDOWN_MS: u32 = 1_000;
const LARGE_COUNT_CHANGE_THRESHOLD: i32 = 5;

/// §7: "After repeated failures within a short window, tree-walk mode
/// auto-reverts to heap-scan mode." A fault outside this window starts a
/// fresh streak instead of accumulating against a stale one.
const SCANNER_FAULT_STREAK_WINDOW_MS: u32 = 5_000;
const SCANNER_FAULT_STREAK_LIMIT: u32 = 3;

/// Milliseconds since process-arbitrary epoch, monotonic enough for cooldown
/// math (wall clock, not `Instant`, because the VEH handler needs a value it
/// can stash without holding a `Mutex`).
pub fn now_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

pub struct StabilityState {
    pub scanner_fault_ms: AtomicU32,
    pub attack_fault_ms: AtomicU32,
    prev_count: AtomicI64,
    count_change_ms: AtomicU32,
    scanner_fault_streak: AtomicU32,
}

impl StabilityState {
    pub const fn new() -> Self {
        Self {
            scanner_fault_ms: AtomicU32::new(0),
            attack_fault_ms: AtomicU32::new(0),
            prev_count: AtomicI64::new(-1),
            count_change_ms: AtomicU32::new(0),
            scanner_fault_streak: AtomicU32::new(0),
        }
    }

    /// Called once per scan cycle with the freshly observed creature count.
    pub fn observe_count(&self, new_count: usize, now: u32) {
        let new_count = new_count as i64;
        let prev = self.prev_count.swap(new_count, Ordering::Relaxed);
        if prev >= 0 {
            let delta = (new_count - prev).unsigned_abs();
            if prev > 0 && delta as i32 >= LARGE_COUNT_CHANGE_THRESHOLD {
                self.count_change_ms.store(now, Ordering::Relaxed);
            }
        }
    }

    /// Records a scanner-side fault and returns whether the consecutive
    /// streak (within `SCANNER_FAULT_STREAK_WINDOW_MS` of the previous one)
    /// has now reached `SCANNER_FAULT_STREAK_LIMIT` — the caller's signal to
    /// revert to heap-scan mode (§7).
    pub fn note_scanner_fault(&self, now: u32) -> bool {
        let last = self.scanner_fault_ms.swap(now, Ordering::Relaxed);
        let streak = if last != 0 && now.saturating_sub(last) < SCANNER_FAULT_STREAK_WINDOW_MS {
            self.scanner_fault_streak.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.scanner_fault_streak.store(1, Ordering::Relaxed);
            1
        };
        streak >= SCANNER_FAULT_STREAK_LIMIT
    }

    /// Clears the streak on a clean cycle, so an isolated fault long ago
    /// doesn't half-count toward a future unrelated one.
    pub fn reset_scanner_fault_streak(&self) {
        self.scanner_fault_streak.store(0, Ordering::Relaxed);
    }

    pub fn note_attack_fault(&self, now: u32) {
        self.attack_fault_ms.store(now, Ordering::Relaxed);
    }

    /// §4.9: targeting is deferred if any of the three timestamps are
    /// within their respective cooldown window of `now`.
    pub fn is_unstable(&self, now: u32) -> bool {
        within_cooldown(self.scanner_fault_ms.load(Ordering::Relaxed), now, FAULT_COOLDOWN_MS)
            || within_cooldown(self.attack_fault_ms.load(Ordering::Relaxed), now, FAULT_COOLDOWN_MS)
            || within_cooldown(
                self.count_change_ms.load(Ordering::Relaxed),
                now,
                COUNT_CHANGE_COOLDOWN_MS,
            )
    }
}

/// `stamp == 0` means "never happened" and is never within cooldown.
/// Saturating subtraction tolerates `now` wrapping or a stale future stamp
/// from a prior process epoch — neither should wedge targeting forever.
fn within_cooldown(stamp: u32, now: u32, window_ms: u32) -> bool {
    stamp != 0 && now.saturating_sub(stamp) < window_ms
}

pub static STABILITY: StabilityState = StabilityState::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_stable() {
        let s = StabilityState::new();
        assert!(!s.is_unstable(1_000_000));
    }

    #[test]
    fn fault_triggers_cooldown_then_expires() {
        let s = StabilityState::new();
        s.note_scanner_fault(1_000);
        assert!(s.is_unstable(1_500));
        assert!(!s.is_unstable(1_000 + FAULT_COOLDOWN_MS + 1));
    }

    #[test]
    fn small_count_delta_does_not_trigger() {
        let s = StabilityState::new();
        s.observe_count(9, 0);
        s.observe_count(7, 100);
        assert!(!s.is_unstable(100));
    }

    #[test]
    fn large_count_delta_triggers_short_cooldown() {
        let s = StabilityState::new();
        s.observe_count(9, 0);
        s.observe_count(3, 100);
        assert!(s.is_unstable(100));
        assert!(!s.is_unstable(100 + COUNT_CHANGE_COOLDOWN_MS + 1));
    }

    #[test]
    fn first_observation_never_triggers() {
        let s = StabilityState::new();
        s.observe_count(0, 0);
        assert!(!s.is_unstable(0));
    }

    #[test]
    fn zero_prev_count_does_not_trigger_on_repopulate() {
        let s = StabilityState::new();
        s.observe_count(0, 0);
        s.observe_count(50, 10);
        assert!(!s.is_unstable(10));
    }

    #[test]
    fn scanner_fault_streak_reaches_limit_within_window() {
        let s = StabilityState::new();
        assert!(!s.note_scanner_fault(0));
        assert!(!s.note_scanner_fault(100));
        assert!(s.note_scanner_fault(200));
    }

    #[test]
    fn scanner_fault_streak_resets_outside_window() {
        let s = StabilityState::new();
        assert!(!s.note_scanner_fault(0));
        assert!(!s.note_scanner_fault(100));
        assert!(!s.note_scanner_fault(100 + SCANNER_FAULT_STREAK_WINDOW_MS + 1));
    }

    #[test]
    fn clean_cycle_clears_streak() {
        let s = StabilityState::new();
        assert!(!s.note_scanner_fault(0));
        assert!(!s.note_scanner_fault(100));
        s.reset_scanner_fault_streak();
        assert!(!s.note_scanner_fault(200));
        assert!(!s.note_scanner_fault(300));
    }
}
