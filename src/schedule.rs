//! Shared polling-schedule state and the responsiveness override protocol.
//!
//! The scheduler normally polls at the nominal interval. Any accepted control
//! message arms an override that drops the effective interval to one second
//! and forces the next cycle immediately, so an operator watching a supply
//! ramp sees feedback right away. With no further messages the override
//! expires after thirty seconds and the nominal interval is restored. A
//! second message while the override is active only refreshes the expiry
//! clock.
//!
//! All methods take an explicit `now` so the arithmetic is testable without
//! wall-clock sleeps. Deadlines advance by `next_deadline += interval`, never
//! from the end of cycle execution, so cycle duration does not accumulate
//! drift.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Effective interval while the override is armed.
pub const OVERRIDE_INTERVAL: Duration = Duration::from_secs(1);

/// How long the override stays armed after the last accepted control message.
pub const OVERRIDE_WINDOW: Duration = Duration::from_secs(30);

/// Lockable record of nominal/effective poll interval and override timers.
///
/// Shared by reference between the polling loop and the control router; the
/// guarding mutex is held only for the brief arithmetic in these methods,
/// never across wire I/O.
#[derive(Debug)]
pub struct ScheduleState {
    nominal_interval: Duration,
    effective_interval: Duration,
    next_deadline: Instant,
    override_active: bool,
    override_started_at: Instant,
}

/// Schedule state shared between the scheduler and the control router.
pub type SharedSchedule = Arc<Mutex<ScheduleState>>;

impl ScheduleState {
    /// Create schedule state polling at `nominal` with the first cycle due at
    /// `now`.
    pub fn new(nominal: Duration, now: Instant) -> Self {
        Self {
            nominal_interval: nominal,
            effective_interval: nominal,
            next_deadline: now,
            override_active: false,
            override_started_at: now,
        }
    }

    /// Wrap in the shared handle used across tasks.
    pub fn shared(nominal: Duration, now: Instant) -> SharedSchedule {
        Arc::new(Mutex::new(Self::new(nominal, now)))
    }

    /// Arm (or re-arm) the responsiveness override.
    ///
    /// Forces the next cycle to start near-immediately. Re-arming while
    /// already active refreshes the expiry clock without touching the
    /// effective interval.
    pub fn arm_override(&mut self, now: Instant) {
        self.effective_interval = OVERRIDE_INTERVAL;
        self.override_active = true;
        self.override_started_at = now;
        self.next_deadline = now;
    }

    /// Advance the deadline after a completed cycle and expire the override
    /// if its window has elapsed.
    pub fn advance_deadline(&mut self, now: Instant) {
        self.next_deadline += self.effective_interval;
        if self.override_active
            && now.duration_since(self.override_started_at) > OVERRIDE_WINDOW
        {
            self.override_active = false;
            self.effective_interval = self.nominal_interval;
        }
    }

    /// Deadline of the next cycle.
    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    /// Interval currently in effect.
    pub fn effective_interval(&self) -> Duration {
        self.effective_interval
    }

    /// Whether the responsiveness override is currently armed.
    pub fn override_active(&self) -> bool {
        self.override_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_deadlines_do_not_drift_with_cycle_time() {
        let t0 = Instant::now();
        let mut s = ScheduleState::new(secs(10), t0);

        // Cycle takes 3 time units; next deadline is previous + 10, not
        // execution end + 10.
        s.advance_deadline(t0 + secs(3));
        assert_eq!(s.next_deadline(), t0 + secs(10));

        s.advance_deadline(t0 + secs(13));
        assert_eq!(s.next_deadline(), t0 + secs(20));
    }

    #[test]
    fn test_override_arms_and_forces_immediate_cycle() {
        let t0 = Instant::now();
        let mut s = ScheduleState::new(secs(10), t0);
        s.advance_deadline(t0);

        s.arm_override(t0 + secs(5));
        assert!(s.override_active());
        assert_eq!(s.effective_interval(), OVERRIDE_INTERVAL);
        assert_eq!(s.next_deadline(), t0 + secs(5));
    }

    #[test]
    fn test_override_reverts_after_window() {
        let t0 = Instant::now();
        let mut s = ScheduleState::new(secs(10), t0);
        s.arm_override(t0);

        // Within the window the short interval stays in effect.
        s.advance_deadline(t0 + secs(30));
        assert!(s.override_active());
        assert_eq!(s.effective_interval(), OVERRIDE_INTERVAL);

        // Strictly past the window it reverts.
        s.advance_deadline(t0 + secs(31));
        assert!(!s.override_active());
        assert_eq!(s.effective_interval(), secs(10));
    }

    #[test]
    fn test_rearm_refreshes_expiry_without_changing_interval() {
        let t0 = Instant::now();
        let mut s = ScheduleState::new(secs(10), t0);
        s.arm_override(t0);

        // Re-arm at t=20: expiry moves to t=50.
        s.arm_override(t0 + secs(20));
        assert_eq!(s.effective_interval(), OVERRIDE_INTERVAL);

        s.advance_deadline(t0 + secs(45));
        assert!(s.override_active(), "still inside the refreshed window");

        s.advance_deadline(t0 + secs(51));
        assert!(!s.override_active());
        assert_eq!(s.effective_interval(), secs(10));
    }
}
