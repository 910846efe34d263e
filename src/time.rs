//! Radio-timer time base.
//!
//! All MAC deadlines are expressed in ticks of the radio timer. The counter
//! wraps, so orderings are always computed through a signed difference.

/// Ratio between radio-timer ticks and microseconds: `us = ticks * 3051 / 100`
/// (a ~32.768 kHz radio clock).
pub const TICK_TO_US_NUM: i32 = 3051;
pub const TICK_TO_US_DEN: i32 = 100;

/// Convert a tick count to microseconds
pub fn ticks_to_us(ticks: i32) -> i32 {
    ticks * TICK_TO_US_NUM / TICK_TO_US_DEN
}

/// Convert microseconds to a tick count
pub fn us_to_ticks(us: i32) -> i32 {
    us * TICK_TO_US_DEN / TICK_TO_US_NUM
}

/// An instant of the monotonic radio timer.
///
/// Wrapping arithmetic; two instants may only be compared when they are less
/// than half the counter range apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tick(pub u32);

impl Tick {
    /// Signed tick count from `earlier` to `self`
    pub fn delta(self, earlier: Tick) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    /// Whether `self` lies strictly after `other`
    pub fn is_after(self, other: Tick) -> bool {
        self.delta(other) > 0
    }

    /// Offset by a signed tick count
    pub fn offset(self, ticks: i32) -> Tick {
        Tick(self.0.wrapping_add(ticks as u32))
    }
}

impl core::ops::Add<u32> for Tick {
    type Output = Tick;

    fn add(self, rhs: u32) -> Tick {
        Tick(self.0.wrapping_add(rhs))
    }
}

impl core::ops::AddAssign<u32> for Tick {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

/// Outcome of arming the slot timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Deadline armed
    Ok,
    /// Deadline already passed (or unreasonably far out); nothing armed
    Missed,
    /// Timer hardware failure
    HardwareError,
}

/// Slot timer providing the monotonic radio clock and deadline wake-ups.
///
/// `schedule_at` arms a single outstanding deadline; when it fires the
/// platform is expected to call back into the MAC (`TschMac::resume`).
pub trait SlotTimer {
    /// Current radio-timer instant
    fn now(&self) -> Tick;

    /// Arm a wake-up at `deadline`, replacing any previously armed deadline
    fn schedule_at(&mut self, deadline: Tick) -> Schedule;
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use super::{Schedule, SlotTimer, Tick};

    /// Manually driven timer for tests.
    ///
    /// Tests advance time with `set`, then fire the armed deadline via
    /// `advance_to_deadline` before resuming the MAC.
    #[derive(Debug, Clone, Default)]
    pub struct MockTimer {
        now: Tick,
        pub deadline: Option<Tick>,
    }

    impl MockTimer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&mut self, t: Tick) {
            self.now = t;
        }

        /// Jump to the armed deadline and return it
        pub fn advance_to_deadline(&mut self) -> Tick {
            let d = self.deadline.take().expect("no deadline armed");
            self.now = d;
            d
        }
    }

    impl SlotTimer for MockTimer {
        fn now(&self) -> Tick {
            self.now
        }

        fn schedule_at(&mut self, deadline: Tick) -> Schedule {
            if deadline.delta(self.now) <= 0 {
                return Schedule::Missed;
            }

            self.deadline = Some(deadline);
            Schedule::Ok
        }
    }
}
