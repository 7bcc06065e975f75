//! Poll cadence and timers owned by a session.

use std::{pin::Pin, time::Duration};

use tokio::time::{Instant, Sleep};

/// Polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// A reply is awaited.
    Fast,
    Idle,
}

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Poll,
    Safety,
    NoticeExpiry,
}

struct Timer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Timer {
    fn disarmed() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    fn arm_at(&mut self, deadline: Instant) {
        self.sleep.as_mut().reset(deadline);
        self.armed = true;
    }

    fn cancel(&mut self) {
        self.armed = false;
    }
}

/// The poll, safety and notice timers of one session.
///
/// A timer only fires while armed; [`Schedule::cancel_all`] disarms
/// everything, so nothing armed before a teardown can fire after it.
pub struct Schedule {
    fast: Duration,
    idle: Duration,
    safety_timeout: Duration,
    cadence: Cadence,
    poll: Timer,
    safety: Timer,
    notice: Timer,
}

impl Schedule {
    #[must_use]
    pub fn new(fast: Duration, idle: Duration, safety_timeout: Duration) -> Self {
        Self {
            fast,
            idle,
            safety_timeout,
            cadence: Cadence::Idle,
            poll: Timer::disarmed(),
            safety: Timer::disarmed(),
            notice: Timer::disarmed(),
        }
    }

    #[must_use]
    pub const fn cadence(&self) -> Cadence {
        self.cadence
    }

    const fn interval(&self, cadence: Cadence) -> Duration {
        match cadence {
            Cadence::Fast => self.fast,
            Cadence::Idle => self.idle,
        }
    }

    /// Switch cadence. A change cancels the pending poll and re-arms it
    /// at the new interval; the same cadence leaves an armed timer alone.
    pub fn set_cadence(&mut self, cadence: Cadence) {
        if cadence != self.cadence || !self.poll.armed {
            self.cadence = cadence;
            self.rearm_poll();
        }
    }

    /// Arm the next poll one interval from now.
    pub fn rearm_poll(&mut self) {
        self.poll
            .arm_at(Instant::now() + self.interval(self.cadence));
    }

    pub fn arm_safety(&mut self) {
        self.safety.arm_at(Instant::now() + self.safety_timeout);
    }

    pub fn cancel_safety(&mut self) {
        self.safety.cancel();
    }

    #[must_use]
    pub const fn safety_armed(&self) -> bool {
        self.safety.armed
    }

    pub fn arm_notice_expiry(&mut self, at: Instant) {
        self.notice.arm_at(at);
    }

    pub fn cancel_notice_expiry(&mut self) {
        self.notice.cancel();
    }

    /// Disarm every timer.
    pub fn cancel_all(&mut self) {
        self.poll.cancel();
        self.safety.cancel();
        self.notice.cancel();
        self.cadence = Cadence::Idle;
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        !self.poll.armed && !self.safety.armed && !self.notice.armed
    }

    /// Wait for the next armed timer. Pending forever when none is armed.
    ///
    /// Cancel-safe: dropping the future changes nothing.
    pub async fn next(&mut self) -> Tick {
        tokio::select! {
            () = &mut self.poll.sleep, if self.poll.armed => {
                self.poll.armed = false;
                Tick::Poll
            }
            () = &mut self.safety.sleep, if self.safety.armed => {
                self.safety.armed = false;
                Tick::Safety
            }
            () = &mut self.notice.sleep, if self.notice.armed => {
                self.notice.armed = false;
                Tick::NoticeExpiry
            }
            else => std::future::pending().await,
        }
    }
}
