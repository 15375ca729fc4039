//! Reactor wake-up timer implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use tokio::time::{self, Duration, Instant, Sleep};

/// How long the reactor sleeps when nothing at all is scheduled.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Single sleep future that the reactor loop waits on in a `tokio::select!`
/// branch. It is re-armed after every dispatch to the earliest deadline held
/// in the service's `TimerWheel`.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Deadline the timer is currently armed with.
    deadline: Instant,
}

impl Timer {
    /// Creates a new timer that is parked for the idle interval.
    pub fn new() -> Self {
        let deadline = Instant::now() + IDLE_WAKEUP;
        Timer {
            sleep: Box::pin(time::sleep_until(deadline)),
            deadline,
        }
    }

    /// Get the deadline currently armed.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Re-arms the timer to the given deadline, or parks it for the idle
    /// interval if `None`. Deadlines already in the past fire immediately.
    pub fn arm_or_park(&mut self, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => self.arm(deadline),
            None => self.arm(Instant::now() + IDLE_WAKEUP),
        }
    }

    fn arm(&mut self, deadline: Instant) {
        if deadline != self.deadline {
            self.deadline = deadline;
            self.sleep.as_mut().reset(deadline);
        }
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new_parked() {
        let timer = Timer::new();
        assert!(timer.deadline() > Instant::now() + Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_arm_and_park() {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.arm_or_park(Some(start + Duration::from_millis(200)));
        timer.timeout().await;
        assert!(Instant::now().duration_since(start) >= Duration::from_millis(200));
        timer.arm_or_park(None);
        assert!(timer.deadline() > Instant::now() + Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_arm_past_deadline() {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.arm_or_park(Some(start));
        timer.timeout().await; // should complete immediately
        assert!(Instant::now().duration_since(start) < Duration::from_millis(100));
    }
}
