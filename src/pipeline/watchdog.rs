//! Idle detection for power saving.
//!
//! Consumers report demand through [`IdleWatchdog::on_activity`] every time they
//! wait on the relay. When nobody has asked for a frame within the threshold the
//! capture worker suspends itself and parks in [`IdleWatchdog::wait_for_demand`]
//! until the next consumer shows up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Active,
    Idle,
}

pub struct IdleWatchdog {
    origin: Instant,
    /// Milliseconds since `origin` of the last consumer request
    last_activity: AtomicU64,
    threshold: Option<Duration>,
    suspended: AtomicBool,
    wake: (Mutex<()>, Condvar),
}

impl IdleWatchdog {
    /// `None` disables idle detection; `check_idle` then always reports `Active`.
    pub fn new(threshold: Option<Duration>) -> Self {
        Self {
            origin: Instant::now(),
            last_activity: AtomicU64::new(0),
            threshold,
            suspended: AtomicBool::new(false),
            wake: (Mutex::new(()), Condvar::new()),
        }
    }

    pub fn threshold(&self) -> Option<Duration> {
        self.threshold
    }

    /// Record consumer demand, waking a suspended capture worker.
    pub fn on_activity(&self) {
        // SeqCst pairs with `set_suspended`: either this sees the flag or the
        // worker's idle check sees this timestamp
        self.last_activity
            .fetch_max(self.millis_at(Instant::now()), Ordering::SeqCst);
        if self.suspended.load(Ordering::SeqCst) {
            // Taking the lock orders this notify after a concurrent waiter's check
            let _guard = self.wake.0.lock().unwrap_or_else(|e| e.into_inner());
            self.wake.1.notify_all();
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_activity.load(Ordering::SeqCst))
    }

    pub fn check_idle(&self) -> Activity {
        self.check_idle_at(Instant::now())
    }

    pub fn check_idle_at(&self, now: Instant) -> Activity {
        match self.threshold {
            Some(threshold) if now.saturating_duration_since(self.last_activity()) > threshold => {
                Activity::Idle
            }
            _ => Activity::Active,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    /// Block the calling thread until demand returns or `max_wait` elapses.
    pub fn wait_for_demand(&self, max_wait: Duration) -> Activity {
        let guard = self.wake.0.lock().unwrap_or_else(|e| e.into_inner());
        if self.check_idle() == Activity::Active {
            return Activity::Active;
        }
        let (_guard, result) = self
            .wake
            .1
            .wait_timeout(guard, max_wait)
            .unwrap_or_else(|e| e.into_inner());
        if !result.timed_out() {
            debug!("Woken by consumer demand");
        }
        self.check_idle()
    }

    fn millis_at(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn idle_after_threshold_without_activity() {
        let watchdog = IdleWatchdog::new(Some(Duration::from_millis(2)));
        let start = watchdog.last_activity();
        assert_eq!(watchdog.check_idle_at(start), Activity::Active);
        assert_eq!(
            watchdog.check_idle_at(start + Duration::from_millis(3)),
            Activity::Idle
        );
    }

    #[test]
    fn disabled_watchdog_never_idles() {
        let watchdog = IdleWatchdog::new(None);
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(watchdog.check_idle_at(later), Activity::Active);
    }

    #[test]
    fn activity_resets_the_clock() {
        let watchdog = IdleWatchdog::new(Some(Duration::from_millis(20)));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(watchdog.check_idle(), Activity::Idle);
        watchdog.on_activity();
        assert_eq!(watchdog.check_idle(), Activity::Active);
    }

    #[test]
    fn concurrent_demand_is_never_missed() {
        let watchdog = Arc::new(IdleWatchdog::new(Some(Duration::from_millis(200))));
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(220));
            assert_eq!(watchdog.check_idle(), Activity::Idle);
            let waiter = {
                let watchdog = watchdog.clone();
                thread::spawn(move || {
                    watchdog.set_suspended(true);
                    let started = Instant::now();
                    let activity = watchdog.wait_for_demand(Duration::from_secs(5));
                    watchdog.set_suspended(false);
                    (activity, started.elapsed())
                })
            };
            watchdog.on_activity();
            let (activity, waited) = waiter.join().unwrap();
            assert_eq!(activity, Activity::Active);
            assert!(waited < Duration::from_secs(1), "wakeup lost, waited {waited:?}");
        }
    }

    #[test]
    fn demand_wakes_suspended_waiter() {
        let watchdog = Arc::new(IdleWatchdog::new(Some(Duration::from_millis(10))));
        thread::sleep(Duration::from_millis(20));
        watchdog.set_suspended(true);

        let waiter = {
            let watchdog = watchdog.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let activity = watchdog.wait_for_demand(Duration::from_secs(5));
                (activity, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        watchdog.on_activity();

        let (activity, waited) = waiter.join().unwrap();
        assert_eq!(activity, Activity::Active);
        assert!(waited < Duration::from_secs(5));
    }
}
