//! Periodic trigger timers with earliest-wins re-arming.
//!
//! Each timer holds one armed fire time. Re-arming keeps the earliest
//! requested time and never postpones an already-armed earlier fire, so
//! rapid repeated triggering cannot starve the timer. After a fire the
//! timer re-arms itself for one interval plus a small jitter.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Notify};

use dirmesh_model::time::now_us;

/// Intervals for the three engine timers.
#[derive(Debug, Clone, Copy)]
pub struct TriggerConfig {
    /// Between topology periods.
    pub topology_interval: Duration,
    /// Between operation-pump runs.
    pub pump_interval: Duration,
    /// Between maintenance sweeps.
    pub sweep_interval: Duration,
    /// Upper bound of the random delay added to each re-arm.
    pub max_jitter: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            topology_interval: Duration::from_secs(15 * 60),
            pump_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60 * 60),
            max_jitter: Duration::from_secs(5),
        }
    }
}

/// One armed fire time, microseconds since the epoch.
#[derive(Debug, Default)]
pub struct TimerSlot {
    armed_us: Option<u64>,
}

impl TimerSlot {
    /// An empty, unarmed slot.
    pub fn new() -> Self {
        TimerSlot::default()
    }

    /// Arms for `when_us`. An earlier armed time wins; returns true if
    /// the slot moved.
    pub fn arm(&mut self, when_us: u64) -> bool {
        match self.armed_us {
            Some(existing) if existing <= when_us => false,
            _ => {
                self.armed_us = Some(when_us);
                true
            }
        }
    }

    /// Clears and returns the armed time if it is due at `now_us`.
    pub fn take_due(&mut self, now_us: u64) -> Option<u64> {
        match self.armed_us {
            Some(when) if when <= now_us => {
                self.armed_us = None;
                Some(when)
            }
            _ => None,
        }
    }

    /// The armed time, if any.
    pub fn armed(&self) -> Option<u64> {
        self.armed_us
    }
}

/// A self-re-arming timer. One task loops on [`tick`](Self::tick);
/// any task can pull the next fire forward with
/// [`arm_at`](Self::arm_at) or [`fire_now`](Self::fire_now).
#[derive(Debug)]
pub struct PeriodicTimer {
    slot: Mutex<TimerSlot>,
    kick: Notify,
    interval: Duration,
    max_jitter: Duration,
}

impl PeriodicTimer {
    /// A timer firing every `interval` plus up to `max_jitter`.
    pub fn new(interval: Duration, max_jitter: Duration) -> Self {
        PeriodicTimer {
            slot: Mutex::new(TimerSlot::new()),
            kick: Notify::new(),
            interval,
            max_jitter,
        }
    }

    fn jittered_delay_us(&self) -> u64 {
        let jitter_cap = self.max_jitter.as_micros() as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        self.interval.as_micros() as u64 + jitter
    }

    /// Requests a fire at `when_us`; an already-armed earlier fire wins.
    pub fn arm_at(&self, when_us: u64) {
        let moved = self
            .slot
            .lock()
            .map(|mut slot| slot.arm(when_us))
            .unwrap_or(false);
        if moved {
            self.kick.notify_one();
        }
    }

    /// Requests an immediate fire.
    pub fn fire_now(&self) {
        self.arm_at(now_us());
    }

    /// The armed fire time, if any.
    pub fn armed(&self) -> Option<u64> {
        self.slot.lock().map(|slot| slot.armed()).unwrap_or(None)
    }

    /// Waits for the next fire. Returns true on a fire and false once
    /// `shutdown` flips, after which the timer should not be polled
    /// again. An unarmed timer arms itself one jittered interval out.
    pub async fn tick(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        loop {
            let now = now_us();
            let due = {
                let mut slot = match self.slot.lock() {
                    Ok(guard) => guard,
                    Err(_) => return false,
                };
                if slot.armed().is_none() {
                    slot.arm(now + self.jittered_delay_us());
                }
                slot.armed()
            };
            let Some(due) = due else {
                return false;
            };
            let wait = Duration::from_micros(due.saturating_sub(now));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let fired = self
                        .slot
                        .lock()
                        .map(|mut slot| slot.take_due(now_us()).is_some())
                        .unwrap_or(false);
                    if fired {
                        return true;
                    }
                }
                // A re-arm moved the fire time; recompute the wait.
                _ = self.kick.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod slots {
        use super::*;

        #[test]
        fn arming_keeps_the_earlier_time() {
            let mut slot = TimerSlot::new();
            assert!(slot.arm(100));
            assert!(slot.arm(50));
            assert!(!slot.arm(200));
            assert_eq!(slot.armed(), Some(50));
        }

        #[test]
        fn take_waits_until_due() {
            let mut slot = TimerSlot::new();
            slot.arm(100);
            assert_eq!(slot.take_due(99), None);
            assert_eq!(slot.take_due(100), Some(100));
            // The slot is clear after a fire.
            assert_eq!(slot.armed(), None);
            assert_eq!(slot.take_due(200), None);
        }

        #[test]
        fn unarmed_slot_never_fires() {
            let mut slot = TimerSlot::new();
            assert_eq!(slot.take_due(u64::MAX), None);
        }
    }

    mod timers {
        use super::*;
        use std::sync::Arc;
        use tokio::time::timeout;

        fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
            watch::channel(false)
        }

        #[tokio::test]
        async fn timer_fires_after_its_interval() {
            let timer = PeriodicTimer::new(Duration::from_millis(10), Duration::ZERO);
            let (_tx, mut rx) = shutdown_pair();
            let fired = timeout(Duration::from_secs(2), timer.tick(&mut rx))
                .await
                .unwrap();
            assert!(fired);
        }

        #[tokio::test]
        async fn manual_arm_fires_a_slow_timer_early() {
            let timer = PeriodicTimer::new(Duration::from_secs(3600), Duration::ZERO);
            let (_tx, mut rx) = shutdown_pair();
            timer.fire_now();
            let fired = timeout(Duration::from_secs(2), timer.tick(&mut rx))
                .await
                .unwrap();
            assert!(fired);
        }

        #[tokio::test]
        async fn later_arm_does_not_postpone_an_armed_fire() {
            let timer = PeriodicTimer::new(Duration::from_secs(3600), Duration::ZERO);
            let (_tx, mut rx) = shutdown_pair();
            timer.arm_at(now_us() + 50_000);
            timer.arm_at(now_us() + 3_600_000_000);
            assert!(timer.armed().unwrap() <= now_us() + 50_000);
            let fired = timeout(Duration::from_secs(2), timer.tick(&mut rx))
                .await
                .unwrap();
            assert!(fired);
        }

        #[tokio::test]
        async fn kick_wakes_a_sleeping_tick() {
            let timer = Arc::new(PeriodicTimer::new(Duration::from_secs(3600), Duration::ZERO));
            let (_tx, mut rx) = shutdown_pair();
            let waker = timer.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                waker.fire_now();
            });
            let fired = timeout(Duration::from_secs(2), timer.tick(&mut rx))
                .await
                .unwrap();
            assert!(fired);
            handle.await.unwrap();
        }

        #[tokio::test]
        async fn shutdown_stops_the_timer() {
            let timer = PeriodicTimer::new(Duration::from_secs(3600), Duration::ZERO);
            let (tx, mut rx) = shutdown_pair();
            tx.send(true).unwrap();
            assert!(!timer.tick(&mut rx).await);
        }

        #[tokio::test]
        async fn shutdown_interrupts_a_sleeping_tick() {
            let timer = Arc::new(PeriodicTimer::new(Duration::from_secs(3600), Duration::ZERO));
            let (tx, mut rx) = shutdown_pair();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tx.send(true).unwrap();
            });
            let fired = timeout(Duration::from_secs(2), timer.tick(&mut rx))
                .await
                .unwrap();
            assert!(!fired);
            handle.await.unwrap();
        }
    }
}
