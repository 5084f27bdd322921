//! Timer manager
//!
//! An ordered set of timers keyed by `(absolute deadline ms, creation
//! sequence)`; the sequence tiebreak keeps same-deadline timers distinct
//! and expiry deterministic. The embedding reactor asks for the earliest
//! deadline to bound its wait, collects expired callbacks in bulk, and is
//! notified when an insert takes the front slot so it can shorten a wait
//! already in progress.
//!
//! Deadlines are raw monotonic milliseconds. A reading more than one hour
//! below the previous one is treated as a clock rollover and expires every
//! timer in one pass.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use weft_core::constants::CLOCK_ROLLOVER_MS;

use crate::time::now_ms;

/// Callback invoked when a timer fires; recurring timers fire it many times
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// One scheduled timer
///
/// Handles are cheap `Arc`s; `cancel`/`refresh`/`reset` go back to the
/// owning manager through a weak reference and are O(log n) erase+insert.
pub struct Timer {
    seq: u64,
    recurring: bool,
    period_ms: AtomicU64,
    deadline_ms: AtomicU64,
    /// Taken on expiry; `None` makes late handle operations no-ops
    cb: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Absolute deadline in monotonic milliseconds
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms.load(Ordering::Relaxed)
    }

    /// Firing period in milliseconds
    pub fn period_ms(&self) -> u64 {
        self.period_ms.load(Ordering::Relaxed)
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::Relaxed), self.seq)
    }

    /// Remove the timer; a callback already collected still runs
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write().unwrap();
        let mut cb = self.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        inner.timers.remove(&self.key());
        true
    }

    /// Re-peg the deadline to `now + period`
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write().unwrap();
        if self.cb.lock().unwrap().is_none() {
            return false;
        }
        let Some(arc) = inner.timers.remove(&self.key()) else {
            return false;
        };
        self.deadline_ms
            .store(now_ms() + self.period_ms(), Ordering::Relaxed);
        inner.timers.insert(self.key(), arc);
        true
    }

    /// Change the period; `from_now` re-bases the deadline on the current
    /// time instead of the original start
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.period_ms() && !from_now {
            return true;
        }
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let at_front = {
            let mut inner = mgr.inner.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            let Some(arc) = inner.timers.remove(&self.key()) else {
                return false;
            };
            let start = if from_now {
                now_ms()
            } else {
                self.deadline_ms().saturating_sub(self.period_ms())
            };
            self.period_ms.store(period_ms, Ordering::Relaxed);
            self.deadline_ms.store(start + period_ms, Ordering::Relaxed);
            mgr.insert_locked(&mut inner, &arc)
        };
        if at_front {
            mgr.notify_front();
        }
        true
    }
}

struct TimerInner {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last reading observed by `collect_expired`, for rollover detection
    previous_ms: u64,
}

/// Ordered timer set with bulk expiry
pub struct TimerManager {
    inner: RwLock<TimerInner>,
    seq: AtomicU64,
    /// A front insertion has been signalled and not yet acknowledged by
    /// `next_timeout_ms`
    tickled: AtomicBool,
    front_notify: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            inner: RwLock::new(TimerInner {
                timers: BTreeMap::new(),
                previous_ms: now_ms(),
            }),
            seq: AtomicU64::new(0),
            tickled: AtomicBool::new(false),
            front_notify: OnceLock::new(),
        })
    }

    /// Install the front-insertion notification; one installer only
    pub fn set_front_notify(&self, f: Box<dyn Fn() + Send + Sync>) {
        let _ = self.front_notify.set(f);
    }

    fn notify_front(&self) {
        if let Some(f) = self.front_notify.get() {
            f();
        }
    }

    /// Arm a timer `period_ms` from now
    pub fn add_timer(
        self: &Arc<Self>,
        period_ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(period_ms),
            deadline_ms: AtomicU64::new(now_ms() + period_ms),
            cb: Mutex::new(Some(cb)),
            manager: Arc::downgrade(self),
        });
        let at_front = {
            let mut inner = self.inner.write().unwrap();
            self.insert_locked(&mut inner, &timer)
        };
        if at_front {
            self.notify_front();
        }
        timer
    }

    /// Arm a timer gated on `cond`: the tick is dropped once the condition
    /// has been released
    pub fn add_condition_timer<T>(
        self: &Arc<Self>,
        period_ms: u64,
        cb: TimerCallback,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: Send + Sync + 'static,
    {
        let wrapped: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(period_ms, wrapped, recurring)
    }

    /// Insert under the write lock; true when the timer took the front slot
    /// and no earlier front insertion is still unacknowledged
    fn insert_locked(&self, inner: &mut TimerInner, timer: &Arc<Timer>) -> bool {
        let key = timer.key();
        inner.timers.insert(key, timer.clone());
        let at_front = inner.timers.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::SeqCst)
    }

    /// Milliseconds until the earliest timer: 0 when due, `u64::MAX` when
    /// the set is empty. Acknowledges any pending front-insert signal.
    pub fn next_timeout_ms(&self) -> u64 {
        self.tickled.store(false, Ordering::SeqCst);
        let inner = self.inner.read().unwrap();
        match inner.timers.keys().next() {
            None => u64::MAX,
            Some(&(deadline, _)) => {
                let now = now_ms();
                deadline.saturating_sub(now)
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.read().unwrap().timers.is_empty()
    }

    /// Take the callbacks of every timer due by now; recurring timers are
    /// re-armed at `now + period`
    pub fn collect_expired(&self) -> Vec<TimerCallback> {
        self.collect_expired_at(now_ms())
    }

    fn collect_expired_at(&self, now: u64) -> Vec<TimerCallback> {
        let mut inner = self.inner.write().unwrap();
        let rollover =
            now < inner.previous_ms && inner.previous_ms - now > CLOCK_ROLLOVER_MS;
        inner.previous_ms = now;
        if inner.timers.is_empty() {
            return Vec::new();
        }

        let due: Vec<(u64, u64)> = if rollover {
            // The host clock jumped backwards; relative deadlines are
            // meaningless now, fire everything
            inner.timers.keys().copied().collect()
        } else {
            inner
                .timers
                .range(..=(now, u64::MAX))
                .map(|(k, _)| *k)
                .collect()
        };

        let mut cbs = Vec::with_capacity(due.len());
        for key in due {
            let Some(timer) = inner.timers.remove(&key) else {
                continue;
            };
            let Some(cb) = timer.cb.lock().unwrap().take() else {
                continue;
            };
            if timer.recurring {
                *timer.cb.lock().unwrap() = Some(cb.clone());
                timer
                    .deadline_ms
                    .store(now + timer.period_ms(), Ordering::Relaxed);
                inner.timers.insert(timer.key(), timer.clone());
            }
            cbs.push(cb);
        }
        cbs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let c = counter.clone();
        Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_next_timeout_bounds() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout_ms(), u64::MAX);

        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(5000, counter_cb(&hits), false);
        let t = mgr.next_timeout_ms();
        assert!(t > 0 && t <= 5000);

        mgr.add_timer(0, counter_cb(&hits), false);
        assert_eq!(mgr.next_timeout_ms(), 0);
    }

    #[test]
    fn test_one_shot_fires_once_and_empties() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(10, counter_cb(&hits), false);

        let cbs = mgr.collect_expired_at(now_ms() + 20);
        assert_eq!(cbs.len(), 1);
        for cb in cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());

        // The callback was taken: late handle operations are no-ops
        assert!(!timer.cancel());
        assert!(!timer.refresh());
    }

    #[test]
    fn test_recurring_rearms_at_now_plus_period() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(10, counter_cb(&hits), true);

        let now = now_ms() + 15;
        let cbs = mgr.collect_expired_at(now);
        assert_eq!(cbs.len(), 1);
        assert!(mgr.has_timer());
        assert_eq!(timer.deadline_ms(), now + 10);

        // Not due again until the new deadline passes
        assert!(mgr.collect_expired_at(now + 5).is_empty());
        assert_eq!(mgr.collect_expired_at(now + 10).len(), 1);
    }

    #[test]
    fn test_cancel_removes() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(10, counter_cb(&hits), false);

        assert!(timer.cancel());
        assert!(!mgr.has_timer());
        assert!(mgr.collect_expired_at(now_ms() + 100).is_empty());
        // Cancel is idempotent
        assert!(!timer.cancel());
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(50, counter_cb(&hits), false);
        let before = timer.deadline_ms();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.refresh());
        assert!(timer.deadline_ms() >= before);
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_reset_changes_period() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(5000, counter_cb(&hits), false);

        assert!(timer.reset(10, true));
        assert_eq!(timer.period_ms(), 10);
        assert_eq!(mgr.collect_expired_at(now_ms() + 20).len(), 1);
    }

    #[test]
    fn test_same_deadline_timers_all_fire() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            mgr.add_timer(10, counter_cb(&hits), false);
        }
        let cbs = mgr.collect_expired_at(now_ms() + 10);
        assert_eq!(cbs.len(), 3);
    }

    #[test]
    fn test_rollover_expires_everything() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(1_000_000, counter_cb(&hits), false);
        mgr.add_timer(2_000_000, counter_cb(&hits), false);

        let now = now_ms();
        assert!(mgr.collect_expired_at(now).is_empty());

        // The clock drops by two hours: everything fires in one pass
        let cbs = mgr.collect_expired_at(now.saturating_sub(2 * 60 * 60 * 1000));
        assert_eq!(cbs.len(), 2);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_condition_timer_drops_tick_when_condition_gone() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let cond = Arc::new(());
        mgr.add_condition_timer(10, counter_cb(&hits), Arc::downgrade(&cond), false);
        drop(cond);

        for cb in mgr.collect_expired_at(now_ms() + 20) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_front_insert_notification() {
        let mgr = TimerManager::new();
        let notifies = Arc::new(AtomicUsize::new(0));
        let n = notifies.clone();
        mgr.set_front_notify(Box::new(move || {
            n.fetch_add(1, Ordering::SeqCst);
        }));

        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(1000, counter_cb(&hits), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);

        // Later deadline: not the front, no signal
        mgr.add_timer(5000, counter_cb(&hits), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);

        // Earlier deadline, but the previous signal is unacknowledged
        mgr.add_timer(500, counter_cb(&hits), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);

        // Acknowledge, then an earlier insert signals again
        let _ = mgr.next_timeout_ms();
        mgr.add_timer(100, counter_cb(&hits), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 2);
    }
}
