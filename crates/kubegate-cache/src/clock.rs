//! Injectable time source
//!
//! Background tasks never call `Utc::now()`, `tokio::time::sleep` or
//! `tokio::time::timeout` directly; they go through a [`Clock`] so tests can
//! drive time with [`FakeClock`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};

use kubegate_k8s::{Error, Result};

/// Wall-clock reads and timed waits
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Future that completes once `duration` has passed on this clock
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// The real clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Saturating `time + duration`
pub fn add_duration(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Run one attempt of `op`, failing with [`Error::Timeout`] once `after`
/// has passed on `clock`
pub(crate) async fn with_timeout<T>(
    clock: &dyn Clock,
    op: &'static str,
    cluster: &str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        result = fut => result,
        _ = clock.sleep(after) => Err(Error::Timeout {
            op,
            cluster: cluster.to_string(),
            after,
        }),
    }
}

// ============================================================================
// Fake Clock
// ============================================================================

struct Sleeper {
    id: u64,
    deadline: DateTime<Utc>,
    wake: oneshot::Sender<()>,
}

struct FakeClockState {
    now: DateTime<Utc>,
    next_id: u64,
    sleepers: Vec<Sleeper>,
}

struct FakeClockInner {
    state: Mutex<FakeClockState>,
    changed: Notify,
}

/// Clock that only moves when told to.
///
/// Sleepers registered through [`Clock::sleep`] wake when [`advance`]
/// moves the time past their deadline.
///
/// [`advance`]: FakeClock::advance
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<FakeClockInner>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(FakeClockInner {
                state: Mutex::new(FakeClockState {
                    now,
                    next_id: 0,
                    sleepers: Vec::new(),
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Move time forward and wake every sleeper whose deadline has passed
    pub fn advance(&self, duration: Duration) {
        let due: Vec<Sleeper> = {
            let mut state = self.inner.state.lock();
            state.now = add_duration(state.now, duration);
            let now = state.now;
            let (due, pending): (Vec<Sleeper>, Vec<Sleeper>) = std::mem::take(&mut state.sleepers)
                .into_iter()
                .partition(|s| s.deadline <= now);
            state.sleepers = pending;
            due
        };

        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
        self.inner.changed.notify_waiters();
    }

    /// Number of pending sleepers
    pub fn sleepers(&self) -> usize {
        self.inner.state.lock().sleepers.len()
    }

    /// Wait until at least `count` sleepers are pending
    pub async fn block_until_sleepers(&self, count: usize) {
        loop {
            let changed = self.inner.changed.notified();
            if self.sleepers() >= count {
                return;
            }
            changed.await;
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

/// Unregisters a sleeper whose future was dropped before it fired
struct SleeperGuard {
    inner: Arc<FakeClockInner>,
    id: u64,
}

impl Drop for SleeperGuard {
    fn drop(&mut self) {
        let removed = {
            let mut state = self.inner.state.lock();
            let before = state.sleepers.len();
            state.sleepers.retain(|s| s.id != self.id);
            before != state.sleepers.len()
        };
        if removed {
            self.inner.changed.notify_waiters();
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.state.lock().now
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let (wake, woken) = oneshot::channel();
        let id = {
            let mut state = self.inner.state.lock();
            let deadline = add_duration(state.now, duration);
            if deadline <= state.now {
                None
            } else {
                let id = state.next_id;
                state.next_id += 1;
                state.sleepers.push(Sleeper { id, deadline, wake });
                Some(id)
            }
        };

        let Some(id) = id else {
            return Box::pin(async {});
        };
        self.inner.changed.notify_waiters();

        let guard = SleeperGuard {
            inner: Arc::clone(&self.inner),
            id,
        };
        Box::pin(async move {
            let _guard = guard;
            let _ = woken.await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::FutureExt;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_fake_clock_wakes_due_sleepers_only() {
        let clock = FakeClock::new(start());
        let mut short = clock.sleep(Duration::from_secs(10));
        let mut long = clock.sleep(Duration::from_secs(60));
        assert_eq!(clock.sleepers(), 2);

        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.now(), start() + TimeDelta::seconds(10));
        assert!((&mut short).now_or_never().is_some());
        assert!((&mut long).now_or_never().is_none());
        assert_eq!(clock.sleepers(), 1);

        clock.advance(Duration::from_secs(50));
        assert!(long.now_or_never().is_some());
        assert_eq!(clock.sleepers(), 0);
    }

    #[tokio::test]
    async fn test_fake_clock_zero_sleep_is_ready() {
        let clock = FakeClock::new(start());
        assert!(clock.sleep(Duration::ZERO).now_or_never().is_some());
        assert_eq!(clock.sleepers(), 0);
    }

    #[tokio::test]
    async fn test_dropped_sleeper_is_unregistered() {
        let clock = FakeClock::new(start());
        let sleep = clock.sleep(Duration::from_secs(5));
        assert_eq!(clock.sleepers(), 1);
        drop(sleep);
        assert_eq!(clock.sleepers(), 0);
    }

    #[tokio::test]
    async fn test_block_until_sleepers_sees_spawned_task() {
        let clock = FakeClock::new(start());
        let task_clock = clock.clone();
        let task = tokio::spawn(async move {
            task_clock.sleep(Duration::from_secs(30)).await;
        });

        clock.block_until_sleepers(1).await;
        clock.advance(Duration::from_secs(30));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_with_timeout_follows_injected_clock() {
        let clock = FakeClock::new(start());
        let task_clock = clock.clone();
        let task = tokio::spawn(async move {
            with_timeout(
                &task_clock,
                "build cluster schema",
                "c1",
                Duration::from_secs(30),
                futures::future::pending::<Result<()>>(),
            )
            .await
        });

        clock.block_until_sleepers(1).await;
        clock.advance(Duration::from_secs(29));
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        clock.advance(Duration::from_secs(1));
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout { op: "build cluster schema", .. }));
        assert!(err.is_connection_problem());
        assert_eq!(clock.sleepers(), 0);
    }

    #[tokio::test]
    async fn test_with_timeout_returns_ready_result() {
        let clock = FakeClock::new(start());
        let value = with_timeout(&clock, "op", "c1", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(clock.sleepers(), 0);
    }

    #[test]
    fn test_add_duration_saturates() {
        assert_eq!(
            add_duration(start(), Duration::MAX),
            DateTime::<Utc>::MAX_UTC
        );
    }
}
