//! Time source used for timestamps, backoff sleeps and bounded waits.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// Source of wall-clock time and suspension.
///
/// Production code uses [`SystemClock`]; tests substitute [`ManualClock`] or
/// run [`SystemClock`] on a paused tokio runtime.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by `chrono::Utc::now` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct ManualClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
    frozen: bool,
    waiters: Vec<(DateTime<Utc>, oneshot::Sender<()>)>,
}

/// Virtual clock for tests.
///
/// Every `sleep` is recorded, so callers can assert on the exact backoff
/// schedule. A clock built with [`new`](Self::new) advances itself by the
/// requested duration and returns at once. A [`frozen`](Self::frozen) clock
/// only moves through [`advance`](Self::advance); its sleeps park until time
/// passes their deadline, which is what a bounded wait raced against other
/// work needs.
pub struct ManualClock {
    state: Mutex<ManualClockState>,
}

impl ManualClock {
    /// Creates a self-advancing clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a self-advancing clock starting at `now`.
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self::build(now, false)
    }

    /// Creates a clock whose sleeps wait for [`advance`](Self::advance).
    pub fn frozen() -> Self {
        Self::build(Utc::now(), true)
    }

    fn build(now: DateTime<Utc>, frozen: bool) -> Self {
        Self {
            state: Mutex::new(ManualClockState {
                now,
                sleeps: Vec::new(),
                frozen,
                waiters: Vec::new(),
            }),
        }
    }

    /// Moves the clock forward without recording a sleep and wakes every
    /// sleeper whose deadline has passed.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut state = self.lock();
            state.now = later(state.now, duration);
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) = state
                .waiters
                .drain(..)
                .partition(|(deadline, _)| *deadline <= now);
            state.waiters = pending;
            due
        };
        for (_, waker) in due {
            let _ = waker.send(());
        }
    }

    /// Returns every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Number of sleeps currently parked on a frozen clock.
    pub fn pending_sleeps(&self) -> usize {
        self.lock()
            .waiters
            .iter()
            .filter(|(_, waker)| !waker.is_closed())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, ManualClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("frozen", &state.frozen)
            .field("sleeps", &state.sleeps.len())
            .finish()
    }
}

fn later(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|step| now.checked_add_signed(step))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        let parked = {
            let mut state = self.lock();
            state.sleeps.push(duration);
            let deadline = later(state.now, duration);
            if !state.frozen {
                state.now = deadline;
                None
            } else if deadline <= state.now {
                None
            } else {
                let (waker, parked) = oneshot::channel();
                state.waiters.push((deadline, waker));
                Some(parked)
            }
        };
        if let Some(parked) = parked {
            let _ = parked.await;
        }
    }
}
