//! One-shot renewal timer.
//!
//! The scheduler owns at most one pending task. Arming always aborts the
//! previous task first, under the same lock that installs the new one, so
//! two renewals can never be outstanding at once.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long before expiry the access token is renewed
pub const RENEWAL_LEAD: Duration = Duration::from_secs(60);

/// Lower bound on any scheduled delay, so an expired token still renews
/// asynchronously instead of spinning.
pub const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

/// `max(expiry - RENEWAL_LEAD - now, MIN_RENEWAL_DELAY)`
pub fn renewal_delay(expiry: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let lead = chrono::Duration::from_std(RENEWAL_LEAD).unwrap_or_else(|_| chrono::Duration::seconds(60));
    let until_renewal = (expiry - lead) - now;
    // Negative deltas fail to_std(); those are already overdue.
    until_renewal
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_RENEWAL_DELAY)
}

struct Pending {
    handle: JoinHandle<()>,
    due: Instant,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    pending: Option<Pending>,
}

#[derive(Default)]
pub struct RenewalScheduler {
    slot: Arc<Mutex<Slot>>,
}

impl RenewalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace any pending renewal with one that runs `action` after `delay`.
    ///
    /// Must be called from within a Tokio runtime; outside of one nothing is
    /// armed and a warning is logged.
    pub fn arm<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let mut slot = Self::lock(&self.slot);
        if let Some(previous) = slot.pending.take() {
            previous.handle.abort();
        }
        slot.generation += 1;

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime available, renewal not scheduled");
                return;
            }
        };

        let generation = slot.generation;
        let due = Instant::now() + delay;
        let shared = Arc::clone(&self.slot);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(due).await;
            if !Self::claim(&shared, generation) {
                return;
            }
            action().await;
        });

        debug!(delay_ms = delay.as_millis() as u64, generation, "Renewal armed");
        slot.pending = Some(Pending { handle, due });
    }

    /// Detach the firing task from the slot so the action may re-arm
    /// without aborting itself. False if it was superseded meanwhile.
    fn claim(slot: &Mutex<Slot>, generation: u64) -> bool {
        let mut slot = Self::lock(slot);
        if slot.generation != generation || slot.pending.is_none() {
            return false;
        }
        slot.pending = None;
        true
    }

    pub fn cancel(&self) {
        let mut slot = Self::lock(&self.slot);
        slot.generation += 1;
        if let Some(pending) = slot.pending.take() {
            pending.handle.abort();
            debug!("Pending renewal cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        Self::lock(&self.slot).pending.is_some()
    }

    /// Time left until the pending renewal fires
    pub fn due_in(&self) -> Option<Duration> {
        Self::lock(&self.slot)
            .pending
            .as_ref()
            .map(|pending| pending.due.saturating_duration_since(Instant::now()))
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
