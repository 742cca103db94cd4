//! Issued nonces and their expiry.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::digest::DigestCredential;
use crate::{Error, Result};

/// A nonce handed out in a challenge.
#[derive(Debug, Clone)]
pub struct Nonce {
    pub value: String,
    pub issued_at: Instant,
    /// Accepted uses so far
    pub uses: u32,
    /// Highest nonce-count accepted with this nonce
    pub last_nc: Option<u32>,
}

impl Nonce {
    fn new(value: String) -> Self {
        Self {
            value,
            issued_at: Instant::now(),
            uses: 0,
            last_nc: None,
        }
    }

    /// Older than `max_valid` at `now`
    pub fn is_stale(&self, now: Instant, max_valid: Duration) -> bool {
        now.saturating_duration_since(self.issued_at) > max_valid
    }
}

/// 16 random bytes followed by the issue time in milliseconds, hex encoded.
fn new_nonce_value() -> String {
    let random: [u8; 16] = rand::thread_rng().gen();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&random);
    bytes.extend_from_slice(&millis.to_be_bytes());
    hex::encode(bytes)
}

/// Concurrent cache of issued nonces.
///
/// Entries live in a sharded map, so validations of unrelated nonces do not contend
/// with each other or with a running sweep for longer than one shard.
#[derive(Debug)]
pub struct NonceCache {
    nonces: DashMap<String, Nonce>,
    max_valid: Duration,
    replay_detection: bool,
}

impl NonceCache {
    pub fn new(max_valid: Duration) -> Self {
        Self {
            nonces: DashMap::new(),
            max_valid,
            replay_detection: false,
        }
    }

    /// Reject nonces (without qop) or nonce-counts (with qop) that were already used.
    pub fn with_replay_detection(mut self, enabled: bool) -> Self {
        self.replay_detection = enabled;
        self
    }

    pub fn max_valid(&self) -> Duration {
        self.max_valid
    }

    pub fn replay_detection(&self) -> bool {
        self.replay_detection
    }

    /// Create a fresh nonce, remember it and return its value.
    pub fn generate_and_cache(&self) -> String {
        loop {
            let value = new_nonce_value();
            if let Entry::Vacant(slot) = self.nonces.entry(value.clone()) {
                slot.insert(Nonce::new(value.clone()));
                return value;
            }
        }
    }

    /// Whether the nonce referenced by `credential` was issued here and is still fresh.
    ///
    /// An accepted check counts as a use of the nonce. With replay detection on, a
    /// nonce without nonce-count is accepted once, and a nonce-count must grow on
    /// every use.
    ///
    /// The use is recorded before the response digest is checked, so an unverified
    /// request can advance `last_nc`. The client then gets a stale challenge and
    /// retries with a fresh nonce.
    pub fn has_valid_nonce(&self, credential: &DigestCredential) -> bool {
        let value = match &credential.nonce {
            Some(v) => v,
            None => return false,
        };

        let mut nonce = match self.nonces.get_mut(value.as_str()) {
            Some(n) => n,
            None => {
                debug!(nonce = %value, "unknown nonce");
                return false;
            }
        };

        if nonce.is_stale(Instant::now(), self.max_valid) {
            debug!(nonce = %value, "stale nonce");
            return false;
        }

        let nc = credential.nonce_count().ok().flatten();

        if self.replay_detection {
            let replayed = match (nc, nonce.last_nc) {
                (Some(nc), Some(last)) => nc <= last,
                (Some(_), None) => false,
                (None, _) => credential.nc.is_some() || nonce.uses > 0,
            };

            if replayed {
                warn!(nonce = %value, nc = ?credential.nc, "nonce replay rejected");
                return false;
            }
        }

        nonce.uses = nonce.uses.saturating_add(1);
        if let Some(nc) = nc {
            nonce.last_nc = Some(nonce.last_nc.map_or(nc, |last| last.max(nc)));
        }

        true
    }

    /// Drop every nonce older than `max_valid`, returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let max_valid = self.max_valid;
        let mut removed = 0;

        self.nonces.retain(|_, nonce| {
            let keep = !nonce.is_stale(now, max_valid);
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }

    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.nonces.contains_key(value)
    }

    /// Pretend `value` was issued `age` ago
    #[cfg(test)]
    pub(crate) fn backdate(&self, value: &str, age: Duration) {
        if let Some(mut nonce) = self.nonces.get_mut(value) {
            if let Some(issued_at) = Instant::now().checked_sub(age) {
                nonce.issued_at = issued_at;
            }
        }
    }
}

/// Background task sweeping a [`NonceCache`] every `max_valid`.
///
/// The first sweep happens one period after start. The task is aborted by
/// [`stop`](NonceSweeper::stop) or when the sweeper is dropped.
#[derive(Debug)]
pub struct NonceSweeper {
    handle: JoinHandle<()>,
}

impl NonceSweeper {
    /// Spawn the sweep task on the current tokio runtime.
    ///
    /// # Errors
    /// `NoRuntime` outside a tokio runtime, `InvalidConfig` for a zero period.
    pub fn start(cache: Arc<NonceCache>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let period = cache.max_valid();

        if period.is_zero() {
            return Err(Error::InvalidConfig("nonce max-valid must not be zero".into()));
        }

        let handle = runtime.spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                debug!(removed, remaining = cache.len(), "swept nonce cache");
            }
        });

        Ok(Self { handle })
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for NonceSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
