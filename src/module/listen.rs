//! Long-poll listeners on the module bus.
//!
//! A listener that finds nothing new registers a waiter here and parks on a
//! oneshot channel. Appends wake matching waiters; a periodic decay pass
//! expires waiters whose owner stopped caring (deadline plus grace period).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message_log::MessageLog;
use super::types::{BroadcastPolicy, ModuleMessage};
use crate::{ModhostError, Result};

/// Why a waiter was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// A visible message was appended.
    Message,
    /// The waiter outlived its deadline and grace period.
    Expired,
}

struct Waiter {
    requester_uid: i64,
    since_id: i64,
    deadline: Instant,
    tx: oneshot::Sender<Wake>,
}

/// Set of parked listeners.
pub struct ListenRegistry {
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    policy: BroadcastPolicy,
    grace_period: Duration,
}

/// Removes its waiter from the registry when dropped.
pub struct WaiterGuard<'a> {
    registry: &'a ListenRegistry,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

impl ListenRegistry {
    pub fn new(policy: BroadcastPolicy, grace_period: Duration) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            policy,
            grace_period,
        }
    }

    /// Park a waiter until `deadline`.
    ///
    /// Runs a decay pass first so stale waiters never accumulate between
    /// background sweeps.
    pub fn register(
        &self,
        requester_uid: i64,
        since_id: i64,
        deadline: Instant,
    ) -> (WaiterGuard<'_>, oneshot::Receiver<Wake>) {
        self.decay();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id,
            Waiter {
                requester_uid,
                since_id,
                deadline,
                tx,
            },
        );

        (WaiterGuard { registry: self, id }, rx)
    }

    /// Remove a waiter. Returns false if it was already released.
    pub fn deregister(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Wake every waiter that can see `message`.
    pub fn notify(&self, message: &ModuleMessage) -> usize {
        let mut waiters = self.lock();
        let matching: Vec<u64> = waiters
            .iter()
            .filter(|(_, w)| {
                message.id > w.since_id
                    && self.policy.is_visible(message.receiver_uid, w.requester_uid)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &matching {
            if let Some(waiter) = waiters.remove(id) {
                // The listener may already be gone; nothing to do then
                let _ = waiter.tx.send(Wake::Message);
            }
        }

        matching.len()
    }

    /// Expire waiters past their deadline plus the grace period.
    pub fn decay(&self) -> usize {
        self.decay_at(Instant::now())
    }

    fn decay_at(&self, now: Instant) -> usize {
        let grace = self.grace_period;
        let mut waiters = self.lock();
        let expired: Vec<u64> = waiters
            .iter()
            .filter(|(_, w)| now > w.deadline + grace)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(waiter) = waiters.remove(id) {
                let _ = waiter.tx.send(Wake::Expired);
            }
        }

        if !expired.is_empty() {
            warn!(count = expired.len(), "Expired abandoned listeners");
        }
        expired.len()
    }

    /// Number of parked waiters.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait for messages visible to `requester_uid` with an id above `since_id`.
    ///
    /// Returns as soon as at least one such message exists, or an empty list
    /// once `timeout` elapses. Cancellation yields [`ModhostError::Cancelled`].
    /// The waiter is always removed before this returns.
    pub async fn listen(
        &self,
        log: &MessageLog,
        since_id: i64,
        requester_uid: i64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModuleMessage>> {
        let messages = log.after(since_id, requester_uid).await?;
        if !messages.is_empty() || timeout.is_zero() {
            return Ok(messages);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let (_guard, rx) = self.register(requester_uid, since_id, deadline);

            // An append may have landed between the last read and registration
            let messages = log.after(since_id, requester_uid).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(requester_uid, since_id, "Listen cancelled");
                    return Err(ModhostError::Cancelled);
                }
                wake = rx => match wake {
                    Ok(Wake::Message) => continue,
                    Ok(Wake::Expired) | Err(_) => return Ok(Vec::new()),
                },
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    /// Run [`decay`](Self::decay) every `interval` until the registry is dropped.
    pub fn spawn_decayer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        info!(interval_secs = interval.as_secs(), "Starting listener decayer");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.decay();
                    }
                    None => break,
                }
            }
            debug!("Listener decayer stopped");
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner())
    }
}
