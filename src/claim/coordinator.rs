//! Node-side view of the claim store.
//!
//! The coordinator binds a store to this node's id and lease settings,
//! retries transient contention with jittered exponential backoff and keeps
//! held claims alive from a background heartbeat task.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClaimConfig;
use crate::emit;
use crate::error::ClaimError;
use crate::metrics::events::{ClaimAttempted, ClaimOutcome, HeartbeatFailed, StaleClaimsSwept};

use super::{ClaimDecision, ClaimStoreRef, FileClaim};

/// Backoff for contended claim writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// `base * 2^attempt` plus up to one `base` of jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter = if base_ms > 0 {
            rand::rng().random_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

#[derive(Clone)]
pub struct ClaimCoordinator {
    store: ClaimStoreRef,
    node_id: String,
    ttl: Duration,
    heartbeat_interval: Duration,
    retry: RetryPolicy,
}

impl ClaimCoordinator {
    pub fn new(store: ClaimStoreRef, node_id: impl Into<String>, config: &ClaimConfig) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            ttl: config.ttl(),
            heartbeat_interval: config.heartbeat_interval(),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_backoff(),
            },
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the claim on `file_id`.
    ///
    /// `Denied` is a normal outcome. Contention is retried up to
    /// `max_retries` times before the error is returned.
    pub async fn try_claim(&self, file_id: &str) -> Result<ClaimDecision, ClaimError> {
        let mut attempt = 0;
        loop {
            match self
                .store
                .try_claim(file_id, &self.node_id, Utc::now(), self.ttl)
                .await
            {
                Ok(decision) => {
                    let outcome = match &decision {
                        ClaimDecision::Granted(_) => ClaimOutcome::Granted,
                        ClaimDecision::Denied { owner_node_id } => {
                            debug!(file_id, owner = %owner_node_id, "Claim held by another node");
                            ClaimOutcome::Denied
                        }
                        ClaimDecision::Completed { owner_node_id } => {
                            debug!(file_id, owner = %owner_node_id, "File already processed");
                            ClaimOutcome::Completed
                        }
                    };
                    emit!(ClaimAttempted { outcome });
                    return Ok(decision);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    emit!(ClaimAttempted {
                        outcome: ClaimOutcome::Contention
                    });
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        file_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Claim contended, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        emit!(ClaimAttempted {
                            outcome: ClaimOutcome::Contention
                        });
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn heartbeat(&self, file_id: &str) -> Result<FileClaim, ClaimError> {
        self.store
            .heartbeat(file_id, &self.node_id, Utc::now())
            .await
    }

    pub async fn release(&self, file_id: &str) -> Result<(), ClaimError> {
        self.store.release(file_id, &self.node_id).await
    }

    /// Mark a processed file done so no node claims it again.
    pub async fn complete(&self, file_id: &str) -> Result<(), ClaimError> {
        self.store.complete(file_id, &self.node_id).await
    }

    /// Demote expired claims so their files can be picked up again.
    pub async fn sweep_stale(&self) -> Result<Vec<String>, ClaimError> {
        let swept = self.store.sweep_stale(Utc::now(), self.ttl).await?;
        if !swept.is_empty() {
            info!("Swept {} stale claims: {:?}", swept.len(), swept);
            emit!(StaleClaimsSwept { count: swept.len() });
        }
        Ok(swept)
    }

    pub async fn claims(&self) -> Result<Vec<FileClaim>, ClaimError> {
        self.store.claims().await
    }

    /// Spawn a task that heartbeats `file_id` until the handle is dropped.
    pub fn start_heartbeat(&self, file_id: &str) -> HeartbeatHandle {
        let token = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        let coordinator = self.clone();
        let file_id = file_id.to_string();
        let task_token = token.clone();
        let task_lost = lost.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(coordinator.heartbeat_interval) => {}
                }

                match coordinator.heartbeat(&file_id).await {
                    Ok(_) => debug!(file_id = %file_id, "Claim heartbeat"),
                    Err(ClaimError::NotOwner { .. }) => {
                        warn!(file_id = %file_id, "Claim lost to another node");
                        emit!(HeartbeatFailed);
                        task_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        warn!(file_id = %file_id, "Heartbeat failed: {}", e);
                        emit!(HeartbeatFailed);
                    }
                }
            }
        });

        HeartbeatHandle { token, lost }
    }
}

/// Keeps a claim alive while held. Dropping it stops the heartbeats.
pub struct HeartbeatHandle {
    token: CancellationToken,
    lost: Arc<AtomicBool>,
}

impl HeartbeatHandle {
    /// True once a heartbeat found the claim owned by someone else.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{ClaimStatus, ClaimStore, MemoryClaimStore};

    fn coordinator(store: ClaimStoreRef, node: &str) -> ClaimCoordinator {
        let config = ClaimConfig {
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let mut coordinator = ClaimCoordinator::new(store, node, &config);
        coordinator.heartbeat_interval = Duration::from_millis(20);
        coordinator
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        let first = policy.delay_for_attempt(0);
        let third = policy.delay_for_attempt(2);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));

        let none = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
        };
        assert_eq!(none.delay_for_attempt(5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let store: ClaimStoreRef = Arc::new(MemoryClaimStore::new());
        let a = coordinator(store.clone(), "node-a");
        let b = coordinator(store.clone(), "node-b");

        assert!(a.try_claim("f").await.unwrap().is_granted());
        assert!(!b.try_claim("f").await.unwrap().is_granted());

        a.release("f").await.unwrap();
        assert!(b.try_claim("f").await.unwrap().is_granted());

        b.complete("f").await.unwrap();
        assert!(matches!(
            a.try_claim("f").await.unwrap(),
            ClaimDecision::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_task_extends_lease() {
        let store: ClaimStoreRef = Arc::new(MemoryClaimStore::new());
        let a = coordinator(store.clone(), "node-a");

        let ClaimDecision::Granted(claim) = a.try_claim("f").await.unwrap() else {
            panic!("claim should be granted");
        };

        let handle = a.start_heartbeat("f");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!handle.is_lost());
        drop(handle);

        let claims = store.claims().await.unwrap();
        assert!(claims[0].last_heartbeat_at > claim.last_heartbeat_at);
        assert_eq!(claims[0].status, ClaimStatus::Active);
    }

    #[tokio::test]
    async fn test_heartbeat_detects_lost_claim() {
        let store: ClaimStoreRef = Arc::new(MemoryClaimStore::new());
        let a = coordinator(store.clone(), "node-a");

        a.try_claim("f").await.unwrap();
        let handle = a.start_heartbeat("f");

        // Another node takes over after the lease expired.
        let later = Utc::now() + chrono::TimeDelta::seconds(301);
        store
            .try_claim("f", "node-b", later, a.ttl())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(handle.is_lost());
    }
}
