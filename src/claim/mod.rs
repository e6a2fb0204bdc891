//! File claim coordination.
//!
//! A claim is a lease: the owner keeps it alive with heartbeats, and a claim
//! whose last heartbeat is older than the TTL may be taken over by another
//! node. Stores guarantee that deciding and writing a claim is one atomic
//! step, so at most one node holds an active claim on a file.
//!
//! ```text
//! unclaimed ──claim──▶ active ──release──▶ released
//!                        │  │
//!                        │  └─complete─▶ completed
//!                        └─ttl expires─▶ stale
//! released | stale ──claim──▶ active
//! ```
//!
//! `completed` is terminal: the row records that the file was processed, so
//! nodes with their own queues never pick it up again.

mod coordinator;
mod directory;
mod memory;

pub use coordinator::{ClaimCoordinator, HeartbeatHandle, RetryPolicy};
pub use directory::DirectoryClaimStore;
pub use memory::MemoryClaimStore;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ClaimError;

pub type ClaimStoreRef = Arc<dyn ClaimStore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Active,
    Released,
    Stale,
    /// Processed successfully. Never granted again.
    Completed,
}

/// Ownership record for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileClaim {
    pub file_id: String,
    pub owner_node_id: String,
    pub claimed_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: ClaimStatus,
}

impl FileClaim {
    pub fn new(file_id: &str, node_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            file_id: file_id.to_string(),
            owner_node_id: node_id.to_string(),
            claimed_at: now,
            last_heartbeat_at: now,
            status: ClaimStatus::Active,
        }
    }

    /// True once the last heartbeat is older than `ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.last_heartbeat_at) > ttl
    }

    /// Whether `node_id` may take this claim now.
    pub fn is_claimable_by(&self, node_id: &str, now: DateTime<Utc>, ttl: Duration) -> bool {
        match self.status {
            ClaimStatus::Completed => false,
            ClaimStatus::Released | ClaimStatus::Stale => true,
            ClaimStatus::Active => self.owner_node_id == node_id || self.is_expired(now, ttl),
        }
    }

    /// The decision for a caller that may not take this claim.
    pub fn refusal(&self) -> ClaimDecision {
        if self.status == ClaimStatus::Completed {
            ClaimDecision::Completed {
                owner_node_id: self.owner_node_id.clone(),
            }
        } else {
            ClaimDecision::Denied {
                owner_node_id: self.owner_node_id.clone(),
            }
        }
    }

    pub fn is_active_owner(&self, node_id: &str) -> bool {
        self.status == ClaimStatus::Active && self.owner_node_id == node_id
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    Granted(FileClaim),
    /// Another node holds a live claim.
    Denied { owner_node_id: String },
    /// The file was already processed by `owner_node_id`.
    Completed { owner_node_id: String },
}

impl ClaimDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimDecision::Granted(_))
    }
}

/// Shared storage of claim rows. Every method is atomic per file.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Grant the claim when the file is unclaimed, released, stale, expired
    /// or already owned by `node_id`.
    async fn try_claim(
        &self,
        file_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimDecision, ClaimError>;

    /// Extend the lease. Fails with `NotOwner` if `node_id` lost it.
    async fn heartbeat(
        &self,
        file_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FileClaim, ClaimError>;

    /// Give the claim up. Releasing an already released claim is a no-op.
    async fn release(&self, file_id: &str, node_id: &str) -> Result<(), ClaimError>;

    /// Record that `node_id` processed the file. Fails with `NotOwner`
    /// unless `node_id` holds the active claim. Completing twice is a no-op.
    async fn complete(&self, file_id: &str, node_id: &str) -> Result<(), ClaimError>;

    /// Demote every expired active claim to stale and return their file ids.
    async fn sweep_stale(&self, now: DateTime<Utc>, ttl: Duration)
    -> Result<Vec<String>, ClaimError>;

    /// Snapshot of all claim rows.
    async fn claims(&self) -> Result<Vec<FileClaim>, ClaimError>;
}
