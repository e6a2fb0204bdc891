//! Process-local claim store.
//!
//! Rows live in a `DashMap`; the entry API holds the shard lock while a
//! claim is decided and written. Nodes sharing one `Arc` are coordinated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;

use crate::error::{ClaimError, NotOwnerSnafu};

use super::{ClaimDecision, ClaimStatus, ClaimStore, FileClaim};

#[derive(Debug, Default)]
pub struct MemoryClaimStore {
    claims: DashMap<String, FileClaim>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn try_claim(
        &self,
        file_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimDecision, ClaimError> {
        match self.claims.entry(file_id.to_string()) {
            Entry::Vacant(entry) => {
                let claim = FileClaim::new(file_id, node_id, now);
                entry.insert(claim.clone());
                Ok(ClaimDecision::Granted(claim))
            }
            Entry::Occupied(mut entry) => {
                if entry.get().is_claimable_by(node_id, now, ttl) {
                    let claim = FileClaim::new(file_id, node_id, now);
                    entry.insert(claim.clone());
                    Ok(ClaimDecision::Granted(claim))
                } else {
                    Ok(entry.get().refusal())
                }
            }
        }
    }

    async fn heartbeat(
        &self,
        file_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FileClaim, ClaimError> {
        match self.claims.get_mut(file_id) {
            Some(mut claim) if claim.is_active_owner(node_id) => {
                claim.last_heartbeat_at = now;
                Ok(claim.clone())
            }
            _ => NotOwnerSnafu { file_id, node_id }.fail(),
        }
    }

    async fn release(&self, file_id: &str, node_id: &str) -> Result<(), ClaimError> {
        match self.claims.get_mut(file_id) {
            Some(mut claim) if claim.owner_node_id == node_id => {
                if claim.status == ClaimStatus::Active {
                    claim.status = ClaimStatus::Released;
                }
                Ok(())
            }
            _ => NotOwnerSnafu { file_id, node_id }.fail(),
        }
    }

    async fn complete(&self, file_id: &str, node_id: &str) -> Result<(), ClaimError> {
        match self.claims.get_mut(file_id) {
            Some(claim)
                if claim.owner_node_id == node_id && claim.status == ClaimStatus::Completed =>
            {
                Ok(())
            }
            Some(mut claim) if claim.is_active_owner(node_id) => {
                claim.status = ClaimStatus::Completed;
                Ok(())
            }
            _ => NotOwnerSnafu { file_id, node_id }.fail(),
        }
    }

    async fn sweep_stale(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<String>, ClaimError> {
        let mut swept = Vec::new();
        for mut claim in self.claims.iter_mut() {
            if claim.status == ClaimStatus::Active && claim.is_expired(now, ttl) {
                claim.status = ClaimStatus::Stale;
                swept.push(claim.file_id.clone());
            }
        }
        swept.sort();
        Ok(swept)
    }

    async fn claims(&self) -> Result<Vec<FileClaim>, ClaimError> {
        let mut claims: Vec<FileClaim> = self.claims.iter().map(|c| c.value().clone()).collect();
        claims.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(claims)
    }
}
