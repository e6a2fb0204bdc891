//! Claim store shared through a directory.
//!
//! Every file gets a `<id>.claim` JSON lease. Mutations happen under a
//! `<id>.lock` guard created with `create_new`, and leases are replaced by
//! rename, so any number of processes can share one directory on a
//! filesystem with atomic create and rename.
//!
//! Each guard holds a random token. A guard left behind by a crashed writer
//! is only removed by the node that creates the `<id>.lock.takeover-<token>`
//! marker for that exact token, and only while the guard still carries it.
//! A node that dies between creating the marker and removing the guard
//! leaves the guard in place until an operator deletes both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use snafu::prelude::*;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{ClaimError, ClaimIoSnafu, ClaimSerdeSnafu, ContentionSnafu, NotOwnerSnafu};

use super::{ClaimDecision, ClaimStatus, ClaimStore, FileClaim};

const LEASE_SUFFIX: &str = ".claim";
const GUARD_SUFFIX: &str = ".lock";
const TAKEOVER_INFIX: &str = ".takeover-";

/// A guard older than this was left behind by a crashed writer.
const GUARD_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DirectoryClaimStore {
    root: PathBuf,
}

/// Removes the guard (or takeover marker) file when dropped.
struct GuardFile {
    path: PathBuf,
}

/// What an existing guard file says about its holder.
#[derive(Debug, PartialEq, Eq)]
enum GuardState {
    Held,
    /// Removed since the failed create; worth another attempt.
    Vanished,
    /// Older than [`GUARD_STALE_AFTER`]; carries this token.
    Abandoned(String),
}

fn guard_token() -> String {
    format!("{}-{:016x}", std::process::id(), rand::rng().random::<u64>())
}

impl Drop for GuardFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove claim guard {}: {}", self.path.display(), e);
        }
    }
}

fn encode_file_id(file_id: &str) -> String {
    let mut encoded = String::with_capacity(file_id.len());
    for b in file_id.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

fn io_context(path: &Path) -> ClaimIoSnafu<String> {
    ClaimIoSnafu {
        path: path.display().to_string(),
    }
}

impl DirectoryClaimStore {
    /// Open (and create if needed) a claim directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ClaimError> {
        let root = root.into();
        fs::create_dir_all(&root).await.context(io_context(&root))?;
        Ok(Self { root })
    }

    fn lease_path(&self, file_id: &str) -> PathBuf {
        self.root
            .join(format!("{}{LEASE_SUFFIX}", encode_file_id(file_id)))
    }

    fn guard_path(&self, file_id: &str) -> PathBuf {
        self.root
            .join(format!("{}{GUARD_SUFFIX}", encode_file_id(file_id)))
    }

    async fn lock(&self, file_id: &str) -> Result<GuardFile, ClaimError> {
        let path = self.guard_path(file_id);
        for _ in 0..2 {
            match create_exclusive(&path, &guard_token()).await {
                Ok(guard) => return Ok(guard),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match inspect_guard(&path).await.context(io_context(&path))? {
                        GuardState::Held => return ContentionSnafu { file_id }.fail(),
                        GuardState::Vanished => {}
                        GuardState::Abandoned(token) => {
                            remove_abandoned_guard(file_id, &path, &token).await?;
                        }
                    }
                }
                Err(e) => return Err(e).context(io_context(&path)),
            }
        }
        ContentionSnafu { file_id }.fail()
    }

    async fn read_lease(&self, path: &Path) -> Result<Option<FileClaim>, ClaimError> {
        match fs::read(path).await {
            Ok(bytes) => {
                let claim: FileClaim = serde_json::from_slice(&bytes).context(ClaimSerdeSnafu {
                    file_id: path.display().to_string(),
                })?;
                Ok(Some(claim))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(io_context(path)),
        }
    }

    async fn read_claim(&self, file_id: &str) -> Result<Option<FileClaim>, ClaimError> {
        self.read_lease(&self.lease_path(file_id)).await
    }

    /// Replace the lease atomically. Callers hold the guard.
    async fn write_claim(&self, claim: &FileClaim) -> Result<(), ClaimError> {
        let path = self.lease_path(&claim.file_id);
        let tmp = path.with_extension("claim.tmp");
        let json = serde_json::to_vec_pretty(claim).context(ClaimSerdeSnafu {
            file_id: claim.file_id.clone(),
        })?;
        fs::write(&tmp, json).await.context(io_context(&tmp))?;
        fs::rename(&tmp, &path).await.context(io_context(&path))?;
        Ok(())
    }

    async fn lease_files(&self) -> Result<Vec<PathBuf>, ClaimError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .context(io_context(&self.root))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(io_context(&self.root))?
        {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(LEASE_SUFFIX))
            {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Create `path` with `create_new` and write `token` into it.
async fn create_exclusive(path: &Path, token: &str) -> std::io::Result<GuardFile> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let guard = GuardFile {
        path: path.to_path_buf(),
    };
    file.write_all(token.as_bytes()).await?;
    file.flush().await?;
    Ok(guard)
}

async fn read_guard_token(path: &Path) -> std::io::Result<Option<String>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn inspect_guard(path: &Path) -> std::io::Result<GuardState> {
    let modified = match fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(GuardState::Vanished),
        Err(e) => return Err(e),
    };
    let abandoned = modified
        .elapsed()
        .is_ok_and(|age| age > GUARD_STALE_AFTER);
    if !abandoned {
        return Ok(GuardState::Held);
    }
    Ok(match read_guard_token(path).await? {
        Some(token) => GuardState::Abandoned(token),
        None => GuardState::Vanished,
    })
}

fn takeover_path(guard: &Path, token: &str) -> PathBuf {
    let token = if token.is_empty() {
        "empty".to_string()
    } else {
        encode_file_id(token)
    };
    let mut name = guard.as_os_str().to_os_string();
    name.push(format!("{TAKEOVER_INFIX}{token}"));
    PathBuf::from(name)
}

/// Remove the guard carrying `token`, unless another node is already doing so
/// or the guard has been replaced since it was inspected.
async fn remove_abandoned_guard(
    file_id: &str,
    guard: &Path,
    token: &str,
) -> Result<(), ClaimError> {
    let marker_path = takeover_path(guard, token);
    let _marker = match create_exclusive(&marker_path, token).await {
        Ok(marker) => marker,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!(file_id, "Abandoned claim guard is being taken over elsewhere");
            return Ok(());
        }
        Err(e) => return Err(e).context(io_context(&marker_path)),
    };

    if read_guard_token(guard).await.context(io_context(guard))?.as_deref() != Some(token) {
        return Ok(());
    }
    warn!(file_id, "Removing abandoned claim guard {}", guard.display());
    match fs::remove_file(guard).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e).context(io_context(guard)),
        _ => Ok(()),
    }
}

#[async_trait]
impl ClaimStore for DirectoryClaimStore {
    async fn try_claim(
        &self,
        file_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimDecision, ClaimError> {
        let _guard = self.lock(file_id).await?;

        if let Some(existing) = self.read_claim(file_id).await?
            && !existing.is_claimable_by(node_id, now, ttl)
        {
            return Ok(existing.refusal());
        }

        let claim = FileClaim::new(file_id, node_id, now);
        self.write_claim(&claim).await?;
        Ok(ClaimDecision::Granted(claim))
    }

    async fn heartbeat(
        &self,
        file_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FileClaim, ClaimError> {
        let _guard = self.lock(file_id).await?;

        match self.read_claim(file_id).await? {
            Some(mut claim) if claim.is_active_owner(node_id) => {
                claim.last_heartbeat_at = now;
                self.write_claim(&claim).await?;
                Ok(claim)
            }
            _ => NotOwnerSnafu { file_id, node_id }.fail(),
        }
    }

    async fn release(&self, file_id: &str, node_id: &str) -> Result<(), ClaimError> {
        let _guard = self.lock(file_id).await?;

        match self.read_claim(file_id).await? {
            Some(mut claim) if claim.owner_node_id == node_id => {
                if claim.status == ClaimStatus::Active {
                    claim.status = ClaimStatus::Released;
                    self.write_claim(&claim).await?;
                }
                Ok(())
            }
            _ => NotOwnerSnafu { file_id, node_id }.fail(),
        }
    }

    async fn complete(&self, file_id: &str, node_id: &str) -> Result<(), ClaimError> {
        let _guard = self.lock(file_id).await?;

        match self.read_claim(file_id).await? {
            Some(claim)
                if claim.owner_node_id == node_id && claim.status == ClaimStatus::Completed =>
            {
                Ok(())
            }
            Some(mut claim) if claim.is_active_owner(node_id) => {
                claim.status = ClaimStatus::Completed;
                self.write_claim(&claim).await
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

        for path in self.lease_files().await? {
            let Some(candidate) = self.read_lease(&path).await? else {
                continue;
            };
            if candidate.status != ClaimStatus::Active || !candidate.is_expired(now, ttl) {
                continue;
            }

            let _guard = match self.lock(&candidate.file_id).await {
                Ok(guard) => guard,
                Err(ClaimError::Contention { .. }) => {
                    debug!(file_id = %candidate.file_id, "Skipping sweep of busy claim");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Re-read under the guard; a heartbeat may have landed meanwhile.
            if let Some(mut claim) = self.read_claim(&candidate.file_id).await?
                && claim.status == ClaimStatus::Active
                && claim.is_expired(now, ttl)
            {
                claim.status = ClaimStatus::Stale;
                self.write_claim(&claim).await?;
                swept.push(claim.file_id);
            }
        }

        swept.sort();
        Ok(swept)
    }

    async fn claims(&self) -> Result<Vec<FileClaim>, ClaimError> {
        let mut claims = Vec::new();
        for path in self.lease_files().await? {
            if let Some(claim) = self.read_lease(&path).await? {
                claims.push(claim);
            }
        }
        claims.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::sync::Arc;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_encode_file_id() {
        assert_eq!(encode_file_id("inbox/A_0301.TSYSO"), "inbox%2FA_0301.TSYSO");
        assert_eq!(encode_file_id("a b%"), "a%20b%25");
    }

    #[tokio::test]
    async fn test_lease_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let t0 = Utc::now();

        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();
        assert!(
            store
                .try_claim("inbox/f1", "a", t0, TTL)
                .await
                .unwrap()
                .is_granted()
        );

        let reopened = DirectoryClaimStore::open(dir.path()).await.unwrap();
        assert!(
            !reopened
                .try_claim("inbox/f1", "b", t0, TTL)
                .await
                .unwrap()
                .is_granted()
        );

        let claims = reopened.claims().await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].file_id, "inbox/f1");
        assert_eq!(claims[0].owner_node_id, "a");
    }

    #[tokio::test]
    async fn test_stale_takeover_and_lost_heartbeat() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();
        let t0 = Utc::now();

        store.try_claim("f", "a", t0, TTL).await.unwrap();
        let later = t0 + TimeDelta::seconds(301);

        assert_eq!(store.sweep_stale(later, TTL).await.unwrap(), vec!["f"]);
        assert!(store.try_claim("f", "b", later, TTL).await.unwrap().is_granted());
        assert!(matches!(
            store.heartbeat("f", "a", later).await.unwrap_err(),
            ClaimError::NotOwner { .. }
        ));
        store.heartbeat("f", "b", later).await.unwrap();
    }

    #[tokio::test]
    async fn test_held_guard_reports_contention() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();

        let _held = store.lock("f").await.unwrap();
        let err = store
            .try_claim("f", "a", Utc::now(), TTL)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_guard_removed_after_claim() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();
        store.try_claim("f", "a", Utc::now(), TTL).await.unwrap();

        assert!(!store.guard_path("f").exists());
        assert!(store.lease_path("f").exists());
    }

    /// Leave a guard behind as a crashed writer would.
    fn plant_abandoned_guard(store: &DirectoryClaimStore, file_id: &str, token: &str) {
        let path = store.guard_path(file_id);
        std::fs::write(&path, token).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();
    }

    fn leftover_markers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().into_string().ok())
            .filter(|name| name.contains(TAKEOVER_INFIX))
            .collect()
    }

    #[tokio::test]
    async fn test_completed_lease_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let t0 = Utc::now();

        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();
        store.try_claim("f", "a", t0, TTL).await.unwrap();
        store.complete("f", "a").await.unwrap();
        store.release("f", "a").await.unwrap();

        let reopened = DirectoryClaimStore::open(dir.path()).await.unwrap();
        let later = t0 + TimeDelta::seconds(3600);
        assert_eq!(
            reopened.try_claim("f", "b", later, TTL).await.unwrap(),
            ClaimDecision::Completed {
                owner_node_id: "a".to_string()
            }
        );
        assert!(reopened.sweep_stale(later, TTL).await.unwrap().is_empty());
        assert_eq!(reopened.claims().await.unwrap()[0].status, ClaimStatus::Completed);
    }

    #[tokio::test]
    async fn test_abandoned_guard_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();
        plant_abandoned_guard(&store, "f", "crashed-node");

        assert!(store.try_claim("f", "a", Utc::now(), TTL).await.unwrap().is_granted());
        assert!(!store.guard_path("f").exists());
        assert!(leftover_markers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_takeover_in_progress_reports_contention() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();
        plant_abandoned_guard(&store, "f", "crashed-node");
        let marker = takeover_path(&store.guard_path("f"), "crashed-node");
        std::fs::write(&marker, "other").unwrap();

        let err = store
            .try_claim("f", "a", Utc::now(), TTL)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            std::fs::read_to_string(store.guard_path("f")).unwrap(),
            "crashed-node"
        );
    }

    #[tokio::test]
    async fn test_replaced_guard_is_not_removed() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();
        let path = store.guard_path("f");
        std::fs::write(&path, "fresh-holder").unwrap();

        // A node that inspected an older guard must leave the new one alone.
        remove_abandoned_guard("f", &path, "crashed-node").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh-holder");
        assert!(leftover_markers(dir.path()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_takeovers_grant_exactly_one() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DirectoryClaimStore::open(dir.path()).await.unwrap());
        plant_abandoned_guard(&store, "contested", "crashed-node");
        let now = Utc::now();

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_claim("contested", &format!("node-{n}"), now, TTL)
                    .await
            }));
        }

        let mut granted = Vec::new();
        for handle in handles {
            if let Ok(ClaimDecision::Granted(claim)) = handle.await.unwrap() {
                granted.push(claim.owner_node_id);
            }
        }
        assert_eq!(granted.len(), 1);

        let claims = store.claims().await.unwrap();
        assert_eq!(claims[0].owner_node_id, granted[0]);
        assert!(leftover_markers(dir.path()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_grant_exactly_one() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DirectoryClaimStore::open(dir.path()).await.unwrap());
        let now = Utc::now();

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_claim("contested", &format!("node-{n}"), now, TTL)
                    .await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if let Ok(decision) = handle.await.unwrap()
                && decision.is_granted()
            {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }
}
