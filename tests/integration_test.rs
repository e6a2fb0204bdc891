//! Integration tests for tddf-ingest

use bytes::Bytes;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tddf_ingest::claim::{ClaimCoordinator, ClaimStatus, ClaimStoreRef, MemoryClaimStore};
use tddf_ingest::config::{ClaimConfig, CompressionFormat, SchedulerConfig};
use tddf_ingest::dedup::DedupEngine;
use tddf_ingest::record::{RawLine, RecordCounts, RecordType, classify_all};
use tddf_ingest::scheduler::{FileProcessor, Scheduler, SchedulerHandle};
use tddf_ingest::source::LineReader;
use tddf_ingest::storage::{StorageProvider, StorageProviderRef};
use tddf_ingest::store::{FileQueue, MemoryStore, NewFile, ResultStoreRef};

const MERCHANT: &str = "0000123456789012";

fn business_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

fn header(identifier: &str, sequence: usize) -> String {
    format!("{sequence:07}000001{:04}{identifier}0001", sequence % 10_000)
}

fn bh_line(sequence: usize) -> String {
    let mut line = header("BH", sequence);
    line.push_str(&format!("{MERCHANT:<16}"));
    line.push_str("ASSOC1GROUP10101");
    line.push_str("03012024");
    line.push_str("24061");
    line.push_str(&format!("{:015}", 125_000));
    line.push_str(&format!("{:<13}", "BATCH1"));
    line
}

fn dt_line(trace: &str, cents: i64, date: &str, merchant: &str) -> String {
    let mut line = header("DT", 1);
    line.push_str(&format!("{merchant:<16}"));
    line.push_str("ASSOC1GROUP10101");
    line.push_str("03012024");
    line.push_str("24061");
    line.push_str(&format!("{cents:015}"));
    line.push_str(&format!("{trace:<23}"));
    line.push_str(date);
    line.push_str(&format!("{cents:011}"));
    line.push('D');
    line.push_str(&format!("{:<19}", "4111111111111111"));
    line.push_str("A1B2C3");
    line.push_str("VS");
    line.push_str(&format!("{:<25}", "CORNER STORE"));
    line
}

fn raw_lines(file_id: &str, lines: &[String]) -> Vec<RawLine> {
    lines
        .iter()
        .enumerate()
        .map(|(i, content)| RawLine {
            file_id: file_id.to_string(),
            line_number: i as u64 + 1,
            content: Bytes::from(content.clone()),
            business_day: business_day(),
        })
        .collect()
}

/// A BH followed by `dts` distinct DT lines.
fn small_file(prefix: &str, dts: usize) -> Vec<String> {
    let mut lines = vec![bh_line(1)];
    lines.extend((0..dts).map(|i| dt_line(&format!("{prefix}{i}"), 100 + i as i64, "03012024", MERCHANT)));
    lines
}

async fn memory_storage(name: &str) -> StorageProviderRef {
    Arc::new(
        StorageProvider::for_url(&format!("memory://{name}/inbox"))
            .await
            .unwrap(),
    )
}

async fn stage_file(storage: &StorageProvider, store: &MemoryStore, file_id: &str, lines: &[String]) {
    storage
        .put(file_id, Bytes::from(lines.join("\n")))
        .await
        .unwrap();
    store
        .enqueue(NewFile {
            file_id: file_id.to_string(),
            business_day: business_day(),
            location: file_id.to_string(),
            raw_line_count: Some(lines.len() as u64),
        })
        .await
        .unwrap();
}

fn quick_claims() -> ClaimConfig {
    ClaimConfig {
        retry_backoff_ms: 1,
        ..Default::default()
    }
}

fn idle_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_secs: 3600,
        auto_discover: false,
        ..Default::default()
    }
}

/// A node wired against in-memory stores. `results` overrides the result
/// store the processor commits to.
fn node(
    storage: StorageProviderRef,
    store: Arc<MemoryStore>,
    results: ResultStoreRef,
    claims: ClaimCoordinator,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) -> (Scheduler, SchedulerHandle) {
    let processor = FileProcessor::new(
        storage,
        LineReader::new(CompressionFormat::None),
        results,
        DedupEngine::new(10),
    );
    Scheduler::new(config, store, claims, processor, shutdown)
}

mod classifier_tests {
    use super::*;

    #[test]
    fn test_mixed_file_counts_every_line() {
        let mut lines = Vec::new();
        lines.extend((0..80).map(|i| dt_line(&format!("T{i}"), 500, "01012024", MERCHANT)));
        lines.extend((0..10).map(bh_line));
        lines.extend((0..5).map(|i| format!("{}{}", header("ZZ", i), "X".repeat(60))));
        lines.extend((0..5).map(|i| header("DT", i)));

        let records = classify_all(&raw_lines("mixed.TSYSO", &lines));
        let counts = RecordCounts::tally(&records);

        assert_eq!(counts.processed_of(RecordType::DT), 80);
        assert_eq!(counts.processed_of(RecordType::BH), 10);
        assert_eq!(counts.processed_of(RecordType::Other), 5);
        assert_eq!(counts.total_skipped(), 5);
        assert_eq!(counts.skipped_of(RecordType::DT), 5);
        assert_eq!(counts.total_lines, 100);
        assert_eq!(records.len(), 100);
    }

    #[test]
    fn test_record_ids_are_stable() {
        let lines = small_file("S", 3);
        let first = classify_all(&raw_lines("f.TSYSO", &lines));
        let second = classify_all(&raw_lines("f.TSYSO", &lines));

        assert_eq!(first, second);
        assert_eq!(first[1].record_id, "f.TSYSO:2");
    }

    #[test]
    fn test_latin1_bytes_keep_field_positions() {
        let clean = dt_line("T1", 500, "01012024", MERCHANT);
        let mut accented = clean.clone().into_bytes();
        // Latin-1 bytes in association_number and merchant_name.
        accented[41] = 0xC9;
        accented[170] = 0xE9;

        let mut data = clean.clone().into_bytes();
        data.push(b'\n');
        data.extend_from_slice(&accented);
        data.extend_from_slice(b"\r\n");

        let lines = LineReader::new(CompressionFormat::None)
            .read(&Bytes::from(data), "latin1.TSYSO", business_day())
            .unwrap();
        let records = classify_all(&lines);

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].record_type, RecordType::DT);
        assert!(records[1].skip.is_none());
        assert_eq!(records[1].trace_number.as_deref(), Some("T1"));
        assert_eq!(records[1].merchant_account_number.as_deref(), Some(MERCHANT));
        let key = tddf_ingest::dedup::DuplicateKey::from_record(&records[1]);
        assert!(key.is_some());
        assert_eq!(key, tddf_ingest::dedup::DuplicateKey::from_record(&records[0]));
    }
}

mod dedup_tests {
    use super::*;
    use tddf_ingest::dedup::DtCandidate;
    use tddf_ingest::store::ResultStore;

    #[test]
    fn test_identical_transactions_form_one_group() {
        let lines = vec![
            dt_line("T1", 500, "01012024", "M1"),
            dt_line("T1", 500, "01012024", "M1"),
        ];
        let records = classify_all(&raw_lines("b.TSYSO", &lines));
        let candidates: Vec<DtCandidate> = records
            .iter()
            .filter_map(|r| DtCandidate::from_record(r, 1))
            .collect();

        let outcome = DedupEngine::new(10).resolve(&candidates, &[]);

        assert_eq!(outcome.kept, vec!["b.TSYSO:1".to_string()]);
        assert_eq!(outcome.duplicates.len(), 1);
        let group = &outcome.duplicates[0];
        assert_eq!(group.canonical_record_id, "b.TSYSO:1");
        assert_eq!(group.increments_applied, 1);
        assert_eq!(group.key.trace_number, "T1");
        assert_eq!(group.key.merchant_account, "M1");
    }

    #[tokio::test]
    async fn test_duplicates_across_files_keep_earliest() {
        let storage = memory_storage("dedup-across").await;
        let store = Arc::new(MemoryStore::new());
        let processor = FileProcessor::new(
            storage.clone(),
            LineReader::new(CompressionFormat::None),
            store.clone(),
            DedupEngine::new(10),
        );

        let shared = dt_line("SHARED", 999, "03012024", MERCHANT);
        stage_file(&storage, &store, "a.TSYSO", &[shared.clone()]).await;
        stage_file(&storage, &store, "b.TSYSO", &[shared]).await;

        for file in store.queued().await.unwrap() {
            processor.process(&file).await.unwrap();
        }

        let counters = store.counters().await.unwrap();
        assert_eq!(counters.duplicate_groups, 1);
        assert_eq!(counters.increments_applied, 1);

        let records = store.records("b.TSYSO").await.unwrap().unwrap();
        let key = tddf_ingest::dedup::DuplicateKey::from_record(&records[0]).unwrap();
        let group = store.duplicate_group(&key).await.unwrap().unwrap();
        assert_eq!(group.canonical_record_id, "a.TSYSO:1");
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let storage = memory_storage("dedup-reprocess").await;
        let store = Arc::new(MemoryStore::new());
        let processor = FileProcessor::new(
            storage.clone(),
            LineReader::new(CompressionFormat::None),
            store.clone(),
            DedupEngine::new(10),
        );

        let line = dt_line("T1", 500, "01012024", MERCHANT);
        stage_file(&storage, &store, "r.TSYSO", &[line.clone(), line]).await;
        let file = store.queued().await.unwrap().remove(0);

        processor.process(&file).await.unwrap();
        let first = store.counters().await.unwrap();
        processor.process(&file).await.unwrap();
        let second = store.counters().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.records.total_lines, 2);
        assert_eq!(second.increments_applied, 1);
    }
}

mod claim_tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use tddf_ingest::claim::{ClaimStore, DirectoryClaimStore};
    use tddf_ingest::store::ResultStore;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(300);

    async fn takeover_after_ttl(store: &dyn ClaimStore) {
        let t0 = Utc::now();
        assert!(store.try_claim("F", "node-a", t0, TTL).await.unwrap().is_granted());

        // Node A keeps heartbeating for a while, then goes quiet.
        let beat = t0 + TimeDelta::seconds(120);
        store.heartbeat("F", "node-a", beat).await.unwrap();
        let early = beat + TimeDelta::seconds(300);
        assert!(!store.try_claim("F", "node-b", early, TTL).await.unwrap().is_granted());

        let late = beat + TimeDelta::seconds(301);
        let decision = store.try_claim("F", "node-b", late, TTL).await.unwrap();
        assert!(decision.is_granted());

        let claims = store.claims().await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].owner_node_id, "node-b");

        // Node A wakes up and finds it lost the file.
        assert!(store.heartbeat("F", "node-a", late).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_claim_takeover_memory() {
        takeover_after_ttl(&MemoryClaimStore::new()).await;
    }

    #[tokio::test]
    async fn test_stale_claim_takeover_directory() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryClaimStore::open(dir.path()).await.unwrap();
        takeover_after_ttl(&store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_nodes_never_share_a_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        let mut tasks = Vec::new();
        for node in ["node-a", "node-b"] {
            let root = root.clone();
            tasks.push(tokio::spawn(async move {
                let store = Arc::new(DirectoryClaimStore::open(root).await.unwrap());
                let coordinator = ClaimCoordinator::new(store, node, &quick_claims());
                let mut granted = Vec::new();
                for i in 0..20 {
                    let file_id = format!("file-{i}");
                    if let Ok(decision) = coordinator.try_claim(&file_id).await
                        && decision.is_granted()
                    {
                        granted.push(file_id);
                    }
                }
                granted
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "a file was granted to both nodes");
    }

    /// Run one node until its first tick has finished, then stop it.
    async fn run_one_tick(
        storage: StorageProviderRef,
        store: Arc<MemoryStore>,
        claim_store: ClaimStoreRef,
        node_id: &str,
    ) -> u64 {
        let claims = ClaimCoordinator::new(claim_store, node_id, &quick_claims());
        let shutdown = CancellationToken::new();
        let (scheduler, handle) = node(
            storage,
            store.clone(),
            store,
            claims,
            idle_scheduler_config(),
            shutdown.clone(),
        );
        let task = tokio::spawn(scheduler.run());

        let mut run = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            run.wait_for(|r| r.last_run_at.is_some() && !r.is_running()),
        )
        .await
        .unwrap()
        .unwrap();
        shutdown.cancel();
        task.await.unwrap().unwrap();
        handle.snapshot().processed_file_count
    }

    #[tokio::test]
    async fn test_completed_file_not_reprocessed_by_next_node() {
        let dir = TempDir::new().unwrap();
        let storage = memory_storage("claims-sequential").await;
        let lines = small_file("F", 3);

        // Each node keeps its own queue; only the claim directory is shared.
        let mut processed = 0;
        let mut stores = Vec::new();
        for node_id in ["node-a", "node-b"] {
            let store = Arc::new(MemoryStore::new());
            stage_file(&storage, &store, "F.TSYSO", &lines).await;
            let claim_store = Arc::new(DirectoryClaimStore::open(dir.path()).await.unwrap());
            processed += run_one_tick(storage.clone(), store.clone(), claim_store, node_id).await;
            stores.push(store);
        }

        assert_eq!(processed, 1);
        assert!(stores[0].records("F.TSYSO").await.unwrap().is_some());
        assert!(stores[1].records("F.TSYSO").await.unwrap().is_none());
        // The second node dropped the file instead of retrying it every tick.
        assert_eq!(stores[1].stats().await.unwrap().queued_files, 0);

        let claims = DirectoryClaimStore::open(dir.path())
            .await
            .unwrap()
            .claims()
            .await
            .unwrap();
        assert_eq!(claims[0].owner_node_id, "node-a");
        assert_eq!(claims[0].status, ClaimStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_file_is_picked_up_by_next_node() {
        let dir = TempDir::new().unwrap();
        let storage = memory_storage("claims-failed-handoff").await;
        let lines = small_file("G", 2);

        // Node A cannot read the file; the object appears before node B runs.
        let store_a = Arc::new(MemoryStore::new());
        store_a
            .enqueue(NewFile {
                file_id: "G.TSYSO".to_string(),
                business_day: business_day(),
                location: "G.TSYSO".to_string(),
                raw_line_count: Some(lines.len() as u64),
            })
            .await
            .unwrap();
        let claim_store: ClaimStoreRef =
            Arc::new(DirectoryClaimStore::open(dir.path()).await.unwrap());
        let a = run_one_tick(storage.clone(), store_a.clone(), claim_store.clone(), "node-a").await;
        assert_eq!(a, 0);
        assert_eq!(store_a.stats().await.unwrap().files_with_errors, 1);

        let store_b = Arc::new(MemoryStore::new());
        stage_file(&storage, &store_b, "G.TSYSO", &lines).await;
        let b = run_one_tick(storage, store_b.clone(), claim_store, "node-b").await;
        assert_eq!(b, 1);
        assert!(store_b.records("G.TSYSO").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_nodes_process_each_file_once() {
        let storage = memory_storage("claims-concurrent").await;
        let store = Arc::new(MemoryStore::new());
        for i in 0..6 {
            let name = format!("c{i}.TSYSO");
            stage_file(&storage, &store, &name, &small_file(&name, 2)).await;
        }
        let claim_store: ClaimStoreRef = Arc::new(MemoryClaimStore::new());

        let mut nodes = Vec::new();
        for node_id in ["node-a", "node-b"] {
            let storage = storage.clone();
            let store = store.clone();
            let claim_store = claim_store.clone();
            nodes.push(tokio::spawn(async move {
                run_one_tick(storage, store, claim_store, node_id).await
            }));
        }

        let mut processed = 0;
        for node in nodes {
            processed += node.await.unwrap();
        }
        assert_eq!(processed, 6);
        assert_eq!(store.stats().await.unwrap().completed_files, 6);
    }
}

mod scheduler_tests {
    use super::*;
    use async_trait::async_trait;
    use tddf_ingest::dedup::{DtCandidate, DuplicateGroup, DuplicateKey};
    use tddf_ingest::config::ErrorHandlingConfig;
    use tddf_ingest::dlq::DeadLetterQueue;
    use tddf_ingest::error::StoreError;
    use tddf_ingest::record::ClassifiedRecord;
    use tddf_ingest::store::{CommitSummary, FileResult, ResultStore, StoreCounters};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Result store whose commits wait for the test to open the gate.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl ResultStore for GatedStore {
        async fn known_candidates(
            &self,
            batch: &[DtCandidate],
        ) -> Result<Vec<DtCandidate>, StoreError> {
            self.inner.known_candidates(batch).await
        }

        async fn commit(&self, result: FileResult) -> Result<CommitSummary, StoreError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.commit(result).await
        }

        async fn counters(&self) -> Result<StoreCounters, StoreError> {
            self.inner.counters().await
        }

        async fn records(
            &self,
            file_id: &str,
        ) -> Result<Option<Vec<ClassifiedRecord>>, StoreError> {
            self.inner.records(file_id).await
        }

        async fn duplicate_group(
            &self,
            key: &DuplicateKey,
        ) -> Result<Option<DuplicateGroup>, StoreError> {
            self.inner.duplicate_group(key).await
        }
    }

    #[tokio::test]
    async fn test_drains_queue_in_order() {
        let storage = memory_storage("sched-drain").await;
        let store = Arc::new(MemoryStore::new());
        for name in ["one.TSYSO", "two.TSYSO", "three.TSYSO"] {
            stage_file(&storage, &store, name, &small_file(name, 4)).await;
        }
        let claims = ClaimCoordinator::new(Arc::new(MemoryClaimStore::new()), "node-a", &quick_claims());
        let shutdown = CancellationToken::new();
        let (scheduler, handle) = node(
            storage,
            store.clone(),
            store.clone(),
            claims.clone(),
            idle_scheduler_config(),
            shutdown.clone(),
        );
        let task = tokio::spawn(scheduler.run());

        let mut run = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            run.wait_for(|r| r.processed_file_count == 3 && !r.is_running()),
        )
        .await
        .unwrap()
        .unwrap();

        let snapshot = handle.snapshot();
        assert!(snapshot.queued_file_ids.is_empty());
        assert!(snapshot.processing_errors.is_empty());
        assert!(snapshot.last_run_at.is_some());
        assert!(snapshot.current_transaction_range.is_some());
        assert_eq!(store.stats().await.unwrap().completed_files, 3);
        assert_eq!(store.stats().await.unwrap().pending_raw_lines, 0);

        // Every claim is settled as completed.
        let settled = claims.claims().await.unwrap();
        assert_eq!(settled.len(), 3);
        assert!(settled.iter().all(|c| c.status == ClaimStatus::Completed));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pause_waits_for_current_file() {
        let storage = memory_storage("sched-pause").await;
        let store = Arc::new(MemoryStore::new());
        stage_file(&storage, &store, "first.TSYSO", &small_file("A", 3)).await;
        stage_file(&storage, &store, "second.TSYSO", &small_file("B", 3)).await;

        let gated = Arc::new(GatedStore {
            inner: store.clone(),
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let claims = ClaimCoordinator::new(Arc::new(MemoryClaimStore::new()), "node-a", &quick_claims());
        let shutdown = CancellationToken::new();
        let (scheduler, handle) = node(
            storage,
            store.clone(),
            gated.clone(),
            claims.clone(),
            idle_scheduler_config(),
            shutdown.clone(),
        );
        let task = tokio::spawn(scheduler.run());

        // The first file is mid-processing when the pause arrives.
        tokio::time::timeout(Duration::from_secs(5), gated.entered.notified())
            .await
            .unwrap();
        assert_eq!(handle.snapshot().current_file_id.as_deref(), Some("first.TSYSO"));
        handle.pause().await.unwrap();
        assert!(!handle.snapshot().is_paused());
        gated.gate.notify_one();

        let mut run = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), run.wait_for(|r| r.is_paused()))
            .await
            .unwrap()
            .unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.processed_file_count, 1);
        assert!(!snapshot.is_running());
        assert_eq!(snapshot.current_file_id, None);

        // No claim was ever attempted for the second file.
        let claimed: Vec<String> = claims
            .claims()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.file_id)
            .collect();
        assert_eq!(claimed, vec!["first.TSYSO".to_string()]);
        let queued = store.queued().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].file_id, "second.TSYSO");

        // Triggers are ignored while paused; resume picks the queue back up.
        handle.trigger(Vec::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.snapshot().processed_file_count, 1);

        handle.resume().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), gated.entered.notified())
            .await
            .unwrap();
        gated.gate.notify_one();
        tokio::time::timeout(
            Duration::from_secs(5),
            run.wait_for(|r| r.processed_file_count == 2),
        )
        .await
        .unwrap()
        .unwrap();

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_trigger_processes_only_named_files() {
        let storage = memory_storage("sched-trigger").await;
        let store = Arc::new(MemoryStore::new());
        stage_file(&storage, &store, "a.TSYSO", &small_file("A", 2)).await;
        let claims = ClaimCoordinator::new(Arc::new(MemoryClaimStore::new()), "node-a", &quick_claims());
        let shutdown = CancellationToken::new();
        let (scheduler, handle) = node(
            storage.clone(),
            store.clone(),
            store.clone(),
            claims,
            idle_scheduler_config(),
            shutdown.clone(),
        );
        let task = tokio::spawn(scheduler.run());
        let mut run = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), run.wait_for(|r| r.processed_file_count == 1))
            .await
            .unwrap()
            .unwrap();

        stage_file(&storage, &store, "b.TSYSO", &small_file("B", 2)).await;
        stage_file(&storage, &store, "c.TSYSO", &small_file("C", 2)).await;
        handle.trigger(vec!["c.TSYSO".to_string()]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), run.wait_for(|r| r.processed_file_count == 2))
            .await
            .unwrap()
            .unwrap();

        let queued: Vec<String> = store
            .queued()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.file_id)
            .collect();
        assert_eq!(queued, vec!["b.TSYSO".to_string()]);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_file_retries_then_dead_letters() {
        let storage = memory_storage("sched-dlq").await;
        let store = Arc::new(MemoryStore::new());
        // Queued but never uploaded: every fetch fails.
        store
            .enqueue(NewFile {
                file_id: "missing.TSYSO".to_string(),
                business_day: business_day(),
                location: "missing.TSYSO".to_string(),
                raw_line_count: Some(10),
            })
            .await
            .unwrap();

        let dlq_dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::from_config(&ErrorHandlingConfig {
            dlq_path: Some(dlq_dir.path().to_str().unwrap().to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();
        let dlq = Arc::new(dlq);

        let claims = ClaimCoordinator::new(Arc::new(MemoryClaimStore::new()), "node-a", &quick_claims());
        let shutdown = CancellationToken::new();
        let config = SchedulerConfig {
            max_attempts: 2,
            ..idle_scheduler_config()
        };
        let (scheduler, handle) = node(
            storage,
            store.clone(),
            store.clone(),
            claims,
            config,
            shutdown.clone(),
        );
        let task = tokio::spawn(scheduler.with_dlq(dlq.clone()).run());
        let mut run = handle.subscribe();

        // First attempt on the initial tick.
        tokio::time::timeout(
            Duration::from_secs(5),
            run.wait_for(|r| r.processing_errors.contains_key("missing.TSYSO")),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), run.wait_for(|r| !r.is_running()))
            .await
            .unwrap()
            .unwrap();
        let file = store.get("missing.TSYSO").await.unwrap().unwrap();
        assert_eq!(file.attempts, 1);
        assert_eq!(store.queued().await.unwrap().len(), 1);

        // Second attempt exhausts the budget.
        handle.trigger(Vec::new()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.stats().await.unwrap().failed_files == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(store.queued().await.unwrap().is_empty());
        assert_eq!(dlq.stats().await.fetch, 1);
        let written: Vec<_> = std::fs::read_dir(dlq_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(written.len(), 1);
        let content = std::fs::read_to_string(written[0].path()).unwrap();
        assert!(content.contains("missing.TSYSO"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}

mod metrics_tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use tddf_ingest::config::MetricsConfig;
    use tddf_ingest::metrics::{MetricsAggregator, backlog_eta};

    #[test]
    fn test_backlog_eta_from_pending_lines() {
        assert_eq!(backlog_eta(600, 60.0, 1.0), "10m");
        assert_eq!(backlog_eta(0, 60.0, 1.0), "0");
    }

    #[test]
    fn test_aggregator_reports_backlog() {
        let mut aggregator = MetricsAggregator::new(&MetricsConfig::default());
        let t0 = Utc::now();
        let mut counts = RecordCounts::default();

        aggregator.sample(t0, &counts, 660);
        counts.processed.insert(RecordType::DT, 60);
        counts.total_lines = 60;
        let t1 = t0 + TimeDelta::seconds(60);
        aggregator.sample(t1, &counts, 600);

        let window = aggregator.status(t1);
        assert!(window.has_data);
        assert_eq!(window.records_per_minute, 60.0);
        assert_eq!(window.pending_raw_lines, 600);
        assert_eq!(window.backlog_eta, "10m");
    }
}

mod config_tests {
    use tddf_ingest::config::{ClaimBackend, Config};

    #[test]
    fn test_config_yaml_parsing() {
        let yaml = r#"
node:
  id: node-a

source:
  path: "s3://bucket/tddf/inbox"
  compression: gzip

claims:
  backend:
    type: directory
    path: /shared/claims
  ttl_secs: 120
  heartbeat_interval_secs: 30

sink:
  path: "/var/lib/tddf/exports"
"#;
        let config = Config::from_yaml(yaml, false).unwrap();

        assert_eq!(config.node.id, "node-a");
        assert_eq!(
            config.claims.backend,
            ClaimBackend::Directory {
                path: "/shared/claims".to_string()
            }
        );
        assert_eq!(config.claims.ttl_secs, 120);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.metrics.window_secs, 600);
        assert!(config.sink.is_some());
    }

    #[test]
    fn test_heartbeat_must_beat_ttl() {
        let yaml = r#"
node:
  id: node-a
source:
  path: /inbox
claims:
  ttl_secs: 60
  heartbeat_interval_secs: 60
"#;
        assert!(Config::from_yaml(yaml, false).is_err());
    }
}
