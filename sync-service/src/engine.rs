//! Per-invocation sync state machine.
//!
//! `Idle -> Comparing -> Applying -> Completed | Cancelled | Failed`. One run
//! at a time per engine; a cancelled or failed run is retried with a fresh
//! comparison, never resumed.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use meter_store::LocalStore;
use serde::Deserialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    error::SyncError,
    executor::{BatchConfig, BatchOutcome, ItemFailure, Progress, SyncExecutor},
    reconcile::{self, Comparison, ReconcileConfig, SyncItem},
    remote::{DocumentApi, RemoteClient},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Idle,
    Comparing,
    Applying,
    Completed,
    Cancelled,
    Failed,
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    Upload,
    Download,
    Full,
}

impl SyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Full => "full",
        }
    }

    fn uploads(&self) -> bool {
        matches!(self, Self::Upload | Self::Full)
    }

    fn downloads(&self) -> bool {
        matches!(self, Self::Download | Self::Full)
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            "full" => Ok(Self::Full),
            other => Err(SyncError::Config(format!("unknown sync policy '{other}'"))),
        }
    }
}

/// Which side wins for items classified as conflicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    PreferLocal,
    PreferRemote,
    Skip,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reconcile: ReconcileConfig,
    pub batch: BatchConfig,
    pub conflict_resolution: ConflictResolution,
    pub dedupe_before_compare: bool,
}

impl EngineConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            reconcile: ReconcileConfig::new(owner_id),
            batch: BatchConfig::default(),
            conflict_resolution: ConflictResolution::default(),
            dedupe_before_compare: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub policy: SyncPolicy,
    pub phase: SyncPhase,
    /// Bucket sizes of the comparison the run acted on.
    pub counts: BTreeMap<&'static str, usize>,
    pub complete: bool,
    pub duplicates_removed: usize,
    pub deletions: Option<BatchOutcome>,
    pub upload: Option<BatchOutcome>,
    pub download: Option<BatchOutcome>,
    /// Change-log entries settled by this run.
    pub settled: u64,
    pub duration: Duration,
}

impl SyncReport {
    fn new(policy: SyncPolicy) -> Self {
        Self {
            policy,
            phase: SyncPhase::Idle,
            counts: BTreeMap::new(),
            complete: true,
            duplicates_removed: 0,
            deletions: None,
            upload: None,
            download: None,
            settled: 0,
            duration: Duration::ZERO,
        }
    }

    fn outcomes(&self) -> impl Iterator<Item = &BatchOutcome> {
        [&self.deletions, &self.upload, &self.download]
            .into_iter()
            .filter_map(Option::as_ref)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemFailure> {
        self.outcomes().flat_map(|o| o.failures.iter())
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes().map(|o| o.success_count).sum()
    }

    pub fn failed(&self) -> usize {
        self.outcomes().map(|o| o.failed_count).sum()
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "{} sync {:?}: {} succeeded, {} failed",
            self.policy,
            self.phase,
            self.succeeded(),
            self.failed()
        )];
        if let Some(o) = &self.deletions {
            lines.push(format!("  deletions: {}", o.summary()));
        }
        if let Some(o) = &self.upload {
            lines.push(format!("  upload: {}", o.summary()));
        }
        if let Some(o) = &self.download {
            lines.push(format!("  download: {}", o.summary()));
        }
        if self.duplicates_removed > 0 {
            lines.push(format!("  duplicate meters removed: {}", self.duplicates_removed));
        }
        if !self.complete {
            lines.push("  comparison was incomplete; run again to pick up the rest".to_string());
        }
        lines.join("\n")
    }
}

/// Held for the duration of a run; releases the single-run flag on drop.
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self, SyncError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::AlreadyRunning)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine<A> {
    store: LocalStore,
    remote: Arc<RemoteClient<A>>,
    config: Arc<EngineConfig>,
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    phase: Arc<watch::Sender<SyncPhase>>,
    progress: Option<mpsc::Sender<Progress>>,
}

impl<A> Clone for SyncEngine<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            remote: self.remote.clone(),
            config: self.config.clone(),
            running: self.running.clone(),
            cancel: self.cancel.clone(),
            phase: self.phase.clone(),
            progress: self.progress.clone(),
        }
    }
}

impl<A: DocumentApi + 'static> SyncEngine<A> {
    pub fn new(store: LocalStore, remote: RemoteClient<A>, config: EngineConfig) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            store,
            remote: Arc::new(remote),
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            phase: Arc::new(phase),
            progress: None,
        }
    }

    /// Send per-item progress events to `tx`. Events are dropped when the
    /// channel is full.
    pub fn with_progress(mut self, tx: mpsc::Sender<Progress>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn remote(&self) -> &RemoteClient<A> {
        &self.remote
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the current run to stop. Items already in flight finish; the rest
    /// are reported as skipped. A cancel issued while no run is active applies
    /// to the next one.
    pub fn cancel(&self) {
        tracing::info!("sync cancellation requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn set_phase(&self, phase: SyncPhase) {
        tracing::debug!(?phase, "sync phase");
        self.phase.send_replace(phase);
    }

    fn executor(&self) -> SyncExecutor<A> {
        let executor = SyncExecutor::new(
            self.store.clone(),
            self.remote.clone(),
            self.config.reconcile.owner_id.clone(),
            self.config.batch.clone(),
        )
        .with_tolerance(self.config.reconcile.reading_tolerance)
        .with_cancel_flag(self.cancel.clone());

        match &self.progress {
            Some(tx) => executor.with_progress(tx.clone()),
            None => executor,
        }
    }

    pub async fn compare_databases(&self) -> Result<Comparison, SyncError> {
        Ok(reconcile::reconcile(&self.store, &self.remote, &self.config.reconcile).await?)
    }

    /// Upload `items` and settle the change-log entries of everything applied.
    pub async fn sync_local_to_server(&self, items: &[SyncItem]) -> Result<BatchOutcome, SyncError> {
        let outcome = self.executor().push_to_remote(items).await;
        self.store.mark_settled(&outcome.settled_ids).await?;
        Ok(outcome)
    }

    /// Download `items` into the local store. Inserted records originate
    /// remotely, so their change-log entries are settled right away.
    pub async fn sync_server_to_local(&self, items: &[SyncItem]) -> Result<BatchOutcome, SyncError> {
        let outcome = self.executor().pull_to_local(items).await?;
        self.store.mark_settled(&outcome.settled_ids).await?;
        Ok(outcome)
    }

    pub fn sync_summary(&self, comparison: &Comparison) -> String {
        reconcile::sync_summary(comparison)
    }

    fn upload_items(&self, comparison: &Comparison) -> Vec<SyncItem> {
        let mut items: Vec<SyncItem> = comparison
            .local_only
            .iter()
            .chain(&comparison.local_newer)
            .cloned()
            .collect();
        if self.config.conflict_resolution == ConflictResolution::PreferLocal {
            items.extend(comparison.conflicting.iter().cloned());
        }
        items
    }

    /// Items to pull, minus records this run just deleted or rewrote
    /// remotely. A reading moved to another day or a renamed meter still shows
    /// up under its old key in the pre-run comparison.
    fn download_items(&self, comparison: &Comparison, superseded: &HashSet<&str>) -> Vec<SyncItem> {
        let mut items: Vec<SyncItem> = comparison
            .remote_only
            .iter()
            .chain(&comparison.remote_newer)
            .cloned()
            .collect();
        if self.config.conflict_resolution == ConflictResolution::PreferRemote {
            items.extend(comparison.conflicting.iter().cloned());
        }
        items.retain(|item| match item {
            SyncItem::Reading { remote: Some(r), .. } => !superseded.contains(r.id.as_str()),
            SyncItem::Meter { remote: Some(m), .. } => !superseded.contains(m.id.as_str()),
            _ => true,
        });
        items
    }

    /// Run one full sync under `policy`. Rejected with
    /// [`SyncError::AlreadyRunning`] while another run is active.
    pub async fn run(&self, policy: SyncPolicy) -> Result<SyncReport, SyncError> {
        let _guard = RunGuard::acquire(&self.running)?;

        let started = Instant::now();
        metrics::counter!("sync_runs_total", "policy" => policy.as_str()).increment(1);
        tracing::info!(%policy, "sync run started");

        let result = self.execute(policy, started).await;
        // Cleared once the run is over, so a cancel issued before it started
        // still applies to it.
        self.cancel.store(false, Ordering::SeqCst);
        metrics::histogram!("sync_run_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                self.set_phase(report.phase);
                tracing::info!(
                    %policy,
                    phase = ?report.phase,
                    succeeded = report.succeeded(),
                    failed = report.failed(),
                    settled = report.settled,
                    "sync run finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                tracing::error!(%policy, error = %e, "sync run failed");
                Err(e)
            }
        }
    }

    /// Run on a background task.
    pub fn spawn(&self, policy: SyncPolicy) -> JoinHandle<Result<SyncReport, SyncError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(policy).await })
    }

    async fn execute(&self, policy: SyncPolicy, started: Instant) -> Result<SyncReport, SyncError> {
        let owner_id = &self.config.reconcile.owner_id;
        let mut report = SyncReport::new(policy);

        if self.config.dedupe_before_compare {
            report.duplicates_removed = self.store.remove_duplicate_meters(owner_id).await?;
        }

        self.set_phase(SyncPhase::Comparing);
        let comparison = self.compare_databases().await?;
        report.counts = comparison.counts();
        report.complete = comparison.complete;

        if self.cancel.load(Ordering::SeqCst) {
            report.phase = SyncPhase::Cancelled;
            report.duration = started.elapsed();
            return Ok(report);
        }

        self.set_phase(SyncPhase::Applying);
        let executor = self.executor();

        if policy.uploads() {
            let pending = self.store.get_unsettled_changes().await?;
            let deletions = executor.push_deletions(&pending).await;
            report.settled += self.store.mark_settled(&deletions.settled_ids).await?;
            report.deletions = Some(deletions);

            let upload = executor.push_to_remote(&self.upload_items(&comparison)).await;
            report.settled += self.store.mark_settled(&upload.settled_ids).await?;
            report.upload = Some(upload);

            // Pending edits of records that already match remotely have
            // nothing left to upload.
            let matching: Vec<String> = comparison
                .in_sync
                .iter()
                .filter_map(|item| match item {
                    SyncItem::Meter { local: Some(m), .. } => Some(m.id.clone()),
                    SyncItem::Reading { local: Some(r), .. } => Some(r.id.clone()),
                    _ => None,
                })
                .collect();
            report.settled += self.store.mark_settled(&matching).await?;
        }

        if policy.downloads() && !self.cancel.load(Ordering::SeqCst) {
            let superseded: HashSet<&str> = report
                .deletions
                .iter()
                .chain(&report.upload)
                .flat_map(|o| o.settled_ids.iter().map(String::as_str))
                .collect();
            let items = self.download_items(&comparison, &superseded);
            let download = executor.pull_to_local(&items).await?;
            report.settled += self.store.mark_settled(&download.settled_ids).await?;
            report.download = Some(download);
        }

        let cancelled = self.cancel.load(Ordering::SeqCst) || report.outcomes().any(|o| o.cancelled);
        report.phase = if cancelled {
            SyncPhase::Cancelled
        } else {
            SyncPhase::Completed
        };
        report.duration = started.elapsed();

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Collection, MemoryDocumentStore, Operation, RemoteError};
    use meter_store::domain::{Meter, MeterKind, NewReading};
    use time::macros::{date, datetime};

    async fn engine_with(config: EngineConfig) -> SyncEngine<MemoryDocumentStore> {
        let store = LocalStore::open_in_memory().await.unwrap();
        SyncEngine::new(store, RemoteClient::new(MemoryDocumentStore::new(), 100), config)
    }

    fn quick_config() -> EngineConfig {
        let mut config = EngineConfig::new("u-1");
        config.batch.batch_delay = Duration::ZERO;
        config
    }

    async fn seed_local(store: &LocalStore) {
        store
            .add_meter(&Meter::new("m-1", "u-1", "Main", "M1", MeterKind::Electricity, datetime!(2024-01-01 00:00:00 UTC)))
            .await
            .unwrap();
        for (id, day, value) in [("r-1", date!(2024-01-01), 10.0), ("r-2", date!(2024-01-02), 15.0)] {
            store
                .add_reading(&NewReading {
                    id: id.to_string(),
                    owner_id: "u-1".to_string(),
                    meter_id: "m-1".to_string(),
                    value,
                    reading_date: day,
                    reading_time: None,
                    created_at: datetime!(2024-01-02 00:00:00 UTC),
                })
                .await
                .unwrap();
        }
    }

    #[test]
    fn policies_parse() {
        assert_eq!("full".parse::<SyncPolicy>().unwrap(), SyncPolicy::Full);
        assert!(matches!("sideways".parse::<SyncPolicy>(), Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn upload_run_completes_and_settles_the_log() {
        let engine = engine_with(quick_config()).await;
        seed_local(engine.store()).await;
        let mut phases = engine.subscribe();

        let report = engine.run(SyncPolicy::Upload).await.unwrap();
        assert_eq!(report.phase, SyncPhase::Completed);
        assert_eq!(engine.phase(), SyncPhase::Completed);
        assert!(phases.has_changed().unwrap());
        assert_eq!(report.counts["local_only"], 3);
        assert_eq!(report.upload.as_ref().unwrap().success_count, 3);
        assert!(report.download.is_none());
        assert_eq!(report.settled, 3);
        assert!(engine.store().get_unsettled_changes().await.unwrap().is_empty());
        assert_eq!(engine.remote().api().len(Collection::Readings), 2);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_one_is_active() {
        let engine = engine_with(quick_config()).await;
        seed_local(engine.store()).await;
        engine.remote().api().set_latency(Duration::from_millis(50));

        let mut phases = engine.subscribe();
        let first = engine.spawn(SyncPolicy::Upload);
        phases.wait_for(|p| *p != SyncPhase::Idle).await.unwrap();

        assert!(matches!(engine.run(SyncPolicy::Download).await, Err(SyncError::AlreadyRunning)));

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.phase, SyncPhase::Completed);
        assert!(engine.run(SyncPolicy::Download).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_during_apply_reports_cancelled() {
        let mut config = quick_config();
        config.batch.batch_size = 1;
        config.batch.max_workers = 1;
        let engine = engine_with(config).await;
        seed_local(engine.store()).await;
        engine.remote().api().set_latency(Duration::from_millis(20));

        let mut phases = engine.subscribe();
        let handle = engine.spawn(SyncPolicy::Upload);
        phases.wait_for(|p| *p == SyncPhase::Applying).await.unwrap();
        engine.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.phase, SyncPhase::Cancelled);
        let upload = report.upload.unwrap();
        assert!(upload.cancelled);
        assert!(upload.success_count + upload.skipped_count <= 3);
        assert!(upload.skipped_count > 0);

        // The next run starts clean and finishes the job.
        let report = engine.run(SyncPolicy::Upload).await.unwrap();
        assert_eq!(report.phase, SyncPhase::Completed);
        assert!(engine.store().get_unsettled_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_right_after_spawn_is_not_lost() {
        let engine = engine_with(quick_config()).await;
        seed_local(engine.store()).await;

        let handle = engine.spawn(SyncPolicy::Upload);
        engine.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.phase, SyncPhase::Cancelled);
        assert_eq!(engine.remote().api().len(Collection::Meters), 0);
        assert_eq!(engine.store().get_unsettled_changes().await.unwrap().len(), 3);

        let report = engine.run(SyncPolicy::Upload).await.unwrap();
        assert_eq!(report.phase, SyncPhase::Completed);
        assert!(engine.store().get_unsettled_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_outage_is_not_fatal() {
        let engine = engine_with(quick_config()).await;
        seed_local(engine.store()).await;
        engine
            .remote()
            .api()
            .fail_on(Operation::List, Collection::Meters, None, RemoteError::Transient("offline".into()));

        let report = engine.run(SyncPolicy::Full).await.unwrap();
        assert_eq!(report.phase, SyncPhase::Completed);
        assert!(!report.complete);
        assert_eq!(report.upload.as_ref().unwrap().success_count, 0);
        assert_eq!(engine.store().get_unsettled_changes().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn conflicts_follow_the_configured_side() {
        for (resolution, expected_local, expected_remote) in [
            (ConflictResolution::PreferLocal, 15.0, 15.0),
            (ConflictResolution::PreferRemote, 20.0, 20.0),
            (ConflictResolution::Skip, 15.0, 20.0),
        ] {
            let mut config = quick_config();
            config.conflict_resolution = resolution;
            let engine = engine_with(config).await;
            seed_local(engine.store()).await;
            engine.run(SyncPolicy::Upload).await.unwrap();

            // Someone else corrects the second reading remotely.
            let mut fields = crate::remote::Fields::new();
            fields.insert("reading_value".into(), serde_json::json!(20.0));
            engine
                .remote()
                .update_document(Collection::Readings, "r-2", fields)
                .await
                .unwrap();

            let report = engine.run(SyncPolicy::Full).await.unwrap();
            assert_eq!(report.counts["conflicting"], 1, "{resolution:?}");

            let local = engine.store().get_reading("r-2").await.unwrap().unwrap();
            assert_eq!(local.value, expected_local, "{resolution:?}");
            let remote = engine.remote().api().get(Collection::Readings, "r-2").unwrap();
            assert_eq!(
                remote.fields.get("reading_value").and_then(|v| v.as_f64()),
                Some(expected_remote),
                "{resolution:?}"
            );
        }
    }

    #[tokio::test]
    async fn dedupe_runs_before_comparing_when_enabled() {
        let mut config = quick_config();
        config.dedupe_before_compare = true;
        let engine = engine_with(config).await;
        seed_local(engine.store()).await;
        engine
            .store()
            .add_meter(&Meter::new("m-dup", "u-1", "Main", "M1", MeterKind::Electricity, datetime!(2024-02-01 00:00:00 UTC)))
            .await
            .unwrap();

        let report = engine.run(SyncPolicy::Upload).await.unwrap();
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(engine.remote().api().len(Collection::Meters), 1);
    }
}
