//! Applies classified items in one direction with batching, bounded
//! concurrency, polled cancellation and per-item failure tracking.
//!
//! The executor never touches the change log: callers settle
//! [`BatchOutcome::settled_ids`] once they are satisfied with the outcome.

pub mod batch;

use std::{
    collections::HashSet,
    convert::Infallible,
    sync::{atomic::AtomicBool, Arc},
};

use meter_store::{
    domain::{timestamps, ChangeLogEntry, ChangeOperation, ChangeTable, Meter, Reading},
    LocalStore, StoreError,
};
use serde_json::json;
use tokio::sync::mpsc;

pub use batch::{Applied, BatchConfig, ItemResult, Progress};

use crate::{
    reconcile::{SyncItem, DEFAULT_READING_TOLERANCE},
    remote::{
        client::{meter_fields, reading_fields},
        Collection, DocumentApi, Fields, RemoteClient, RemoteError, RemoteMeter, RemoteReading, RemoteResult,
    },
};

use batch::run_batches;

const VALUE_SLACK: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub id: String,
    pub label: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// Labels of applied items, in completion order.
    pub applied: Vec<String>,
    pub failures: Vec<ItemFailure>,
    /// Local record ids whose change-log entries can be settled.
    pub settled_ids: Vec<String>,
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.success_count += other.success_count;
        self.failed_count += other.failed_count;
        self.skipped_count += other.skipped_count;
        self.applied.extend(other.applied);
        self.failures.extend(other.failures);
        self.settled_ids.extend(other.settled_ids);
        self.cancelled |= other.cancelled;
    }

    pub fn summary(&self) -> String {
        let mut s = format!("{} succeeded, {} failed", self.success_count, self.failed_count);
        if self.skipped_count > 0 {
            s.push_str(&format!(", {} skipped", self.skipped_count));
        }
        s
    }
}

fn never<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(v) => v,
        Err(never) => match never {},
    }
}

pub struct SyncExecutor<A> {
    store: LocalStore,
    remote: Arc<RemoteClient<A>>,
    owner_id: String,
    batch: BatchConfig,
    reading_tolerance: f64,
    cancel: Arc<AtomicBool>,
    progress: Option<mpsc::Sender<Progress>>,
}

impl<A: DocumentApi> SyncExecutor<A> {
    pub fn new(store: LocalStore, remote: Arc<RemoteClient<A>>, owner_id: impl Into<String>, batch: BatchConfig) -> Self {
        Self {
            store,
            remote,
            owner_id: owner_id.into(),
            batch,
            reading_tolerance: DEFAULT_READING_TOLERANCE,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.reading_tolerance = tolerance;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::Sender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Upload meters first, then readings. Items without a local copy fail.
    pub async fn push_to_remote(&self, items: &[SyncItem]) -> BatchOutcome {
        let (meters, readings): (Vec<&SyncItem>, Vec<&SyncItem>) = items.iter().partition(|i| i.is_meter());

        let none = HashSet::new();
        let mut outcome = never(
            run_batches(meters, &self.batch, &self.cancel, self.progress.as_ref(), |item| {
                self.push_item(item, &none)
            })
            .await,
        );
        if outcome.cancelled {
            outcome.skipped_count += readings.len();
        } else {
            // Readings of a meter that could not be uploaded would be orphaned remotely.
            let blocked: HashSet<String> = outcome.failures.iter().map(|f| f.id.clone()).collect();
            outcome.merge(never(
                run_batches(readings, &self.batch, &self.cancel, self.progress.as_ref(), |item| {
                    self.push_item(item, &blocked)
                })
                .await,
            ));
        }

        metrics::counter!("sync_items_pushed_total").increment(outcome.success_count as u64);
        tracing::info!(
            succeeded = outcome.success_count,
            failed = outcome.failed_count,
            skipped = outcome.skipped_count,
            "upload finished"
        );
        outcome
    }

    /// Download meters first, then readings. Local storage errors abort the
    /// whole download; an invalid remote value only fails its item.
    pub async fn pull_to_local(&self, items: &[SyncItem]) -> Result<BatchOutcome, StoreError> {
        let (meters, readings): (Vec<&SyncItem>, Vec<&SyncItem>) = items.iter().partition(|i| i.is_meter());

        let mut outcome =
            run_batches(meters, &self.batch, &self.cancel, self.progress.as_ref(), |item| self.pull_item(item)).await?;
        if outcome.cancelled {
            outcome.skipped_count += readings.len();
        } else {
            outcome.merge(
                run_batches(readings, &self.batch, &self.cancel, self.progress.as_ref(), |item| self.pull_item(item))
                    .await?,
            );
        }

        metrics::counter!("sync_items_pulled_total").increment(outcome.success_count as u64);
        tracing::info!(
            succeeded = outcome.success_count,
            failed = outcome.failed_count,
            skipped = outcome.skipped_count,
            "download finished"
        );
        Ok(outcome)
    }

    /// Propagate locally deleted readings. Remote failures are logged and the
    /// entry is still reported as settled so it is not retried forever.
    pub async fn push_deletions(&self, changes: &[ChangeLogEntry]) -> BatchOutcome {
        let deletions: Vec<&ChangeLogEntry> = changes
            .iter()
            .filter(|c| c.operation == ChangeOperation::Delete && c.table == ChangeTable::Readings)
            .collect();

        never(
            run_batches(deletions, &self.batch, &self.cancel, self.progress.as_ref(), |entry| async move {
                if let Err(e) = self.remote.delete_document(Collection::Readings, &entry.record_id).await {
                    tracing::warn!(
                        record_id = %entry.record_id,
                        error = %e,
                        "remote delete failed, settling anyway"
                    );
                    metrics::counter!("sync_best_effort_deletes_total").increment(1);
                }
                Ok(Ok(Applied {
                    label: format!("Deleted reading {}", entry.record_id),
                    settled_ids: vec![entry.record_id.clone()],
                }))
            })
            .await,
        )
    }

    async fn push_item(&self, item: &SyncItem, blocked_meters: &HashSet<String>) -> Result<ItemResult, Infallible> {
        let (result, local_id) = match item {
            SyncItem::Meter { local: Some(meter), .. } => (self.push_meter(meter).await, meter.id.clone()),
            SyncItem::Reading { local: Some(reading), .. } if blocked_meters.contains(&reading.meter_id) => (
                Err(RemoteError::invalid(
                    &reading.id,
                    format!("meter {} was not uploaded", reading.meter_id),
                )),
                reading.id.clone(),
            ),
            SyncItem::Reading { local: Some(reading), .. } => (self.push_reading(reading).await, reading.id.clone()),
            _ => (Err(RemoteError::invalid(&item.key(), "no local copy to upload")), item.key()),
        };

        Ok(match result {
            Ok(label) => Ok(Applied {
                label,
                settled_ids: vec![local_id],
            }),
            Err(e) => {
                tracing::warn!(item = %item.label(), error = %e, "failed to upload item");
                metrics::counter!("sync_item_failures_total", "direction" => "upload").increment(1);
                Err(ItemFailure {
                    id: item.key(),
                    label: item.label(),
                    error: e.to_string(),
                })
            }
        })
    }

    /// Upsert by natural key, then by id. A meter already present under
    /// (owner, home, name) with the same id gets its mutable attributes
    /// rewritten, which also refreshes its remote stamp. One present under a
    /// different id is a collision: the item fails and stays pending.
    async fn push_meter(&self, meter: &Meter) -> RemoteResult<String> {
        let label = format!("Meter: {}", meter.label());

        match self
            .remote
            .find_meter(&meter.owner_id, &meter.home_name, &meter.meter_name)
            .await?
        {
            Some(existing) if existing.id != meter.id => {
                tracing::warn!(
                    local_id = %meter.id,
                    remote_id = %existing.id,
                    meter = %meter.label(),
                    "remote already has this meter under another id"
                );
                metrics::counter!("sync_meter_key_collisions_total").increment(1);
                Err(RemoteError::invalid(
                    &meter.id,
                    format!("remote meter {} already uses this name", existing.id),
                ))
            }
            Some(_) => {
                let mut fields = Fields::new();
                fields.insert("home_name".to_string(), json!(meter.home_name));
                fields.insert("meter_name".to_string(), json!(meter.meter_name));
                fields.insert("meter_type".to_string(), json!(meter.kind.as_str()));
                fields.insert("is_active".to_string(), json!(meter.is_active));
                self.remote
                    .update_document(Collection::Meters, &meter.id, fields)
                    .await?;
                Ok(label)
            }
            None => match self.update_or_create(Collection::Meters, &meter.id, meter_fields(meter)).await? {
                true => Ok(format!("{label} (renamed)")),
                false => Ok(label),
            },
        }
    }

    /// Rewrite the remote document carrying `id`, creating it when there is
    /// none. Returns whether an existing document was rewritten.
    async fn update_or_create(&self, collection: Collection, id: &str, fields: Fields) -> RemoteResult<bool> {
        match self.remote.update_document(collection, id, fields.clone()).await {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => {
                self.remote.create_or_preserve_id(collection, id, fields).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Upsert by (owner, meter, day), then by id; an existing remote value
    /// within the tolerance is left alone. A reading whose day changed locally
    /// is found by id and its remote document moves to the new day.
    async fn push_reading(&self, reading: &Reading) -> RemoteResult<String> {
        let label = format!("Reading: {}", reading.label());

        match self
            .remote
            .find_reading(&reading.owner_id, &reading.meter_id, reading.reading_date)
            .await?
        {
            Some(existing) if (existing.value - reading.value).abs() > self.reading_tolerance + VALUE_SLACK => {
                let mut fields = Fields::new();
                fields.insert("reading_value".to_string(), json!(reading.value));
                fields.insert("consumption_kwh".to_string(), json!(reading.consumption));
                fields.insert(
                    "reading_time".to_string(),
                    json!(timestamps::format_time(reading.reading_time)),
                );
                self.remote
                    .update_document(Collection::Readings, &existing.id, fields)
                    .await?;
                Ok(format!("{label} (updated)"))
            }
            Some(_) => Ok(format!("{label} (already present)")),
            None => match self
                .update_or_create(Collection::Readings, &reading.id, reading_fields(reading))
                .await?
            {
                true => Ok(format!("{label} (moved)")),
                false => Ok(label),
            },
        }
    }

    async fn pull_item(&self, item: &SyncItem) -> Result<ItemResult, StoreError> {
        let result = match item {
            SyncItem::Meter { remote: Some(meter), .. } => self.pull_meter(meter).await,
            SyncItem::Reading {
                local, remote: Some(reading), ..
            } => self.pull_reading(local.as_ref(), reading).await,
            _ => {
                return Ok(Err(ItemFailure {
                    id: item.key(),
                    label: item.label(),
                    error: "no remote copy to download".to_string(),
                }))
            }
        };

        match result {
            Ok(applied) => Ok(Ok(applied)),
            Err(e @ StoreError::InvalidReadingValue(_)) => {
                tracing::warn!(item = %item.label(), error = %e, "failed to download item");
                metrics::counter!("sync_item_failures_total", "direction" => "download").increment(1);
                Ok(Err(ItemFailure {
                    id: item.key(),
                    label: item.label(),
                    error: e.to_string(),
                }))
            }
            Err(e) => Err(e),
        }
    }

    async fn pull_meter(&self, meter: &RemoteMeter) -> Result<Applied, StoreError> {
        if self.store.get_meter(&meter.id).await?.is_some() {
            let stamp = meter.last_modified.unwrap_or_else(timestamps::now_utc);
            self.store.update_meter(&meter.id, &meter.changes(), stamp).await?;
        } else {
            self.store.add_meter(&meter.to_local()).await?;
        }

        Ok(Applied {
            label: format!("Meter: {}", meter.label()),
            settled_ids: vec![meter.id.clone()],
        })
    }

    /// A differing local copy of the same day adopts the remote value;
    /// otherwise the reading is inserted unless that day already has one.
    async fn pull_reading(&self, local: Option<&Reading>, reading: &RemoteReading) -> Result<Applied, StoreError> {
        let label = format!("Reading: {}", reading.label());

        if let Some(local) = local {
            self.store
                .update_reading(&local.id, reading.value, local.reading_date, None)
                .await?;
            return Ok(Applied {
                label: format!("{label} (updated)"),
                settled_ids: vec![local.id.clone()],
            });
        }

        // Same record, another day locally: the local edit wins and the next
        // upload moves the remote copy.
        if let Some(existing) = self.store.get_reading(&reading.id).await? {
            return Ok(Applied {
                label: format!(
                    "{label} (already present on {})",
                    timestamps::format_date(existing.reading_date)
                ),
                settled_ids: Vec::new(),
            });
        }

        if self.store.has_reading_on(&reading.meter_id, reading.reading_date).await? {
            return Ok(Applied {
                label: format!("{label} (already present)"),
                settled_ids: Vec::new(),
            });
        }

        self.store.add_reading(&reading.to_new_reading(&self.owner_id)).await?;
        Ok(Applied {
            label,
            settled_ids: vec![reading.id.clone()],
        })
    }
}
