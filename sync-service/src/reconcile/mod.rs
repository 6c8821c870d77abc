//! Point-in-time classification of local vs remote meters and reading days.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::Instant,
};

use meter_store::{
    domain::{Meter, Reading, DEFAULT_READING_TIME},
    LocalStore, StoreResult,
};
use serde::Deserialize;

use crate::remote::{DocumentApi, RemoteClient, RemoteMeter, RemoteReading};

/// Readings whose values differ by at most this much are the same reading.
pub const DEFAULT_READING_TOLERANCE: f64 = 0.01;

// Absorbs binary rounding so that a difference of exactly the tolerance passes.
const TOLERANCE_SLACK: f64 = 1e-9;

/// How to classify a common meter whose remote timestamp cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnparseableTimestamps {
    #[default]
    InSync,
    Conflicting,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub owner_id: String,
    pub reading_tolerance: f64,
    pub unparseable_timestamps: UnparseableTimestamps,
}

impl ReconcileConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            reading_tolerance: DEFAULT_READING_TOLERANCE,
            unparseable_timestamps: UnparseableTimestamps::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    LocalOnly,
    RemoteOnly,
    LocalNewer,
    RemoteNewer,
    InSync,
    Conflicting,
}

impl Relation {
    pub const ALL: [Relation; 6] = [
        Relation::LocalOnly,
        Relation::RemoteOnly,
        Relation::LocalNewer,
        Relation::RemoteNewer,
        Relation::InSync,
        Relation::Conflicting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::RemoteOnly => "remote_only",
            Self::LocalNewer => "local_newer",
            Self::RemoteNewer => "remote_newer",
            Self::InSync => "in_sync",
            Self::Conflicting => "conflicting",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified entity, carrying whatever copies exist so that it can be
/// applied without querying again.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncItem {
    Meter {
        local: Option<Meter>,
        remote: Option<RemoteMeter>,
        reason: Option<String>,
    },
    Reading {
        key: String,
        local: Option<Reading>,
        remote: Option<RemoteReading>,
        reason: Option<String>,
    },
}

impl SyncItem {
    /// Meter id, or `meterId_YYYY-MM-DD` for a reading day.
    pub fn key(&self) -> String {
        match self {
            Self::Meter { local, remote, .. } => local
                .as_ref()
                .map(|m| m.id.clone())
                .or_else(|| remote.as_ref().map(|m| m.id.clone()))
                .unwrap_or_default(),
            Self::Reading { key, .. } => key.clone(),
        }
    }

    pub fn entity(&self) -> &'static str {
        match self {
            Self::Meter { .. } => "meter",
            Self::Reading { .. } => "reading",
        }
    }

    pub fn is_meter(&self) -> bool {
        matches!(self, Self::Meter { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Meter { reason, .. } | Self::Reading { reason, .. } => reason.as_deref(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Meter { local: Some(m), .. } => format!("Meter: {}", m.label()),
            Self::Meter { remote: Some(m), .. } => format!("Meter: {}", m.label()),
            Self::Reading { local: Some(r), .. } => format!("Reading: {}", r.label()),
            Self::Reading { remote: Some(r), .. } => format!("Reading: {}", r.label()),
            Self::Meter { .. } | Self::Reading { .. } => format!("{}: {}", self.entity(), self.key()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comparison {
    pub local_only: Vec<SyncItem>,
    pub remote_only: Vec<SyncItem>,
    pub local_newer: Vec<SyncItem>,
    pub remote_newer: Vec<SyncItem>,
    pub in_sync: Vec<SyncItem>,
    pub conflicting: Vec<SyncItem>,
    /// Remote fetch problems that left part of the picture out.
    pub warnings: Vec<String>,
    /// `false` when some remote data could not be fetched.
    pub complete: bool,
}

impl Comparison {
    pub fn bucket(&self, relation: Relation) -> &[SyncItem] {
        match relation {
            Relation::LocalOnly => &self.local_only,
            Relation::RemoteOnly => &self.remote_only,
            Relation::LocalNewer => &self.local_newer,
            Relation::RemoteNewer => &self.remote_newer,
            Relation::InSync => &self.in_sync,
            Relation::Conflicting => &self.conflicting,
        }
    }

    fn bucket_mut(&mut self, relation: Relation) -> &mut Vec<SyncItem> {
        match relation {
            Relation::LocalOnly => &mut self.local_only,
            Relation::RemoteOnly => &mut self.remote_only,
            Relation::LocalNewer => &mut self.local_newer,
            Relation::RemoteNewer => &mut self.remote_newer,
            Relation::InSync => &mut self.in_sync,
            Relation::Conflicting => &mut self.conflicting,
        }
    }

    /// Where the item with this key landed, if anywhere.
    pub fn relation_of(&self, key: &str) -> Option<Relation> {
        Relation::ALL
            .into_iter()
            .find(|r| self.bucket(*r).iter().any(|item| item.key() == key))
    }

    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        Relation::ALL
            .into_iter()
            .map(|r| (r.as_str(), self.bucket(r).len()))
            .collect()
    }

    pub fn total(&self) -> usize {
        Relation::ALL.into_iter().map(|r| self.bucket(r).len()).sum()
    }

    /// Nothing to upload, download or resolve.
    pub fn is_settled(&self) -> bool {
        Relation::ALL
            .into_iter()
            .filter(|r| *r != Relation::InSync)
            .all(|r| self.bucket(r).is_empty())
    }

    fn push(&mut self, relation: Relation, item: SyncItem) {
        self.bucket_mut(relation).push(item);
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
        self.complete = false;
    }
}

/// Representative per reading day: the earliest reading of that day.
fn earliest_per_day<T>(items: impl IntoIterator<Item = T>, key: impl Fn(&T) -> String, time: impl Fn(&T) -> time::Time) -> BTreeMap<String, T> {
    let mut out: BTreeMap<String, T> = BTreeMap::new();
    for item in items {
        let k = key(&item);
        match out.get(&k) {
            Some(existing) if time(existing) <= time(&item) => {}
            _ => {
                out.insert(k, item);
            }
        }
    }
    out
}

fn classify_meter(local: Meter, remote: RemoteMeter, config: &ReconcileConfig) -> (Relation, SyncItem) {
    let local_ts = local.last_modified();
    let (relation, reason) = match remote.last_modified {
        Some(remote_ts) if local_ts > remote_ts => (Relation::LocalNewer, None),
        Some(remote_ts) if remote_ts > local_ts => (Relation::RemoteNewer, None),
        Some(_) => (Relation::InSync, None),
        None => match config.unparseable_timestamps {
            UnparseableTimestamps::InSync => (Relation::InSync, None),
            UnparseableTimestamps::Conflicting => (
                Relation::Conflicting,
                Some("remote timestamp could not be parsed".to_string()),
            ),
        },
    };

    (
        relation,
        SyncItem::Meter {
            local: Some(local),
            remote: Some(remote),
            reason,
        },
    )
}

fn classify_reading(key: String, local: Reading, remote: RemoteReading, tolerance: f64) -> (Relation, SyncItem) {
    let diff = (local.value - remote.value).abs();
    let (relation, reason) = if diff <= tolerance + TOLERANCE_SLACK {
        (Relation::InSync, None)
    } else {
        (
            Relation::Conflicting,
            Some(format!("value mismatch: local={}, remote={}", local.value, remote.value)),
        )
    };

    (
        relation,
        SyncItem::Reading {
            key,
            local: Some(local),
            remote: Some(remote),
            reason,
        },
    )
}

/// Classify every active meter and every reading day of the owner.
///
/// Remote failures never escape: they are recorded as warnings and the result
/// is marked incomplete. If the remote meter list itself is unavailable the
/// comparison is returned empty rather than reporting every local record as
/// local-only. Local storage errors propagate.
pub async fn reconcile<A: DocumentApi>(
    store: &LocalStore,
    remote: &RemoteClient<A>,
    config: &ReconcileConfig,
) -> StoreResult<Comparison> {
    let started = Instant::now();
    let mut comparison = Comparison {
        complete: true,
        ..Comparison::default()
    };

    let local_meters = store.get_meters(&config.owner_id).await?;
    let mut local_readings = Vec::new();
    for meter in &local_meters {
        local_readings.extend(store.get_readings(&meter.id, None, None).await?);
    }

    let remote_meters = match remote.list_meters(&config.owner_id).await {
        Ok(meters) => meters,
        Err(e) => {
            comparison.warn(format!("could not list remote meters: {e}"));
            return Ok(comparison);
        }
    };

    let mut remote_readings = Vec::new();
    let mut unreadable_meters = BTreeSet::new();
    for meter in &remote_meters {
        match remote.list_readings(&meter.id, None).await {
            Ok(readings) => remote_readings.extend(readings),
            Err(e) => {
                comparison.warn(format!("could not list remote readings of meter {}: {e}", meter.id));
                unreadable_meters.insert(meter.id.clone());
            }
        }
    }

    // Meters.
    let mut local_by_id: BTreeMap<String, Meter> = local_meters.into_iter().map(|m| (m.id.clone(), m)).collect();
    let remote_by_id: BTreeMap<String, RemoteMeter> = remote_meters.into_iter().map(|m| (m.id.clone(), m)).collect();

    for (id, remote_meter) in remote_by_id {
        match local_by_id.remove(&id) {
            Some(local_meter) => {
                let (relation, item) = classify_meter(local_meter, remote_meter, config);
                comparison.push(relation, item);
            }
            None => comparison.push(
                Relation::RemoteOnly,
                SyncItem::Meter {
                    local: None,
                    remote: Some(remote_meter),
                    reason: None,
                },
            ),
        }
    }
    for (_, local_meter) in local_by_id {
        comparison.push(
            Relation::LocalOnly,
            SyncItem::Meter {
                local: Some(local_meter),
                remote: None,
                reason: None,
            },
        );
    }

    // Reading days. Days of meters whose remote readings are unknown are left
    // out entirely.
    let mut local_days = earliest_per_day(
        local_readings
            .into_iter()
            .filter(|r| !unreadable_meters.contains(&r.meter_id)),
        Reading::day_key,
        |r| r.reading_time,
    );
    let remote_days = earliest_per_day(remote_readings, RemoteReading::day_key, |r| {
        r.reading_time.unwrap_or(DEFAULT_READING_TIME)
    });

    for (key, remote_reading) in remote_days {
        match local_days.remove(&key) {
            Some(local_reading) => {
                let (relation, item) = classify_reading(key, local_reading, remote_reading, config.reading_tolerance);
                comparison.push(relation, item);
            }
            None => comparison.push(
                Relation::RemoteOnly,
                SyncItem::Reading {
                    key,
                    local: None,
                    remote: Some(remote_reading),
                    reason: None,
                },
            ),
        }
    }
    for (key, local_reading) in local_days {
        comparison.push(
            Relation::LocalOnly,
            SyncItem::Reading {
                key,
                local: Some(local_reading),
                remote: None,
                reason: None,
            },
        );
    }

    metrics::histogram!("reconcile_duration_seconds").record(started.elapsed().as_secs_f64());
    tracing::info!(
        local_only = comparison.local_only.len(),
        remote_only = comparison.remote_only.len(),
        local_newer = comparison.local_newer.len(),
        remote_newer = comparison.remote_newer.len(),
        in_sync = comparison.in_sync.len(),
        conflicting = comparison.conflicting.len(),
        complete = comparison.complete,
        "reconciliation finished"
    );

    Ok(comparison)
}

/// Human-readable, one line per non-empty bucket.
pub fn sync_summary(comparison: &Comparison) -> String {
    let mut lines = Vec::new();

    if !comparison.local_only.is_empty() {
        lines.push(format!("{} items to upload to server", comparison.local_only.len()));
    }
    if !comparison.remote_only.is_empty() {
        lines.push(format!("{} items to download from server", comparison.remote_only.len()));
    }
    if !comparison.local_newer.is_empty() {
        lines.push(format!("{} items newer locally", comparison.local_newer.len()));
    }
    if !comparison.remote_newer.is_empty() {
        lines.push(format!("{} items newer on server", comparison.remote_newer.len()));
    }
    if !comparison.conflicting.is_empty() {
        lines.push(format!("{} conflicts need resolution", comparison.conflicting.len()));
    }
    if !comparison.in_sync.is_empty() {
        lines.push(format!("{} items in sync", comparison.in_sync.len()));
    }
    if !comparison.complete {
        lines.push(format!(
            "comparison incomplete: {} remote fetch problem(s)",
            comparison.warnings.len()
        ));
    }

    if lines.is_empty() {
        "all data is in sync".to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Collection, Document, Fields, MemoryDocumentStore, Operation, RemoteError};
    use meter_store::domain::{MeterKind, NewReading};
    use serde_json::{json, Value};
    use time::macros::{date, datetime};

    fn object(v: Value) -> Fields {
        match v {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    fn remote_meter_doc(id: &str, updated_at: &str) -> Document {
        Document {
            id: id.to_string(),
            created_at: "2024-01-01T00:00:00.000+00:00".to_string(),
            updated_at: updated_at.to_string(),
            fields: object(json!({"user_id": "u-1", "home_name": "Main", "meter_name": id, "meter_type": "electricity"})),
        }
    }

    fn remote_reading_doc(id: &str, meter_id: &str, day: &str, value: f64) -> Document {
        Document {
            id: id.to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
            fields: object(json!({"user_id": "u-1", "meter_id": meter_id, "reading_value": value, "reading_date": day})),
        }
    }

    async fn local_with_meter(id: &str, created: time::OffsetDateTime) -> LocalStore {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .add_meter(&Meter::new(id, "u-1", "Main", id, MeterKind::Electricity, created))
            .await
            .unwrap();
        store
    }

    async fn add_reading(store: &LocalStore, id: &str, meter_id: &str, day: time::Date, value: f64) {
        store
            .add_reading(&NewReading {
                id: id.to_string(),
                owner_id: "u-1".to_string(),
                meter_id: meter_id.to_string(),
                value,
                reading_date: day,
                reading_time: None,
                created_at: datetime!(2024-01-01 00:00:00 UTC),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn meters_are_partitioned_by_presence_and_freshness() {
        let store = local_with_meter("common-old", datetime!(2024-01-01 00:00:00 UTC)).await;
        store
            .add_meter(&Meter::new("common-new", "u-1", "Main", "common-new", MeterKind::Water, datetime!(2024-06-01 00:00:00 UTC)))
            .await
            .unwrap();
        store
            .add_meter(&Meter::new("same", "u-1", "Main", "same", MeterKind::Gas, datetime!(2024-03-01 00:00:00 UTC)))
            .await
            .unwrap();
        store
            .add_meter(&Meter::new("mine", "u-1", "Main", "mine", MeterKind::Gas, datetime!(2024-03-01 00:00:00 UTC)))
            .await
            .unwrap();

        let api = MemoryDocumentStore::new();
        api.seed(Collection::Meters, remote_meter_doc("common-old", "2024-02-01T00:00:00.000+00:00"));
        api.seed(Collection::Meters, remote_meter_doc("common-new", "2024-02-01T00:00:00Z"));
        api.seed(Collection::Meters, remote_meter_doc("same", "2024-03-01T00:00:00"));
        api.seed(Collection::Meters, remote_meter_doc("theirs", "2024-03-01"));
        let remote = RemoteClient::new(api, 100);

        let c = reconcile(&store, &remote, &ReconcileConfig::new("u-1")).await.unwrap();
        assert!(c.complete);
        assert_eq!(c.relation_of("common-old"), Some(Relation::RemoteNewer));
        assert_eq!(c.relation_of("common-new"), Some(Relation::LocalNewer));
        assert_eq!(c.relation_of("same"), Some(Relation::InSync));
        assert_eq!(c.relation_of("mine"), Some(Relation::LocalOnly));
        assert_eq!(c.relation_of("theirs"), Some(Relation::RemoteOnly));
        assert_eq!(c.total(), 5);
    }

    #[tokio::test]
    async fn unparseable_remote_stamp_follows_policy() {
        let store = local_with_meter("m", datetime!(2024-01-01 00:00:00 UTC)).await;
        let api = MemoryDocumentStore::new();
        let mut doc = remote_meter_doc("m", "yesterday");
        doc.created_at = "sometime".to_string();
        api.seed(Collection::Meters, doc);
        let remote = RemoteClient::new(api, 100);

        let mut config = ReconcileConfig::new("u-1");
        let c = reconcile(&store, &remote, &config).await.unwrap();
        assert_eq!(c.relation_of("m"), Some(Relation::InSync));

        config.unparseable_timestamps = UnparseableTimestamps::Conflicting;
        let c = reconcile(&store, &remote, &config).await.unwrap();
        assert_eq!(c.relation_of("m"), Some(Relation::Conflicting));
        assert!(c.conflicting[0].reason().is_some());
    }

    #[tokio::test]
    async fn reading_days_use_value_tolerance() {
        let store = local_with_meter("m", datetime!(2024-01-01 00:00:00 UTC)).await;
        add_reading(&store, "l1", "m", date!(2024-01-01), 100.0).await;
        add_reading(&store, "l2", "m", date!(2024-01-02), 100.0).await;
        add_reading(&store, "l3", "m", date!(2024-01-03), 100.0).await;
        add_reading(&store, "l4", "m", date!(2024-01-04), 100.0).await;

        let api = MemoryDocumentStore::new();
        api.seed(Collection::Meters, remote_meter_doc("m", "2024-01-01T00:00:00Z"));
        api.seed(Collection::Readings, remote_reading_doc("r1", "m", "2024-01-01", 100.005));
        api.seed(Collection::Readings, remote_reading_doc("r2", "m", "2024-01-02", 100.02));
        api.seed(Collection::Readings, remote_reading_doc("r3", "m", "2024-01-03", 100.01));
        api.seed(Collection::Readings, remote_reading_doc("r5", "m", "2024-01-05", 101.0));
        let remote = RemoteClient::new(api, 100);

        let c = reconcile(&store, &remote, &ReconcileConfig::new("u-1")).await.unwrap();
        assert_eq!(c.relation_of("m_2024-01-01"), Some(Relation::InSync));
        assert_eq!(c.relation_of("m_2024-01-02"), Some(Relation::Conflicting));
        assert_eq!(c.relation_of("m_2024-01-03"), Some(Relation::InSync));
        assert_eq!(c.relation_of("m_2024-01-04"), Some(Relation::LocalOnly));
        assert_eq!(c.relation_of("m_2024-01-05"), Some(Relation::RemoteOnly));

        let conflict = c.conflicting.iter().find(|i| i.key() == "m_2024-01-02").unwrap();
        let reason = conflict.reason().unwrap();
        assert!(reason.contains("local=100"));
        assert!(reason.contains("remote=100.02"));
    }

    #[tokio::test]
    async fn same_day_readings_collapse_to_earliest() {
        let store = local_with_meter("m", datetime!(2024-01-01 00:00:00 UTC)).await;
        let mut morning = NewReading {
            id: "am".to_string(),
            owner_id: "u-1".to_string(),
            meter_id: "m".to_string(),
            value: 5.0,
            reading_date: date!(2024-01-01),
            reading_time: Some(time::macros::time!(07:00)),
            created_at: datetime!(2024-01-01 07:00:00 UTC),
        };
        store.add_reading(&morning).await.unwrap();
        morning.id = "pm".to_string();
        morning.value = 9.0;
        morning.reading_time = Some(time::macros::time!(19:00));
        store.add_reading(&morning).await.unwrap();

        let api = MemoryDocumentStore::new();
        api.seed(Collection::Meters, remote_meter_doc("m", "2024-01-01T00:00:00Z"));
        api.seed(Collection::Readings, remote_reading_doc("r", "m", "2024-01-01", 5.0));
        let remote = RemoteClient::new(api, 100);

        let c = reconcile(&store, &remote, &ReconcileConfig::new("u-1")).await.unwrap();
        let readings: Vec<&SyncItem> = c.in_sync.iter().filter(|i| !i.is_meter()).collect();
        assert_eq!(readings.len(), 1);
        match readings[0] {
            SyncItem::Reading { local: Some(r), .. } => assert_eq!(r.id, "am"),
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_failures_degrade_to_incomplete_results() {
        let store = local_with_meter("m", datetime!(2024-01-01 00:00:00 UTC)).await;
        add_reading(&store, "l1", "m", date!(2024-01-01), 1.0).await;

        let api = MemoryDocumentStore::new();
        api.seed(Collection::Meters, remote_meter_doc("m", "2024-01-01T00:00:00Z"));
        api.fail_on(
            Operation::List,
            Collection::Readings,
            Some("m"),
            RemoteError::Transient("timeout".into()),
        );
        let remote = RemoteClient::new(api, 100);

        let c = reconcile(&store, &remote, &ReconcileConfig::new("u-1")).await.unwrap();
        assert!(!c.complete);
        assert_eq!(c.warnings.len(), 1);
        assert_eq!(c.relation_of("m"), Some(Relation::InSync));
        assert_eq!(c.relation_of("m_2024-01-01"), None);

        remote.api().fail_on(Operation::List, Collection::Meters, None, RemoteError::RateLimited);
        let c = reconcile(&store, &remote, &ReconcileConfig::new("u-1")).await.unwrap();
        assert!(!c.complete);
        assert_eq!(c.total(), 0);
        assert!(sync_summary(&c).contains("incomplete"));
    }

    #[test]
    fn summary_lists_non_empty_buckets() {
        let mut c = Comparison {
            complete: true,
            ..Comparison::default()
        };
        assert_eq!(sync_summary(&c), "all data is in sync");

        c.local_only.push(SyncItem::Reading {
            key: "m_2024-01-01".into(),
            local: None,
            remote: None,
            reason: None,
        });
        let summary = sync_summary(&c);
        assert_eq!(summary, "1 items to upload to server");
    }
}
