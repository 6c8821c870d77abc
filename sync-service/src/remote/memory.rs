//! In-process document store.
//!
//! Behaves like the hosted document API as far as the sync core can tell:
//! store-stamped audit fields, explicit ids that collide, generated ids,
//! equality/range filters with ordering and limit. Optionally persisted to a
//! JSON snapshot after every write. Faults and latency can be injected.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fs,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use meter_store::domain::timestamps;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Collection, Document, DocumentApi, DocumentId, Fields, Filter, Query, RemoteError, RemoteResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    collection: Collection,
    key: Option<String>,
    error: RemoteError,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    collections: BTreeMap<String, Vec<Document>>,
    sequence: u64,
}

impl Snapshot {
    fn docs(&self, collection: Collection) -> &[Document] {
        self.collections
            .get(collection.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn docs_mut(&mut self, collection: Collection) -> &mut Vec<Document> {
        self.collections.entry(collection.as_str().to_string()).or_default()
    }

    fn next_id(&mut self) -> String {
        self.sequence += 1;
        let mut h = blake3::Hasher::new();
        h.update(&self.sequence.to_le_bytes());
        h.update(&timestamps::now_utc().unix_timestamp_nanos().to_le_bytes());
        let hex = h.finalize().to_hex();
        hex.as_str()[..20].to_string()
    }
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<Snapshot>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<Operation, usize>>,
    latency_micros: AtomicU64,
    snapshot_path: Option<PathBuf>,
}

fn poisoned<T>(_: T) -> RemoteError {
    RemoteError::Transient("document store lock poisoned".to_string())
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn matches(doc: &Document, filter: &Filter) -> bool {
    let (field, value) = match filter {
        Filter::Equal(f, v) | Filter::GreaterOrEqual(f, v) | Filter::LessOrEqual(f, v) => (f, v),
    };
    let Some(actual) = doc.fields.get(field) else {
        return false;
    };
    let ord = compare_values(actual, value);

    match filter {
        Filter::Equal(..) => ord == Some(Ordering::Equal),
        Filter::GreaterOrEqual(..) => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        Filter::LessOrEqual(..) => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path` (or start empty if it does not exist) and
    /// write it back after every mutation.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            Snapshot::default()
        };

        tracing::info!(
            path = %path.display(),
            meters = snapshot.docs(Collection::Meters).len(),
            readings = snapshot.docs(Collection::Readings).len(),
            "opened document snapshot"
        );

        Ok(Self {
            state: Mutex::new(snapshot),
            snapshot_path: Some(path),
            ..Self::default()
        })
    }

    /// Insert (or replace) a document verbatim, audit fields included.
    pub fn seed(&self, collection: Collection, doc: Document) {
        if let Ok(mut state) = self.state.lock() {
            let docs = state.docs_mut(collection);
            docs.retain(|d| d.id != doc.id);
            docs.push(doc);
        }
    }

    pub fn get(&self, collection: Collection, id: &str) -> Option<Document> {
        let state = self.state.lock().ok()?;
        state.docs(collection).iter().find(|d| d.id == id).cloned()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.state.lock().map(|s| s.docs(collection).len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len(Collection::Meters) == 0 && self.len(Collection::Readings) == 0
    }

    /// Fail every matching call with `error` until [`Self::clear_faults`].
    /// `key` narrows the fault to one document id (or, for listings, to one
    /// equality-filter value).
    pub fn fail_on(&self, operation: Operation, collection: Collection, key: Option<&str>, error: RemoteError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(Fault {
                operation,
                collection,
                key: key.map(str::to_string),
                error,
            });
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_micros
            .store(latency.as_micros() as u64, AtomicOrdering::SeqCst);
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .map(|c| c.get(&operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    async fn enter(&self, operation: Operation, collection: Collection, keys: &[&str]) -> RemoteResult<()> {
        {
            let mut calls = self.calls.lock().map_err(poisoned)?;
            *calls.entry(operation).or_default() += 1;
        }

        let latency = self.latency_micros.load(AtomicOrdering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }

        let faults = self.faults.lock().map_err(poisoned)?;
        let hit = faults.iter().find(|f| {
            f.operation == operation
                && f.collection == collection
                && f.key.as_deref().map_or(true, |k| keys.contains(&k))
        });
        match hit {
            Some(f) => Err(f.error.clone()),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> RemoteResult<MutexGuard<'_, Snapshot>> {
        self.state.lock().map_err(poisoned)
    }

    fn persist(&self, state: &Snapshot) -> RemoteResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| RemoteError::Transient(format!("failed to encode snapshot: {e}")))?;
        fs::write(path, bytes).map_err(|e| RemoteError::Transient(format!("failed to write snapshot: {e}")))
    }
}

#[async_trait::async_trait]
impl DocumentApi for MemoryDocumentStore {
    async fn list_documents(&self, collection: Collection, query: &Query) -> RemoteResult<Vec<Document>> {
        let keys: Vec<&str> = query
            .filters
            .iter()
            .filter_map(|f| match f {
                Filter::Equal(_, Value::String(s)) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        self.enter(Operation::List, collection, &keys).await?;

        let state = self.lock_state()?;
        let mut docs: Vec<Document> = state
            .docs(collection)
            .iter()
            .filter(|d| query.filters.iter().all(|f| matches(d, f)))
            .cloned()
            .collect();

        if let Some(field) = &query.order_desc {
            docs.sort_by(|a, b| match (a.fields.get(field), b.fields.get(field)) {
                (Some(x), Some(y)) => compare_values(y, x).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }

        Ok(docs)
    }

    async fn create_document(&self, collection: Collection, id: DocumentId, fields: Fields) -> RemoteResult<Document> {
        {
            let key = match &id {
                DocumentId::Explicit(id) => vec![id.as_str()],
                DocumentId::Generated => Vec::new(),
            };
            self.enter(Operation::Create, collection, &key).await?;
        }

        let mut state = self.lock_state()?;
        let id = match id {
            DocumentId::Explicit(id) => {
                if state.docs(collection).iter().any(|d| d.id == id) {
                    return Err(RemoteError::Conflict(id));
                }
                id
            }
            DocumentId::Generated => loop {
                let candidate = state.next_id();
                if !state.docs(collection).iter().any(|d| d.id == candidate) {
                    break candidate;
                }
            },
        };

        let stamp = timestamps::format_timestamp(timestamps::now_utc());
        let doc = Document {
            id,
            created_at: stamp.clone(),
            updated_at: stamp,
            fields,
        };
        state.docs_mut(collection).push(doc.clone());
        self.persist(&state)?;

        Ok(doc)
    }

    async fn update_document(&self, collection: Collection, id: &str, fields: Fields) -> RemoteResult<Document> {
        self.enter(Operation::Update, collection, &[id]).await?;

        let mut state = self.lock_state()?;
        let doc = state
            .docs_mut(collection)
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        doc.fields.extend(fields);
        doc.updated_at = timestamps::format_timestamp(timestamps::now_utc());
        let updated = doc.clone();
        self.persist(&state)?;

        Ok(updated)
    }

    async fn delete_document(&self, collection: Collection, id: &str) -> RemoteResult<()> {
        self.enter(Operation::Delete, collection, &[id]).await?;

        let mut state = self.lock_state()?;
        let docs = state.docs_mut(collection);
        let before = docs.len();
        docs.retain(|d| d.id != id);
        if docs.len() == before {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        self.persist(&state)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        match v {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[tokio::test]
    async fn explicit_ids_collide_and_generated_ids_do_not() {
        let store = MemoryDocumentStore::new();
        let doc = store
            .create_document(Collection::Meters, DocumentId::Explicit("a".into()), fields(json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(doc.id, "a");
        assert_eq!(doc.created_at, doc.updated_at);
        assert!(timestamps::parse_timestamp(&doc.created_at).is_some());

        let err = store
            .create_document(Collection::Meters, DocumentId::Explicit("a".into()), Fields::new())
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::Conflict("a".to_string()));

        let g1 = store
            .create_document(Collection::Meters, DocumentId::Generated, Fields::new())
            .await
            .unwrap();
        let g2 = store
            .create_document(Collection::Meters, DocumentId::Generated, Fields::new())
            .await
            .unwrap();
        assert_ne!(g1.id, g2.id);
        assert_eq!(store.len(Collection::Meters), 3);
    }

    #[tokio::test]
    async fn queries_filter_order_and_limit() {
        let store = MemoryDocumentStore::new();
        for (id, day, value) in [("r1", "2024-01-01", 1.0), ("r2", "2024-01-03", 3.0), ("r3", "2024-01-02", 2.0)] {
            store
                .create_document(
                    Collection::Readings,
                    DocumentId::Explicit(id.into()),
                    fields(json!({"meter_id": "m", "reading_date": day, "reading_value": value})),
                )
                .await
                .unwrap();
        }

        let q = Query::new().equal("meter_id", "m").order_desc("reading_date").limit(2);
        let ids: Vec<String> = store
            .list_documents(Collection::Readings, &q)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["r2", "r3"]);

        let q = Query::new()
            .greater_or_equal("reading_value", 2.0)
            .less_or_equal("reading_date", "2024-01-02");
        let docs = store.list_documents(Collection::Readings, &q).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "r3");

        let q = Query::new().equal("meter_id", "other");
        assert!(store.list_documents(Collection::Readings, &q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_merges_fields_and_delete_reports_missing() {
        let store = MemoryDocumentStore::new();
        store.seed(
            Collection::Meters,
            Document {
                id: "m".into(),
                created_at: "2024-01-01T00:00:00Z".into(),
                updated_at: "2024-01-01T00:00:00Z".into(),
                fields: fields(json!({"a": 1, "b": 2})),
            },
        );

        let updated = store
            .update_document(Collection::Meters, "m", fields(json!({"b": 3})))
            .await
            .unwrap();
        assert_eq!(updated.fields.get("a"), Some(&json!(1)));
        assert_eq!(updated.fields.get("b"), Some(&json!(3)));
        assert!(updated.updated_at > updated.created_at);

        store.delete_document(Collection::Meters, "m").await.unwrap();
        assert_eq!(
            store.delete_document(Collection::Meters, "m").await.unwrap_err(),
            RemoteError::NotFound("m".into())
        );
        assert_eq!(
            store
                .update_document(Collection::Meters, "m", Fields::new())
                .await
                .unwrap_err(),
            RemoteError::NotFound("m".into())
        );
    }

    #[tokio::test]
    async fn faults_are_scoped_by_operation_and_key() {
        let store = MemoryDocumentStore::new();
        store.fail_on(Operation::Create, Collection::Readings, Some("bad"), RemoteError::RateLimited);

        let err = store
            .create_document(Collection::Readings, DocumentId::Explicit("bad".into()), Fields::new())
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::RateLimited);
        store
            .create_document(Collection::Readings, DocumentId::Explicit("good".into()), Fields::new())
            .await
            .unwrap();
        store
            .create_document(Collection::Meters, DocumentId::Explicit("bad".into()), Fields::new())
            .await
            .unwrap();

        store.clear_faults();
        store
            .create_document(Collection::Readings, DocumentId::Explicit("bad".into()), Fields::new())
            .await
            .unwrap();
        assert_eq!(store.call_count(Operation::Create), 4);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");

        {
            let store = MemoryDocumentStore::open(&path).unwrap();
            store
                .create_document(Collection::Meters, DocumentId::Explicit("m-1".into()), fields(json!({"x": true})))
                .await
                .unwrap();
        }

        let reopened = MemoryDocumentStore::open(&path).unwrap();
        let doc = reopened.get(Collection::Meters, "m-1").unwrap();
        assert_eq!(doc.fields.get("x"), Some(&json!(true)));
    }
}
