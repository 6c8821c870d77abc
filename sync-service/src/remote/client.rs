use meter_store::domain::{
    reading_key, timestamps, Meter, MeterChanges, MeterKind, NewReading, Reading,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime, Time};

use super::{Collection, Document, DocumentApi, DocumentId, Fields, Query, RemoteError, RemoteResult};

#[derive(Debug, Serialize, Deserialize)]
struct MeterFields {
    user_id: String,
    home_name: String,
    meter_name: String,
    #[serde(default)]
    meter_type: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadingFields {
    #[serde(default)]
    user_id: String,
    meter_id: String,
    reading_value: f64,
    reading_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reading_time: Option<String>,
    #[serde(default)]
    consumption_kwh: f64,
    #[serde(default)]
    created_at: Option<String>,
}

fn to_fields<T: Serialize>(value: &T) -> Fields {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Fields::new(),
    }
}

fn from_fields<T: DeserializeOwned>(doc: &Document) -> RemoteResult<T> {
    serde_json::from_value(Value::Object(doc.fields.clone())).map_err(|e| RemoteError::invalid(&doc.id, e.to_string()))
}

/// Remote freshness stamp: `updated_at`, falling back to `created_at`.
fn document_last_modified(doc: &Document) -> Option<OffsetDateTime> {
    timestamps::parse_timestamp(&doc.updated_at).or_else(|| timestamps::parse_timestamp(&doc.created_at))
}

/// Remote document fields for a local meter.
pub fn meter_fields(meter: &Meter) -> Fields {
    to_fields(&MeterFields {
        user_id: meter.owner_id.clone(),
        home_name: meter.home_name.clone(),
        meter_name: meter.meter_name.clone(),
        meter_type: Some(meter.kind.as_str().to_string()),
        created_at: Some(timestamps::format_timestamp(meter.created_at)),
        is_active: meter.is_active,
    })
}

/// Remote document fields for a local reading. The derived consumption is
/// carried for display only; it is never read back.
pub fn reading_fields(reading: &Reading) -> Fields {
    to_fields(&ReadingFields {
        user_id: reading.owner_id.clone(),
        meter_id: reading.meter_id.clone(),
        reading_value: reading.value,
        reading_date: timestamps::format_date(reading.reading_date),
        reading_time: Some(timestamps::format_time(reading.reading_time)),
        consumption_kwh: reading.consumption,
        created_at: Some(timestamps::format_timestamp(reading.created_at)),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMeter {
    pub id: String,
    pub owner_id: String,
    pub home_name: String,
    pub meter_name: String,
    pub kind: MeterKind,
    pub is_active: bool,
    pub created_at: Option<OffsetDateTime>,
    pub last_modified: Option<OffsetDateTime>,
}

impl RemoteMeter {
    pub fn from_document(doc: &Document) -> RemoteResult<Self> {
        let fields: MeterFields = from_fields(doc)?;
        let kind = match fields.meter_type.as_deref().map(str::parse::<MeterKind>) {
            Some(Ok(kind)) => kind,
            Some(Err(e)) => {
                tracing::debug!(meter_id = %doc.id, error = %e, "unknown remote meter type, assuming default");
                MeterKind::default()
            }
            None => MeterKind::default(),
        };
        let created_at = fields
            .created_at
            .as_deref()
            .and_then(timestamps::parse_timestamp)
            .or_else(|| timestamps::parse_timestamp(&doc.created_at));

        Ok(Self {
            id: doc.id.clone(),
            owner_id: fields.user_id,
            home_name: fields.home_name,
            meter_name: fields.meter_name,
            kind,
            is_active: fields.is_active,
            created_at,
            last_modified: document_last_modified(doc),
        })
    }

    pub fn label(&self) -> String {
        format!("{} / {}", self.home_name, self.meter_name)
    }

    pub fn changes(&self) -> MeterChanges {
        MeterChanges {
            home_name: self.home_name.clone(),
            meter_name: self.meter_name.clone(),
            kind: self.kind,
            is_active: self.is_active,
        }
    }

    /// Local representation. The local update stamp adopts the remote one so
    /// that the next comparison sees both copies as equally fresh.
    pub fn to_local(&self) -> Meter {
        let created_at = self
            .created_at
            .or(self.last_modified)
            .unwrap_or_else(timestamps::now_utc);

        Meter {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            home_name: self.home_name.clone(),
            meter_name: self.meter_name.clone(),
            kind: self.kind,
            created_at,
            updated_at: self.last_modified,
            is_active: self.is_active,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReading {
    pub id: String,
    pub owner_id: String,
    pub meter_id: String,
    pub value: f64,
    pub reading_date: Date,
    pub reading_time: Option<Time>,
    pub consumption: f64,
    pub created_at: Option<OffsetDateTime>,
    pub last_modified: Option<OffsetDateTime>,
}

impl RemoteReading {
    pub fn from_document(doc: &Document) -> RemoteResult<Self> {
        let fields: ReadingFields = from_fields(doc)?;
        let reading_date = timestamps::parse_date(&fields.reading_date)
            .ok_or_else(|| RemoteError::invalid(&doc.id, format!("unparseable reading_date '{}'", fields.reading_date)))?;

        Ok(Self {
            id: doc.id.clone(),
            owner_id: fields.user_id,
            meter_id: fields.meter_id,
            value: fields.reading_value,
            reading_date,
            reading_time: fields.reading_time.as_deref().and_then(timestamps::parse_time),
            consumption: fields.consumption_kwh,
            created_at: fields
                .created_at
                .as_deref()
                .and_then(timestamps::parse_timestamp)
                .or_else(|| timestamps::parse_timestamp(&doc.created_at)),
            last_modified: document_last_modified(doc),
        })
    }

    pub fn day_key(&self) -> String {
        reading_key(&self.meter_id, self.reading_date)
    }

    pub fn label(&self) -> String {
        format!("{} on {}", self.value, timestamps::format_date(self.reading_date))
    }

    /// Input for a local insert; `owner_id` is used when the document
    /// carries none.
    pub fn to_new_reading(&self, owner_id: &str) -> NewReading {
        let owner_id = if self.owner_id.is_empty() {
            owner_id.to_string()
        } else {
            self.owner_id.clone()
        };

        NewReading {
            id: self.id.clone(),
            owner_id,
            meter_id: self.meter_id.clone(),
            value: self.value,
            reading_date: self.reading_date,
            reading_time: self.reading_time,
            created_at: self.created_at.unwrap_or_else(timestamps::now_utc),
        }
    }
}

/// Typed meter/reading operations over a [`DocumentApi`].
pub struct RemoteClient<A> {
    api: A,
    page_size: usize,
}

impl<A: DocumentApi> RemoteClient<A> {
    pub fn new(api: A, page_size: usize) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Active remote meters of `owner_id`. Documents that cannot be decoded
    /// are logged and left out.
    pub async fn list_meters(&self, owner_id: &str) -> RemoteResult<Vec<RemoteMeter>> {
        let query = Query::new().equal("user_id", owner_id).limit(self.page_size);
        let docs = self.api.list_documents(Collection::Meters, &query).await?;

        Ok(docs
            .iter()
            .filter_map(|doc| match RemoteMeter::from_document(doc) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed remote meter");
                    None
                }
            })
            .filter(|m| m.is_active)
            .collect())
    }

    /// Remote readings of a meter, newest date first.
    pub async fn list_readings(&self, meter_id: &str, limit: Option<usize>) -> RemoteResult<Vec<RemoteReading>> {
        let query = Query::new()
            .equal("meter_id", meter_id)
            .order_desc("reading_date")
            .limit(limit.unwrap_or(self.page_size));
        let docs = self.api.list_documents(Collection::Readings, &query).await?;

        Ok(docs
            .iter()
            .filter_map(|doc| match RemoteReading::from_document(doc) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed remote reading");
                    None
                }
            })
            .collect())
    }

    /// Look a meter up by its natural key.
    pub async fn find_meter(&self, owner_id: &str, home_name: &str, meter_name: &str) -> RemoteResult<Option<RemoteMeter>> {
        let query = Query::new()
            .equal("user_id", owner_id)
            .equal("home_name", home_name)
            .equal("meter_name", meter_name)
            .limit(1);
        let docs = self.api.list_documents(Collection::Meters, &query).await?;

        docs.first().map(RemoteMeter::from_document).transpose()
    }

    /// Look a reading up by (owner, meter, day). Dates stored as full
    /// timestamps on that day match as well.
    pub async fn find_reading(&self, owner_id: &str, meter_id: &str, date: Date) -> RemoteResult<Option<RemoteReading>> {
        let day = timestamps::format_date(date);
        let query = Query::new()
            .equal("user_id", owner_id)
            .equal("meter_id", meter_id)
            .greater_or_equal("reading_date", day.clone())
            .less_or_equal("reading_date", format!("{day}T23:59:59.999999Z"))
            .limit(1);
        let docs = self.api.list_documents(Collection::Readings, &query).await?;

        docs.first().map(RemoteReading::from_document).transpose()
    }

    /// Create under the local id; when the id is already taken remotely, fall
    /// back to a store-generated one. Records referring to the old id are not
    /// relinked.
    pub async fn create_or_preserve_id(&self, collection: Collection, id: &str, fields: Fields) -> RemoteResult<Document> {
        match self
            .api
            .create_document(collection, DocumentId::Explicit(id.to_string()), fields.clone())
            .await
        {
            Err(RemoteError::Conflict(_)) => {
                let doc = self.api.create_document(collection, DocumentId::Generated, fields).await?;
                tracing::warn!(
                    collection = %collection,
                    original_id = %id,
                    new_id = %doc.id,
                    "remote id collision, created under a generated id"
                );
                metrics::counter!("remote_id_collisions_total").increment(1);
                Ok(doc)
            }
            other => other,
        }
    }

    pub async fn update_document(&self, collection: Collection, id: &str, fields: Fields) -> RemoteResult<Document> {
        self.api.update_document(collection, id, fields).await
    }

    pub async fn delete_document(&self, collection: Collection, id: &str) -> RemoteResult<()> {
        self.api.delete_document(collection, id).await
    }
}
