//! Remote document store boundary.
//!
//! The sync core only depends on [`DocumentApi`]: list by filters, create with
//! an explicit or generated id, update and delete by id. [`RemoteClient`]
//! layers the meter/reading vocabulary on top of it.

pub mod client;
pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::{RemoteClient, RemoteMeter, RemoteReading};
pub use memory::{MemoryDocumentStore, Operation};

pub type Fields = serde_json::Map<String, Value>;
pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Meters,
    Readings,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meters => "meters",
            Self::Readings => "readings",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document. `created_at`/`updated_at` are stamped by the store on
/// every write and are not part of `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentId {
    /// Create under this id; fails with [`RemoteError::Conflict`] if taken.
    Explicit(String),
    Generated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equal(String, Value),
    GreaterOrEqual(String, Value),
    LessOrEqual(String, Value),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_desc: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Equal(field.to_string(), value.into()));
        self
    }

    pub fn greater_or_equal(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::GreaterOrEqual(field.to_string(), value.into()));
        self
    }

    pub fn less_or_equal(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::LessOrEqual(field.to_string(), value.into()));
        self
    }

    pub fn order_desc(mut self, field: &str) -> Self {
        self.order_desc = Some(field.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("rate limited by remote store")]
    RateLimited,
    #[error("document {0} not found")]
    NotFound(String),
    #[error("document id {0} already exists")]
    Conflict(String),
    #[error("invalid document {id}: {message}")]
    InvalidDocument { id: String, message: String },
}

impl RemoteError {
    pub(crate) fn invalid(id: &str, message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            id: id.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait DocumentApi: Send + Sync {
    async fn list_documents(&self, collection: Collection, query: &Query) -> RemoteResult<Vec<Document>>;

    async fn create_document(&self, collection: Collection, id: DocumentId, fields: Fields) -> RemoteResult<Document>;

    /// Merge `fields` into an existing document.
    async fn update_document(&self, collection: Collection, id: &str, fields: Fields) -> RemoteResult<Document>;

    async fn delete_document(&self, collection: Collection, id: &str) -> RemoteResult<()>;
}
