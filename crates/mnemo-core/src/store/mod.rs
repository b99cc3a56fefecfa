//! Document-store collaborator interface
//!
//! The preference manager and notification queue persist through this trait.
//! Production embedders back it with their cloud document store; the
//! in-memory implementation here serves tests and hosts without one.

mod memory;

pub use memory::MemoryDocumentStore;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// A stored document: its key plus JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Key within the collection
    pub key: String,
    /// Document body
    pub value: Value,
}

/// Comparison operator for a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Field equals value
    Eq,
    /// Field less than value
    Lt,
    /// Field less than or equal to value
    Lte,
    /// Field greater than value
    Gt,
    /// Field greater than or equal to value
    Gte,
}

/// A single query filter on a top-level document field.
#[derive(Debug, Clone)]
pub struct Filter {
    /// Field name
    pub field: String,
    /// Comparison operator
    pub op: FilterOp,
    /// Value to compare against
    pub value: Value,
}

impl Filter {
    /// Equality filter.
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Range filter.
    #[must_use]
    pub fn cmp(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

/// Result ordering for a query.
#[derive(Debug, Clone)]
pub enum Order {
    /// Ascending by field
    Asc(String),
    /// Descending by field
    Desc(String),
}

/// Asynchronous document store.
///
/// Timestamps inside documents are stored as RFC 3339 UTC strings so that
/// lexicographic comparison matches chronological order in range filters.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by key. `Ok(None)` when absent.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Write a document. With `merge`, top-level fields are merged into any
    /// existing document instead of replacing it.
    async fn set(&self, collection: &str, key: &str, value: Value, merge: bool) -> Result<()>;

    /// Query a collection with conjunctive filters.
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        order: Option<Order>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;

    /// Delete a document. Deleting an absent key is not an error.
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;

    /// Live-update feed for one document. The receiver yields the new value
    /// after every `set` until dropped.
    async fn subscribe(&self, collection: &str, key: &str) -> Result<mpsc::Receiver<Value>>;
}
