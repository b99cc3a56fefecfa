//! In-memory document store
//!
//! Backs tests and embedders that do not bring a cloud store. Supports the
//! full trait surface including merge writes and live subscriptions.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::Result;

use super::{Document, DocumentStore, Filter, FilterOp, Order};

type Collections = HashMap<String, HashMap<String, Value>>;
type Subscribers = HashMap<(String, String), Vec<mpsc::Sender<Value>>>;

/// In-memory [`DocumentStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<Collections>,
    subscribers: RwLock<Subscribers>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn notify(&self, collection: &str, key: &str, value: &Value) {
        let mut subs = self.subscribers.write().await;
        if let Some(senders) = subs.get_mut(&(collection.to_string(), key.to_string())) {
            senders.retain(|tx| tx.try_send(value.clone()).is_ok());
        }
    }
}

fn merge_into(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(update)) => {
            for (k, v) in update {
                existing.insert(k, v);
            }
        }
        (target, incoming) => *target = incoming,
    }
}

fn matches(doc: &Value, filter: &Filter) -> bool {
    let Some(field) = doc.get(&filter.field) else {
        return false;
    };
    match filter.op {
        FilterOp::Eq => field == &filter.value,
        FilterOp::Lt => compare(field, &filter.value) == Some(std::cmp::Ordering::Less),
        FilterOp::Lte => matches!(
            compare(field, &filter.value),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        FilterOp::Gt => compare(field, &filter.value) == Some(std::cmp::Ordering::Greater),
        FilterOp::Gte => matches!(
            compare(field, &filter.value),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn set(&self, collection: &str, key: &str, value: Value, merge: bool) -> Result<()> {
        let stored = {
            let mut collections = self.collections.write().await;
            let docs = collections.entry(collection.to_string()).or_default();
            match docs.get_mut(key) {
                Some(existing) if merge => {
                    merge_into(existing, value);
                    existing.clone()
                }
                _ => {
                    docs.insert(key.to_string(), value.clone());
                    value
                }
            }
        };
        self.notify(collection, key, &stored).await;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        order: Option<Order>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let collections = self.collections.read().await;
        let mut results: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, value)| filters.iter().all(|f| matches(value, f)))
                    .map(|(key, value)| Document {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = order {
            let (field, descending) = match order {
                Order::Asc(field) => (field, false),
                Order::Desc(field) => (field, true),
            };
            results.sort_by(|a, b| {
                let ord = match (a.value.get(&field), b.value.get(&field)) {
                    (Some(x), Some(y)) => {
                        compare(x, y).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                if descending { ord.reverse() } else { ord }
            });
        }

        if let Some(limit) = limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(key);
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &str, key: &str) -> Result<mpsc::Receiver<Value>> {
        let (tx, rx) = mpsc::channel(16);
        let mut subs = self.subscribers.write().await;
        subs.entry((collection.to_string(), key.to_string()))
            .or_default()
            .push(tx);
        debug!(collection, key, "document subscription added");
        Ok(rx)
    }
}
