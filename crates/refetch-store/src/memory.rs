use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::document::{Document, Filter, IndexSpec, Update, parse_datetime};
use crate::store::{
    DocumentStore, FindAndUpdateOptions, FindAndUpdateResult, StoreError,
};

/// An in-memory [`DocumentStore`] backend.
///
/// All operations are trivially atomic under a single mutex. TTL indexes are
/// emulated lazily: expired documents are discarded whenever the collection
/// is accessed, which is indistinguishable from store-side expiry for
/// callers that only use the trait surface.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<String, Document>,
    indexes: Vec<IndexSpec>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) documents.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_due();
        inner.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    /// Discards documents whose TTL-indexed timestamp has passed.
    fn expire_due(&mut self) {
        let now = Utc::now();
        for index in &self.indexes {
            let Some(expire_after) = index.expire_after else {
                continue;
            };
            let Some(field) = index.fields.first() else {
                continue;
            };
            let cutoff = now
                - chrono::Duration::from_std(expire_after)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
            self.docs.retain(|_, doc| {
                match doc.get(field).and_then(parse_datetime) {
                    Some(ts) => ts > cutoff,
                    // Documents without the indexed field never expire.
                    None => true,
                }
            });
        }
    }

    fn find(&self, filter: &Filter) -> Option<&Document> {
        self.docs.get(&filter.id).filter(|doc| filter.matches(doc))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(
        &self,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Result<Option<Document>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_due();
        Ok(inner.find(filter).map(|doc| match projection {
            Some(fields) => doc.project(fields),
            None => doc.clone(),
        }))
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        options: FindAndUpdateOptions,
    ) -> Result<FindAndUpdateResult, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_due();
        if inner.find(filter).is_none() {
            return Ok(FindAndUpdateResult::default());
        }

        let doc = inner.docs.get_mut(&filter.id).expect("matched above");
        let previous = doc.clone();
        update.apply_to(doc);
        let returned = if options.return_new {
            doc.clone()
        } else {
            previous
        };
        let returned = match options.projection.as_deref() {
            Some(fields) => {
                let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
                returned.project(&fields)
            }
            None => returned,
        };

        Ok(FindAndUpdateResult {
            matched: true,
            value: Some(returned),
        })
    }

    async fn replace_one(
        &self,
        filter: &Filter,
        document: Document,
        upsert: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_due();
        if inner.find(filter).is_some() {
            inner.docs.insert(document.id.clone(), document);
        } else if upsert {
            inner.docs.insert(document.id.clone(), document);
        }
        Ok(())
    }

    async fn insert_one(&self, document: Document) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_due();
        if inner.docs.contains_key(&document.id) {
            return Err(StoreError::DuplicateKey(document.id));
        }
        inner.docs.insert(document.id.clone(), document);
        Ok(())
    }

    async fn delete_one(&self, filter: &Filter) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_due();
        if inner.find(filter).is_some() {
            inner.docs.remove(&filter.id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.indexes.contains(&spec) {
            tracing::debug!(fields = ?spec.fields, ttl = ?spec.expire_after, "creating index");
            inner.indexes.push(spec);
        }
        Ok(())
    }
}
