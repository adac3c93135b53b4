//! In-memory [`DocumentStore`] for tests.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};

use crate::engine::document::dispatcher::{DocumentStore, DocumentStream, UpdateOutcome};
use crate::engine::document::operation::{CursorModifiers, UpdateSpec};
use crate::engine::error::{EngineError, EngineResult};

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, Vec<Document>>,
    failures: VecDeque<EngineError>,
    cursor_fail_after: Option<usize>,
    last_pipeline: Option<Vec<Document>>,
    closed: bool,
}

/// Collections held in memory; supports equality and `$in` filters,
/// `$set` updates and the `$match`/`$sample` stages.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    calls: AtomicUsize,
    latency: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn seed(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        self.inner
            .lock()
            .unwrap()
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of native calls that reached the store.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, err: EngineError) {
        self.inner.lock().unwrap().failures.push_back(err);
    }

    /// The next cursor yields `n` documents, then a decode error.
    pub fn fail_cursor_after(&self, n: usize) {
        self.inner.lock().unwrap().cursor_fail_after = Some(n);
    }

    pub fn last_pipeline(&self) -> Option<Vec<Document>> {
        self.inner.lock().unwrap().last_pipeline.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    async fn enter(&self) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.inner.lock().unwrap().failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stream(&self, documents: Vec<Document>) -> DocumentStream {
        let fail_after = self.inner.lock().unwrap().cursor_fail_after.take();
        let items: Vec<EngineResult<Document>> = match fail_after {
            Some(n) => documents
                .into_iter()
                .take(n)
                .map(Ok)
                .chain(std::iter::once(Err(EngineError::execution_error(
                    "Failed to decode document",
                ))))
                .collect(),
            None => documents.into_iter().map(Ok).collect(),
        };
        futures::stream::iter(items).boxed()
    }

    fn matching(&self, collection: &str, filter: &Document) -> Vec<Document> {
        self.documents(collection)
            .into_iter()
            .filter(|document| matches_filter(document, filter))
            .collect()
    }

    fn update(&self, collection: &str, filter: &Document, update: UpdateSpec, many: bool) -> EngineResult<UpdateOutcome> {
        let UpdateSpec::Document(update) = update else {
            return Err(EngineError::not_supported("Pipeline updates"));
        };
        let set = update.get_document("$set").cloned().unwrap_or_default();

        let mut inner = self.inner.lock().unwrap();
        let documents = inner.collections.entry(collection.to_string()).or_default();
        let mut outcome = UpdateOutcome {
            matched: 0,
            modified: 0,
            upserted: 0,
        };
        for document in documents.iter_mut().filter(|d| matches_filter(d, filter)) {
            outcome.matched += 1;
            let before = document.clone();
            for (key, value) in &set {
                document.insert(key.clone(), value.clone());
            }
            if *document != before {
                outcome.modified += 1;
            }
            if !many {
                break;
            }
        }
        Ok(outcome)
    }

    fn delete(&self, collection: &str, filter: &Document, many: bool) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let Some(documents) = inner.collections.get_mut(collection) else {
            return 0;
        };
        let mut deleted = 0;
        documents.retain(|document| {
            if (many || deleted == 0) && matches_filter(document, filter) {
                deleted += 1;
                false
            } else {
                true
            }
        });
        deleted
    }
}

fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| {
        let actual = document.get(key);
        match expected {
            Bson::Document(operator) if operator.contains_key("$in") => match operator.get_array("$in") {
                Ok(candidates) => actual.is_some_and(|value| candidates.contains(value)),
                Err(_) => false,
            },
            expected => actual == Some(expected),
        }
    })
}

fn compare(a: Option<&Bson>, b: Option<&Bson>) -> CmpOrdering {
    let number = |value: Option<&Bson>| match value {
        Some(Bson::Int32(v)) => Some(f64::from(*v)),
        Some(Bson::Int64(v)) => Some(*v as f64),
        Some(Bson::Double(v)) => Some(*v),
        _ => None,
    };
    match (number(a), number(b), a, b) {
        (Some(x), Some(y), _, _) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
        (_, _, Some(Bson::String(x)), Some(Bson::String(y))) => x.cmp(y),
        _ => CmpOrdering::Equal,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(&self, collection: &str, filter: Document) -> EngineResult<Option<Document>> {
        self.enter().await?;
        Ok(self.matching(collection, &filter).into_iter().next())
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        modifiers: CursorModifiers,
    ) -> EngineResult<DocumentStream> {
        self.enter().await?;
        let mut documents = self.matching(collection, &filter);
        if let Some(sort) = &modifiers.sort {
            documents.sort_by(|a, b| {
                sort.iter()
                    .map(|(key, direction)| {
                        let ordering = compare(a.get(key), b.get(key));
                        if direction.as_i32() == Some(-1) || direction.as_i64() == Some(-1) {
                            ordering.reverse()
                        } else {
                            ordering
                        }
                    })
                    .find(|ordering| *ordering != CmpOrdering::Equal)
                    .unwrap_or(CmpOrdering::Equal)
            });
        }
        let skip = modifiers.skip.unwrap_or(0) as usize;
        let documents: Vec<Document> = match modifiers.limit {
            Some(limit) if limit != 0 => documents
                .into_iter()
                .skip(skip)
                .take(limit.unsigned_abs() as usize)
                .collect(),
            _ => documents.into_iter().skip(skip).collect(),
        };
        Ok(self.stream(documents))
    }

    async fn insert_one(&self, collection: &str, mut document: Document) -> EngineResult<Bson> {
        self.enter().await?;
        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                document.insert("_id", id.clone());
                id
            }
        };
        self.seed(collection, [document]);
        Ok(id)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> EngineResult<Vec<Bson>> {
        self.enter().await?;
        let mut ids = Vec::with_capacity(documents.len());
        let mut stored = Vec::with_capacity(documents.len());
        for mut document in documents {
            let id = match document.get("_id") {
                Some(id) => id.clone(),
                None => {
                    let id = Bson::ObjectId(ObjectId::new());
                    document.insert("_id", id.clone());
                    id
                }
            };
            ids.push(id);
            stored.push(document);
        }
        self.seed(collection, stored);
        Ok(ids)
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> EngineResult<u64> {
        self.enter().await?;
        Ok(self.delete(collection, &filter, false))
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> EngineResult<u64> {
        self.enter().await?;
        Ok(self.delete(collection, &filter, true))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateSpec,
    ) -> EngineResult<UpdateOutcome> {
        self.enter().await?;
        self.update(collection, &filter, update, false)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateSpec,
    ) -> EngineResult<UpdateOutcome> {
        self.enter().await?;
        self.update(collection, &filter, update, true)
    }

    async fn run_command(&self, command: Document) -> EngineResult<Document> {
        self.enter().await?;
        let name = command.keys().next().cloned().unwrap_or_default();
        Ok(doc! { "ok": 1.0, "command": name })
    }

    async fn list_indexes(&self, _collection: &str) -> EngineResult<DocumentStream> {
        self.enter().await?;
        Ok(self.stream(vec![doc! { "v": 2, "key": { "_id": 1 }, "name": "_id_" }]))
    }

    async fn list_collection_names(&self, filter: Document) -> EngineResult<Vec<String>> {
        self.enter().await?;
        let names = self.inner.lock().unwrap().collections.keys().cloned().collect::<Vec<_>>();
        Ok(match filter.get_str("name") {
            Ok(wanted) => names.into_iter().filter(|name| name == wanted).collect(),
            Err(_) => names,
        })
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> EngineResult<u64> {
        self.enter().await?;
        Ok(self.matching(collection, &filter).len() as u64)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> EngineResult<DocumentStream> {
        self.enter().await?;
        self.inner.lock().unwrap().last_pipeline = Some(pipeline.clone());

        let mut documents = self.documents(collection);
        for stage in &pipeline {
            if let Ok(filter) = stage.get_document("$match") {
                documents.retain(|document| matches_filter(document, filter));
            } else if let Ok(sample) = stage.get_document("$sample") {
                let size = sample
                    .get("size")
                    .and_then(|size| size.as_i64().or_else(|| size.as_i32().map(i64::from)))
                    .unwrap_or(0);
                documents.truncate(size.max(0) as usize);
            } else {
                return Err(EngineError::not_supported(format!("Stage {}", stage)));
            }
        }
        Ok(self.stream(documents))
    }

    async fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }
}
