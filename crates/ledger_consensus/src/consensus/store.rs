//! Persistence interface consumed by the engine, plus an in-memory store.
//!
//! Documents are JSON bodies addressed by id and versioned by a revision
//! string. Revisions are derived from the body, so two nodes that apply the
//! same sequence of writes end up with identical revisions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::Umid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Revision the write is based on (`None` for a new document); after a
    /// write, the revision assigned by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            rev: None,
            body,
        }
    }

    pub fn with_rev(mut self, rev: Option<String>) -> Self {
        self.rev = rev;
        self
    }
}

/// Next revision for a document written on top of `current`.
pub fn next_revision(current: Option<&str>, body: &Value) -> String {
    let generation = current
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let digest = blake3::hash(&bytes).to_hex();
    format!("{}-{}", generation + 1, &digest.as_str()[..16])
}

/// Equality selector over JSON pointer paths, optionally restricted to ids
/// with a given suffix.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_suffix: Option<String>,
}

impl Selector {
    /// `field` is a dotted path (`funds.usd`) or a JSON pointer (`/funds/usd`).
    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.fields.insert(to_pointer(field), value);
        self
    }

    pub fn id_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.id_suffix = Some(suffix.into());
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(suffix) = &self.id_suffix {
            if !doc.id.ends_with(suffix.as_str()) {
                return false;
            }
        }
        self.fields
            .iter()
            .all(|(pointer, expected)| doc.body.pointer(pointer) == Some(expected))
    }
}

fn to_pointer(field: &str) -> String {
    if field.starts_with('/') {
        field.to_string()
    } else {
        format!("/{}", field.replace('.', "/"))
    }
}

#[derive(Clone, Debug, Default)]
pub struct AllDocsOptions {
    pub start_key: Option<String>,
    /// Exclusive upper bound.
    pub end_key: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub seq: u64,
    pub id: String,
    pub rev: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Changes {
    pub last_seq: u64,
    pub results: Vec<Change>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub doc_count: u64,
    pub update_seq: u64,
}

/// Document storage used for activity streams and transaction records.
///
/// `put` and `bulk_docs` reject writes whose base revision does not match the
/// stored one. `bulk_docs` is all-or-nothing.
#[async_trait]
pub trait PersistenceStore: Send + Sync + 'static {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Document>>;

    async fn put(&self, doc: Document) -> anyhow::Result<Document>;

    async fn bulk_docs(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>>;

    async fn find(&self, selector: &Selector) -> anyhow::Result<Vec<Document>>;

    async fn all_docs(&self, opts: AllDocsOptions) -> anyhow::Result<Vec<Document>>;

    async fn changes(&self, since: u64, limit: usize) -> anyhow::Result<Changes>;

    async fn info(&self) -> anyhow::Result<StoreInfo>;
}

/// Read access to stream state for contracts that declare the Query capability.
#[async_trait]
pub trait QueryEngine: Send + Sync + 'static {
    async fn find(&self, selector: &Selector) -> anyhow::Result<Vec<Value>>;
}

/// An event emitted by a contract during commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub name: String,
    pub data: Value,
}

/// Destination for events of committed transactions.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, umid: &Umid, contract: &str, events: Vec<ContractEvent>)
        -> anyhow::Result<()>;
}

/// In-memory `PersistenceStore`.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    docs: BTreeMap<String, Document>,
    changes: VecDeque<Change>,
    seq: u64,
}

/// Number of change entries retained by the in-memory store.
const MEMORY_CHANGES_RETAINED: usize = 16_384;

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(MemoryInner::default()),
        })
    }

    fn read(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, MemoryInner>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    fn write(&self) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, MemoryInner>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }
}

impl MemoryInner {
    fn check_rev(&self, doc: &Document) -> anyhow::Result<()> {
        let current = self.docs.get(&doc.id).and_then(|d| d.rev.as_deref());
        if current != doc.rev.as_deref() {
            anyhow::bail!(
                "document update conflict for {} (stored={:?}, given={:?})",
                doc.id,
                current,
                doc.rev
            );
        }
        Ok(())
    }

    fn apply(&mut self, mut doc: Document) -> Document {
        let rev = next_revision(doc.rev.as_deref(), &doc.body);
        doc.rev = Some(rev.clone());
        self.seq += 1;
        self.changes.push_back(Change {
            seq: self.seq,
            id: doc.id.clone(),
            rev,
        });
        while self.changes.len() > MEMORY_CHANGES_RETAINED {
            self.changes.pop_front();
        }
        self.docs.insert(doc.id.clone(), doc.clone());
        doc
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Document>> {
        Ok(self.read()?.docs.get(id).cloned())
    }

    async fn put(&self, doc: Document) -> anyhow::Result<Document> {
        let mut inner = self.write()?;
        inner.check_rev(&doc)?;
        Ok(inner.apply(doc))
    }

    async fn bulk_docs(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>> {
        let mut inner = self.write()?;
        for doc in &docs {
            inner.check_rev(doc)?;
        }
        Ok(docs.into_iter().map(|doc| inner.apply(doc)).collect())
    }

    async fn find(&self, selector: &Selector) -> anyhow::Result<Vec<Document>> {
        Ok(self
            .read()?
            .docs
            .values()
            .filter(|doc| selector.matches(doc))
            .cloned()
            .collect())
    }

    async fn all_docs(&self, opts: AllDocsOptions) -> anyhow::Result<Vec<Document>> {
        let inner = self.read()?;
        let limit = opts.limit.unwrap_or(usize::MAX);
        Ok(inner
            .docs
            .values()
            .filter(|doc| opts.start_key.as_deref().map_or(true, |s| doc.id.as_str() >= s))
            .filter(|doc| opts.end_key.as_deref().map_or(true, |e| doc.id.as_str() < e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn changes(&self, since: u64, limit: usize) -> anyhow::Result<Changes> {
        let inner = self.read()?;
        let results = inner
            .changes
            .iter()
            .filter(|c| c.seq > since)
            .take(limit)
            .cloned()
            .collect::<Vec<_>>();
        let last_seq = results.last().map(|c| c.seq).unwrap_or(since);
        Ok(Changes { last_seq, results })
    }

    async fn info(&self) -> anyhow::Result<StoreInfo> {
        let inner = self.read()?;
        Ok(StoreInfo {
            doc_count: inner.docs.len() as u64,
            update_seq: inner.seq,
        })
    }
}

/// Query engine over the state documents of a `PersistenceStore`.
///
/// Each result is the stream state with its stream id under `_id`.
pub struct StoreQuery {
    store: Arc<dyn PersistenceStore>,
}

impl StoreQuery {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait]
impl QueryEngine for StoreQuery {
    async fn find(&self, selector: &Selector) -> anyhow::Result<Vec<Value>> {
        let selector = selector.clone().id_suffix(super::stream::STATE_SUFFIX);
        let docs = self.store.find(&selector).await?;
        Ok(docs
            .into_iter()
            .map(|doc| {
                let stream_id = doc
                    .id
                    .strip_suffix(super::stream::STATE_SUFFIX)
                    .unwrap_or(&doc.id)
                    .to_string();
                let mut body = doc.body;
                if let Value::Object(map) = &mut body {
                    map.insert("_id".to_string(), Value::String(stream_id));
                }
                body
            })
            .collect())
    }
}

/// Event sink that stores events as `<umid>:event:<n>` documents.
pub struct StoreEvents {
    store: Arc<dyn PersistenceStore>,
}

impl StoreEvents {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait]
impl EventSink for StoreEvents {
    async fn emit(
        &self,
        umid: &Umid,
        contract: &str,
        events: Vec<ContractEvent>,
    ) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let docs = events
            .into_iter()
            .enumerate()
            .map(|(idx, event)| {
                Document::new(
                    format!("{umid}:event:{idx}"),
                    serde_json::json!({
                        "umid": umid,
                        "contract": contract,
                        "name": event.name,
                        "data": event.data,
                    }),
                )
            })
            .collect::<Vec<_>>();
        self.store.bulk_docs(docs).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revisions_are_deterministic_and_advance() {
        let body = json!({"a": 1});
        let first = next_revision(None, &body);
        assert!(first.starts_with("1-"));
        assert_eq!(first, next_revision(None, &body));
        let second = next_revision(Some(&first), &body);
        assert!(second.starts_with("2-"));
        assert_ne!(first, next_revision(None, &json!({"a": 2})));
    }

    #[tokio::test]
    async fn put_checks_revisions() {
        let store = MemoryStore::new();
        let written = store.put(Document::new("a", json!({"v": 1}))).await.unwrap();
        assert!(written.rev.is_some());

        // Writing without the current revision conflicts.
        assert!(store.put(Document::new("a", json!({"v": 2}))).await.is_err());

        let updated = store
            .put(Document::new("a", json!({"v": 2})).with_rev(written.rev.clone()))
            .await
            .unwrap();
        assert!(updated.rev.unwrap().starts_with("2-"));
        assert_eq!(store.get("a").await.unwrap().unwrap().body, json!({"v": 2}));
    }

    #[tokio::test]
    async fn bulk_docs_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.put(Document::new("taken", json!({}))).await.unwrap();
        let result = store
            .bulk_docs(vec![
                Document::new("fresh", json!({"x": 1})),
                Document::new("taken", json!({"x": 2})),
            ])
            .await;
        assert!(result.is_err());
        assert!(store.get("fresh").await.unwrap().is_none());
        assert_eq!(store.info().await.unwrap().doc_count, 1);
    }

    #[tokio::test]
    async fn find_all_docs_and_changes() {
        let store = MemoryStore::new();
        store
            .bulk_docs(vec![
                Document::new("s1:stream", json!({"type": "namespace", "namespace": "acme"})),
                Document::new("s2:stream", json!({"type": "namespace", "namespace": "other"})),
                Document::new("s1", json!({"namespace": "acme"})),
            ])
            .await
            .unwrap();

        let selector = Selector::default()
            .eq("namespace", json!("acme"))
            .id_suffix(":stream");
        let found = store.find(&selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "s1:stream");

        let docs = store
            .all_docs(AllDocsOptions {
                start_key: Some("s1".into()),
                end_key: Some("s2".into()),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);

        let changes = store.changes(1, 10).await.unwrap();
        assert_eq!(changes.results.len(), 2);
        assert_eq!(changes.last_seq, 3);
        assert_eq!(store.info().await.unwrap().update_seq, 3);
    }

    #[tokio::test]
    async fn query_engine_reads_stream_state() {
        let store = MemoryStore::new();
        store
            .bulk_docs(vec![
                Document::new("id1:stream", json!({"funds": {"usd": 5}})),
                Document::new("id1", json!({"funds": {"usd": 5}})),
            ])
            .await
            .unwrap();
        let query = StoreQuery::new(store);
        let rows = query
            .find(&Selector::default().eq("funds.usd", json!(5)))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_id"], json!("id1"));
    }
}
