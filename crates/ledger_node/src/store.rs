//! Fjall-backed document store.
//!
//! Partitions:
//! - `docs`: document id -> `{rev, body}` JSON
//! - `changes`: big-endian update sequence -> `{id, rev}` JSON
//! - `meta`: `update_seq` -> big-endian u64
//!
//! Every write goes through one fjall batch, so `bulk_docs` lands all or
//! nothing. Revision checks and the batch run under a single write lock.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ledger_consensus::consensus::{
    next_revision, AllDocsOptions, Change, Changes, Document, PersistenceStore, Selector,
    StoreInfo,
};

const UPDATE_SEQ_KEY: &[u8] = b"update_seq";

#[derive(Serialize, Deserialize)]
struct StoredDoc {
    rev: String,
    body: Value,
}

#[derive(Serialize, Deserialize)]
struct StoredChange {
    id: String,
    rev: String,
}

pub struct FjallStore {
    keyspace: Keyspace,
    docs: PartitionHandle,
    changes: PartitionHandle,
    meta: PartitionHandle,
    /// Current update sequence; the mutex also serializes writers.
    seq: Mutex<u64>,
    durable: bool,
}

impl FjallStore {
    /// Open (or create) the store under `dir`. With `durable`, every write
    /// is synced to disk before it is acknowledged.
    pub fn open(dir: impl AsRef<Path>, durable: bool) -> anyhow::Result<Arc<Self>> {
        let dir = dir.as_ref();
        let keyspace = fjall::Config::new(dir)
            .open()
            .with_context(|| format!("open fjall keyspace at {}", dir.display()))?;
        let docs = keyspace.open_partition("docs", PartitionCreateOptions::default())?;
        let changes = keyspace.open_partition("changes", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;
        let seq = match meta.get(UPDATE_SEQ_KEY)? {
            Some(bytes) => decode_seq(&bytes)?,
            None => 0,
        };
        tracing::debug!(dir = %dir.display(), update_seq = seq, "document store opened");
        Ok(Arc::new(Self {
            keyspace,
            docs,
            changes,
            meta,
            seq: Mutex::new(seq),
            durable,
        }))
    }

    fn writer(&self) -> MutexGuard<'_, u64> {
        self.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, id: &str) -> anyhow::Result<Option<Document>> {
        let Some(bytes) = self.docs.get(id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(decode_doc(id.to_string(), &bytes)?))
    }

    /// Check revisions and write `docs` as one batch.
    fn write(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>> {
        let mut seq = self.writer();
        for doc in &docs {
            let current = self.load(&doc.id)?.and_then(|d| d.rev);
            if current != doc.rev {
                anyhow::bail!(
                    "document update conflict for {} (stored={:?}, given={:?})",
                    doc.id,
                    current,
                    doc.rev
                );
            }
        }

        let mut next = *seq;
        let mut batch = self.keyspace.batch();
        let mut written = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let rev = next_revision(doc.rev.as_deref(), &doc.body);
            next += 1;
            let stored = StoredDoc {
                rev: rev.clone(),
                body: doc.body.clone(),
            };
            let change = StoredChange {
                id: doc.id.clone(),
                rev: rev.clone(),
            };
            batch.insert(&self.docs, doc.id.as_bytes(), serde_json::to_vec(&stored)?);
            batch.insert(&self.changes, &next.to_be_bytes()[..], serde_json::to_vec(&change)?);
            doc.rev = Some(rev);
            written.push(doc);
        }
        batch.insert(&self.meta, UPDATE_SEQ_KEY, &next.to_be_bytes()[..]);
        batch.commit().context("commit document batch")?;
        if self.durable {
            self.keyspace
                .persist(PersistMode::SyncAll)
                .context("sync document batch")?;
        }
        *seq = next;
        Ok(written)
    }
}

fn decode_seq(bytes: &[u8]) -> anyhow::Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("invalid sequence length {}", bytes.len()))?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_doc(id: String, bytes: &[u8]) -> anyhow::Result<Document> {
    let stored: StoredDoc =
        serde_json::from_slice(bytes).with_context(|| format!("decode document {id}"))?;
    Ok(Document {
        id,
        rev: Some(stored.rev),
        body: stored.body,
    })
}

fn decode_entry(key: &[u8], value: &[u8]) -> anyhow::Result<Document> {
    let id = String::from_utf8(key.to_vec()).context("document id is not utf-8")?;
    decode_doc(id, value)
}

#[async_trait]
impl PersistenceStore for FjallStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Document>> {
        self.load(id)
    }

    async fn put(&self, doc: Document) -> anyhow::Result<Document> {
        let id = doc.id.clone();
        self.write(vec![doc])?
            .pop()
            .with_context(|| format!("document {id} not written"))
    }

    async fn bulk_docs(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        self.write(docs)
    }

    async fn find(&self, selector: &Selector) -> anyhow::Result<Vec<Document>> {
        let mut out = Vec::new();
        for item in self.docs.iter() {
            let (key, value) = item?;
            let doc = decode_entry(&key, &value)?;
            if selector.matches(&doc) {
                out.push(doc);
            }
        }
        Ok(out)
    }

    async fn all_docs(&self, opts: AllDocsOptions) -> anyhow::Result<Vec<Document>> {
        let limit = opts.limit.unwrap_or(usize::MAX);
        let start = opts.start_key.unwrap_or_default().into_bytes();
        let mut out = Vec::new();
        for item in self.docs.range(start..) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if let Some(end) = opts.end_key.as_deref() {
                if &*key >= end.as_bytes() {
                    break;
                }
            }
            out.push(decode_entry(&key, &value)?);
        }
        Ok(out)
    }

    async fn changes(&self, since: u64, limit: usize) -> anyhow::Result<Changes> {
        let mut results = Vec::new();
        let start = since.saturating_add(1).to_be_bytes();
        for item in self.changes.range(start..) {
            if results.len() >= limit {
                break;
            }
            let (key, value) = item?;
            let change: StoredChange = serde_json::from_slice(&value).context("decode change")?;
            results.push(Change {
                seq: decode_seq(&key)?,
                id: change.id,
                rev: change.rev,
            });
        }
        let last_seq = results.last().map(|c| c.seq).unwrap_or(since);
        Ok(Changes { last_seq, results })
    }

    async fn info(&self) -> anyhow::Result<StoreInfo> {
        let update_seq = *self.writer();
        Ok(StoreInfo {
            doc_count: self.docs.len()? as u64,
            update_seq,
        })
    }
}
