//! Activity streams: the cached, mutable view of one ledger entity.
//!
//! A stream is stored as three documents: `<id>` holds the system-owned
//! metadata, `<id>:stream` the contract-owned state and `<id>:volatile` the
//! off-ledger volatile data. Writes are buffered and tracked per facet until
//! the coordinator persists every touched stream in one batch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::contract::Rejection;
use super::store::Document;
use super::types::{StreamId, StreamRecord, Umid};

pub const STATE_SUFFIX: &str = ":stream";
pub const VOLATILE_SUFFIX: &str = ":volatile";

pub fn state_doc_id(id: &str) -> String {
    format!("{id}{STATE_SUFFIX}")
}

pub fn volatile_doc_id(id: &str) -> String {
    format!("{id}{VOLATILE_SUFFIX}")
}

/// Deterministic id for the `ordinal`-th stream created by transaction `umid`.
pub fn derive_stream_id(umid: &str, ordinal: usize) -> StreamId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(umid.as_bytes());
    hasher.update(&(ordinal as u64).to_be_bytes());
    hasher.finalize().to_hex().to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    #[serde(rename = "$stream", default)]
    pub stream: bool,
    #[serde(rename = "$constructor", default)]
    pub constructor: bool,
    /// Transaction that created the stream.
    #[serde(rename = "$umid", default, skip_serializing_if = "Option::is_none")]
    pub umid: Option<Umid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
    /// blake3 of the state document, refreshed on persist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Contracts (`namespace/contract`) allowed to touch the stream. Empty
    /// means any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract_lock: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub acl: Map<String, Value>,
}

impl StreamMeta {
    pub fn allows_contract(&self, contract_ref: &str) -> bool {
        self.contract_lock.is_empty() || self.contract_lock.iter().any(|c| c == contract_ref)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Dirty {
    meta: bool,
    state: bool,
    volatile: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Revisions {
    meta: Option<String>,
    state: Option<String>,
    volatile: Option<String>,
}

/// Read-only copy of a stream as returned by lookups.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamView {
    pub id: StreamId,
    pub meta: StreamMeta,
    pub state: Value,
    pub volatile: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ActivityStream {
    id: StreamId,
    meta: StreamMeta,
    state: Value,
    volatile: Value,
    revs: Revisions,
    dirty: Dirty,
    /// State writes are accepted only while the owning transaction commits.
    writable: bool,
}

impl ActivityStream {
    /// A brand-new entity created by transaction `umid`.
    pub fn constructed(id: StreamId, umid: &str, name: Option<String>) -> Self {
        Self {
            id,
            meta: StreamMeta {
                stream: true,
                constructor: true,
                umid: Some(umid.to_string()),
                name,
                ..StreamMeta::default()
            },
            state: Value::Object(Map::new()),
            volatile: Value::Object(Map::new()),
            revs: Revisions::default(),
            dirty: Dirty {
                meta: true,
                state: true,
                volatile: true,
            },
            writable: false,
        }
    }

    /// Rebuild a stream from its stored facets. `None` when the meta document
    /// does not exist.
    pub fn from_documents(
        id: StreamId,
        meta: Option<Document>,
        state: Option<Document>,
        volatile: Option<Document>,
    ) -> anyhow::Result<Option<Self>> {
        let Some(meta_doc) = meta else {
            return Ok(None);
        };
        let parsed: StreamMeta = serde_json::from_value(meta_doc.body)
            .map_err(|e| anyhow::anyhow!("stream {id} has malformed metadata: {e}"))?;
        let (state, state_rev) = split_doc(state);
        let (volatile, volatile_rev) = split_doc(volatile);
        Ok(Some(Self {
            id,
            meta: parsed,
            state,
            volatile,
            revs: Revisions {
                meta: meta_doc.rev,
                state: state_rev,
                volatile: volatile_rev,
            },
            dirty: Dirty::default(),
            writable: false,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn meta(&self) -> &StreamMeta {
        &self.meta
    }

    pub fn get_state(&self) -> &Value {
        &self.state
    }

    pub fn get_volatile(&self) -> &Value {
        &self.volatile
    }

    pub fn get_name(&self) -> Option<&str> {
        self.meta.name.as_deref()
    }

    pub fn is_constructor(&self) -> bool {
        self.revs.meta.is_none() && self.meta.constructor
    }

    /// Revision of the state document as loaded (the transaction pre-image).
    pub fn state_revision(&self) -> Option<&str> {
        self.revs.state.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.meta || self.dirty.state || self.dirty.volatile
    }

    pub fn set_state(&mut self, doc: Value) -> Result<(), Rejection> {
        if !self.writable {
            return Err(Rejection::new(format!(
                "stream {} state is read-only outside commit",
                self.id
            )));
        }
        self.state = doc;
        self.dirty.state = true;
        Ok(())
    }

    /// Volatile data is not consensus-relevant and may change in any phase.
    pub fn set_volatile(&mut self, doc: Value) {
        self.volatile = doc;
        self.dirty.volatile = true;
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), Rejection> {
        self.meta_write()?;
        self.meta.name = Some(name.into());
        Ok(())
    }

    pub fn set_authority(
        &mut self,
        public_key: impl Into<String>,
        key_type: impl Into<String>,
    ) -> Result<(), Rejection> {
        self.meta_write()?;
        self.meta.public_key = Some(public_key.into());
        self.meta.key_type = Some(key_type.into());
        Ok(())
    }

    fn meta_write(&mut self) -> Result<(), Rejection> {
        if !self.writable {
            return Err(Rejection::new(format!(
                "stream {} metadata is read-only outside commit",
                self.id
            )));
        }
        self.dirty.meta = true;
        Ok(())
    }

    pub(crate) fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn record(&self) -> StreamRecord {
        StreamRecord {
            id: self.id.clone(),
            name: self.meta.name.clone(),
        }
    }

    pub fn view(&self) -> StreamView {
        StreamView {
            id: self.id.clone(),
            meta: self.meta.clone(),
            state: self.state.clone(),
            volatile: self.volatile.clone(),
            rev: self.revs.state.clone(),
        }
    }

    /// Documents for every dirty facet, based on the loaded revisions.
    ///
    /// A state change refreshes the content hash and so dirties the meta
    /// facet as well.
    pub fn documents(&mut self) -> Vec<Document> {
        if self.dirty.state {
            let bytes = serde_json::to_vec(&self.state).unwrap_or_default();
            self.meta.hash = Some(blake3::hash(&bytes).to_hex().to_string());
            self.dirty.meta = true;
        }
        let mut docs = Vec::with_capacity(3);
        if self.dirty.meta {
            let body = serde_json::to_value(&self.meta).unwrap_or(Value::Null);
            docs.push(Document::new(self.id.clone(), body).with_rev(self.revs.meta.clone()));
        }
        if self.dirty.state {
            docs.push(
                Document::new(state_doc_id(&self.id), self.state.clone())
                    .with_rev(self.revs.state.clone()),
            );
        }
        if self.dirty.volatile {
            docs.push(
                Document::new(volatile_doc_id(&self.id), self.volatile.clone())
                    .with_rev(self.revs.volatile.clone()),
            );
        }
        docs
    }

    /// Documents for the volatile facet only, if it changed.
    pub fn volatile_documents(&self) -> Vec<Document> {
        if !self.dirty.volatile {
            return Vec::new();
        }
        vec![Document::new(volatile_doc_id(&self.id), self.volatile.clone())
            .with_rev(self.revs.volatile.clone())]
    }

    /// Record the revisions assigned by the store and clear the matching
    /// dirty flags.
    pub fn persisted(&mut self, written: &[Document]) {
        let state_id = state_doc_id(&self.id);
        let volatile_id = volatile_doc_id(&self.id);
        for doc in written {
            if doc.id == self.id {
                self.revs.meta = doc.rev.clone();
                self.dirty.meta = false;
            } else if doc.id == state_id {
                self.revs.state = doc.rev.clone();
                self.dirty.state = false;
            } else if doc.id == volatile_id {
                self.revs.volatile = doc.rev.clone();
                self.dirty.volatile = false;
            }
        }
    }
}

fn split_doc(doc: Option<Document>) -> (Value, Option<String>) {
    match doc {
        Some(doc) => (doc.body, doc.rev),
        None => (Value::Object(Map::new()), None),
    }
}
