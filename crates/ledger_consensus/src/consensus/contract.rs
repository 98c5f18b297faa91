//! Smart contract interface, capability sets and the per-transaction
//! context a contract runs against.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::executor::Phase;
use super::store::{ContractEvent, QueryEngine};
use super::stream::{derive_stream_id, ActivityStream};
use super::types::{NodeRef, StreamId, TxEntry};

/// A developer-authored refusal. The reason is reported verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub type PhaseResult<T> = Result<T, Rejection>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Verify,
    Vote,
    Commit,
    PostProcess,
    Query,
    Event,
}

impl Capability {
    const ALL: [Capability; 6] = [
        Capability::Verify,
        Capability::Vote,
        Capability::Commit,
        Capability::PostProcess,
        Capability::Query,
        Capability::Event,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Verify => "verify",
            Capability::Vote => "vote",
            Capability::Commit => "commit",
            Capability::PostProcess => "post-process",
            Capability::Query => "query",
            Capability::Event => "event",
        };
        f.write_str(name)
    }
}

/// The capabilities a contract declares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    /// Verify, vote and commit: what every contract must implement.
    pub fn core() -> Self {
        Self::default()
            .with(Capability::Verify)
            .with(Capability::Vote)
            .with(Capability::Commit)
    }

    pub fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn missing_core(self) -> Vec<Capability> {
        Self::core()
            .iter()
            .filter(|cap| !self.contains(*cap))
            .collect()
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |cap| self.contains(*cap))
    }
}

/// A smart contract. One instance serves exactly one transaction on one node.
#[async_trait]
pub trait Contract: Send + 'static {
    fn capabilities(&self) -> CapabilitySet;

    /// Shape and authenticity checks. `signatureless` is true for
    /// self-signed transactions.
    async fn verify(&mut self, ctx: &mut ContractContext, signatureless: bool) -> PhaseResult<()>;

    /// Admissibility against the unmodified stream state.
    async fn vote(&mut self, ctx: &mut ContractContext) -> PhaseResult<()>;

    async fn commit(
        &mut self,
        ctx: &mut ContractContext,
        possible_territoriality: bool,
    ) -> PhaseResult<Value>;

    async fn post_process(
        &mut self,
        _ctx: &mut ContractContext,
        _territoriality: bool,
        _who: &str,
    ) -> PhaseResult<Option<Value>> {
        Ok(None)
    }
}

pub type ContractFactory = Arc<dyn Fn() -> Box<dyn Contract> + Send + Sync>;

/// Contracts known to this node, keyed by namespace and name.
#[derive(Default)]
pub struct ContractRegistry {
    factories: HashMap<(String, String), ContractFactory>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the contracts of the `default` namespace.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::contracts::register_builtin(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, namespace: &str, contract: &str, factory: F)
    where
        F: Fn() -> Box<dyn Contract> + Send + Sync + 'static,
    {
        self.factories.insert(
            (namespace.to_string(), contract.to_string()),
            Arc::new(factory),
        );
    }

    pub fn resolve(&self, namespace: &str, contract: &str) -> Option<Box<dyn Contract>> {
        self.factories
            .get(&(namespace.to_string(), contract.to_string()))
            .map(|factory| factory())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Everything a contract may see or touch while it runs.
pub struct ContractContext {
    entry: Arc<TxEntry>,
    node_ref: NodeRef,
    capabilities: CapabilitySet,
    phase: Phase,
    streams: BTreeMap<StreamId, ActivityStream>,
    created: Vec<StreamId>,
    readonly: BTreeMap<String, Value>,
    incomms_out: Option<Value>,
    incomms_in: BTreeMap<NodeRef, Value>,
    query: Option<Arc<dyn QueryEngine>>,
    events: Vec<ContractEvent>,
}

impl ContractContext {
    pub fn new(entry: Arc<TxEntry>, node_ref: NodeRef, capabilities: CapabilitySet) -> Self {
        Self {
            entry,
            node_ref,
            capabilities,
            phase: Phase::Verifying,
            streams: BTreeMap::new(),
            created: Vec::new(),
            readonly: BTreeMap::new(),
            incomms_out: None,
            incomms_in: BTreeMap::new(),
            query: None,
            events: Vec::new(),
        }
    }

    pub fn entry(&self) -> &TxEntry {
        &self.entry
    }

    pub fn node_ref(&self) -> &str {
        &self.node_ref
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn has_stream(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    /// Handle of an input, output or newly created stream.
    pub fn stream(&self, id: &str) -> PhaseResult<&ActivityStream> {
        self.streams
            .get(id)
            .ok_or_else(|| Rejection::new(format!("Stream {id} not found")))
    }

    pub fn stream_mut(&mut self, id: &str) -> PhaseResult<&mut ActivityStream> {
        self.streams
            .get_mut(id)
            .ok_or_else(|| Rejection::new(format!("Stream {id} not found")))
    }

    /// State snapshot of a read-only (`$r`) reference.
    pub fn read_only(&self, label: &str) -> Option<&Value> {
        self.readonly.get(label)
    }

    /// Create a new entity. Ids are derived from the umid and creation order,
    /// so every node creates the same ids for the same transaction.
    pub fn new_activity_stream(&mut self, name: impl Into<String>) -> PhaseResult<StreamId> {
        if self.phase != Phase::Committing {
            return Err(Rejection::new("streams can only be created during commit"));
        }
        let id = derive_stream_id(&self.entry.umid, self.created.len());
        let mut stream =
            ActivityStream::constructed(id.clone(), &self.entry.umid, Some(name.into()));
        stream.set_writable(true);
        self.streams.insert(id.clone(), stream);
        self.created.push(id.clone());
        Ok(id)
    }

    /// Create the entity at `id`, a stream the transaction references but
    /// that does not exist yet. It was locked with the rest of the batch, so
    /// only one transaction at a time can create it.
    pub fn create_declared_stream(
        &mut self,
        id: &str,
        name: impl Into<String>,
    ) -> PhaseResult<&mut ActivityStream> {
        if self.phase != Phase::Committing {
            return Err(Rejection::new("streams can only be created during commit"));
        }
        if !self.entry.streams.iter().any(|s| s == id) {
            return Err(Rejection::new(format!("Stream {id} not referenced")));
        }
        if self.streams.contains_key(id) {
            return Err(Rejection::new(format!("Stream {id} already exists")));
        }
        let mut stream =
            ActivityStream::constructed(id.to_string(), &self.entry.umid, Some(name.into()));
        stream.set_writable(true);
        self.created.push(id.to_string());
        Ok(self.streams.entry(id.to_string()).or_insert(stream))
    }

    /// Share a value with the other nodes; set during vote.
    pub fn set_inter_node_comms(&mut self, value: Value) {
        self.incomms_out = Some(value);
    }

    /// Values every node shared during vote, keyed by node.
    pub fn inter_node_comms(&self) -> &BTreeMap<NodeRef, Value> {
        &self.incomms_in
    }

    pub fn query(&self) -> PhaseResult<&dyn QueryEngine> {
        if !self.capabilities.contains(Capability::Query) {
            return Err(Rejection::new("contract does not declare the query capability"));
        }
        self.query
            .as_deref()
            .ok_or_else(|| Rejection::new("query engine unavailable"))
    }

    /// Buffer an event; it is emitted only if the transaction commits.
    pub fn emit(&mut self, name: impl Into<String>, data: Value) -> PhaseResult<()> {
        if !self.capabilities.contains(Capability::Event) {
            return Err(Rejection::new("contract does not declare the event capability"));
        }
        if !matches!(self.phase, Phase::Verifying | Phase::Voting | Phase::Committing) {
            return Err(Rejection::new(format!("events cannot be emitted in {}", self.phase)));
        }
        self.events.push(ContractEvent {
            name: name.into(),
            data,
        });
        Ok(())
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        let writable = phase == Phase::Committing;
        for stream in self.streams.values_mut() {
            stream.set_writable(writable);
        }
    }

    pub(crate) fn set_entry(&mut self, entry: Arc<TxEntry>) {
        self.entry = entry;
    }

    pub(crate) fn insert_stream(&mut self, stream: ActivityStream) {
        self.streams.insert(stream.id().to_string(), stream);
    }

    pub(crate) fn insert_read_only(&mut self, label: String, state: Value) {
        self.readonly.insert(label, state);
    }

    pub(crate) fn set_query(&mut self, query: Arc<dyn QueryEngine>) {
        self.query = Some(query);
    }

    pub(crate) fn take_inter_node_comms(&mut self) -> Option<Value> {
        self.incomms_out.take()
    }

    pub(crate) fn set_received_comms(&mut self, incomms: BTreeMap<NodeRef, Value>) {
        self.incomms_in = incomms;
    }

    pub(crate) fn streams(&self) -> impl Iterator<Item = &ActivityStream> {
        self.streams.values()
    }

    pub(crate) fn streams_mut(&mut self) -> impl Iterator<Item = &mut ActivityStream> {
        self.streams.values_mut()
    }

    pub(crate) fn created(&self) -> &[StreamId] {
        &self.created
    }

    pub(crate) fn take_events(&mut self) -> Vec<ContractEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::types::{TxBody, TxPacket};
    use serde_json::json;

    fn context(caps: CapabilitySet) -> ContractContext {
        let packet = TxPacket::new(TxBody::new("default", "fund").input("a", json!({})));
        let entry = TxEntry::admit(packet, "node-a", false).unwrap();
        ContractContext::new(Arc::new(entry), "node-a".into(), caps)
    }

    #[test]
    fn capability_sets() {
        let caps = CapabilitySet::core().with(Capability::Query);
        assert!(caps.contains(Capability::Vote));
        assert!(caps.contains(Capability::Query));
        assert!(!caps.contains(Capability::Event));
        assert!(caps.missing_core().is_empty());

        let partial = CapabilitySet::default().with(Capability::Verify);
        assert_eq!(
            partial.missing_core(),
            vec![Capability::Vote, Capability::Commit]
        );
        assert_eq!(caps.iter().count(), 4);
    }

    #[test]
    fn new_streams_only_during_commit() {
        let mut ctx = context(CapabilitySet::core());
        assert!(ctx.new_activity_stream("x").is_err());

        ctx.enter(Phase::Committing);
        let first = ctx.new_activity_stream("x").unwrap();
        let second = ctx.new_activity_stream("y").unwrap();
        assert_ne!(first, second);
        assert_eq!(ctx.created(), &[first.clone(), second]);
        ctx.stream_mut(&first)
            .unwrap()
            .set_state(json!({"ok": true}))
            .unwrap();
    }

    #[test]
    fn declared_streams_are_created_once() {
        let mut ctx = context(CapabilitySet::core());
        assert!(ctx.create_declared_stream("a", "claim").is_err());

        ctx.enter(Phase::Committing);
        let err = ctx.create_declared_stream("b", "claim").unwrap_err();
        assert_eq!(err.reason, "Stream b not referenced");
        ctx.create_declared_stream("a", "claim")
            .unwrap()
            .set_state(json!({"owner": "x"}))
            .unwrap();
        assert_eq!(ctx.created(), &["a".to_string()]);
        assert!(ctx.stream("a").unwrap().is_constructor());
        assert!(ctx.create_declared_stream("a", "claim").is_err());
    }

    #[test]
    fn query_and_events_require_capabilities() {
        let mut ctx = context(CapabilitySet::core());
        assert!(ctx.query().is_err());
        assert!(ctx.emit("moved", json!({})).is_err());

        let mut ctx = context(CapabilitySet::core().with(Capability::Event));
        ctx.emit("moved", json!({"n": 1})).unwrap();
        assert_eq!(ctx.take_events().len(), 1);
    }

    #[test]
    fn missing_streams_reject() {
        let ctx = context(CapabilitySet::core());
        let err = ctx.stream("ghost").unwrap_err();
        assert_eq!(err.reason, "Stream ghost not found");
    }
}
