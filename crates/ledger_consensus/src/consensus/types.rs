//! Shared types for the ledger consensus engine.
//!
//! These types travel between the coordinator, the contract executor, the
//! transport and the persistence layer, so they are kept free of engine
//! internals. JSON field names follow the ledger's `$`-prefixed packet format.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ErrorKind, LedgerError};
use super::summary::{QuorumPolicy, Summary};

/// Identity of a node in the fixed peer network.
pub type NodeRef = String;
/// Unique message id of one transaction.
pub type Umid = String;
/// Identifier of an activity stream (ledger entity).
pub type StreamId = String;

/// Immutable node configuration, built once at startup and shared by every
/// component that needs it.
#[derive(Clone, Debug)]
pub struct Config {
    pub node_ref: NodeRef,
    /// Every other node taking part in consensus. Never contains `node_ref`.
    pub peers: Vec<NodeRef>,
    pub quorum: QuorumPolicy,
    /// Grace period after which a failed lock batch is released in full.
    pub lock_grace: Duration,
    /// Time budget for each of verify, vote and commit.
    pub phase_timeout: Duration,
    /// Upper bound for one knock round trip.
    pub rpc_timeout: Duration,
    /// How long a participant keeps its streams held while waiting for the
    /// next instruction from the entry node.
    pub participant_timeout: Duration,
    pub slow_tx_threshold: Duration,
}

impl Config {
    pub fn new(node_ref: impl Into<NodeRef>, peers: Vec<NodeRef>) -> Self {
        let node_ref = node_ref.into();
        let mut peers = peers
            .into_iter()
            .filter(|peer| *peer != node_ref && !peer.is_empty())
            .collect::<Vec<_>>();
        peers.sort();
        peers.dedup();
        Self {
            node_ref,
            peers,
            quorum: QuorumPolicy::Majority,
            lock_grace: Duration::from_millis(100),
            phase_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(5),
            participant_timeout: Duration::from_secs(30),
            slow_tx_threshold: Duration::from_millis(250),
        }
    }

    pub fn single_node(node_ref: impl Into<NodeRef>) -> Self {
        Self::new(node_ref, Vec::new())
    }

    /// Number of nodes taking part in a multi-node transaction, this one included.
    pub fn total(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum(&self) -> usize {
        self.quorum.threshold(self.total())
    }

    pub fn is_multi_node(&self) -> bool {
        !self.peers.is_empty()
    }
}

/// The contract invocation carried by a transaction (`$tx`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxBody {
    #[serde(rename = "$namespace")]
    pub namespace: String,
    #[serde(rename = "$contract")]
    pub contract: String,
    #[serde(rename = "$entry", default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(rename = "$i", default)]
    pub inputs: BTreeMap<StreamId, Value>,
    #[serde(rename = "$o", default)]
    pub outputs: BTreeMap<StreamId, Value>,
    /// Named read-only references: label -> stream id.
    #[serde(rename = "$r", default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<BTreeMap<String, StreamId>>,
}

impl TxBody {
    pub fn new(namespace: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            contract: contract.into(),
            entry: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            readonly: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn input(mut self, id: impl Into<StreamId>, value: Value) -> Self {
        self.inputs.insert(id.into(), value);
        self
    }

    pub fn output(mut self, id: impl Into<StreamId>, value: Value) -> Self {
        self.outputs.insert(id.into(), value);
        self
    }

    pub fn read_only(mut self, label: impl Into<String>, id: impl Into<StreamId>) -> Self {
        self.readonly
            .get_or_insert_with(BTreeMap::new)
            .insert(label.into(), id.into());
        self
    }

    /// Canonical bytes that input owners sign.
    pub fn signing_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Fully qualified contract name, e.g. `default/fund`.
    pub fn contract_ref(&self) -> String {
        format!("{}/{}", self.namespace, self.contract)
    }

    /// Streams touched by this transaction: inputs then outputs, deduplicated.
    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams = self.inputs.keys().cloned().collect::<Vec<_>>();
        for id in self.outputs.keys() {
            if !streams.contains(id) {
                streams.push(id.clone());
            }
        }
        streams
    }
}

/// A transaction as submitted by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxPacket {
    #[serde(rename = "$tx")]
    pub tx: TxBody,
    #[serde(rename = "$sigs", default)]
    pub sigs: BTreeMap<String, String>,
    #[serde(rename = "$selfsign", default)]
    pub selfsign: bool,
    #[serde(rename = "$instant", default)]
    pub instant: bool,
}

impl TxPacket {
    pub fn new(tx: TxBody) -> Self {
        Self {
            tx,
            sigs: BTreeMap::new(),
            selfsign: false,
            instant: false,
        }
    }

    pub fn self_signed(mut self) -> Self {
        self.selfsign = true;
        self
    }

    pub fn instant(mut self) -> Self {
        self.instant = true;
        self
    }

    pub fn sign(mut self, id: impl Into<String>, signature: impl Into<String>) -> Self {
        self.sigs.insert(id.into(), signature.into());
        self
    }
}

/// An admitted transaction. Immutable once admitted, except for the
/// pre-image revisions the entry node records after loading its streams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxEntry {
    pub origin: NodeRef,
    /// Submission time in unix milliseconds.
    pub datetime: u64,
    #[serde(rename = "$umid")]
    pub umid: Umid,
    #[serde(rename = "$tx")]
    pub tx: TxBody,
    #[serde(rename = "$sigs", default)]
    pub sigs: BTreeMap<String, String>,
    #[serde(rename = "$selfsign", default)]
    pub selfsign: bool,
    /// Pre-image revision of each existing input/output stream.
    #[serde(rename = "$revs", default)]
    pub revisions: BTreeMap<StreamId, String>,
    pub multi_node: bool,
    #[serde(rename = "$instant", default)]
    pub instant: bool,
    pub streams: Vec<StreamId>,
}

impl TxEntry {
    /// Admit a client packet on its entry node.
    pub fn admit(packet: TxPacket, origin: &str, multi_node: bool) -> Result<Self, LedgerError> {
        let TxPacket {
            tx,
            sigs,
            selfsign,
            instant,
        } = packet;
        if tx.namespace.trim().is_empty() || tx.contract.trim().is_empty() {
            return Err(LedgerError::InvalidTransaction(
                "$namespace and $contract are required".to_string(),
            ));
        }
        if tx.inputs.is_empty() && tx.outputs.is_empty() {
            return Err(LedgerError::InvalidTransaction(
                "transaction references no streams".to_string(),
            ));
        }

        let datetime = unix_time_ms();
        let umid = compute_umid(origin, datetime, &tx, &sigs);
        let streams = tx.streams();
        Ok(Self {
            origin: origin.to_string(),
            datetime,
            umid,
            tx,
            sigs,
            selfsign,
            revisions: BTreeMap::new(),
            multi_node,
            instant,
            streams,
        })
    }

    pub fn signing_payload(&self) -> Vec<u8> {
        self.tx.signing_bytes()
    }
}

fn compute_umid(origin: &str, datetime: u64, tx: &TxBody, sigs: &BTreeMap<String, String>) -> Umid {
    let mut hasher = blake3::Hasher::new();
    hasher.update(origin.as_bytes());
    hasher.update(&datetime.to_be_bytes());
    hasher.update(&tx.signing_bytes());
    hasher.update(&serde_json::to_vec(sigs).unwrap_or_default());
    // Two submissions of the same body in the same millisecond still differ.
    hasher.update(&unix_time_us().to_be_bytes());
    hasher.finalize().to_hex().to_string()
}

/// One node's answer for a round of a transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResponse {
    pub vote: bool,
    pub commit: bool,
    /// Local commit-completion time in unix microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_at: Option<u64>,
    /// Value returned by the contract's commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<Value>,
    /// Inter-node communication payload set during vote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomms: Option<Value>,
    /// Response time in unix milliseconds.
    pub datetime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeResponse {
    pub fn now() -> Self {
        Self {
            datetime: unix_time_ms(),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::now()
        }
    }
}

/// Name and id of one affected stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: StreamId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Streams created and updated by a committed transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamsAffected {
    pub new: Vec<StreamRecord>,
    pub updated: Vec<StreamRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Committed,
    Failed,
}

/// Structured outcome returned to the submitting client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerResponse {
    #[serde(rename = "$umid")]
    pub umid: Umid,
    pub status: TxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorKind>,
    /// Hard failure message (lock-unavailable, quorum-not-reached).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "$summary")]
    pub summary: Summary,
    #[serde(rename = "$streams")]
    pub streams: StreamsAffected,
    #[serde(rename = "$territoriality", default, skip_serializing_if = "Option::is_none")]
    pub territoriality: Option<NodeRef>,
    /// Commit return values per node.
    #[serde(rename = "$responses", default)]
    pub responses: BTreeMap<NodeRef, Value>,
}

impl LedgerResponse {
    /// A failed outcome. Only hard failures carry the `error` message.
    pub fn failed(umid: Umid, summary: Summary, err: &LedgerError) -> Self {
        Self {
            umid,
            status: TxStatus::Failed,
            failure: Some(err.kind()),
            error: err.is_hard_failure().then(|| err.to_string()),
            summary,
            streams: StreamsAffected::default(),
            territoriality: None,
            responses: BTreeMap::new(),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status == TxStatus::Committed
    }
}

/// Durable record of a transaction as seen by one node, stored as `<umid>:umid`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub entry: TxEntry,
    pub status: TxStatus,
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub territoriality: Option<NodeRef>,
    pub streams: StreamsAffected,
}

impl TxRecord {
    pub fn doc_id(umid: &str) -> String {
        format!("{umid}:umid")
    }
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

pub(crate) fn unix_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
