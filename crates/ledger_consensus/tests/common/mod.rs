//! Shared helpers for the in-process cluster tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use ledger_consensus::consensus::{
    Config, ContractRegistry, EngineServices, KnockHandler, LedgerEngine, LedgerResponse,
    MemoryStore, MemoryTransport, SignatureVerifier, TxBody, TxEntry, TxPacket,
};
use ledger_consensus::contracts::namespace_claim_id;

/// Signature accepted by `TestVerifier` for any input.
pub const VALID_SIG: &str = "valid";
pub const SYMBOL: &str = "usd";

/// Accepts `VALID_SIG` and every self-signed transaction.
pub struct TestVerifier;

impl SignatureVerifier for TestVerifier {
    fn verify(&self, _public_key: &str, _key_type: &str, _payload: &[u8], signature: &str) -> bool {
        signature == VALID_SIG
    }

    fn verify_self_signed(&self, _entry: &TxEntry) -> bool {
        true
    }
}

/// Engines wired over one in-memory transport, each with its own store.
pub struct Cluster {
    pub transport: Arc<MemoryTransport>,
    pub nodes: Vec<Arc<LedgerEngine>>,
    pub stores: Vec<Arc<MemoryStore>>,
}

impl Cluster {
    pub fn node(&self, idx: usize) -> &Arc<LedgerEngine> {
        &self.nodes[idx]
    }

    pub fn name(idx: usize) -> String {
        format!("node-{idx}")
    }

    pub fn cut_off(&self, idx: usize) {
        self.transport.set_reachable(&Self::name(idx), false);
    }
}

pub fn cluster(size: usize) -> Cluster {
    cluster_with(size, |_| {}, |_| {})
}

/// Build `size` engines. `tune` adjusts every node's config and `contracts`
/// registers extra contracts next to the built-in ones.
pub fn cluster_with<T, C>(size: usize, tune: T, contracts: C) -> Cluster
where
    T: Fn(&mut Config),
    C: Fn(&mut ContractRegistry),
{
    let transport = MemoryTransport::new();
    let names = (0..size).map(Cluster::name).collect::<Vec<_>>();
    let mut nodes = Vec::with_capacity(size);
    let mut stores = Vec::with_capacity(size);
    for name in &names {
        let mut config = if size == 1 {
            Config::single_node(name.as_str())
        } else {
            Config::new(name.as_str(), names.clone())
        };
        tune(&mut config);

        let mut registry = ContractRegistry::with_builtin();
        contracts(&mut registry);
        let store = MemoryStore::new();
        let services = EngineServices::new(store.clone(), transport.clone(), Arc::new(TestVerifier))
            .with_contracts(registry);
        let engine = LedgerEngine::new(Arc::new(config), services);
        transport.register(name, engine.clone() as Arc<dyn KnockHandler>);
        nodes.push(engine);
        stores.push(store);
    }
    Cluster {
        transport,
        nodes,
        stores,
    }
}

/// Onboard identities under `labels`; returns label to stream id.
pub async fn onboard(node: &LedgerEngine, labels: &[&str]) -> BTreeMap<String, String> {
    let mut body = TxBody::new("default", "onboard");
    for label in labels {
        body = body.input(*label, json!({ "publicKey": format!("pk-{label}"), "type": "ed25519" }));
    }
    let resp = node.submit(TxPacket::new(body).self_signed()).await;
    assert!(resp.is_committed(), "onboard failed: {resp:?}");
    let created = &resp.responses[node.node_ref()];
    labels
        .iter()
        .map(|label| {
            let id = created[*label].as_str().expect("stream id");
            (label.to_string(), id.to_string())
        })
        .collect()
}

pub async fn fund_add(node: &LedgerEngine, id: &str, amount: u64) -> LedgerResponse {
    let body = TxBody::new("default", "fund")
        .with_entry("add")
        .output(id, json!({ "symbol": SYMBOL, "amount": amount }));
    node.submit(TxPacket::new(body)).await
}

pub fn transfer_packet(from: &str, to: &str, amount: u64) -> TxPacket {
    let body = TxBody::new("default", "fund")
        .with_entry("transfer")
        .input(from, json!({ "symbol": SYMBOL, "amount": amount }))
        .output(to, json!({}));
    TxPacket::new(body).sign(from, VALID_SIG)
}

pub async fn transfer(node: &LedgerEngine, from: &str, to: &str, amount: u64) -> LedgerResponse {
    node.submit(transfer_packet(from, to, amount)).await
}

/// `identity` claims `namespace`, locking the namespace's claim stream.
pub fn claim_packet(identity: &str, namespace: &str) -> TxPacket {
    let body = TxBody::new("default", "namespace")
        .input(identity, json!({ "namespace": namespace }))
        .output(namespace_claim_id(namespace), json!({}));
    TxPacket::new(body).sign(identity, VALID_SIG)
}

/// Balance of `id` as stored on `node`; zero when unfunded.
pub async fn balance(node: &LedgerEngine, id: &str) -> u64 {
    let view = node.stream(id).await.expect("stream lookup").expect("stream exists");
    view.state
        .get("funds")
        .and_then(|funds| funds.get(SYMBOL))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
