//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};

use ledger_consensus::consensus::{LedgerResponse, QuorumPolicy, TxBody, TxPacket};
use ledger_node::{
    start_embedded_node, EmbeddedNodeConfig, EmbeddedNodeHandle, LedgerClient, NodeIdentity,
};

/// Timeout for client round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);
pub const SYMBOL: &str = "usd";

/// Reserve a free local port.
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub fn node_ref(idx: usize) -> String {
    format!("node-{idx}")
}

/// Addresses and member string for a cluster of `size` nodes.
pub fn plan_cluster(size: usize) -> (Vec<SocketAddr>, String) {
    let addrs = (0..size)
        .map(|_| {
            let port = pick_free_port().expect("free port");
            SocketAddr::from(([127, 0, 0, 1], port))
        })
        .collect::<Vec<_>>();
    let members = addrs
        .iter()
        .enumerate()
        .map(|(idx, addr)| format!("{}@{addr}", node_ref(idx)))
        .collect::<Vec<_>>()
        .join(",");
    (addrs, members)
}

pub fn node_config(idx: usize, addr: SocketAddr, members: &str, root: &Path) -> EmbeddedNodeConfig {
    EmbeddedNodeConfig {
        node_ref: node_ref(idx),
        listen: addr,
        members: members.to_string(),
        data_dir: root.join(node_ref(idx)),
        quorum: QuorumPolicy::Majority,
        rpc_timeout: Duration::from_millis(1_500),
        durable: true,
        ready_timeout: Duration::from_secs(20),
    }
}

/// Start every node of a planned cluster under `root`.
pub async fn start_cluster(
    addrs: &[SocketAddr],
    members: &str,
    root: &Path,
) -> Vec<Option<EmbeddedNodeHandle>> {
    let mut handles = Vec::with_capacity(addrs.len());
    for (idx, addr) in addrs.iter().enumerate() {
        let handle = start_embedded_node(node_config(idx, *addr, members, root))
            .await
            .expect("start node");
        handles.push(Some(handle));
    }
    handles
}

pub fn client(addr: SocketAddr) -> LedgerClient {
    LedgerClient::new(addr, IO_TIMEOUT)
}

/// An identity holding a real ed25519 key.
pub struct Account {
    pub label: String,
    pub key: NodeIdentity,
    pub id: String,
}

/// Onboard one identity per label in a single self-signed transaction.
pub async fn onboard(client: &LedgerClient, labels: &[&str]) -> Vec<Account> {
    let keys = labels
        .iter()
        .map(|_| NodeIdentity::generate())
        .collect::<Vec<_>>();
    let mut body = TxBody::new("default", "onboard");
    for (label, key) in labels.iter().zip(&keys) {
        body = body.input(*label, json!({ "publicKey": key.public_key_hex(), "type": "ed25519" }));
    }
    let payload = body.signing_bytes();
    let mut packet = TxPacket::new(body).self_signed();
    for (label, key) in labels.iter().zip(&keys) {
        packet = packet.sign(*label, key.sign_hex(&payload));
    }

    let resp = client.submit(packet).await.expect("submit onboard");
    assert!(resp.is_committed(), "onboard failed: {resp:?}");
    let created = resp
        .responses
        .values()
        .next()
        .expect("commit response")
        .clone();
    labels
        .iter()
        .zip(keys)
        .map(|(label, key)| Account {
            label: label.to_string(),
            id: created[*label].as_str().expect("stream id").to_string(),
            key,
        })
        .collect()
}

pub async fn fund_add(client: &LedgerClient, account: &Account, amount: u64) -> LedgerResponse {
    let body = TxBody::new("default", "fund")
        .with_entry("add")
        .output(account.id.as_str(), json!({ "symbol": SYMBOL, "amount": amount }));
    client.submit(TxPacket::new(body)).await.expect("submit add")
}

pub fn transfer_packet(from: &Account, to: &Account, amount: u64) -> TxPacket {
    let body = TxBody::new("default", "fund")
        .with_entry("transfer")
        .input(from.id.as_str(), json!({ "symbol": SYMBOL, "amount": amount }))
        .output(to.id.as_str(), json!({}));
    let signature = from.key.sign_hex(&body.signing_bytes());
    TxPacket::new(body).sign(from.id.as_str(), signature)
}

/// Balance per account as stored on the node behind `client`.
pub async fn balances(client: &LedgerClient, accounts: &[Account]) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for account in accounts {
        let view = client
            .stream(&account.id)
            .await
            .expect("stream lookup")
            .expect("stream exists");
        let balance = view
            .state
            .get("funds")
            .and_then(|funds| funds.get(SYMBOL))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        out.insert(account.label.clone(), balance);
    }
    out
}
