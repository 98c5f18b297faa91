//! Single-node ledger flows through the built-in contracts.
//!
//! Test flow:
//! 1) Start one engine over an in-memory store (no peers).
//! 2) Onboard identities, mint a balance and move it with signed transfers.
//! 3) Submit transactions that must be rejected by signatures, contracts or
//!    the stream lock, and check how each failure is reported.
//!
//! Verification:
//! - Committed transactions are visible through stream and record lookups.
//! - Only lock and quorum failures carry a client-facing error message.
//! - Locks are free again once every transaction has finished.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use common::{
    balance, claim_packet, cluster, cluster_with, fund_add, onboard, transfer, transfer_packet,
    VALID_SIG,
};
use ledger_consensus::consensus::{
    CapabilitySet, Contract, ContractContext, ErrorKind, PersistenceStore, PhaseResult, TxBody,
    TxPacket, TxStatus, SIGNATURES_NOT_VERIFIED,
};
use ledger_consensus::contracts::{
    namespace_claim_id, CLAIM_NOT_REFERENCED, FUND_EXISTS, INSUFFICIENT_BALANCE, NAMESPACE_RESERVED,
    NOT_SIGNATURELESS,
};

#[tokio::test]
async fn onboard_fund_and_transfer() {
    let cluster = cluster(1);
    let node = cluster.node(0);
    let ids = onboard(node, &["alice", "bob"]).await;
    let (alice, bob) = (&ids["alice"], &ids["bob"]);

    let view = node.stream(alice).await.unwrap().unwrap();
    assert_eq!(view.meta.name.as_deref(), Some("alice"));
    assert_eq!(view.meta.public_key.as_deref(), Some("pk-alice"));
    assert_eq!(view.state["type"], json!("identity"));

    assert!(fund_add(node, alice, 100).await.is_committed());
    let resp = transfer(node, alice, bob, 40).await;
    assert!(resp.is_committed(), "{resp:?}");
    assert_eq!(resp.summary.total, 1);
    assert_eq!((resp.summary.vote, resp.summary.commit), (1, 1));
    assert_eq!(resp.territoriality.as_deref(), Some(node.node_ref()));
    assert_eq!(resp.streams.updated.len(), 2);

    assert_eq!(balance(node, alice).await, 60);
    assert_eq!(balance(node, bob).await, 40);

    let record = node.transaction(&resp.umid).await.unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Committed);
    assert_eq!(record.territoriality.as_deref(), Some(node.node_ref()));
    assert_eq!(node.stream_lock().held_count(), 0);
}

#[tokio::test]
async fn contract_rejections_are_soft_failures() {
    let cluster = cluster(1);
    let node = cluster.node(0);
    let ids = onboard(node, &["alice", "bob"]).await;
    let (alice, bob) = (&ids["alice"], &ids["bob"]);
    assert!(fund_add(node, alice, 10).await.is_committed());

    let resp = transfer(node, alice, bob, 11).await;
    assert_eq!(resp.status, TxStatus::Failed);
    assert_eq!(resp.failure, Some(ErrorKind::VoteRejected));
    assert_eq!(resp.error, None);
    assert_eq!(resp.summary.errors.len(), 1);
    assert_eq!(resp.summary.errors[0].reason, INSUFFICIENT_BALANCE);

    let resp = fund_add(node, alice, 5).await;
    assert_eq!(resp.summary.errors[0].reason, FUND_EXISTS);

    // The failure is recorded as well.
    let record = node.transaction(&resp.umid).await.unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Failed);
    assert_eq!(balance(node, alice).await, 10);
    assert_eq!(node.stream_lock().held_count(), 0);
}

#[tokio::test]
async fn unsigned_inputs_fail_verification() {
    let cluster = cluster(1);
    let node = cluster.node(0);
    let ids = onboard(node, &["alice", "bob"]).await;
    assert!(fund_add(node, &ids["alice"], 10).await.is_committed());

    let body = TxBody::new("default", "fund")
        .with_entry("transfer")
        .input(ids["alice"].as_str(), json!({ "symbol": "usd", "amount": 1 }))
        .output(ids["bob"].as_str(), json!({}));
    let resp = node.submit(TxPacket::new(body.clone()).sign(ids["alice"].as_str(), "forged")).await;
    assert_eq!(resp.failure, Some(ErrorKind::VerifyRejected));
    assert_eq!(resp.summary.errors[0].reason, SIGNATURES_NOT_VERIFIED);

    let resp = node.submit(TxPacket::new(body)).await;
    assert_eq!(resp.summary.errors[0].reason, SIGNATURES_NOT_VERIFIED);
}

#[tokio::test]
async fn onboard_must_be_self_signed() {
    let cluster = cluster(1);
    let node = cluster.node(0);
    let body = TxBody::new("default", "onboard").input("carol", json!({ "publicKey": "pk" }));
    let resp = node.submit(TxPacket::new(body).sign("carol", VALID_SIG)).await;
    assert_eq!(resp.failure, Some(ErrorKind::VerifyRejected));
    assert_eq!(resp.summary.errors[0].reason, NOT_SIGNATURELESS);
}

#[tokio::test]
async fn held_streams_are_a_hard_failure() {
    let cluster = cluster(1);
    let node = cluster.node(0);
    let ids = onboard(node, &["alice", "bob"]).await;
    let (alice, bob) = (&ids["alice"], &ids["bob"]);
    assert!(fund_add(node, alice, 10).await.is_committed());

    assert!(node.stream_lock().hold(bob));
    let resp = transfer(node, alice, bob, 1).await;
    assert_eq!(resp.failure, Some(ErrorKind::LockUnavailable));
    let error = resp.error.expect("lock failures carry an error");
    assert!(error.contains(bob.as_str()), "{error}");
    // Lock failures leave no record behind.
    assert!(node.transaction(&resp.umid).await.unwrap().is_none());

    node.stream_lock().release(bob);
    // The failed batch is released in full after the grace period.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!node.stream_lock().is_held(alice));
    assert!(transfer(node, alice, bob, 1).await.is_committed());
}

#[tokio::test]
async fn unknown_contracts_and_empty_transactions() {
    let cluster = cluster(1);
    let node = cluster.node(0);

    let resp = node
        .submit(TxPacket::new(TxBody::new("default", "missing").output("x", json!({}))))
        .await;
    assert_eq!(resp.failure, Some(ErrorKind::ContractNotFound));

    let resp = node.submit(TxPacket::new(TxBody::new("default", "fund"))).await;
    assert_eq!(resp.failure, Some(ErrorKind::InvalidTransaction));
    assert!(resp.umid.is_empty());
}

#[tokio::test]
async fn namespace_claims() {
    let cluster = cluster(1);
    let node = cluster.node(0);
    let ids = onboard(node, &["alice", "bob"]).await;
    let (alice, bob) = (ids["alice"].as_str(), ids["bob"].as_str());

    let resp = node.submit(claim_packet(alice, "Acme")).await;
    assert!(resp.is_committed(), "{resp:?}");
    assert_eq!(resp.streams.new.len(), 1);
    assert_eq!(resp.streams.new[0].id, namespace_claim_id("acme"));
    let view = node.stream(alice).await.unwrap().unwrap();
    assert_eq!(view.state["namespaces"], json!(["acme"]));
    let claim = node.stream(&namespace_claim_id("acme")).await.unwrap().unwrap();
    assert_eq!(claim.state["owner"], json!(alice));

    let resp = node.submit(claim_packet(bob, "acme")).await;
    assert_eq!(resp.failure, Some(ErrorKind::VoteRejected));
    assert_eq!(resp.summary.errors[0].reason, NAMESPACE_RESERVED);

    let resp = node.submit(claim_packet(bob, "default")).await;
    assert_eq!(resp.summary.errors[0].reason, NAMESPACE_RESERVED);

    // A claim that leaves the claim stream out is refused before vote.
    let unlocked = TxBody::new("default", "namespace").input(bob, json!({ "namespace": "other" }));
    let resp = node.submit(TxPacket::new(unlocked).sign(bob, VALID_SIG)).await;
    assert_eq!(resp.failure, Some(ErrorKind::VerifyRejected));
    assert_eq!(resp.summary.errors[0].reason, CLAIM_NOT_REFERENCED);

    // Claiming again is idempotent for the owner.
    let resp = node.submit(claim_packet(alice, "acme")).await;
    assert!(resp.is_committed());
    assert!(resp.streams.new.is_empty());
}

#[tokio::test]
async fn instant_transactions_answer_before_finalize() {
    let cluster = cluster(1);
    let node = cluster.node(0);
    let ids = onboard(node, &["alice", "bob"]).await;
    assert!(fund_add(node, &ids["alice"], 10).await.is_committed());

    let resp = node
        .submit(transfer_packet(&ids["alice"], &ids["bob"], 3).instant())
        .await;
    assert!(resp.is_committed());
    assert_eq!(resp.territoriality, None);
    assert_eq!(balance(node, &ids["bob"]).await, 3);

    let umid = resp.umid.clone();
    let finalized = common::wait_until(Duration::from_secs(2), || {
        let node = Arc::clone(node);
        let umid = umid.clone();
        async move {
            matches!(
                node.transaction(&umid).await,
                Ok(Some(record)) if record.territoriality.is_some()
            )
        }
    })
    .await;
    assert!(finalized);
}

/// Sleeps through its vote.
struct Sleepy;

#[async_trait]
impl Contract for Sleepy {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::core()
    }

    async fn verify(&mut self, _ctx: &mut ContractContext, _signatureless: bool) -> PhaseResult<()> {
        Ok(())
    }

    async fn vote(&mut self, _ctx: &mut ContractContext) -> PhaseResult<()> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }

    async fn commit(&mut self, _ctx: &mut ContractContext, _possible: bool) -> PhaseResult<Value> {
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn slow_phases_time_out() {
    let cluster = cluster_with(
        1,
        |config| config.phase_timeout = Duration::from_millis(100),
        |registry| registry.register("test", "sleepy", || Box::new(Sleepy)),
    );
    let node = cluster.node(0);
    let resp = node
        .submit(TxPacket::new(TxBody::new("test", "sleepy").output("s1", json!({}))))
        .await;
    assert_eq!(resp.failure, Some(ErrorKind::PhaseTimeout));
    assert_eq!(resp.error, None);
    assert_eq!(node.stream_lock().held_count(), 0);

    let record = cluster.stores[0]
        .get(&format!("{}:umid", resp.umid))
        .await
        .unwrap();
    assert!(record.is_some());
}
