//! Peer "knock" messages and the transport seam used to deliver them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{NodeRef, NodeResponse, TxEntry, Umid};

/// One round of a transaction, sent from the entry node to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Knock {
    pub from: NodeRef,
    pub body: KnockBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
pub enum KnockBody {
    /// Lock, load, verify and vote on the entry.
    Vote { entry: TxEntry },
    /// Quorum was reached; commit with the comms every voter shared.
    Commit {
        umid: Umid,
        #[serde(default)]
        incomms: BTreeMap<NodeRef, Value>,
    },
    /// Commits are collected; `who` holds territoriality.
    Finalize { umid: Umid, who: NodeRef },
    /// The transaction failed; release everything.
    Abort { umid: Umid, reason: String },
}

impl KnockBody {
    pub fn umid(&self) -> &str {
        match self {
            KnockBody::Vote { entry } => &entry.umid,
            KnockBody::Commit { umid, .. }
            | KnockBody::Finalize { umid, .. }
            | KnockBody::Abort { umid, .. } => umid,
        }
    }

    pub fn round(&self) -> &'static str {
        match self {
            KnockBody::Vote { .. } => "vote",
            KnockBody::Commit { .. } => "commit",
            KnockBody::Finalize { .. } => "finalize",
            KnockBody::Abort { .. } => "abort",
        }
    }
}

/// Delivers knocks to peers. Errors and timeouts are per-peer results, never
/// coordinator failures.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    async fn knock(&self, target: &str, knock: Knock) -> anyhow::Result<NodeResponse>;
}

/// Receiving side of a knock.
#[async_trait]
pub trait KnockHandler: Send + Sync + 'static {
    async fn handle_knock(&self, knock: Knock) -> NodeResponse;
}

/// In-process transport connecting engines registered under their node refs.
///
/// Nodes can be cut off (both directions) or slowed down to exercise partial
/// failure without sockets.
#[derive(Default)]
pub struct MemoryTransport {
    nodes: Mutex<HashMap<NodeRef, Weak<dyn KnockHandler>>>,
    unreachable: Mutex<HashSet<NodeRef>>,
    delays: Mutex<HashMap<NodeRef, Duration>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &str, handler: Arc<dyn KnockHandler>) {
        lock(&self.nodes).insert(node.to_string(), Arc::downgrade(&handler));
    }

    pub fn set_reachable(&self, node: &str, reachable: bool) {
        let mut unreachable = lock(&self.unreachable);
        if reachable {
            unreachable.remove(node);
        } else {
            unreachable.insert(node.to_string());
        }
    }

    /// Delay every knock delivered to `node`.
    pub fn set_delay(&self, node: &str, delay: Duration) {
        lock(&self.delays).insert(node.to_string(), delay);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl NetworkTransport for MemoryTransport {
    async fn knock(&self, target: &str, knock: Knock) -> anyhow::Result<NodeResponse> {
        {
            let unreachable = lock(&self.unreachable);
            if unreachable.contains(target) || unreachable.contains(&knock.from) {
                anyhow::bail!("node {target} unreachable");
            }
        }
        let handler = lock(&self.nodes)
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow::anyhow!("node {target} not registered"))?;
        let delay = lock(&self.delays).get(target).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(handler.handle_knock(knock).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl KnockHandler for Echo {
        async fn handle_knock(&self, knock: Knock) -> NodeResponse {
            NodeResponse {
                vote: true,
                error: Some(knock.body.round().to_string()),
                ..NodeResponse::now()
            }
        }
    }

    fn abort() -> Knock {
        Knock {
            from: "a".into(),
            body: KnockBody::Abort {
                umid: "u1".into(),
                reason: "test".into(),
            },
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_nodes() {
        let transport = MemoryTransport::new();
        let echo: Arc<dyn KnockHandler> = Arc::new(Echo);
        transport.register("b", echo.clone());
        let resp = transport.knock("b", abort()).await.unwrap();
        assert_eq!(resp.error.as_deref(), Some("abort"));
        assert!(transport.knock("c", abort()).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_nodes_fail_both_ways() {
        let transport = MemoryTransport::new();
        let echo: Arc<dyn KnockHandler> = Arc::new(Echo);
        transport.register("b", echo.clone());

        transport.set_reachable("b", false);
        assert!(transport.knock("b", abort()).await.is_err());
        transport.set_reachable("b", true);

        transport.set_reachable("a", false);
        assert!(transport.knock("b", abort()).await.is_err());
        transport.set_reachable("a", true);
        assert!(transport.knock("b", abort()).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_handlers_are_unreachable() {
        let transport = MemoryTransport::new();
        {
            let echo: Arc<dyn KnockHandler> = Arc::new(Echo);
            transport.register("b", echo);
        }
        assert!(transport.knock("b", abort()).await.is_err());
    }

    #[test]
    fn knock_wire_shape() {
        let value = serde_json::to_value(abort()).unwrap();
        assert_eq!(value["body"]["round"], "abort");
        assert_eq!(value["body"]["umid"], "u1");
    }
}
