//! Knock transport over the ledger wire protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use ledger_consensus::consensus::{Knock, NetworkTransport, NodeRef, NodeResponse};

use crate::client::LedgerClient;

pub struct TcpTransport {
    peers: HashMap<NodeRef, LedgerClient>,
}

impl TcpTransport {
    pub fn new(peers: &[(NodeRef, SocketAddr)], rpc_timeout: Duration) -> Self {
        let peers = peers
            .iter()
            .map(|(node, addr)| (node.clone(), LedgerClient::new(*addr, rpc_timeout)))
            .collect();
        Self { peers }
    }
}

#[async_trait]
impl NetworkTransport for TcpTransport {
    async fn knock(&self, target: &str, knock: Knock) -> anyhow::Result<NodeResponse> {
        let client = self
            .peers
            .get(target)
            .ok_or_else(|| anyhow::anyhow!("unknown peer {target}"))?;
        client.knock(knock).await
    }
}
