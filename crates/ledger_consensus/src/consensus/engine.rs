//! Node-level consensus service.
//!
//! `LedgerEngine` admits client transactions (entry-node flow), answers
//! peer knocks (participant flow) and serves transaction and stream lookups.
//! Participants that voted yes live in the in-flight map until the entry
//! node finalizes or aborts them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::contract::ContractRegistry;
use super::coordinator::{
    load_stream, ConsensusCoordinator, Instruction, Services, DUPLICATE_TRANSACTION, NOT_IN_FLIGHT,
};
use super::lock::StreamLock;
use super::store::{EventSink, PersistenceStore, QueryEngine, StoreEvents, StoreInfo, StoreQuery};
use super::stream::StreamView;
use super::summary::{QuorumPolicy, Summary};
use super::transport::{Knock, KnockBody, KnockHandler, NetworkTransport};
use super::types::{Config, LedgerResponse, NodeRef, NodeResponse, TxEntry, TxPacket, TxRecord, Umid};
use super::verify::SignatureVerifier;

/// External collaborators of an engine. Query and event engines default to
/// adapters over the persistence store.
pub struct EngineServices {
    pub store: Arc<dyn PersistenceStore>,
    pub transport: Arc<dyn NetworkTransport>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub contracts: ContractRegistry,
    pub query: Option<Arc<dyn QueryEngine>>,
    pub events: Option<Arc<dyn EventSink>>,
}

impl EngineServices {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        transport: Arc<dyn NetworkTransport>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            store,
            transport,
            verifier,
            contracts: ContractRegistry::with_builtin(),
            query: None,
            events: None,
        }
    }

    pub fn with_contracts(mut self, contracts: ContractRegistry) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }
}

/// Snapshot of a node's consensus state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub node_ref: NodeRef,
    pub peers: Vec<NodeRef>,
    pub quorum: QuorumPolicy,
    pub in_flight: usize,
    pub held_streams: usize,
    pub store: StoreInfo,
}

type Inflight = Arc<Mutex<HashMap<Umid, mpsc::Sender<Instruction>>>>;

pub struct LedgerEngine {
    services: Arc<Services>,
    inflight: Inflight,
    shutdown: CancellationToken,
}

impl LedgerEngine {
    pub fn new(config: Arc<Config>, services: EngineServices) -> Arc<Self> {
        let EngineServices {
            store,
            transport,
            verifier,
            contracts,
            query,
            events,
        } = services;
        let query = query.unwrap_or_else(|| StoreQuery::new(Arc::clone(&store)));
        let events = events.unwrap_or_else(|| StoreEvents::new(Arc::clone(&store)));
        let lock = StreamLock::new(config.lock_grace);
        tracing::info!(
            node_ref = %config.node_ref,
            peers = ?config.peers,
            quorum = %config.quorum,
            contracts = contracts.len(),
            "ledger engine ready"
        );
        Arc::new(Self {
            services: Arc::new(Services {
                config,
                lock,
                store,
                transport,
                verifier,
                contracts: Arc::new(contracts),
                query,
                events,
            }),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.services.config
    }

    pub fn node_ref(&self) -> &str {
        &self.services.config.node_ref
    }

    pub fn stream_lock(&self) -> &Arc<StreamLock> {
        &self.services.lock
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.services.store
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<Umid, mpsc::Sender<Instruction>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight().len()
    }

    /// Cancel every participant task. Entry-node flows already running
    /// finish their current phase and fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Admit a client transaction and run it to completion with this node
    /// as the entry node.
    pub async fn submit(&self, packet: TxPacket) -> LedgerResponse {
        let config = &self.services.config;
        let entry = match TxEntry::admit(packet, &config.node_ref, config.is_multi_node()) {
            Ok(entry) => entry,
            Err(err) => {
                let mut summary = Summary::new(1);
                summary.record_error(config.node_ref.as_str(), err.to_string());
                return LedgerResponse::failed(String::new(), summary, &err);
            }
        };
        tracing::debug!(
            umid = %entry.umid,
            contract = %entry.tx.contract_ref(),
            streams = entry.streams.len(),
            instant = entry.instant,
            "transaction admitted"
        );
        ConsensusCoordinator::new(
            Arc::clone(&self.services),
            entry,
            true,
            self.shutdown.child_token(),
        )
        .run_entry()
        .await
    }

    pub async fn handle_knock(&self, knock: Knock) -> NodeResponse {
        let Knock { from, body } = knock;
        match body {
            KnockBody::Vote { entry } => self.vote(from, entry).await,
            KnockBody::Commit { umid, incomms } => {
                self.instruct(&umid, |reply| Instruction::Commit { incomms, reply })
                    .await
            }
            KnockBody::Finalize { umid, who } => {
                self.instruct(&umid, |reply| Instruction::Finalize { who, reply })
                    .await
            }
            KnockBody::Abort { umid, reason } => {
                if !self.inflight().contains_key(&umid) {
                    return NodeResponse::now();
                }
                self.instruct(&umid, |reply| Instruction::Abort { reason, reply })
                    .await
            }
        }
    }

    async fn vote(&self, from: NodeRef, entry: TxEntry) -> NodeResponse {
        let umid = entry.umid.clone();
        let (tx, rx) = mpsc::channel(4);
        {
            let mut inflight = self.inflight();
            if inflight.contains_key(&umid) {
                return NodeResponse::failed(DUPLICATE_TRANSACTION);
            }
            inflight.insert(umid.clone(), tx);
        }

        match self.services.store.get(&TxRecord::doc_id(&umid)).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                self.inflight().remove(&umid);
                return NodeResponse::failed(DUPLICATE_TRANSACTION);
            }
            Err(err) => {
                self.inflight().remove(&umid);
                return NodeResponse::failed(format!("{err:#}"));
            }
        }

        let mut coordinator = ConsensusCoordinator::new(
            Arc::clone(&self.services),
            entry,
            false,
            self.shutdown.child_token(),
        );
        let resp = coordinator.participate().await;
        if !resp.vote {
            self.inflight().remove(&umid);
            return resp;
        }

        tracing::debug!(umid = %umid, origin = %from, "voted yes, holding streams");
        let inflight = Arc::clone(&self.inflight);
        tokio::spawn(async move {
            coordinator.run_participant(rx).await;
            inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&umid);
        });
        resp
    }

    async fn instruct<F>(&self, umid: &str, make: F) -> NodeResponse
    where
        F: FnOnce(oneshot::Sender<NodeResponse>) -> Instruction,
    {
        let sender = self.inflight().get(umid).cloned();
        let Some(sender) = sender else {
            return NodeResponse::failed(NOT_IN_FLIGHT);
        };
        let (reply, rx) = oneshot::channel();
        if sender.send(make(reply)).await.is_err() {
            return NodeResponse::failed(NOT_IN_FLIGHT);
        }
        rx.await
            .unwrap_or_else(|_| NodeResponse::failed(NOT_IN_FLIGHT))
    }

    /// Transaction record by umid, as stored on this node.
    pub async fn transaction(&self, umid: &str) -> anyhow::Result<Option<TxRecord>> {
        let Some(doc) = self.services.store.get(&TxRecord::doc_id(umid)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_value(doc.body)
            .with_context(|| format!("decoding transaction record {umid}"))?;
        Ok(Some(record))
    }

    pub async fn stream(&self, id: &str) -> anyhow::Result<Option<StreamView>> {
        Ok(load_stream(self.services.store.as_ref(), id)
            .await?
            .map(|stream| stream.view()))
    }

    pub async fn info(&self) -> anyhow::Result<EngineInfo> {
        let config = &self.services.config;
        Ok(EngineInfo {
            node_ref: config.node_ref.clone(),
            peers: config.peers.clone(),
            quorum: config.quorum,
            in_flight: self.in_flight(),
            held_streams: self.services.lock.held_count(),
            store: self.services.store.info().await?,
        })
    }
}

#[async_trait]
impl KnockHandler for LedgerEngine {
    async fn handle_knock(&self, knock: Knock) -> NodeResponse {
        LedgerEngine::handle_knock(self, knock).await
    }
}

impl Drop for LedgerEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
