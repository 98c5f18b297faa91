//! Per-transaction orchestration.
//!
//! The entry node drives a transaction through lock, load, local
//! verify/vote, the peer vote round, commit, the peer commit round,
//! territoriality selection, finalize and release. Peers run the same
//! coordinator in participant mode: they vote when knocked and then wait for
//! commit, finalize or abort instructions from the entry node.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::contract::{ContractContext, ContractRegistry};
use super::error::LedgerError;
use super::executor::{ContractExecutor, Phase, PhaseFailure};
use super::lock::{HeldStreams, StreamLock};
use super::store::{Document, EventSink, PersistenceStore, QueryEngine};
use super::stream::{state_doc_id, volatile_doc_id, ActivityStream};
use super::summary::{record_vote_response, select_territoriality, Summary, VoteTally};
use super::transport::{Knock, KnockBody, NetworkTransport};
use super::types::{
    unix_time_us, Config, LedgerResponse, NodeRef, NodeResponse, StreamsAffected, TxEntry,
    TxRecord, TxStatus,
};
use super::verify::{check_contract_lock, check_signatures, SignatureVerifier};

pub const DUPLICATE_TRANSACTION: &str = "Duplicate transaction";
pub const STREAM_POSITION_INCORRECT: &str = "Stream position incorrect";
pub const NOT_IN_FLIGHT: &str = "Transaction not in flight";
const NOT_LOADED: &str = "transaction not loaded";

/// Collaborators shared by every coordinator on a node.
pub(crate) struct Services {
    pub config: Arc<Config>,
    pub lock: Arc<StreamLock>,
    pub store: Arc<dyn PersistenceStore>,
    pub transport: Arc<dyn NetworkTransport>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub contracts: Arc<ContractRegistry>,
    pub query: Arc<dyn QueryEngine>,
    pub events: Arc<dyn EventSink>,
}

/// Instruction from the entry node to a participant that voted yes.
pub(crate) enum Instruction {
    Commit {
        incomms: BTreeMap<NodeRef, Value>,
        reply: oneshot::Sender<NodeResponse>,
    },
    Finalize {
        who: NodeRef,
        reply: oneshot::Sender<NodeResponse>,
    },
    Abort {
        reason: String,
        reply: oneshot::Sender<NodeResponse>,
    },
}

type RoundSender = mpsc::Sender<(NodeRef, anyhow::Result<NodeResponse>)>;
type RoundReceiver = mpsc::Receiver<(NodeRef, anyhow::Result<NodeResponse>)>;

#[derive(Default)]
struct Timings {
    lock_us: u64,
    load_us: u64,
    local_vote_us: u64,
    vote_round_us: u64,
    commit_us: u64,
    commit_round_us: u64,
    post_process_us: u64,
}

fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

/// Owns one in-flight transaction on one node.
pub struct ConsensusCoordinator {
    services: Arc<Services>,
    entry: Arc<TxEntry>,
    is_entry: bool,
    held: Option<HeldStreams>,
    executor: Option<ContractExecutor>,
    cancel: CancellationToken,
    commit_at: Option<u64>,
    record_rev: Option<String>,
    affected: StreamsAffected,
    started: Instant,
    timings: Timings,
}

impl ConsensusCoordinator {
    pub(crate) fn new(
        services: Arc<Services>,
        entry: TxEntry,
        is_entry: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            services,
            entry: Arc::new(entry),
            is_entry,
            held: None,
            executor: None,
            cancel,
            commit_at: None,
            record_rev: None,
            affected: StreamsAffected::default(),
            started: Instant::now(),
            timings: Timings::default(),
        }
    }

    pub fn umid(&self) -> &str {
        &self.entry.umid
    }

    pub fn entry(&self) -> &TxEntry {
        &self.entry
    }

    /// The executor's phase, if the transaction has been loaded.
    pub fn phase(&self) -> Option<Phase> {
        self.executor.as_ref().map(ContractExecutor::phase)
    }

    fn node_ref(&self) -> &str {
        &self.services.config.node_ref
    }

    /// Hold every referenced stream as one batch.
    pub(crate) fn lock(&mut self) -> Result<(), LedgerError> {
        let start = Instant::now();
        let streams = self.entry.streams.clone();
        let held = HeldStreams::acquire(&self.services.lock, streams.clone())
            .ok_or(LedgerError::LockUnavailable(streams))?;
        self.held = Some(held);
        self.timings.lock_us = elapsed_us(start);
        Ok(())
    }

    /// Release the stream batch. Idempotent.
    pub(crate) fn release(&mut self) {
        if let Some(mut held) = self.held.take() {
            held.release();
        }
    }

    /// Resolve the contract and load every referenced stream. On the entry
    /// node this also stamps the pre-image revisions onto the entry.
    pub(crate) async fn load(&mut self) -> Result<(), LedgerError> {
        let start = Instant::now();
        let entry = Arc::clone(&self.entry);
        let contract = self
            .services
            .contracts
            .resolve(&entry.tx.namespace, &entry.tx.contract)
            .ok_or_else(|| LedgerError::ContractNotFound(entry.tx.contract_ref()))?;
        let caps = contract.capabilities();
        let mut ctx = ContractContext::new(Arc::clone(&entry), self.node_ref().to_string(), caps);

        let store = self.services.store.as_ref();
        for id in &entry.streams {
            if let Some(stream) = load_stream(store, id).await? {
                ctx.insert_stream(stream);
            }
        }
        if let Some(readonly) = &entry.tx.readonly {
            for (label, id) in readonly {
                let state = store
                    .get(&state_doc_id(id))
                    .await?
                    .map(|doc| doc.body)
                    .unwrap_or(Value::Null);
                ctx.insert_read_only(label.clone(), state);
            }
        }
        if caps.contains(super::contract::Capability::Query) {
            ctx.set_query(Arc::clone(&self.services.query));
        }

        if self.is_entry {
            let mut stamped = (*entry).clone();
            stamped.revisions = ctx
                .streams()
                .filter_map(|s| s.state_revision().map(|rev| (s.id().to_string(), rev.to_string())))
                .collect();
            self.entry = Arc::new(stamped);
            ctx.set_entry(Arc::clone(&self.entry));
        }

        self.executor = Some(ContractExecutor::new(
            contract,
            ctx,
            self.services.config.phase_timeout,
            self.cancel.clone(),
        )?);
        self.timings.load_us = elapsed_us(start);
        Ok(())
    }

    /// Signature and contract-lock checks, the contract's verify, the
    /// stream position check (participants only) and the contract's vote.
    /// Returns the inter-node comms the contract shared.
    pub(crate) async fn verify_and_vote(&mut self) -> Result<Option<Value>, PhaseFailure> {
        let start = Instant::now();
        let verifier = Arc::clone(&self.services.verifier);
        let entry = Arc::clone(&self.entry);
        let is_entry = self.is_entry;
        let Some(executor) = self.executor.as_mut() else {
            return Err(PhaseFailure::rejected(Phase::Verifying, NOT_LOADED));
        };

        let ctx = executor.context();
        let checked = check_contract_lock(&entry, ctx.streams())
            .and_then(|_| check_signatures(verifier.as_ref(), &entry, ctx.streams()));
        if let Err(rejection) = checked {
            executor.fail();
            return Err(PhaseFailure::rejected(Phase::Verifying, rejection.reason));
        }
        executor.verify(entry.selfsign).await?;

        if !is_entry && !positions_match(&entry, executor.context()) {
            executor.fail();
            return Err(PhaseFailure::rejected(
                Phase::Voting,
                STREAM_POSITION_INCORRECT,
            ));
        }
        executor.vote().await?;
        let incomms = executor.context_mut().take_inter_node_comms();
        self.timings.local_vote_us = elapsed_us(start);
        Ok(incomms)
    }

    /// Run the contract's commit and persist every dirty stream together with
    /// the transaction record. Returns the commit value and the local
    /// commit-completion time in unix microseconds.
    pub(crate) async fn commit(
        &mut self,
        possible_territoriality: bool,
        incomms: BTreeMap<NodeRef, Value>,
        summary: &Summary,
    ) -> Result<(Value, u64), LedgerError> {
        let start = Instant::now();
        let executor = self
            .executor
            .as_mut()
            .ok_or_else(|| LedgerError::CommitFailed(NOT_LOADED.to_string()))?;
        executor.context_mut().set_received_comms(incomms);
        let value = executor.commit(possible_territoriality).await?;

        if let Err(err) = self.persist(summary).await {
            if let Some(executor) = self.executor.as_mut() {
                executor.fail();
            }
            return Err(err);
        }
        let commit_at = unix_time_us();
        self.commit_at = Some(commit_at);
        self.flush_events().await;
        self.timings.commit_us = elapsed_us(start);
        Ok((value, commit_at))
    }

    async fn persist(&mut self, summary: &Summary) -> Result<(), LedgerError> {
        let store = Arc::clone(&self.services.store);
        let entry = Arc::clone(&self.entry);
        let executor = self
            .executor
            .as_mut()
            .ok_or_else(|| LedgerError::CommitFailed(NOT_LOADED.to_string()))?;
        let ctx = executor.context_mut();

        let created = ctx.created().to_vec();
        let mut affected = StreamsAffected::default();
        for id in &created {
            if let Ok(stream) = ctx.stream(id) {
                affected.new.push(stream.record());
            }
        }
        for stream in ctx.streams() {
            if stream.is_dirty() && !created.iter().any(|c| c.as_str() == stream.id()) {
                affected.updated.push(stream.record());
            }
        }

        let mut docs = Vec::new();
        for stream in ctx.streams_mut() {
            docs.extend(stream.documents());
        }
        let record = TxRecord {
            entry: (*entry).clone(),
            status: TxStatus::Committed,
            summary: summary.clone(),
            territoriality: None,
            streams: affected.clone(),
        };
        let record_id = TxRecord::doc_id(&entry.umid);
        let body = serde_json::to_value(&record).context("encoding transaction record")?;
        docs.push(Document::new(record_id.clone(), body));

        let written = store
            .bulk_docs(docs)
            .await
            .with_context(|| format!("persisting transaction {}", entry.umid))?;
        for stream in ctx.streams_mut() {
            stream.persisted(&written);
        }
        self.record_rev = written
            .iter()
            .find(|doc| doc.id == record_id)
            .and_then(|doc| doc.rev.clone());
        self.affected = affected;
        Ok(())
    }

    async fn flush_events(&mut self) {
        let Some(executor) = self.executor.as_mut() else {
            return;
        };
        let events = executor.context_mut().take_events();
        if events.is_empty() {
            return;
        }
        let contract = self.entry.tx.contract_ref();
        if let Err(err) = self
            .services
            .events
            .emit(&self.entry.umid, &contract, events)
            .await
        {
            tracing::warn!(umid = %self.entry.umid, error = ?err, "contract events not emitted");
        }
    }

    /// Run post-process with this node's territoriality flag, then persist
    /// whatever volatile data it changed. Never reverses the commit.
    pub(crate) async fn post_process(&mut self, who: &str) -> Result<Option<Value>, PhaseFailure> {
        let start = Instant::now();
        let territoriality = who == self.node_ref();
        let Some(executor) = self.executor.as_mut() else {
            return Err(PhaseFailure::rejected(Phase::PostProcessing, NOT_LOADED));
        };
        let result = executor.post_process(territoriality, who).await;

        let docs = executor
            .context()
            .streams()
            .flat_map(ActivityStream::volatile_documents)
            .collect::<Vec<_>>();
        if !docs.is_empty() {
            match self.services.store.bulk_docs(docs).await {
                Ok(written) => {
                    if let Some(executor) = self.executor.as_mut() {
                        for stream in executor.context_mut().streams_mut() {
                            stream.persisted(&written);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(umid = %self.entry.umid, error = ?err, "volatile data not persisted");
                }
            }
        }
        if let Err(failure) = &result {
            tracing::warn!(
                umid = %self.entry.umid,
                territoriality = territoriality,
                reason = %failure.reason,
                "post-process failed"
            );
        }
        self.timings.post_process_us = elapsed_us(start);
        result
    }

    async fn write_record(&mut self, status: TxStatus, summary: &Summary, who: Option<&str>) {
        let record = TxRecord {
            entry: (*self.entry).clone(),
            status,
            summary: summary.clone(),
            territoriality: who.map(str::to_string),
            streams: self.affected.clone(),
        };
        let body = match serde_json::to_value(&record) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(umid = %self.entry.umid, error = ?err, "transaction record not encoded");
                return;
            }
        };
        let doc = Document::new(TxRecord::doc_id(&self.entry.umid), body)
            .with_rev(self.record_rev.clone());
        match self.services.store.put(doc).await {
            Ok(written) => self.record_rev = written.rev,
            Err(err) => {
                tracing::warn!(umid = %self.entry.umid, error = ?err, "transaction record not written");
            }
        }
    }

    /// Knock `peers` concurrently. Each result arrives on the returned
    /// channel; dropping the receiver discards late answers.
    fn fan_out(&self, peers: &[NodeRef], body: KnockBody) -> RoundReceiver {
        fan_out(&self.services, peers, &body)
    }

    fn abort_body(&self, reason: &str) -> KnockBody {
        KnockBody::Abort {
            umid: self.entry.umid.clone(),
            reason: reason.to_string(),
        }
    }

    fn abort_peers(&self, peers: &[NodeRef], reason: &str) {
        if peers.is_empty() {
            return;
        }
        // Fire and forget; peers also give up on their own after a timeout.
        drop(self.fan_out(peers, self.abort_body(reason)));
    }

    /// Drain votes that were still outstanding when the round was decided.
    /// Peers voting yes get `follow_up`. With `results`, every late peer
    /// reports there: yes voters through their follow-up knock, the rest
    /// with their vote response.
    fn follow_late_votes(
        &self,
        mut votes: RoundReceiver,
        follow_up: KnockBody,
        results: Option<RoundSender>,
    ) {
        let services = Arc::clone(&self.services);
        tokio::spawn(async move {
            while let Some((peer, resp)) = votes.recv().await {
                let voted = matches!(&resp, Ok(resp) if resp.vote);
                match (&results, voted) {
                    (Some(results), true) => {
                        spawn_knocks(&services, results, std::slice::from_ref(&peer), &follow_up)
                    }
                    (None, true) => drop(fan_out(&services, &[peer], &follow_up)),
                    (Some(results), false) => {
                        let _ = results.send((peer, resp)).await;
                    }
                    (None, false) => {}
                }
            }
        });
    }

    async fn fail(mut self, summary: Summary, err: LedgerError) -> LedgerResponse {
        if let Some(executor) = self.executor.as_mut() {
            executor.fail();
        }
        self.release();
        if !matches!(err, LedgerError::LockUnavailable(_)) {
            self.write_record(TxStatus::Failed, &summary, None).await;
        }
        tracing::debug!(
            umid = %self.entry.umid,
            kind = ?err.kind(),
            error = %err,
            "transaction failed"
        );
        LedgerResponse::failed(self.entry.umid.clone(), summary, &err)
    }

    /// Entry-node flow. Always produces a structured response.
    pub(crate) async fn run_entry(mut self) -> LedgerResponse {
        let config = Arc::clone(&self.services.config);
        let node_ref = config.node_ref.clone();
        let multi = self.entry.multi_node && config.is_multi_node();
        let peers = if multi { config.peers.clone() } else { Vec::new() };
        let total = peers.len() + 1;
        let mut summary = Summary::new(total);

        if let Err(err) = self.lock() {
            summary.record_error(node_ref.as_str(), err.to_string());
            return self.fail(summary, err).await;
        }
        if let Err(err) = self.load().await {
            summary.record_error(node_ref.as_str(), err.to_string());
            return self.fail(summary, err).await;
        }

        let mut incomms = BTreeMap::new();
        match self.verify_and_vote().await {
            Ok(shared) => {
                summary.record_vote();
                if let Some(shared) = shared {
                    incomms.insert(node_ref.clone(), shared);
                }
            }
            Err(failure) => {
                summary.record_error(node_ref.as_str(), failure.reason.clone());
                self.abort_peers(&peers, &failure.reason);
                return self.fail(summary, failure.into()).await;
            }
        }

        // Yes voters known when quorum was reached, and the peers whose vote
        // was still outstanding then.
        let mut commit_targets = Vec::new();
        let mut late = BTreeSet::new();
        let mut late_votes = None;
        if multi {
            let start = Instant::now();
            let mut tally = VoteTally::new(total, config.quorum);
            tally.record(true);
            let mut rx = self.fan_out(
                &peers,
                KnockBody::Vote {
                    entry: (*self.entry).clone(),
                },
            );
            let mut pending = peers.iter().cloned().collect::<BTreeSet<_>>();
            let deadline = time::Instant::now() + config.phase_timeout;
            while tally.decided().is_none() {
                let remaining = deadline.saturating_duration_since(time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Ok(Some((peer, resp))) = time::timeout(remaining, rx.recv()).await else {
                    break;
                };
                pending.remove(&peer);
                record_vote_response(&mut summary, &mut tally, &peer, &resp);
                if let Ok(resp) = resp {
                    if resp.vote {
                        if let Some(shared) = resp.incomms {
                            incomms.insert(peer.clone(), shared);
                        }
                        commit_targets.push(peer);
                    }
                }
            }
            self.timings.vote_round_us = elapsed_us(start);

            match tally.decided() {
                Some(true) => {
                    late = pending;
                    late_votes = Some(rx);
                }
                decided => {
                    if decided.is_none() {
                        for peer in &pending {
                            summary.record_unreachable(peer.as_str(), "vote timed out");
                        }
                    }
                    let err = LedgerError::QuorumNotReached {
                        votes: tally.yes(),
                        required: tally.required(),
                    };
                    tracing::warn!(
                        umid = %self.entry.umid,
                        votes = tally.yes(),
                        required = tally.required(),
                        errors = summary.errors.len(),
                        "quorum not reached"
                    );
                    let reason = err.to_string();
                    self.abort_peers(&commit_targets, &reason);
                    self.follow_late_votes(rx, self.abort_body(&reason), None);
                    return self.fail(summary, err).await;
                }
            }
        }

        let commit_body = KnockBody::Commit {
            umid: self.entry.umid.clone(),
            incomms: incomms.clone(),
        };
        // Peers only hear commit once this node has committed and persisted.
        let (value, commit_at) = match self.commit(true, incomms, &summary).await {
            Ok(committed) => committed,
            Err(err) => {
                summary.record_error(node_ref.as_str(), err.to_string());
                let reason = err.to_string();
                self.abort_peers(&commit_targets, &reason);
                if let Some(votes) = late_votes {
                    self.follow_late_votes(votes, self.abort_body(&reason), None);
                }
                return self.fail(summary, err).await;
            }
        };
        let (commit_tx, commit_rx) = mpsc::channel(peers.len().max(1));
        spawn_knocks(&self.services, &commit_tx, &commit_targets, &commit_body);
        if let Some(votes) = late_votes {
            self.follow_late_votes(votes, commit_body, Some(commit_tx.clone()));
        }
        drop(commit_tx);
        summary.record_commit();
        let mut responses = BTreeMap::new();
        responses.insert(node_ref.clone(), value);

        if self.entry.instant {
            let interim = LedgerResponse {
                umid: self.entry.umid.clone(),
                status: TxStatus::Committed,
                failure: None,
                error: None,
                summary: summary.clone(),
                streams: self.affected.clone(),
                territoriality: None,
                responses: responses.clone(),
            };
            tokio::spawn(async move {
                self.complete(summary, responses, commit_targets, late, commit_rx, commit_at)
                    .await;
            });
            return interim;
        }
        self.complete(summary, responses, commit_targets, late, commit_rx, commit_at)
            .await
    }

    /// Collect the commit round, settle territoriality, finalize peers and
    /// post-process locally.
    async fn complete(
        mut self,
        mut summary: Summary,
        mut responses: BTreeMap<NodeRef, Value>,
        commit_targets: Vec<NodeRef>,
        late: BTreeSet<NodeRef>,
        mut commit_rx: RoundReceiver,
        commit_at: u64,
    ) -> LedgerResponse {
        let config = Arc::clone(&self.services.config);
        let node_ref = config.node_ref.clone();
        let mut claims = vec![(node_ref.clone(), commit_at)];
        let mut finalize_targets = Vec::new();
        let mut expected = commit_targets.into_iter().collect::<BTreeSet<_>>();
        expected.extend(late.iter().cloned());

        if !expected.is_empty() {
            let start = Instant::now();
            let deadline = time::Instant::now() + config.phase_timeout;
            while !expected.is_empty() {
                let remaining = deadline.saturating_duration_since(time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Ok(Some((peer, resp))) = time::timeout(remaining, commit_rx.recv()).await
                else {
                    break;
                };
                if !expected.remove(&peer) {
                    continue;
                }
                match resp {
                    Ok(resp) if resp.commit => {
                        if late.contains(&peer) {
                            summary.record_vote();
                        }
                        summary.record_commit();
                        if let Some(at) = resp.commit_at {
                            claims.push((peer.clone(), at));
                        }
                        if let Some(value) = resp.return_value {
                            responses.insert(peer.clone(), value);
                        }
                        finalize_targets.push(peer);
                    }
                    Ok(resp) => {
                        let reason = resp.error.unwrap_or_else(|| "commit failed".to_string());
                        summary.record_error(peer, reason);
                    }
                    Err(err) => summary.record_unreachable(peer, format!("{err:#}")),
                }
            }
            // Silent peers may still be holding their streams.
            for peer in std::mem::take(&mut expected) {
                summary.record_unreachable(peer.as_str(), "commit timed out");
                finalize_targets.push(peer);
            }
            self.timings.commit_round_us = elapsed_us(start);
        }
        drop(commit_rx);

        let who = select_territoriality(claims.iter().map(|(node, at)| (node.as_str(), *at)))
            .unwrap_or_else(|| node_ref.clone());
        tracing::debug!(umid = %self.entry.umid, who = %who, "territoriality selected");

        let finalize_rx = (!finalize_targets.is_empty()).then(|| {
            self.fan_out(
                &finalize_targets,
                KnockBody::Finalize {
                    umid: self.entry.umid.clone(),
                    who: who.clone(),
                },
            )
        });

        if let Err(failure) = self.post_process(&who).await {
            summary.record_error(node_ref.as_str(), failure.reason);
        }

        if let Some(mut rx) = finalize_rx {
            let deadline = time::Instant::now() + config.rpc_timeout;
            for _ in 0..finalize_targets.len() {
                let remaining = deadline.saturating_duration_since(time::Instant::now());
                let Ok(Some((peer, resp))) = time::timeout(remaining, rx.recv()).await else {
                    break;
                };
                let failed = match resp {
                    Ok(resp) => resp.error,
                    Err(err) => Some(format!("{err:#}")),
                };
                if let Some(reason) = failed {
                    tracing::debug!(umid = %self.entry.umid, peer = %peer, reason = %reason, "finalize not applied");
                }
            }
        }

        self.write_record(TxStatus::Committed, &summary, Some(who.as_str())).await;
        self.release();
        self.log_if_slow(&summary);

        LedgerResponse {
            umid: self.entry.umid.clone(),
            status: TxStatus::Committed,
            failure: None,
            error: None,
            summary,
            streams: self.affected.clone(),
            territoriality: Some(who),
            responses,
        }
    }

    fn log_if_slow(&self, summary: &Summary) {
        let total = self.started.elapsed();
        if total < self.services.config.slow_tx_threshold {
            return;
        }
        let t = &self.timings;
        tracing::info!(
            umid = %self.entry.umid,
            contract = %self.entry.tx.contract_ref(),
            streams = self.entry.streams.len(),
            votes = summary.vote,
            commits = summary.commit,
            total_nodes = summary.total,
            lock_us = t.lock_us,
            load_us = t.load_us,
            local_vote_us = t.local_vote_us,
            vote_round_us = t.vote_round_us,
            commit_us = t.commit_us,
            commit_round_us = t.commit_round_us,
            post_process_us = t.post_process_us,
            total_us = total.as_micros() as u64,
            "slow transaction"
        );
    }

    /// Participant vote: lock, load, verify and vote. A `vote: true`
    /// response means the streams stay held until the entry node's next
    /// instruction or the participant timeout.
    pub(crate) async fn participate(&mut self) -> NodeResponse {
        if let Err(err) = self.lock() {
            return NodeResponse::failed(err.to_string());
        }
        if let Err(err) = self.load().await {
            self.release();
            return NodeResponse::failed(err.to_string());
        }
        match self.verify_and_vote().await {
            Ok(incomms) => NodeResponse {
                vote: true,
                incomms,
                ..NodeResponse::now()
            },
            Err(failure) => {
                tracing::debug!(
                    umid = %self.entry.umid,
                    origin = %self.entry.origin,
                    phase = %failure.phase,
                    reason = %failure.reason,
                    "vote rejected"
                );
                self.release();
                NodeResponse::failed(failure.reason)
            }
        }
    }

    /// Serve instructions for a transaction this node voted yes on, until
    /// finalize, abort, a failed commit or the participant timeout.
    pub(crate) async fn run_participant(mut self, mut rx: mpsc::Receiver<Instruction>) {
        let wait = self.services.config.participant_timeout;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => None,
                next = time::timeout(wait, rx.recv()) => next.ok().flatten(),
            };
            let Some(instruction) = next else {
                tracing::warn!(
                    umid = %self.entry.umid,
                    origin = %self.entry.origin,
                    committed = self.commit_at.is_some(),
                    "participant released without instruction"
                );
                self.cancel.cancel();
                break;
            };
            match instruction {
                Instruction::Commit { incomms, reply } => {
                    let mut local = Summary::new(self.services.config.total());
                    local.record_vote();
                    local.record_commit();
                    match self.commit(false, incomms, &local).await {
                        Ok((value, at)) => {
                            let _ = reply.send(NodeResponse {
                                vote: true,
                                commit: true,
                                commit_at: Some(at),
                                return_value: Some(value),
                                ..NodeResponse::now()
                            });
                        }
                        Err(err) => {
                            tracing::debug!(umid = %self.entry.umid, error = %err, "participant commit failed");
                            let _ = reply.send(NodeResponse::failed(err.to_string()));
                            break;
                        }
                    }
                }
                Instruction::Finalize { who, reply } => {
                    if self.commit_at.is_none() {
                        let _ = reply.send(NodeResponse::failed("Transaction not committed"));
                        break;
                    }
                    let resp = match self.post_process(&who).await {
                        Ok(payload) => NodeResponse {
                            vote: true,
                            commit: true,
                            commit_at: self.commit_at,
                            post_process: payload,
                            ..NodeResponse::now()
                        },
                        Err(failure) => NodeResponse {
                            vote: true,
                            commit: true,
                            commit_at: self.commit_at,
                            ..NodeResponse::failed(failure.reason)
                        },
                    };
                    let mut local = Summary::new(self.services.config.total());
                    local.record_vote();
                    local.record_commit();
                    self.write_record(TxStatus::Committed, &local, Some(who.as_str())).await;
                    // Free the streams before the entry node hears back.
                    self.release();
                    let _ = reply.send(resp);
                    break;
                }
                Instruction::Abort { reason, reply } => {
                    tracing::debug!(umid = %self.entry.umid, reason = %reason, "participant aborted");
                    self.release();
                    let _ = reply.send(NodeResponse::now());
                    break;
                }
            }
        }

        if let Some(executor) = self.executor.as_mut() {
            if self.commit_at.is_some() {
                executor.complete();
            } else {
                executor.fail();
            }
        }
        self.release();
    }
}

/// Stream positions the entry node loaded must match this node's.
fn positions_match(entry: &TxEntry, ctx: &ContractContext) -> bool {
    entry.streams.iter().all(|id| {
        let local = ctx.stream(id).ok().and_then(ActivityStream::state_revision);
        local == entry.revisions.get(id).map(String::as_str)
    })
}

pub(crate) async fn load_stream(
    store: &dyn PersistenceStore,
    id: &str,
) -> anyhow::Result<Option<ActivityStream>> {
    let Some(meta) = store.get(id).await? else {
        return Ok(None);
    };
    let state = store.get(&state_doc_id(id)).await?;
    let volatile = store.get(&volatile_doc_id(id)).await?;
    ActivityStream::from_documents(id.to_string(), Some(meta), state, volatile)
}

/// Knock every peer in its own task; results go to `tx`.
fn spawn_knocks(services: &Services, tx: &RoundSender, peers: &[NodeRef], body: &KnockBody) {
    let rpc_timeout = services.config.rpc_timeout;
    let round = body.round();
    for peer in peers.iter().cloned() {
        let transport = Arc::clone(&services.transport);
        let tx = tx.clone();
        let knock = Knock {
            from: services.config.node_ref.clone(),
            body: body.clone(),
        };
        tokio::spawn(async move {
            let resp = match time::timeout(rpc_timeout, transport.knock(&peer, knock)).await {
                Ok(resp) => resp.map_err(|e| anyhow::anyhow!("{round} knock failed: {e:#}")),
                Err(_) => Err(anyhow::anyhow!("{round} knock timed out")),
            };
            let _ = tx.send((peer, resp)).await;
        });
    }
}

fn fan_out(services: &Services, peers: &[NodeRef], body: &KnockBody) -> RoundReceiver {
    let (tx, rx) = mpsc::channel(peers.len().max(1));
    spawn_knocks(services, &tx, peers, body);
    rx
}
