//! Phase state machine for one contract instance.
//!
//! `Verifying -> Voting -> Committing -> PostProcessing -> Complete`, with
//! `Failed` reachable from every non-terminal phase. Verify, vote and commit
//! each run under the configured time budget; post-process does not. Every
//! phase also stops early when the transaction's cancellation token fires.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::contract::{Capability, Contract, ContractContext, PhaseResult};
use super::error::{ErrorKind, LedgerError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Verifying,
    Voting,
    Committing,
    PostProcessing,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    fn rejection_kind(self) -> ErrorKind {
        match self {
            Phase::Verifying => ErrorKind::VerifyRejected,
            Phase::Voting => ErrorKind::VoteRejected,
            Phase::Committing => ErrorKind::CommitFailed,
            Phase::PostProcessing => ErrorKind::PostProcessFailed,
            Phase::Complete | Phase::Failed => ErrorKind::InvalidTransaction,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Verifying => "verify",
            Phase::Voting => "vote",
            Phase::Committing => "commit",
            Phase::PostProcessing => "post-process",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a phase did not succeed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub kind: ErrorKind,
    pub reason: String,
    /// Set when the failure is a timeout.
    pub timeout: Option<Duration>,
}

impl PhaseFailure {
    pub fn rejected(phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            kind: phase.rejection_kind(),
            reason: reason.into(),
            timeout: None,
        }
    }

    fn timed_out(phase: Phase, timeout: Duration) -> Self {
        Self {
            phase,
            kind: ErrorKind::PhaseTimeout,
            reason: format!("{phase} timed out after {timeout:?}"),
            timeout: Some(timeout),
        }
    }

    fn cancelled(phase: Phase) -> Self {
        Self {
            phase,
            kind: ErrorKind::PhaseTimeout,
            reason: format!("{phase} cancelled"),
            timeout: None,
        }
    }

    fn invalid_transition(from: Phase, to: Phase) -> Self {
        Self {
            phase: from,
            kind: ErrorKind::InvalidTransaction,
            reason: format!("invalid phase transition from {from} to {to}"),
            timeout: None,
        }
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl From<PhaseFailure> for LedgerError {
    fn from(failure: PhaseFailure) -> Self {
        match failure.kind {
            ErrorKind::VerifyRejected => LedgerError::VerifyRejected(failure.reason),
            ErrorKind::VoteRejected => LedgerError::VoteRejected(failure.reason),
            ErrorKind::CommitFailed => LedgerError::CommitFailed(failure.reason),
            ErrorKind::PostProcessFailed => LedgerError::PostProcessFailed(failure.reason),
            ErrorKind::PhaseTimeout => LedgerError::PhaseTimeout {
                phase: failure.phase,
                timeout: failure.timeout.unwrap_or_default(),
            },
            _ => LedgerError::InvalidTransaction(failure.reason),
        }
    }
}

/// Drives one contract through its phases.
pub struct ContractExecutor {
    contract: Box<dyn Contract>,
    ctx: ContractContext,
    phase: Phase,
    phase_timeout: Duration,
    cancel: CancellationToken,
}

impl ContractExecutor {
    /// Fails when the contract does not implement verify, vote and commit.
    pub fn new(
        contract: Box<dyn Contract>,
        ctx: ContractContext,
        phase_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, LedgerError> {
        let missing = contract.capabilities().missing_core();
        if !missing.is_empty() {
            let missing = missing
                .iter()
                .map(|cap| cap.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(LedgerError::InvalidTransaction(format!(
                "contract {} lacks {missing}",
                ctx.entry().tx.contract_ref()
            )));
        }
        Ok(Self {
            contract,
            ctx,
            phase: Phase::Verifying,
            phase_timeout,
            cancel,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn context(&self) -> &ContractContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ContractContext {
        &mut self.ctx
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed;
            self.ctx.enter(Phase::Failed);
        }
    }

    /// Finish without post-processing.
    pub fn complete(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Complete;
            self.ctx.enter(Phase::Complete);
        }
    }

    pub async fn verify(&mut self, signatureless: bool) -> Result<(), PhaseFailure> {
        self.begin(Phase::Verifying)?;
        let budget = Some(self.phase_timeout);
        let cancel = self.cancel.clone();
        let res = bounded(
            Phase::Verifying,
            budget,
            &cancel,
            self.contract.verify(&mut self.ctx, signatureless),
        )
        .await;
        self.finish(res, Phase::Voting)
    }

    pub async fn vote(&mut self) -> Result<(), PhaseFailure> {
        self.begin(Phase::Voting)?;
        let budget = Some(self.phase_timeout);
        let cancel = self.cancel.clone();
        let res = bounded(
            Phase::Voting,
            budget,
            &cancel,
            self.contract.vote(&mut self.ctx),
        )
        .await;
        self.finish(res, Phase::Committing)
    }

    pub async fn commit(&mut self, possible_territoriality: bool) -> Result<Value, PhaseFailure> {
        self.begin(Phase::Committing)?;
        let budget = Some(self.phase_timeout);
        let cancel = self.cancel.clone();
        let res = bounded(
            Phase::Committing,
            budget,
            &cancel,
            self.contract.commit(&mut self.ctx, possible_territoriality),
        )
        .await;
        self.finish(res, Phase::PostProcessing)
    }

    /// Runs without a time budget. A contract without the post-process
    /// capability completes with no payload.
    pub async fn post_process(
        &mut self,
        territoriality: bool,
        who: &str,
    ) -> Result<Option<Value>, PhaseFailure> {
        self.begin(Phase::PostProcessing)?;
        if !self.contract.capabilities().contains(Capability::PostProcess) {
            self.complete();
            return Ok(None);
        }
        let cancel = self.cancel.clone();
        let res = bounded(
            Phase::PostProcessing,
            None,
            &cancel,
            self.contract.post_process(&mut self.ctx, territoriality, who),
        )
        .await;
        self.finish(res, Phase::Complete)
    }

    fn begin(&mut self, expected: Phase) -> Result<(), PhaseFailure> {
        if self.phase != expected {
            return Err(PhaseFailure::invalid_transition(self.phase, expected));
        }
        self.ctx.enter(expected);
        Ok(())
    }

    fn finish<T>(&mut self, res: Result<T, PhaseFailure>, next: Phase) -> Result<T, PhaseFailure> {
        match res {
            Ok(value) => {
                self.phase = next;
                self.ctx.enter(next);
                Ok(value)
            }
            Err(failure) => {
                self.fail();
                Err(failure)
            }
        }
    }
}

async fn bounded<T, F>(
    phase: Phase,
    budget: Option<Duration>,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, PhaseFailure>
where
    F: Future<Output = PhaseResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(PhaseFailure::cancelled(phase));
    }
    let res = match budget {
        Some(budget) => tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PhaseFailure::cancelled(phase)),
            res = time::timeout(budget, fut) => match res {
                Ok(res) => res,
                Err(_) => return Err(PhaseFailure::timed_out(phase, budget)),
            },
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PhaseFailure::cancelled(phase)),
            res = fut => res,
        },
    };
    res.map_err(|rejection| PhaseFailure::rejected(phase, rejection.reason))
}
