//! Cross-node aggregation: quorum thresholds, vote tallies, the transaction
//! summary and the territoriality tie-break.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{ErrorKind, LedgerError};
use super::types::{NodeRef, NodeResponse};

/// How many yes votes a multi-node transaction needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    #[default]
    Majority,
    All,
}

impl QuorumPolicy {
    pub fn threshold(self, total: usize) -> usize {
        let total = total.max(1);
        match self {
            QuorumPolicy::Majority => (total / 2) + 1,
            QuorumPolicy::All => total,
        }
    }
}

impl FromStr for QuorumPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "majority" => Ok(QuorumPolicy::Majority),
            "all" | "unanimous" => Ok(QuorumPolicy::All),
            other => Err(format!("unknown quorum policy `{other}`")),
        }
    }
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumPolicy::Majority => f.write_str("majority"),
            QuorumPolicy::All => f.write_str("all"),
        }
    }
}

/// An error reported by one node during a round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryError {
    pub node: NodeRef,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

/// Aggregated vote/commit counts for a transaction across all participants.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub vote: usize,
    pub commit: usize,
    pub errors: Vec<SummaryError>,
}

impl Summary {
    pub fn new(total: usize) -> Self {
        Self {
            total: total.max(1),
            ..Self::default()
        }
    }

    pub fn record_vote(&mut self) {
        self.vote = (self.vote + 1).min(self.total);
    }

    pub fn record_commit(&mut self) {
        self.commit = (self.commit + 1).min(self.total);
    }

    pub fn record_error(&mut self, node: impl Into<NodeRef>, reason: impl Into<String>) {
        self.errors.push(SummaryError {
            node: node.into(),
            reason: reason.into(),
            kind: None,
        });
    }

    /// Record a peer that could not be reached or never answered.
    pub fn record_unreachable(&mut self, peer: impl Into<NodeRef>, reason: impl Into<String>) {
        let peer = peer.into();
        let err = LedgerError::PeerUnreachable {
            peer: peer.clone(),
            reason: reason.into(),
        };
        self.errors.push(SummaryError {
            node: peer,
            reason: err.to_string(),
            kind: Some(err.kind()),
        });
    }

    pub fn unreachable(&self) -> impl Iterator<Item = &str> {
        self.errors
            .iter()
            .filter(|e| e.kind == Some(ErrorKind::PeerUnreachable))
            .map(|e| e.node.as_str())
    }

    pub fn has_error_from(&self, node: &str) -> bool {
        self.errors.iter().any(|e| e.node == node)
    }
}

/// Running count of one vote round.
///
/// `decided` reports the outcome as soon as it can no longer change: either
/// enough yes votes arrived, or too few nodes remain to reach the threshold.
#[derive(Clone, Debug)]
pub struct VoteTally {
    total: usize,
    required: usize,
    yes: usize,
    responded: usize,
}

impl VoteTally {
    pub fn new(total: usize, policy: QuorumPolicy) -> Self {
        let total = total.max(1);
        Self {
            total,
            required: policy.threshold(total),
            yes: 0,
            responded: 0,
        }
    }

    pub fn record(&mut self, yes: bool) {
        if self.responded >= self.total {
            return;
        }
        self.responded += 1;
        if yes {
            self.yes += 1;
        }
    }

    pub fn yes(&self) -> usize {
        self.yes
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn outstanding(&self) -> usize {
        self.total - self.responded
    }

    pub fn decided(&self) -> Option<bool> {
        if self.yes >= self.required {
            Some(true)
        } else if self.yes + self.outstanding() < self.required {
            Some(false)
        } else {
            None
        }
    }
}

/// Apply one peer's vote-round result to the summary and tally.
pub fn record_vote_response(
    summary: &mut Summary,
    tally: &mut VoteTally,
    peer: &str,
    response: &anyhow::Result<NodeResponse>,
) {
    match response {
        Ok(resp) if resp.vote => {
            summary.record_vote();
            tally.record(true);
        }
        Ok(resp) => {
            summary.record_error(
                peer,
                resp.error.clone().unwrap_or_else(|| "vote failed".to_string()),
            );
            tally.record(false);
        }
        Err(err) => {
            summary.record_unreachable(peer, format!("{err:#}"));
            tally.record(false);
        }
    }
}

/// Pick the node awarded territoriality: the earliest local commit completion,
/// ties broken by lexical order of node reference.
pub fn select_territoriality<'a, I>(claims: I) -> Option<NodeRef>
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    claims
        .into_iter()
        .min_by(|(a_node, a_at), (b_node, b_at)| a_at.cmp(b_at).then_with(|| a_node.cmp(b_node)))
        .map(|(node, _)| node.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds() {
        assert_eq!(QuorumPolicy::Majority.threshold(1), 1);
        assert_eq!(QuorumPolicy::Majority.threshold(3), 2);
        assert_eq!(QuorumPolicy::Majority.threshold(4), 3);
        assert_eq!(QuorumPolicy::All.threshold(4), 4);
        assert_eq!(QuorumPolicy::All.threshold(0), 1);
        assert_eq!("unanimous".parse::<QuorumPolicy>(), Ok(QuorumPolicy::All));
        assert!("most".parse::<QuorumPolicy>().is_err());
    }

    #[test]
    fn summary_counts_never_exceed_total() {
        let mut summary = Summary::new(2);
        for _ in 0..5 {
            summary.record_vote();
            summary.record_commit();
        }
        assert_eq!(summary.vote, 2);
        assert_eq!(summary.commit, 2);
    }

    #[test]
    fn tally_decides_success_early() {
        let mut tally = VoteTally::new(5, QuorumPolicy::Majority);
        tally.record(true);
        tally.record(true);
        assert_eq!(tally.decided(), None);
        tally.record(true);
        assert_eq!(tally.decided(), Some(true));
        assert_eq!(tally.outstanding(), 2);
    }

    #[test]
    fn tally_decides_failure_once_threshold_is_unreachable() {
        let mut tally = VoteTally::new(5, QuorumPolicy::Majority);
        tally.record(true);
        tally.record(false);
        tally.record(false);
        assert_eq!(tally.decided(), None);
        tally.record(false);
        assert_eq!(tally.decided(), Some(false));

        let mut all = VoteTally::new(3, QuorumPolicy::All);
        all.record(true);
        all.record(false);
        assert_eq!(all.decided(), Some(false));
    }

    #[test]
    fn tally_ignores_extra_responses() {
        let mut tally = VoteTally::new(1, QuorumPolicy::All);
        tally.record(true);
        tally.record(false);
        assert_eq!(tally.yes(), 1);
        assert_eq!(tally.outstanding(), 0);
    }

    #[test]
    fn vote_responses_feed_errors() {
        let mut summary = Summary::new(3);
        let mut tally = VoteTally::new(3, QuorumPolicy::Majority);
        record_vote_response(
            &mut summary,
            &mut tally,
            "b",
            &Ok(NodeResponse {
                vote: true,
                ..NodeResponse::now()
            }),
        );
        record_vote_response(
            &mut summary,
            &mut tally,
            "c",
            &Ok(NodeResponse::failed("Fund Symbol Exists")),
        );
        record_vote_response(
            &mut summary,
            &mut tally,
            "d",
            &Err(anyhow::anyhow!("knock timed out")),
        );
        assert_eq!(summary.vote, 1);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.errors[0].reason, "Fund Symbol Exists");
        assert_eq!(summary.errors[0].kind, None);
        assert!(summary.has_error_from("d"));
        assert_eq!(summary.unreachable().collect::<Vec<_>>(), ["d"]);
        assert_eq!(summary.errors[1].reason, "peer d unreachable: knock timed out");
    }

    #[test]
    fn error_kind_is_optional_on_the_wire() {
        let mut summary = Summary::new(2);
        summary.record_error("a", "Fund Symbol Exists");
        summary.record_unreachable("b", "vote timed out");
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json["errors"][0].get("kind").is_none());
        assert_eq!(json["errors"][1]["kind"], "peer_unreachable");

        let legacy = serde_json::json!({
            "total": 1, "vote": 0, "commit": 0,
            "errors": [{"node": "a", "reason": "x"}],
        });
        let decoded: Summary = serde_json::from_value(legacy).unwrap();
        assert_eq!(decoded.errors[0].kind, None);
    }

    #[test]
    fn territoriality_prefers_earliest_then_lexical() {
        let winner = select_territoriality([("c", 30), ("b", 10), ("a", 20)]);
        assert_eq!(winner.as_deref(), Some("b"));

        let tie = select_territoriality([("node-z", 10), ("node-a", 10), ("node-m", 10)]);
        assert_eq!(tie.as_deref(), Some("node-a"));

        // Order of arrival never matters.
        let reversed = select_territoriality([("node-m", 10), ("node-a", 10), ("node-z", 10)]);
        assert_eq!(tie, reversed);

        assert_eq!(select_territoriality(std::iter::empty::<(&str, u64)>()), None);
    }
}
