//! Transfer workload for a running ledger cluster.
//!
//! Onboards a set of accounts with real ed25519 keys, funds each of them,
//! then runs concurrent random transfers across the nodes. Every operation
//! is recorded in a JSON history. At the end the final balances are read
//! from every node: they must agree and must add up to the funded total.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time;

use ledger_consensus::consensus::{ErrorKind, LedgerResponse, TxBody, TxPacket};
use ledger_node::{LedgerClient, NodeIdentity};

const SYMBOL: &str = "usd";

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "ledger-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Comma-separated ledger endpoints, e.g. `127.0.0.1:7001,127.0.0.1:7002`
    #[arg(long)]
    nodes: String,

    /// Number of concurrent clients.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Number of accounts transfers move between.
    #[arg(long, default_value_t = 10)]
    accounts: usize,

    /// Balance minted for every account before the run.
    #[arg(long, default_value_t = 1_000)]
    initial_balance: u64,

    /// Largest single transfer.
    #[arg(long, default_value_t = 50)]
    max_amount: u64,

    /// Total runtime for the workload.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Per-request timeout (network + consensus).
    #[arg(long, default_value = "15s")]
    op_timeout: humantime::Duration,

    /// Write a JSON history to this path.
    #[arg(long, default_value = ".tmp/workload/history.json")]
    out: PathBuf,
}

/// Metadata embedded in the history file for reproducibility.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct HistoryMeta {
    nodes: Vec<String>,
    clients: usize,
    accounts: BTreeMap<String, String>,
    initial_balance: u64,
    max_amount: u64,
    duration_ms: u64,
    seed: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct History {
    meta: HistoryMeta,
    ops: Vec<OpRecord>,
    /// Final balance per account, per node.
    balances: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Single transfer captured during the run.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct OpRecord {
    client: usize,
    node: String,
    from: String,
    to: String,
    amount: u64,
    call_us: u64,
    return_us: u64,
    result: OpResult,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpResult {
    Committed { umid: String, commits: usize },
    Failed { umid: String, kind: Option<ErrorKind>, reason: String },
    Err { error: String },
}

#[derive(Clone)]
struct Account {
    label: String,
    id: String,
    key: NodeIdentity,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.accounts >= 2, "--accounts must be >= 2");
    anyhow::ensure!(args.max_amount > 0, "--max-amount must be > 0");

    let nodes = parse_nodes(&args.nodes)?;
    anyhow::ensure!(!nodes.is_empty(), "--nodes must not be empty");
    let op_timeout: Duration = args.op_timeout.into();
    let clients = nodes
        .iter()
        .map(|addr| Arc::new(LedgerClient::new(*addr, op_timeout)))
        .collect::<Vec<_>>();

    let duration: Duration = args.duration.into();
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let accounts = Arc::new(onboard(&clients[0], args.accounts).await?);
    for account in accounts.iter() {
        let body = TxBody::new("default", "fund")
            .with_entry("add")
            .output(account.id.as_str(), json!({ "symbol": SYMBOL, "amount": args.initial_balance }));
        let resp = clients[0].submit(TxPacket::new(body)).await?;
        anyhow::ensure!(resp.is_committed(), "funding {} failed: {resp:?}", account.label);
    }
    tracing::info!(
        accounts = accounts.len(),
        initial_balance = args.initial_balance,
        seed,
        "accounts funded, starting transfers"
    );

    let start = time::Instant::now();
    let deadline = start + duration;
    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let client = Arc::clone(&clients[client_id % clients.len()]);
        let accounts = Arc::clone(&accounts);
        let max_amount = args.max_amount;
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(client_id, client, accounts, max_amount, seed, start, deadline).await
        }));
    }

    let mut all_ops = Vec::new();
    for task in tasks {
        let mut ops = task.await.context("client task panicked")?;
        all_ops.append(&mut ops);
    }
    all_ops.sort_by_key(|op| (op.call_us, op.client));

    let mut balances = BTreeMap::new();
    for client in &clients {
        balances.insert(client.addr().to_string(), read_balances(client, &accounts).await?);
    }

    let history = History {
        meta: HistoryMeta {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            clients: args.clients,
            accounts: accounts
                .iter()
                .map(|a| (a.label.clone(), a.id.clone()))
                .collect(),
            initial_balance: args.initial_balance,
            max_amount: args.max_amount,
            duration_ms: duration.as_millis() as u64,
            seed,
        },
        ops: all_ops,
        balances,
    };
    write_history(&args.out, &history).context("write history")?;
    tracing::info!(path = %args.out.display(), "wrote history");

    check_conservation(&history, args.initial_balance * accounts.len() as u64)
}

/// Onboard `count` accounts in one self-signed transaction.
async fn onboard(client: &LedgerClient, count: usize) -> anyhow::Result<Vec<Account>> {
    let keys = (0..count)
        .map(|idx| (format!("acct-{idx}"), NodeIdentity::generate()))
        .collect::<Vec<_>>();
    let mut body = TxBody::new("default", "onboard");
    for (label, key) in &keys {
        body = body.input(label.as_str(), json!({ "publicKey": key.public_key_hex(), "type": "ed25519" }));
    }
    let payload = body.signing_bytes();
    let mut packet = TxPacket::new(body).self_signed();
    for (label, key) in &keys {
        packet = packet.sign(label.as_str(), key.sign_hex(&payload));
    }

    let resp = client.submit(packet).await?;
    anyhow::ensure!(resp.is_committed(), "onboarding failed: {resp:?}");
    let created = resp
        .responses
        .values()
        .next()
        .context("onboard response carries no commit output")?;
    keys.into_iter()
        .map(|(label, key)| {
            let id = created
                .get(&label)
                .and_then(Value::as_str)
                .with_context(|| format!("no stream id for {label}"))?
                .to_string();
            Ok(Account { label, id, key })
        })
        .collect()
}

/// Issue random transfers until the deadline, returning the op history.
async fn run_client(
    client_id: usize,
    client: Arc<LedgerClient>,
    accounts: Arc<Vec<Account>>,
    max_amount: u64,
    seed: u64,
    start: time::Instant,
    deadline: time::Instant,
) -> Vec<OpRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ops = Vec::new();
    let node = client.addr().to_string();

    while time::Instant::now() < deadline {
        let from = rng.gen_range(0..accounts.len());
        let mut to = rng.gen_range(0..accounts.len() - 1);
        if to >= from {
            to += 1;
        }
        let (from, to) = (&accounts[from], &accounts[to]);
        let amount = rng.gen_range(1..=max_amount);

        let call_us = start.elapsed().as_micros() as u64;
        let result = match client.submit(transfer_packet(from, to, amount)).await {
            Ok(resp) => op_result(resp),
            Err(err) => OpResult::Err {
                error: format!("{err:#}"),
            },
        };
        let return_us = start.elapsed().as_micros() as u64;
        if let OpResult::Err { error } = &result {
            tracing::warn!(client = client_id, node = %node, error = %error, "transfer request failed");
        }
        ops.push(OpRecord {
            client: client_id,
            node: node.clone(),
            from: from.label.clone(),
            to: to.label.clone(),
            amount,
            call_us,
            return_us,
            result,
        });
    }
    ops
}

fn transfer_packet(from: &Account, to: &Account, amount: u64) -> TxPacket {
    let body = TxBody::new("default", "fund")
        .with_entry("transfer")
        .input(from.id.as_str(), json!({ "symbol": SYMBOL, "amount": amount }))
        .output(to.id.as_str(), json!({}));
    let signature = from.key.sign_hex(&body.signing_bytes());
    TxPacket::new(body).sign(from.id.as_str(), signature)
}

fn op_result(resp: LedgerResponse) -> OpResult {
    if resp.is_committed() {
        return OpResult::Committed {
            umid: resp.umid,
            commits: resp.summary.commit,
        };
    }
    let reason = resp
        .error
        .clone()
        .or_else(|| resp.summary.errors.first().map(|e| e.reason.clone()))
        .unwrap_or_default();
    OpResult::Failed {
        umid: resp.umid,
        kind: resp.failure,
        reason,
    }
}

async fn read_balances(
    client: &LedgerClient,
    accounts: &[Account],
) -> anyhow::Result<BTreeMap<String, u64>> {
    let mut out = BTreeMap::new();
    for account in accounts {
        let view = client
            .stream(&account.id)
            .await?
            .with_context(|| format!("{} missing on {}", account.label, client.addr()))?;
        let balance = view
            .state
            .get("funds")
            .and_then(|funds| funds.get(SYMBOL))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        out.insert(account.label.clone(), balance);
    }
    Ok(out)
}

/// Every node must hold the funded total, and all nodes must agree.
fn check_conservation(history: &History, expected_total: u64) -> anyhow::Result<()> {
    let committed = history
        .ops
        .iter()
        .filter(|op| matches!(op.result, OpResult::Committed { .. }))
        .count();
    tracing::info!(ops = history.ops.len(), committed, "workload finished");

    let mut reference: Option<&BTreeMap<String, u64>> = None;
    for (node, balances) in &history.balances {
        let total: u64 = balances.values().sum();
        anyhow::ensure!(
            total == expected_total,
            "total on {node} is {total}, expected {expected_total}"
        );
        match reference {
            Some(reference) if reference != balances => {
                tracing::warn!(node = %node, "balances differ between nodes");
            }
            Some(_) => {}
            None => reference = Some(balances),
        }
    }
    Ok(())
}

/// Parse a comma-separated list of `host:port` addresses.
fn parse_nodes(input: &str) -> anyhow::Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for part in input.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        out.push(
            part.parse::<SocketAddr>()
                .with_context(|| format!("invalid node address {part:?} (expected host:port)"))?,
        );
    }
    Ok(out)
}

/// Serialize and write the workload history JSON.
fn write_history(path: &PathBuf, history: &History) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(history).context("serialize history")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(balances: &[(&str, &[(&str, u64)])]) -> History {
        History {
            meta: HistoryMeta {
                nodes: Vec::new(),
                clients: 1,
                accounts: BTreeMap::new(),
                initial_balance: 50,
                max_amount: 5,
                duration_ms: 0,
                seed: 1,
            },
            ops: Vec::new(),
            balances: balances
                .iter()
                .map(|(node, accounts)| {
                    let accounts = accounts.iter().map(|(a, b)| (a.to_string(), *b)).collect();
                    (node.to_string(), accounts)
                })
                .collect(),
        }
    }

    #[test]
    fn conservation_holds_per_node() {
        let ok = history(&[("n1", &[("a", 30), ("b", 70)]), ("n2", &[("a", 30), ("b", 70)])]);
        assert!(check_conservation(&ok, 100).is_ok());

        let leaked = history(&[("n1", &[("a", 30), ("b", 70)]), ("n2", &[("a", 30), ("b", 69)])]);
        assert!(check_conservation(&leaked, 100).is_err());
    }

    #[test]
    fn nodes_parse() {
        let nodes = parse_nodes("127.0.0.1:7001, 127.0.0.1:7002,").unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(parse_nodes("localhost").is_err());
    }

    #[test]
    fn failed_responses_keep_their_reason() {
        let resp: LedgerResponse = serde_json::from_value(json!({
            "$umid": "u1",
            "status": "failed",
            "failure": "vote_rejected",
            "$summary": { "total": 3, "vote": 0, "commit": 0, "errors": [{ "node": "n1", "reason": "no funds" }] },
            "$streams": { "new": [], "updated": [] },
        }))
        .unwrap();
        match op_result(resp) {
            OpResult::Failed { umid, kind, reason } => {
                assert_eq!(umid, "u1");
                assert_eq!(kind, Some(ErrorKind::VoteRejected));
                assert_eq!(reason, "no funds");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
