//! Ledger node runtime.
//!
//! Wires the consensus engine from `ledger_consensus` to fjall persistence,
//! ed25519 signature checks and a length-delimited JSON protocol over TCP.
//! The same listener serves client submissions and peer knocks.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ledger_consensus::consensus::{
    Config, EngineServices, LedgerEngine, NodeRef, QuorumPolicy,
};

pub mod client;
pub mod identity;
pub mod server;
pub mod store;
pub mod transport;
pub mod verifier;
pub mod wire;

pub use client::LedgerClient;
pub use identity::{IdentityError, NodeIdentity};
pub use store::FjallStore;
pub use transport::TcpTransport;
pub use verifier::Ed25519Verifier;

/// CLI options for running a node.
#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    #[arg(long, env = "LEDGER_NODE_REF")]
    pub node_ref: NodeRef,

    #[arg(long, env = "LEDGER_LISTEN")]
    pub listen: SocketAddr,

    /// Comma-separated list like: `node-a@127.0.0.1:7001,node-b@127.0.0.1:7002`.
    /// An entry for this node is ignored.
    #[arg(long, env = "LEDGER_PEERS", default_value = "")]
    pub peers: String,

    #[arg(long, env = "LEDGER_DATA_DIR")]
    pub data_dir: PathBuf,

    /// `majority` or `all`.
    #[arg(long, env = "LEDGER_QUORUM", default_value = "majority")]
    pub quorum: QuorumPolicy,

    /// Grace period before a failed lock batch is released (ms).
    #[arg(long, env = "LEDGER_LOCK_GRACE_MS", default_value_t = 100)]
    pub lock_grace_ms: u64,

    /// Budget for each of verify, vote and commit (ms).
    #[arg(long, env = "LEDGER_PHASE_TIMEOUT_MS", default_value_t = 10_000)]
    pub phase_timeout_ms: u64,

    /// Timeout for one knock round trip (ms).
    #[arg(long, env = "LEDGER_RPC_TIMEOUT_MS", default_value_t = 5_000)]
    pub rpc_timeout_ms: u64,

    /// How long a participant holds its streams waiting for the entry node (ms).
    #[arg(long, env = "LEDGER_PARTICIPANT_TIMEOUT_MS", default_value_t = 30_000)]
    pub participant_timeout_ms: u64,

    /// Transactions slower than this are logged with per-phase timings (ms).
    #[arg(long, env = "LEDGER_SLOW_TX_MS", default_value_t = 250)]
    pub slow_tx_ms: u64,

    /// Fsync every store write before acknowledging it.
    #[arg(long, env = "LEDGER_DURABLE", default_value_t = false)]
    pub durable: bool,
}

impl NodeArgs {
    pub fn to_config(&self, peers: &BTreeMap<NodeRef, SocketAddr>) -> Config {
        let mut config = Config::new(self.node_ref.clone(), peers.keys().cloned().collect());
        config.quorum = self.quorum;
        // Clamp timeouts to at least 1ms to avoid zero-duration timeouts.
        config.lock_grace = Duration::from_millis(self.lock_grace_ms);
        config.phase_timeout = Duration::from_millis(self.phase_timeout_ms.max(1));
        config.rpc_timeout = Duration::from_millis(self.rpc_timeout_ms.max(1));
        config.participant_timeout = Duration::from_millis(self.participant_timeout_ms.max(1));
        config.slow_tx_threshold = Duration::from_millis(self.slow_tx_ms);
        config
    }
}

/// Parse a comma-separated `ref@host:port` peer list, dropping `own`.
pub fn parse_peers(input: &str, own: &str) -> anyhow::Result<BTreeMap<NodeRef, SocketAddr>> {
    let mut out = BTreeMap::new();
    for part in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (node, addr) = part
            .split_once('@')
            .with_context(|| format!("invalid peer entry (expected ref@host:port): {part}"))?;
        let node = node.trim();
        anyhow::ensure!(!node.is_empty(), "empty peer ref in {part}");
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .with_context(|| format!("invalid peer addr in {part}"))?;
        if node != own && out.insert(node.to_string(), addr).is_some() {
            anyhow::bail!("duplicate peer {node}");
        }
    }
    Ok(out)
}

/// Run a node until ctrl-c.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Open storage, load the node identity, start the engine and serve until
/// `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let (identity, generated) = identity::NodeIdentity::load_or_generate(
        args.data_dir.join(identity::IDENTITY_FILE),
    )
    .context("load node identity")?;
    tracing::info!(
        node_ref = %args.node_ref,
        public_key = %identity.public_key_hex(),
        generated,
        "node identity loaded"
    );

    let peers = parse_peers(&args.peers, &args.node_ref)?;
    let config = Arc::new(args.to_config(&peers));
    let store = FjallStore::open(args.data_dir.join("store"), args.durable)?;
    let peer_addrs = peers.into_iter().collect::<Vec<_>>();
    let transport = Arc::new(TcpTransport::new(&peer_addrs, config.rpc_timeout));
    let engine = LedgerEngine::new(
        Arc::clone(&config),
        EngineServices::new(store, transport, Arc::new(Ed25519Verifier)),
    );

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    tracing::info!(
        node_ref = %config.node_ref,
        listen = %args.listen,
        peers = config.peers.len(),
        quorum = %config.quorum,
        "ledger node listening"
    );

    let cancel = CancellationToken::new();
    let serve = tokio::spawn(server::run(listener, Arc::clone(&engine), cancel.clone()));

    let result = tokio::select! {
        res = shutdown => res.context("wait for shutdown signal"),
        res = serve => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.context("ledger server failed")),
            Err(err) => Err(anyhow::anyhow!("ledger server task failed: {err}")),
        },
    };

    tracing::info!(node_ref = %config.node_ref, "ledger node shutting down");
    cancel.cancel();
    engine.shutdown();
    result
}

/// Minimal embeddable configuration for running a ledger node inside
/// another process.
#[derive(Clone, Debug)]
pub struct EmbeddedNodeConfig {
    pub node_ref: NodeRef,
    pub listen: SocketAddr,
    /// `ref@host:port` for every member, this node included.
    pub members: String,
    pub data_dir: PathBuf,
    pub quorum: QuorumPolicy,
    pub rpc_timeout: Duration,
    pub durable: bool,
    pub ready_timeout: Duration,
}

impl EmbeddedNodeConfig {
    pub fn single_node(node_ref: impl Into<NodeRef>, listen: SocketAddr, data_dir: PathBuf) -> Self {
        let node_ref = node_ref.into();
        Self {
            members: format!("{node_ref}@{listen}"),
            node_ref,
            listen,
            data_dir,
            quorum: QuorumPolicy::Majority,
            rpc_timeout: Duration::from_secs(2),
            durable: false,
            ready_timeout: Duration::from_secs(20),
        }
    }
}

pub struct EmbeddedNodeHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EmbeddedNodeHandle {
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("ledger node task join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub fn build_node_args(config: &EmbeddedNodeConfig) -> anyhow::Result<NodeArgs> {
    let quorum = match config.quorum {
        QuorumPolicy::Majority => "majority",
        QuorumPolicy::All => "all",
    };
    let mut argv = vec![
        "ledger-node".to_string(),
        "--node-ref".to_string(),
        config.node_ref.clone(),
        "--listen".to_string(),
        config.listen.to_string(),
        "--peers".to_string(),
        config.members.clone(),
        "--data-dir".to_string(),
        config.data_dir.display().to_string(),
        "--quorum".to_string(),
        quorum.to_string(),
        "--rpc-timeout-ms".to_string(),
        config.rpc_timeout.as_millis().max(1).to_string(),
    ];
    if config.durable {
        argv.push("--durable".to_string());
    }

    NodeArgs::try_parse_from(argv).map_err(|err| anyhow::anyhow!(err.to_string()))
}

pub async fn start_embedded_node(config: EmbeddedNodeConfig) -> anyhow::Result<EmbeddedNodeHandle> {
    let args = build_node_args(&config)?;
    let wait_timeout = config.ready_timeout.max(Duration::from_secs(1));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        run_node_with_shutdown(args, async move {
            let _ = shutdown_rx.await;
            Ok::<(), std::io::Error>(())
        })
        .await
    });

    wait_for_listener(config.listen, wait_timeout, &task).await?;

    Ok(EmbeddedNodeHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn wait_for_listener(
    addr: SocketAddr,
    timeout: Duration,
    task: &tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if task.is_finished() {
            anyhow::bail!("embedded ledger node exited before its listener became ready");
        }
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for ledger node listener on {addr}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_skip_self_and_reject_garbage() {
        let peers = parse_peers(
            "node-a@127.0.0.1:7001, node-b@127.0.0.1:7002,,node-c@127.0.0.1:7003",
            "node-a",
        )
        .unwrap();
        assert_eq!(
            peers.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["node-b", "node-c"]
        );
        assert!(parse_peers("", "node-a").unwrap().is_empty());
        assert!(parse_peers("node-b", "node-a").is_err());
        assert!(parse_peers("node-b@nowhere", "node-a").is_err());
        assert!(parse_peers("node-b@127.0.0.1:1,node-b@127.0.0.1:2", "node-a").is_err());
    }

    #[test]
    fn args_map_to_config() {
        let config = EmbeddedNodeConfig {
            node_ref: "node-a".into(),
            listen: "127.0.0.1:7001".parse().unwrap(),
            members: "node-a@127.0.0.1:7001,node-b@127.0.0.1:7002".into(),
            data_dir: PathBuf::from("/tmp/ledger"),
            quorum: QuorumPolicy::All,
            rpc_timeout: Duration::from_millis(750),
            durable: true,
            ready_timeout: Duration::from_secs(1),
        };
        let args = build_node_args(&config).unwrap();
        let peers = parse_peers(&args.peers, &args.node_ref).unwrap();
        let config = args.to_config(&peers);
        assert_eq!(config.peers, vec!["node-b".to_string()]);
        assert_eq!(config.quorum, QuorumPolicy::All);
        assert_eq!(config.rpc_timeout, Duration::from_millis(750));
        assert_eq!(config.lock_grace, Duration::from_millis(100));
        assert_eq!(config.phase_timeout, Duration::from_secs(10));
        assert!(args.durable);
    }
}
