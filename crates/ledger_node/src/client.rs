//! Client for the ledger wire protocol, used by peers, tests and the
//! workload.

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use ledger_consensus::consensus::{
    EngineInfo, Knock, LedgerResponse, NodeResponse, StreamView, TxPacket, TxRecord,
};

use crate::wire::{self, WireRequest, WireResponse};

type Conn = Framed<TcpStream, LengthDelimitedCodec>;

/// Idle connections kept per client.
const MAX_IDLE: usize = 16;

/// Connections are pooled; each carries one request at a time, so
/// concurrent calls open more connections.
pub struct LedgerClient {
    addr: SocketAddr,
    timeout: Duration,
    idle: Mutex<Vec<Conn>>,
}

impl LedgerClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn pooled(&self) -> Option<Conn> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    async fn connect(&self) -> anyhow::Result<Conn> {
        let socket = time::timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .with_context(|| format!("connect to {} timed out", self.addr))?
            .with_context(|| format!("connect to {}", self.addr))?;
        socket.set_nodelay(true)?;
        Ok(Framed::new(socket, wire::codec()))
    }

    async fn exchange(&self, conn: &mut Conn, req: &WireRequest) -> anyhow::Result<WireResponse> {
        let exchange = async {
            conn.send(wire::encode(req)?).await?;
            let frame = conn
                .next()
                .await
                .context("connection closed before response")??;
            let resp = wire::decode::<WireResponse>(&frame)?;
            Ok::<_, anyhow::Error>(resp)
        };
        time::timeout(self.timeout, exchange)
            .await
            .with_context(|| format!("{} request to {} timed out", req.op(), self.addr))?
    }

    async fn call(&self, req: &WireRequest) -> anyhow::Result<WireResponse> {
        // A pooled connection may have been closed by a restarted peer; such
        // a failure is retried once on a fresh connection.
        let (conn, resp) = match self.pooled() {
            Some(mut conn) => match self.exchange(&mut conn, req).await {
                Ok(resp) => (conn, resp),
                Err(err) => {
                    tracing::debug!(addr = %self.addr, error = ?err, "pooled connection failed, reconnecting");
                    let mut conn = self.connect().await?;
                    let resp = self.exchange(&mut conn, req).await?;
                    (conn, resp)
                }
            },
            None => {
                let mut conn = self.connect().await?;
                let resp = self.exchange(&mut conn, req).await?;
                (conn, resp)
            }
        };

        {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < MAX_IDLE {
                idle.push(conn);
            }
        }
        match resp {
            WireResponse::Error(reason) => anyhow::bail!("{} failed on {}: {reason}", req.op(), self.addr),
            resp => Ok(resp),
        }
    }

    pub async fn submit(&self, packet: TxPacket) -> anyhow::Result<LedgerResponse> {
        match self.call(&WireRequest::Submit(packet)).await? {
            WireResponse::Submit(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn knock(&self, knock: Knock) -> anyhow::Result<NodeResponse> {
        match self.call(&WireRequest::Knock(knock)).await? {
            WireResponse::Knock(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn transaction(&self, umid: &str) -> anyhow::Result<Option<TxRecord>> {
        match self.call(&WireRequest::Transaction(umid.to_string())).await? {
            WireResponse::Transaction(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stream(&self, id: &str) -> anyhow::Result<Option<StreamView>> {
        match self.call(&WireRequest::Stream(id.to_string())).await? {
            WireResponse::Stream(view) => Ok(view),
            other => Err(unexpected(other)),
        }
    }

    pub async fn info(&self) -> anyhow::Result<EngineInfo> {
        match self.call(&WireRequest::Info).await? {
            WireResponse::Info(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(resp: WireResponse) -> anyhow::Error {
    anyhow::anyhow!("unexpected response {resp:?}")
}
