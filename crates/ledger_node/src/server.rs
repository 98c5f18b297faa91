//! TCP front end serving clients and peer knocks.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use ledger_consensus::consensus::LedgerEngine;

use crate::wire::{self, WireRequest, WireResponse};

/// Accept connections until `shutdown` fires. Each connection is served by
/// its own task, one request at a time.
pub async fn run(
    listener: TcpListener,
    engine: Arc<LedgerEngine>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, engine, shutdown).await {
                tracing::debug!(peer = %peer, error = ?err, "ledger connection closed");
            }
        });
    }
}

async fn handle_conn(
    socket: TcpStream,
    engine: Arc<LedgerEngine>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    let mut framed = Framed::new(socket, wire::codec());
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let resp = match wire::decode::<WireRequest>(&frame?) {
            Ok(req) => dispatch(&engine, req).await,
            Err(err) => WireResponse::Error(format!("malformed request: {err:#}")),
        };
        framed.send(wire::encode(&resp)?).await?;
    }
}

async fn dispatch(engine: &LedgerEngine, req: WireRequest) -> WireResponse {
    let op = req.op();
    let result = match req {
        WireRequest::Submit(packet) => Ok(WireResponse::Submit(engine.submit(packet).await)),
        WireRequest::Knock(knock) => Ok(WireResponse::Knock(engine.handle_knock(knock).await)),
        WireRequest::Transaction(umid) => engine.transaction(&umid).await.map(WireResponse::Transaction),
        WireRequest::Stream(id) => engine.stream(&id).await.map(WireResponse::Stream),
        WireRequest::Info => engine.info().await.map(WireResponse::Info),
    };
    result.unwrap_or_else(|err| {
        tracing::warn!(op = op, error = ?err, "request failed");
        WireResponse::Error(format!("{err:#}"))
    })
}
