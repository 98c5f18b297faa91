//! Frames exchanged between ledger nodes and their clients.
//!
//! Each frame is a length-delimited JSON document. Peers and clients share
//! one protocol: a peer knock is just another request.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use ledger_consensus::consensus::{
    EngineInfo, Knock, LedgerResponse, NodeResponse, StreamView, TxPacket, TxRecord,
};

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum WireRequest {
    Submit(TxPacket),
    Knock(Knock),
    Transaction(String),
    Stream(String),
    Info,
}

impl WireRequest {
    pub fn op(&self) -> &'static str {
        match self {
            WireRequest::Submit(_) => "submit",
            WireRequest::Knock(_) => "knock",
            WireRequest::Transaction(_) => "transaction",
            WireRequest::Stream(_) => "stream",
            WireRequest::Info => "info",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", content = "result", rename_all = "snake_case")]
pub enum WireResponse {
    Submit(LedgerResponse),
    Knock(NodeResponse),
    Transaction(Option<TxRecord>),
    Stream(Option<StreamView>),
    Info(EngineInfo),
    Error(String),
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn encode<T: Serialize>(msg: &T) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(frame)?)
}
