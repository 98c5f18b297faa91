use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::consensus::{CapabilitySet, Contract, ContractContext, PhaseResult, Rejection, StreamId};

pub const FUND_EXISTS: &str = "Fund Symbol Exists";
pub const INSUFFICIENT_BALANCE: &str = "Fund Symbol doesn't exist or not enough balance";
pub const UNKNOWN_ENTRY: &str = "Unknown entry";
const INVALID_REQUEST: &str = "Invalid fund request";

/// Balances per symbol, kept in each stream's `funds` object.
///
/// `add` (one output `{symbol, amount}`) mints a new symbol on the output;
/// `transfer` (one input `{symbol, amount}`, one output) moves an amount
/// from the input to the output.
pub struct Fund;

#[derive(Debug, Deserialize)]
struct Movement {
    symbol: String,
    amount: u64,
}

enum Request {
    Add {
        target: StreamId,
        movement: Movement,
    },
    Transfer {
        from: StreamId,
        to: StreamId,
        movement: Movement,
    },
}

fn parse(ctx: &ContractContext) -> PhaseResult<Request> {
    let tx = &ctx.entry().tx;
    let movement = |value: &Value| {
        serde_json::from_value::<Movement>(value.clone())
            .ok()
            .filter(|m| !m.symbol.is_empty())
            .ok_or_else(|| Rejection::new(INVALID_REQUEST))
    };
    match tx.entry.as_deref() {
        Some("add") => {
            let (target, value) = match (tx.inputs.len(), tx.outputs.iter().next()) {
                (0, Some(output)) if tx.outputs.len() == 1 => output,
                _ => return Err(Rejection::new(INVALID_REQUEST)),
            };
            Ok(Request::Add {
                target: target.clone(),
                movement: movement(value)?,
            })
        }
        Some("transfer") => {
            let (Some((from, value)), Some((to, _))) = (tx.inputs.iter().next(), tx.outputs.iter().next())
            else {
                return Err(Rejection::new(INVALID_REQUEST));
            };
            if tx.inputs.len() != 1 || tx.outputs.len() != 1 || from == to {
                return Err(Rejection::new(INVALID_REQUEST));
            }
            Ok(Request::Transfer {
                from: from.clone(),
                to: to.clone(),
                movement: movement(value)?,
            })
        }
        _ => Err(Rejection::new(UNKNOWN_ENTRY)),
    }
}

fn balance(state: &Value, symbol: &str) -> Option<u64> {
    state.get("funds")?.get(symbol)?.as_u64()
}

fn with_balance(state: &Value, symbol: &str, amount: u64) -> Value {
    let mut state = match state {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let funds = state
        .entry("funds")
        .or_insert_with(|| Value::Object(Map::new()));
    if !funds.is_object() {
        *funds = Value::Object(Map::new());
    }
    if let Value::Object(funds) = funds {
        funds.insert(symbol.to_string(), json!(amount));
    }
    Value::Object(state)
}

#[async_trait]
impl Contract for Fund {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::core()
    }

    async fn verify(&mut self, ctx: &mut ContractContext, _signatureless: bool) -> PhaseResult<()> {
        parse(ctx).map(|_| ())
    }

    async fn vote(&mut self, ctx: &mut ContractContext) -> PhaseResult<()> {
        match parse(ctx)? {
            Request::Add { target, movement } => {
                let stream = ctx.stream(&target)?;
                if balance(stream.get_state(), &movement.symbol).is_some() {
                    return Err(Rejection::new(FUND_EXISTS));
                }
                Ok(())
            }
            Request::Transfer { from, to, movement } => {
                ctx.stream(&to)?;
                let available = balance(ctx.stream(&from)?.get_state(), &movement.symbol);
                match available {
                    Some(available) if available >= movement.amount => Ok(()),
                    _ => Err(Rejection::new(INSUFFICIENT_BALANCE)),
                }
            }
        }
    }

    async fn commit(&mut self, ctx: &mut ContractContext, _possible: bool) -> PhaseResult<Value> {
        match parse(ctx)? {
            Request::Add { target, movement } => {
                let stream = ctx.stream_mut(&target)?;
                let state = with_balance(stream.get_state(), &movement.symbol, movement.amount);
                stream.set_state(state)?;
                Ok(json!({ "symbol": movement.symbol, "balance": movement.amount }))
            }
            Request::Transfer { from, to, movement } => {
                let symbol = movement.symbol.as_str();
                let from_state = ctx.stream(&from)?.get_state().clone();
                let to_state = ctx.stream(&to)?.get_state().clone();
                let remaining = balance(&from_state, symbol)
                    .and_then(|b| b.checked_sub(movement.amount))
                    .ok_or_else(|| Rejection::new(INSUFFICIENT_BALANCE))?;
                let received = balance(&to_state, symbol)
                    .unwrap_or(0)
                    .checked_add(movement.amount)
                    .ok_or_else(|| Rejection::new("balance overflow"))?;

                ctx.stream_mut(&from)?
                    .set_state(with_balance(&from_state, symbol, remaining))?;
                ctx.stream_mut(&to)?
                    .set_state(with_balance(&to_state, symbol, received))?;
                Ok(json!({
                    "symbol": symbol,
                    "amount": movement.amount,
                    "from": remaining,
                    "to": received,
                }))
            }
        }
    }
}
