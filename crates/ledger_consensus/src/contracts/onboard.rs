use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::consensus::{CapabilitySet, Contract, ContractContext, PhaseResult, Rejection};

pub const NOT_SIGNATURELESS: &str = "Should be a sigsless flagged transaction";
pub const PUBLIC_KEY_MISSING: &str = "Identity public key missing";

const DEFAULT_KEY_TYPE: &str = "ed25519";

/// Creates one identity stream per input label. Inputs carry the identity's
/// own key (`publicKey`, optional `type`) and the transaction is self-signed.
pub struct Onboard;

fn public_key(input: &Value) -> Option<&str> {
    input
        .get("publicKey")
        .and_then(Value::as_str)
        .filter(|key| !key.is_empty())
}

#[async_trait]
impl Contract for Onboard {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::core()
    }

    async fn verify(&mut self, _ctx: &mut ContractContext, signatureless: bool) -> PhaseResult<()> {
        if signatureless {
            Ok(())
        } else {
            Err(Rejection::new(NOT_SIGNATURELESS))
        }
    }

    async fn vote(&mut self, ctx: &mut ContractContext) -> PhaseResult<()> {
        if ctx.entry().tx.inputs.values().all(|input| public_key(input).is_some()) {
            Ok(())
        } else {
            Err(Rejection::new(PUBLIC_KEY_MISSING))
        }
    }

    async fn commit(&mut self, ctx: &mut ContractContext, _possible: bool) -> PhaseResult<Value> {
        let inputs = ctx.entry().tx.inputs.clone();
        let created_at = ctx.entry().datetime;
        let mut created = Map::new();
        for (label, input) in &inputs {
            let key = public_key(input).ok_or_else(|| Rejection::new(PUBLIC_KEY_MISSING))?;
            let key_type = input
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_KEY_TYPE);

            let id = ctx.new_activity_stream(label.as_str())?;
            let stream = ctx.stream_mut(&id)?;
            stream.set_authority(key, key_type)?;
            stream.set_state(json!({ "type": "identity", "created": created_at }))?;
            created.insert(label.clone(), Value::String(id));
        }
        Ok(Value::Object(created))
    }
}
