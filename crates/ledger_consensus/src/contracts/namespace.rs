use async_trait::async_trait;
use serde_json::{json, Value};

use crate::consensus::{
    Capability, CapabilitySet, Contract, ContractContext, PhaseResult, Rejection, Selector,
    StreamId,
};

pub const NAMESPACE_RESERVED: &str = "Namespace Reserved";
pub const CLAIM_NOT_REFERENCED: &str = "Namespace claim stream not referenced";
const INVALID_REQUEST: &str = "Invalid namespace request";

/// Claims a namespace for an identity. The single input is the identity
/// stream carrying `{namespace}`. Each namespace has exactly one claim stream
/// (`{type: "namespace", namespace, owner}`) at `namespace_claim_id`, which
/// the transaction must list as an output so competing claims lock it.
pub struct Namespace;

/// Stream id of the claim for `namespace`, the same on every node.
pub fn namespace_claim_id(namespace: &str) -> StreamId {
    let namespace = namespace.trim().to_ascii_lowercase();
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"namespace:");
    hasher.update(namespace.as_bytes());
    hasher.finalize().to_hex().to_string()
}

struct Request {
    identity: StreamId,
    namespace: String,
    claim: StreamId,
}

fn request(ctx: &ContractContext) -> PhaseResult<Request> {
    let tx = &ctx.entry().tx;
    let (identity, value) = match tx.inputs.iter().next() {
        Some(input) if tx.inputs.len() == 1 => input,
        _ => return Err(Rejection::new(INVALID_REQUEST)),
    };
    let namespace = value
        .get("namespace")
        .and_then(Value::as_str)
        .map(|ns| ns.trim().to_ascii_lowercase())
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Rejection::new(INVALID_REQUEST))?;
    let claim = namespace_claim_id(&namespace);
    if !tx.outputs.contains_key(&claim) {
        return Err(Rejection::new(CLAIM_NOT_REFERENCED));
    }
    Ok(Request {
        identity: identity.clone(),
        namespace,
        claim,
    })
}

/// Owners recorded for the namespace: the locked claim stream first, then
/// any other claim documents the query engine finds.
async fn owners(ctx: &ContractContext, req: &Request) -> PhaseResult<Vec<String>> {
    let mut owners = ctx
        .stream(&req.claim)
        .ok()
        .and_then(|claim| claim.get_state().get("owner"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .into_iter()
        .collect::<Vec<_>>();

    let selector = Selector::default()
        .eq("type", json!("namespace"))
        .eq("namespace", json!(req.namespace));
    let claims = ctx
        .query()?
        .find(&selector)
        .await
        .map_err(|e| Rejection::new(format!("namespace lookup failed: {e:#}")))?;
    owners.extend(
        claims
            .iter()
            .filter_map(|claim| claim.get("owner").and_then(Value::as_str))
            .map(str::to_string),
    );
    Ok(owners)
}

#[async_trait]
impl Contract for Namespace {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::core().with(Capability::Query)
    }

    async fn verify(&mut self, ctx: &mut ContractContext, _signatureless: bool) -> PhaseResult<()> {
        request(ctx).map(|_| ())
    }

    async fn vote(&mut self, ctx: &mut ContractContext) -> PhaseResult<()> {
        let req = request(ctx)?;
        ctx.stream(&req.identity)?;
        if req.namespace == crate::contracts::DEFAULT_NAMESPACE {
            return Err(Rejection::new(NAMESPACE_RESERVED));
        }
        if owners(ctx, &req).await?.iter().any(|owner| *owner != req.identity) {
            return Err(Rejection::new(NAMESPACE_RESERVED));
        }
        Ok(())
    }

    async fn commit(&mut self, ctx: &mut ContractContext, _possible: bool) -> PhaseResult<Value> {
        let req = request(ctx)?;
        let claim = if ctx.has_stream(&req.claim) {
            None
        } else {
            ctx.create_declared_stream(&req.claim, format!("namespace:{}", req.namespace))?
                .set_state(json!({
                    "type": "namespace",
                    "namespace": req.namespace,
                    "owner": req.identity,
                }))?;
            Some(req.claim.clone())
        };

        let stream = ctx.stream_mut(&req.identity)?;
        let mut state = stream.get_state().clone();
        if let Value::Object(map) = &mut state {
            let list = map.entry("namespaces").or_insert_with(|| json!([]));
            if !list.is_array() {
                *list = json!([]);
            }
            if let Value::Array(list) = list {
                if !list.iter().any(|ns| ns.as_str() == Some(req.namespace.as_str())) {
                    list.push(json!(req.namespace));
                }
            }
        }
        stream.set_state(state)?;
        Ok(json!({ "namespace": req.namespace, "claim": claim }))
    }
}
