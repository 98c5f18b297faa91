//! Contracts of the `default` namespace.
//!
//! `onboard` registers identities, `fund` mints and transfers balances and
//! `namespace` lets an identity claim a namespace for its own contracts.

mod fund;
mod namespace;
mod onboard;

pub use fund::{Fund, FUND_EXISTS, INSUFFICIENT_BALANCE, UNKNOWN_ENTRY};
pub use namespace::{namespace_claim_id, Namespace, CLAIM_NOT_REFERENCED, NAMESPACE_RESERVED};
pub use onboard::{Onboard, NOT_SIGNATURELESS, PUBLIC_KEY_MISSING};

use crate::consensus::ContractRegistry;

pub const DEFAULT_NAMESPACE: &str = "default";

pub fn register_builtin(registry: &mut ContractRegistry) {
    registry.register(DEFAULT_NAMESPACE, "onboard", || Box::new(Onboard));
    registry.register(DEFAULT_NAMESPACE, "fund", || Box::new(Fund));
    registry.register(DEFAULT_NAMESPACE, "namespace", || Box::new(Namespace));
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use serde_json::Value;

    use crate::consensus::{
        ActivityStream, CapabilitySet, ContractContext, Document, Phase, TxEntry, TxPacket,
    };

    /// A context for `packet` holding the given `(id, meta, state)` streams.
    pub fn context(
        packet: TxPacket,
        caps: CapabilitySet,
        streams: &[(&str, Value, Value)],
    ) -> ContractContext {
        let entry = TxEntry::admit(packet, "node-a", false).unwrap();
        let mut ctx = ContractContext::new(Arc::new(entry), "node-a".into(), caps);
        for (id, meta, state) in streams {
            let stream = ActivityStream::from_documents(
                id.to_string(),
                Some(Document::new(*id, meta.clone()).with_rev(Some("1-m".into()))),
                Some(Document::new(format!("{id}:stream"), state.clone()).with_rev(Some("1-s".into()))),
                None,
            )
            .unwrap()
            .unwrap();
            ctx.insert_stream(stream);
        }
        ctx
    }

    pub fn enter(ctx: &mut ContractContext, phase: Phase) {
        ctx.enter(phase);
    }
}
