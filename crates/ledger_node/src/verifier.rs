//! Ed25519 transaction signature checks.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::Value;

use ledger_consensus::consensus::{SignatureVerifier, TxEntry};

pub const ED25519: &str = "ed25519";

/// Verifies hex-encoded Ed25519 signatures against hex-encoded public keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

fn decode_key(public_key: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(public_key).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn decode_signature(signature: &str) -> Option<Signature> {
    let bytes: [u8; 64] = hex::decode(signature).ok()?.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &str, key_type: &str, payload: &[u8], signature: &str) -> bool {
        if !key_type.eq_ignore_ascii_case(ED25519) {
            tracing::debug!(key_type = %key_type, "unsupported key type");
            return false;
        }
        match (decode_key(public_key), decode_signature(signature)) {
            (Some(key), Some(sig)) => key.verify(payload, &sig).is_ok(),
            _ => false,
        }
    }

    /// Every input carries its own `publicKey` (and optional `type`) and must
    /// be signed by it.
    fn verify_self_signed(&self, entry: &TxEntry) -> bool {
        if entry.tx.inputs.is_empty() {
            return false;
        }
        let payload = entry.signing_payload();
        entry.tx.inputs.iter().all(|(label, input)| {
            let key = input.get("publicKey").and_then(Value::as_str);
            let key_type = input.get("type").and_then(Value::as_str).unwrap_or(ED25519);
            match (key, entry.sigs.get(label)) {
                (Some(key), Some(sig)) => self.verify(key, key_type, &payload, sig),
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use ledger_consensus::consensus::{TxBody, TxPacket};
    use serde_json::json;

    #[test]
    fn signatures_verify_against_their_key() {
        let alice = NodeIdentity::generate();
        let mallory = NodeIdentity::generate();
        let payload = b"payload";
        let sig = alice.sign_hex(payload);

        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&alice.public_key_hex(), ED25519, payload, &sig));
        assert!(!verifier.verify(&mallory.public_key_hex(), ED25519, payload, &sig));
        assert!(!verifier.verify(&alice.public_key_hex(), ED25519, b"other", &sig));
        assert!(!verifier.verify(&alice.public_key_hex(), "secp256k1", payload, &sig));
        assert!(!verifier.verify("zz", ED25519, payload, &sig));
    }

    #[test]
    fn self_signed_inputs_use_their_own_keys() {
        let alice = NodeIdentity::generate();
        let body = TxBody::new("default", "onboard")
            .input("alice", json!({ "publicKey": alice.public_key_hex(), "type": "ed25519" }));
        let sig = alice.sign_hex(&body.signing_bytes());

        let signed = TxPacket::new(body.clone()).self_signed().sign("alice", sig);
        let entry = TxEntry::admit(signed, "node-a", false).unwrap();
        assert!(Ed25519Verifier.verify_self_signed(&entry));

        let unsigned = TxPacket::new(body).self_signed();
        let entry = TxEntry::admit(unsigned, "node-a", false).unwrap();
        assert!(!Ed25519Verifier.verify_self_signed(&entry));
    }
}
