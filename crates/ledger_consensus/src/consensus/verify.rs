//! Signature checks performed before a contract's own verify.

use super::contract::Rejection;
use super::stream::ActivityStream;
use super::types::TxEntry;

pub const SIGNATURES_NOT_VERIFIED: &str = "Signature(s) not verified";
pub const CONTRACT_LOCKED: &str = "Stream contract locked";

/// Cryptographic verification, supplied by the node.
pub trait SignatureVerifier: Send + Sync + 'static {
    /// Check `signature` over `payload` against a stream's registered key.
    fn verify(&self, public_key: &str, key_type: &str, payload: &[u8], signature: &str) -> bool;

    /// Check a self-signed transaction, whose inputs carry their own keys.
    fn verify_self_signed(&self, entry: &TxEntry) -> bool;
}

/// Every input stream of a regular transaction must be signed by its
/// authority; self-signed transactions are handed to the verifier whole.
pub fn check_signatures<'a, I>(
    verifier: &dyn SignatureVerifier,
    entry: &TxEntry,
    streams: I,
) -> Result<(), Rejection>
where
    I: IntoIterator<Item = &'a ActivityStream>,
{
    if entry.selfsign {
        return if verifier.verify_self_signed(entry) {
            Ok(())
        } else {
            Err(Rejection::new(SIGNATURES_NOT_VERIFIED))
        };
    }

    let payload = entry.signing_payload();
    let streams = streams
        .into_iter()
        .map(|s| (s.id(), s))
        .collect::<std::collections::HashMap<_, _>>();
    for id in entry.tx.inputs.keys() {
        let verified = match (streams.get(id.as_str()), entry.sigs.get(id)) {
            (Some(stream), Some(sig)) => {
                let meta = stream.meta();
                match (&meta.public_key, &meta.key_type) {
                    (Some(key), Some(key_type)) => verifier.verify(key, key_type, &payload, sig),
                    (Some(key), None) => verifier.verify(key, "ed25519", &payload, sig),
                    _ => false,
                }
            }
            _ => false,
        };
        if !verified {
            tracing::debug!(umid = %entry.umid, stream = %id, "input signature rejected");
            return Err(Rejection::new(SIGNATURES_NOT_VERIFIED));
        }
    }
    Ok(())
}

/// Streams bound to a contract allowlist refuse other contracts.
pub fn check_contract_lock<'a, I>(entry: &TxEntry, streams: I) -> Result<(), Rejection>
where
    I: IntoIterator<Item = &'a ActivityStream>,
{
    let contract = entry.tx.contract_ref();
    if streams
        .into_iter()
        .all(|stream| stream.meta().allows_contract(&contract))
    {
        Ok(())
    } else {
        Err(Rejection::new(CONTRACT_LOCKED))
    }
}
