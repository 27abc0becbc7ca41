//! Topic, selector and log-payload helpers.
//!
//! Creation events carry their addresses in indexed topics; only the legacy
//! `RentalDeployed` event has a non-indexed payload (tenant, suggested name).

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{Address, B256};

/// Compute keccak256 hash of a byte slice.
pub fn keccak256(data: &[u8]) -> B256 {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}

/// topic0 for an event signature such as `RentVaultCreated(address,address,address)`.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

/// 4-byte function selector for a signature such as `rentAmount()`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// An indexed address occupies the low 20 bytes of its topic.
pub fn topic_address(topic: &B256) -> Address {
    Address::from_slice(&topic.0[12..])
}

/// Decode the non-indexed `(address tenant, string suggestedName)` payload
/// of `RentalDeployed`.
pub fn decode_rental_payload(data: &[u8]) -> Option<(Address, String)> {
    let ty = DynSolType::Tuple(vec![DynSolType::Address, DynSolType::String]);
    match ty.abi_decode_params(data).ok()? {
        DynSolValue::Tuple(values) => match values.as_slice() {
            [DynSolValue::Address(tenant), DynSolValue::String(name)] => {
                Some((*tenant, name.clone()))
            }
            _ => None,
        },
        _ => None,
    }
}
