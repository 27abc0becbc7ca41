//! Template-driven state reads.
//!
//! Fixed-schema templates are read all-or-nothing; dynamic templates degrade
//! field by field, recording `null` for any view call that fails.

use crate::metrics::SyncMetrics;
use crate::onchain::source::{ChainError, ChainEventSource};
use crate::templates::{ReadMode, StateMap, TemplateId, ViewFunction};

use alloy::dyn_abi::DynSolValue;
use alloy::hex;
use alloy::primitives::Address;
use futures::future::{join_all, try_join_all};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct StateReader {
    source: Arc<dyn ChainEventSource>,
    metrics: Arc<SyncMetrics>,
}

impl StateReader {
    pub fn new(source: Arc<dyn ChainEventSource>, metrics: Arc<SyncMetrics>) -> Self {
        Self { source, metrics }
    }

    pub async fn read_state(
        &self,
        address: Address,
        template: TemplateId,
    ) -> Result<StateMap, ChainError> {
        let descriptor = template.descriptor();
        match descriptor.read_mode {
            ReadMode::Fixed => self.read_fixed(address, descriptor.fields).await,
            ReadMode::Dynamic => Ok(self.read_dynamic(address, descriptor.fields).await),
        }
    }

    async fn read_fixed(
        &self,
        address: Address,
        fields: &'static [ViewFunction],
    ) -> Result<StateMap, ChainError> {
        let values = try_join_all(fields.iter().map(|f| self.source.call(address, f))).await?;
        Ok(fields
            .iter()
            .zip(values)
            .map(|(field, value)| (field.name.to_string(), encode_value(&value)))
            .collect())
    }

    async fn read_dynamic(&self, address: Address, fields: &'static [ViewFunction]) -> StateMap {
        let results = join_all(fields.iter().map(|f| self.source.call(address, f))).await;

        let mut state = StateMap::new();
        for (field, result) in fields.iter().zip(results) {
            let value = match result {
                Ok(value) => encode_value(&value),
                Err(e) => {
                    warn!(address = %address, field = field.name, error = %e, "field read failed");
                    self.metrics.record_field_failure();
                    Value::Null
                }
            };
            state.insert(field.name.to_string(), value);
        }
        state
    }
}

/// JSON encoding for decoded return values. Integers of 64 bits or more
/// become decimal strings so no precision is lost downstream.
pub fn encode_value(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Uint(n, bits) if *bits < 64 => Value::from(n.saturating_to::<u64>()),
        DynSolValue::Uint(n, _) => Value::String(n.to_string()),
        DynSolValue::Int(n, bits) if *bits < 64 => Value::from(n.as_i64()),
        DynSolValue::Int(n, _) => Value::String(n.to_string()),
        DynSolValue::Address(a) => Value::String(a.to_string().to_lowercase()),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Bytes(b) => Value::String(hex::encode_prefixed(b)),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(hex::encode_prefixed(&word[..*size]))
        }
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(encode_value).collect())
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChain;
    use alloy::primitives::{address, I256, U256};
    use serde_json::json;

    const VAULT: Address = address!("00000000000000000000000000000000000000b1");

    #[test]
    fn test_encode_value_number_widths() {
        assert_eq!(encode_value(&DynSolValue::Uint(U256::from(7u8), 8)), json!(7));
        assert_eq!(
            encode_value(&DynSolValue::Uint(U256::from(1_000_000u64), 64)),
            json!("1000000")
        );
        assert_eq!(
            encode_value(&DynSolValue::Uint(U256::MAX, 256)),
            json!(U256::MAX.to_string())
        );
        assert_eq!(
            encode_value(&DynSolValue::Int(I256::try_from(-5i64).unwrap(), 32)),
            json!(-5)
        );
        assert_eq!(
            encode_value(&DynSolValue::Int(I256::try_from(-5i64).unwrap(), 256)),
            json!("-5")
        );
    }

    #[test]
    fn test_encode_value_other_types() {
        assert_eq!(encode_value(&DynSolValue::Bool(true)), json!(true));
        assert_eq!(
            encode_value(&DynSolValue::Address(address!("abcdefabcdefabcdefabcdefabcdefabcdefabcd"))),
            json!("0xabcdefabcdefabcdefabcdefabcdefabcdefabcd")
        );
        assert_eq!(
            encode_value(&DynSolValue::Bytes(vec![0xde, 0xad])),
            json!("0xdead")
        );
        assert_eq!(
            encode_value(&DynSolValue::String("ipfs://proof".into())),
            json!("ipfs://proof")
        );
    }

    #[tokio::test]
    async fn test_dynamic_read_isolates_failed_field() {
        let chain = Arc::new(FakeChain::new());
        let recipient = address!("2222222222222222222222222222222222222222");
        chain.set_value(VAULT, "recipient", DynSolValue::Address(recipient));
        chain.set_value(VAULT, "rentAmount", DynSolValue::Uint(U256::from(1_500_000_000u64), 256));
        chain.set_value(VAULT, "dueDate", DynSolValue::Uint(U256::from(1_735_689_600u64), 256));
        chain.set_error(VAULT, "totalDeposited", ChainError::Revert("execution reverted".into()));
        chain.set_value(VAULT, "withdrawn", DynSolValue::Bool(false));

        let metrics = Arc::new(SyncMetrics::default());
        let reader = StateReader::new(chain, metrics.clone());
        let state = reader.read_state(VAULT, TemplateId::RentVault).await.unwrap();

        assert_eq!(state.len(), 5);
        assert_eq!(state["recipient"], json!("0x2222222222222222222222222222222222222222"));
        assert_eq!(state["rentAmount"], json!("1500000000"));
        assert_eq!(state["dueDate"], json!("1735689600"));
        assert_eq!(state["totalDeposited"], Value::Null);
        assert_eq!(state["withdrawn"], json!(false));
        assert_eq!(metrics.snapshot().field_read_failures, 1);
    }

    #[tokio::test]
    async fn test_dynamic_read_never_fails_even_when_every_field_does() {
        let chain = Arc::new(FakeChain::new());
        let reader = StateReader::new(chain, Arc::new(SyncMetrics::default()));
        let state = reader
            .read_state(VAULT, TemplateId::StableAllowanceTreasury)
            .await
            .unwrap();
        assert_eq!(state.len(), 8);
        assert!(state.values().all(Value::is_null));
    }

    #[tokio::test]
    async fn test_fixed_read_fails_fast() {
        let rental = address!("00000000000000000000000000000000000000c1");
        let chain = Arc::new(FakeChain::new());
        chain.seed_legacy_rental(rental, 1);
        chain.set_error(rental, "terminationNoticeTime", ChainError::Network("timeout".into()));

        let reader = StateReader::new(chain, Arc::new(SyncMetrics::default()));
        let err = reader
            .read_state(rental, TemplateId::LegacyRental)
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::Network("timeout".into()));
    }

    #[tokio::test]
    async fn test_fixed_read_shape() {
        let rental = address!("00000000000000000000000000000000000000c1");
        let chain = Arc::new(FakeChain::new());
        chain.seed_legacy_rental(rental, 3);

        let reader = StateReader::new(chain, Arc::new(SyncMetrics::default()));
        let state = reader.read_state(rental, TemplateId::LegacyRental).await.unwrap();
        assert_eq!(state.len(), 7);
        assert_eq!(state["state"], json!(3));
        assert_eq!(state["totalMonths"], json!(12));
        assert_eq!(state["monthlyAmount"], json!("2000000000"));
    }
}
