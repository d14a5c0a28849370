use std::any::type_name;

use anyhow::anyhow;
use data_model::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// JSON codec for every value kept in the ledger.
pub struct JsonEncoder;

impl JsonEncoder {
    pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            Error::Internal(anyhow!(
                "error encoding {} for {}: {}",
                type_name::<T>(),
                key,
                e
            ))
        })
    }

    /// Decode the value stored under `key`. A corrupt value is reported
    /// with its key so the record can be located.
    pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::Internal(anyhow!(
                "corrupt {} stored under {}: {}",
                type_name::<T>(),
                key,
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_value_names_key() {
        let err = JsonEncoder::decode::<u64>("db_version", b"{").unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("db_version"));

        let bytes = JsonEncoder::encode("sequence", &7u64).unwrap();
        assert_eq!(JsonEncoder::decode::<u64>("sequence", &bytes).unwrap(), 7);
    }
}
