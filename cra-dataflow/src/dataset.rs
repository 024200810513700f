use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// One keyed record. The payload is opaque to the runtime; functions in the
/// [`FunctionRegistry`](crate::registry::FunctionRegistry) interpret it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub key: u64,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(key: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }

    /// Record carrying a big-endian `i64`.
    pub fn int(key: u64, value: i64) -> Self {
        Self::new(key, value.to_be_bytes().to_vec())
    }

    pub fn as_int(&self) -> Result<i64> {
        let bytes: [u8; 8] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("payload of key {} is not an i64", self.key))?;
        Ok(i64::from_be_bytes(bytes))
    }
}

/// The slice of a sharded dataset held by one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub records: Vec<Record>,
}

impl Dataset {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Concatenate in the given order.
    pub fn concat(parts: impl IntoIterator<Item = Dataset>) -> Self {
        let mut records = Vec::new();
        for part in parts {
            records.extend(part.records);
        }
        Self { records }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl FromIterator<Record> for Dataset {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}
