use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single log entry: an opaque payload plus the offset the log assigned
/// to it. Offsets supplied by producers are ignored and overwritten at
/// append time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub offset: u64,

    #[serde(with = "crate::serde_utils::bytes_serde")]
    pub value: Bytes,
}

impl Record {
    /// Create an unstamped record. The offset is assigned on append.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            offset: 0,
            value: value.into(),
        }
    }

    /// Marshal for the store file and the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let record = Record {
            offset: 42,
            value: Bytes::from_static(b"hello world"),
        };
        let bytes = record.to_bytes().unwrap();
        let decoded = Record::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn new_record_is_unstamped() {
        let record = Record::new("payload");
        assert_eq!(record.offset, 0);
        assert_eq!(record.value, Bytes::from_static(b"payload"));
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        // A truncated buffer cannot decode to a record.
        assert!(Record::from_bytes(&[0xff]).is_err());
    }
}
