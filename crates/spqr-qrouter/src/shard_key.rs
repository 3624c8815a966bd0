//! Routing key encoding
//!
//! Key-range bounds are raw bytes, so a single-column routing key is the
//! raw value bytes and compares against bounds directly. Composite keys
//! concatenate components big-endian with a 1-byte length prefix each,
//! which keeps component boundaries unambiguous.

/// A sharding-column value extracted from a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    /// Numeric literal, encoded as minimal big-endian bytes
    Int(u64),
    /// String or binary literal, encoded verbatim
    Bytes(Vec<u8>),
}

impl KeyValue {
    /// Encode one component to its byte form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            KeyValue::Int(v) => {
                if *v == 0 {
                    return vec![0];
                }
                let bytes = v.to_be_bytes();
                let skip = bytes.iter().take_while(|b| **b == 0).count();
                bytes[skip..].to_vec()
            }
            KeyValue::Bytes(b) => b.clone(),
        }
    }
}

/// Encode a full routing key from components in rule-column order.
pub fn encode_shard_key(values: &[KeyValue]) -> Vec<u8> {
    if values.len() == 1 {
        return values[0].encode();
    }

    let mut key = Vec::new();
    for value in values {
        let encoded = value.encode();
        // Components longer than a length prefix can express are truncated
        // to their first 255 bytes; bound comparison stays lexicographic.
        let len = encoded.len().min(u8::MAX as usize);
        key.push(len as u8);
        key.extend_from_slice(&encoded[..len]);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_minimal_big_endian() {
        assert_eq!(KeyValue::Int(0).encode(), vec![0x00]);
        assert_eq!(KeyValue::Int(0x40).encode(), vec![0x40]);
        assert_eq!(KeyValue::Int(0x1234).encode(), vec![0x12, 0x34]);
    }

    #[test]
    fn test_single_column_is_raw() {
        let key = encode_shard_key(&[KeyValue::Int(0x40)]);
        assert_eq!(key, vec![0x40]);

        let key = encode_shard_key(&[KeyValue::Bytes(b"abc".to_vec())]);
        assert_eq!(key, b"abc".to_vec());
    }

    #[test]
    fn test_composite_length_prefixed() {
        let key = encode_shard_key(&[KeyValue::Int(0x40), KeyValue::Bytes(b"eu".to_vec())]);
        assert_eq!(key, vec![0x01, 0x40, 0x02, b'e', b'u']);
    }
}
