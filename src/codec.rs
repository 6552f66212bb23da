/*!
 * Value codecs
 *
 * The store holds raw bytes. A codec turns them into the values callers work
 * with, at the edge of an operation; the engine itself never sees one.
 */

use crate::error::StoreError;
use bytes::Bytes;

/// Encode and decode values at the wire boundary
pub trait ValueCodec: Send + Sync {
    type Value;

    fn encode(&self, value: &Self::Value) -> Bytes;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, StoreError>;
}

/// UTF-8 text values
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl ValueCodec for Utf8Codec {
    type Value = String;

    fn encode(&self, value: &String) -> Bytes {
        Bytes::copy_from_slice(value.as_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, StoreError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| StoreError::Conversion(format!("value is not valid UTF-8: {}", e)))
    }
}

/// Raw byte values
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl ValueCodec for BytesCodec {
    type Value = Bytes;

    fn encode(&self, value: &Bytes) -> Bytes {
        value.clone()
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, StoreError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_rejects_invalid_bytes() {
        let err = Utf8Codec.decode(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, StoreError::Conversion(_)));
        assert_eq!(Utf8Codec.decode("größe".as_bytes()).unwrap(), "größe");
    }

    #[test]
    fn test_bytes_codec_is_identity() {
        let raw = Bytes::from_static(&[0, 159, 146, 150]);
        assert_eq!(BytesCodec.encode(&raw), raw);
        assert_eq!(BytesCodec.decode(&raw).unwrap(), raw);
    }
}
