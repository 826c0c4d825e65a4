//! Length-prefixed envelope for Begin/Join and callback bodies.
//!
//! ```text
//! +----------------------+--------------------+-----------------+
//! | header length (i32,  | JSON header bytes  | raw tail bytes  |
//! |  big endian)         |                    |                 |
//! +----------------------+--------------------+-----------------+
//! ```
//!
//! The tail carries the serialized Try parameters and is never interpreted
//! by the coordinator.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TxnError};

const LENGTH_PREFIX: usize = 4;

/// Encode `header` as JSON followed by `tail`.
pub fn encode<H: Serialize>(header: &H, tail: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(header)?;
    let len = i32::try_from(header.len())
        .map_err(|_| TxnError::codec("envelope header does not fit into an i32 length"))?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX + header.len() + tail.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(tail);
    Ok(buf)
}

/// Split an envelope into its decoded header and raw tail.
pub fn decode<H: DeserializeOwned>(body: &[u8]) -> Result<(H, &[u8])> {
    let prefix: [u8; LENGTH_PREFIX] = body
        .get(..LENGTH_PREFIX)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TxnError::decode(format!("envelope too short: {} bytes", body.len())))?;

    let len = i32::from_be_bytes(prefix);
    let len = usize::try_from(len)
        .map_err(|_| TxnError::decode(format!("negative envelope header length: {}", len)))?;
    let end = LENGTH_PREFIX + len;
    if body.len() < end {
        return Err(TxnError::decode(format!(
            "envelope header length {} exceeds body of {} bytes",
            len,
            body.len()
        )));
    }

    let header = serde_json::from_slice(&body[LENGTH_PREFIX..end])
        .map_err(|e| TxnError::decode(format!("envelope header: {}", e)))?;
    Ok((header, &body[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_layout() {
        let body = encode(&json!({"a": 1}), b"tail").unwrap();

        assert_eq!(&body[..4], &7i32.to_be_bytes());
        assert_eq!(&body[4..11], br#"{"a":1}"#);
        assert_eq!(&body[11..], b"tail");

        let (header, tail): (Value, _) = decode(&body).unwrap();
        assert_eq!(header["a"], 1);
        assert_eq!(tail, b"tail");
    }

    #[test]
    fn test_empty_tail() {
        let body = encode(&json!({}), &[]).unwrap();
        let (_, tail): (Value, _) = decode(&body).unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(matches!(decode::<Value>(&[0, 0]), Err(TxnError::Decode(_))));

        let mut body = encode(&json!({"a": 1}), b"").unwrap();
        body.truncate(6);
        assert!(matches!(decode::<Value>(&body), Err(TxnError::Decode(_))));

        let negative = (-1i32).to_be_bytes();
        assert!(matches!(decode::<Value>(&negative), Err(TxnError::Decode(_))));
    }
}
