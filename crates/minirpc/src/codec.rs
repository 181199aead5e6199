//! Payload codec: positional MessagePack for argument tuples plus the
//! status-tagged reply envelope.
//!
//! Arguments travel as the MessagePack image of the call's argument tuple
//! (`(a, b)` → `[a, b]`; a zero-argument call encodes the unit value, one
//! byte of `nil`). Replies are one of three envelope shapes:
//!
//! - `[OK, result]` — success with a value
//! - `[OK]` — success, void procedure
//! - `[FAIL, message]` — failure, human-readable message
//!
//! Structs encode positionally (order-sensitive, name-insensitive), which is
//! rmp-serde's default. Both sides must use this module; the envelope status
//! is written as a plain integer and readers accept any integer width.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Reply status: success.
pub const STATUS_OK: i32 = 0;
/// Reply status: failure; the envelope carries a message string.
pub const STATUS_FAIL: i32 = 1;

/// Encode a call's argument tuple.
pub fn encode_args<T: Serialize>(args: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(args)?)
}

/// Decode a payload into the declared argument tuple. Fails when arity or
/// element shapes don't match.
pub fn decode_args<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encode the success envelope `[OK, value]`.
pub fn encode_ok<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(&(STATUS_OK, value))?)
}

/// Encode the void success envelope `[OK]`.
pub fn encode_ok_void() -> Vec<u8> {
    rmp_serde::to_vec(&(STATUS_OK,)).expect("status envelope encoding is infallible")
}

/// Encode the failure envelope `[FAIL, message]`.
pub fn encode_fail(message: &str) -> Vec<u8> {
    rmp_serde::to_vec(&(STATUS_FAIL, message)).expect("status envelope encoding is infallible")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    #[test]
    fn args_round_trip() {
        let bytes = encode_args(&(1i32, "two", 3.0f64)).unwrap();
        let (a, b, c): (i32, String, f64) = decode_args(&bytes).unwrap();
        assert_eq!((a, b.as_str(), c), (1, "two", 3.0));
    }

    #[test]
    fn unit_args_are_one_byte() {
        let bytes = encode_args(&()).unwrap();
        assert_eq!(bytes, vec![0xc0]); // msgpack nil
        decode_args::<()>(&bytes).unwrap();
    }

    #[test]
    fn arity_mismatch_fails() {
        let bytes = encode_args(&(1i32, 2i32)).unwrap();
        assert!(decode_args::<(i32, i32, i32)>(&bytes).is_err());
    }

    #[test]
    fn shape_mismatch_fails() {
        let bytes = encode_args(&("one", 2i32)).unwrap();
        assert!(decode_args::<(i32, i32)>(&bytes).is_err());
    }

    #[test]
    fn ok_envelope_shape() {
        let bytes = encode_ok(&7i32).unwrap();
        let value: Value = rmp_serde::from_slice(&bytes).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_i64(), Some(STATUS_OK as i64));
        assert_eq!(items[1].as_i64(), Some(7));
    }

    #[test]
    fn void_envelope_shape() {
        let bytes = encode_ok_void();
        let value: Value = rmp_serde::from_slice(&bytes).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_i64(), Some(STATUS_OK as i64));
    }

    #[test]
    fn fail_envelope_shape() {
        let bytes = encode_fail("unknown function");
        let value: Value = rmp_serde::from_slice(&bytes).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_i64(), Some(STATUS_FAIL as i64));
        assert_eq!(items[1].as_str(), Some("unknown function"));
    }
}
