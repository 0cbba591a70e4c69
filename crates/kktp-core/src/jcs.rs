//! Canonical JSON serialisation (RFC 8785 style).
//!
//! Signatures over KKTP text anchors cover the canonical serialisation with
//! the signature field omitted. `serde_json`'s map is BTreeMap-backed, so a
//! round trip through `Value` yields sorted keys; the compact writer emits no
//! insignificant whitespace. Payload numbers in this protocol are integers,
//! which serialise in strict form.

use serde::Serialize;
use serde_json::Value;

use crate::error::KktpError;

/// Canonical bytes of any serialisable value.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, KktpError> {
    let v = serde_json::to_value(value).map_err(|e| KktpError::Serialization(e.to_string()))?;
    serde_json::to_vec(&v).map_err(|e| KktpError::Serialization(e.to_string()))
}

/// Canonical string form (for `KKTP:` text payload assembly).
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, KktpError> {
    let v = serde_json::to_value(value).map_err(|e| KktpError::Serialization(e.to_string()))?;
    serde_json::to_string(&v).map_err(|e| KktpError::Serialization(e.to_string()))
}

/// Canonical bytes with one top-level field removed — the sign-what-you-hash
/// rule: signatures cover the body with the signature field absent.
pub fn to_canonical_bytes_without<T: Serialize>(
    value: &T,
    omit_field: &str,
) -> Result<Vec<u8>, KktpError> {
    let mut v = serde_json::to_value(value).map_err(|e| KktpError::Serialization(e.to_string()))?;
    if let Value::Object(map) = &mut v {
        map.remove(omit_field);
    }
    serde_json::to_vec(&v).map_err(|e| KktpError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Unordered {
        zebra: u32,
        alpha: u32,
        mid: &'static str,
    }

    #[test]
    fn keys_are_sorted_and_compact() {
        let bytes = to_canonical_bytes(&Unordered { zebra: 1, alpha: 2, mid: "m" }).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":2,"mid":"m","zebra":1}"#
        );
    }

    #[test]
    fn stable_under_key_reordering() {
        // Two JSON texts with the same fields in different order canonicalise
        // to identical bytes.
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(
            to_canonical_bytes(&a).unwrap(),
            to_canonical_bytes(&b).unwrap()
        );
    }

    #[test]
    fn omit_field_drops_only_that_field() {
        #[derive(Serialize)]
        struct Signed {
            sid: &'static str,
            sig: &'static str,
        }
        let bytes =
            to_canonical_bytes_without(&Signed { sid: "s", sig: "deadbeef" }, "sig").unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"sid":"s"}"#);
    }
}
