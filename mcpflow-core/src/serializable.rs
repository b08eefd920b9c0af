//! ABOUTME: The serializability probe shared by the context and session-manager
//! ABOUTME: write paths: an eager bincode round-trip check, not an advisory warning

use crate::Value;

/// Returns `true` if `value` survives a round trip through a portable binary
/// encoding and compares equal afterwards. This is a hard gate: callers must
/// reject the write/result on `false`.
#[must_use]
pub fn probe(value: &Value) -> bool {
    let Ok(encoded) = bincode::serialize(value) else {
        return false;
    };
    let Ok(decoded) = bincode::deserialize::<Value>(&encoded) else {
        return false;
    };
    decoded == *value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typical_json_shapes_pass() {
        for value in [
            json!(null),
            json!(true),
            json!(1),
            json!(1.5),
            json!("s"),
            json!([1, 2]),
            json!({"a": 1}),
        ] {
            assert!(probe(&value));
        }
    }
}
