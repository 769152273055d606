//! JSON codec for the wire envelope.
//!
//! Wire format: one JSON object per transport message, at most
//! [`MAX_ENVELOPE_SIZE`] bytes. Oversized messages are rejected whole, never
//! truncated.

use crate::envelope::{is_reserved, Envelope};
use crate::error::{GateError, GateResult};
use serde_json::Value;

/// Maximum serialized envelope size (1 MiB, inclusive).
pub const MAX_ENVELOPE_SIZE: usize = 1_048_576;

/// Serialize an envelope, stamping a missing timestamp.
///
/// Reserved keys (`type`, `data`, `timestamp`) left in `extra` are dropped so
/// the output never carries a duplicate key. Returns `MessageTooLarge` without producing any bytes when the encoded
/// form exceeds [`MAX_ENVELOPE_SIZE`].
pub fn encode(envelope: &Envelope) -> GateResult<Vec<u8>> {
    let clean = envelope.timestamp.is_some() && !envelope.extra.keys().any(|k| is_reserved(k));
    let bytes = if clean {
        serde_json::to_vec(envelope)
    } else {
        let mut normalized = envelope.clone();
        normalized.stamp();
        normalized.extra.retain(|key, _| !is_reserved(key));
        serde_json::to_vec(&normalized)
    }
    .map_err(|e| GateError::Other(format!("envelope serialization failed: {e}")))?;

    check_size(bytes.len())?;
    Ok(bytes)
}

/// Parse an envelope from raw bytes.
///
/// The actual byte count is checked before any parsing. Anything that is not
/// a JSON object with a non-empty string `type` is `InvalidFormat`.
pub fn decode(data: &[u8]) -> GateResult<Envelope> {
    check_size(data.len())?;

    let value: Value = serde_json::from_slice(data)
        .map_err(|e| GateError::InvalidFormat(format!("malformed JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| GateError::InvalidFormat("envelope must be a JSON object".into()))?;
    match object.get("type") {
        Some(Value::String(kind)) if !kind.is_empty() => {}
        Some(Value::String(_)) => {
            return Err(GateError::InvalidFormat("empty `type` field".into()));
        }
        Some(_) => return Err(GateError::InvalidFormat("`type` must be a string".into())),
        None => return Err(GateError::InvalidFormat("missing `type` field".into())),
    }

    let mut envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| GateError::InvalidFormat(e.to_string()))?;
    envelope.stamp();
    Ok(envelope)
}

fn check_size(size: usize) -> GateResult<()> {
    if size > MAX_ENVELOPE_SIZE {
        return Err(GateError::MessageTooLarge {
            size,
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_message_decodes() {
        let env = decode(br#"{"type":"TEST","data":"hello","timestamp":1234567890}"#).unwrap();
        assert_eq!(env.kind, "TEST");
        assert_eq!(env.data, json!("hello"));
        assert_eq!(env.timestamp, Some(1234567890));
        assert!(env.extra.is_empty());
    }

    #[test]
    fn round_trip_keeps_extra_fields() {
        let env = Envelope::new("TEST", json!({"nested": [1, 2, 3]}))
            .with_field("client_id", 4)
            .with_field("msg_num", 7);
        let bytes = encode(&env).unwrap();
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn reserved_keys_in_extra_never_shadow_envelope_fields() {
        let mut env = Envelope::new("TEST", "d").with_field("client_id", 4);
        env.extra.insert("type".into(), json!("OTHER"));
        env.extra.insert("data".into(), json!("shadow"));

        let bytes = encode(&env).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(text.matches("\"type\"").count(), 1);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.kind, "TEST");
        assert_eq!(decoded.data, json!("d"));
        let mut expected = env.clone();
        expected.extra.retain(|key, _| key == "client_id");
        assert_eq!(decoded, expected);
    }

    #[test]
    fn with_field_round_trips_after_reserved_key() {
        let env = Envelope::new("TEST", "d").with_field("type", "OTHER");
        assert_eq!(decode(&encode(&env).unwrap()).unwrap(), env);
    }

    #[test]
    fn encode_stamps_missing_timestamp() {
        let mut env = Envelope::new("TEST", "x");
        env.timestamp = None;
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert!(decoded.timestamp.is_some());
    }

    #[test]
    fn decode_stamps_missing_timestamp() {
        let env = decode(br#"{"type":"TEST","data":"world"}"#).unwrap();
        assert!(env.timestamp.is_some());
    }

    #[test]
    fn invalid_json_is_invalid_format() {
        let err = decode(b"{invalid json").unwrap_err();
        assert!(matches!(err, GateError::InvalidFormat(_)));
    }

    #[test]
    fn missing_or_bad_type_is_invalid_format() {
        for input in [
            &br#"{"data":"no type"}"#[..],
            br#"{"type":42}"#,
            br#"{"type":""}"#,
            br#"["TEST"]"#,
            br#"{"type":"TEST","timestamp":"yesterday"}"#,
            b"",
        ] {
            assert!(
                matches!(decode(input), Err(GateError::InvalidFormat(_))),
                "input {:?} should be rejected",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn oversized_payload_is_rejected_on_encode() {
        let env = Envelope::new("TEST", "x".repeat(MAX_ENVELOPE_SIZE + 1));
        let err = encode(&env).unwrap_err();
        assert!(matches!(err, GateError::MessageTooLarge { .. }));
    }

    #[test]
    fn envelope_at_exact_limit_is_accepted() {
        let mut env = Envelope::new("TEST", "");
        let overhead = encode(&env).unwrap().len();
        env.data = json!("x".repeat(MAX_ENVELOPE_SIZE - overhead));
        let bytes = encode(&env).unwrap();
        assert_eq!(bytes.len(), MAX_ENVELOPE_SIZE);
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn oversized_input_is_rejected_before_parsing() {
        // Not even valid JSON: size is checked first.
        let junk = vec![b'{'; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(
            decode(&junk),
            Err(GateError::MessageTooLarge { size, .. }) if size == MAX_ENVELOPE_SIZE + 1
        ));
    }
}
