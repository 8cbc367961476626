//! First decoding pass: discover the frame kind before touching the variant.
//!
//! Decoding is split in two so that forward-compatible triage errors stay
//! distinguishable: a message that is not JSON, a message without a `type`,
//! a `type` naming no known kind, and a known kind whose variant fails to
//! decode each map to their own protocol error.

use serde_json::Value;

use crate::error::Error;

/// Leading characters of close-code echoes that some transports re-enter
/// into the receive pipeline. Both engines drop such messages silently
/// before decoding.
pub(crate) const CLOSE_ECHO_PREFIX: &str = "44";

/// The minimal `{type}` envelope of an inbound frame, plus the parsed
/// message for the second pass.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub kind: String,
    pub value: Value,
}

/// Reads the envelope out of an inbound text frame.
pub(crate) fn read(text: &str) -> Result<Envelope, Error> {
    let value: Value = serde_json::from_str(text).map_err(|_| Error::InvalidEncoding)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(Error::NoType)?
        .to_owned();
    Ok(Envelope { kind, value })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read() {
        let envelope = read(r#"{"type": "complete", "id": "foo"}"#).unwrap();
        assert_eq!(envelope.kind, "complete");

        assert_eq!(read("not json").unwrap_err(), Error::InvalidEncoding);
        assert_eq!(read(r#"{"id": "foo"}"#).unwrap_err(), Error::NoType);
        assert_eq!(read(r#"{"type": 42}"#).unwrap_err(), Error::NoType);
    }
}
