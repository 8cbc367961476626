//! Messages sent from the server to the client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{envelope, error::Error, graphql::GraphQLError, util::default_for_null};

/// Sent after execution of an operation. For queries and mutations, this is
/// sent to the client once. For subscriptions, this is sent for every event
/// in the event stream.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NextPayload {
    /// The result data.
    #[serde(default)]
    pub data: Value,

    /// The errors that have occurred during execution. Note that parse and
    /// validation errors are not included here. They are sent via `error`
    /// frames.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub errors: Vec<GraphQLError>,
}

impl NextPayload {
    /// Creates a payload carrying data and no errors.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            errors: Vec::new(),
        }
    }
}

/// ServerMessage defines the message types that servers can send.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ServerMessage {
    /// ConnectionAck is sent in response to a client's `connection_init`
    /// message if the server accepted the connection.
    ConnectionAck {
        /// Optional acknowledgment parameters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Map<String, Value>>,
    },
    /// Next contains the result of a query, mutation, or subscription event.
    Next {
        /// The id of the operation that the data is for.
        id: String,

        /// The data and errors that occurred during execution.
        payload: NextPayload,
    },
    /// Error contains errors that occur before execution, such as validation
    /// errors, or that terminate a streaming operation.
    Error {
        /// The id of the operation that triggered this error.
        id: String,

        /// The error(s), in the order they were produced.
        payload: Vec<GraphQLError>,
    },
    /// Complete indicates that no more data will be sent for the given
    /// operation.
    Complete {
        /// The id of the operation that has completed.
        id: String,
    },
}

impl ServerMessage {
    /// Decodes a server frame in two passes: envelope triage first, then the
    /// kind-specific variant.
    pub fn decode(text: &str) -> Result<Self, Error> {
        let envelope = envelope::read(text)?;
        match envelope.kind.as_str() {
            "connection_ack" | "next" | "error" | "complete" => {
                serde_json::from_value(envelope.value)
                    .map_err(|_| Error::InvalidResponseFormat(envelope.kind))
            }
            _ => Err(Error::InvalidType(envelope.kind)),
        }
    }

    /// Encodes the frame as a JSON text message. Absent optional fields are
    /// omitted, never emitted as `null`.
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|_| Error::InvalidEncoding)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_serialization() {
        assert_eq!(
            ServerMessage::ConnectionAck { payload: None }.encode().unwrap(),
            r#"{"type":"connection_ack"}"#,
        );

        assert_eq!(
            ServerMessage::Next {
                id: "foo".into(),
                payload: NextPayload::new(Value::Null),
            }
            .encode()
            .unwrap(),
            r#"{"type":"next","id":"foo","payload":{"data":null}}"#,
        );

        assert_eq!(
            ServerMessage::Error {
                id: "foo".into(),
                payload: vec![GraphQLError::new("Unknown operation")],
            }
            .encode()
            .unwrap(),
            r#"{"type":"error","id":"foo","payload":[{"message":"Unknown operation"}]}"#,
        );

        assert_eq!(
            ServerMessage::Complete { id: "foo".into() }.encode().unwrap(),
            r#"{"type":"complete","id":"foo"}"#,
        );
    }

    #[test]
    fn test_error_order_is_preserved() {
        let payload = vec![
            GraphQLError::new("first"),
            GraphQLError::new("second"),
            GraphQLError::new("third"),
        ];
        let encoded = ServerMessage::Error {
            id: "foo".into(),
            payload: payload.clone(),
        }
        .encode()
        .unwrap();
        let decoded = ServerMessage::decode(&encoded).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::Error {
                id: "foo".into(),
                payload,
            },
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            ServerMessage::decode("{").unwrap_err(),
            Error::InvalidEncoding,
        );
        assert_eq!(
            ServerMessage::decode(r#"{"payload": {}}"#).unwrap_err(),
            Error::NoType,
        );
        assert_eq!(
            ServerMessage::decode(r#"{"type": "data", "id": "foo"}"#).unwrap_err(),
            Error::InvalidType("data".into()),
        );
        // A client frame kind is not part of the server vocabulary.
        assert_eq!(
            ServerMessage::decode(r#"{"type": "subscribe", "id": "foo"}"#).unwrap_err(),
            Error::InvalidType("subscribe".into()),
        );
        assert_eq!(
            ServerMessage::decode(r#"{"type": "error", "id": "foo", "payload": {}}"#).unwrap_err(),
            Error::InvalidResponseFormat("error".into()),
        );
    }

    #[test]
    fn test_round_trip() {
        for canonical in [
            r#"{"type":"connection_ack"}"#,
            r#"{"type":"connection_ack","payload":{"session":"abc"}}"#,
            r#"{"type":"next","id":"foo","payload":{"data":{"hello":"world"}}}"#,
            r#"{"type":"next","id":"foo","payload":{"data":null,"errors":[{"message":"boom"}]}}"#,
            r#"{"type":"error","id":"foo","payload":[{"message":"boom","locations":[{"line":1,"column":2}]}]}"#,
            r#"{"type":"complete","id":"foo"}"#,
        ] {
            let decoded = ServerMessage::decode(canonical).unwrap();
            assert_eq!(decoded.encode().unwrap(), canonical);
        }
    }

    #[test]
    fn test_next_payload_data_defaults_to_null() {
        let decoded =
            ServerMessage::decode(r#"{"type":"next","id":"foo","payload":{}}"#).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::Next {
                id: "foo".into(),
                payload: NextPayload::new(json!(null)),
            },
        );
    }
}
