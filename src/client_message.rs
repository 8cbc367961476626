//! Messages sent from the client to the server.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{envelope, error::Error, util::default_for_null};

/// The payload of a [`ClientMessage::Subscribe`] frame. This triggers
/// execution of a query, mutation, or subscription.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// The document body.
    pub query: String,

    /// The optional variables.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Map::is_empty"
    )]
    pub variables: Map<String, Value>,

    /// The optional operation name (required if the document contains
    /// multiple operations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    /// The optional extension data.
    #[serde(
        default,
        deserialize_with = "default_for_null",
        skip_serializing_if = "Map::is_empty"
    )]
    pub extensions: Map<String, Value>,
}

impl SubscribePayload {
    /// Creates a payload carrying only a document body.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Map::new(),
            operation_name: None,
            extensions: Map::new(),
        }
    }
}

/// ClientMessage defines the message types that clients can send.
///
/// `P` is the host-defined `connection_init` payload type; anything
/// encodable works, and it defaults to an opaque [`Value`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(bound(deserialize = "P: Deserialize<'de>"))]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ClientMessage<P = Value> {
    /// ConnectionInit is sent by the client upon connecting.
    ConnectionInit {
        /// Optional parameters of any type sent from the client. These are
        /// often used for authentication.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<P>,
    },
    /// Requests an operation specified in the message payload.
    Subscribe {
        /// The id of the operation. This can be anything, but must be unique
        /// among the session's active streaming operations.
        id: String,

        /// The query, variables, and operation name.
        payload: SubscribePayload,
    },
    /// Indicates that the client has stopped listening and wants the
    /// operation completed.
    Complete {
        /// The id of the operation to stop.
        id: String,
    },
    /// Pushes a pre-computed operation result to the server. Only accepted
    /// by servers running the result push profile.
    Next {
        /// A fresh id for this pushed result, not correlated with any
        /// `Subscribe`.
        id: String,

        /// The result object.
        payload: Value,
    },
}

impl<P> ClientMessage<P> {
    /// Decodes a client frame in two passes: envelope triage first, then the
    /// kind-specific variant.
    pub fn decode(text: &str) -> Result<Self, Error>
    where
        P: DeserializeOwned,
    {
        let envelope = envelope::read(text)?;
        match envelope.kind.as_str() {
            "connection_init" | "subscribe" | "complete" | "next" => {
                serde_json::from_value(envelope.value)
                    .map_err(|_| Error::InvalidRequestFormat(envelope.kind))
            }
            _ => Err(Error::InvalidType(envelope.kind)),
        }
    }

    /// Encodes the frame as a JSON text message. Absent optional fields are
    /// omitted, never emitted as `null`.
    pub fn encode(&self) -> Result<String, Error>
    where
        P: Serialize,
    {
        serde_json::to_string(self).map_err(|_| Error::InvalidEncoding)
    }
}
