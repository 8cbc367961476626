//! Protocol errors and their close codes.

use derive_more::Display;

use crate::graphql::GraphQLError;

/// A protocol-level fault, carrying the WebSocket close code the peer sees.
///
/// The `Display` rendering is the textual diagnostic transmitted alongside
/// the close code, always prefixed with the numeric code so that peers
/// ignorant of custom close codes still see it.
#[derive(Clone, Debug, Display, PartialEq)]
pub enum Error {
    /// The inbound message was not parseable as JSON.
    #[display("4400: Could not parse message as JSON")]
    InvalidEncoding,

    /// The inbound message carried no `type` discriminator.
    #[display("4400: No type found in message")]
    NoType,

    /// The `type` discriminator names no known frame kind.
    #[display("4400: Invalid type \"{_0}\" in message")]
    InvalidType(String),

    /// The frame kind was recognized but the client frame failed to decode.
    #[display("4400: Invalid request format for message type \"{_0}\"")]
    InvalidRequestFormat(String),

    /// The frame kind was recognized but the server frame failed to decode.
    #[display("4400: Invalid response format for message type \"{_0}\"")]
    InvalidResponseFormat(String),

    /// The auth hook rejected the session, or an operation arrived before an
    /// accepted `connection_init`.
    #[display("4401: Unauthorized")]
    Unauthorized,

    /// An operation was attempted on a session that was never initialized.
    #[display("4401: Not initialized")]
    NotInitialized,

    /// A second `connection_init` arrived within one session.
    #[display("4429: Too many initialization requests")]
    TooManyInitializations,

    /// A `subscribe` reused the id of an active streaming operation.
    #[display("4409: Subscriber for {_0} already exists")]
    SubscriberAlreadyExists(String),

    /// The subscriber resolved without an event stream where streaming was
    /// required, and reported nothing the client could act on.
    #[display("4500: Internal API stream issue")]
    InternalStreamIssue,

    /// A host-supplied error that must be forwarded with a numeric code.
    #[display("4400: {_0}")]
    GraphQL(GraphQLError),
}

impl Error {
    /// The numeric close code signalled to the peer for this fault.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::InvalidEncoding
            | Self::NoType
            | Self::InvalidType(_)
            | Self::InvalidRequestFormat(_)
            | Self::InvalidResponseFormat(_)
            | Self::GraphQL(_) => 4400,
            Self::Unauthorized | Self::NotInitialized => 4401,
            Self::SubscriberAlreadyExists(_) => 4409,
            Self::TooManyInitializations => 4429,
            Self::InternalStreamIssue => 4500,
        }
    }
}

impl std::error::Error for Error {}
