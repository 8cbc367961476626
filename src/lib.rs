#![doc = include_str!("../README.md")]

mod client;
mod client_message;
mod envelope;
mod error;
mod execution;
mod fanout;
mod graphql;
mod messenger;
mod server;
mod server_message;
#[cfg(test)]
mod testing;
mod util;

pub use self::{
    client::Client,
    client_message::{ClientMessage, SubscribePayload},
    error::Error,
    execution::{
        EventStream, ExecutionResult, Executor, ResultStream, Subscriber, SubscriptionResult,
    },
    graphql::{GraphQLError, Location, OperationKind, classify},
    messenger::{Messenger, ReceiveCallback},
    server::Server,
    server_message::{NextPayload, ServerMessage},
};

/// ConnectionConfig is used to configure a server session's behavior.
///
/// The defaults are the baseline protocol profile; the result push profile
/// is available through [`ConnectionConfig::data_sync`], and the individual
/// switches can be mixed freely.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Whether client-originated `next` frames are accepted and routed to
    /// the server's `on_next` hook. When off, a client `next` closes the
    /// session with code 4400.
    pub accept_client_next: bool,

    /// Whether the transport is closed after a subscription's source
    /// completes and its terminal `complete` frame is out.
    pub close_on_subscription_complete: bool,

    /// Whether a client `complete` is treated as the peer finishing the
    /// session, firing the server's exit hook in addition to disposing the
    /// operation.
    pub exit_on_client_complete: bool,
}

impl ConnectionConfig {
    /// Constructs the baseline profile: no client-originated `next` frames,
    /// transport closed once a subscription completes, and a client
    /// `complete` fires the exit hook.
    pub fn new() -> Self {
        Self {
            accept_client_next: false,
            close_on_subscription_complete: true,
            exit_on_client_complete: true,
        }
    }

    /// Constructs the result push ("DataSync") profile: client-originated
    /// `next` frames are accepted, and the session stays open across
    /// subscription completions and client `complete` frames.
    pub fn data_sync() -> Self {
        Self {
            accept_client_next: true,
            close_on_subscription_complete: false,
            exit_on_client_complete: false,
        }
    }

    /// Specifies whether client-originated `next` frames are accepted.
    #[must_use]
    pub fn with_accept_client_next(mut self, accept: bool) -> Self {
        self.accept_client_next = accept;
        self
    }

    /// Specifies whether the transport closes after a subscription's
    /// terminal `complete`.
    #[must_use]
    pub fn with_close_on_subscription_complete(mut self, close: bool) -> Self {
        self.close_on_subscription_complete = close;
        self
    }

    /// Specifies whether a client `complete` fires the exit hook.
    #[must_use]
    pub fn with_exit_on_client_complete(mut self, exit: bool) -> Self {
        self.exit_on_client_complete = exit;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}
