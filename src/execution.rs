//! Seams to the host's GraphQL execution engine.
//!
//! The engines never parse, validate, or resolve GraphQL themselves (beyond
//! classifying the request document); execution is plugged in through the
//! [`Executor`] and [`Subscriber`] traits. Both are implemented for closures
//! returning futures, so a host can pass `|payload| async move { .. }`.

use std::future::Future;

use futures::{
    future::{BoxFuture, FutureExt as _},
    stream::BoxStream,
};

use crate::{client_message::SubscribePayload, graphql::GraphQLError, server_message::NextPayload};

/// The outcome of executing one operation or producing one subscription
/// event.
pub type ExecutionResult = Result<NextPayload, Vec<GraphQLError>>;

/// The event source produced by a [`Subscriber`] for a streaming operation.
///
/// `Ok` items are events, an `Err` item is the source failing (terminal for
/// the operation), and the end of the stream is normal completion.
pub type EventStream = BoxStream<'static, ExecutionResult>;

/// A host event source feeding the client-side result push lane: each `Ok`
/// item is a pre-computed result object to publish as a client-originated
/// `next` frame.
pub type ResultStream = BoxStream<'static, Result<serde_json::Value, Vec<GraphQLError>>>;

/// Executes one-shot (query or mutation) operations.
pub trait Executor: Send + Sync + 'static {
    /// Runs the request to a single result.
    fn execute(&self, payload: SubscribePayload) -> BoxFuture<'static, ExecutionResult>;
}

impl<F, Fut> Executor for F
where
    F: Fn(SubscribePayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    fn execute(&self, payload: SubscribePayload) -> BoxFuture<'static, ExecutionResult> {
        self(payload).boxed()
    }
}

/// What a [`Subscriber`] resolved a streaming request into.
pub struct SubscriptionResult {
    /// The event stream. Absent when the resolver failed to produce one.
    pub stream: Option<EventStream>,

    /// Errors reported by the resolver in place of a stream.
    pub errors: Vec<GraphQLError>,
}

impl SubscriptionResult {
    /// A successfully resolved event stream.
    pub fn from_stream(stream: EventStream) -> Self {
        Self {
            stream: Some(stream),
            errors: Vec::new(),
        }
    }

    /// A resolver failure reported in place of a stream.
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            stream: None,
            errors,
        }
    }
}

/// Resolves streaming (subscription) operations into event streams.
pub trait Subscriber: Send + Sync + 'static {
    /// Resolves the request into an event stream.
    fn subscribe(
        &self,
        payload: SubscribePayload,
    ) -> BoxFuture<'static, Result<SubscriptionResult, Vec<GraphQLError>>>;
}

impl<F, Fut> Subscriber for F
where
    F: Fn(SubscribePayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SubscriptionResult, Vec<GraphQLError>>> + Send + 'static,
{
    fn subscribe(
        &self,
        payload: SubscribePayload,
    ) -> BoxFuture<'static, Result<SubscriptionResult, Vec<GraphQLError>>> {
        self(payload).boxed()
    }
}
