//! The server-side peer engine.

use std::{
    future::Future,
    sync::{Arc, Weak},
};

use futures::future::{BoxFuture, FutureExt as _};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, trace, warn};

use crate::{
    ConnectionConfig,
    client_message::{ClientMessage, SubscribePayload},
    envelope::CLOSE_ECHO_PREFIX,
    error::Error,
    execution::{Executor, Subscriber, SubscriptionResult},
    fanout::{DisposalBag, Fanout, FanoutOutcome},
    graphql::{GraphQLError, OperationKind, classify},
    messenger::Messenger,
    server_message::ServerMessage,
};

type AuthHook<P> =
    Arc<dyn Fn(Option<P>) -> BoxFuture<'static, Result<(), GraphQLError>> + Send + Sync>;
type ExitHook = Arc<dyn Fn() + Send + Sync>;
type MessageHook = Arc<dyn Fn(&str) + Send + Sync>;
type OperationCompleteHook = Arc<dyn Fn(&str) + Send + Sync>;
type OperationErrorHook = Arc<dyn Fn(&str, &[GraphQLError]) + Send + Sync>;
type NextHook<M, E, S, P> = Arc<
    dyn Fn(String, Value, Server<M, E, S, P>) -> BoxFuture<'static, Result<(), GraphQLError>>
        + Send
        + Sync,
>;

struct Hooks<M, E, S, P> {
    auth: Mutex<Option<AuthHook<P>>>,
    on_exit: Mutex<Option<ExitHook>>,
    on_message: Mutex<Option<MessageHook>>,
    on_operation_complete: Mutex<Option<OperationCompleteHook>>,
    on_operation_error: Mutex<Option<OperationErrorHook>>,
    on_next: Mutex<Option<NextHook<M, E, S, P>>>,
}

impl<M, E, S, P> Default for Hooks<M, E, S, P> {
    fn default() -> Self {
        Self {
            auth: Mutex::new(None),
            on_exit: Mutex::new(None),
            on_message: Mutex::new(None),
            on_operation_complete: Mutex::new(None),
            on_operation_error: Mutex::new(None),
            on_next: Mutex::new(None),
        }
    }
}

#[derive(Default)]
struct SessionState {
    /// Set synchronously on the first `connection_init`, before the auth
    /// hook resolves, so a racing second init is always answered with 4429.
    init_received: bool,
    /// Set once the auth hook accepted the session.
    initialized: bool,
    closed: bool,
    operations: DisposalBag,
}

struct Inner<M, E, S, P> {
    messenger: Weak<M>,
    executor: E,
    subscriber: S,
    config: ConnectionConfig,
    hooks: Hooks<M, E, S, P>,
    session: Mutex<SessionState>,
}

/// The server-side peer engine for one session.
///
/// The engine interprets inbound client frames delivered through the
/// messenger's receive callback, drives the host's [`Executor`] and
/// [`Subscriber`], and emits server frames back through the messenger. It is
/// a cheap clonable handle; the session lives as long as the transport holds
/// the receive callback (or until [`Server::dispose`]).
///
/// Asynchronous continuations (auth resolution, execution, subscription
/// pumps) are spawned on the ambient tokio runtime, so the engine must be
/// attached from within one.
pub struct Server<M, E, S, P = Value> {
    inner: Arc<Inner<M, E, S, P>>,
}

impl<M, E, S, P> Clone for Server<M, E, S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, E, S, P> Server<M, E, S, P>
where
    M: Messenger,
    E: Executor,
    S: Subscriber,
    P: DeserializeOwned + Send + 'static,
{
    /// Attaches a new server engine to `messenger`.
    ///
    /// Registers the engine as the messenger's receive callback and keeps
    /// only a weak back-reference to the messenger, leaving the transport's
    /// lifetime to the host.
    pub fn attach(messenger: &Arc<M>, executor: E, subscriber: S, config: ConnectionConfig) -> Self {
        let server = Self {
            inner: Arc::new(Inner {
                messenger: Arc::downgrade(messenger),
                executor,
                subscriber,
                config,
                hooks: Hooks::default(),
                session: Mutex::new(SessionState::default()),
            }),
        };
        let handle = server.clone();
        messenger.on_receive(Box::new(move |text| handle.receive(&text)));
        server
    }

    /// Feeds one inbound text frame into the engine.
    ///
    /// Normally invoked through the receive callback registered on attach;
    /// exposed for hosts that wire the transport manually.
    pub fn receive(&self, text: &str) {
        let tap = self.inner.hooks.on_message.lock().clone();
        if let Some(tap) = tap {
            tap(text);
        }
        if text.starts_with(CLOSE_ECHO_PREFIX) {
            trace!("dropping re-entered close-code echo");
            return;
        }
        if self.inner.session.lock().closed {
            return;
        }
        trace!(frame = %text, "received client frame");
        match ClientMessage::<P>::decode(text) {
            Ok(message) => self.dispatch(message),
            Err(e) => self.fatal(&e),
        }
    }

    /// Tears the session down: marks it closed and disposes every active
    /// subscription fan-out.
    ///
    /// Must be called when the transport closes from outside the engine;
    /// dropping the last engine handle disposes the fan-outs as well.
    pub fn dispose(&self) {
        let drained = {
            let mut session = self.inner.session.lock();
            session.closed = true;
            session.operations.drain()
        };
        if drained > 0 {
            debug!(drained, "disposed active subscriptions");
        }
    }

    /// Sets the authorization hook run against the `connection_init`
    /// payload. Rejection closes the session with `4401: Unauthorized`.
    ///
    /// Defaults to accepting every session. Last write wins.
    pub fn set_auth<F, Fut>(&self, hook: F)
    where
        F: Fn(Option<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GraphQLError>> + Send + 'static,
    {
        *self.inner.hooks.auth.lock() = Some(Arc::new(move |payload| hook(payload).boxed()));
    }

    /// Sets the hook fired when the peer completes the session (a client
    /// `complete` after init, with `exit_on_client_complete` set).
    ///
    /// Last write wins.
    pub fn set_on_exit<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.hooks.on_exit.lock() = Some(Arc::new(hook));
    }

    /// Sets the raw inbound tap, invoked with every inbound text frame
    /// before any filtering or decoding.
    ///
    /// Last write wins.
    pub fn set_on_message<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.inner.hooks.on_message.lock() = Some(Arc::new(hook));
    }

    /// Sets the hook fired with an operation id once that operation
    /// completes.
    ///
    /// Last write wins.
    pub fn set_on_operation_complete<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.inner.hooks.on_operation_complete.lock() = Some(Arc::new(hook));
    }

    /// Sets the hook fired with an operation id and its errors once that
    /// operation terminates with an `error` frame.
    ///
    /// Last write wins.
    pub fn set_on_operation_error<F>(&self, hook: F)
    where
        F: Fn(&str, &[GraphQLError]) + Send + Sync + 'static,
    {
        *self.inner.hooks.on_operation_error.lock() = Some(Arc::new(hook));
    }

    /// Sets the handler for client-originated `next` frames (result push
    /// profile). A failed future surfaces as an `error` frame tagged with
    /// that frame's id; the session stays up.
    ///
    /// Last write wins.
    pub fn set_on_next<F, Fut>(&self, hook: F)
    where
        F: Fn(String, Value, Server<M, E, S, P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GraphQLError>> + Send + 'static,
    {
        *self.inner.hooks.on_next.lock() = Some(Arc::new(move |id, payload, server| {
            hook(id, payload, server).boxed()
        }));
    }

    fn dispatch(&self, message: ClientMessage<P>) {
        match message {
            ClientMessage::ConnectionInit { payload } => self.handle_connection_init(payload),
            ClientMessage::Subscribe { id, payload } => self.handle_subscribe(id, payload),
            ClientMessage::Complete { id } => self.handle_complete(&id),
            ClientMessage::Next { id, payload } => self.handle_next(id, payload),
        }
    }

    fn handle_connection_init(&self, payload: Option<P>) {
        {
            let mut session = self.inner.session.lock();
            if session.init_received {
                drop(session);
                self.fatal(&Error::TooManyInitializations);
                return;
            }
            session.init_received = true;
        }

        let server = self.clone();
        tokio::spawn(async move {
            let auth = server.inner.hooks.auth.lock().clone();
            let authorized = match auth {
                Some(auth) => auth(payload).await,
                None => Ok(()),
            };
            match authorized {
                Ok(()) => {
                    server.inner.session.lock().initialized = true;
                    debug!("session initialized");
                    server.send(ServerMessage::ConnectionAck { payload: None });
                }
                Err(e) => {
                    warn!(error = %e, "connection init rejected");
                    server.fatal(&Error::Unauthorized);
                }
            }
        });
    }

    fn handle_subscribe(&self, id: String, payload: SubscribePayload) {
        {
            let session = self.inner.session.lock();
            if !session.initialized {
                drop(session);
                self.fatal(&Error::Unauthorized);
                return;
            }
            if session.operations.contains(&id) {
                drop(session);
                self.fatal(&Error::SubscriberAlreadyExists(id));
                return;
            }
        }

        match classify(&payload.query, payload.operation_name.as_deref()) {
            Ok(kind) if kind.is_streaming() => self.start_streaming(id, payload),
            Ok(_) => self.start_one_shot(id, payload),
            Err(e) => {
                debug!(id = %id, "request classification failed");
                self.send(ServerMessage::Error {
                    id,
                    payload: vec![e],
                });
            }
        }
    }

    fn start_one_shot(&self, id: String, payload: SubscribePayload) {
        debug!(id = %id, "starting one-shot operation");
        let server = self.clone();
        tokio::spawn(async move {
            match server.inner.executor.execute(payload).await {
                Ok(payload) => {
                    server.send(ServerMessage::Next {
                        id: id.clone(),
                        payload,
                    });
                    server.send(ServerMessage::Complete { id: id.clone() });
                    server.fire_operation_complete(&id);
                }
                Err(errors) => {
                    server.send(ServerMessage::Error {
                        id: id.clone(),
                        payload: errors.clone(),
                    });
                    server.send(ServerMessage::Complete { id: id.clone() });
                    server.fire_operation_error(&id, &errors);
                }
            }
            // One-shot sessions are short-lived: the transport closes once
            // the terminator is out.
            if let Some(messenger) = server.inner.messenger.upgrade() {
                messenger.close();
            }
        });
    }

    fn start_streaming(&self, id: String, payload: SubscribePayload) {
        let mut stop = self.inner.session.lock().operations.insert(id.clone());
        debug!(id = %id, "starting subscription");
        let server = self.clone();
        tokio::spawn(async move {
            let resolved = server.inner.subscriber.subscribe(payload).await;

            // The operation may have been disposed while the subscriber was
            // resolving; in that case nothing may be emitted for its id.
            if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
                return;
            }

            let stream = match resolved {
                Ok(SubscriptionResult {
                    stream: Some(stream),
                    ..
                }) => stream,
                Ok(SubscriptionResult {
                    stream: None,
                    errors,
                }) => {
                    if errors.is_empty() {
                        server.fatal(&Error::InternalStreamIssue);
                    } else {
                        server.send(ServerMessage::Error {
                            id: id.clone(),
                            payload: errors.clone(),
                        });
                        server.fire_operation_error(&id, &errors);
                    }
                    server.inner.session.lock().operations.dispose(&id);
                    return;
                }
                Err(errors) => {
                    server.send(ServerMessage::Error {
                        id: id.clone(),
                        payload: errors.clone(),
                    });
                    server.fire_operation_error(&id, &errors);
                    server.inner.session.lock().operations.dispose(&id);
                    return;
                }
            };

            let fanout = Fanout {
                id: id.clone(),
                messenger: server.inner.messenger.clone(),
                close_on_complete: server.inner.config.close_on_subscription_complete,
            };
            match fanout.run(stream, stop).await {
                FanoutOutcome::Completed => {
                    server.inner.session.lock().operations.dispose(&id);
                    server.fire_operation_complete(&id);
                }
                FanoutOutcome::Failed(errors) => {
                    server.inner.session.lock().operations.dispose(&id);
                    server.fire_operation_error(&id, &errors);
                }
                FanoutOutcome::Cancelled => {}
            }
        });
    }

    fn handle_complete(&self, id: &str) {
        let disposed = {
            let mut session = self.inner.session.lock();
            if !session.initialized {
                drop(session);
                self.fatal(&Error::Unauthorized);
                return;
            }
            session.operations.dispose(id)
        };
        if disposed {
            debug!(id = %id, "operation disposed by client");
        }
        self.fire_operation_complete(id);
        if self.inner.config.exit_on_client_complete {
            let on_exit = self.inner.hooks.on_exit.lock().clone();
            if let Some(on_exit) = on_exit {
                on_exit();
            }
        }
    }

    fn handle_next(&self, id: String, payload: Value) {
        if !self.inner.config.accept_client_next {
            self.fatal(&Error::InvalidType("next".into()));
            return;
        }
        if !self.inner.session.lock().initialized {
            self.fatal(&Error::Unauthorized);
            return;
        }
        if embeds_subscription(&payload) {
            debug!(id = %id, "rejecting pushed subscription request");
            let error = GraphQLError::new(Error::InvalidRequestFormat("next".into()).to_string());
            self.send(ServerMessage::Error {
                id,
                payload: vec![error],
            });
            return;
        }

        let hook = self.inner.hooks.on_next.lock().clone();
        let Some(hook) = hook else {
            return;
        };
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = hook(id.clone(), payload, server.clone()).await {
                server.send(ServerMessage::Error {
                    id,
                    payload: vec![e],
                });
            }
        });
    }

    fn send(&self, message: ServerMessage) {
        let Some(messenger) = self.inner.messenger.upgrade() else {
            return;
        };
        match message.encode() {
            Ok(text) => messenger.send(text),
            Err(e) => messenger.error(e.to_string(), e.close_code()),
        }
    }

    /// Reports a fatal protocol error and closes the session: later inbound
    /// frames are ignored and every fan-out is disposed.
    fn fatal(&self, error: &Error) {
        let drained = {
            let mut session = self.inner.session.lock();
            if session.closed {
                return;
            }
            session.closed = true;
            session.operations.drain()
        };
        warn!(error = %error, drained, "closing session on protocol error");
        if let Some(messenger) = self.inner.messenger.upgrade() {
            messenger.error(error.to_string(), error.close_code());
        }
    }

    fn fire_operation_complete(&self, id: &str) {
        let hook = self.inner.hooks.on_operation_complete.lock().clone();
        if let Some(hook) = hook {
            hook(id);
        }
    }

    fn fire_operation_error(&self, id: &str, errors: &[GraphQLError]) {
        let hook = self.inner.hooks.on_operation_error.lock().clone();
        if let Some(hook) = hook {
            hook(id, errors);
        }
    }

    #[cfg(test)]
    pub(crate) fn active_operations(&self) -> usize {
        self.inner.session.lock().operations.len()
    }

    #[cfg(test)]
    pub(crate) fn initialized(&self) -> bool {
        self.inner.session.lock().initialized
    }
}

/// Whether a pushed result payload smuggles in a subscription request.
///
/// Pushed payloads are normally opaque result objects; only a payload that
/// embeds a `query` string whose selected operation is a subscription is
/// rejected, to keep clients from starting subscriptions through the push
/// lane.
fn embeds_subscription(payload: &Value) -> bool {
    let Some(query) = payload.get("query").and_then(Value::as_str) else {
        return false;
    };
    let operation_name = payload.get("operationName").and_then(Value::as_str);
    matches!(
        classify(query, operation_name),
        Ok(OperationKind::Subscription)
    )
}
