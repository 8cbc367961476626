//! The client-side peer engine.

use std::sync::{Arc, Weak};

use futures::StreamExt as _;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    client_message::{ClientMessage, SubscribePayload},
    envelope::CLOSE_ECHO_PREFIX,
    error::Error,
    execution::ResultStream,
    fanout::DisposalBag,
    graphql::GraphQLError,
    messenger::Messenger,
    server_message::{NextPayload, ServerMessage},
};

type AckCallback<M, P> = Arc<dyn Fn(Option<Map<String, Value>>, Client<M, P>) + Send + Sync>;
type NextCallback<M, P> = Arc<dyn Fn(&str, NextPayload, Client<M, P>) + Send + Sync>;
type ErrorCallback<M, P> = Arc<dyn Fn(&str, Vec<GraphQLError>, Client<M, P>) + Send + Sync>;
type CompleteCallback<M, P> = Arc<dyn Fn(&str, Client<M, P>) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Callbacks<M, P> {
    on_connection_ack: Mutex<Option<AckCallback<M, P>>>,
    on_next: Mutex<Option<NextCallback<M, P>>>,
    on_error: Mutex<Option<ErrorCallback<M, P>>>,
    on_complete: Mutex<Option<CompleteCallback<M, P>>>,
    on_message: Mutex<Option<MessageCallback>>,
}

impl<M, P> Default for Callbacks<M, P> {
    fn default() -> Self {
        Self {
            on_connection_ack: Mutex::new(None),
            on_next: Mutex::new(None),
            on_error: Mutex::new(None),
            on_complete: Mutex::new(None),
            on_message: Mutex::new(None),
        }
    }
}

#[derive(Default)]
struct ClientState {
    sent_init: bool,
    closed: bool,
    pushes: DisposalBag,
}

struct Inner<M, P> {
    messenger: Weak<M>,
    callbacks: Callbacks<M, P>,
    state: Mutex<ClientState>,
}

/// The client-side peer engine for one session.
///
/// The engine emits client frames through the messenger and dispatches
/// decoded inbound server frames to the registered callbacks. It is a cheap
/// clonable handle; each callback receives the decoded frame contents plus a
/// handle to the engine itself.
///
/// `P` is the `connection_init` payload type; anything encodable works.
pub struct Client<M, P = Value> {
    inner: Arc<Inner<M, P>>,
}

impl<M, P> Clone for Client<M, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, P> Client<M, P>
where
    M: Messenger,
    P: Serialize + Send + 'static,
{
    /// Attaches a new client engine to `messenger`.
    ///
    /// Registers the engine as the messenger's receive callback and keeps
    /// only a weak back-reference to the messenger, leaving the transport's
    /// lifetime to the host.
    pub fn attach(messenger: &Arc<M>) -> Self {
        let client = Self {
            inner: Arc::new(Inner {
                messenger: Arc::downgrade(messenger),
                callbacks: Callbacks::default(),
                state: Mutex::new(ClientState::default()),
            }),
        };
        let handle = client.clone();
        messenger.on_receive(Box::new(move |text| handle.receive(&text)));
        client
    }

    /// Feeds one inbound text frame into the engine.
    ///
    /// Normally invoked through the receive callback registered on attach;
    /// exposed for hosts that wire the transport manually. Decoding failures
    /// are reported through the messenger, never raised into callbacks.
    pub fn receive(&self, text: &str) {
        let tap = self.inner.callbacks.on_message.lock().clone();
        if let Some(tap) = tap {
            tap(text);
        }
        if text.starts_with(CLOSE_ECHO_PREFIX) {
            trace!("dropping re-entered close-code echo");
            return;
        }
        if self.inner.state.lock().closed {
            return;
        }
        trace!(frame = %text, "received server frame");
        match ServerMessage::decode(text) {
            Ok(message) => self.dispatch(message),
            Err(e) => self.fatal(&e),
        }
    }

    /// Emits `connection_init` with the user's payload.
    ///
    /// Must be called exactly once per session; a second call fails with
    /// [`Error::TooManyInitializations`] without touching the wire.
    pub fn send_connection_init(&self, payload: Option<P>) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            if state.sent_init {
                return Err(Error::TooManyInitializations);
            }
            state.sent_init = true;
        }
        debug!("sending connection init");
        self.send(&ClientMessage::ConnectionInit { payload })
    }

    /// Emits `subscribe`, starting the operation `id` with the given
    /// request.
    pub fn send_subscribe(
        &self,
        id: impl Into<String>,
        payload: SubscribePayload,
    ) -> Result<(), Error> {
        self.send(&ClientMessage::Subscribe {
            id: id.into(),
            payload,
        })
    }

    /// Emits `complete`, requesting cancellation of an in-flight operation.
    pub fn send_complete(&self, id: impl Into<String>) -> Result<(), Error> {
        self.send(&ClientMessage::Complete { id: id.into() })
    }

    /// Publishes a host event source through the result push lane.
    ///
    /// Every `Ok` event is emitted as a client-originated `next` frame under
    /// a freshly generated UUID id, so pushed results never collide with the
    /// ids of server-to-client subscriptions. An `Err` event closes the
    /// transport with the wrapped error's close code; when the source
    /// completes, the transport is closed.
    pub fn add_observable_subscription(&self, source: ResultStream) {
        let handle = Uuid::new_v4().to_string();
        let stop = self.inner.state.lock().pushes.insert(handle.clone());
        let client = self.clone();
        tokio::spawn(async move {
            let mut source = source;
            let mut stop = stop;
            loop {
                let event = tokio::select! {
                    biased;
                    _ = &mut stop => {
                        trace!("result push disposed");
                        return;
                    }
                    event = source.next() => event,
                };

                match event {
                    Some(Ok(payload)) => {
                        let frame = ClientMessage::<P>::Next {
                            id: Uuid::new_v4().to_string(),
                            payload,
                        };
                        if let Err(e) = client.send(&frame) {
                            warn!(error = %e, "failed to push result");
                        }
                    }
                    Some(Err(errors)) => {
                        let error = Error::GraphQL(
                            errors
                                .into_iter()
                                .next()
                                .unwrap_or_else(|| GraphQLError::new("event source failed")),
                        );
                        warn!(error = %error, "result push source failed");
                        if let Some(messenger) = client.inner.messenger.upgrade() {
                            messenger.error(error.to_string(), error.close_code());
                        }
                        break;
                    }
                    None => {
                        debug!("result push source completed");
                        if let Some(messenger) = client.inner.messenger.upgrade() {
                            messenger.close();
                        }
                        break;
                    }
                }
            }
            client.inner.state.lock().pushes.dispose(&handle);
        });
    }

    /// Tears the session down: marks it closed and disposes every active
    /// result push.
    ///
    /// Must be called when the transport closes from outside the engine;
    /// dropping the last engine handle disposes the pushes as well.
    pub fn dispose(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.pushes.drain()
        };
        if drained > 0 {
            debug!(drained, "disposed active result pushes");
        }
    }

    /// Sets the callback for inbound `connection_ack` frames.
    ///
    /// Last write wins.
    pub fn set_on_connection_ack<F>(&self, callback: F)
    where
        F: Fn(Option<Map<String, Value>>, Client<M, P>) + Send + Sync + 'static,
    {
        *self.inner.callbacks.on_connection_ack.lock() = Some(Arc::new(callback));
    }

    /// Sets the callback for inbound `next` frames.
    ///
    /// Last write wins.
    pub fn set_on_next<F>(&self, callback: F)
    where
        F: Fn(&str, NextPayload, Client<M, P>) + Send + Sync + 'static,
    {
        *self.inner.callbacks.on_next.lock() = Some(Arc::new(callback));
    }

    /// Sets the callback for inbound `error` frames.
    ///
    /// Last write wins.
    pub fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(&str, Vec<GraphQLError>, Client<M, P>) + Send + Sync + 'static,
    {
        *self.inner.callbacks.on_error.lock() = Some(Arc::new(callback));
    }

    /// Sets the callback for inbound `complete` frames.
    ///
    /// Last write wins.
    pub fn set_on_complete<F>(&self, callback: F)
    where
        F: Fn(&str, Client<M, P>) + Send + Sync + 'static,
    {
        *self.inner.callbacks.on_complete.lock() = Some(Arc::new(callback));
    }

    /// Sets the raw inbound tap, invoked with every inbound text frame
    /// before any filtering or decoding.
    ///
    /// Last write wins.
    pub fn set_on_message<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.inner.callbacks.on_message.lock() = Some(Arc::new(callback));
    }

    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::ConnectionAck { payload } => {
                debug!("connection acknowledged");
                let callback = self.inner.callbacks.on_connection_ack.lock().clone();
                if let Some(callback) = callback {
                    callback(payload, self.clone());
                }
            }
            ServerMessage::Next { id, payload } => {
                let callback = self.inner.callbacks.on_next.lock().clone();
                if let Some(callback) = callback {
                    callback(&id, payload, self.clone());
                }
            }
            ServerMessage::Error { id, payload } => {
                let callback = self.inner.callbacks.on_error.lock().clone();
                if let Some(callback) = callback {
                    callback(&id, payload, self.clone());
                }
            }
            ServerMessage::Complete { id } => {
                let callback = self.inner.callbacks.on_complete.lock().clone();
                if let Some(callback) = callback {
                    callback(&id, self.clone());
                }
            }
        }
    }

    fn send(&self, message: &ClientMessage<P>) -> Result<(), Error> {
        // A transport the host already dropped swallows late sends.
        let Some(messenger) = self.inner.messenger.upgrade() else {
            return Ok(());
        };
        let text = message.encode()?;
        messenger.send(text);
        Ok(())
    }

    fn fatal(&self, error: &Error) {
        let drained = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pushes.drain()
        };
        warn!(error = %error, drained, "closing session on protocol error");
        if let Some(messenger) = self.inner.messenger.upgrade() {
            messenger.error(error.to_string(), error.close_code());
        }
    }
}

#[cfg(test)]
mod test {
    use futures::{
        future::{BoxFuture, FutureExt as _},
        stream::{self, StreamExt as _},
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        ConnectionConfig, Server,
        execution::{ExecutionResult, SubscriptionResult},
        testing::{FakeMessenger, Outbound, link},
    };

    type ExecutorFn = fn(SubscribePayload) -> BoxFuture<'static, ExecutionResult>;
    type SubscriberFn =
        fn(SubscribePayload) -> BoxFuture<'static, Result<SubscriptionResult, Vec<GraphQLError>>>;
    type TestClient = Client<FakeMessenger, Value>;
    type TestServer = Server<FakeMessenger, ExecutorFn, SubscriberFn, Value>;

    fn unused_executor(_: SubscribePayload) -> BoxFuture<'static, ExecutionResult> {
        async { panic!("executor must not be called") }.boxed()
    }

    fn unused_subscriber(
        _: SubscribePayload,
    ) -> BoxFuture<'static, Result<SubscriptionResult, Vec<GraphQLError>>> {
        async { panic!("subscriber must not be called") }.boxed()
    }

    fn ticking_subscriber(
        _: SubscribePayload,
    ) -> BoxFuture<'static, Result<SubscriptionResult, Vec<GraphQLError>>> {
        async {
            let events = (1..=3)
                .map(|n| Ok(NextPayload::new(json!({"tick": n}))))
                .collect::<Vec<_>>();
            Ok(SubscriptionResult::from_stream(stream::iter(events).boxed()))
        }
        .boxed()
    }

    async fn assert_no_more(outbound: &mut mpsc::UnboundedReceiver<Outbound>) {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_init_is_sent_exactly_once() {
        let (messenger, mut outbound) = FakeMessenger::new();
        let client = TestClient::attach(&messenger);

        client
            .send_connection_init(Some(json!({"token": "secret"})))
            .unwrap();
        assert_eq!(
            outbound.recv().await.unwrap(),
            Outbound::Text(r#"{"type":"connection_init","payload":{"token":"secret"}}"#.into()),
        );

        assert_eq!(
            client.send_connection_init(None).unwrap_err(),
            Error::TooManyInitializations,
        );
        assert_no_more(&mut outbound).await;
    }

    #[tokio::test]
    async fn test_subscribe_and_complete_frames() {
        let (messenger, mut outbound) = FakeMessenger::new();
        let client = TestClient::attach(&messenger);

        client
            .send_subscribe("op1", SubscribePayload::new("subscription { tick }"))
            .unwrap();
        assert_eq!(
            outbound.recv().await.unwrap(),
            Outbound::Text(
                r#"{"type":"subscribe","id":"op1","payload":{"query":"subscription { tick }"}}"#
                    .into()
            ),
        );

        client.send_complete("op1").unwrap();
        assert_eq!(
            outbound.recv().await.unwrap(),
            Outbound::Text(r#"{"type":"complete","id":"op1"}"#.into()),
        );
    }

    #[tokio::test]
    async fn test_inbound_dispatch() {
        let (messenger, _outbound) = FakeMessenger::new();
        let client = TestClient::attach(&messenger);

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        client.set_on_connection_ack(move |payload, _client| {
            let _ = ack_tx.send(payload);
        });
        let (next_tx, mut next_rx) = mpsc::unbounded_channel();
        client.set_on_next(move |id, payload, _client| {
            let _ = next_tx.send((id.to_owned(), payload));
        });
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        client.set_on_error(move |id, payload, _client| {
            let _ = error_tx.send((id.to_owned(), payload));
        });
        let (complete_tx, mut complete_rx) = mpsc::unbounded_channel();
        client.set_on_complete(move |id, _client| {
            let _ = complete_tx.send(id.to_owned());
        });

        messenger.deliver(r#"{"type": "connection_ack", "payload": {"session": "abc"}}"#);
        let ack = ack_rx.recv().await.unwrap().unwrap();
        assert_eq!(ack.get("session"), Some(&json!("abc")));

        messenger.deliver(r#"{"type": "next", "id": "op1", "payload": {"data": {"tick": 1}}}"#);
        assert_eq!(
            next_rx.recv().await.unwrap(),
            ("op1".to_owned(), NextPayload::new(json!({"tick": 1}))),
        );

        messenger.deliver(r#"{"type": "error", "id": "op1", "payload": [{"message": "boom"}]}"#);
        assert_eq!(
            error_rx.recv().await.unwrap(),
            ("op1".to_owned(), vec![GraphQLError::new("boom")]),
        );

        messenger.deliver(r#"{"type": "complete", "id": "op1"}"#);
        assert_eq!(complete_rx.recv().await.unwrap(), "op1");
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported_through_the_messenger() {
        let (messenger, mut outbound) = FakeMessenger::new();
        let client = TestClient::attach(&messenger);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        client.set_on_connection_ack(move |payload, _client| {
            let _ = ack_tx.send(payload);
        });

        messenger.deliver(r#"{"type": "data", "id": "op1", "payload": {}}"#);
        assert_eq!(
            outbound.recv().await.unwrap(),
            Outbound::Error {
                message: "4400: Invalid type \"data\" in message".into(),
                code: 4400,
            },
        );

        // The session is closed: later frames are ignored.
        messenger.deliver(r#"{"type": "connection_ack"}"#);
        assert_no_more(&mut outbound).await;
        assert!(ack_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_code_echo_is_dropped() {
        let (messenger, mut outbound) = FakeMessenger::new();
        let client = TestClient::attach(&messenger);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        client.set_on_connection_ack(move |payload, _client| {
            let _ = ack_tx.send(payload);
        });

        messenger.deliver("4429: Too many initialization requests");
        assert_no_more(&mut outbound).await;

        messenger.deliver(r#"{"type": "connection_ack"}"#);
        assert_eq!(ack_rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_result_push_stamps_fresh_uuids() {
        let (messenger, mut outbound) = FakeMessenger::new();
        let client = TestClient::attach(&messenger);

        client.add_observable_subscription(
            stream::iter(vec![Ok(json!({"data": {"n": 1}})), Ok(json!({"data": {"n": 2}}))])
                .boxed(),
        );

        let mut ids = Vec::new();
        for n in 1..=2 {
            let text = match outbound.recv().await.unwrap() {
                Outbound::Text(text) => text,
                other => panic!("expected pushed next, got: {other:?}"),
            };
            match ClientMessage::<Value>::decode(&text).unwrap() {
                ClientMessage::Next { id, payload } => {
                    assert!(Uuid::parse_str(&id).is_ok(), "not a uuid: {id}");
                    assert_eq!(payload, json!({"data": {"n": n}}));
                    ids.push(id);
                }
                frame => panic!("expected pushed next, got: {frame:?}"),
            }
        }
        assert_ne!(ids[0], ids[1]);

        // Source completion closes the transport.
        assert_eq!(outbound.recv().await.unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn test_result_push_failure_closes_with_error() {
        let (messenger, mut outbound) = FakeMessenger::new();
        let client = TestClient::attach(&messenger);

        client.add_observable_subscription(
            stream::iter(vec![Err(vec![GraphQLError::new("boom")])]).boxed(),
        );

        assert_eq!(
            outbound.recv().await.unwrap(),
            Outbound::Error {
                message: "4400: boom".into(),
                code: 4400,
            },
        );
        assert_no_more(&mut outbound).await;
    }

    #[tokio::test]
    async fn test_dispose_cancels_result_pushes() {
        let (messenger, mut outbound) = FakeMessenger::new();
        let client = TestClient::attach(&messenger);

        client.add_observable_subscription(
            stream::iter(vec![Ok(json!({"data": {"n": 1}}))])
                .chain(stream::pending())
                .boxed(),
        );
        match outbound.recv().await.unwrap() {
            Outbound::Text(text) => assert!(text.starts_with(r#"{"type":"next""#), "{text}"),
            other => panic!("expected pushed next, got: {other:?}"),
        }

        client.dispose();
        assert_no_more(&mut outbound).await;
    }

    #[tokio::test]
    async fn test_client_push_reaches_server_without_subscription() {
        let (client_messenger, client_out) = FakeMessenger::new();
        let (server_messenger, server_out) = FakeMessenger::new();

        let server = TestServer::attach(
            &server_messenger,
            unused_executor,
            unused_subscriber,
            ConnectionConfig::data_sync(),
        );
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        server.set_on_message(move |text| {
            let _ = seen_tx.send(text.to_owned());
        });
        let (pushed_tx, mut pushed_rx) = mpsc::unbounded_channel();
        server.set_on_next(move |id, payload, _server| {
            let pushed_tx = pushed_tx.clone();
            async move {
                let _ = pushed_tx.send((id, payload));
                Ok(())
            }
        });

        let client = TestClient::attach(&client_messenger);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        client.set_on_connection_ack(move |payload, _client| {
            let _ = ack_tx.send(payload);
        });

        let _client_tap = link(client_out, &server_messenger);
        let _server_tap = link(server_out, &client_messenger);

        client.send_connection_init(None).unwrap();
        assert_eq!(ack_rx.recv().await.unwrap(), None);

        client.add_observable_subscription(
            stream::iter(vec![Ok(json!({"data": {"n": 1}}))]).boxed(),
        );

        let (id, payload) = pushed_rx.recv().await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok(), "not a uuid: {id}");
        assert_eq!(payload, json!({"data": {"n": 1}}));

        // The server observed exactly the init and the pushed result, and
        // opened no subscription.
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            r#"{"type":"connection_init"}"#,
        );
        let pushed = seen_rx.recv().await.unwrap();
        assert!(pushed.starts_with(r#"{"type":"next""#), "{pushed}");
        assert!(seen_rx.try_recv().is_err());
        assert_eq!(server.active_operations(), 0);
    }

    #[tokio::test]
    async fn test_bidirectional_streaming() {
        let (client_messenger, client_out) = FakeMessenger::new();
        let (server_messenger, server_out) = FakeMessenger::new();

        let server = TestServer::attach(
            &server_messenger,
            unused_executor,
            ticking_subscriber,
            ConnectionConfig::data_sync(),
        );
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        server.set_on_message(move |text| {
            let _ = seen_tx.send(text.to_owned());
        });
        let (pushed_tx, mut pushed_rx) = mpsc::unbounded_channel();
        server.set_on_next(move |id, payload, _server| {
            let pushed_tx = pushed_tx.clone();
            async move {
                let _ = pushed_tx.send((id, payload));
                Ok(())
            }
        });

        let client = TestClient::attach(&client_messenger);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        client.set_on_connection_ack(move |payload, _client| {
            let _ = ack_tx.send(payload);
        });
        let (next_tx, mut next_rx) = mpsc::unbounded_channel();
        client.set_on_next(move |id, payload, _client| {
            let _ = next_tx.send((id.to_owned(), payload));
        });
        let (complete_tx, mut complete_rx) = mpsc::unbounded_channel();
        client.set_on_complete(move |id, _client| {
            let _ = complete_tx.send(id.to_owned());
        });

        let _client_tap = link(client_out, &server_messenger);
        let _server_tap = link(server_out, &client_messenger);

        // Client-visible frames: the ack, three events, one terminator.
        client.send_connection_init(None).unwrap();
        assert_eq!(ack_rx.recv().await.unwrap(), None);

        client
            .send_subscribe("op1", SubscribePayload::new("subscription { tick }"))
            .unwrap();
        for n in 1..=3 {
            let (id, payload) = next_rx.recv().await.unwrap();
            assert_eq!(id, "op1");
            assert_eq!(payload, NextPayload::new(json!({"tick": n})));
        }
        assert_eq!(complete_rx.recv().await.unwrap(), "op1");

        // And one pushed result in the other direction on the same session.
        client.add_observable_subscription(
            stream::iter(vec![Ok(json!({"data": {"ok": true}}))]).boxed(),
        );
        let (id, payload) = pushed_rx.recv().await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok(), "not a uuid: {id}");
        assert_eq!(payload, json!({"data": {"ok": true}}));

        // Server-visible frames: init, subscribe, pushed next.
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            r#"{"type":"connection_init"}"#,
        );
        assert!(
            seen_rx
                .recv()
                .await
                .unwrap()
                .starts_with(r#"{"type":"subscribe"#),
        );
        assert!(seen_rx.recv().await.unwrap().starts_with(r#"{"type":"next""#));
        assert!(seen_rx.try_recv().is_err());

        // No stray frames for the completed operation remain anywhere.
        assert!(next_rx.try_recv().is_err());
        assert!(complete_rx.try_recv().is_err());
        assert_eq!(server.active_operations(), 0);
    }
}
