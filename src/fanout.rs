//! Bridges a subscription event source onto the outbound frame channel.

use std::{collections::HashMap, sync::Weak};

use futures::StreamExt as _;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    execution::EventStream, graphql::GraphQLError, messenger::Messenger,
    server_message::ServerMessage,
};

/// Owns the stopper for every active fan-out in a session.
///
/// Each active operation id owns exactly one entry while its fan-out runs.
/// Dropping an entry cancels the corresponding pump between events, so
/// draining the bag on session teardown cancels everything outstanding.
#[derive(Default)]
pub(crate) struct DisposalBag {
    stoppers: HashMap<String, oneshot::Sender<()>>,
}

impl DisposalBag {
    /// Whether an active fan-out exists for `id`.
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.stoppers.contains_key(id)
    }

    /// Registers a fan-out under `id` and returns the signal its pump
    /// selects on.
    pub(crate) fn insert(&mut self, id: String) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.stoppers.insert(id, tx);
        rx
    }

    /// Disposes the fan-out for `id`, if any. Returns whether one was
    /// active.
    pub(crate) fn dispose(&mut self, id: &str) -> bool {
        self.stoppers.remove(id).is_some()
    }

    /// Disposes every active fan-out, returning how many there were.
    pub(crate) fn drain(&mut self) -> usize {
        let drained = self.stoppers.len();
        self.stoppers.clear();
        drained
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.stoppers.len()
    }
}

/// How a fan-out ended.
#[derive(Debug)]
pub(crate) enum FanoutOutcome {
    /// The source completed normally; `complete` was the last frame.
    Completed,
    /// The source failed; `error` was the last frame.
    Failed(Vec<GraphQLError>),
    /// The fan-out was disposed; no terminator was emitted.
    Cancelled,
}

/// The per-operation pump translating source events into outbound frames.
///
/// All frames for the operation are emitted from this one task, so `next`
/// frames follow source order and the terminator is strictly the last frame
/// bearing the id.
pub(crate) struct Fanout<M> {
    pub id: String,
    pub messenger: Weak<M>,
    pub close_on_complete: bool,
}

impl<M: Messenger> Fanout<M> {
    pub(crate) async fn run(
        self,
        mut stream: EventStream,
        mut stop: oneshot::Receiver<()>,
    ) -> FanoutOutcome {
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut stop => {
                    trace!(id = %self.id, "subscription fan-out disposed");
                    return FanoutOutcome::Cancelled;
                }
                event = stream.next() => event,
            };

            match event {
                Some(Ok(payload)) => {
                    self.emit(ServerMessage::Next {
                        id: self.id.clone(),
                        payload,
                    });
                }
                Some(Err(errors)) => {
                    debug!(id = %self.id, "subscription source failed");
                    self.emit(ServerMessage::Error {
                        id: self.id.clone(),
                        payload: errors.clone(),
                    });
                    return FanoutOutcome::Failed(errors);
                }
                None => {
                    debug!(id = %self.id, "subscription source completed");
                    self.emit(ServerMessage::Complete {
                        id: self.id.clone(),
                    });
                    if self.close_on_complete {
                        if let Some(messenger) = self.messenger.upgrade() {
                            messenger.close();
                        }
                    }
                    return FanoutOutcome::Completed;
                }
            }
        }
    }

    fn emit(&self, message: ServerMessage) {
        let Some(messenger) = self.messenger.upgrade() else {
            return;
        };
        match message.encode() {
            Ok(text) => messenger.send(text),
            Err(e) => messenger.error(e.to_string(), e.close_code()),
        }
    }
}
