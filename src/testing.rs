//! Test doubles for the messenger seam.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::messenger::{Messenger, ReceiveCallback};

/// One recorded outbound transport action.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Outbound {
    Text(String),
    Error { message: String, code: u16 },
    Close,
}

/// A messenger that records outbound traffic into a channel and lets tests
/// inject inbound frames into the registered receive callback.
pub(crate) struct FakeMessenger {
    outbound: mpsc::UnboundedSender<Outbound>,
    callback: Mutex<Option<ReceiveCallback>>,
}

impl FakeMessenger {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                outbound: tx,
                callback: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Delivers one inbound text frame to the registered receive callback.
    ///
    /// Deliveries through this method are serialized, matching the messenger
    /// contract.
    pub(crate) fn deliver(&self, text: &str) {
        let callback = self.callback.lock();
        if let Some(callback) = &*callback {
            callback(text.to_owned());
        }
    }
}

impl Messenger for FakeMessenger {
    fn send(&self, text: String) {
        let _ = self.outbound.send(Outbound::Text(text));
    }

    fn on_receive(&self, callback: ReceiveCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn error(&self, message: String, code: u16) {
        let _ = self.outbound.send(Outbound::Error { message, code });
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Forwards every text frame `from` sends to `to`'s receive callback, in
/// order, and tees everything recorded on `from` into the returned channel.
///
/// Calling this twice with the sides swapped wires a full-duplex pair for
/// client-engine-to-server-engine tests.
pub(crate) fn link(
    from_outbound: mpsc::UnboundedReceiver<Outbound>,
    to: &Arc<FakeMessenger>,
) -> mpsc::UnboundedReceiver<Outbound> {
    let (tap_tx, tap_rx) = mpsc::unbounded_channel();
    let peer = Arc::clone(to);
    let mut from_outbound = from_outbound;
    tokio::spawn(async move {
        while let Some(action) = from_outbound.recv().await {
            let _ = tap_tx.send(action.clone());
            if let Outbound::Text(text) = action {
                peer.deliver(&text);
            }
        }
    });
    tap_rx
}
