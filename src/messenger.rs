//! The abstract duplex text transport consumed by both engines.

/// Callback invoked once per inbound text frame.
pub type ReceiveCallback = Box<dyn Fn(String) + Send + Sync>;

/// An opaque duplex text-message transport, typically one WebSocket
/// connection.
///
/// The host owns the transport's lifetime: engines hold their messenger by a
/// weak back-reference, while the messenger strongly holds the receive
/// callback, which captures the engine. Once the host drops the transport,
/// late sends from in-flight continuations degrade to silent no-ops.
///
/// Invocations of the receive callback may occur on any thread but must be
/// serialized with respect to one another for a given messenger: at most one
/// delivery is in flight at a time.
pub trait Messenger: Send + Sync + 'static {
    /// Enqueues a text frame for transmission.
    ///
    /// Non-blocking and fire-and-forget; the transport preserves FIFO order
    /// per session.
    fn send(&self, text: String);

    /// Registers the callback invoked once per inbound text frame.
    ///
    /// Replacing the callback replaces the previous one.
    fn on_receive(&self, callback: ReceiveCallback);

    /// Transmits a textual diagnostic and signals the protocol-level close
    /// code to the peer.
    ///
    /// Implementations typically map this to a WebSocket close with the
    /// given code and reason.
    fn error(&self, message: String, code: u16);

    /// Initiates transport shutdown.
    ///
    /// Messages arriving afterwards may be silently dropped.
    fn close(&self);
}
