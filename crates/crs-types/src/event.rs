//! Session lifecycle events.

/// An event published by the session broker to its listeners.
///
/// Events are delivered in causal order: a `Connected` always precedes its
/// matching `Disconnected`, and every listener sees the same order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Both halves of a shell session are paired and streaming.
    Connected,
    /// Both halves of the session are gone; the broker is idle again.
    Disconnected,
}
