//! Operator-facing messages and line helpers for the broker.

use crs_types::{Color, OutLine};

use crate::broker::Broker;

/// Printed when both sides of the shell are connected.
pub const SHELL_READY_MESSAGE: &str = "Shell is ready to go!";

/// Printed when both sides of the shell are gone.
pub const SHELL_GONE_MESSAGE: &str = "Shell is gone :(";

/// Number of unsent events buffered before the dispatcher blocks. Event
/// listener channels should use at least this much capacity as well.
pub const EVENT_BUFFER: usize = 1024;

impl Broker {
    /// Sends a line to the operator, prefixed with the peer address.
    async fn send_line(&self, color: Color, addr: &str, msg: &str) {
        let _ = self
            .output()
            .send(OutLine::line(color, format!("[{addr}] {msg}")))
            .await;
    }

    /// Sends a happy, green line to the operator.
    pub(crate) async fn log_line(&self, addr: &str, msg: &str) {
        self.send_line(Color::Green, addr, msg).await;
    }

    /// Sends an unhappy, red line to the operator.
    pub(crate) async fn error_line(&self, addr: &str, msg: &str) {
        self.send_line(Color::Red, addr, msg).await;
    }
}
