//! Tunnel lifecycle state machine

use crate::error::{KnxError, KnxResult};

/// Lifecycle state of a tunneling session
///
/// # State Transitions
/// ```text
/// Disconnected -> Connecting     (connect)
/// Connecting   -> Established    (CONNECT_RESPONSE with status 0)
/// Connecting   -> Failed         (search, connect or transport error)
/// Established  -> Disconnecting  (disconnect)
/// Established  -> Failed         (keepalive lost, gateway disconnect, transport error)
/// Disconnecting -> Disconnected
/// ```
///
/// `Failed` is terminal for the session instance. Recovering means building
/// a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    /// No channel, initial state
    #[default]
    Disconnected,
    /// Search and connect handshake in progress
    Connecting,
    /// Channel assigned; data may flow
    Established,
    /// DISCONNECT_REQUEST sent
    Disconnecting,
    Failed,
}

impl TunnelState {
    pub fn is_established(&self) -> bool {
        matches!(self, TunnelState::Established)
    }

    /// Whether the session can no longer carry traffic
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Failed)
    }

    /// Check that moving to `new_state` is allowed
    pub fn validate_transition(&self, new_state: TunnelState) -> KnxResult<()> {
        let valid = matches!(
            (*self, new_state),
            (TunnelState::Disconnected, TunnelState::Connecting)
                | (TunnelState::Connecting, TunnelState::Established)
                | (TunnelState::Connecting, TunnelState::Failed)
                | (TunnelState::Established, TunnelState::Disconnecting)
                | (TunnelState::Established, TunnelState::Failed)
                | (TunnelState::Disconnecting, TunnelState::Disconnected)
        );

        if valid {
            Ok(())
        } else {
            Err(KnxError::InvalidState(format!(
                "Invalid tunnel transition: {} -> {}",
                self.as_str(),
                new_state.as_str()
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "Disconnected",
            TunnelState::Connecting => "Connecting",
            TunnelState::Established => "Established",
            TunnelState::Disconnecting => "Disconnecting",
            TunnelState::Failed => "Failed",
        }
    }
}
