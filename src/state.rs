use crate::error::MqttError;
use std::time::Duration;
use tracing::debug;

/// Lifecycle of one client connection. Disconnected is terminal; a new
/// connect attempt creates a fresh state machine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initiated,
    Connecting,
    Connected,
    Disconnected,
}

/// Tracks the connection lifecycle, gates which operations are permitted
/// and owns the keep-alive policy. One instance per connection; never
/// shared across connections.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    keep_alive: u16,
}

impl ConnectionStateMachine {
    pub fn new(keep_alive: u16) -> Self {
        ConnectionStateMachine {
            state: ConnectionState::Initiated,
            keep_alive,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Moves into Connecting ahead of sending the CONNECT packet.
    pub fn begin_connect(&mut self) -> Result<(), MqttError> {
        match self.state {
            ConnectionState::Initiated | ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            _ => Err(MqttError::Protocol(
                "connect attempted while a connection is active".to_string(),
            )),
        }
    }

    /// Applies the broker's CONNACK verdict. Status code 0 completes the
    /// handshake; anything else moves to Disconnected with the rejection
    /// reason.
    pub fn on_connect_ack(&mut self, status_code: u8) -> Result<(), MqttError> {
        if self.state != ConnectionState::Connecting {
            return Err(MqttError::Protocol(format!(
                "CONNACK received in state {:?}",
                self.state
            )));
        }
        if status_code == crate::packet::CONNECTION_ACCEPTED {
            debug!("connection established");
            self.state = ConnectionState::Connected;
            Ok(())
        } else {
            self.state = ConnectionState::Disconnected;
            Err(MqttError::ConnectionRejected(status_code))
        }
    }

    /// Transport closure ends the connection from any state.
    pub fn on_transport_closed(&mut self) {
        debug!("stream was closed");
        self.state = ConnectionState::Disconnected;
    }

    /// Explicit client-side disconnect.
    pub fn on_disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Guard for publish/subscribe/unsubscribe.
    pub fn require_connected(&self) -> Result<(), MqttError> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }

    /// The periodic ping interval, when keep-alive is enabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        if self.keep_alive > 0 {
            Some(Duration::from_secs(self.keep_alive as u64))
        } else {
            None
        }
    }

    /// PINGREQ is only emitted while connected. No PINGRESP tracking: a
    /// silent broker is not treated as a dead connection here.
    pub fn should_ping(&self) -> bool {
        self.state == ConnectionState::Connected && self.keep_alive > 0
    }
}
