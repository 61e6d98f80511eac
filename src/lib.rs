//! An asynchronous MQTT 3.1.1 client library.
//!
//! One reactor task per connection drives the packet codec, the stream
//! framer, the connection state machine and the QoS acknowledgment
//! protocols; applications talk to it through [`Connection`] operation
//! futures and a [`ClientEvent`] stream.

mod client;
mod error;
mod framing;
mod packet;
mod packet_id;
mod qos;
mod state;
mod transport;
mod wire;

pub use client::{ClientEvent, Connection, Message};
pub use error::MqttError;
pub use framing::FrameReader;
pub use packet::{ControlPacket, Will};
pub use packet_id::PacketIdAllocator;
pub use qos::{OperationKind, QosEngine};
pub use state::{ConnectionState, ConnectionStateMachine};
pub use transport::Transport;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Immutable configuration snapshot for one connection attempt.
pub struct ConnectionOptions {
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    clean_session: bool,
    will: Option<Will>,
    keep_alive: u16,
}

impl ConnectionOptions {
    /// Creates connection options with default settings: clean session,
    /// no credentials, no will, keep-alive disabled, auto-generated
    /// client id.
    pub fn new() -> Self {
        ConnectionOptions {
            username: None,
            password: None,
            client_id: None,
            clean_session: true,
            will: None,
            keep_alive: 0,
        }
    }

    /// Sets the username and password the broker may use for
    /// authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the client identifier. When absent, an identifier is
    /// generated at connect time.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the clean-session flag.
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Sets the will message the broker publishes after an ungraceful
    /// disconnect.
    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Sets the keep-alive interval in seconds. Zero disables keep-alive
    /// pings.
    pub fn with_keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions::new()
    }
}

/// Entry points for establishing MQTT connections. Each successful call
/// yields an independent [`Connection`] with its own isolated state; no
/// state is shared across connections.
pub struct MqttClient;

impl MqttClient {
    /// Connects over TCP and performs the CONNECT/CONNACK handshake.
    pub async fn connect(
        host: &str,
        port: u16,
        options: ConnectionOptions,
    ) -> Result<(Connection, mpsc::Receiver<ClientEvent>), MqttError> {
        debug!("initiating connection to {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        MqttClient::with_transport(stream, options).await
    }

    /// Connects over a WebSocket and performs the CONNECT/CONNACK
    /// handshake.
    pub async fn connect_ws(
        url: &str,
        options: ConnectionOptions,
    ) -> Result<(Connection, mpsc::Receiver<ClientEvent>), MqttError> {
        debug!("initiating WebSocket connection to {}", url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        MqttClient::with_transport(ws_stream, options).await
    }

    /// Runs the MQTT handshake over an already-established transport.
    /// Resolves once the broker accepts the CONNECT; a rejection surfaces
    /// as [`MqttError::ConnectionRejected`] with the broker's status
    /// code.
    pub async fn with_transport<T: Transport + 'static>(
        transport: T,
        options: ConnectionOptions,
    ) -> Result<(Connection, mpsc::Receiver<ClientEvent>), MqttError> {
        let client_id = options
            .client_id
            .unwrap_or_else(|| format!("mqtt-{:08x}", rand::random::<u32>()));
        let connect_packet = ControlPacket::Connect {
            client_id,
            username: options.username,
            password: options.password,
            clean_session: options.clean_session,
            will: options.will,
            keep_alive: options.keep_alive,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(100);
        let (connect_tx, connect_rx) = oneshot::channel();

        tokio::spawn(client::run_connection(
            transport,
            connect_packet,
            options.keep_alive,
            cmd_rx,
            events_tx,
            connect_tx,
        ));

        connect_rx.await.map_err(|_| MqttError::ConnectionLost)??;
        Ok((Connection::new(cmd_tx), events_rx))
    }
}
