use crate::error::MqttError;
use crate::framing::FrameReader;
use crate::packet::ControlPacket;
use crate::qos::{OperationKind, QosEngine};
use crate::state::ConnectionStateMachine;
use crate::transport::Transport;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, warn};

/// An inbound application message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub dup: bool,
    pub retain: bool,
}

/// Connection-level events surfaced to the application alongside the
/// operation futures.
#[derive(Debug)]
pub enum ClientEvent {
    /// An inbound PUBLISH.
    Publish(Message),
    /// The inbound stream violated the protocol; the connection has been
    /// closed and the application decides whether to reconnect.
    Fault(MqttError),
    /// The connection ended, gracefully or not.
    Closed,
}

type Completion = oneshot::Sender<Result<(), MqttError>>;

pub(crate) enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        qos: u8,
        dup: bool,
        retain: bool,
        done: Completion,
    },
    Subscribe {
        topic: String,
        qos: u8,
        done: Completion,
    },
    Unsubscribe {
        topic: String,
        done: Completion,
    },
    Disconnect {
        done: Completion,
    },
}

/// Handle to an established connection. Cloneable; all operations are
/// serialized onto the connection's single reactor task.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
}

impl Connection {
    pub(crate) fn new(cmd_tx: mpsc::Sender<Command>) -> Self {
        Connection { cmd_tx }
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: u8,
        dup: bool,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.send(|done| Command::Publish {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            dup,
            retain,
            done,
        })
        .await
    }

    pub async fn subscribe(&self, topic: impl Into<String>, qos: u8) -> Result<(), MqttError> {
        self.send(|done| Command::Subscribe {
            topic: topic.into(),
            qos,
            done,
        })
        .await
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), MqttError> {
        self.send(|done| Command::Unsubscribe {
            topic: topic.into(),
            done,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.send(|done| Command::Disconnect { done }).await
    }

    async fn send<F>(&self, build: F) -> Result<(), MqttError>
    where
        F: FnOnce(Completion) -> Command,
    {
        let (done, result) = oneshot::channel();
        self.cmd_tx
            .send(build(done))
            .await
            .map_err(|_| MqttError::ConnectionLost)?;
        result.await.map_err(|_| MqttError::ConnectionLost)?
    }
}

enum Flow {
    Continue,
    Shutdown,
}

/// The per-connection reactor: one task owns the transport, the frame
/// reader, the QoS engine and the state machine, so packet arrivals,
/// timer ticks and command completions never race each other.
pub(crate) async fn run_connection<T: Transport>(
    mut transport: T,
    connect_packet: ControlPacket,
    keep_alive: u16,
    mut cmd_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<ClientEvent>,
    connect_done: Completion,
) {
    let mut sm = ConnectionStateMachine::new(keep_alive);
    let mut engine = QosEngine::new();
    let mut reader = FrameReader::new();

    if let Err(e) = sm.begin_connect() {
        let _ = connect_done.send(Err(e));
        return;
    }
    if engine.register_connect(connect_done).is_err() {
        return;
    }
    // Listening starts before the handshake resolves; the CONNACK is
    // consumed by the same loop that handles everything else.
    if let Err(e) = write_packet(&mut transport, &connect_packet).await {
        engine.complete_connect(Err(e));
        return;
    }

    let mut keep_alive_timer = sm.keep_alive_interval().map(|period| {
        debug!("keep-alive interval is {:?}", period);
        interval_at(Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            chunk = transport.read_chunk() => match chunk {
                Ok(Some(data)) => {
                    reader.push(&data);
                    match drain_frames(&mut reader, &mut transport, &mut sm, &mut engine, &events_tx).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Shutdown) => {
                            shutdown(&mut transport, &mut sm, &mut engine, &events_tx).await;
                            break;
                        }
                        Err(e) => {
                            error!("inbound stream fault: {}", e);
                            let _ = events_tx.send(ClientEvent::Fault(e)).await;
                            shutdown(&mut transport, &mut sm, &mut engine, &events_tx).await;
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!("transport closed by peer");
                    shutdown(&mut transport, &mut sm, &mut engine, &events_tx).await;
                    break;
                }
                Err(e) => {
                    error!("transport read error: {}", e);
                    shutdown(&mut transport, &mut sm, &mut engine, &events_tx).await;
                    break;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => match handle_command(cmd, &mut transport, &mut sm, &mut engine).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Shutdown) => {
                        shutdown(&mut transport, &mut sm, &mut engine, &events_tx).await;
                        break;
                    }
                    Err(e) => {
                        error!("transport write error: {}", e);
                        shutdown(&mut transport, &mut sm, &mut engine, &events_tx).await;
                        break;
                    }
                },
                None => {
                    // Every Connection handle is gone; end the session.
                    debug!("all connection handles dropped, disconnecting");
                    let _ = write_packet(&mut transport, &ControlPacket::Disconnect).await;
                    shutdown(&mut transport, &mut sm, &mut engine, &events_tx).await;
                    break;
                }
            },
            _ = tick(&mut keep_alive_timer) => {
                if sm.should_ping() {
                    debug!("sending PINGREQ");
                    if let Err(e) = write_packet(&mut transport, &ControlPacket::PingRequest).await {
                        error!("keep-alive write error: {}", e);
                        shutdown(&mut transport, &mut sm, &mut engine, &events_tx).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn drain_frames<T: Transport>(
    reader: &mut FrameReader,
    transport: &mut T,
    sm: &mut ConnectionStateMachine,
    engine: &mut QosEngine,
    events_tx: &mpsc::Sender<ClientEvent>,
) -> Result<Flow, MqttError> {
    while let Some(packet) = reader.next_packet()? {
        match handle_packet(packet, transport, sm, engine, events_tx).await? {
            Flow::Continue => {}
            Flow::Shutdown => return Ok(Flow::Shutdown),
        }
    }
    Ok(Flow::Continue)
}

async fn handle_packet<T: Transport>(
    packet: ControlPacket,
    transport: &mut T,
    sm: &mut ConnectionStateMachine,
    engine: &mut QosEngine,
    events_tx: &mpsc::Sender<ClientEvent>,
) -> Result<Flow, MqttError> {
    match packet {
        ControlPacket::ConnectAck { status_code, .. } => match sm.on_connect_ack(status_code) {
            Ok(()) => {
                engine.complete_connect(Ok(()));
                Ok(Flow::Continue)
            }
            Err(MqttError::ConnectionRejected(code)) => {
                warn!(code, "broker rejected connection");
                engine.complete_connect(Err(MqttError::ConnectionRejected(code)));
                Ok(Flow::Shutdown)
            }
            Err(e) => Err(e),
        },
        ControlPacket::Publish {
            topic,
            payload,
            qos,
            dup,
            retain,
            packet_id,
        } => {
            debug!(%topic, qos, "received PUBLISH");
            if let Some(response) = QosEngine::publish_response(qos, packet_id) {
                write_packet(transport, &response).await?;
            }
            let event = ClientEvent::Publish(Message {
                topic,
                payload,
                qos,
                dup,
                retain,
            });
            if events_tx.send(event).await.is_err() {
                debug!("no event subscriber, inbound message dropped");
            }
            Ok(Flow::Continue)
        }
        ControlPacket::Disconnect => {
            debug!("broker sent DISCONNECT");
            Ok(Flow::Shutdown)
        }
        ControlPacket::Connect { .. }
        | ControlPacket::Subscribe { .. }
        | ControlPacket::Unsubscribe { .. }
        | ControlPacket::PingRequest => {
            warn!("ignoring unexpected client-bound packet");
            Ok(Flow::Continue)
        }
        other => {
            if let Some(response) = engine.handle_inbound(&other) {
                write_packet(transport, &response).await?;
            }
            Ok(Flow::Continue)
        }
    }
}

async fn handle_command<T: Transport>(
    cmd: Command,
    transport: &mut T,
    sm: &mut ConnectionStateMachine,
    engine: &mut QosEngine,
) -> Result<Flow, MqttError> {
    match cmd {
        Command::Publish {
            topic,
            payload,
            qos,
            dup,
            retain,
            done,
        } => {
            if let Err(e) = sm.require_connected() {
                let _ = done.send(Err(e));
                return Ok(Flow::Continue);
            }
            if qos > 2 {
                let _ = done.send(Err(MqttError::Protocol(format!("invalid QoS {}", qos))));
                return Ok(Flow::Continue);
            }
            if qos == 0 {
                // No acknowledgment at QoS 0: resolved once the bytes are
                // handed to the transport.
                let packet = ControlPacket::Publish {
                    topic,
                    payload,
                    qos,
                    dup,
                    retain,
                    packet_id: None,
                };
                write_packet(transport, &packet).await?;
                let _ = done.send(Ok(()));
                return Ok(Flow::Continue);
            }
            let packet_id = engine.next_packet_id();
            debug!(packet_id, qos, "sending PUBLISH");
            if engine.register(OperationKind::Publish, packet_id, done).is_err() {
                return Ok(Flow::Continue);
            }
            let packet = ControlPacket::Publish {
                topic,
                payload,
                qos,
                dup,
                retain,
                packet_id: Some(packet_id),
            };
            write_packet(transport, &packet).await?;
            Ok(Flow::Continue)
        }
        Command::Subscribe { topic, qos, done } => {
            if let Err(e) = sm.require_connected() {
                let _ = done.send(Err(e));
                return Ok(Flow::Continue);
            }
            if qos > 2 {
                let _ = done.send(Err(MqttError::Protocol(format!("invalid QoS {}", qos))));
                return Ok(Flow::Continue);
            }
            let packet_id = engine.next_packet_id();
            debug!(packet_id, %topic, "sending SUBSCRIBE");
            if engine.register(OperationKind::Subscribe, packet_id, done).is_err() {
                return Ok(Flow::Continue);
            }
            let packet = ControlPacket::Subscribe {
                packet_id,
                topic,
                qos,
            };
            write_packet(transport, &packet).await?;
            Ok(Flow::Continue)
        }
        Command::Unsubscribe { topic, done } => {
            if let Err(e) = sm.require_connected() {
                let _ = done.send(Err(e));
                return Ok(Flow::Continue);
            }
            let packet_id = engine.next_packet_id();
            debug!(packet_id, %topic, "sending UNSUBSCRIBE");
            if engine.register(OperationKind::Unsubscribe, packet_id, done).is_err() {
                return Ok(Flow::Continue);
            }
            let packet = ControlPacket::Unsubscribe { packet_id, topic };
            write_packet(transport, &packet).await?;
            Ok(Flow::Continue)
        }
        Command::Disconnect { done } => {
            debug!("sending DISCONNECT");
            let _ = write_packet(transport, &ControlPacket::Disconnect).await;
            sm.on_disconnect();
            let _ = done.send(Ok(()));
            Ok(Flow::Shutdown)
        }
    }
}

async fn shutdown<T: Transport>(
    transport: &mut T,
    sm: &mut ConnectionStateMachine,
    engine: &mut QosEngine,
    events_tx: &mpsc::Sender<ClientEvent>,
) {
    sm.on_transport_closed();
    engine.abort_all();
    let _ = transport.close().await;
    let _ = events_tx.send(ClientEvent::Closed).await;
}

async fn write_packet<T: Transport>(
    transport: &mut T,
    packet: &ControlPacket,
) -> Result<(), MqttError> {
    let bytes = packet.encode()?;
    transport.write_all(&bytes).await?;
    transport.flush().await
}
