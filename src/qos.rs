use crate::error::MqttError;
use crate::packet::ControlPacket;
use crate::packet_id::PacketIdAllocator;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// The outbound request families that expect an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Publish,
    Subscribe,
    Unsubscribe,
}

/// CONNECT carries no packet identifier; its pending slot is keyed with
/// this sentinel.
const CONNECT_KEY: (OperationKind, u16) = (OperationKind::Connect, 0);

type Completion = oneshot::Sender<Result<(), MqttError>>;

/// Correlates outstanding requests to their acknowledgments by
/// (operation kind, packet id). At most one pending operation may hold a
/// given key; each is resolved or rejected exactly once, then removed.
/// For inbound publishes the engine also drives the responder side of the
/// QoS handshakes.
pub struct QosEngine {
    pending: HashMap<(OperationKind, u16), Completion>,
    allocator: PacketIdAllocator,
}

impl QosEngine {
    pub fn new() -> Self {
        QosEngine::with_allocator(PacketIdAllocator::new())
    }

    pub fn with_allocator(allocator: PacketIdAllocator) -> Self {
        QosEngine {
            pending: HashMap::new(),
            allocator,
        }
    }

    pub fn next_packet_id(&mut self) -> u16 {
        self.allocator.next_id()
    }

    /// Registers a pending operation. A key that is already occupied is a
    /// caller error; the completion handle is rejected immediately.
    pub fn register(
        &mut self,
        kind: OperationKind,
        packet_id: u16,
        done: Completion,
    ) -> Result<(), MqttError> {
        use std::collections::hash_map::Entry;
        match self.pending.entry((kind, packet_id)) {
            Entry::Occupied(_) => {
                let _ = done.send(Err(MqttError::OperationAlreadyPending(packet_id)));
                Err(MqttError::OperationAlreadyPending(packet_id))
            }
            Entry::Vacant(slot) => {
                slot.insert(done);
                Ok(())
            }
        }
    }

    pub fn register_connect(&mut self, done: Completion) -> Result<(), MqttError> {
        self.register(CONNECT_KEY.0, CONNECT_KEY.1, done)
    }

    /// Settles the pending CONNECT with the state machine's CONNACK
    /// verdict.
    pub fn complete_connect(&mut self, result: Result<(), MqttError>) {
        if let Some(done) = self.pending.remove(&CONNECT_KEY) {
            let _ = done.send(result);
        }
    }

    /// Feeds one inbound acknowledgment (or handshake) packet through the
    /// correlation table, returning the response packet to write, if any.
    pub fn handle_inbound(&mut self, packet: &ControlPacket) -> Option<ControlPacket> {
        match packet {
            ControlPacket::PublishAck { packet_id } => {
                debug!(packet_id, "received PUBACK");
                if !self.resolve(OperationKind::Publish, *packet_id) {
                    // A stray PUBACK does not settle anything; the pending
                    // publish keeps waiting for its own id.
                    debug!(packet_id, "PUBACK matches no pending publish");
                }
                None
            }
            ControlPacket::PublishReceived { packet_id } => {
                if self.resolve(OperationKind::Publish, *packet_id) {
                    // The QoS 2 flow resolves here; PUBCOMP is not awaited.
                    debug!(packet_id, "received PUBREC, releasing");
                    Some(ControlPacket::PublishRelease {
                        packet_id: *packet_id,
                    })
                } else {
                    self.reject_mismatch(OperationKind::Publish, *packet_id);
                    None
                }
            }
            ControlPacket::PublishComplete { packet_id } => {
                // The pending publish already resolved on PUBREC.
                debug!(packet_id, "received PUBCOMP");
                None
            }
            ControlPacket::SubscribeAck { packet_id, .. } => {
                if self.resolve(OperationKind::Subscribe, *packet_id) {
                    debug!(packet_id, "subscription acknowledged");
                } else {
                    self.reject_mismatch(OperationKind::Subscribe, *packet_id);
                }
                None
            }
            ControlPacket::UnsubscribeAck { packet_id } => {
                if self.resolve(OperationKind::Unsubscribe, *packet_id) {
                    debug!(packet_id, "unsubscription acknowledged");
                } else {
                    self.reject_mismatch(OperationKind::Unsubscribe, *packet_id);
                }
                None
            }
            // Responder side of an inbound QoS 2 publish.
            ControlPacket::PublishRelease { packet_id } => Some(ControlPacket::PublishComplete {
                packet_id: *packet_id,
            }),
            ControlPacket::PingResponse => {
                debug!("received PINGRESP");
                None
            }
            _ => None,
        }
    }

    /// The acknowledgment owed to the sender of an inbound PUBLISH.
    pub fn publish_response(qos: u8, packet_id: Option<u16>) -> Option<ControlPacket> {
        match (qos, packet_id) {
            (1, Some(packet_id)) => Some(ControlPacket::PublishAck { packet_id }),
            (2, Some(packet_id)) => Some(ControlPacket::PublishReceived { packet_id }),
            _ => None,
        }
    }

    /// Rejects every outstanding operation; used when the transport
    /// closes underneath the connection.
    pub fn abort_all(&mut self) {
        for ((kind, packet_id), done) in self.pending.drain() {
            debug!(?kind, packet_id, "rejecting pending operation, connection lost");
            let _ = done.send(Err(MqttError::ConnectionLost));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn resolve(&mut self, kind: OperationKind, packet_id: u16) -> bool {
        match self.pending.remove(&(kind, packet_id)) {
            Some(done) => {
                let _ = done.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// An acknowledgment arrived for this kind with an id that matches no
    /// pending slot: every outstanding operation of the same kind is
    /// rejected rather than left dangling forever.
    fn reject_mismatch(&mut self, kind: OperationKind, actual: u16) {
        let expected_ids: Vec<u16> = self
            .pending
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect();
        if expected_ids.is_empty() {
            debug!(?kind, actual, "stray acknowledgment, nothing pending");
            return;
        }
        for expected in expected_ids {
            warn!(?kind, expected, actual, "acknowledgment packet id mismatch");
            if let Some(done) = self.pending.remove(&(kind, expected)) {
                let _ = done.send(Err(MqttError::AckMismatch { expected, actual }));
            }
        }
    }
}

impl Default for QosEngine {
    fn default() -> Self {
        QosEngine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> QosEngine {
        QosEngine::with_allocator(PacketIdAllocator::seeded(100))
    }

    #[test]
    fn qos1_publish_resolves_on_matching_puback() {
        let mut engine = engine();
        let id = engine.next_packet_id();
        let (tx, mut rx) = oneshot::channel();
        engine.register(OperationKind::Publish, id, tx).unwrap();

        let response = engine.handle_inbound(&ControlPacket::PublishAck { packet_id: id });
        assert_eq!(response, None);
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn qos1_publish_ignores_mismatched_puback() {
        let mut engine = engine();
        let id = engine.next_packet_id();
        let (tx, mut rx) = oneshot::channel();
        engine.register(OperationKind::Publish, id, tx).unwrap();

        engine.handle_inbound(&ControlPacket::PublishAck { packet_id: id + 1 });
        assert!(rx.try_recv().is_err(), "operation must stay pending");
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn qos2_publish_emits_pubrel_and_resolves_before_pubcomp() {
        let mut engine = engine();
        let id = engine.next_packet_id();
        let (tx, mut rx) = oneshot::channel();
        engine.register(OperationKind::Publish, id, tx).unwrap();

        let response = engine.handle_inbound(&ControlPacket::PublishReceived { packet_id: id });
        assert_eq!(
            response,
            Some(ControlPacket::PublishRelease { packet_id: id })
        );
        assert!(rx.try_recv().unwrap().is_ok());

        // PUBCOMP afterwards is informational only.
        let response = engine.handle_inbound(&ControlPacket::PublishComplete { packet_id: id });
        assert_eq!(response, None);
    }

    #[test]
    fn qos2_mismatched_pubrec_rejects_without_pubrel() {
        let mut engine = engine();
        let id = engine.next_packet_id();
        let (tx, mut rx) = oneshot::channel();
        engine.register(OperationKind::Publish, id, tx).unwrap();

        let response = engine.handle_inbound(&ControlPacket::PublishReceived {
            packet_id: id + 10,
        });
        assert_eq!(response, None, "no PUBREL on mismatch");
        match rx.try_recv().unwrap() {
            Err(MqttError::AckMismatch { expected, actual }) => {
                assert_eq!(expected, id);
                assert_eq!(actual, id + 10);
            }
            other => panic!("unexpected completion: {:?}", other),
        }
    }

    #[test]
    fn subscribe_resolves_on_matching_suback() {
        let mut engine = engine();
        let id = engine.next_packet_id();
        let (tx, mut rx) = oneshot::channel();
        engine.register(OperationKind::Subscribe, id, tx).unwrap();

        engine.handle_inbound(&ControlPacket::SubscribeAck {
            packet_id: id,
            granted_qos: vec![1],
        });
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn subscribe_and_unsubscribe_reject_on_mismatch() {
        let mut engine = engine();
        let sub_id = engine.next_packet_id();
        let unsub_id = engine.next_packet_id();
        let (sub_tx, mut sub_rx) = oneshot::channel();
        let (unsub_tx, mut unsub_rx) = oneshot::channel();
        engine
            .register(OperationKind::Subscribe, sub_id, sub_tx)
            .unwrap();
        engine
            .register(OperationKind::Unsubscribe, unsub_id, unsub_tx)
            .unwrap();

        engine.handle_inbound(&ControlPacket::SubscribeAck {
            packet_id: 9999,
            granted_qos: vec![0],
        });
        engine.handle_inbound(&ControlPacket::UnsubscribeAck { packet_id: 9998 });

        assert!(matches!(
            sub_rx.try_recv().unwrap(),
            Err(MqttError::AckMismatch { .. })
        ));
        assert!(matches!(
            unsub_rx.try_recv().unwrap(),
            Err(MqttError::AckMismatch { .. })
        ));
    }

    #[test]
    fn mismatch_rejects_every_pending_operation_of_its_kind() {
        let mut engine = engine();
        let id1 = engine.next_packet_id();
        let id2 = engine.next_packet_id();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        engine.register(OperationKind::Publish, id1, tx1).unwrap();
        engine.register(OperationKind::Publish, id2, tx2).unwrap();

        let response = engine.handle_inbound(&ControlPacket::PublishReceived { packet_id: 9999 });
        assert_eq!(response, None);
        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Err(MqttError::AckMismatch { actual: 9999, .. })
            ));
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn mismatch_of_one_kind_leaves_other_kinds_pending() {
        let mut engine = engine();
        let pub_id = engine.next_packet_id();
        let sub_id = engine.next_packet_id();
        let (pub_tx, mut pub_rx) = oneshot::channel();
        let (sub_tx, mut sub_rx) = oneshot::channel();
        engine
            .register(OperationKind::Publish, pub_id, pub_tx)
            .unwrap();
        engine
            .register(OperationKind::Subscribe, sub_id, sub_tx)
            .unwrap();

        engine.handle_inbound(&ControlPacket::SubscribeAck {
            packet_id: 9999,
            granted_qos: vec![0],
        });
        assert!(matches!(
            sub_rx.try_recv().unwrap(),
            Err(MqttError::AckMismatch { .. })
        ));
        assert!(pub_rx.try_recv().is_err(), "publish must stay pending");
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut engine = engine();
        let id = engine.next_packet_id();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        engine.register(OperationKind::Publish, id, tx1).unwrap();

        let err = engine.register(OperationKind::Publish, id, tx2).unwrap_err();
        assert!(matches!(err, MqttError::OperationAlreadyPending(_)));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            Err(MqttError::OperationAlreadyPending(_))
        ));
    }

    #[test]
    fn connect_completion() {
        let mut engine = engine();
        let (tx, mut rx) = oneshot::channel();
        engine.register_connect(tx).unwrap();
        engine.complete_connect(Err(MqttError::ConnectionRejected(2)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(MqttError::ConnectionRejected(2))
        ));
    }

    #[test]
    fn abort_all_rejects_with_connection_lost() {
        let mut engine = engine();
        let id1 = engine.next_packet_id();
        let id2 = engine.next_packet_id();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        engine.register(OperationKind::Publish, id1, tx1).unwrap();
        engine.register(OperationKind::Subscribe, id2, tx2).unwrap();

        engine.abort_all();
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(MqttError::ConnectionLost)
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            Err(MqttError::ConnectionLost)
        ));
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn inbound_publish_responses() {
        assert_eq!(QosEngine::publish_response(0, None), None);
        assert_eq!(
            QosEngine::publish_response(1, Some(5)),
            Some(ControlPacket::PublishAck { packet_id: 5 })
        );
        assert_eq!(
            QosEngine::publish_response(2, Some(6)),
            Some(ControlPacket::PublishReceived { packet_id: 6 })
        );
    }

    #[test]
    fn inbound_pubrel_answered_with_pubcomp() {
        let mut engine = engine();
        let response = engine.handle_inbound(&ControlPacket::PublishRelease { packet_id: 12 });
        assert_eq!(
            response,
            Some(ControlPacket::PublishComplete { packet_id: 12 })
        );
    }
}
