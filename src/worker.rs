use std::collections::HashMap;

use serde_json::{json, Value};

use crate::channel::{Notifier, Request, Response};
use crate::room::Room;
use crate::{MediaKind, Profile, RtpCapabilities, RtpParameters, WorkerError};

/// Every method the control channel can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodId {
    WorkerDump,
    WorkerUpdateSettings,
    WorkerCreateRoom,
    RoomClose,
    RoomDump,
    RoomCreatePeer,
    PeerClose,
    PeerDump,
    PeerSetCapabilities,
    PeerCreateTransport,
    PeerCreateProducer,
    TransportClose,
    TransportDump,
    TransportSetRemoteDtlsParameters,
    ProducerClose,
    ProducerDump,
    ProducerReceive,
    ProducerPause,
    ProducerResume,
    ConsumerDump,
    ConsumerEnable,
    ConsumerPause,
    ConsumerResume,
    ConsumerSetPreferredProfile,
}

impl MethodId {
    pub fn from_method(method: &str) -> Option<MethodId> {
        use MethodId::*;

        let id = match method {
            "worker.dump" => WorkerDump,
            "worker.updateSettings" => WorkerUpdateSettings,
            "worker.createRoom" => WorkerCreateRoom,
            "room.close" => RoomClose,
            "room.dump" => RoomDump,
            "room.createPeer" => RoomCreatePeer,
            "peer.close" => PeerClose,
            "peer.dump" => PeerDump,
            "peer.setCapabilities" => PeerSetCapabilities,
            "peer.createTransport" => PeerCreateTransport,
            "peer.createProducer" => PeerCreateProducer,
            "transport.close" => TransportClose,
            "transport.dump" => TransportDump,
            "transport.setRemoteDtlsParameters" => TransportSetRemoteDtlsParameters,
            "producer.close" => ProducerClose,
            "producer.dump" => ProducerDump,
            "producer.receive" => ProducerReceive,
            "producer.pause" => ProducerPause,
            "producer.resume" => ProducerResume,
            "consumer.dump" => ConsumerDump,
            "consumer.enable" => ConsumerEnable,
            "consumer.pause" => ConsumerPause,
            "consumer.resume" => ConsumerResume,
            "consumer.setPreferredProfile" => ConsumerSetPreferredProfile,
            _ => return None,
        };

        Some(id)
    }
}

/// The top level dispatcher: owns all rooms and routes control requests
/// down the entity tree.
#[derive(Debug, Default)]
pub struct Worker {
    rooms: HashMap<u32, Room>,
    log_level: Option<String>,
}

impl Worker {
    pub fn new() -> Worker {
        Worker::default()
    }

    pub fn room(&self, id: u32) -> Option<&Room> {
        self.rooms.get(&id)
    }

    pub fn room_mut(&mut self, id: u32) -> Option<&mut Room> {
        self.rooms.get_mut(&id)
    }

    /// Handles one control request; produces a response. Recoverable
    /// failures reject the request and leave state untouched. An unknown
    /// method means the controller and worker disagree on the protocol
    /// itself; that aborts the worker.
    pub fn handle_request(&mut self, request: &Request, notifier: &mut Notifier) -> Response {
        let Some(method_id) = MethodId::from_method(&request.method) else {
            panic!("unknown method '{}'", request.method);
        };

        debug!("'{}' request [id:{}]", request.method, request.id);

        match self.dispatch(method_id, request, notifier) {
            Ok(data) => Response::accept(request.id, data),
            Err(e) => Response::reject(request.id, e.to_string()),
        }
    }

    fn dispatch(
        &mut self,
        method_id: MethodId,
        request: &Request,
        notifier: &mut Notifier,
    ) -> Result<Option<Value>, WorkerError> {
        use MethodId::*;

        match method_id {
            WorkerDump => {
                let mut room_ids: Vec<u32> = self.rooms.keys().copied().collect();
                room_ids.sort_unstable();
                Ok(Some(json!({
                    "rooms": room_ids,
                    "logLevel": self.log_level,
                })))
            }

            WorkerUpdateSettings => {
                if let Some(level) = request.data.get("logLevel").and_then(Value::as_str) {
                    info!("log level set to '{}'", level);
                    self.log_level = Some(level.to_string());
                }
                Ok(None)
            }

            WorkerCreateRoom => {
                let room_id = request.uint_field("roomId")?;

                if self.rooms.contains_key(&room_id) {
                    return Err(WorkerError::conflict("Room already exists"));
                }

                let room = Room::new(room_id, &request.data)?;
                self.rooms.insert(room_id, room);

                debug!("Room created [roomId:{}]", room_id);

                Ok(None)
            }

            RoomClose => {
                let room_id = request.uint_field("roomId")?;
                let mut room = self
                    .rooms
                    .remove(&room_id)
                    .ok_or_else(|| WorkerError::not_found("Room does not exist"))?;

                room.close(notifier);

                Ok(None)
            }

            RoomDump => {
                let room = self.room_from_request(request)?;
                Ok(Some(room.dump()))
            }

            RoomCreatePeer => {
                let peer_id = request.uint_field("peerId")?;
                let peer_name = request.str_field("peerName")?.to_string();
                let room = self.room_mut_from_request(request)?;

                room.create_peer(peer_id, peer_name)?;

                Ok(None)
            }

            PeerClose => {
                let peer_id = request.uint_field("peerId")?;
                let room = self.room_mut_from_request(request)?;

                room.close_peer(peer_id, notifier)?;

                Ok(None)
            }

            PeerDump => {
                let (room, peer_id) = self.room_and_peer_id(request)?;
                let peer = room
                    .peer(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;

                Ok(Some(peer.dump()))
            }

            PeerSetCapabilities => {
                let peer_id = request.uint_field("peerId")?;
                let capabilities: RtpCapabilities =
                    serde_json::from_value(request.data.clone()).map_err(|e| {
                        WorkerError::protocol(format!("invalid capabilities: {}", e))
                    })?;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;

                peer.set_capabilities(capabilities)?;
                room.peer_capabilities_set(peer_id, notifier);

                Ok(None)
            }

            PeerCreateTransport => {
                let peer_id = request.uint_field("peerId")?;
                let transport_id = request.uint_field("transportId")?;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;

                peer.create_transport(transport_id, &request.data)?;

                Ok(None)
            }

            PeerCreateProducer => {
                let peer_id = request.uint_field("peerId")?;
                let producer_id = request.uint_field("producerId")?;
                let kind: MediaKind = serde_json::from_value(
                    request
                        .data
                        .get("kind")
                        .cloned()
                        .unwrap_or(Value::Null),
                )
                .map_err(|_| WorkerError::protocol("Request has no valid .kind field"))?;
                let transport_id = request.uint_field("transportId").ok();

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;

                peer.create_producer(producer_id, kind, transport_id)?;

                Ok(None)
            }

            TransportClose => {
                let peer_id = request.uint_field("peerId")?;
                let transport_id = request.uint_field("transportId")?;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;

                peer.close_transport(transport_id)?;

                Ok(None)
            }

            TransportDump => {
                let (room, peer_id) = self.room_and_peer_id(request)?;
                let transport_id = request.uint_field("transportId")?;

                let peer = room
                    .peer(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;
                let transport = peer
                    .transport(transport_id)
                    .ok_or_else(|| WorkerError::not_found("Transport does not exist"))?;

                Ok(Some(transport.dump()))
            }

            TransportSetRemoteDtlsParameters => {
                let peer_id = request.uint_field("peerId")?;
                let transport_id = request.uint_field("transportId")?;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;
                let transport = peer
                    .transport_mut(transport_id)
                    .ok_or_else(|| WorkerError::not_found("Transport does not exist"))?;

                transport.set_remote_dtls_parameters(&request.data)?;

                Ok(None)
            }

            ProducerClose => {
                let peer_id = request.uint_field("peerId")?;
                let producer_id = request.uint_field("producerId")?;

                let room = self.room_mut_from_request(request)?;
                room.producer_closed(peer_id, producer_id, notifier)?;

                Ok(None)
            }

            ProducerDump => {
                let (room, peer_id) = self.room_and_peer_id(request)?;
                let producer_id = request.uint_field("producerId")?;

                let peer = room
                    .peer(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;
                let producer = peer
                    .producer(producer_id)
                    .ok_or_else(|| WorkerError::not_found("Producer does not exist"))?;

                Ok(Some(producer.dump()))
            }

            ProducerReceive => {
                let peer_id = request.uint_field("peerId")?;
                let producer_id = request.uint_field("producerId")?;

                let rtp_parameters: RtpParameters = serde_json::from_value(
                    request
                        .data
                        .get("rtpParameters")
                        .cloned()
                        .unwrap_or(Value::Null),
                )
                .map_err(|e| WorkerError::protocol(format!("invalid rtpParameters: {}", e)))?;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;
                let producer = peer
                    .producer_mut(producer_id)
                    .ok_or_else(|| WorkerError::not_found("Producer does not exist"))?;

                let is_update = producer.receive(rtp_parameters)?;
                room.producer_parameters_ready(peer_id, producer_id, is_update, notifier);

                Ok(None)
            }

            ProducerPause | ProducerResume => {
                let peer_id = request.uint_field("peerId")?;
                let producer_id = request.uint_field("producerId")?;
                let pause = method_id == ProducerPause;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;
                let producer = peer
                    .producer_mut(producer_id)
                    .ok_or_else(|| WorkerError::not_found("Producer does not exist"))?;

                if pause {
                    producer.pause(notifier);
                } else {
                    producer.resume(notifier);
                }

                room.producer_paused(producer_id, pause, notifier);

                Ok(None)
            }

            ConsumerDump => {
                let (room, peer_id) = self.room_and_peer_id(request)?;
                let consumer_id = request.uint_field("consumerId")?;

                let peer = room
                    .peer(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;
                let consumer = peer
                    .consumer(consumer_id)
                    .ok_or_else(|| WorkerError::not_found("Consumer does not exist"))?;

                Ok(Some(consumer.dump()))
            }

            ConsumerEnable => {
                let peer_id = request.uint_field("peerId")?;
                let consumer_id = request.uint_field("consumerId")?;
                let transport_id = request.uint_field("transportId")?;

                let rtp_parameters: RtpParameters = serde_json::from_value(
                    request
                        .data
                        .get("rtpParameters")
                        .cloned()
                        .unwrap_or(Value::Null),
                )
                .map_err(|e| WorkerError::protocol(format!("invalid rtpParameters: {}", e)))?;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;

                if peer.transport(transport_id).is_none() {
                    return Err(WorkerError::not_found("Transport does not exist"));
                }

                let consumer = peer
                    .consumer_mut(consumer_id)
                    .ok_or_else(|| WorkerError::not_found("Consumer does not exist"))?;

                consumer.enable(transport_id, rtp_parameters)?;

                Ok(None)
            }

            ConsumerPause | ConsumerResume => {
                let peer_id = request.uint_field("peerId")?;
                let consumer_id = request.uint_field("consumerId")?;
                let pause = method_id == ConsumerPause;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;
                let consumer = peer
                    .consumer_mut(consumer_id)
                    .ok_or_else(|| WorkerError::not_found("Consumer does not exist"))?;

                if pause {
                    consumer.pause();
                } else {
                    consumer.resume();
                }

                Ok(None)
            }

            ConsumerSetPreferredProfile => {
                let peer_id = request.uint_field("peerId")?;
                let consumer_id = request.uint_field("consumerId")?;

                let profile: Profile = serde_json::from_value(
                    request
                        .data
                        .get("profile")
                        .cloned()
                        .unwrap_or(Value::Null),
                )
                .map_err(|_| WorkerError::protocol("Request has no valid .profile field"))?;

                let room = self.room_mut_from_request(request)?;
                let peer = room
                    .peer_mut(peer_id)
                    .ok_or_else(|| WorkerError::not_found("Peer does not exist"))?;
                let consumer = peer
                    .consumer_mut(consumer_id)
                    .ok_or_else(|| WorkerError::not_found("Consumer does not exist"))?;

                consumer.set_preferred_profile(profile, notifier);

                Ok(None)
            }
        }
    }

    fn room_from_request(&self, request: &Request) -> Result<&Room, WorkerError> {
        let room_id = request.uint_field("roomId")?;
        self.rooms
            .get(&room_id)
            .ok_or_else(|| WorkerError::not_found("Room does not exist"))
    }

    fn room_mut_from_request(&mut self, request: &Request) -> Result<&mut Room, WorkerError> {
        let room_id = request.uint_field("roomId")?;
        self.rooms
            .get_mut(&room_id)
            .ok_or_else(|| WorkerError::not_found("Room does not exist"))
    }

    fn room_and_peer_id(&self, request: &Request) -> Result<(&Room, u32), WorkerError> {
        let peer_id = request.uint_field("peerId")?;
        let room = self.room_from_request(request)?;
        Ok((room, peer_id))
    }

    /// Periodic RTCP for every room, on the embedder's clock.
    pub fn send_rtcp(&mut self, now_ms: u64) {
        for room in self.rooms.values_mut() {
            room.send_rtcp(now_ms);
        }
    }

    /// Orderly shutdown: close all rooms, notifying the controller.
    pub fn close(&mut self, notifier: &mut Notifier) {
        info!("closing worker, {} room(s)", self.rooms.len());

        for (_, mut room) in self.rooms.drain() {
            room.close(notifier);
        }
    }
}
