use std::collections::{BTreeSet, HashMap, HashSet};

use once_cell::sync::Lazy;
use rand::Rng;
use serde_json::{json, Value};

use crate::channel::Notifier;
use crate::consumer::Consumer;
use crate::parameters::DYNAMIC_PAYLOAD_TYPES;
use crate::peer::Peer;
use crate::rtcp::Rtcp;
use crate::rtp::RtpPacket;
use crate::{Profile, RtpCapabilities, RtpCodecParameters, WorkerError};

/// Capabilities every room supports regardless of its codecs, built once
/// at worker boot.
static SUPPORTED_CAPABILITIES: Lazy<RtpCapabilities> = Lazy::new(|| {
    serde_json::from_value(json!({
        "headerExtensions": [
            {
                "kind": "",
                "uri": "urn:ietf:params:rtp-hdrext:sdes:mid",
                "preferredId": 1,
                "preferredEncrypt": false
            }
        ],
        "fecMechanisms": []
    }))
    .expect("static capabilities parse")
});

/// The routing graph of one room: peers, and the fan-out from every
/// producer to the consumers mirroring it.
///
/// The room is the sole owner of all entities (via its peers); producers
/// and consumers know each other only by id. Close propagation walks the
/// room's maps, never pointers between entities.
#[derive(Debug)]
pub struct Room {
    id: u32,
    capabilities: RtpCapabilities,
    peers: HashMap<u32, Peer>,

    /// `producerId → ordered set of (peerId, consumerId)`. Iteration order
    /// of a producer's consumers is stable between mutations.
    fanout: HashMap<u32, BTreeSet<(u32, u32)>>,

    /// Which peer owns each producer, for routing without scanning.
    producer_owner: HashMap<u32, u32>,
}

impl Room {
    pub fn new(id: u32, data: &Value) -> Result<Room, WorkerError> {
        let mut media_codecs = Vec::new();

        // `mediaCodecs` is optional.
        if let Some(json_codecs) = data.get("mediaCodecs") {
            let Some(array) = json_codecs.as_array() else {
                return Err(WorkerError::protocol("mediaCodecs must be an array"));
            };

            for json_codec in array {
                let codec: RtpCodecParameters = serde_json::from_value(json_codec.clone())
                    .map_err(|e| WorkerError::protocol(format!("invalid media codec: {}", e)))?;

                // Feature codecs (RTX, FEC) make no sense as room codecs.
                if codec.is_rtx() {
                    continue;
                }

                media_codecs.push(codec);
            }
        }

        let capabilities = Room::build_capabilities(media_codecs)?;

        Ok(Room {
            id,
            capabilities,
            peers: HashMap::new(),
            fanout: HashMap::new(),
            producer_owner: HashMap::new(),
        })
    }

    /// Assigns every room codec a unique payload type, preferring the one
    /// it came with, falling back to the dynamic range.
    fn build_capabilities(
        media_codecs: Vec<RtpCodecParameters>,
    ) -> Result<RtpCapabilities, WorkerError> {
        let mut used: HashSet<u8> = HashSet::new();
        let mut dynamic = DYNAMIC_PAYLOAD_TYPES.iter();
        let mut codecs = Vec::new();

        for mut codec in media_codecs {
            if codec.payload_type == 0 || used.contains(&codec.payload_type) {
                let pt = dynamic
                    .by_ref()
                    .find(|pt| !used.contains(pt))
                    .ok_or_else(|| {
                        WorkerError::Capacity(
                            "no more available dynamic payload types for given media codecs"
                                .to_string(),
                        )
                    })?;

                codec.payload_type = *pt;
            }

            used.insert(codec.payload_type);
            codecs.push(codec);
        }

        Ok(RtpCapabilities {
            codecs,
            header_extensions: SUPPORTED_CAPABILITIES.header_extensions.clone(),
            fec_mechanisms: SUPPORTED_CAPABILITIES.fec_mechanisms.clone(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    pub fn peer(&self, id: u32) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: u32) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn create_peer(&mut self, peer_id: u32, name: String) -> Result<(), WorkerError> {
        if self.peers.contains_key(&peer_id) {
            return Err(WorkerError::conflict("Peer already exists"));
        }

        self.peers.insert(peer_id, Peer::new(peer_id, name));

        debug!("Peer created [roomId:{}, peerId:{}]", self.id, peer_id);

        Ok(())
    }

    /// A peer announced its capabilities: mirror every ready producer of
    /// the other peers into it.
    pub fn peer_capabilities_set(&mut self, peer_id: u32, notifier: &mut Notifier) {
        let sources: Vec<(u32, u32)> = self
            .peers
            .iter()
            .filter(|(id, _)| **id != peer_id)
            .flat_map(|(id, peer)| {
                peer.producer_ids()
                    .into_iter()
                    .filter(|pid| {
                        peer.producer(*pid)
                            .map_or(false, |p| p.rtp_parameters().is_some())
                    })
                    .map(|pid| (*id, pid))
            })
            .collect();

        for (source_peer_id, producer_id) in sources {
            self.create_consumer(source_peer_id, producer_id, peer_id, notifier);
        }
    }

    /// A producer got (or updated) its parameters.
    pub fn producer_parameters_ready(
        &mut self,
        source_peer_id: u32,
        producer_id: u32,
        is_update: bool,
        notifier: &mut Notifier,
    ) {
        if is_update {
            // Existing consumers must resync to the new source parameters.
            let consumers: Vec<(u32, u32)> = self
                .fanout
                .get(&producer_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();

            for (peer_id, consumer_id) in consumers {
                if let Some(consumer) = self
                    .peers
                    .get_mut(&peer_id)
                    .and_then(|p| p.consumer_mut(consumer_id))
                {
                    consumer.source_rtp_parameters_updated();
                }
            }
            return;
        }

        self.fanout.entry(producer_id).or_default();
        self.producer_owner.insert(producer_id, source_peer_id);

        let targets: Vec<u32> = self
            .peers
            .iter()
            .filter(|(id, peer)| **id != source_peer_id && peer.has_capabilities())
            .map(|(id, _)| *id)
            .collect();

        for target_peer_id in targets {
            self.create_consumer(source_peer_id, producer_id, target_peer_id, notifier);
        }
    }

    /// Creates a consumer on `target_peer_id` mirroring the given producer.
    fn create_consumer(
        &mut self,
        source_peer_id: u32,
        producer_id: u32,
        target_peer_id: u32,
        notifier: &mut Notifier,
    ) {
        let Some(source_peer) = self.peers.get(&source_peer_id) else {
            return;
        };
        let Some(producer) = source_peer.producer(producer_id) else {
            return;
        };

        let kind = producer.kind();
        let profiles = producer.profiles();
        let source_parameters = producer.rtp_parameters().cloned();
        let source_peer_name = source_peer.name().to_string();

        let consumer_id = rand::thread_rng().gen_range(10_000_000..=99_999_999);

        let mut consumer = Consumer::new(consumer_id, kind, producer_id);
        for profile in profiles {
            if profile != Profile::None {
                consumer.add_profile(profile, notifier);
            }
        }

        let Some(target_peer) = self.peers.get_mut(&target_peer_id) else {
            return;
        };

        target_peer.add_consumer(consumer);
        self.fanout
            .entry(producer_id)
            .or_default()
            .insert((target_peer_id, consumer_id));

        debug!(
            "Consumer created [roomId:{}, peerId:{}, consumerId:{}, producerId:{}]",
            self.id, target_peer_id, consumer_id, producer_id
        );

        notifier.emit_with_data(
            target_peer_id,
            "newconsumer",
            json!({
                "consumerId": consumer_id,
                "sourceProducerId": producer_id,
                "kind": kind.to_string(),
                "sourcePeerName": source_peer_name,
                "rtpParameters": source_parameters
                    .map(|p| serde_json::to_value(p).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null),
            }),
        );
    }

    /// Producer paused/resumed: every mirroring consumer follows.
    pub fn producer_paused(&mut self, producer_id: u32, paused: bool, notifier: &mut Notifier) {
        let consumers: Vec<(u32, u32)> = self
            .fanout
            .get(&producer_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        for (peer_id, consumer_id) in consumers {
            if let Some(consumer) = self
                .peers
                .get_mut(&peer_id)
                .and_then(|p| p.consumer_mut(consumer_id))
            {
                if paused {
                    consumer.source_pause(notifier);
                } else {
                    consumer.source_resume(notifier);
                }
            }
        }
    }

    /// Closes every consumer sourcing from the producer, then forgets it.
    pub fn producer_closed(
        &mut self,
        source_peer_id: u32,
        producer_id: u32,
        notifier: &mut Notifier,
    ) -> Result<(), WorkerError> {
        let mut producer = self
            .peers
            .get_mut(&source_peer_id)
            .and_then(|p| p.remove_producer(producer_id))
            .ok_or_else(|| WorkerError::not_found("Producer does not exist"))?;

        // Snapshot: closing consumers mutates peers.
        let consumers: Vec<(u32, u32)> = self
            .fanout
            .remove(&producer_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for (peer_id, consumer_id) in consumers {
            if let Some(mut consumer) = self
                .peers
                .get_mut(&peer_id)
                .and_then(|p| p.remove_consumer(consumer_id))
            {
                consumer.close(notifier);
            }
        }

        self.producer_owner.remove(&producer_id);
        producer.close(notifier);

        Ok(())
    }

    /// Removes a closing consumer from every producer's set.
    pub fn consumer_closed(&mut self, peer_id: u32, consumer_id: u32, notifier: &mut Notifier) {
        if let Some(mut consumer) = self
            .peers
            .get_mut(&peer_id)
            .and_then(|p| p.remove_consumer(consumer_id))
        {
            consumer.close(notifier);
        }

        for set in self.fanout.values_mut() {
            set.retain(|(pid, cid)| !(*pid == peer_id && *cid == consumer_id));
        }
    }

    pub fn close_peer(&mut self, peer_id: u32, notifier: &mut Notifier) -> Result<(), WorkerError> {
        let Some(peer) = self.peers.get(&peer_id) else {
            return Err(WorkerError::not_found("Peer does not exist"));
        };

        // Producers first: each closes its fan-out consumers (possibly on
        // other peers).
        let producer_ids = peer.producer_ids();
        for producer_id in producer_ids {
            let _ = self.producer_closed(peer_id, producer_id, notifier);
        }

        let mut peer = self.peers.remove(&peer_id).expect("peer checked above");

        // Drop the peer's remaining consumers from all fan-out sets.
        for set in self.fanout.values_mut() {
            set.retain(|(pid, _)| *pid != peer_id);
        }

        peer.close(notifier);

        Ok(())
    }

    /// Incoming media for a peer: demux to its producer, fan out to every
    /// subscribed consumer.
    ///
    /// Consumers run strictly sequentially here; each one restores the
    /// packet before the next gets it.
    pub fn receive_rtp(&mut self, peer_id: u32, data: Vec<u8>, now_ms: u64) {
        if data.len() > crate::MTU_SIZE {
            trace!("ignoring oversized RTP packet [peerId:{}]", peer_id);
            return;
        }

        let Some(mut packet) = RtpPacket::parse(data) else {
            trace!("ignoring invalid RTP packet [peerId:{}]", peer_id);
            return;
        };

        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };

        let Some((producer_id, profile)) = peer.receive_rtp(&mut packet, now_ms) else {
            return;
        };

        let consumers: Vec<(u32, u32)> = self
            .fanout
            .get(&producer_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut full_frame_required = false;

        for (consumer_peer_id, consumer_id) in consumers {
            let Some(consumer_peer) = self.peers.get_mut(&consumer_peer_id) else {
                continue;
            };

            consumer_peer.forward_to_consumer(consumer_id, &mut packet, profile, now_ms);

            if let Some(consumer) = consumer_peer.consumer_mut(consumer_id) {
                full_frame_required |= consumer.take_full_frame_required();
            }
        }

        if full_frame_required {
            self.request_full_frame(producer_id);
        }
    }

    /// Incoming RTCP from a peer's transport.
    pub fn receive_rtcp(&mut self, peer_id: u32, data: &[u8], now_ms: u64) {
        let packets = Rtcp::parse_compound(data);

        for rtcp in packets {
            match rtcp {
                Rtcp::Nack(nack) => {
                    let Some(peer) = self.peers.get_mut(&peer_id) else {
                        continue;
                    };
                    let Some(consumer_id) =
                        peer.consumer_by_ssrc_mut(*nack.media_ssrc).map(|c| c.id())
                    else {
                        trace!("no consumer for nacked ssrc {}", nack.media_ssrc);
                        continue;
                    };
                    peer.consumer_receive_nack(consumer_id, &nack, now_ms);
                }

                Rtcp::Pli(pli) => {
                    self.full_frame_for_consumer_ssrc(peer_id, *pli.media_ssrc);
                }

                Rtcp::Fir(fir) => {
                    self.full_frame_for_consumer_ssrc(peer_id, *fir.media_ssrc);
                }

                Rtcp::SenderReport(sr) => {
                    // A sender report from the media source.
                    if let Some(peer) = self.peers.get_mut(&peer_id) {
                        for producer_id in peer.producer_ids() {
                            if let Some(producer) = peer.producer_mut(producer_id) {
                                producer.receive_rtcp_sender_report(&sr, now_ms);
                            }
                        }
                    }
                }

                Rtcp::ReceiverReport(reports) => {
                    if let Some(peer) = self.peers.get_mut(&peer_id) {
                        for report in reports {
                            if let Some(consumer) = peer.consumer_by_ssrc_mut(*report.ssrc) {
                                consumer.receive_rtcp_receiver_report(&report);
                            }
                        }
                    }
                }

                Rtcp::Bye(_) => {}
            }
        }
    }

    /// A subscriber asked for a key frame on one of its consumers.
    fn full_frame_for_consumer_ssrc(&mut self, peer_id: u32, ssrc: u32) {
        let producer_id = self
            .peers
            .get_mut(&peer_id)
            .and_then(|peer| peer.consumer_by_ssrc_mut(ssrc))
            .map(|consumer| consumer.source_producer_id());

        if let Some(producer_id) = producer_id {
            self.request_full_frame(producer_id);
        }
    }

    /// Routes a key frame request to the producer's owning peer.
    fn request_full_frame(&mut self, producer_id: u32) {
        let Some(owner_peer_id) = self.producer_owner.get(&producer_id).copied() else {
            return;
        };

        if let Some(peer) = self.peers.get_mut(&owner_peer_id) {
            peer.producer_request_full_frame(producer_id);
        }
    }

    /// Periodic RTCP for every peer.
    pub fn send_rtcp(&mut self, now_ms: u64) {
        for peer in self.peers.values_mut() {
            peer.send_rtcp(now_ms);
        }
    }

    /// Closes all peers (and through them all entities), then the room.
    pub fn close(&mut self, notifier: &mut Notifier) {
        let peer_ids: Vec<u32> = self.peers.keys().copied().collect();
        for peer_id in peer_ids {
            let _ = self.close_peer(peer_id, notifier);
        }

        debug!("Room closed [roomId:{}]", self.id);

        notifier.emit_with_data(self.id, "close", json!({ "class": "Room" }));
    }

    pub fn dump(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (producer_id, set) in &self.fanout {
            let consumers: Vec<String> = set
                .iter()
                .map(|(_, consumer_id)| consumer_id.to_string())
                .collect();
            map.insert(producer_id.to_string(), json!(consumers));
        }

        json!({
            "roomId": self.id,
            "capabilities": serde_json::to_value(&self.capabilities).unwrap_or(Value::Null),
            "peers": self.peers.values().map(|p| p.dump()).collect::<Vec<_>>(),
            "mapProducerConsumers": Value::Object(map),
        })
    }
}
