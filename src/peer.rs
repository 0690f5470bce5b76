use std::collections::HashMap;

use serde_json::{json, Value};

use crate::channel::Notifier;
use crate::consumer::Consumer;
use crate::producer::Producer;
use crate::rtcp::CompoundPacket;
use crate::rtp::RtpPacket;
use crate::transport::Transport;
use crate::{MediaKind, Profile, RtpCapabilities, WorkerError};

/// A participant in a room.
///
/// Owns its transports, producers and consumers. The room holds the
/// fan-out relations between producers and consumers across peers; the
/// peer only owns the entities themselves.
#[derive(Debug)]
pub struct Peer {
    id: u32,
    name: String,
    capabilities: Option<RtpCapabilities>,

    transports: HashMap<u32, Transport>,
    producers: HashMap<u32, Producer>,
    consumers: HashMap<u32, Consumer>,
}

impl Peer {
    pub fn new(id: u32, name: String) -> Peer {
        Peer {
            id,
            name,
            capabilities: None,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_capabilities(&self) -> bool {
        self.capabilities.is_some()
    }

    /// Capabilities are set once and frozen.
    pub fn set_capabilities(&mut self, capabilities: RtpCapabilities) -> Result<(), WorkerError> {
        if self.capabilities.is_some() {
            return Err(WorkerError::conflict("Peer capabilities already set"));
        }

        self.capabilities = Some(capabilities);

        Ok(())
    }

    pub fn create_transport(&mut self, id: u32, options: &Value) -> Result<(), WorkerError> {
        if self.transports.contains_key(&id) {
            return Err(WorkerError::conflict("Transport already exists"));
        }

        self.transports.insert(id, Transport::new(id, options));

        debug!("Transport created [peerId:{}, transportId:{}]", self.id, id);

        Ok(())
    }

    pub fn create_producer(
        &mut self,
        id: u32,
        kind: MediaKind,
        transport_id: Option<u32>,
    ) -> Result<(), WorkerError> {
        if self.producers.contains_key(&id) {
            return Err(WorkerError::conflict("Producer already exists"));
        }

        if let Some(transport_id) = transport_id {
            if !self.transports.contains_key(&transport_id) {
                return Err(WorkerError::not_found("Transport does not exist"));
            }
        }

        self.producers.insert(id, Producer::new(id, kind, transport_id));

        debug!("Producer created [peerId:{}, producerId:{}]", self.id, id);

        Ok(())
    }

    /// Registers a router-created consumer with this (receiving) peer.
    pub fn add_consumer(&mut self, consumer: Consumer) {
        self.consumers.insert(consumer.id(), consumer);
    }

    pub fn transport(&self, id: u32) -> Option<&Transport> {
        self.transports.get(&id)
    }

    pub fn transport_mut(&mut self, id: u32) -> Option<&mut Transport> {
        self.transports.get_mut(&id)
    }

    pub fn producer(&self, id: u32) -> Option<&Producer> {
        self.producers.get(&id)
    }

    pub fn producer_mut(&mut self, id: u32) -> Option<&mut Producer> {
        self.producers.get_mut(&id)
    }

    pub fn producer_ids(&self) -> Vec<u32> {
        self.producers.keys().copied().collect()
    }

    pub fn consumer(&self, id: u32) -> Option<&Consumer> {
        self.consumers.get(&id)
    }

    pub fn consumer_mut(&mut self, id: u32) -> Option<&mut Consumer> {
        self.consumers.get_mut(&id)
    }

    pub fn transports_mut(&mut self) -> impl Iterator<Item = &mut Transport> {
        self.transports.values_mut()
    }

    /// Finds the producer owning an incoming SSRC and hands it the packet.
    /// Returns the producer id and matched profile when the packet should
    /// fan out.
    pub fn receive_rtp(
        &mut self,
        packet: &mut RtpPacket,
        now_ms: u64,
    ) -> Option<(u32, Profile)> {
        let producer = self
            .producers
            .values_mut()
            .find(|p| p.rtp_parameters().map_or(false, |params| {
                params.encodings.iter().any(|e| e.ssrc == *packet.ssrc())
            }))?;

        let transport = producer
            .transport_id()
            .and_then(|id| self.transports.get_mut(&id));

        let profile = producer.receive_rtp_packet(packet, now_ms, transport)?;

        Some((producer.id(), profile))
    }

    /// Hands one packet to one of this peer's consumers, with its bound
    /// transport.
    pub fn forward_to_consumer(
        &mut self,
        consumer_id: u32,
        packet: &mut RtpPacket,
        profile: Profile,
        now_ms: u64,
    ) {
        let Some(consumer) = self.consumers.get_mut(&consumer_id) else {
            return;
        };

        let transport = consumer
            .transport_id()
            .and_then(|id| self.transports.get_mut(&id));

        consumer.send_rtp_packet(packet, profile, transport, now_ms);
    }

    /// The consumer emitting under the given SSRC, if any.
    pub fn consumer_by_ssrc_mut(&mut self, ssrc: u32) -> Option<&mut Consumer> {
        self.consumers
            .values_mut()
            .find(|c| c.outgoing_ssrc() == Some(ssrc))
    }

    /// Answers a NACK for one consumer, resolving its transport.
    pub fn consumer_receive_nack(
        &mut self,
        consumer_id: u32,
        nack: &crate::rtcp::Nack,
        now_ms: u64,
    ) {
        let Some(consumer) = self.consumers.get_mut(&consumer_id) else {
            return;
        };

        let transport = consumer
            .transport_id()
            .and_then(|id| self.transports.get_mut(&id));

        consumer.receive_nack(nack, transport, now_ms);
    }

    /// Requests a key frame from one producer, out its own transport.
    pub fn producer_request_full_frame(&mut self, producer_id: u32) {
        let Some(producer) = self.producers.get_mut(&producer_id) else {
            return;
        };

        let transport = producer
            .transport_id()
            .and_then(|id| self.transports.get_mut(&id));

        producer.request_full_frame(transport);
    }

    /// Closing a transport unbinds the producers bound to it and disables
    /// its consumers.
    pub fn close_transport(&mut self, transport_id: u32) -> Result<(), WorkerError> {
        if self.transports.remove(&transport_id).is_none() {
            return Err(WorkerError::not_found("Transport does not exist"));
        }

        for producer in self.producers.values_mut() {
            if producer.transport_id() == Some(transport_id) {
                producer.unbind_transport();
            }
        }

        for consumer in self.consumers.values_mut() {
            if consumer.transport_id() == Some(transport_id) {
                consumer.disable();
            }
        }

        debug!(
            "Transport closed [peerId:{}, transportId:{}]",
            self.id, transport_id
        );

        Ok(())
    }

    /// Removes one producer (does not touch the room's fan-out; the room
    /// drives this).
    pub fn remove_producer(&mut self, producer_id: u32) -> Option<Producer> {
        self.producers.remove(&producer_id)
    }

    pub fn remove_consumer(&mut self, consumer_id: u32) -> Option<Consumer> {
        self.consumers.remove(&consumer_id)
    }

    /// Periodic RTCP: per transport, one compound with the consumers' SRs
    /// and the producers' RRs.
    pub fn send_rtcp(&mut self, now_ms: u64) {
        for (transport_id, transport) in &mut self.transports {
            let mut compound = CompoundPacket::new();

            for consumer in self.consumers.values_mut() {
                if consumer.transport_id() == Some(*transport_id) {
                    consumer.get_rtcp(&mut compound, now_ms);
                }
            }

            for producer in self.producers.values_mut() {
                if producer.transport_id() == Some(*transport_id) {
                    producer.get_rtcp(&mut compound, now_ms);
                }
            }

            if !compound.is_empty() {
                transport.send_rtcp(compound.to_bytes());
            }
        }
    }

    /// Closes every owned entity, emitting their close events, then the
    /// peer's own.
    pub fn close(&mut self, notifier: &mut Notifier) {
        for (_, mut producer) in self.producers.drain() {
            producer.close(notifier);
        }
        for (_, mut consumer) in self.consumers.drain() {
            consumer.close(notifier);
        }
        self.transports.clear();

        debug!("Peer closed [peerId:{}]", self.id);

        notifier.emit(self.id, "close");
    }

    pub fn dump(&self) -> Value {
        json!({
            "peerId": self.id,
            "peerName": self.name,
            "hasCapabilities": self.capabilities.is_some(),
            "transports": self.transports.values().map(|t| t.dump()).collect::<Vec<_>>(),
            "producers": self.producers.values().map(|p| p.dump()).collect::<Vec<_>>(),
            "consumers": self.consumers.values().map(|c| c.dump()).collect::<Vec<_>>(),
        })
    }
}
