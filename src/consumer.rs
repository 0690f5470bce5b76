use std::collections::{BTreeSet, HashSet};

use rand::Rng;
use serde_json::{json, Value};

use crate::channel::Notifier;
use crate::codecs::{EncodingContext, Vp8Handler};
use crate::rtcp::{
    CompoundPacket, Nack, ReceptionReport, SdesChunk, MAX_AUDIO_INTERVAL_MS, MAX_VIDEO_INTERVAL_MS,
};
use crate::rtp::RtpPacket;
use crate::streams::{
    RtpDataCounter, RtpStreamSend, StreamParams, RETRANSMISSION_CONTAINER_SLOTS,
};
use crate::transport::Transport;
use crate::{MediaKind, Profile, RtpParameters, WorkerError};

/// Retransmission ring depth for video with NACK.
const NACK_BUFFER_SIZE: usize = 750;

/// The per-subscriber rewrite pipeline.
///
/// A Consumer mirrors one Producer towards one receiving peer. It owns the
/// outgoing stream state and keeps the emitted sequence numbers,
/// timestamps, SSRC and VP8 ids continuous across source pauses, profile
/// switches and parameter updates, so the subscriber never observes a
/// discontinuity it did not cause itself.
#[derive(Debug)]
pub struct Consumer {
    id: u32,
    kind: MediaKind,
    source_producer_id: u32,

    /// Set while enabled.
    transport_id: Option<u32>,
    rtp_parameters: Option<RtpParameters>,
    rtp_stream: Option<RtpStreamSend>,
    supported_codec_payload_types: HashSet<u8>,

    /// Outgoing sequence number, advanced per forwarded packet.
    seq_num: u16,
    /// Outgoing RTP timestamp.
    rtp_timestamp: u32,
    last_recv_seq_num: u16,
    last_recv_rtp_timestamp: u32,
    /// The next forwarded packet re-bases continuity.
    sync_required: bool,

    paused: bool,
    source_paused: bool,

    /// Simulcast tiers the source currently provides, ordered.
    profiles: BTreeSet<Profile>,
    preferred_profile: Profile,
    effective_profile: Profile,

    /// Codec rewrite state, present for codecs with descriptor handling.
    encoding_context: Option<EncodingContext>,

    max_rtcp_interval_ms: u64,
    last_rtcp_sent_ms: u64,

    transmitted_counter: RtpDataCounter,
    retransmitted_counter: RtpDataCounter,

    /// Scratch for answering NACKs, kept per consumer.
    retransmission_container: Vec<Option<RtpPacket>>,

    /// Set when a full frame should be requested from the source; the
    /// router drains this.
    full_frame_required: bool,
}

impl Consumer {
    pub fn new(id: u32, kind: MediaKind, source_producer_id: u32) -> Consumer {
        // Random initial sequence number, like any RTP sender.
        let seq_num = rand::thread_rng().gen_range(0x00ff..=0xffff);

        let max_rtcp_interval_ms = match kind {
            MediaKind::Audio => MAX_AUDIO_INTERVAL_MS,
            MediaKind::Video => MAX_VIDEO_INTERVAL_MS,
        };

        Consumer {
            id,
            kind,
            source_producer_id,
            transport_id: None,
            rtp_parameters: None,
            rtp_stream: None,
            supported_codec_payload_types: HashSet::new(),
            seq_num,
            rtp_timestamp: 0,
            last_recv_seq_num: 0,
            last_recv_rtp_timestamp: 0,
            sync_required: true,
            paused: false,
            source_paused: false,
            profiles: BTreeSet::from([Profile::None]),
            preferred_profile: Profile::None,
            effective_profile: Profile::None,
            encoding_context: None,
            max_rtcp_interval_ms,
            last_rtcp_sent_ms: 0,
            transmitted_counter: RtpDataCounter::default(),
            retransmitted_counter: RtpDataCounter::default(),
            retransmission_container: Vec::with_capacity(RETRANSMISSION_CONTAINER_SLOTS),
            full_frame_required: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn source_producer_id(&self) -> u32 {
        self.source_producer_id
    }

    pub fn transport_id(&self) -> Option<u32> {
        self.transport_id
    }

    pub fn is_enabled(&self) -> bool {
        self.transport_id.is_some() && self.rtp_stream.is_some() && self.rtp_parameters.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused || self.source_paused
    }

    pub fn effective_profile(&self) -> Profile {
        self.effective_profile
    }

    /// The SSRC this consumer emits under, once enabled.
    pub fn outgoing_ssrc(&self) -> Option<u32> {
        self.rtp_parameters
            .as_ref()
            .and_then(|p| p.encodings.first())
            .map(|e| e.ssrc)
    }

    /// A transport was assigned, with the sending RTP parameters.
    pub fn enable(
        &mut self,
        transport_id: u32,
        rtp_parameters: RtpParameters,
    ) -> Result<(), WorkerError> {
        let Some(encoding) = rtp_parameters.encodings.first() else {
            return Err(WorkerError::protocol(
                "invalid empty rtpParameters.encodings",
            ));
        };
        if encoding.ssrc == 0 {
            return Err(WorkerError::protocol(
                "missing rtpParameters.encodings[0].ssrc",
            ));
        }

        if self.is_enabled() {
            self.disable();
        }

        let codec = rtp_parameters.codec_for_encoding(encoding)?;

        let params = StreamParams {
            ssrc: encoding.ssrc.into(),
            payload_type: codec.payload_type.into(),
            mime: codec.name.clone(),
            clock_rate: codec.clock_rate,
            use_nack: codec.nack_supported(),
            use_pli: codec.pli_supported(),
        };

        let buffer_size = if params.use_nack { NACK_BUFFER_SIZE } else { 0 };
        let mut rtp_stream = RtpStreamSend::new(params, buffer_size);

        if let Some(rtx) = encoding.rtx.filter(|rtx| rtx.ssrc != 0) {
            if let Some(rtx_codec) = rtp_parameters.rtx_codec_for_encoding(encoding) {
                rtp_stream.set_rtx(rtx_codec.payload_type.into(), rtx.ssrc.into());
            }
        }

        self.supported_codec_payload_types = rtp_parameters
            .codecs
            .iter()
            .map(|c| c.payload_type)
            .collect();

        let mut context = EncodingContext::for_mime(&codec.name);
        if let Some(ctx) = context.as_mut() {
            ctx.set_target_temporal_layer(self.preferred_profile.temporal_layer());
        }

        self.encoding_context = context;
        self.rtp_stream = Some(rtp_stream);
        self.rtp_parameters = Some(rtp_parameters);
        self.transport_id = Some(transport_id);
        self.sync_required = true;

        debug!("Consumer enabled [consumerId:{}]", self.id);

        Ok(())
    }

    /// The transport went away; the consumer stays but forwards nothing.
    pub fn disable(&mut self) {
        self.transport_id = None;
        self.supported_codec_payload_types.clear();
        self.rtp_stream = None;
        self.encoding_context = None;

        self.last_rtcp_sent_ms = 0;
        self.transmitted_counter.reset();
        self.retransmitted_counter.reset();
    }

    pub fn pause(&mut self) {
        if self.paused {
            return;
        }

        self.paused = true;

        debug!("Consumer paused [consumerId:{}]", self.id);

        if self.is_enabled() && !self.source_paused {
            if let Some(stream) = self.rtp_stream.as_mut() {
                stream.clear_retransmission_buffer();
            }
        }
    }

    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }

        self.paused = false;

        debug!("Consumer resumed [consumerId:{}]", self.id);

        if self.is_enabled() && !self.source_paused {
            self.request_full_frame();
        }
    }

    pub fn source_pause(&mut self, notifier: &mut Notifier) {
        if self.source_paused {
            return;
        }

        self.source_paused = true;

        debug!("Consumer source paused [consumerId:{}]", self.id);

        notifier.emit(self.id, "sourcepaused");

        if self.is_enabled() && !self.paused {
            if let Some(stream) = self.rtp_stream.as_mut() {
                stream.clear_retransmission_buffer();
            }
        }
    }

    pub fn source_resume(&mut self, notifier: &mut Notifier) {
        if !self.source_paused {
            return;
        }

        self.source_paused = false;

        debug!("Consumer source resumed [consumerId:{}]", self.id);

        notifier.emit(self.id, "sourceresumed");

        if self.is_enabled() && !self.paused {
            self.request_full_frame();
        }
    }

    /// The source announced new RTP parameters; continuity must re-base.
    pub fn source_rtp_parameters_updated(&mut self) {
        if !self.is_enabled() {
            return;
        }

        self.set_sync_required();

        if let Some(stream) = self.rtp_stream.as_mut() {
            stream.clear_retransmission_buffer();
        }
    }

    pub fn add_profile(&mut self, profile: Profile, notifier: &mut Notifier) {
        // The first real profile replaces the None sentinel.
        if self.profiles.len() == 1 && self.profiles.contains(&Profile::None) {
            self.profiles.clear();
        }

        self.profiles.insert(profile);

        debug!("profile added [consumerId:{}, profile:{}]", self.id, profile);

        self.recalculate_effective_profile(notifier);
    }

    pub fn remove_profile(&mut self, profile: Profile, notifier: &mut Notifier) {
        self.profiles.remove(&profile);

        debug!(
            "profile removed [consumerId:{}, profile:{}]",
            self.id, profile
        );

        self.recalculate_effective_profile(notifier);
    }

    pub fn set_preferred_profile(&mut self, profile: Profile, notifier: &mut Notifier) {
        if self.preferred_profile == profile {
            return;
        }

        self.preferred_profile = profile;

        if let Some(ctx) = self.encoding_context.as_mut() {
            ctx.set_target_temporal_layer(profile.temporal_layer());
        }

        self.recalculate_effective_profile(notifier);
    }

    fn recalculate_effective_profile(&mut self, notifier: &mut Notifier) {
        // Best available, or the best not above the preference.
        let new_profile = if self.preferred_profile == Profile::None {
            self.profiles.iter().next_back().copied()
        } else {
            self.profiles
                .range(..=self.preferred_profile)
                .next_back()
                .copied()
                .or_else(|| self.profiles.iter().next().copied())
        }
        .unwrap_or(Profile::None);

        if new_profile == self.effective_profile {
            return;
        }

        self.effective_profile = new_profile;

        debug!(
            "new effective profile [consumerId:{}, profile:{}]",
            self.id, self.effective_profile
        );

        notifier.emit_with_data(
            self.id,
            "effectiveprofilechange",
            json!({ "profile": self.effective_profile.as_str() }),
        );

        if self.is_enabled() && !self.is_paused() {
            if let Some(stream) = self.rtp_stream.as_mut() {
                stream.clear_retransmission_buffer();
            }

            self.request_full_frame();
        }

        self.set_sync_required();
    }

    fn set_sync_required(&mut self) {
        self.sync_required = true;

        if let Some(ctx) = self.encoding_context.as_mut() {
            ctx.set_sync_required();
        }
    }

    /// Forwards one packet from the source, rewriting it in place.
    ///
    /// The packet is restored to its original header and payload before
    /// returning, so the caller can hand the same packet to the next
    /// consumer.
    pub fn send_rtp_packet(
        &mut self,
        packet: &mut RtpPacket,
        profile: Profile,
        transport: Option<&mut Transport>,
        now_ms: u64,
    ) {
        if !self.is_enabled() || self.is_paused() {
            return;
        }

        let Some(transport) = transport else {
            return;
        };

        // This consumer may support just a subset of the source codecs.
        if !self
            .supported_codec_payload_types
            .contains(&*packet.payload_type())
        {
            trace!(
                "payload type not supported [payloadType:{}]",
                packet.payload_type()
            );
            return;
        }

        // Simulcast: only the effective tier flows.
        if profile != self.effective_profile {
            return;
        }

        let prev_seq_num = self.seq_num;
        let prev_rtp_timestamp = self.rtp_timestamp;

        if self.sync_required {
            self.seq_num = self.seq_num.wrapping_add(1);

            let now = now_ms as u32;
            if now > self.rtp_timestamp {
                self.rtp_timestamp = now;
            }
        } else {
            self.seq_num = self
                .seq_num
                .wrapping_add(packet.sequence_number().wrapping_sub(self.last_recv_seq_num));
            self.rtp_timestamp = self
                .rtp_timestamp
                .wrapping_add(packet.timestamp().wrapping_sub(self.last_recv_rtp_timestamp));
        }

        let original_seq = packet.sequence_number();
        let original_timestamp = packet.timestamp();
        let original_ssrc = packet.ssrc();

        self.last_recv_seq_num = original_seq;
        self.last_recv_rtp_timestamp = original_timestamp;

        let out_ssrc = self
            .rtp_parameters
            .as_ref()
            .and_then(|p| p.encodings.first())
            .map(|e| e.ssrc)
            .unwrap_or(0);

        packet.set_ssrc(out_ssrc.into());
        packet.set_sequence_number(self.seq_num);
        packet.set_timestamp(self.rtp_timestamp);

        // Codec specific payload rewrite. A drop rolls the continuity
        // counters back so no output slot is wasted on this packet.
        let handler = match self.encoding_context.as_mut() {
            Some(EncodingContext::Vp8(ctx)) => {
                let handler = Vp8Handler::parse(packet.payload());
                let forward = handler
                    .as_ref()
                    .map(|h| h.process(ctx, packet.payload_mut()))
                    .unwrap_or(false);

                if !forward {
                    self.seq_num = prev_seq_num;
                    self.rtp_timestamp = prev_rtp_timestamp;

                    packet.set_ssrc(original_ssrc);
                    packet.set_sequence_number(original_seq);
                    packet.set_timestamp(original_timestamp);
                    return;
                }

                handler
            }
            None => None,
        };

        self.sync_required = false;

        let stream = self
            .rtp_stream
            .as_mut()
            .expect("enabled consumer has a stream");

        if stream.receive_packet(packet, now_ms) {
            transport.send_rtp_packet(packet);
            self.transmitted_counter.update(packet);
        } else {
            warn!(
                "send stream rejected packet [consumerId:{}, seq:{}]",
                self.id, self.seq_num
            );
        }

        // Put the packet back the way it came.
        if let Some(handler) = handler {
            handler.restore(packet.payload_mut());
        }
        packet.set_ssrc(original_ssrc);
        packet.set_sequence_number(original_seq);
        packet.set_timestamp(original_timestamp);
    }

    /// Answers a NACK from the subscriber with retransmissions.
    pub fn receive_nack(
        &mut self,
        nack: &Nack,
        transport: Option<&mut Transport>,
        now_ms: u64,
    ) {
        if !self.is_enabled() {
            return;
        }

        let Some(transport) = transport else {
            return;
        };

        let Some(stream) = self.rtp_stream.as_mut() else {
            return;
        };

        for item in &nack.items {
            stream.request_retransmission(
                item.pid,
                item.blp,
                now_ms,
                &mut self.retransmission_container,
            );

            for slot in &self.retransmission_container {
                let Some(packet) = slot else {
                    // First hole terminates the batch.
                    break;
                };

                // RTX encode into a scratch clone; the buffer keeps the
                // plain packet.
                let mut rtx_packet = packet.clone();
                if stream.has_rtx() {
                    stream.rtx_encode(&mut rtx_packet);

                    debug!(
                        "sending rtx packet [ssrc:{}, seq:{}] recovering original [seq:{}]",
                        rtx_packet.ssrc(),
                        rtx_packet.sequence_number(),
                        packet.sequence_number(),
                    );
                } else {
                    debug!(
                        "retransmitting packet [ssrc:{}, seq:{}]",
                        rtx_packet.ssrc(),
                        rtx_packet.sequence_number()
                    );
                }

                self.retransmitted_counter.update(&rtx_packet);
                transport.send_rtp_packet(&rtx_packet);
            }
        }
    }

    pub fn receive_rtcp_receiver_report(&mut self, report: &ReceptionReport) {
        if let Some(stream) = self.rtp_stream.as_mut() {
            stream.receive_receiver_report(report);
        }
    }

    /// Contributes SR + SDES to the outgoing compound, rate limited per
    /// kind.
    pub fn get_rtcp(&mut self, compound: &mut CompoundPacket, now_ms: u64) {
        if !self.is_enabled() {
            return;
        }

        // 1.15 headroom keeps the nominal rate under the cap.
        let elapsed = now_ms.saturating_sub(self.last_rtcp_sent_ms);
        if (elapsed as f64 * 1.15) < self.max_rtcp_interval_ms as f64 {
            return;
        }

        let Some(stream) = self.rtp_stream.as_mut() else {
            return;
        };

        let Some(report) = stream.sender_report(now_ms) else {
            return;
        };

        let params = self.rtp_parameters.as_ref().expect("enabled consumer");
        let ssrc = report.ssrc;
        let cname = params.rtcp.cname.clone();

        compound.add_sender_report(report);
        compound.add_sdes_chunk(SdesChunk { ssrc, cname });

        self.last_rtcp_sent_ms = now_ms;
    }

    /// Asks the source for a decodable point (key frame), unless audio.
    pub fn request_full_frame(&mut self) {
        if !self.is_enabled() {
            return;
        }

        if self.kind == MediaKind::Audio || self.is_paused() {
            return;
        }

        self.full_frame_required = true;
    }

    /// Router side: collects and clears the pending full-frame request.
    pub fn take_full_frame_required(&mut self) -> bool {
        std::mem::take(&mut self.full_frame_required)
    }

    pub fn close(&mut self, notifier: &mut Notifier) {
        debug!("Consumer closed [consumerId:{}]", self.id);

        notifier.emit(self.id, "close");
    }

    pub fn dump(&self) -> Value {
        let mut json = json!({
            "consumerId": self.id,
            "kind": self.kind.to_string(),
            "sourceProducerId": self.source_producer_id,
            "paused": self.paused,
            "sourcePaused": self.source_paused,
            "preferredProfile": self.preferred_profile.as_str(),
            "effectiveProfile": self.effective_profile.as_str(),
            "transmitted": {
                "packets": self.transmitted_counter.packets(),
                "bytes": self.transmitted_counter.bytes(),
            },
            "retransmitted": {
                "packets": self.retransmitted_counter.packets(),
                "bytes": self.retransmitted_counter.bytes(),
            },
        });

        if let Some(params) = &self.rtp_parameters {
            if self.is_enabled() {
                json["rtpParameters"] = serde_json::to_value(params).unwrap_or(Value::Null);
            }
        }

        json
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn video_parameters(ssrc: u32) -> RtpParameters {
        serde_json::from_value(json!({
            "codecs": [
                {
                    "name": "video/VP8",
                    "payloadType": 101,
                    "clockRate": 90000,
                    "rtcpFeedback": [
                        { "type": "nack" },
                        { "type": "nack", "parameter": "pli" }
                    ]
                }
            ],
            "encodings": [ { "ssrc": ssrc } ],
            "rtcp": { "cname": "consumer-cname" }
        }))
        .unwrap()
    }

    fn opus_parameters(ssrc: u32) -> RtpParameters {
        serde_json::from_value(json!({
            "codecs": [
                { "name": "audio/opus", "payloadType": 100, "clockRate": 48000 }
            ],
            "encodings": [ { "ssrc": ssrc } ]
        }))
        .unwrap()
    }

    fn media_packet(seq: u16, ts: u32, pt: u8) -> RtpPacket {
        let mut buf = vec![0x80, pt, 0, 0, 0, 0, 0, 0, 0, 0, 0, 9];
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        // Plain VP8 descriptor (not extended) + payload header byte.
        buf.extend_from_slice(&[0x10, 0x01, 0xaa]);
        RtpPacket::parse(buf).unwrap()
    }

    fn enabled_consumer(kind: MediaKind) -> (Consumer, Transport) {
        let mut consumer = Consumer::new(20, kind, 10);
        let params = match kind {
            MediaKind::Video => video_parameters(5555),
            MediaKind::Audio => opus_parameters(5555),
        };
        consumer.enable(1, params).unwrap();
        let transport = Transport::new(1, &Value::Null);
        (consumer, transport)
    }

    fn sent_rtp(transport: &mut Transport) -> Vec<RtpPacket> {
        let mut out = Vec::new();
        while let Some(t) = transport.poll_transmit() {
            if let crate::transport::Transmit::Rtp(bytes) = t {
                out.push(RtpPacket::parse(bytes).unwrap());
            }
        }
        out
    }

    #[test]
    fn enable_requires_ssrc() {
        let mut consumer = Consumer::new(1, MediaKind::Video, 10);

        let empty: RtpParameters = serde_json::from_value(json!({ "codecs": [] })).unwrap();
        assert!(consumer.enable(1, empty).is_err());

        assert!(consumer.enable(1, video_parameters(0)).is_err());
        assert!(!consumer.is_enabled());

        assert!(consumer.enable(1, video_parameters(5555)).is_ok());
        assert!(consumer.is_enabled());
    }

    #[test]
    fn forwards_with_rewritten_header_and_restores() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        let mut packet = media_packet(1000, 50_000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1_000);

        // The caller's packet is untouched afterwards.
        assert_eq!(packet.sequence_number(), 1000);
        assert_eq!(packet.timestamp(), 50_000);
        assert_eq!(*packet.ssrc(), 9);

        let sent = sent_rtp(&mut transport);
        assert_eq!(sent.len(), 1);
        assert_eq!(*sent[0].ssrc(), 5555);
    }

    #[test]
    fn consecutive_packets_are_contiguous() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        let mut packet = media_packet(1000, 50_000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1_000);
        let mut packet = media_packet(1001, 53_000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1_033);
        let mut packet = media_packet(1002, 56_000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1_066);

        let sent = sent_rtp(&mut transport);
        assert_eq!(sent.len(), 3);
        let s0 = sent[0].sequence_number();
        assert_eq!(sent[1].sequence_number(), s0.wrapping_add(1));
        assert_eq!(sent[2].sequence_number(), s0.wrapping_add(2));

        let t0 = sent[0].timestamp();
        assert_eq!(sent[1].timestamp(), t0.wrapping_add(3_000));
        assert_eq!(sent[2].timestamp(), t0.wrapping_add(6_000));
    }

    #[test]
    fn input_seq_wraparound_stays_contiguous() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        let mut packet = media_packet(65_535, 1000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1);
        let mut packet = media_packet(0, 2000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 2);

        let sent = sent_rtp(&mut transport);
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1].sequence_number(),
            sent[0].sequence_number().wrapping_add(1)
        );
    }

    #[test]
    fn unsupported_payload_type_is_dropped() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        let mut packet = media_packet(1, 1, 77);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1);

        assert!(sent_rtp(&mut transport).is_empty());
    }

    #[test]
    fn wrong_profile_is_dropped() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        let mut packet = media_packet(1, 1, 101);
        consumer.send_rtp_packet(&mut packet, Profile::High, Some(&mut transport), 1);

        assert!(sent_rtp(&mut transport).is_empty());
    }

    #[test]
    fn pause_and_resume_are_idempotent() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        consumer.pause();
        consumer.pause();
        assert!(consumer.is_paused());

        let mut packet = media_packet(1, 1, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1);
        assert!(sent_rtp(&mut transport).is_empty());

        consumer.resume();
        consumer.resume();
        assert!(!consumer.is_paused());
    }

    #[test]
    fn source_pause_emits_notification() {
        let (mut consumer, _transport) = enabled_consumer(MediaKind::Video);
        let mut notifier = Notifier::new();

        consumer.source_pause(&mut notifier);
        let n = notifier.poll_notification().unwrap();
        assert_eq!(n.event, "sourcepaused");
        assert_eq!(n.target_id, 20);

        consumer.source_resume(&mut notifier);
        let n = notifier.poll_notification().unwrap();
        assert_eq!(n.event, "sourceresumed");
    }

    #[test]
    fn source_update_resyncs_output() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        let mut packet = media_packet(1000, 10_000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1_000);

        consumer.source_rtp_parameters_updated();

        // Wildly different input seq: output continues at prev + 1.
        let mut packet = media_packet(30_000, 90_000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1_033);

        let sent = sent_rtp(&mut transport);
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1].sequence_number(),
            sent[0].sequence_number().wrapping_add(1)
        );
    }

    #[test]
    fn profile_machinery_recalculates() {
        let (mut consumer, _transport) = enabled_consumer(MediaKind::Video);
        let mut notifier = Notifier::new();

        consumer.add_profile(Profile::Low, &mut notifier);
        consumer.add_profile(Profile::Medium, &mut notifier);
        consumer.add_profile(Profile::High, &mut notifier);

        // No preference: the best wins.
        assert_eq!(consumer.effective_profile(), Profile::High);

        consumer.set_preferred_profile(Profile::Medium, &mut notifier);
        assert_eq!(consumer.effective_profile(), Profile::Medium);

        // The last change notification carries the new profile.
        let mut last = None;
        while let Some(n) = notifier.poll_notification() {
            if n.event == "effectiveprofilechange" {
                last = Some(n);
            }
        }
        assert_eq!(last.unwrap().data["profile"], "medium");

        consumer.remove_profile(Profile::Medium, &mut notifier);
        assert_eq!(consumer.effective_profile(), Profile::Low);
    }

    #[test]
    fn profile_switch_resyncs_sequence() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);
        let mut notifier = Notifier::new();

        consumer.add_profile(Profile::Low, &mut notifier);
        consumer.add_profile(Profile::High, &mut notifier);
        assert_eq!(consumer.effective_profile(), Profile::High);

        let mut packet = media_packet(100, 1000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::High, Some(&mut transport), 1);
        let mut packet = media_packet(101, 2000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::High, Some(&mut transport), 2);

        consumer.set_preferred_profile(Profile::Low, &mut notifier);
        assert_eq!(consumer.effective_profile(), Profile::Low);

        // The low tier has its own, unrelated sequence space.
        let mut packet = media_packet(9_000, 500_000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::Low, Some(&mut transport), 3);

        let sent = sent_rtp(&mut transport);
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[2].sequence_number(),
            sent[1].sequence_number().wrapping_add(1)
        );
    }

    #[test]
    fn nack_triggers_retransmission() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        for i in 0..21u16 {
            let mut packet = media_packet(100 + i, 1000 + i as u32 * 100, 101);
            consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), i as u64);
        }
        let sent = sent_rtp(&mut transport);
        assert_eq!(sent.len(), 21);

        // Ask for output seqs corresponding to inputs 105..=107.
        let base = sent[5].sequence_number();
        let nack = Nack {
            sender_ssrc: 0.into(),
            media_ssrc: 5555.into(),
            items: vec![crate::rtcp::NackItem { pid: base, blp: 0b11 }],
        };
        consumer.receive_nack(&nack, Some(&mut transport), 99);

        let resent = sent_rtp(&mut transport);
        assert_eq!(resent.len(), 3);
        for (i, p) in resent.iter().enumerate() {
            assert_eq!(p.sequence_number(), base.wrapping_add(i as u16));
            assert_eq!(*p.ssrc(), 5555);
        }
    }

    #[test]
    fn audio_has_no_retransmission() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Audio);

        let mut packet = media_packet(10, 100, 100);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1);
        assert_eq!(sent_rtp(&mut transport).len(), 1);

        let nack = Nack {
            sender_ssrc: 0.into(),
            media_ssrc: 5555.into(),
            items: vec![crate::rtcp::NackItem {
                pid: packet.sequence_number(),
                blp: 0,
            }],
        };
        consumer.receive_nack(&nack, Some(&mut transport), 2);
        assert!(sent_rtp(&mut transport).is_empty());
    }

    #[test]
    fn rtcp_interval_is_gated() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        let mut packet = media_packet(1, 1000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 10_000);

        let mut compound = CompoundPacket::new();
        consumer.get_rtcp(&mut compound, 10_100);
        assert!(!compound.is_empty());

        // Too soon for another.
        let mut compound = CompoundPacket::new();
        consumer.get_rtcp(&mut compound, 10_200);
        assert!(compound.is_empty());

        // After the interval (and new traffic), reports flow again.
        let mut packet = media_packet(2, 2000, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 11_000);
        let mut compound = CompoundPacket::new();
        consumer.get_rtcp(&mut compound, 11_200);
        assert!(!compound.is_empty());
    }

    #[test]
    fn disable_clears_state() {
        let (mut consumer, mut transport) = enabled_consumer(MediaKind::Video);

        consumer.disable();
        assert!(!consumer.is_enabled());

        let mut packet = media_packet(1, 1, 101);
        consumer.send_rtp_packet(&mut packet, Profile::None, Some(&mut transport), 1);
        assert!(sent_rtp(&mut transport).is_empty());
    }
}
