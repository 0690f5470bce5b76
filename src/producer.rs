use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::channel::Notifier;
use crate::codecs;
use crate::rtcp::{
    CompoundPacket, Fir, Pli, SenderReport, MAX_AUDIO_INTERVAL_MS, MAX_VIDEO_INTERVAL_MS,
};
use crate::rtp::RtpPacket;
use crate::streams::{RtpStreamRecv, StreamParams};
use crate::transport::Transport;
use crate::{MediaKind, Profile, RtpParameters, WorkerError};

/// An incoming media source.
///
/// Owns the receive side state of every encoding (one per simulcast tier)
/// and demuxes arriving RTP onto them by SSRC. Accepted packets are handed
/// back to the router together with the encoding's profile, for fan-out to
/// the subscribed consumers.
#[derive(Debug)]
pub struct Producer {
    id: u32,
    kind: MediaKind,
    transport_id: Option<u32>,
    rtp_parameters: Option<RtpParameters>,

    /// Receive stream per encoding, keyed by SSRC.
    streams: HashMap<u32, RtpStreamRecv>,
    /// Simulcast tier per SSRC.
    profiles_by_ssrc: HashMap<u32, Profile>,
    known_payload_types: HashSet<u8>,

    paused: bool,

    max_rtcp_interval_ms: u64,
    last_rtcp_sent_ms: u64,

    /// FIR request counter, when PLI is not negotiated.
    fir_seq_nr: u8,
}

impl Producer {
    pub fn new(id: u32, kind: MediaKind, transport_id: Option<u32>) -> Producer {
        let max_rtcp_interval_ms = match kind {
            MediaKind::Audio => MAX_AUDIO_INTERVAL_MS,
            MediaKind::Video => MAX_VIDEO_INTERVAL_MS,
        };

        Producer {
            id,
            kind,
            transport_id,
            rtp_parameters: None,
            streams: HashMap::new(),
            profiles_by_ssrc: HashMap::new(),
            known_payload_types: HashSet::new(),
            paused: false,
            max_rtcp_interval_ms,
            last_rtcp_sent_ms: 0,
            fir_seq_nr: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn transport_id(&self) -> Option<u32> {
        self.transport_id
    }

    /// The bound transport went away; outgoing feedback has nowhere to go
    /// until another one is assigned.
    pub fn unbind_transport(&mut self) {
        self.transport_id = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn rtp_parameters(&self) -> Option<&RtpParameters> {
        self.rtp_parameters.as_ref()
    }

    /// The simulcast tiers this source provides.
    pub fn profiles(&self) -> Vec<Profile> {
        let mut profiles: Vec<Profile> = self.profiles_by_ssrc.values().copied().collect();
        profiles.sort();
        profiles.dedup();
        profiles
    }

    /// RTP parameters arrive (or change) via `producer.receive`. Returns
    /// whether this was an update of previously known parameters.
    pub fn receive(&mut self, rtp_parameters: RtpParameters) -> Result<bool, WorkerError> {
        if rtp_parameters.codecs.is_empty() {
            return Err(WorkerError::protocol("rtpParameters have no codecs"));
        }
        for encoding in &rtp_parameters.encodings {
            if encoding.ssrc == 0 {
                return Err(WorkerError::protocol("encoding without ssrc"));
            }
        }

        let is_update = self.rtp_parameters.is_some();

        let mut streams = HashMap::new();
        let mut profiles_by_ssrc = HashMap::new();

        for encoding in &rtp_parameters.encodings {
            let codec = rtp_parameters.codec_for_encoding(encoding)?;

            let params = StreamParams {
                ssrc: encoding.ssrc.into(),
                payload_type: codec.payload_type.into(),
                mime: codec.name.clone(),
                clock_rate: codec.clock_rate,
                use_nack: codec.nack_supported(),
                use_pli: codec.pli_supported(),
            };

            streams.insert(encoding.ssrc, RtpStreamRecv::new(params));
            profiles_by_ssrc.insert(encoding.ssrc, encoding.profile);
        }

        self.known_payload_types = rtp_parameters
            .codecs
            .iter()
            .map(|c| c.payload_type)
            .collect();
        self.streams = streams;
        self.profiles_by_ssrc = profiles_by_ssrc;
        self.rtp_parameters = Some(rtp_parameters);

        debug!(
            "Producer {} parameters [producerId:{}]",
            if is_update { "updated" } else { "received" },
            self.id
        );

        Ok(is_update)
    }

    pub fn pause(&mut self, notifier: &mut Notifier) {
        if self.paused {
            return;
        }

        self.paused = true;

        debug!("Producer paused [producerId:{}]", self.id);

        notifier.emit(self.id, "paused");
    }

    pub fn resume(&mut self, notifier: &mut Notifier) {
        if !self.paused {
            return;
        }

        self.paused = false;

        debug!("Producer resumed [producerId:{}]", self.id);

        notifier.emit(self.id, "resumed");
    }

    /// Takes one incoming packet. Accepted media yields the profile of the
    /// matched encoding for the router to fan out; generated NACK feedback
    /// goes out the producer's own transport.
    pub fn receive_rtp_packet(
        &mut self,
        packet: &mut RtpPacket,
        now_ms: u64,
        transport: Option<&mut Transport>,
    ) -> Option<Profile> {
        let ssrc = *packet.ssrc();

        let Some(stream) = self.streams.get_mut(&ssrc) else {
            trace!("no stream for ssrc [producerId:{}, ssrc:{}]", self.id, ssrc);
            return None;
        };

        if !self.known_payload_types.contains(&*packet.payload_type()) {
            trace!(
                "unknown payload type [producerId:{}, payloadType:{}]",
                self.id,
                packet.payload_type()
            );
            return None;
        }

        if !stream.receive_packet(packet, now_ms) {
            return None;
        }

        // Loss detected by the stream becomes NACK feedback to the source.
        if let Some(nack) = stream.take_nack() {
            if let Some(transport) = transport {
                let mut bytes = Vec::new();
                nack.write_to(&mut bytes);
                transport.send_rtcp(bytes);
            }
        }

        // Codecs with descriptor rewriting get their payload normalized
        // once, here, before any consumer sees it.
        let mime = stream.params().mime.clone();
        codecs::normalize_packet(&mime, packet);

        if self.paused {
            return None;
        }

        let profile = self.profiles_by_ssrc.get(&ssrc).copied().unwrap_or_default();

        Some(profile)
    }

    /// Asks the source for a key frame on every video stream.
    pub fn request_full_frame(&mut self, transport: Option<&mut Transport>) {
        if self.kind != MediaKind::Video {
            return;
        }

        let Some(transport) = transport else {
            return;
        };

        for (ssrc, stream) in &self.streams {
            let mut bytes = Vec::new();

            if stream.params().use_pli {
                debug!("sending PLI [producerId:{}, ssrc:{}]", self.id, ssrc);

                Pli {
                    sender_ssrc: 0.into(),
                    media_ssrc: (*ssrc).into(),
                }
                .write_to(&mut bytes);
            } else {
                debug!("sending FIR [producerId:{}, ssrc:{}]", self.id, ssrc);

                self.fir_seq_nr = self.fir_seq_nr.wrapping_add(1);
                Fir {
                    sender_ssrc: 0.into(),
                    media_ssrc: (*ssrc).into(),
                    seq_nr: self.fir_seq_nr,
                }
                .write_to(&mut bytes);
            }

            transport.send_rtcp(bytes);
        }
    }

    /// Routes an incoming sender report to the matching stream.
    pub fn receive_rtcp_sender_report(&mut self, sr: &SenderReport, now_ms: u64) {
        if let Some(stream) = self.streams.get_mut(&*sr.ssrc) {
            stream.receive_sender_report(sr, now_ms);
        }
    }

    /// Contributes receiver reports to the outgoing compound, rate limited
    /// per kind.
    pub fn get_rtcp(&mut self, compound: &mut CompoundPacket, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_rtcp_sent_ms);
        if (elapsed as f64 * 1.15) < self.max_rtcp_interval_ms as f64 {
            return;
        }

        if self.streams.is_empty() {
            return;
        }

        for stream in self.streams.values_mut() {
            compound.add_reception_report(stream.reception_report(now_ms));
        }

        self.last_rtcp_sent_ms = now_ms;
    }

    pub fn close(&mut self, notifier: &mut Notifier) {
        debug!("Producer closed [producerId:{}]", self.id);

        notifier.emit(self.id, "close");
    }

    pub fn dump(&self) -> Value {
        let mut streams = Vec::new();
        for (ssrc, stream) in &self.streams {
            streams.push(json!({
                "ssrc": ssrc,
                "profile": self.profiles_by_ssrc.get(ssrc).copied().unwrap_or_default().as_str(),
                "received": {
                    "packets": stream.received().packets(),
                    "bytes": stream.received().bytes(),
                },
            }));
        }

        let mut json = json!({
            "producerId": self.id,
            "kind": self.kind.to_string(),
            "transportId": self.transport_id,
            "paused": self.paused,
            "rtpStreams": streams,
        });

        if let Some(params) = &self.rtp_parameters {
            json["rtpParameters"] = serde_json::to_value(params).unwrap_or(Value::Null);
        }

        json
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn simulcast_parameters() -> RtpParameters {
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
            "encodings": [
                { "ssrc": 1001, "profile": "low" },
                { "ssrc": 1002, "profile": "medium" },
                { "ssrc": 1003, "profile": "high" }
            ],
            "rtcp": { "cname": "producer-cname" }
        }))
        .unwrap()
    }

    fn packet(ssrc: u32, seq: u16, pt: u8) -> RtpPacket {
        let mut buf = vec![0x80, pt, 0, 0, 0, 0, 0, 100, 0, 0, 0, 0];
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(&[0x10, 0x01, 0xaa]);
        RtpPacket::parse(buf).unwrap()
    }

    #[test]
    fn receive_builds_streams_and_profiles() {
        let mut producer = Producer::new(10, MediaKind::Video, Some(1));
        let is_update = producer.receive(simulcast_parameters()).unwrap();
        assert!(!is_update);
        assert_eq!(
            producer.profiles(),
            vec![Profile::Low, Profile::Medium, Profile::High]
        );

        // Same call again is an update.
        assert!(producer.receive(simulcast_parameters()).unwrap());
    }

    #[test]
    fn receive_rejects_bad_parameters() {
        let mut producer = Producer::new(10, MediaKind::Video, None);

        let no_codecs: RtpParameters = serde_json::from_value(json!({ "codecs": [] })).unwrap();
        assert!(producer.receive(no_codecs).is_err());

        let no_ssrc: RtpParameters = serde_json::from_value(json!({
            "codecs": [ { "name": "video/VP8", "payloadType": 101, "clockRate": 90000 } ],
            "encodings": [ {} ]
        }))
        .unwrap();
        assert!(producer.receive(no_ssrc).is_err());
    }

    #[test]
    fn demuxes_by_ssrc() {
        let mut producer = Producer::new(10, MediaKind::Video, None);
        producer.receive(simulcast_parameters()).unwrap();

        let mut p = packet(1002, 1, 101);
        assert_eq!(
            producer.receive_rtp_packet(&mut p, 0, None),
            Some(Profile::Medium)
        );

        // Unknown ssrc and unknown payload type are dropped.
        let mut p = packet(9999, 1, 101);
        assert_eq!(producer.receive_rtp_packet(&mut p, 0, None), None);

        let mut p = packet(1001, 1, 55);
        assert_eq!(producer.receive_rtp_packet(&mut p, 0, None), None);
    }

    #[test]
    fn paused_producer_accepts_but_does_not_forward() {
        let mut producer = Producer::new(10, MediaKind::Video, None);
        producer.receive(simulcast_parameters()).unwrap();
        let mut notifier = Notifier::new();

        producer.pause(&mut notifier);
        assert_eq!(notifier.poll_notification().unwrap().event, "paused");

        let mut p = packet(1001, 1, 101);
        assert_eq!(producer.receive_rtp_packet(&mut p, 0, None), None);

        producer.resume(&mut notifier);
        assert_eq!(notifier.poll_notification().unwrap().event, "resumed");

        let mut p = packet(1001, 2, 101);
        assert_eq!(
            producer.receive_rtp_packet(&mut p, 0, None),
            Some(Profile::Low)
        );
    }

    #[test]
    fn gap_sends_nack_to_source() {
        let mut producer = Producer::new(10, MediaKind::Video, Some(1));
        producer.receive(simulcast_parameters()).unwrap();
        let mut transport = Transport::new(1, &Value::Null);

        let mut p = packet(1001, 100, 101);
        producer.receive_rtp_packet(&mut p, 0, Some(&mut transport));
        let mut p = packet(1001, 103, 101);
        producer.receive_rtp_packet(&mut p, 10, Some(&mut transport));

        let Some(crate::transport::Transmit::Rtcp(bytes)) = transport.poll_transmit() else {
            panic!("expected queued NACK");
        };
        let parsed = crate::rtcp::Rtcp::parse_compound(&bytes);
        assert!(matches!(parsed[0], crate::rtcp::Rtcp::Nack(_)));
    }

    #[test]
    fn full_frame_request_sends_pli() {
        let mut producer = Producer::new(10, MediaKind::Video, Some(1));
        producer.receive(simulcast_parameters()).unwrap();
        let mut transport = Transport::new(1, &Value::Null);

        producer.request_full_frame(Some(&mut transport));

        let mut plis = 0;
        while let Some(t) = transport.poll_transmit() {
            let crate::transport::Transmit::Rtcp(bytes) = t else {
                continue;
            };
            for p in crate::rtcp::Rtcp::parse_compound(&bytes) {
                if matches!(p, crate::rtcp::Rtcp::Pli(_)) {
                    plis += 1;
                }
            }
        }
        // One per simulcast stream.
        assert_eq!(plis, 3);
    }

    #[test]
    fn rtcp_reports_every_stream() {
        let mut producer = Producer::new(10, MediaKind::Video, None);
        producer.receive(simulcast_parameters()).unwrap();

        for ssrc in [1001u32, 1002, 1003] {
            let mut p = packet(ssrc, 5, 101);
            producer.receive_rtp_packet(&mut p, 0, None);
        }

        let mut compound = CompoundPacket::new();
        producer.get_rtcp(&mut compound, 10_000);
        assert!(!compound.is_empty());

        let bytes = compound.to_bytes();
        let parsed = crate::rtcp::Rtcp::parse_compound(&bytes);
        let crate::rtcp::Rtcp::ReceiverReport(reports) = &parsed[0] else {
            panic!("expected receiver report");
        };
        assert_eq!(reports.len(), 3);
    }
}
