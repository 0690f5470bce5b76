use crate::rtcp::{ReceptionReport, SenderReport};
use crate::rtp::{Pt, RtpPacket, Ssrc};

use super::{RtpDataCounter, StreamParams, MAX_DROPOUT, MAX_MISORDER};

/// 17 possible packets per NACK item plus the terminating sentinel.
pub const RETRANSMISSION_CONTAINER_SLOTS: usize = 18;

/// Offset between the unix and NTP epochs, seconds.
const UNIX_TO_NTP_SECS: u64 = 2_208_988_800;

#[derive(Debug)]
struct StoredPacket {
    packet: RtpPacket,
    /// Last time this packet was resent.
    resent_at_ms: u64,
    /// Number of times this packet was resent.
    sent_times: u8,
}

#[derive(Debug, Clone, Copy)]
struct RtxInfo {
    payload_type: Pt,
    ssrc: Ssrc,
    /// Sequence counter of the RTX stream itself.
    seq: u16,
}

/// Send side state of a single outgoing stream.
///
/// Keeps a ring of recently sent packets keyed by sequence number so NACKs
/// can be answered, encodes retransmissions as RTX when negotiated, and
/// produces sender reports.
#[derive(Debug)]
pub struct RtpStreamSend {
    params: StreamParams,
    /// Ring of stored packets, `seq % capacity`. Empty when the stream does
    /// not retransmit (audio).
    storage: Vec<Option<StoredPacket>>,
    rtx: Option<RtxInfo>,

    /// Highest sequence number sent, once anything was sent.
    max_seq: Option<u16>,
    /// First out-of-window seq observed, for restart detection.
    bad_seq: Option<u32>,

    /// RTP timestamp and wallclock of the most recent packet, the anchor
    /// for the SR rtp timestamp.
    last_packet_rtp_timestamp: u32,
    last_packet_ms: u64,

    transmission_counter: RtpDataCounter,
    /// Packets counted into the previous sender report.
    sent_prior: u64,

    /// What the remote reported back about this stream.
    fraction_lost: u8,
    packets_lost: u32,
    round_trip_jitter: u32,
}

impl RtpStreamSend {
    /// `buffer_size` is the retransmission ring capacity: 750 for video
    /// with NACK, 0 for audio.
    pub fn new(params: StreamParams, buffer_size: usize) -> Self {
        let mut storage = Vec::new();
        storage.resize_with(buffer_size, || None);

        RtpStreamSend {
            params,
            storage,
            rtx: None,
            max_seq: None,
            bad_seq: None,
            last_packet_rtp_timestamp: 0,
            last_packet_ms: 0,
            transmission_counter: RtpDataCounter::default(),
            sent_prior: 0,
            fraction_lost: 0,
            packets_lost: 0,
            round_trip_jitter: 0,
        }
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn set_rtx(&mut self, payload_type: Pt, ssrc: Ssrc) {
        self.rtx = Some(RtxInfo {
            payload_type,
            ssrc,
            seq: rand::random(),
        });
    }

    pub fn has_rtx(&self) -> bool {
        self.rtx.is_some()
    }

    pub fn transmitted(&self) -> &RtpDataCounter {
        &self.transmission_counter
    }

    /// Accounts an outgoing packet and stores a copy for retransmission.
    /// `false` means the sequence number is not acceptable (stream restart
    /// suspected); the caller does not send.
    pub fn receive_packet(&mut self, packet: &RtpPacket, now_ms: u64) -> bool {
        let seq = packet.sequence_number();

        if !self.update_seq(seq) {
            return false;
        }

        self.last_packet_rtp_timestamp = packet.timestamp();
        self.last_packet_ms = now_ms;
        self.transmission_counter.update(packet);

        if !self.storage.is_empty() {
            let slot = seq as usize % self.storage.len();
            self.storage[slot] = Some(StoredPacket {
                packet: packet.clone(),
                resent_at_ms: 0,
                sent_times: 0,
            });
        }

        true
    }

    /// RFC 3550 A.1 style sequence update, send flavored: consecutive
    /// output is the norm, anything far off means our own counters were
    /// reset.
    fn update_seq(&mut self, seq: u16) -> bool {
        let Some(max_seq) = self.max_seq else {
            self.max_seq = Some(seq);
            return true;
        };

        let udelta = seq.wrapping_sub(max_seq);

        if udelta < MAX_DROPOUT {
            self.max_seq = Some(seq);
            self.bad_seq = None;
            true
        } else if udelta <= u16::MAX - MAX_MISORDER {
            // The sequence number made a large jump.
            if Some(seq as u32) == self.bad_seq {
                // Two sequential packets: assume the other side restarted.
                self.max_seq = Some(seq);
                self.bad_seq = None;
                true
            } else {
                self.bad_seq = Some(seq.wrapping_add(1) as u32);
                false
            }
        } else {
            // Duplicate or reordered packet, store but do not advance.
            true
        }
    }

    /// Looks up the packets a NACK item asks for.
    ///
    /// Fills `container` with clones of the stored packets for `pid` and
    /// each bit of `bitmask`; an evicted entry becomes a `None` slot and
    /// terminates the fill. The last element is always a `None` sentinel.
    pub fn request_retransmission(
        &mut self,
        pid: u16,
        bitmask: u16,
        now_ms: u64,
        container: &mut Vec<Option<RtpPacket>>,
    ) {
        container.clear();

        let requested = std::iter::once(pid).chain(
            (0..16u16)
                .filter(|i| bitmask & (1 << i) > 0)
                .map(|i| pid.wrapping_add(i + 1)),
        );

        for seq in requested {
            if container.len() >= RETRANSMISSION_CONTAINER_SLOTS - 1 {
                break;
            }

            match self.stored_packet(seq, now_ms) {
                Some(packet) => container.push(Some(packet)),
                None => {
                    trace!("packet {} not in retransmission buffer", seq);
                    container.push(None);
                    break;
                }
            }
        }

        if container.last().map(|slot| slot.is_some()).unwrap_or(true) {
            container.push(None);
        }
    }

    fn stored_packet(&mut self, seq: u16, now_ms: u64) -> Option<RtpPacket> {
        if self.storage.is_empty() {
            return None;
        }

        let slot = seq as usize % self.storage.len();
        let stored = self.storage[slot].as_mut()?;

        if stored.packet.sequence_number() != seq {
            // Slot reused by a later packet, the requested one is gone.
            return None;
        }

        stored.resent_at_ms = now_ms;
        stored.sent_times = stored.sent_times.saturating_add(1);

        trace!(
            "serving retransmission [seq:{}, times:{}, at:{}]",
            seq,
            stored.sent_times,
            stored.resent_at_ms
        );

        Some(stored.packet.clone())
    }

    /// Rewrites `packet` into its RTX form: the original sequence number
    /// moves into the payload head and ssrc/pt/seq become the RTX values.
    pub fn rtx_encode(&mut self, packet: &mut RtpPacket) {
        let Some(rtx) = self.rtx.as_mut() else {
            return;
        };

        let original_seq = packet.sequence_number();

        packet.shift_payload(0, 2, true);
        packet.payload_mut()[..2].copy_from_slice(&original_seq.to_be_bytes());

        packet.set_ssrc(rtx.ssrc);
        packet.set_payload_type(rtx.payload_type);
        packet.set_sequence_number(rtx.seq);
        rtx.seq = rtx.seq.wrapping_add(1);
    }

    /// A sender report when something was sent since the previous one.
    pub fn sender_report(&mut self, now_ms: u64) -> Option<SenderReport> {
        let sent = self.transmission_counter.packets();
        if sent == self.sent_prior {
            return None;
        }
        self.sent_prior = sent;

        let ntp_sec = (now_ms / 1000 + UNIX_TO_NTP_SECS) as u32;
        let ntp_frac = (((now_ms % 1000) << 32) / 1000) as u32;

        // Extrapolate the RTP clock from the last packet.
        let elapsed_ms = now_ms.saturating_sub(self.last_packet_ms);
        let rtp_timestamp = self
            .last_packet_rtp_timestamp
            .wrapping_add((elapsed_ms * self.params.clock_rate as u64 / 1000) as u32);

        Some(SenderReport {
            ssrc: self.params.ssrc,
            ntp_sec,
            ntp_frac,
            rtp_timestamp,
            packet_count: self.transmission_counter.packets() as u32,
            octet_count: self.transmission_counter.bytes() as u32,
        })
    }

    /// Stores what the remote receiver reports seeing of this stream.
    pub fn receive_receiver_report(&mut self, report: &ReceptionReport) {
        self.fraction_lost = report.fraction_lost;
        self.packets_lost = report.total_lost;
        self.round_trip_jitter = report.jitter;
    }

    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    pub fn packets_lost(&self) -> u32 {
        self.packets_lost
    }

    pub fn clear_retransmission_buffer(&mut self) {
        for slot in &mut self.storage {
            *slot = None;
        }
    }
}
