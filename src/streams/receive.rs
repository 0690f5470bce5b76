use crate::rtcp::{Nack, NackItem, ReceptionReport, SenderReport};
use crate::rtp::{extend_u16, RtpPacket};

use super::{RtpDataCounter, StreamParams, MAX_DROPOUT, MAX_MISORDER};

/// How many packets a single gap may span and still be NACKed. Larger gaps
/// are treated as a stream discontinuity, not loss.
const MAX_NACK_GAP: u16 = 512;

/// Receive side state of a single incoming stream.
///
/// Tracks the RFC 3550 reception statistics (extended highest sequence,
/// cumulative loss, interarrival jitter), remembers the last sender report
/// for DLSR, and turns sequence gaps into NACK feedback when negotiated.
#[derive(Debug)]
pub struct RtpStreamRecv {
    params: StreamParams,

    /// Extended highest sequence number seen.
    max_ext_seq: Option<u64>,
    /// Extended sequence of the first packet.
    base_ext_seq: u64,
    /// First out-of-window seq observed, for restart detection.
    bad_seq: Option<u32>,

    received_counter: RtpDataCounter,
    /// Expected at the previous report.
    expected_prior: u64,
    /// Received at the previous report.
    received_prior: u64,

    /// Interarrival jitter estimate, in RTP clock units (RFC 3550 A.8).
    jitter: f64,
    /// Previous packet transit time, RTP clock units.
    transit: Option<i64>,

    /// Middle 32 bits of the NTP timestamp of the last SR received.
    last_sr_ntp_middle: u32,
    /// When that SR arrived.
    last_sr_received_ms: u64,

    /// NACK feedback produced by gap detection, drained by the owner.
    pending_nack: Option<Nack>,
}

impl RtpStreamRecv {
    pub fn new(params: StreamParams) -> Self {
        RtpStreamRecv {
            params,
            max_ext_seq: None,
            base_ext_seq: 0,
            bad_seq: None,
            received_counter: RtpDataCounter::default(),
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            transit: None,
            last_sr_ntp_middle: 0,
            last_sr_received_ms: 0,
            pending_nack: None,
        }
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn received(&self) -> &RtpDataCounter {
        &self.received_counter
    }

    /// Accounts an incoming packet. `false` rejects it (restart suspected,
    /// first of a large jump).
    pub fn receive_packet(&mut self, packet: &RtpPacket, now_ms: u64) -> bool {
        let seq = packet.sequence_number();

        let Some(max_ext_seq) = self.max_ext_seq else {
            self.max_ext_seq = Some(seq as u64);
            self.base_ext_seq = seq as u64;
            self.received_counter.update(packet);
            self.update_jitter(packet, now_ms);
            return true;
        };

        let udelta = seq.wrapping_sub(max_ext_seq as u16);

        if udelta < MAX_DROPOUT {
            let ext_seq = extend_u16(Some(max_ext_seq), seq);

            if self.params.use_nack && udelta > 1 && udelta <= MAX_NACK_GAP {
                self.build_nack(max_ext_seq as u16, udelta);
            }

            self.max_ext_seq = Some(ext_seq);
            self.bad_seq = None;
        } else if udelta <= u16::MAX - MAX_MISORDER {
            if Some(seq as u32) == self.bad_seq {
                // Two sequential packets, the source restarted.
                self.max_ext_seq = Some(seq as u64);
                self.base_ext_seq = seq as u64;
                self.expected_prior = 0;
                self.received_prior = 0;
                self.received_counter.reset();
                self.bad_seq = None;
            } else {
                self.bad_seq = Some(seq.wrapping_add(1) as u32);
                return false;
            }
        }
        // Else: duplicate or late reordered packet, count it.

        self.received_counter.update(packet);
        self.update_jitter(packet, now_ms);

        true
    }

    /// RFC 3550 A.8, computed in the stream's clock rate.
    fn update_jitter(&mut self, packet: &RtpPacket, now_ms: u64) {
        let arrival = (now_ms * self.params.clock_rate as u64 / 1000) as i64;
        let transit = arrival - packet.timestamp() as i64;

        if let Some(prev) = self.transit {
            let d = (transit - prev).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }

        self.transit = Some(transit);
    }

    fn build_nack(&mut self, max_seq: u16, udelta: u16) {
        let first_lost = max_seq.wrapping_add(1);
        let lost_count = udelta - 1;

        debug!(
            "nacking {} packet(s) from {} [ssrc:{}]",
            lost_count, first_lost, self.params.ssrc
        );

        let mut items = Vec::new();
        let mut remaining = lost_count;
        let mut pid = first_lost;

        while remaining > 0 {
            let in_item = remaining.min(17);
            let mut blp = 0u16;
            for i in 0..in_item.saturating_sub(1) {
                blp |= 1 << i;
            }
            items.push(NackItem { pid, blp });
            pid = pid.wrapping_add(in_item);
            remaining -= in_item;
        }

        self.pending_nack = Some(Nack {
            sender_ssrc: 0.into(),
            media_ssrc: self.params.ssrc,
            items,
        });
    }

    /// NACK feedback generated by the last gap, if any.
    pub fn take_nack(&mut self) -> Option<Nack> {
        self.pending_nack.take()
    }

    pub fn receive_sender_report(&mut self, sr: &SenderReport, now_ms: u64) {
        self.last_sr_ntp_middle = sr.ntp_middle();
        self.last_sr_received_ms = now_ms;
    }

    /// A reception report block for the scheduled RR.
    pub fn reception_report(&mut self, now_ms: u64) -> ReceptionReport {
        let max_ext_seq = self.max_ext_seq.unwrap_or(0);

        let expected = max_ext_seq.saturating_sub(self.base_ext_seq) + 1;
        let received = self.received_counter.packets();
        let total_lost = expected.saturating_sub(received);

        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = received.saturating_sub(self.received_prior);
        let lost_interval = expected_interval.saturating_sub(received_interval);

        self.expected_prior = expected;
        self.received_prior = received;

        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval) as u8
        };

        let delay_since_last_sr = if self.last_sr_received_ms > 0 {
            (now_ms.saturating_sub(self.last_sr_received_ms) * 65_536 / 1000) as u32
        } else {
            0
        };

        ReceptionReport {
            ssrc: self.params.ssrc,
            fraction_lost,
            total_lost: (total_lost as u32) & 0x00ff_ffff,
            ext_highest_seq: max_ext_seq as u32,
            jitter: self.jitter as u32,
            last_sr: self.last_sr_ntp_middle,
            delay_since_last_sr,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(use_nack: bool) -> StreamParams {
        StreamParams {
            ssrc: 3000.into(),
            payload_type: 100.into(),
            mime: "video/VP8".into(),
            clock_rate: 90_000,
            use_nack,
            use_pli: true,
        }
    }

    fn packet(seq: u16, ts: u32) -> RtpPacket {
        let mut buf = vec![0x80, 100, 0, 0, 0, 0, 0, 0, 0, 0, 11, 184];
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf.push(0);
        RtpPacket::parse(buf).unwrap()
    }

    #[test]
    fn gap_generates_nack() {
        let mut stream = RtpStreamRecv::new(params(true));
        assert!(stream.receive_packet(&packet(100, 0), 0));
        assert!(stream.take_nack().is_none());

        assert!(stream.receive_packet(&packet(104, 0), 10));
        let nack = stream.take_nack().unwrap();
        assert_eq!(*nack.media_ssrc, 3000);
        assert_eq!(nack.items.len(), 1);
        assert_eq!(nack.items[0].pid, 101);
        assert_eq!(nack.items[0].blp, 0b11);
    }

    #[test]
    fn no_nack_when_disabled() {
        let mut stream = RtpStreamRecv::new(params(false));
        stream.receive_packet(&packet(100, 0), 0);
        stream.receive_packet(&packet(110, 0), 10);
        assert!(stream.take_nack().is_none());
    }

    #[test]
    fn nack_spans_wraparound() {
        let mut stream = RtpStreamRecv::new(params(true));
        stream.receive_packet(&packet(65_534, 0), 0);
        stream.receive_packet(&packet(2, 0), 10);

        let nack = stream.take_nack().unwrap();
        assert_eq!(nack.items[0].pid, 65_535);
        let lost: Vec<u16> = nack.items[0].lost_seqs().collect();
        assert_eq!(lost, vec![65_535, 0, 1]);
    }

    #[test]
    fn reception_report_counts_loss() {
        let mut stream = RtpStreamRecv::new(params(false));
        for seq in [100u16, 101, 103, 104] {
            stream.receive_packet(&packet(seq, 0), 0);
        }

        let report = stream.reception_report(1000);
        assert_eq!(*report.ssrc, 3000);
        assert_eq!(report.ext_highest_seq, 104);
        assert_eq!(report.total_lost, 1);
        // 1 lost of 5 expected in the interval.
        assert_eq!(report.fraction_lost, 51);

        // Second interval with no loss.
        stream.receive_packet(&packet(102, 0), 0);
        stream.receive_packet(&packet(105, 0), 0);
        let report = stream.reception_report(2000);
        assert_eq!(report.total_lost, 0);
    }

    #[test]
    fn extended_seq_crosses_wrap() {
        let mut stream = RtpStreamRecv::new(params(false));
        stream.receive_packet(&packet(65_535, 0), 0);
        stream.receive_packet(&packet(0, 0), 10);
        let report = stream.reception_report(20);
        assert_eq!(report.ext_highest_seq, 65_536);
    }

    #[test]
    fn jitter_stays_zero_for_steady_arrival() {
        let mut stream = RtpStreamRecv::new(params(false));
        // 30 fps at 90kHz, 2970 ticks per 33ms frame.
        for i in 0u32..10 {
            let now_ms = (i * 33) as u64;
            stream.receive_packet(&packet(i as u16, i * 2970), now_ms);
        }
        let report = stream.reception_report(1000);
        assert!(report.jitter < 10, "jitter {}", report.jitter);
    }

    #[test]
    fn dlsr_reflects_elapsed_time() {
        let mut stream = RtpStreamRecv::new(params(false));
        stream.receive_packet(&packet(1, 0), 0);

        let sr = SenderReport {
            ssrc: 3000.into(),
            ntp_sec: 100,
            ntp_frac: 0,
            rtp_timestamp: 0,
            packet_count: 1,
            octet_count: 10,
        };
        stream.receive_sender_report(&sr, 1000);

        let report = stream.reception_report(1500);
        assert_eq!(report.last_sr, sr.ntp_middle());
        // Half a second in 1/65536 units.
        assert_eq!(report.delay_since_last_sr, 32_768);
    }
}
