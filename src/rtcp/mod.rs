//! RTCP wire types.
//!
//! Only the packets the worker core produces or consumes get a full
//! representation (SR/RR/SDES/BYE and the NACK/PLI/FIR feedback); anything
//! else in an incoming compound is skipped by length.

use crate::rtp::Ssrc;

mod sr;
pub use sr::SenderReport;

mod rr;
pub use rr::ReceptionReport;

mod sdes;
pub use sdes::SdesChunk;

mod nack;
pub use nack::{Nack, NackItem};

mod pli;
pub use pli::Pli;

mod fir;
pub use fir::Fir;

mod bye;
pub use bye::Bye;

// Report intervals per media kind. Audio follows the RFC 3550 default,
// video matches what libWebRTC expects.
pub const MAX_AUDIO_INTERVAL_MS: u64 = 5000;
pub const MAX_VIDEO_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RtcpType {
    SenderReport = 200,
    ReceiverReport = 201,
    Sdes = 202,
    Bye = 203,
    TransportLayerFeedback = 205,
    PayloadSpecificFeedback = 206,
}

/// The common 4 byte RTCP header.
pub(crate) struct RtcpHeader {
    pub rtcp_type: RtcpType,
    /// Report count or feedback message type, depending on packet type.
    pub count: u8,
    /// Packet length in 32 bit words, minus one.
    pub words_less_one: u16,
}

impl RtcpHeader {
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = 0b10_0_00000 | (self.count & 0b0001_1111);
        buf[1] = self.rtcp_type as u8;
        buf[2..4].copy_from_slice(&self.words_less_one.to_be_bytes());
    }
}

/// One packet out of an incoming RTCP compound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rtcp {
    SenderReport(SenderReport),
    ReceiverReport(Vec<ReceptionReport>),
    Nack(Nack),
    Pli(Pli),
    Fir(Fir),
    Bye(Bye),
}

impl Rtcp {
    /// Parses a compound RTCP packet into the packets the core handles.
    /// Unknown or malformed trailing content terminates the parse; whatever
    /// was recognized up to that point is returned.
    pub fn parse_compound(buf: &[u8]) -> Vec<Rtcp> {
        let mut out = Vec::new();
        let mut buf = buf;

        while buf.len() >= 4 {
            let version = (buf[0] & 0b1100_0000) >> 6;
            if version != 2 {
                trace!("RTCP version is not 2");
                break;
            }
            let count = buf[0] & 0b0001_1111;
            let pt = buf[1];
            let words_less_one = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            let len = (words_less_one + 1) * 4;

            if buf.len() < len {
                trace!("RTCP packet length beyond buffer");
                break;
            }

            let body = &buf[4..len];

            match pt {
                200 => {
                    if let Some(sr) = SenderReport::parse(body) {
                        out.push(Rtcp::SenderReport(sr));
                    }
                }
                201 => {
                    if let Some(reports) = rr::parse_receiver_report(body, count as usize) {
                        out.push(Rtcp::ReceiverReport(reports));
                    }
                }
                203 => {
                    if let Some(bye) = Bye::parse(body, count as usize) {
                        out.push(Rtcp::Bye(bye));
                    }
                }
                205 if count == 1 => {
                    if let Some(nack) = Nack::parse(body) {
                        out.push(Rtcp::Nack(nack));
                    }
                }
                206 if count == 1 => {
                    if let Some(pli) = Pli::parse(body) {
                        out.push(Rtcp::Pli(pli));
                    }
                }
                206 if count == 4 => {
                    if let Some(fir) = Fir::parse(body) {
                        out.push(Rtcp::Fir(fir));
                    }
                }
                _ => {
                    trace!("skipping RTCP pt {} count {}", pt, count);
                }
            }

            buf = &buf[len..];
        }

        out
    }
}

/// Accumulates outgoing reports and serializes them back to back.
#[derive(Debug, Default)]
pub struct CompoundPacket {
    sender_reports: Vec<SenderReport>,
    reception_reports: Vec<ReceptionReport>,
    sdes_chunks: Vec<SdesChunk>,
}

impl CompoundPacket {
    pub fn new() -> Self {
        CompoundPacket::default()
    }

    pub fn add_sender_report(&mut self, sr: SenderReport) {
        self.sender_reports.push(sr);
    }

    pub fn add_reception_report(&mut self, rr: ReceptionReport) {
        self.reception_reports.push(rr);
    }

    pub fn add_sdes_chunk(&mut self, chunk: SdesChunk) {
        self.sdes_chunks.push(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.sender_reports.is_empty()
            && self.reception_reports.is_empty()
            && self.sdes_chunks.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);

        for sr in &self.sender_reports {
            sr.write_to(&mut out);
        }

        if !self.reception_reports.is_empty() {
            rr::write_receiver_report(&mut out, 0.into(), &self.reception_reports);
        }

        if !self.sdes_chunks.is_empty() {
            sdes::write_sdes(&mut out, &self.sdes_chunks);
        }

        out
    }
}

pub(crate) fn write_u24(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn read_ssrc(buf: &[u8], at: usize) -> Ssrc {
    read_u32(buf, at).into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compound_round_trip() {
        let mut compound = CompoundPacket::new();
        compound.add_sender_report(SenderReport {
            ssrc: 77.into(),
            ntp_sec: 1000,
            ntp_frac: 2000,
            rtp_timestamp: 30_000,
            packet_count: 42,
            octet_count: 4200,
        });
        compound.add_sdes_chunk(SdesChunk {
            ssrc: 77.into(),
            cname: "worker".into(),
        });

        let bytes = compound.to_bytes();
        assert_eq!(bytes.len() % 4, 0);

        let parsed = Rtcp::parse_compound(&bytes);
        assert_eq!(parsed.len(), 1);
        let Rtcp::SenderReport(sr) = &parsed[0] else {
            panic!("expected sender report");
        };
        assert_eq!(*sr.ssrc, 77);
        assert_eq!(sr.packet_count, 42);
        assert_eq!(sr.octet_count, 4200);
    }

    #[test]
    fn parse_stops_on_garbage() {
        let mut bytes = vec![0b10_000001, 205, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2];
        // nack item
        bytes[4..8].copy_from_slice(&1u32.to_be_bytes());
        let mut with_tail = bytes.clone();
        with_tail.extend_from_slice(&[0xff, 0xff]);

        let parsed = Rtcp::parse_compound(&with_tail);
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], Rtcp::Nack(_)));
    }
}
