//! Per-SSRC stream state, split by direction.
//!
//! [`RtpStreamSend`] carries the send side of a Consumer (retransmission
//! buffer, RTX, sender reports). [`RtpStreamRecv`] carries the receive side
//! of a Producer encoding (loss/jitter stats, NACK generation, receiver
//! reports).

use crate::rtp::{Pt, RtpPacket, Ssrc};

mod send;
pub use send::{RtpStreamSend, RETRANSMISSION_CONTAINER_SLOTS};

mod receive;
pub use receive::RtpStreamRecv;

// Limits for the RFC 3550 A.1 sequence validation.
const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;

/// Static properties of a stream, fixed at negotiation.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub ssrc: Ssrc,
    pub payload_type: Pt,
    pub mime: String,
    pub clock_rate: u32,
    pub use_nack: bool,
    pub use_pli: bool,
}

/// Running totals of RTP data in one direction.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtpDataCounter {
    packets: u64,
    bytes: u64,
}

impl RtpDataCounter {
    pub fn update(&mut self, packet: &RtpPacket) {
        self.packets += 1;
        self.bytes += packet.len() as u64;
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn reset(&mut self) {
        *self = RtpDataCounter::default();
    }
}
