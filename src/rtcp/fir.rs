use crate::rtp::Ssrc;

use super::{read_ssrc, RtcpHeader, RtcpType};

/// Full Intra Request (RFC 5104 4.3.1), single FCI entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fir {
    pub sender_ssrc: Ssrc,
    /// The stream a full frame is requested for.
    pub media_ssrc: Ssrc,
    /// Request sequence number, increments per distinct request.
    pub seq_nr: u8,
}

impl Fir {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            count: 4,
            words_less_one: 4,
        };

        let mut head = [0u8; 4];
        header.write_to(&mut head);
        out.extend_from_slice(&head);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        // Media ssrc of the feedback header is unused for FIR, the FCI
        // carries the target.
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&self.media_ssrc.to_be_bytes());
        out.push(self.seq_nr);
        out.extend_from_slice(&[0, 0, 0]);
    }

    pub(crate) fn parse(body: &[u8]) -> Option<Fir> {
        if body.len() < 16 {
            return None;
        }

        Some(Fir {
            sender_ssrc: read_ssrc(body, 0),
            media_ssrc: read_ssrc(body, 8),
            seq_nr: body[12],
        })
    }
}
