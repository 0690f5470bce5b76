use crate::rtp::Ssrc;

use super::{read_ssrc, RtcpHeader, RtcpType};

/// Picture Loss Indication (RFC 4585 6.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
}

impl Pli {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            count: 1,
            words_less_one: 2,
        };

        let mut head = [0u8; 4];
        header.write_to(&mut head);
        out.extend_from_slice(&head);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        out.extend_from_slice(&self.media_ssrc.to_be_bytes());
    }

    pub(crate) fn parse(body: &[u8]) -> Option<Pli> {
        if body.len() < 8 {
            return None;
        }

        Some(Pli {
            sender_ssrc: read_ssrc(body, 0),
            media_ssrc: read_ssrc(body, 4),
        })
    }
}
