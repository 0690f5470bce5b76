use crate::rtp::Ssrc;

use super::{read_ssrc, RtcpHeader, RtcpType};

/// Generic NACK transport feedback (RFC 4585 6.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    pub items: Vec<NackItem>,
}

/// One FCI entry: a base packet id and a bitmask of the 16 following.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackItem {
    pub pid: u16,
    pub blp: u16,
}

impl NackItem {
    /// The sequence numbers this item reports lost, base first.
    pub fn lost_seqs(&self) -> impl Iterator<Item = u16> + '_ {
        let pid = self.pid;
        let blp = self.blp;
        std::iter::once(pid)
            .chain((0..16u16).filter(move |i| blp & (1 << i) > 0).map(move |i| pid.wrapping_add(i + 1)))
    }
}

impl Nack {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            count: 1,
            words_less_one: (2 + self.items.len()) as u16,
        };

        let mut head = [0u8; 4];
        header.write_to(&mut head);
        out.extend_from_slice(&head);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        out.extend_from_slice(&self.media_ssrc.to_be_bytes());

        for item in &self.items {
            out.extend_from_slice(&item.pid.to_be_bytes());
            out.extend_from_slice(&item.blp.to_be_bytes());
        }
    }

    pub(crate) fn parse(body: &[u8]) -> Option<Nack> {
        if body.len() < 8 {
            return None;
        }

        let sender_ssrc = read_ssrc(body, 0);
        let media_ssrc = read_ssrc(body, 4);

        let mut items = Vec::new();
        let mut rest = &body[8..];
        while rest.len() >= 4 {
            items.push(NackItem {
                pid: u16::from_be_bytes([rest[0], rest[1]]),
                blp: u16::from_be_bytes([rest[2], rest[3]]),
            });
            rest = &rest[4..];
        }

        Some(Nack {
            sender_ssrc,
            media_ssrc,
            items,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nack_round_trip() {
        let nack = Nack {
            sender_ssrc: 1.into(),
            media_ssrc: 2.into(),
            items: vec![NackItem { pid: 105, blp: 0b11 }],
        };

        let mut out = Vec::new();
        nack.write_to(&mut out);
        assert_eq!(out.len(), 16);

        let parsed = Nack::parse(&out[4..]).unwrap();
        assert_eq!(parsed, nack);
    }

    #[test]
    fn lost_seqs_expand_bitmask() {
        let item = NackItem { pid: 105, blp: 0b0000_0000_0000_0011 };
        let seqs: Vec<u16> = item.lost_seqs().collect();
        assert_eq!(seqs, vec![105, 106, 107]);

        let wrap = NackItem { pid: 65_535, blp: 0b1 };
        let seqs: Vec<u16> = wrap.lost_seqs().collect();
        assert_eq!(seqs, vec![65_535, 0]);
    }
}
