use crate::rtp::Ssrc;

use super::{read_ssrc, RtcpHeader, RtcpType};

/// Goodbye packet listing the sources that leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bye {
    pub ssrcs: Vec<Ssrc>,
}

impl Bye {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader {
            rtcp_type: RtcpType::Bye,
            count: self.ssrcs.len() as u8,
            words_less_one: self.ssrcs.len() as u16,
        };

        let mut head = [0u8; 4];
        header.write_to(&mut head);
        out.extend_from_slice(&head);

        for ssrc in &self.ssrcs {
            out.extend_from_slice(&ssrc.to_be_bytes());
        }
    }

    pub(crate) fn parse(body: &[u8], count: usize) -> Option<Bye> {
        if body.len() < count * 4 {
            return None;
        }

        let ssrcs = (0..count).map(|i| read_ssrc(body, i * 4)).collect();

        Some(Bye { ssrcs })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bye_round_trip() {
        let bye = Bye {
            ssrcs: vec![1.into(), 2.into()],
        };
        let mut out = Vec::new();
        bye.write_to(&mut out);
        assert_eq!(out.len(), 12);
        assert_eq!(Bye::parse(&out[4..], 2).unwrap(), bye);
    }
}
