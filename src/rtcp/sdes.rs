use crate::rtp::Ssrc;

use super::{RtcpHeader, RtcpType};

/// One SDES chunk carrying the CNAME of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: Ssrc,
    pub cname: String,
}

impl SdesChunk {
    /// 4 (ssrc) + item header + text + the null terminator, padded to a
    /// word boundary.
    fn len(&self) -> usize {
        let unpadded = 4 + 2 + self.cname.len() + 1;
        (unpadded + 3) & !3
    }

    fn write_chunk(&self, out: &mut Vec<u8>) {
        let start = out.len();

        out.extend_from_slice(&self.ssrc.to_be_bytes());
        // CNAME item type is 1.
        out.push(1);
        out.push(self.cname.len() as u8);
        out.extend_from_slice(self.cname.as_bytes());
        out.push(0);

        while (out.len() - start) % 4 != 0 {
            out.push(0);
        }
    }
}

pub(crate) fn write_sdes(out: &mut Vec<u8>, chunks: &[SdesChunk]) {
    let body_len: usize = chunks.iter().map(|c| c.len()).sum();

    let header = RtcpHeader {
        rtcp_type: RtcpType::Sdes,
        count: chunks.len() as u8,
        words_less_one: (body_len / 4) as u16,
    };

    let mut head = [0u8; 4];
    header.write_to(&mut head);
    out.extend_from_slice(&head);

    for chunk in chunks {
        chunk.write_chunk(out);
    }
}
