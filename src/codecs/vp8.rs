//! VP8 payload descriptor (RFC 7741) parsing and rewriting.

use crate::rtp::{is_seq_higher_than, RtpPacket, SeqManager};

/// Highest temporal layer VP8 defines.
const MAX_TEMPORAL_LAYER: u8 = 2;

/// Parsed VP8 payload descriptor.
///
/// ```text
///    0 1 2 3 4 5 6 7
///    +-+-+-+-+-+-+-+-+
///    |X|R|N|S|R| PID | (REQUIRED)
///    +-+-+-+-+-+-+-+-+
/// X: |I|L|T|K| RSV   | (OPTIONAL)
///    +-+-+-+-+-+-+-+-+
/// I: |M| PictureID   | (OPTIONAL)
///    +-+-+-+-+-+-+-+-+
/// L: |   tl0picidx   | (OPTIONAL)
///    +-+-+-+-+-+-+-+-+
/// T/K:|tid|Y| KEYIDX | (OPTIONAL)
///    +-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Vp8Descriptor {
    pub extended: bool,
    pub non_reference: bool,
    pub start: bool,
    pub partition_index: u8,

    pub i: bool,
    pub l: bool,
    pub t: bool,
    pub k: bool,

    pub picture_id: u16,
    pub has_picture_id: bool,
    pub has_one_byte_picture_id: bool,
    pub has_two_bytes_picture_id: bool,

    pub tl0_picture_index: u8,
    pub has_tl0_picture_index: bool,

    pub tl_index: u8,
    pub y: bool,
    pub key_index: u8,
    pub has_tl_index: bool,

    pub is_key_frame: bool,
}

impl Vp8Descriptor {
    /// Parses a descriptor from the head of a VP8 RTP payload. `None` for
    /// truncated or empty payloads; the caller drops the packet.
    pub fn parse(data: &[u8]) -> Option<Vp8Descriptor> {
        if data.is_empty() {
            return None;
        }

        let mut descriptor = Vp8Descriptor::default();
        let mut offset = 0;

        let byte = data[offset];
        descriptor.extended = (byte >> 7) & 0x01 > 0;
        descriptor.non_reference = (byte >> 5) & 0x01 > 0;
        descriptor.start = (byte >> 4) & 0x01 > 0;
        descriptor.partition_index = byte & 0x07;

        if descriptor.extended {
            offset += 1;
            let byte = *data.get(offset)?;
            descriptor.i = (byte >> 7) & 0x01 > 0;
            descriptor.l = (byte >> 6) & 0x01 > 0;
            descriptor.t = (byte >> 5) & 0x01 > 0;
            descriptor.k = (byte >> 4) & 0x01 > 0;
        }

        if descriptor.i {
            offset += 1;
            let byte = *data.get(offset)?;

            if (byte >> 7) & 0x01 > 0 {
                // M set, two byte picture id.
                offset += 1;
                descriptor.has_two_bytes_picture_id = true;
                descriptor.picture_id = (((byte & 0x7f) as u16) << 8) | *data.get(offset)? as u16;
            } else {
                descriptor.has_one_byte_picture_id = true;
                descriptor.picture_id = (byte & 0x7f) as u16;
            }

            descriptor.has_picture_id = true;
        }

        if descriptor.l {
            offset += 1;
            descriptor.tl0_picture_index = *data.get(offset)?;
            descriptor.has_tl0_picture_index = true;
        }

        if descriptor.t || descriptor.k {
            offset += 1;
            let byte = *data.get(offset)?;

            if descriptor.t {
                descriptor.has_tl_index = true;
                descriptor.tl_index = (byte >> 6) & 0x03;
                descriptor.y = (byte >> 5) & 0x01 > 0;
            }
            if descriptor.k {
                descriptor.key_index = byte & 0x1f;
            }
        }

        // Key frame iff this is the first packet of the frame and the P bit
        // of the VP8 payload header is 0.
        offset += 1;
        if let Some(byte) = data.get(offset) {
            if descriptor.start && descriptor.partition_index == 0 && byte & 0x01 == 0 {
                descriptor.is_key_frame = true;
            }
        }

        Some(descriptor)
    }

    /// Length in bytes of the descriptor as it sits in the payload.
    pub fn size(&self) -> usize {
        let mut len = 1;
        if self.extended {
            len += 1;
        }
        if self.has_one_byte_picture_id {
            len += 1;
        }
        if self.has_two_bytes_picture_id {
            len += 2;
        }
        if self.has_tl0_picture_index {
            len += 1;
        }
        if self.t || self.k {
            len += 1;
        }
        len
    }

    /// Writes `picture_id` and `tl0_picture_index` into a payload carrying
    /// this descriptor's layout.
    pub fn encode(&self, data: &mut [u8], picture_id: u16, tl0_picture_index: u8) {
        if !self.extended {
            return;
        }

        let mut at = 2;

        if self.i {
            if self.has_two_bytes_picture_id {
                data[at..at + 2].copy_from_slice(&picture_id.to_be_bytes());
                data[at] |= 0x80;
                at += 2;
            } else if self.has_one_byte_picture_id {
                if picture_id > 127 {
                    debug!("casting pictureId value to one byte");
                }
                data[at] = (picture_id & 0x7f) as u8;
                at += 1;
            }
        }

        if self.l {
            data[at] = tl0_picture_index;
        }
    }

    /// Puts the original id values back after the packet went out.
    pub fn restore(&self, data: &mut [u8]) {
        self.encode(data, self.picture_id, self.tl0_picture_index);
    }
}

/// Per-consumer VP8 rewrite state.
#[derive(Debug, Clone)]
pub struct Vp8EncodingContext {
    /// Next forwarded packet must re-base picture-id/tl0 continuity.
    pub sync_required: bool,
    current_temporal_layer: u8,
    target_temporal_layer: u8,
    picture_id_manager: SeqManager<u16, 15>,
    tl0_picture_index_manager: SeqManager<u8, 8>,
}

impl Vp8EncodingContext {
    pub fn new() -> Self {
        Vp8EncodingContext {
            sync_required: true,
            current_temporal_layer: 0,
            target_temporal_layer: MAX_TEMPORAL_LAYER,
            picture_id_manager: SeqManager::new(),
            tl0_picture_index_manager: SeqManager::new(),
        }
    }

    pub fn current_temporal_layer(&self) -> u8 {
        self.current_temporal_layer
    }

    pub fn target_temporal_layer(&self) -> u8 {
        self.target_temporal_layer
    }

    pub fn set_target_temporal_layer(&mut self, layer: u8) {
        self.target_temporal_layer = layer.min(MAX_TEMPORAL_LAYER);
    }
}

impl Default for Vp8EncodingContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed descriptor bound to one packet, ready to process against a
/// consumer's context.
#[derive(Debug)]
pub struct Vp8Handler {
    descriptor: Vp8Descriptor,
}

impl Vp8Handler {
    pub fn parse(payload: &[u8]) -> Option<Vp8Handler> {
        let descriptor = Vp8Descriptor::parse(payload)?;
        Some(Vp8Handler { descriptor })
    }

    pub fn descriptor(&self) -> &Vp8Descriptor {
        &self.descriptor
    }

    /// The forwarding decision. `true` means the payload has been rewritten
    /// in place and should go out; `false` means drop.
    pub fn process(&self, context: &mut Vp8EncodingContext, payload: &mut [u8]) -> bool {
        let d = &self.descriptor;

        // Re-base picture-id and tl0 continuity at a sync point.
        if context.sync_required && d.has_picture_id && d.has_tl0_picture_index {
            context
                .picture_id_manager
                .sync(d.picture_id.wrapping_sub(1) & 0x7fff);
            context
                .tl0_picture_index_manager
                .sync(d.tl0_picture_index.wrapping_sub(1));

            context.sync_required = false;
        }

        // A key frame resets the layer climb.
        if d.is_key_frame {
            context.current_temporal_layer = context.target_temporal_layer;
        }

        // First packet of a new picture. Check the temporal layer.
        if d.has_picture_id
            && d.has_tl_index
            && d.has_tl0_picture_index
            && is_seq_higher_than::<15>(
                d.picture_id as u64,
                context.picture_id_manager.max_input() as u64,
            )
        {
            if d.tl_index > context.target_temporal_layer {
                context.picture_id_manager.drop_input(d.picture_id);
                context.tl0_picture_index_manager.drop_input(d.tl0_picture_index);

                return false;
            }

            // Upgrade requires a sync point.
            if d.tl_index > context.current_temporal_layer && !d.y {
                context.picture_id_manager.drop_input(d.picture_id);
                context.tl0_picture_index_manager.drop_input(d.tl0_picture_index);

                return false;
            }
        }

        let mut picture_id = 0u16;
        let mut tl0_picture_index = 0u8;

        // Do not send a dropped picture id.
        if d.has_picture_id {
            match context.picture_id_manager.input(d.picture_id) {
                Some(mapped) => picture_id = mapped,
                None => return false,
            }
        }

        if d.has_tl0_picture_index {
            match context.tl0_picture_index_manager.input(d.tl0_picture_index) {
                Some(mapped) => tl0_picture_index = mapped,
                None => return false,
            }
        }

        // Update/fix the current temporal layer.
        if d.has_tl_index && d.tl_index > context.current_temporal_layer {
            context.current_temporal_layer = d.tl_index;
        }
        if context.current_temporal_layer > context.target_temporal_layer {
            context.current_temporal_layer = context.target_temporal_layer;
        }

        if d.has_picture_id && d.has_tl0_picture_index {
            d.encode(payload, picture_id, tl0_picture_index);
        }

        true
    }

    /// Undo the in-place rewrite so the packet can be handed to the next
    /// consumer.
    pub fn restore(&self, payload: &mut [u8]) {
        let d = &self.descriptor;
        if d.has_picture_id && d.has_tl0_picture_index {
            d.restore(payload);
        }
    }
}

/// Promotes a one byte picture id to the two byte form, once, at ingestion.
/// Downstream picture ids can then exceed 127 without changing the payload
/// layout per consumer.
pub fn normalize(packet: &mut RtpPacket) {
    let Some(descriptor) = Vp8Descriptor::parse(packet.payload()) else {
        return;
    };

    if !descriptor.has_one_byte_picture_id {
        return;
    }

    // Insert one byte at the start of the picture id field.
    packet.shift_payload(2, 1, true);

    let payload = packet.payload_mut();
    // New high byte: M bit set, upper picture id bits zero. The original
    // 7 bit value moved one position right.
    payload[2] = 0x80;
}

#[cfg(test)]
mod test {
    use super::*;

    // X=1, I=1 (2 byte pid), L=1, T=1: |X..| |ILTK| |M+pid| |pid| |tl0| |tid,y,keyidx| |vp8 header|
    fn payload(pid: u16, tl0: u8, tid: u8, y: bool, key_frame: bool) -> Vec<u8> {
        let start = 0x10;
        let x = 0x80;
        let tid_byte = (tid << 6) | if y { 0x20 } else { 0 };
        let vp8_header = if key_frame { 0x00 } else { 0x01 };
        vec![
            x | start,
            0b1110_0000,
            0x80 | (pid >> 8) as u8,
            (pid & 0xff) as u8,
            tl0,
            tid_byte,
            vp8_header,
            0xaa,
            0xbb,
        ]
    }

    #[test]
    fn parse_minimal() {
        // Not extended: single byte descriptor, then VP8 payload header.
        let data = [0x10, 0x00, 0xaa];
        let d = Vp8Descriptor::parse(&data).unwrap();
        assert!(!d.extended);
        assert!(d.start);
        assert_eq!(d.partition_index, 0);
        assert!(!d.has_picture_id);
        assert!(d.is_key_frame);

        // Same but P=1, an interframe.
        let data = [0x10, 0x01, 0xaa];
        let d = Vp8Descriptor::parse(&data).unwrap();
        assert!(!d.is_key_frame);
    }

    #[test]
    fn parse_empty_and_truncated() {
        assert!(Vp8Descriptor::parse(&[]).is_none());
        // X set but no extension byte.
        assert!(Vp8Descriptor::parse(&[0x80]).is_none());
        // I set but no picture id byte.
        assert!(Vp8Descriptor::parse(&[0x80, 0x80]).is_none());
        // M set but only one picture id byte.
        assert!(Vp8Descriptor::parse(&[0x80, 0x80, 0x80]).is_none());
        // L set but no tl0 byte.
        assert!(Vp8Descriptor::parse(&[0x80, 0x40]).is_none());
    }

    #[test]
    fn parse_full_descriptor() {
        let data = payload(0x1234, 7, 2, true, true);
        let d = Vp8Descriptor::parse(&data).unwrap();

        assert!(d.extended && d.i && d.l && d.t && !d.k);
        assert!(d.has_two_bytes_picture_id);
        assert_eq!(d.picture_id, 0x1234);
        assert_eq!(d.tl0_picture_index, 7);
        assert_eq!(d.tl_index, 2);
        assert!(d.y);
        assert!(d.is_key_frame);
        assert_eq!(d.size(), 6);
    }

    #[test]
    fn parse_one_byte_picture_id() {
        let data = [0x90, 0x80, 0x42, 0x01, 0xaa];
        let d = Vp8Descriptor::parse(&data).unwrap();
        assert!(d.has_one_byte_picture_id);
        assert_eq!(d.picture_id, 0x42);
        assert!(!d.is_key_frame);
    }

    #[test]
    fn encode_parse_round_trip() {
        let mut data = payload(100, 10, 0, false, false);
        let d = Vp8Descriptor::parse(&data).unwrap();

        d.encode(&mut data, 4321, 99);

        let again = Vp8Descriptor::parse(&data).unwrap();
        assert_eq!(again.picture_id, 4321);
        assert_eq!(again.tl0_picture_index, 99);

        // And restore puts the original values back.
        d.restore(&mut data);
        let back = Vp8Descriptor::parse(&data).unwrap();
        assert_eq!(back.picture_id, 100);
        assert_eq!(back.tl0_picture_index, 10);
    }

    fn rtp_with_payload(payload: &[u8]) -> RtpPacket {
        let mut buf = vec![0x80, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 44];
        buf.extend_from_slice(payload);
        RtpPacket::parse(buf).unwrap()
    }

    #[test]
    fn normalize_expands_one_byte_picture_id() {
        let mut packet = rtp_with_payload(&[0x90, 0x80, 0x7f, 0x01, 0xaa]);
        let payload_len = packet.payload().len();
        normalize(&mut packet);

        assert_eq!(packet.payload().len(), payload_len + 1);
        let d = Vp8Descriptor::parse(packet.payload()).unwrap();
        assert!(d.has_two_bytes_picture_id);
        assert_eq!(d.picture_id, 0x7f);
    }

    #[test]
    fn normalize_leaves_two_byte_form_alone() {
        let original = payload(200, 1, 0, false, false);
        let mut packet = rtp_with_payload(&original);
        normalize(&mut packet);
        assert_eq!(packet.payload(), &original[..]);
    }

    #[test]
    fn picture_id_overflow_from_127() {
        // One byte form arrives at 127; normalization expands it so the
        // rewritten downstream value can be 128.
        let mut packet = rtp_with_payload(&[0xd0, 0xc0, 0x7f, 0x7f, 0x00, 0xaa]);
        normalize(&mut packet);

        let d = Vp8Descriptor::parse(packet.payload()).unwrap();
        assert!(d.has_two_bytes_picture_id);
        assert_eq!(d.picture_id, 127);

        d.encode(packet.payload_mut(), 128, 0x7f);
        let again = Vp8Descriptor::parse(packet.payload()).unwrap();
        assert_eq!(again.picture_id, 128);
        assert_eq!(again.tl0_picture_index, 0x7f);
    }

    #[test]
    fn temporal_layer_above_target_is_dropped() {
        let mut ctx = Vp8EncodingContext::new();
        ctx.set_target_temporal_layer(1);

        // Establish continuity at TL0.
        let mut data = payload(100, 10, 0, false, true);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));
        assert_eq!(ctx.current_temporal_layer(), 1);

        // TID=2 with Y=0: above target, dropped, both ids vacate a slot.
        let mut data = payload(101, 10, 2, false, false);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(!handler.process(&mut ctx, &mut data));

        // Next TL1 picture still maps contiguously.
        let mut data = payload(102, 10, 1, false, false);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));
        let d = Vp8Descriptor::parse(&data).unwrap();
        assert_eq!(d.picture_id, 2);
    }

    #[test]
    fn upgrade_without_sync_point_is_dropped() {
        let mut ctx = Vp8EncodingContext::new();
        ctx.set_target_temporal_layer(2);

        // Interframe start at TL0 (sync establishes continuity).
        let mut data = payload(50, 5, 0, false, false);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));
        assert_eq!(ctx.current_temporal_layer(), 0);

        // TL2 without the Y bit: upgrade needs a sync point, drop.
        let mut data = payload(51, 5, 2, false, false);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(!handler.process(&mut ctx, &mut data));

        // TL2 with Y=1: accepted, current climbs.
        let mut data = payload(52, 5, 2, true, false);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));
        assert_eq!(ctx.current_temporal_layer(), 2);
    }

    #[test]
    fn key_frame_applies_target_layer() {
        let mut ctx = Vp8EncodingContext::new();
        ctx.set_target_temporal_layer(1);

        let mut data = payload(10, 1, 0, false, false);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));

        // Target raised, but TL2 keeps being dropped until a key frame.
        ctx.set_target_temporal_layer(2);
        let mut data = payload(11, 1, 2, false, false);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(!handler.process(&mut ctx, &mut data));

        // Key frame: current jumps to target, TL2 flows.
        let mut data = payload(12, 2, 0, false, true);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));
        assert_eq!(ctx.current_temporal_layer(), 2);

        let mut data = payload(13, 2, 2, false, false);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));
    }

    #[test]
    fn sync_rebases_downstream_ids() {
        let mut ctx = Vp8EncodingContext::new();

        let mut data = payload(1000, 50, 0, false, true);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));
        let d = Vp8Descriptor::parse(&data).unwrap();
        assert_eq!(d.picture_id, 1);
        assert_eq!(d.tl0_picture_index, 1);

        // Source swap: far away ids, sync_required re-bases.
        ctx.sync_required = true;
        let mut data = payload(30_000, 200, 0, false, true);
        let handler = Vp8Handler::parse(&data).unwrap();
        assert!(handler.process(&mut ctx, &mut data));
        let d = Vp8Descriptor::parse(&data).unwrap();
        assert_eq!(d.picture_id, 2);
        assert_eq!(d.tl0_picture_index, 2);
    }
}
