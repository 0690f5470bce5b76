//! Codec payload descriptor handling.
//!
//! RTP forwarding is codec-agnostic except for the payload descriptor in
//! front of the encoded frame data. Codecs with scalability information in
//! that descriptor (VP8) get a handler that decides forward/drop per packet
//! and rewrites the descriptor in place to keep the downstream id spaces
//! continuous.

pub mod vp8;

pub use vp8::{Vp8EncodingContext, Vp8Handler};

/// Per-consumer rewrite context for the negotiated codec.
///
/// `None`-handled codecs (audio, unknown video) forward packets untouched.
#[derive(Debug, Clone)]
pub enum EncodingContext {
    Vp8(Vp8EncodingContext),
}

impl EncodingContext {
    /// The context for a codec, by mime type. Codecs without descriptor
    /// rewriting have no context.
    pub fn for_mime(mime: &str) -> Option<EncodingContext> {
        if mime.eq_ignore_ascii_case("video/VP8") {
            Some(EncodingContext::Vp8(Vp8EncodingContext::new()))
        } else {
            None
        }
    }

    /// Reset continuity, next packet re-bases the managed id spaces.
    pub fn set_sync_required(&mut self) {
        match self {
            EncodingContext::Vp8(ctx) => ctx.sync_required = true,
        }
    }

    /// Adjust the temporal layer ceiling.
    pub fn set_target_temporal_layer(&mut self, layer: u8) {
        match self {
            EncodingContext::Vp8(ctx) => ctx.set_target_temporal_layer(layer),
        }
    }
}

/// Normalizes a freshly received packet's payload descriptor, when the
/// codec needs it. Called once at Producer ingestion.
pub fn normalize_packet(mime: &str, packet: &mut crate::rtp::RtpPacket) {
    if mime.eq_ignore_ascii_case("video/VP8") {
        vp8::normalize(packet);
    }
}
