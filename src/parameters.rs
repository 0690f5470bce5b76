//! RTP parameter and capability types, as exchanged over the control
//! channel.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::WorkerError;

/// Media kind of a stream or entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Simulcast quality tier of an encoding.
///
/// Ordered: `None < Low < Medium < High`. `None` doubles as the sentinel
/// for "no simulcast", which is why it sorts lowest.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::None => "none",
            Profile::Low => "low",
            Profile::Medium => "medium",
            Profile::High => "high",
        }
    }

    /// The VP8 temporal layer ceiling a subscriber at this tier gets.
    pub fn temporal_layer(&self) -> u8 {
        match self {
            Profile::Low => 0,
            Profile::Medium => 1,
            Profile::None | Profile::High => 2,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One `rtcpFeedback` entry of a codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// Mime, e.g. "video/VP8".
    pub name: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

impl RtpCodecParameters {
    pub fn kind(&self) -> Option<MediaKind> {
        let (kind, _) = self.name.split_once('/')?;
        match kind {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn is_rtx(&self) -> bool {
        self.name
            .rsplit_once('/')
            .map(|(_, subtype)| subtype.eq_ignore_ascii_case("rtx"))
            .unwrap_or(false)
    }

    /// The `apt` parameter of an RTX codec, the PT it retransmits for.
    pub fn apt(&self) -> Option<u8> {
        self.parameters.get("apt")?.as_u64().map(|v| v as u8)
    }

    pub fn nack_supported(&self) -> bool {
        self.rtcp_feedback
            .iter()
            .any(|fb| fb.kind == "nack" && fb.parameter.is_empty())
    }

    pub fn pli_supported(&self) -> bool {
        self.rtcp_feedback
            .iter()
            .any(|fb| fb.kind == "nack" && fb.parameter == "pli")
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtxParameters {
    #[serde(default)]
    pub ssrc: u32,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default)]
    pub ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default)]
    pub profile: Profile,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default)]
    pub cname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default = "default_true")]
    pub reduced_size: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_id: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// The media codec an encoding uses: its `codecPayloadType` when given,
    /// otherwise the first non-RTX codec.
    pub fn codec_for_encoding(
        &self,
        encoding: &RtpEncodingParameters,
    ) -> Result<&RtpCodecParameters, WorkerError> {
        let codec = match encoding.codec_payload_type {
            Some(pt) => self.codecs.iter().find(|c| c.payload_type == pt),
            None => self.codecs.iter().find(|c| !c.is_rtx()),
        };

        codec.ok_or_else(|| WorkerError::protocol("no media codec for encoding"))
    }

    /// The RTX codec paired with the encoding's media codec, if negotiated.
    pub fn rtx_codec_for_encoding(
        &self,
        encoding: &RtpEncodingParameters,
    ) -> Option<&RtpCodecParameters> {
        let media_pt = self.codec_for_encoding(encoding).ok()?.payload_type;
        self.codecs
            .iter()
            .find(|c| c.is_rtx() && c.apt() == Some(media_pt))
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
    #[serde(default)]
    pub fec_mechanisms: Vec<serde_json::Value>,
}

/// Dynamic payload types handed out to room codecs without one, in
/// preference order.
pub(crate) const DYNAMIC_PAYLOAD_TYPES: &[u8] = &[
    100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114, 115, 116, 117, 118,
    119, 120, 121, 122, 123, 124, 125, 126, 127, 96, 97, 98, 99, 77, 78, 79, 80, 81, 82, 83, 84,
    85, 86, 87, 88, 89, 90, 91, 92, 93, 94, 95, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46,
    47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69,
    70, 71,
];
