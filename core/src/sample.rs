//! The data model flowing through the engine: codec-tagged payloads, track
//! descriptors, and the session description a publisher announces.

use bytes::Bytes;

/// Codec-specific parameters carried alongside a [`Format`].
///
/// Kept as a flat enum (never a trait object) so the compiler enforces that
/// every codec variant is handled explicitly wherever a `Format` is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecParameters {
    H264 {
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    H265 {
        vps: Vec<u8>,
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    Av1,
    Vp9,
    Mpeg4Audio {
        config: Vec<u8>,
    },
    Opus {
        channels: u8,
    },
    Mpeg1Audio,
    Mpeg1Video,
    Ac3,
    Klv,
    Latm {
        config: Vec<u8>,
    },
    /// Pass-through: the wire payload is delivered unparsed to readers that
    /// opted in to the same representation as the publisher's.
    RtpPassthrough {
        payload_type: u8,
    },
}

/// A codec descriptor: clock rate, codec-specific parameter sets, and a
/// protocol-independent payload type used to negotiate compatibility between
/// a publisher and a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub clock_rate: u32,
    pub parameters: CodecParameters,
}

impl Format {
    pub fn new(clock_rate: u32, parameters: CodecParameters) -> Self {
        Self {
            clock_rate,
            parameters,
        }
    }

    /// Short codec name, used for logging and the recent-units ring default
    /// window (see `Stream::recent_units_window_for`).
    pub fn codec_name(&self) -> &'static str {
        match self.parameters {
            CodecParameters::H264 { .. } => "h264",
            CodecParameters::H265 { .. } => "h265",
            CodecParameters::Av1 => "av1",
            CodecParameters::Vp9 => "vp9",
            CodecParameters::Mpeg4Audio { .. } => "mpeg4-audio",
            CodecParameters::Opus { .. } => "opus",
            CodecParameters::Mpeg1Audio => "mpeg1-audio",
            CodecParameters::Mpeg1Video => "mpeg1-video",
            CodecParameters::Ac3 => "ac3",
            CodecParameters::Klv => "klv",
            CodecParameters::Latm { .. } => "latm",
            CodecParameters::RtpPassthrough { .. } => "rtp",
        }
    }

    /// Whether this codec is a video codec with a group-of-pictures
    /// structure, used to size the recent-units ring (one GOP, not one unit).
    pub fn is_gop_based_video(&self) -> bool {
        matches!(
            self.parameters,
            CodecParameters::H264 { .. } | CodecParameters::H265 { .. } | CodecParameters::Av1
        )
    }
}

/// The codec-tagged payload of one Sample Unit.
///
/// Each variant is an ordered list of byte buffers: NAL units for H.26x, OBUs
/// for AV1, access units for MPEG-4 audio, one packet for Opus, etc.
#[derive(Debug, Clone)]
pub enum Payload {
    H264(Vec<Bytes>),
    H265(Vec<Bytes>),
    Av1(Vec<Bytes>),
    Vp9(Vec<Bytes>),
    Mpeg4Audio(Vec<Bytes>),
    Opus(Vec<Bytes>),
    Mpeg1Audio(Bytes),
    Mpeg1Video(Bytes),
    Ac3(Vec<Bytes>),
    Klv(Bytes),
    Latm(Bytes),
    RtpPassthrough(Vec<Bytes>),
}

impl Payload {
    /// Total byte length of the payload, used for metrics and the ring
    /// buffer's size accounting.
    pub fn byte_len(&self) -> usize {
        match self {
            Payload::H264(v)
            | Payload::H265(v)
            | Payload::Av1(v)
            | Payload::Vp9(v)
            | Payload::Mpeg4Audio(v)
            | Payload::Opus(v)
            | Payload::Ac3(v)
            | Payload::RtpPassthrough(v) => v.iter().map(Bytes::len).sum(),
            Payload::Mpeg1Audio(b) | Payload::Mpeg1Video(b) | Payload::Klv(b) | Payload::Latm(b) => {
                b.len()
            }
        }
    }
}

/// One decoded access unit handed between components.
///
/// Once constructed, a `SampleUnit`'s fields are never mutated; one unit may
/// be observed by many readers concurrently (it is cheap to clone: the
/// payload's byte buffers are `Bytes`, an `Arc`-backed reference-counted
/// view).
#[derive(Debug, Clone)]
pub struct SampleUnit {
    /// Monotonic presentation timestamp, in the format's clock rate.
    pub pts: i64,
    /// Absolute wall-clock timestamp, when known (e.g. from an NTP-synced
    /// source or RTCP sender report).
    pub ntp_time: Option<i64>,
    pub payload: Payload,
}

impl SampleUnit {
    pub fn new(pts: i64, payload: Payload) -> Self {
        Self {
            pts,
            ntp_time: None,
            payload,
        }
    }

    pub fn with_ntp_time(mut self, ntp_time: i64) -> Self {
        self.ntp_time = Some(ntp_time);
        self
    }
}

/// A logical track: video, audio, or data, carrying one or more alternative
/// [`Format`]s (e.g. a video track offered as both H.264 and H.265).
#[derive(Debug, Clone)]
pub struct Media {
    pub kind: MediaKind,
    pub formats: Vec<Format>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Data,
}

impl Media {
    pub fn new(kind: MediaKind, formats: Vec<Format>) -> Self {
        assert!(!formats.is_empty(), "a Media must offer at least one Format");
        Self { kind, formats }
    }
}

/// An ordered list of [`Media`] entries a publisher announces.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    pub medias: Vec<Media>,
}

impl SessionDescription {
    pub fn new(medias: Vec<Media>) -> Self {
        Self { medias }
    }

    /// Finds the first `(media_index, format)` pair whose format equals
    /// `wanted`, used by `Stream::add_reader` to validate that a reader asks
    /// for a format the publisher actually advertised.
    pub fn find_format(&self, wanted: &Format) -> Option<(usize, &Format)> {
        self.medias.iter().enumerate().find_map(|(idx, media)| {
            media
                .formats
                .iter()
                .find(|f| *f == wanted)
                .map(|f| (idx, f))
        })
    }
}
