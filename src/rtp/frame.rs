//! RTP frame model per RFC 3550.
//!
//! A frame owns its wire bytes and keeps the parsed view as ranges into the
//! same storage, so the encoded and expanded forms coexist without copying.
//! Sequence numbers compare with serial-number arithmetic: ordering is only
//! defined for distances below half the 16-bit circle.

use std::ops::Range;

use crate::pool::PooledBuf;

/// Minimum RTP header size in bytes.
pub const RTP_HEADER_MIN_LENGTH: usize = 12;

/// The only supported RTP version.
pub const RTP_VERSION: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum RtpParseError {
    #[error("datagram too short for RTP header ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
    #[error("padding length exceeds frame")]
    BadPadding,
    #[error("extension block exceeds frame")]
    BadExtension,
}

/// Fixed RTP header fields (12 bytes plus the CSRC list).
#[derive(Debug, Clone)]
pub struct RtpHeader {
    /// RTP version (always 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (0-127)
    pub payload_type: u8,
    /// Sequence number (wraps at 65535)
    pub sequence: u16,
    /// Timestamp in sample units
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    fn parse(data: &[u8]) -> Result<Self, RtpParseError> {
        if data.len() < RTP_HEADER_MIN_LENGTH {
            return Err(RtpParseError::Truncated(data.len()));
        }

        let first = data[0];
        let second = data[1];

        let version = (first >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(RtpParseError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            padding: (first & 0x20) != 0,
            extension: (first & 0x10) != 0,
            csrc_count: first & 0x0F,
            marker: (second & 0x80) != 0,
            payload_type: second & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let first = (self.version << 6)
            | if self.padding { 0x20 } else { 0 }
            | if self.extension { 0x10 } else { 0 }
            | (self.csrc_count & 0x0F);
        let second = if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7F);

        out.push(first);
        out.push(second);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }
}

/// Header-extension view: profile-defined type plus the extension words.
#[derive(Debug, Clone)]
struct ExtensionView {
    kind: u16,
    data: Range<usize>,
}

/// A parsed RTP frame owning its wire bytes.
#[derive(Debug)]
pub struct RtpFrame {
    /// Parsed fixed header
    pub header: RtpHeader,
    csrc: Vec<u32>,
    data: PooledBuf,
    payload: Range<usize>,
    /// Padding bytes before the trailing length octet
    padding: Range<usize>,
    extension: Option<ExtensionView>,
}

impl RtpFrame {
    /// Parse a frame from an owned datagram buffer.
    ///
    /// The buffer becomes the frame's storage; payload, padding and
    /// extension are views into it.
    pub fn parse(data: PooledBuf) -> Result<Self, RtpParseError> {
        let header = RtpHeader::parse(&data)?;

        let mut offset = RTP_HEADER_MIN_LENGTH + header.csrc_count as usize * 4;
        if data.len() < offset {
            return Err(RtpParseError::Truncated(data.len()));
        }

        let mut csrc = Vec::with_capacity(header.csrc_count as usize);
        for i in 0..header.csrc_count as usize {
            let at = RTP_HEADER_MIN_LENGTH + i * 4;
            csrc.push(u32::from_be_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ]));
        }

        let extension = if header.extension {
            if data.len() < offset + 4 {
                return Err(RtpParseError::BadExtension);
            }
            let kind = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let start = offset + 4;
            let end = start + words * 4;
            if data.len() < end {
                return Err(RtpParseError::BadExtension);
            }
            offset = end;
            Some(ExtensionView {
                kind,
                data: start..end,
            })
        } else {
            None
        };

        let (payload_end, padding) = if header.padding {
            // Last octet is the 1-based padding length, including itself
            let padding_len = *data.last().ok_or(RtpParseError::BadPadding)? as usize;
            if padding_len == 0 || padding_len > data.len() - offset {
                return Err(RtpParseError::BadPadding);
            }
            let end = data.len() - padding_len;
            (end, end..data.len() - 1)
        } else {
            (data.len(), data.len()..data.len())
        };

        Ok(Self {
            header,
            csrc,
            payload: offset..payload_end,
            padding,
            extension,
            data,
        })
    }

    /// Parse a frame from a plain byte vector.
    pub fn parse_bytes(bytes: Vec<u8>) -> Result<Self, RtpParseError> {
        Self::parse(PooledBuf::unpooled(bytes))
    }

    /// Codec-opaque payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload.clone()]
    }

    /// Contributing source identifiers.
    pub fn csrc(&self) -> &[u32] {
        &self.csrc
    }

    /// Padding bytes, excluding the trailing length octet.
    pub fn padding(&self) -> &[u8] {
        &self.data[self.padding.clone()]
    }

    /// Header extension as (type, data), if present.
    pub fn extension(&self) -> Option<(u16, &[u8])> {
        self.extension
            .as_ref()
            .map(|ext| (ext.kind, &self.data[ext.data.clone()]))
    }

    /// The raw wire bytes this frame was parsed from.
    pub fn as_wire(&self) -> &[u8] {
        &self.data
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }
}

/// Builder producing wire-encoded RTP frames for one outgoing stream.
///
/// Sequence number and timestamp advance automatically on every build.
pub struct RtpFrameBuilder {
    ssrc: u32,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    marker: bool,
    csrc: Vec<u32>,
}

impl RtpFrameBuilder {
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        Self {
            ssrc,
            payload_type,
            sequence: 0,
            timestamp: 0,
            marker: false,
            csrc: Vec::new(),
        }
    }

    /// Override the next sequence number.
    pub fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }

    /// Override the next timestamp.
    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// Set the marker bit on the next frame.
    pub fn set_marker(&mut self, marker: bool) {
        self.marker = marker;
    }

    /// Contributing sources carried in every built frame (at most 15).
    pub fn set_csrc(&mut self, csrc: &[u32]) {
        self.csrc = csrc.iter().copied().take(15).collect();
    }

    /// Encode one frame around `payload`, advancing sequence and timestamp
    /// (`samples_per_frame` timestamp units per frame).
    pub fn build_wire(&mut self, payload: &[u8], samples_per_frame: u32) -> Vec<u8> {
        let header = RtpHeader {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: self.csrc.len() as u8,
            marker: self.marker,
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };

        let mut out = Vec::with_capacity(RTP_HEADER_MIN_LENGTH + self.csrc.len() * 4 + payload.len());
        header.encode(&mut out);
        for id in &self.csrc {
            out.extend_from_slice(&id.to_be_bytes());
        }
        out.extend_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples_per_frame);
        self.marker = false;

        out
    }

    /// Build and immediately re-parse, yielding an owned frame.
    pub fn build_frame(&mut self, payload: &[u8], samples_per_frame: u32) -> RtpFrame {
        let wire = self.build_wire(payload, samples_per_frame);
        RtpFrame::parse_bytes(wire).expect("built frame must parse")
    }
}

/// Signed distance from `a` to `b` on the 16-bit sequence circle.
///
/// Positive if `b` is ahead of `a`, negative if behind.
pub fn sequence_diff(a: u16, b: u16) -> i32 {
    let diff = b.wrapping_sub(a) as i16;
    diff as i32
}

/// True iff `a` is strictly older than `b` (serial-number comparison).
pub fn sequence_older(a: u16, b: u16) -> bool {
    sequence_diff(a, b) > 0
}
