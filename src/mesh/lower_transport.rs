//! Lower transport layer
//!
//! ```text
//! Unsegmented access:   SEG=0 | AKF | AID(6)  || UpperTransportPDU
//! Unsegmented control:  SEG=0 | Opcode(7)     || Parameters
//! Segmented:            SEG=1 | AKF/AID or Opcode
//!                       SZMIC(1) | SeqZero(13) | SegO(5) | SegN(5) || Segment
//! ```

use std::fmt;

use super::network::NetworkPdu;
use super::{DecodeError, Layer};

/// Segment payload size for access and control messages
pub const ACCESS_SEGMENT_LEN: usize = 12;
pub const CONTROL_SEGMENT_LEN: usize = 8;

const SEG_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Access { akf: bool, aid: u8 },
    Control { opcode: u8 },
}

impl TransportKind {
    pub fn segment_len(&self) -> usize {
        match self {
            TransportKind::Access { .. } => ACCESS_SEGMENT_LEN,
            TransportKind::Control { .. } => CONTROL_SEGMENT_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub szmic: bool,
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
}

impl SegmentHeader {
    /// Reconstruct SeqAuth from the SEQ of the PDU carrying this segment.
    ///
    /// SeqZero holds the low 13 bits of the first segment's SEQ; when the
    /// current SEQ has wrapped past a 0x2000 boundary since then, the high
    /// bits are one step too far.
    pub fn seq_auth(&self, seq: u32) -> u32 {
        let seq_zero = u32::from(self.seq_zero);
        let seq_auth = (seq & !0x1fff) | seq_zero;
        if (seq & 0x1fff) < seq_zero {
            seq_auth.checked_sub(0x2000).unwrap_or(seq_auth)
        } else {
            seq_auth
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportBody {
    Unsegmented {
        upper_transport: Vec<u8>,
    },
    Segmented {
        header: SegmentHeader,
        segment: Vec<u8>,
    },
}

/// A parsed lower transport PDU with the addressing inherited from its network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerTransportPdu {
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
    pub kind: TransportKind,
    pub body: LowerTransportBody,
}

impl LowerTransportPdu {
    pub fn parse(network: &NetworkPdu) -> Result<Self, DecodeError> {
        let data = &network.lower_transport;
        let Some(&first) = data.first() else {
            return Err(DecodeError::malformed(
                Layer::LowerTransport,
                "empty lower transport PDU",
            ));
        };

        let seg = first & 0x80 != 0;
        let kind = if network.ctl {
            TransportKind::Control {
                opcode: first & 0x7f,
            }
        } else {
            TransportKind::Access {
                akf: first & 0x40 != 0,
                aid: first & 0x3f,
            }
        };

        let body = if seg {
            if data.len() <= SEG_HEADER_LEN {
                return Err(DecodeError::malformed(
                    Layer::LowerTransport,
                    format!("segmented PDU too short: {} bytes", data.len()),
                ));
            }
            let seq_zero_bits = u16::from_be_bytes([data[1], data[2]]);
            let seg_bits = u16::from_be_bytes([data[2], data[3]]);
            let header = SegmentHeader {
                // SZMIC is only read for control segments
                szmic: network.ctl && data[1] & 0x80 != 0,
                seq_zero: (seq_zero_bits >> 2) & 0x1fff,
                seg_o: ((seg_bits >> 5) & 0x1f) as u8,
                seg_n: (seg_bits & 0x1f) as u8,
            };
            if header.seg_o > header.seg_n {
                return Err(DecodeError::malformed(
                    Layer::LowerTransport,
                    format!("SegO {} exceeds SegN {}", header.seg_o, header.seg_n),
                ));
            }
            LowerTransportBody::Segmented {
                header,
                segment: data[SEG_HEADER_LEN..].to_vec(),
            }
        } else {
            LowerTransportBody::Unsegmented {
                upper_transport: data[1..].to_vec(),
            }
        };

        Ok(Self {
            seq: network.seq,
            src: network.src,
            dst: network.dst,
            kind,
            body,
        })
    }
}

impl fmt::Display for LowerTransportPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::Access { akf, aid } => {
                write!(f, "Lower Transport AKF={} AID={:02x}", akf as u8, aid)?
            }
            TransportKind::Control { opcode } => {
                write!(f, "Lower Transport Opcode={:02x}", opcode)?
            }
        }
        match &self.body {
            LowerTransportBody::Unsegmented { upper_transport } => {
                write!(f, " unsegmented {} bytes", upper_transport.len())
            }
            LowerTransportBody::Segmented { header, segment } => write!(
                f,
                " SZMIC={} SeqZero={:04x} SegO={} SegN={} segment {} bytes",
                header.szmic as u8,
                header.seq_zero,
                header.seg_o,
                header.seg_n,
                segment.len()
            ),
        }
    }
}
