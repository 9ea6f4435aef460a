//! Access layer: the terminal decoded message

use std::fmt;

use super::upper_transport::{TransportKey, UpperTransportPdu};

/// A decrypted access message with its addressing.
///
/// The plaintext is left as-is: opcode and parameters are not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPdu {
    pub src: u16,
    pub dst: u16,
    pub akf: bool,
    pub aid: u8,
    pub seq_auth: u32,
    pub net_key_index: u16,
    pub key: TransportKey,
    pub segments: usize,
    pub plaintext: Vec<u8>,
}

impl AccessPdu {
    pub fn new(upper: &UpperTransportPdu, key: TransportKey, plaintext: Vec<u8>) -> Self {
        Self {
            src: upper.src,
            dst: upper.dst,
            akf: upper.akf,
            aid: upper.aid,
            seq_auth: upper.seq_auth,
            net_key_index: upper.net_key_index,
            key,
            segments: upper.segments,
            plaintext,
        }
    }
}

impl fmt::Display for AccessPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Access SRC={:04x} DST={:04x} AKF={} AID={:02x} SeqAuth={:06x} Key={} data={}",
            self.src,
            self.dst,
            self.akf as u8,
            self.aid,
            self.seq_auth,
            self.key,
            hex::encode(&self.plaintext),
        )
    }
}
