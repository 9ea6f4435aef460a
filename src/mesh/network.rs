//! Network layer: de-obfuscation, decryption and header parsing

use std::fmt;

use tracing::debug;

use super::crypto::{self, MIN_NETWORK_PDU_LEN};
use super::keys::KeyStore;
use super::{DecodeError, Layer};

/// Cleartext header length: IVI/NID(1) CTL/TTL(1) SEQ(3) SRC(2) DST(2)
pub const NETWORK_HEADER_LEN: usize = 9;

/// A decrypted network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Index of the network key that authenticated this PDU
    pub net_key_index: u16,
    pub ivi: u8,
    pub nid: u8,
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
    pub lower_transport: Vec<u8>,
}

impl NetworkPdu {
    /// Parse a cleartext network PDU as produced by [`crypto::network_decrypt`]
    pub fn parse(net_key_index: u16, data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < NETWORK_HEADER_LEN {
            return Err(DecodeError::malformed(
                Layer::Network,
                format!("cleartext PDU too short: {} bytes", data.len()),
            ));
        }

        Ok(Self {
            net_key_index,
            ivi: data[0] >> 7,
            nid: data[0] & 0x7f,
            ctl: data[1] & 0x80 != 0,
            ttl: data[1] & 0x7f,
            seq: u32::from_be_bytes([0, data[2], data[3], data[4]]),
            src: u16::from_be_bytes([data[5], data[6]]),
            dst: u16::from_be_bytes([data[7], data[8]]),
            lower_transport: data[NETWORK_HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Display for NetworkPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Network IVI={} NID={:02x} CTL={} TTL={} SEQ={:06x} SRC={:04x} DST={:04x} NetKey={:04x}",
            self.ivi,
            self.nid,
            self.ctl as u8,
            self.ttl,
            self.seq,
            self.src,
            self.dst,
            self.net_key_index,
        )
    }
}

/// Trial-decrypt an encrypted network PDU against every network key whose NID
/// matches the cleartext NID, using the current IV Index.
///
/// The first key that authenticates wins.
pub fn decrypt(keys: &KeyStore, data: &[u8]) -> Result<NetworkPdu, DecodeError> {
    if data.len() < MIN_NETWORK_PDU_LEN {
        return Err(DecodeError::malformed(
            Layer::Network,
            format!("PDU too short: {} bytes", data.len()),
        ));
    }

    let nid = data[0] & 0x7f;
    let iv_index = keys.iv_index();
    for key in keys.network_keys_matching(nid) {
        if let Some(clear) =
            crypto::network_decrypt(data, iv_index, &key.encryption_key, &key.privacy_key)
        {
            return NetworkPdu::parse(key.index, &clear);
        }
        debug!("NetKey-{:04x} did not authenticate PDU with NID {:02x}", key.index, nid);
    }

    Err(DecodeError::NoMatchingKey)
}
