//! Upper transport layer: nonce construction and AEAD trial decryption

use std::fmt;

use tracing::debug;

use super::crypto::{self, Nonce, NONCE_LEN};
use super::keys::KeyStore;
use super::{DecodeError, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NonceType {
    Application = 0x01,
    Device = 0x02,
}

/// Application/device nonce:
///
/// ```text
/// type(1) | ASZMIC<<7 (1) | SeqAuth(3) | SRC(2) | DST(2) | IV Index(4)
/// ```
pub fn transport_nonce(
    nonce_type: NonceType,
    szmic: bool,
    seq_auth: u32,
    src: u16,
    dst: u16,
    iv_index: u32,
) -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = nonce_type as u8;
    nonce[1] = if szmic { 0x80 } else { 0x00 };
    nonce[2..5].copy_from_slice(&(seq_auth & 0xff_ffff).to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[7..9].copy_from_slice(&dst.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// The key that authenticated an upper transport PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKey {
    Application { index: u16, aid: u8 },
    Device,
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKey::Application { index, aid } => {
                write!(f, "AppKey-{:04x} (AID {:02x})", index, aid)
            }
            TransportKey::Device => write!(f, "DevKey"),
        }
    }
}

/// An encrypted upper transport access PDU, either carried whole in one
/// unsegmented lower transport PDU or reassembled from segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpperTransportPdu {
    pub src: u16,
    pub dst: u16,
    pub akf: bool,
    pub aid: u8,
    pub szmic: bool,
    pub seq_auth: u32,
    pub net_key_index: u16,
    /// Number of lower transport PDUs this message arrived in
    pub segments: usize,
    pub payload: Vec<u8>,
}

impl UpperTransportPdu {
    pub fn trans_mic_len(&self) -> usize {
        if self.szmic {
            8
        } else {
            4
        }
    }

    pub fn nonce(&self, nonce_type: NonceType, iv_index: u32) -> Nonce {
        transport_nonce(nonce_type, self.szmic, self.seq_auth, self.src, self.dst, iv_index)
    }

    /// Trial-decrypt with the application keys matching AID (AKF set) or the
    /// device key (AKF clear), using the current IV Index.
    ///
    /// A failed tag and an absent key are the same outcome.
    pub fn decrypt(&self, keys: &KeyStore) -> Result<(Vec<u8>, TransportKey), DecodeError> {
        let mic_len = self.trans_mic_len();
        if self.payload.len() <= mic_len {
            return Err(DecodeError::malformed(
                Layer::UpperTransport,
                format!(
                    "{} bytes cannot hold a {}-byte TransMIC and a payload",
                    self.payload.len(),
                    mic_len
                ),
            ));
        }
        let (ciphertext, trans_mic) = self.payload.split_at(self.payload.len() - mic_len);
        let iv_index = keys.iv_index();

        if self.akf {
            let nonce = self.nonce(NonceType::Application, iv_index);
            for key in keys.application_keys_matching(self.aid) {
                if let Some(plaintext) = crypto::ccm_decrypt(&key.key, &nonce, ciphertext, trans_mic) {
                    return Ok((
                        plaintext,
                        TransportKey::Application {
                            index: key.index,
                            aid: key.aid,
                        },
                    ));
                }
                debug!("AppKey-{:04x} did not authenticate message from {:04x}", key.index, self.src);
            }
        } else if let Some(device_key) = keys.device_key() {
            let nonce = self.nonce(NonceType::Device, iv_index);
            if let Some(plaintext) = crypto::ccm_decrypt(device_key, &nonce, ciphertext, trans_mic) {
                return Ok((plaintext, TransportKey::Device));
            }
            debug!("DevKey did not authenticate message from {:04x}", self.src);
        }

        Err(DecodeError::NoMatchingKey)
    }
}

impl fmt::Display for UpperTransportPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Upper Transport SRC={:04x} DST={:04x} AKF={} AID={:02x} SZMIC={} SeqAuth={:06x} segments={} payload={}",
            self.src,
            self.dst,
            self.akf as u8,
            self.aid,
            self.szmic as u8,
            self.seq_auth,
            self.segments,
            hex::encode(&self.payload),
        )
    }
}
