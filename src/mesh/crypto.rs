//! Mesh security toolbox
//!
//! AES-CMAC based key derivation (s1, k2, k4), AES-CCM authenticated
//! decryption, and the network header obfuscation (PECB) step.
//!
//! Reference: Mesh Profile Specification 1.0, section 3.8.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use ccm::aead::Aead;
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac};

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 13;

/// IVI/NID(1) + obfuscated CTL/TTL, SEQ, SRC(6) + DST(2) + TransportPDU(>=1) + NetMIC(4)
pub const MIN_NETWORK_PDU_LEN: usize = 14;

pub type Key = [u8; KEY_LEN];
pub type Nonce = [u8; NONCE_LEN];

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

fn aes_cmac(key: &Key, parts: &[&[u8]]) -> Key {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&tag);
    out
}

fn aes_encrypt_block(key: &Key, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// Salt generation: AES-CMAC with an all-zero key
pub fn s1(m: &[u8]) -> Key {
    aes_cmac(&[0u8; KEY_LEN], &[m])
}

/// Network key material derivation
///
/// Returns `(NID, EncryptionKey, PrivacyKey)` for the master credentials when
/// `p` is `[0x00]`.
pub fn k2(n: &Key, p: &[u8]) -> (u8, Key, Key) {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, &[n]);
    let t1 = aes_cmac(&t, &[p, &[0x01]]);
    let t2 = aes_cmac(&t, &[&t1, p, &[0x02]]);
    let t3 = aes_cmac(&t, &[&t2, p, &[0x03]]);
    (t1[15] & 0x7f, t2, t3)
}

/// Application key identifier derivation (6-bit AID)
pub fn k4(n: &Key) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, &[n]);
    aes_cmac(&t, &[b"id6", &[0x01]])[15] & 0x3f
}

/// AES-CCM decrypt and authenticate, no additional data.
///
/// `mic` must be 4 or 8 bytes. Returns `None` when the tag does not verify.
pub fn ccm_decrypt(key: &Key, nonce: &Nonce, ciphertext: &[u8], mic: &[u8]) -> Option<Vec<u8>> {
    let mut sealed = Vec::with_capacity(ciphertext.len() + mic.len());
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(mic);

    let key = GenericArray::from_slice(key);
    let nonce = GenericArray::from_slice(nonce);
    match mic.len() {
        4 => Ccm32::new(key).decrypt(nonce, sealed.as_slice()).ok(),
        8 => Ccm64::new(key).decrypt(nonce, sealed.as_slice()).ok(),
        _ => None,
    }
}

/// AES-CCM encrypt, returning `ciphertext || mic`.
#[cfg(test)]
pub fn ccm_encrypt(key: &Key, nonce: &Nonce, plaintext: &[u8], mic_len: usize) -> Vec<u8> {
    let key = GenericArray::from_slice(key);
    let nonce = GenericArray::from_slice(nonce);
    let sealed = match mic_len {
        4 => Ccm32::new(key).encrypt(nonce, plaintext),
        8 => Ccm64::new(key).encrypt(nonce, plaintext),
        other => panic!("unsupported MIC length {}", other),
    };
    sealed.expect("CCM encryption")
}

/// Network nonce: type 0x00 | CTL/TTL | SEQ(3) | SRC(2) | pad(2) | IV Index(4)
pub(crate) fn network_nonce(ctl_ttl: u8, seq: u32, src: u16, iv_index: u32) -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[1] = ctl_ttl;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// PECB = e(PrivacyKey, 0x0000000000 || IV Index || PrivacyRandom[0..7])
///
/// The privacy random is the first 7 bytes of the encrypted DST/TransportPDU/NetMIC.
pub(crate) fn pecb(privacy_key: &Key, iv_index: u32, privacy_random: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(&privacy_random[..7]);
    aes_encrypt_block(privacy_key, &block)
}

/// Remove header obfuscation and decrypt a network PDU.
///
/// Returns the cleartext PDU (`IVI/NID | CTL/TTL | SEQ | SRC | DST | TransportPDU`)
/// with the NetMIC stripped, or `None` if the PDU does not authenticate under
/// these keys.
pub fn network_decrypt(
    pdu: &[u8],
    iv_index: u32,
    encryption_key: &Key,
    privacy_key: &Key,
) -> Option<Vec<u8>> {
    if pdu.len() < MIN_NETWORK_PDU_LEN {
        return None;
    }

    let pecb = pecb(privacy_key, iv_index, &pdu[7..14]);
    let mut clear = Vec::with_capacity(pdu.len());
    clear.push(pdu[0]);
    clear.extend(pdu[1..7].iter().zip(&pecb[..6]).map(|(b, p)| b ^ p));

    let ctl_ttl = clear[1];
    let mic_len = if ctl_ttl & 0x80 != 0 { 8 } else { 4 };
    // DST(2) + at least one transport byte must precede the NetMIC
    if pdu.len() < 7 + 2 + 1 + mic_len {
        return None;
    }

    let seq = u32::from_be_bytes([0, clear[2], clear[3], clear[4]]);
    let src = u16::from_be_bytes([clear[5], clear[6]]);
    let nonce = network_nonce(ctl_ttl, seq, src, iv_index);

    let (encrypted, mic) = pdu[7..].split_at(pdu.len() - 7 - mic_len);
    let plaintext = ccm_decrypt(encryption_key, &nonce, encrypted, mic)?;
    clear.extend_from_slice(&plaintext);
    Some(clear)
}
