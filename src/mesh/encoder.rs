//! Test-only message builder
//!
//! Runs the decode pipeline backwards: encrypts an access payload at the upper
//! transport layer, segments it, and wraps each lower transport PDU in an
//! encrypted, obfuscated network PDU.

use super::crypto::{self, Key};
use super::keys::{ApplicationKey, NetworkKey};
use super::lower_transport::ACCESS_SEGMENT_LEN;
use super::upper_transport::{transport_nonce, NonceType};

pub enum TxKey<'a> {
    App(&'a ApplicationKey),
    Device(&'a Key),
}

pub struct MessageBuilder<'a> {
    pub net_key: &'a NetworkKey,
    pub iv_index: u32,
    pub src: u16,
    pub dst: u16,
    pub ttl: u8,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(net_key: &'a NetworkKey, iv_index: u32, src: u16, dst: u16) -> Self {
        Self {
            net_key,
            iv_index,
            src,
            dst,
            ttl: 5,
        }
    }

    /// Encrypt and obfuscate one network PDU
    pub fn network_pdu(&self, ctl: bool, seq: u32, lower_transport: &[u8]) -> Vec<u8> {
        let ctl_ttl = ((ctl as u8) << 7) | (self.ttl & 0x7f);
        let mic_len = if ctl { 8 } else { 4 };

        let mut clear = self.dst.to_be_bytes().to_vec();
        clear.extend_from_slice(lower_transport);
        let nonce = crypto::network_nonce(ctl_ttl, seq, self.src, self.iv_index);
        let encrypted = crypto::ccm_encrypt(&self.net_key.encryption_key, &nonce, &clear, mic_len);

        let pecb = crypto::pecb(&self.net_key.privacy_key, self.iv_index, &encrypted[..7]);
        let seq = seq.to_be_bytes();
        let src = self.src.to_be_bytes();
        let header = [ctl_ttl, seq[1], seq[2], seq[3], src[0], src[1]];

        let mut pdu = vec![(((self.iv_index & 1) as u8) << 7) | self.net_key.nid];
        pdu.extend(header.iter().zip(&pecb[..6]).map(|(b, p)| b ^ p));
        pdu.extend_from_slice(&encrypted);
        pdu
    }

    /// Unsegmented control PDU carrying raw parameters
    pub fn control(&self, opcode: u8, seq: u32, parameters: &[u8]) -> Vec<u8> {
        let mut lower = vec![opcode & 0x7f];
        lower.extend_from_slice(parameters);
        self.network_pdu(true, seq, &lower)
    }

    /// Encrypt an access payload and return its network PDUs in segment order.
    ///
    /// Segment `n` is sent with SEQ `seq + n`; SeqAuth is `seq`.
    pub fn access(&self, key: TxKey<'_>, seq: u32, plaintext: &[u8], segmented: bool) -> Vec<Vec<u8>> {
        let (akf, aid, raw_key, nonce_type) = match key {
            TxKey::App(k) => (true, k.aid, &k.key, NonceType::Application),
            TxKey::Device(k) => (false, 0, k, NonceType::Device),
        };
        let nonce = transport_nonce(nonce_type, false, seq, self.src, self.dst, self.iv_index);
        let upper = crypto::ccm_encrypt(raw_key, &nonce, plaintext, 4);
        let first = ((akf as u8) << 6) | aid;

        if !segmented {
            let mut lower = vec![first];
            lower.extend_from_slice(&upper);
            return vec![self.network_pdu(false, seq, &lower)];
        }

        let chunks: Vec<&[u8]> = upper.chunks(ACCESS_SEGMENT_LEN).collect();
        let seg_n = (chunks.len() - 1) as u8;
        let seq_zero = (seq & 0x1fff) as u16;
        chunks
            .iter()
            .enumerate()
            .map(|(seg_o, chunk)| {
                let seg_o = seg_o as u8;
                let mut lower = vec![
                    0x80 | first,
                    ((seq_zero >> 6) as u8) & 0x7f,
                    (((seq_zero & 0x3f) << 2) as u8) | (seg_o >> 3),
                    ((seg_o & 0x07) << 5) | seg_n,
                ];
                lower.extend_from_slice(chunk);
                self.network_pdu(false, seq + u32::from(seg_o), &lower)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::network::NetworkPdu;

    #[test]
    fn test_network_pdu_roundtrip_through_decrypt() {
        let net_key = NetworkKey::new(0, &[0x42; 16]).unwrap();
        let builder = MessageBuilder::new(&net_key, 0x0000_0001, 0x0102, 0xC000);
        let pdu = builder.network_pdu(false, 0x000123, &[0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);

        let clear = crypto::network_decrypt(&pdu, 1, &net_key.encryption_key, &net_key.privacy_key)
            .expect("decrypts under the same keys");
        let parsed = NetworkPdu::parse(0, &clear).unwrap();
        assert_eq!(parsed.ivi, 1);
        assert_eq!(parsed.nid, net_key.nid);
        assert!(!parsed.ctl);
        assert_eq!(parsed.ttl, 5);
        assert_eq!(parsed.seq, 0x000123);
        assert_eq!(parsed.src, 0x0102);
        assert_eq!(parsed.dst, 0xC000);
        assert_eq!(parsed.lower_transport, vec![0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);

        // Wrong IV Index changes both PECB and the nonce
        assert!(crypto::network_decrypt(&pdu, 2, &net_key.encryption_key, &net_key.privacy_key)
            .is_none());
    }

    #[test]
    fn test_segmented_access_split() {
        let net_key = NetworkKey::new(0, &[0x42; 16]).unwrap();
        let app_key = ApplicationKey::new(0, &[0x24; 16]).unwrap();
        let builder = MessageBuilder::new(&net_key, 0, 0x0001, 0x0002);
        // 30 bytes plaintext + 4 byte TransMIC -> 12 + 12 + 10
        let pdus = builder.access(TxKey::App(&app_key), 0x10, &[0x55; 30], true);
        assert_eq!(pdus.len(), 3);
    }
}
