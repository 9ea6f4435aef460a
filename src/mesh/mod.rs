//! Bluetooth Mesh receive-side protocol stack
//!
//! Each advertising payload flows network → lower transport → (reassembly) →
//! upper transport → access. [`MeshDecoder`] owns all protocol state (keys, IV
//! Index, in-flight segmented messages) and must be fed records in capture
//! order: provisioning changes and segments accumulate across records.

pub mod access;
pub mod adv;
pub mod crypto;
#[cfg(test)]
pub mod encoder;
pub mod keys;
pub mod lower_transport;
pub mod network;
pub mod reassembly;
pub mod upper_transport;

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::debug;

use access::AccessPdu;
use adv::{AD_TYPE_MESH_BEACON, AD_TYPE_MESH_MESSAGE};
use keys::KeyStore;
use lower_transport::{LowerTransportBody, LowerTransportPdu, SegmentHeader, TransportKind};
use network::NetworkPdu;
use reassembly::{CompletedMessage, IncompleteMessage, ReassemblyTable, SegmentOutcome};
use upper_transport::UpperTransportPdu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Network,
    LowerTransport,
    UpperTransport,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Network => write!(f, "network"),
            Layer::LowerTransport => write!(f, "lower transport"),
            Layer::UpperTransport => write!(f, "upper transport"),
        }
    }
}

/// Why a PDU stopped at some layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// No candidate key authenticated the PDU (or none was provisioned)
    #[error("no matching key")]
    NoMatchingKey,
    #[error("malformed {layer} PDU: {reason}")]
    Malformed { layer: Layer, reason: String },
}

impl DecodeError {
    pub fn malformed(layer: Layer, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            layer,
            reason: reason.into(),
        }
    }
}

/// Transport control opcode names
pub fn control_opcode_name(opcode: u8) -> &'static str {
    match opcode {
        0x00 => "Segment Acknowledgment",
        0x01 => "Friend Poll",
        0x02 => "Friend Update",
        0x03 => "Friend Request",
        0x04 => "Friend Offer",
        0x05 => "Friend Clear",
        0x06 => "Friend Clear Confirm",
        0x07 => "Friend Subscription List Add",
        0x08 => "Friend Subscription List Remove",
        0x09 => "Friend Subscription List Confirm",
        0x0A => "Heartbeat",
        _ => "RFU",
    }
}

/// A transport control message. Recognized but not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub src: u16,
    pub dst: u16,
    pub opcode: u8,
    pub seq_auth: u32,
    pub net_key_index: u16,
    pub segments: usize,
    pub parameters: Vec<u8>,
}

/// What one network PDU (or the end of the trace) produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// Mesh beacon, passed through undecoded
    Beacon { data: Vec<u8> },
    /// Network PDU that could not be decrypted
    NetworkStalled {
        ivi: u8,
        nid: u8,
        error: DecodeError,
        data: Vec<u8>,
    },
    /// Decrypted network PDU whose transport PDU was rejected
    LowerTransportStalled {
        network: NetworkPdu,
        error: DecodeError,
    },
    /// Segment accepted into a message that is still collecting
    Segment {
        network: NetworkPdu,
        seq_auth: u32,
        seg_o: u8,
        seg_n: u8,
        missing: u32,
        duplicate: bool,
    },
    Control(ControlMessage),
    Access(AccessPdu),
    /// Complete upper transport PDU that could not be decrypted
    UpperTransportStalled {
        message: UpperTransportPdu,
        error: DecodeError,
    },
    /// Segmented message dropped before all segments arrived
    Incomplete(IncompleteMessage),
}

impl MeshEvent {
    /// Status annotation for anything short of a decoded access message
    pub fn status(&self) -> Option<String> {
        match self {
            MeshEvent::NetworkStalled { error, .. }
            | MeshEvent::LowerTransportStalled { error, .. }
            | MeshEvent::UpperTransportStalled { error, .. } => Some(error.to_string()),
            MeshEvent::Control(_) => Some("unsupported PDU".to_string()),
            MeshEvent::Incomplete(_) => Some("incomplete".to_string()),
            MeshEvent::Beacon { .. } | MeshEvent::Segment { .. } | MeshEvent::Access(_) => None,
        }
    }
}

impl fmt::Display for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::Beacon { data } => write!(f, "Beacon data={}", hex::encode(data)),
            MeshEvent::NetworkStalled {
                ivi,
                nid,
                error,
                data,
            } => write!(
                f,
                "Network(encrypted) IVI={} NID={:02x} status: {} data={}",
                ivi,
                nid,
                error,
                hex::encode(data)
            ),
            MeshEvent::LowerTransportStalled { network, error } => write!(
                f,
                "{} status: {} lower_transport={}",
                network,
                error,
                hex::encode(&network.lower_transport)
            ),
            MeshEvent::Segment {
                network,
                seq_auth,
                seg_o,
                seg_n,
                missing,
                duplicate,
            } => write!(
                f,
                "Segment SRC={:04x} DST={:04x} SeqAuth={:06x} SegO={} SegN={} missing={:#x}{}",
                network.src,
                network.dst,
                seq_auth,
                seg_o,
                seg_n,
                missing,
                if *duplicate { " (duplicate)" } else { "" }
            ),
            MeshEvent::Control(control) => write!(
                f,
                "Control SRC={:04x} DST={:04x} Opcode={:02x} ({}) SeqAuth={:06x} segments={} status: unsupported PDU data={}",
                control.src,
                control.dst,
                control.opcode,
                control_opcode_name(control.opcode),
                control.seq_auth,
                control.segments,
                hex::encode(&control.parameters)
            ),
            MeshEvent::Access(access) => write!(f, "{}", access),
            MeshEvent::UpperTransportStalled { message, error } => {
                write!(f, "{} status: {}", message, error)
            }
            MeshEvent::Incomplete(message) => write!(
                f,
                "Incomplete SRC={:04x} DST={:04x} SeqAuth={:06x} SegN={} missing={:#x}",
                message.src, message.dst, message.seq_auth, message.seg_n, message.missing
            ),
        }
    }
}

/// The decoder context: key material plus in-flight reassembly state
pub struct MeshDecoder {
    keys: KeyStore,
    reassembly: ReassemblyTable,
}

impl MeshDecoder {
    pub fn new(max_sessions: usize, idle_timeout: TimeDelta) -> Self {
        Self {
            keys: KeyStore::new(),
            reassembly: ReassemblyTable::new(max_sessions, idle_timeout),
        }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyStore {
        &mut self.keys
    }

    pub fn pending_sessions(&self) -> usize {
        self.reassembly.len()
    }

    /// Decode every mesh AD structure in one advertising payload
    pub fn decode_advertisement(&mut self, adv: &[u8], at: DateTime<Utc>) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        for ad in adv::ad_structures(adv) {
            match ad.ad_type {
                AD_TYPE_MESH_MESSAGE => events.extend(self.decode_network_pdu(ad.data, at)),
                AD_TYPE_MESH_BEACON => events.push(MeshEvent::Beacon {
                    data: ad.data.to_vec(),
                }),
                other => debug!("Ignoring AD type {:02x}", other),
            }
        }
        events
    }

    /// Decode one encrypted network PDU observed at `at` (trace time)
    pub fn decode_network_pdu(&mut self, data: &[u8], at: DateTime<Utc>) -> Vec<MeshEvent> {
        let mut events: Vec<MeshEvent> = self
            .reassembly
            .expire(at)
            .into_iter()
            .map(MeshEvent::Incomplete)
            .collect();

        let network = match network::decrypt(&self.keys, data) {
            Ok(pdu) => pdu,
            Err(error) => {
                debug!("Network PDU not decoded: {}", error);
                let first = data.first().copied().unwrap_or_default();
                events.push(MeshEvent::NetworkStalled {
                    ivi: first >> 7,
                    nid: first & 0x7f,
                    error,
                    data: data.to_vec(),
                });
                return events;
            }
        };
        debug!("{}", network);

        let lower = match LowerTransportPdu::parse(&network) {
            Ok(lower) => lower,
            Err(error) => {
                events.push(MeshEvent::LowerTransportStalled { network, error });
                return events;
            }
        };
        debug!("{}", lower);

        match lower.body {
            LowerTransportBody::Unsegmented { upper_transport } => {
                events.push(self.unsegmented(&network, lower.kind, upper_transport));
            }
            LowerTransportBody::Segmented { header, segment } => {
                self.collect_segment(network, lower.kind, header, &segment, at, &mut events);
            }
        }
        events
    }

    /// Report every message still collecting at the end of the trace
    pub fn finish(&mut self) -> Vec<MeshEvent> {
        self.reassembly
            .drain()
            .into_iter()
            .map(MeshEvent::Incomplete)
            .collect()
    }

    fn unsegmented(&self, network: &NetworkPdu, kind: TransportKind, payload: Vec<u8>) -> MeshEvent {
        match kind {
            TransportKind::Control { opcode } => MeshEvent::Control(ControlMessage {
                src: network.src,
                dst: network.dst,
                opcode,
                seq_auth: network.seq,
                net_key_index: network.net_key_index,
                segments: 1,
                parameters: payload,
            }),
            TransportKind::Access { akf, aid } => self.decrypt_access(UpperTransportPdu {
                src: network.src,
                dst: network.dst,
                akf,
                aid,
                szmic: false,
                seq_auth: network.seq,
                net_key_index: network.net_key_index,
                segments: 1,
                payload,
            }),
        }
    }

    fn collect_segment(
        &mut self,
        network: NetworkPdu,
        kind: TransportKind,
        header: SegmentHeader,
        segment: &[u8],
        at: DateTime<Utc>,
        events: &mut Vec<MeshEvent>,
    ) {
        let seq_auth = header.seq_auth(network.seq);
        // A segment that cannot belong to any message must not open a session
        if let Err(error) = reassembly::check_segment(kind, &header, segment) {
            events.push(MeshEvent::LowerTransportStalled { network, error });
            return;
        }
        let (session, evicted) =
            self.reassembly
                .session_for(network.src, network.dst, kind, &header, seq_auth, at);
        let outcome = session.add_segment(kind, &header, segment, &network);
        let completed = match outcome {
            Ok(SegmentOutcome::Complete) => session.take_completed(),
            _ => None,
        };
        events.extend(evicted.map(MeshEvent::Incomplete));

        let (missing, duplicate) = match outcome {
            Err(error) => {
                events.push(MeshEvent::LowerTransportStalled { network, error });
                return;
            }
            Ok(SegmentOutcome::Complete) => {
                if let Some(message) = completed {
                    events.push(self.completed(message, network.net_key_index));
                }
                return;
            }
            Ok(SegmentOutcome::Collecting { missing }) => (missing, false),
            Ok(SegmentOutcome::Duplicate { missing }) => (missing, true),
        };
        debug!(
            "Segment {}/{} from {:04x} SeqAuth={:06x}{}",
            header.seg_o,
            header.seg_n,
            network.src,
            seq_auth,
            if duplicate { " (duplicate)" } else { "" }
        );
        events.push(MeshEvent::Segment {
            network,
            seq_auth,
            seg_o: header.seg_o,
            seg_n: header.seg_n,
            missing,
            duplicate,
        });
    }

    fn completed(&self, message: CompletedMessage, net_key_index: u16) -> MeshEvent {
        let segments = message.origins.len();
        debug!(
            "Reassembled {} of {} segment(s) from {:04x} SeqAuth={:06x}",
            segments,
            usize::from(message.seg_n) + 1,
            message.src,
            message.seq_auth
        );
        match message.kind {
            TransportKind::Control { opcode } => MeshEvent::Control(ControlMessage {
                src: message.src,
                dst: message.dst,
                opcode,
                seq_auth: message.seq_auth,
                net_key_index,
                segments,
                parameters: message.payload,
            }),
            TransportKind::Access { akf, aid } => self.decrypt_access(UpperTransportPdu {
                src: message.src,
                dst: message.dst,
                akf,
                aid,
                szmic: message.szmic,
                seq_auth: message.seq_auth,
                net_key_index,
                segments,
                payload: message.payload,
            }),
        }
    }

    fn decrypt_access(&self, upper: UpperTransportPdu) -> MeshEvent {
        match upper.decrypt(&self.keys) {
            Ok((plaintext, key)) => MeshEvent::Access(AccessPdu::new(&upper, key, plaintext)),
            Err(error) => {
                debug!("Upper transport PDU from {:04x} not decoded: {}", upper.src, error);
                MeshEvent::UpperTransportStalled {
                    message: upper,
                    error,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::encoder::{MessageBuilder, TxKey};
    use super::keys::{ApplicationKey, NetworkKey};
    use super::upper_transport::TransportKey;
    use super::*;

    const NET_KEY: [u8; 16] = [0x7d, 0xd7, 0x36, 0x4c, 0xd8, 0x42, 0xad, 0x18, 0xc1, 0x7c, 0x2b, 0x82, 0x0c, 0x84, 0xc3, 0xd6];
    const APP_KEY: [u8; 16] = [0x63, 0x96, 0x47, 0x71, 0x73, 0x4f, 0xbd, 0x76, 0xe3, 0xb4, 0x05, 0x19, 0xd1, 0xd9, 0x4a, 0x48];
    const IV_INDEX: u32 = 0x1234_5678;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn decoder() -> MeshDecoder {
        let mut decoder = MeshDecoder::new(16, TimeDelta::seconds(60));
        let keys = decoder.keys_mut();
        keys.set_iv_index(IV_INDEX);
        keys.add_network_key(0, &NET_KEY).unwrap();
        keys.add_application_key(0x123, &APP_KEY).unwrap();
        decoder
    }

    /// Keys derived from a counter until one shares `target` under `id`
    fn colliding_key(id: impl Fn(&[u8; 16]) -> u8, target: u8, exclude: &[u8; 16]) -> [u8; 16] {
        (0u16..8192)
            .map(|n| {
                let mut raw = [0x5Cu8; 16];
                raw[..2].copy_from_slice(&n.to_be_bytes());
                raw
            })
            .find(|raw| raw != exclude && id(raw) == target)
            .expect("identifier collision among candidates")
    }

    fn access(events: &[MeshEvent]) -> Vec<&AccessPdu> {
        events
            .iter()
            .filter_map(|e| match e {
                MeshEvent::Access(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unsegmented_access_roundtrip() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let app_key = ApplicationKey::new(0x123, &APP_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x1201, 0xFFFF);

        let pdus = builder.access(TxKey::App(&app_key), 0x000007, &[0x04, 0x00, 0x00, 0x00], false);
        let events = decoder.decode_network_pdu(&pdus[0], t(0));

        assert_eq!(events.len(), 1);
        match &events[0] {
            MeshEvent::Access(pdu) => {
                assert_eq!(pdu.src, 0x1201);
                assert_eq!(pdu.dst, 0xFFFF);
                assert!(pdu.akf);
                assert_eq!(pdu.aid, app_key.aid);
                assert_eq!(pdu.seq_auth, 0x000007);
                assert_eq!(pdu.key, TransportKey::Application { index: 0x123, aid: app_key.aid });
                assert_eq!(pdu.plaintext, vec![0x04, 0x00, 0x00, 0x00]);
            }
            other => panic!("Expected Access, got {:?}", other),
        }
        assert!(events[0].status().is_none());
    }

    #[test]
    fn test_segmented_out_of_order_roundtrip() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let app_key = ApplicationKey::new(0x123, &APP_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201);

        let plaintext: Vec<u8> = (0u8..30).collect();
        let pdus = builder.access(TxKey::App(&app_key), 0x3129AB, &plaintext, true);
        assert_eq!(pdus.len(), 3);

        let mut events = Vec::new();
        for i in [2, 0, 1] {
            events.extend(decoder.decode_network_pdu(&pdus[i], t(i as i64)));
        }

        assert!(matches!(events[0], MeshEvent::Segment { seg_o: 2, missing: 0b011, .. }));
        assert!(matches!(events[1], MeshEvent::Segment { seg_o: 0, missing: 0b010, .. }));
        let decoded = access(&events);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].plaintext, plaintext);
        assert_eq!(decoded[0].seq_auth, 0x3129AB);
        assert_eq!(decoded[0].segments, 3);
    }

    #[test]
    fn test_duplicate_segment_after_completion_is_not_reemitted() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let app_key = ApplicationKey::new(0x123, &APP_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201);

        let pdus = builder.access(TxKey::App(&app_key), 0x100, &[0xAB; 20], true);
        let mut events = Vec::new();
        for pdu in pdus.iter().chain(pdus.iter()) {
            events.extend(decoder.decode_network_pdu(pdu, t(0)));
        }

        assert_eq!(access(&events).len(), 1);
        let duplicates = events
            .iter()
            .filter(|e| matches!(e, MeshEvent::Segment { duplicate: true, .. }))
            .count();
        assert_eq!(duplicates, 2);
    }

    #[test]
    fn test_segmented_across_seq_zero_boundary() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let app_key = ApplicationKey::new(0x123, &APP_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201);

        // Segments sent with SEQ 0x1ffe, 0x1fff, 0x2000
        let pdus = builder.access(TxKey::App(&app_key), 0x1ffe, &[0x11; 30], true);
        let mut events = Vec::new();
        for pdu in &pdus {
            events.extend(decoder.decode_network_pdu(pdu, t(0)));
        }
        let decoded = access(&events);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].seq_auth, 0x1ffe);
    }

    #[test]
    fn test_unknown_nid_stops_at_network_layer() {
        let mut decoder = decoder();
        let other = NetworkKey::new(0, &[0x01; 16]).unwrap();
        let builder = MessageBuilder::new(&other, IV_INDEX, 0x0003, 0x1201);
        let pdus = builder.access(TxKey::Device(&[0u8; 16]), 0x10, &[0x11; 30], true);

        let events = decoder.decode_network_pdu(&pdus[0], t(0));
        assert_eq!(events.len(), 1);
        match &events[0] {
            MeshEvent::NetworkStalled { nid, error, .. } => {
                assert_eq!(*nid, other.nid);
                assert_eq!(*error, DecodeError::NoMatchingKey);
            }
            other => panic!("Expected NetworkStalled, got {:?}", other),
        }
        assert_eq!(decoder.pending_sessions(), 0);
    }

    #[test]
    fn test_first_authenticating_network_key_wins() {
        let target = NetworkKey::new(9, &[0x3C; 16]).unwrap();
        let decoy_raw = colliding_key(|raw| crypto::k2(raw, &[0x00]).0, target.nid, &target.key);

        let mut decoder = MeshDecoder::new(16, TimeDelta::seconds(60));
        decoder.keys_mut().add_network_key(1, &decoy_raw).unwrap();
        decoder.keys_mut().add_network_key(9, &target.key).unwrap();
        decoder.keys_mut().set_device_key(&[0x0D; 16]).unwrap();
        assert_eq!(decoder.keys().network_keys_matching(target.nid).len(), 2);

        let builder = MessageBuilder::new(&target, 0, 0x0005, 0x0001);
        let pdus = builder.access(TxKey::Device(&[0x0D; 16]), 0x20, b"hi", false);
        let events = decoder.decode_network_pdu(&pdus[0], t(0));

        let decoded = access(&events);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].net_key_index, 9);
        assert_eq!(decoded[0].key, TransportKey::Device);
    }

    #[test]
    fn test_first_authenticating_application_key_wins() {
        let target = ApplicationKey::new(0x0B, &[0x9E; 16]).unwrap();
        let decoy_raw = colliding_key(crypto::k4, target.aid, &target.key);

        let mut decoder = decoder();
        decoder.keys_mut().add_application_key(0x0A, &decoy_raw).unwrap();
        decoder.keys_mut().add_application_key(0x0B, &target.key).unwrap();

        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0005, 0x0001);
        let pdus = builder.access(TxKey::App(&target), 0x30, b"payload", false);
        let events = decoder.decode_network_pdu(&pdus[0], t(0));

        let decoded = access(&events);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].key, TransportKey::Application { index: 0x0B, aid: target.aid });
    }

    #[test]
    fn test_iv_index_update_applies_to_later_messages_only() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let app_key = ApplicationKey::new(0x123, &APP_KEY).unwrap();

        let old = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201)
            .access(TxKey::App(&app_key), 0x40, b"before", false);
        let new = MessageBuilder::new(&net_key, IV_INDEX + 1, 0x0003, 0x1201)
            .access(TxKey::App(&app_key), 0x41, b"after", false);

        let before = decoder.decode_network_pdu(&old[0], t(0));
        assert_eq!(access(&before)[0].plaintext, b"before");

        decoder.keys_mut().set_iv_index(IV_INDEX + 1);

        let replay = decoder.decode_network_pdu(&old[0], t(1));
        assert!(matches!(
            replay[0],
            MeshEvent::NetworkStalled { error: DecodeError::NoMatchingKey, .. }
        ));
        let after = decoder.decode_network_pdu(&new[0], t(2));
        assert_eq!(access(&after)[0].plaintext, b"after");

        // The earlier result is unaffected
        assert_eq!(access(&before)[0].plaintext, b"before");
    }

    #[test]
    fn test_missing_application_key_stalls_upper_transport() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let unknown = ApplicationKey::new(0x7, &[0xEE; 16]).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201);

        let pdus = builder.access(TxKey::App(&unknown), 0x50, b"secret", false);
        let events = decoder.decode_network_pdu(&pdus[0], t(0));
        match &events[0] {
            MeshEvent::UpperTransportStalled { message, error } => {
                assert_eq!(*error, DecodeError::NoMatchingKey);
                assert_eq!(message.aid, unknown.aid);
                assert_eq!(message.src, 0x0003);
            }
            other => panic!("Expected UpperTransportStalled, got {:?}", other),
        }
        assert_eq!(events[0].status().as_deref(), Some("no matching key"));
    }

    #[test]
    fn test_control_message_surfaces_raw_parameters() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x1201, 0xFFFD);

        let pdu = builder.control(0x0A, 0x000001, &[0x04, 0x00, 0x00, 0x01, 0x00, 0x00]);
        let events = decoder.decode_network_pdu(&pdu, t(0));
        match &events[0] {
            MeshEvent::Control(control) => {
                assert_eq!(control.opcode, 0x0A);
                assert_eq!(control.src, 0x1201);
                assert_eq!(control.dst, 0xFFFD);
                assert_eq!(control.parameters, vec![0x04, 0x00, 0x00, 0x01, 0x00, 0x00]);
            }
            other => panic!("Expected Control, got {:?}", other),
        }
        assert_eq!(control_opcode_name(0x0A), "Heartbeat");
    }

    #[test]
    fn test_unfinished_message_reported_at_finish() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let app_key = ApplicationKey::new(0x123, &APP_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201);

        let pdus = builder.access(TxKey::App(&app_key), 0x60, &[0x22; 30], true);
        decoder.decode_network_pdu(&pdus[0], t(0));
        decoder.decode_network_pdu(&pdus[2], t(1));

        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        match &events[0] {
            MeshEvent::Incomplete(message) => {
                assert_eq!(message.src, 0x0003);
                assert_eq!(message.seq_auth, 0x60);
                assert_eq!(message.missing, 0b010);
            }
            other => panic!("Expected Incomplete, got {:?}", other),
        }
        assert_eq!(decoder.pending_sessions(), 0);
    }

    #[test]
    fn test_rejected_first_segment_opens_no_session() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201);

        // SegO 0 of SegN 1 with a 5-byte fragment, SeqZero 0x70
        let seq = 0x70;
        let mut lower = vec![0xC0 | 0x26, 0x01, 0xC0, 0x01];
        lower.extend_from_slice(&[0xEE; 5]);
        let events = decoder.decode_network_pdu(&builder.network_pdu(false, seq, &lower), t(0));

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            MeshEvent::LowerTransportStalled {
                error: DecodeError::Malformed { layer: Layer::LowerTransport, .. },
                ..
            }
        ));
        assert_eq!(decoder.pending_sessions(), 0);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_idle_session_expires_on_later_pdu() {
        let mut decoder = MeshDecoder::new(16, TimeDelta::seconds(5));
        decoder.keys_mut().set_iv_index(IV_INDEX);
        decoder.keys_mut().add_network_key(0, &NET_KEY).unwrap();
        decoder.keys_mut().add_application_key(0x123, &APP_KEY).unwrap();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let app_key = ApplicationKey::new(0x123, &APP_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201);

        let stale = builder.access(TxKey::App(&app_key), 0x70, &[0x33; 30], true);
        let fresh = builder.access(TxKey::App(&app_key), 0x80, b"ok", false);
        decoder.decode_network_pdu(&stale[0], t(0));

        let events = decoder.decode_network_pdu(&fresh[0], t(10));
        assert!(matches!(&events[0], MeshEvent::Incomplete(m) if m.seq_auth == 0x70));
        assert_eq!(access(&events)[0].plaintext, b"ok");
    }

    #[test]
    fn test_advertisement_with_beacon_and_message() {
        let mut decoder = decoder();
        let net_key = NetworkKey::new(0, &NET_KEY).unwrap();
        let app_key = ApplicationKey::new(0x123, &APP_KEY).unwrap();
        let builder = MessageBuilder::new(&net_key, IV_INDEX, 0x0003, 0x1201);
        let pdu = builder.access(TxKey::App(&app_key), 0x90, b"adv", false).remove(0);

        let mut adv = vec![(pdu.len() + 1) as u8, AD_TYPE_MESH_MESSAGE];
        adv.extend_from_slice(&pdu);
        adv.extend_from_slice(&[0x03, AD_TYPE_MESH_BEACON, 0x01, 0x00]);
        adv.extend_from_slice(&[0x00, 0x00, 0x00]);

        let events = decoder.decode_advertisement(&adv, t(0));
        assert_eq!(events.len(), 2);
        assert_eq!(access(&events)[0].plaintext, b"adv");
        assert_eq!(events[1], MeshEvent::Beacon { data: vec![0x01, 0x00] });
    }
}
