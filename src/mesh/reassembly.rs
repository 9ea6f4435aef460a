//! Segmented message reassembly
//!
//! Segments of one upper transport message are collected in a session keyed
//! by `(src, SeqAuth)`. A session tracks the outstanding segments in a bitmap;
//! once the bitmap reaches zero the fragments are laid out at
//! `SegO * segment_len` and the message is handed off exactly once.
//!
//! Sessions are bounded by count and by idle time (measured in trace time).
//! Sessions dropped before completion are reported as [`IncompleteMessage`].

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use super::lower_transport::{SegmentHeader, TransportKind};
use super::network::NetworkPdu;
use super::{DecodeError, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    pub src: u16,
    pub seq_auth: u32,
}

/// Result of feeding one segment into a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Segment stored, `missing` segments still outstanding
    Collecting { missing: u32 },
    /// This segment completed the message
    Complete,
    /// Segment was already received; nothing changed
    Duplicate { missing: u32 },
}

/// A reassembled message ready for the upper transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub src: u16,
    pub dst: u16,
    pub kind: TransportKind,
    pub szmic: bool,
    pub seq_auth: u32,
    pub seg_n: u8,
    pub payload: Vec<u8>,
    pub origins: Vec<NetworkPdu>,
}

/// A session dropped before all segments arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteMessage {
    pub src: u16,
    pub dst: u16,
    pub kind: TransportKind,
    pub seq_auth: u32,
    pub seg_n: u8,
    /// Bitmap of segments never received
    pub missing: u32,
}

#[derive(Debug, Clone)]
struct Fragment {
    seg_o: u8,
    bytes: Vec<u8>,
}

/// An upper transport message in progress
#[derive(Debug)]
pub struct ReassemblySession {
    pub src: u16,
    pub dst: u16,
    pub kind: TransportKind,
    pub szmic: bool,
    pub seg_n: u8,
    pub seq_auth: u32,
    missing: u32,
    segment_len: usize,
    total_len: Option<usize>,
    fragments: Vec<Fragment>,
    origins: Vec<NetworkPdu>,
    data: Option<Vec<u8>>,
    processed: bool,
    last_seen: DateTime<Utc>,
}

fn all_segments(seg_n: u8) -> u32 {
    u32::MAX >> (31 - u32::from(seg_n.min(31)))
}

/// Check a segment on its own, before any session is touched: SegO within
/// SegN, and a fragment that is full length unless it is the last one.
pub fn check_segment(
    kind: TransportKind,
    header: &SegmentHeader,
    fragment: &[u8],
) -> Result<(), DecodeError> {
    if header.seg_o > header.seg_n {
        return Err(DecodeError::malformed(
            Layer::LowerTransport,
            format!("SegO {} exceeds SegN {}", header.seg_o, header.seg_n),
        ));
    }
    let segment_len = kind.segment_len();
    let is_last = header.seg_o == header.seg_n;
    if fragment.is_empty()
        || fragment.len() > segment_len
        || (!is_last && fragment.len() != segment_len)
    {
        return Err(DecodeError::malformed(
            Layer::LowerTransport,
            format!(
                "segment {} has {} bytes, expected {}",
                header.seg_o,
                fragment.len(),
                segment_len
            ),
        ));
    }
    Ok(())
}

impl ReassemblySession {
    pub fn new(
        src: u16,
        dst: u16,
        kind: TransportKind,
        header: &SegmentHeader,
        seq_auth: u32,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            src,
            dst,
            kind,
            szmic: header.szmic,
            seg_n: header.seg_n,
            seq_auth,
            missing: all_segments(header.seg_n),
            segment_len: kind.segment_len(),
            total_len: None,
            fragments: Vec::new(),
            origins: Vec::new(),
            data: None,
            processed: false,
            last_seen: at,
        }
    }

    fn is_complete(&self) -> bool {
        self.missing == 0
    }

    #[cfg(test)]
    fn missing(&self) -> u32 {
        self.missing
    }

    #[cfg(test)]
    fn is_processed(&self) -> bool {
        self.processed
    }

    #[cfg(test)]
    fn segment_len(&self) -> usize {
        self.segment_len
    }

    /// Reassembled payload, available once complete
    #[cfg(test)]
    fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Add one segment to the session.
    ///
    /// A segment already received leaves the bitmap and buffer untouched.
    pub fn add_segment(
        &mut self,
        kind: TransportKind,
        header: &SegmentHeader,
        fragment: &[u8],
        origin: &NetworkPdu,
    ) -> Result<SegmentOutcome, DecodeError> {
        if kind != self.kind || header.seg_n != self.seg_n {
            return Err(DecodeError::malformed(
                Layer::LowerTransport,
                format!(
                    "segment SegN {} does not match session {:04x}/{:06x} SegN {}",
                    header.seg_n, self.src, self.seq_auth, self.seg_n
                ),
            ));
        }
        check_segment(kind, header, fragment)?;
        let is_last = header.seg_o == self.seg_n;

        let bit = 1u32 << header.seg_o;
        if self.missing & bit == 0 {
            return Ok(SegmentOutcome::Duplicate {
                missing: self.missing,
            });
        }

        self.fragments.push(Fragment {
            seg_o: header.seg_o,
            bytes: fragment.to_vec(),
        });
        self.origins.push(origin.clone());
        self.missing &= !bit;
        if is_last {
            self.total_len = Some(usize::from(self.seg_n) * self.segment_len + fragment.len());
        }

        if self.is_complete() && self.data.is_none() {
            self.reassemble();
            return Ok(SegmentOutcome::Complete);
        }
        Ok(SegmentOutcome::Collecting {
            missing: self.missing,
        })
    }

    fn reassemble(&mut self) {
        // The final segment clears the last bit, so the length is known here
        let Some(total_len) = self.total_len else {
            return;
        };
        let mut data = vec![0u8; total_len];
        for fragment in &self.fragments {
            let pos = usize::from(fragment.seg_o) * self.segment_len;
            data[pos..pos + fragment.bytes.len()].copy_from_slice(&fragment.bytes);
        }
        self.data = Some(data);
    }

    /// Hand the completed message off. Returns `Some` exactly once.
    pub fn take_completed(&mut self) -> Option<CompletedMessage> {
        if self.processed {
            return None;
        }
        let payload = self.data.clone()?;
        self.processed = true;
        Some(CompletedMessage {
            src: self.src,
            dst: self.dst,
            kind: self.kind,
            szmic: self.szmic,
            seq_auth: self.seq_auth,
            seg_n: self.seg_n,
            payload,
            origins: std::mem::take(&mut self.origins),
        })
    }

    fn incomplete(&self) -> Option<IncompleteMessage> {
        if self.processed {
            return None;
        }
        Some(IncompleteMessage {
            src: self.src,
            dst: self.dst,
            kind: self.kind,
            seq_auth: self.seq_auth,
            seg_n: self.seg_n,
            missing: self.missing,
        })
    }
}

/// The table of in-flight sessions
#[derive(Debug)]
pub struct ReassemblyTable {
    sessions: HashMap<SessionKey, ReassemblySession>,
    max_sessions: usize,
    idle_timeout: TimeDelta,
}

impl ReassemblyTable {
    pub fn new(max_sessions: usize, idle_timeout: TimeDelta) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions: max_sessions.max(1),
            idle_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Find or create the session for `(src, seq_auth)`.
    ///
    /// Creating a session in a full table evicts the least recently active
    /// one, which is returned if it never completed.
    pub fn session_for(
        &mut self,
        src: u16,
        dst: u16,
        kind: TransportKind,
        header: &SegmentHeader,
        seq_auth: u32,
        at: DateTime<Utc>,
    ) -> (&mut ReassemblySession, Option<IncompleteMessage>) {
        let key = SessionKey { src, seq_auth };
        let evicted = if !self.sessions.contains_key(&key) && self.sessions.len() >= self.max_sessions
        {
            self.evict_oldest()
        } else {
            None
        };

        let session = self.sessions.entry(key).or_insert_with(|| {
            debug!(
                "New segmented message from {:04x} SeqAuth={:06x} SegN={}",
                src, seq_auth, header.seg_n
            );
            ReassemblySession::new(src, dst, kind, header, seq_auth, at)
        });
        session.last_seen = at;
        (session, evicted)
    }

    fn evict_oldest(&mut self) -> Option<IncompleteMessage> {
        let key = self
            .sessions
            .iter()
            .min_by_key(|(key, session)| (session.last_seen, **key))
            .map(|(key, _)| *key)?;
        let session = self.sessions.remove(&key)?;
        let incomplete = session.incomplete();
        if incomplete.is_some() {
            warn!(
                "Session table full, evicting incomplete message from {:04x} SeqAuth={:06x}",
                key.src, key.seq_auth
            );
        }
        incomplete
    }

    /// Drop sessions idle for longer than the timeout
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<IncompleteMessage> {
        let idle_timeout = self.idle_timeout;
        let mut expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, session)| now - session.last_seen > idle_timeout)
            .map(|(key, _)| *key)
            .collect();
        expired.sort();
        self.remove_all(&expired)
    }

    /// Drop every session, reporting those that never completed
    pub fn drain(&mut self) -> Vec<IncompleteMessage> {
        let mut keys: Vec<SessionKey> = self.sessions.keys().copied().collect();
        keys.sort();
        self.remove_all(&keys)
    }

    fn remove_all(&mut self, keys: &[SessionKey]) -> Vec<IncompleteMessage> {
        let mut incomplete = Vec::new();
        for key in keys {
            if let Some(message) = self.sessions.remove(key).and_then(|s| s.incomplete()) {
                warn!(
                    "Dropping incomplete message from {:04x} SeqAuth={:06x} (missing {:#x})",
                    message.src, message.seq_auth, message.missing
                );
                incomplete.push(message);
            }
        }
        incomplete
    }
}
