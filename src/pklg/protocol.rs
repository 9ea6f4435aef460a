//! PacketLogger (.pklg) trace container
//!
//! Each record is a fixed 13-byte header followed by its payload:
//!
//! ```text
//! length(4) | ts_sec(4) | ts_usec(4) | type(1) | payload(length - 9)
//! ```
//!
//! All header integers are big-endian. `length` counts the timestamp and
//! type fields, so the payload is `length - 9` bytes.

use std::io::{self, Read};

use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};
use thiserror::Error;

pub const RECORD_HEADER_LEN: usize = 13;

/// Bytes of the header counted by the length field
const LENGTH_OVERHEAD: u32 = 9;

/// Default payload ceiling; anything larger means the reader lost sync
pub const DEFAULT_MAX_PAYLOAD: usize = 66_000;

/// LE Set Advertising Data command opcode, little-endian on the wire
const HCI_LE_SET_ADV_DATA: [u8; 2] = [0x08, 0x20];
const HCI_EVENT_LE_META: u8 = 0x3e;
const HCI_LE_ADV_REPORT_LEN: u8 = 0x2b;
/// Event bytes before the advertising data of a single-report event
const ADV_REPORT_DATA_OFFSET: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Command,
    Event,
    Note,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => RecordType::Command,
            0x01 => RecordType::Event,
            0xFC => RecordType::Note,
            other => RecordType::Other(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("malformed record at offset {offset} ({offset:#x}): length field {len}, payload ceiling {max}")]
    MalformedRecord { offset: u64, len: u32, max: usize },
    #[error("record at offset {offset} ({offset:#x}) is truncated")]
    Truncated { offset: u64 },
    #[error("trace read failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Byte offset of the record header within the trace
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: RecordType,
    pub payload: Bytes,
}

impl Record {
    /// Advertising data carried by an LE Set Advertising Data command or an
    /// LE Advertising Report event. Other records carry none.
    pub fn advertising_data(&self) -> Option<&[u8]> {
        let p = &self.payload[..];
        match self.kind {
            RecordType::Command if p.len() >= 4 && p[..2] == HCI_LE_SET_ADV_DATA => Some(&p[4..]),
            RecordType::Event
                if p.len() > ADV_REPORT_DATA_OFFSET
                    && p[0] == HCI_EVENT_LE_META
                    && p[1] == HCI_LE_ADV_REPORT_LEN =>
            {
                // Trailing byte is the RSSI
                Some(&p[ADV_REPORT_DATA_OFFSET..p.len() - 1])
            }
            _ => None,
        }
    }

    /// Text of a note record with trailing NULs and whitespace removed
    pub fn note(&self) -> Option<String> {
        match self.kind {
            RecordType::Note => {
                let text = String::from_utf8_lossy(&self.payload);
                Some(text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
            }
            _ => None,
        }
    }
}

/// Sequential record reader over any byte source
pub struct PklgReader<R> {
    inner: R,
    max_payload: usize,
    offset: u64,
    done: bool,
}

impl<R: Read> PklgReader<R> {
    pub fn new(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            max_payload,
            offset: 0,
            done: false,
        }
    }

    /// Fill `buf` completely, returning how many bytes were read before EOF
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn read_record(&mut self) -> Result<Option<Record>, TraceError> {
        let offset = self.offset;
        let mut header = [0u8; RECORD_HEADER_LEN];
        match self.fill(&mut header)? {
            0 => return Ok(None),
            RECORD_HEADER_LEN => {}
            _ => return Err(TraceError::Truncated { offset }),
        }

        let mut buf = &header[..];
        let len = buf.get_u32();
        let ts_sec = buf.get_u32();
        let ts_usec = buf.get_u32();
        let kind = RecordType::from(buf.get_u8());

        let payload_len = len
            .checked_sub(LENGTH_OVERHEAD)
            .map(|n| n as usize)
            .filter(|n| *n <= self.max_payload)
            .ok_or(TraceError::MalformedRecord {
                offset,
                len,
                max: self.max_payload,
            })?;

        let mut payload = vec![0u8; payload_len];
        if self.fill(&mut payload)? != payload_len {
            return Err(TraceError::Truncated { offset });
        }
        self.offset += (RECORD_HEADER_LEN + payload_len) as u64;

        Ok(Some(Record {
            offset,
            timestamp: timestamp(ts_sec, ts_usec),
            kind,
            payload: Bytes::from(payload),
        }))
    }
}

fn timestamp(sec: u32, usec: u32) -> DateTime<Utc> {
    let sec = i64::from(sec) + i64::from(usec / 1_000_000);
    let nanos = (usec % 1_000_000) * 1_000;
    DateTime::from_timestamp(sec, nanos).unwrap_or_default()
}

impl<R: Read> Iterator for PklgReader<R> {
    type Item = Result<Record, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
