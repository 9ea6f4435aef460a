pub mod protocol;
pub mod provisioning;

use std::fmt;
use std::io::Read;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::mesh::{MeshDecoder, MeshEvent};
use protocol::{PklgReader, RecordType, TraceError};

/// Counts of what a trace produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TraceSummary {
    pub records: u64,
    pub advertisements: u64,
    pub provisioning_lines: u64,
    pub beacons: u64,
    pub segments: u64,
    pub access: u64,
    pub control: u64,
    pub failures: u64,
    pub incomplete: u64,
}

impl TraceSummary {
    fn count(&mut self, event: &MeshEvent) {
        match event {
            MeshEvent::Beacon { .. } => self.beacons += 1,
            MeshEvent::Segment { .. } => self.segments += 1,
            MeshEvent::Access(_) => self.access += 1,
            MeshEvent::Control(_) => self.control += 1,
            MeshEvent::Incomplete(_) => self.incomplete += 1,
            MeshEvent::NetworkStalled { .. }
            | MeshEvent::LowerTransportStalled { .. }
            | MeshEvent::UpperTransportStalled { .. } => self.failures += 1,
        }
    }
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} advertisements, {} access, {} control, {} beacons, {} failed, {} incomplete",
            self.records,
            self.advertisements,
            self.access,
            self.control,
            self.beacons,
            self.failures,
            self.incomplete
        )
    }
}

/// Decode a whole trace, strictly in record order.
///
/// Provisioning notes update the decoder's keys before any later record is
/// decoded. Every event goes to `sink` with the timestamp of the record that
/// produced it. A malformed or truncated record ends the run with an error;
/// everything else is reported through events and the run continues.
pub fn run_trace<R, F>(
    reader: PklgReader<R>,
    decoder: &mut MeshDecoder,
    mut sink: F,
) -> Result<TraceSummary, TraceError>
where
    R: Read,
    F: FnMut(DateTime<Utc>, &MeshEvent),
{
    let mut summary = TraceSummary::default();
    let mut last_seen = DateTime::<Utc>::default();

    for record in reader {
        let record = record?;
        summary.records += 1;
        last_seen = record.timestamp;

        if record.kind == RecordType::Note {
            if let Some(note) = record.note() {
                summary.provisioning_lines +=
                    provisioning::apply_note(&note, decoder.keys_mut()) as u64;
            }
            continue;
        }

        let Some(adv) = record.advertising_data() else {
            debug!("Skipping {:?} record at offset {}", record.kind, record.offset);
            continue;
        };
        summary.advertisements += 1;

        for event in decoder.decode_advertisement(adv, record.timestamp) {
            if matches!(event, MeshEvent::Incomplete(_)) {
                warn!("Dropped unfinished message: {}", event);
            }
            summary.count(&event);
            sink(record.timestamp, &event);
        }
    }

    debug!("End of trace, {} message(s) still collecting", decoder.pending_sessions());
    for event in decoder.finish() {
        summary.count(&event);
        sink(last_seen, &event);
    }

    info!("Trace complete: {}", summary);
    Ok(summary)
}
