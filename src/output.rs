//! Printable views of decoded events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mesh::{control_opcode_name, MeshEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

/// One decoded event as emitted on stdout in JSON mode
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputRecord {
    /// Timestamp of the trace record that produced the event
    pub timestamp: DateTime<Utc>,
    /// Layer the event was produced at, e.g. "access" or "network"
    pub layer: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_key_index: Option<u16>,
    /// Key that decrypted the upper transport PDU
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Bitmap of segments never received (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<String>,
    /// Layer payload (hex encoded)
    pub data: String,
}

fn addr(value: u16) -> Option<String> {
    Some(format!("{:04x}", value))
}

fn seq(value: u32) -> Option<String> {
    Some(format!("{:06x}", value))
}

impl OutputRecord {
    pub fn new(timestamp: DateTime<Utc>, event: &MeshEvent) -> Self {
        let mut record = Self {
            timestamp,
            layer: "",
            src: None,
            dst: None,
            seq_auth: None,
            net_key_index: None,
            key: None,
            opcode: None,
            status: event.status(),
            missing: None,
            data: String::new(),
        };

        match event {
            MeshEvent::Beacon { data } => {
                record.layer = "beacon";
                record.data = hex::encode(data);
            }
            MeshEvent::NetworkStalled { data, .. } => {
                record.layer = "network";
                record.data = hex::encode(data);
            }
            MeshEvent::LowerTransportStalled { network, .. } => {
                record.layer = "lower-transport";
                record.src = addr(network.src);
                record.dst = addr(network.dst);
                record.seq_auth = seq(network.seq);
                record.net_key_index = Some(network.net_key_index);
                record.data = hex::encode(&network.lower_transport);
            }
            MeshEvent::Segment {
                network, seq_auth, ..
            } => {
                record.layer = "segment";
                record.src = addr(network.src);
                record.dst = addr(network.dst);
                record.seq_auth = seq(*seq_auth);
                record.net_key_index = Some(network.net_key_index);
                record.data = hex::encode(&network.lower_transport);
            }
            MeshEvent::Control(control) => {
                record.layer = "control";
                record.src = addr(control.src);
                record.dst = addr(control.dst);
                record.seq_auth = seq(control.seq_auth);
                record.net_key_index = Some(control.net_key_index);
                record.opcode = Some(format!(
                    "{:02x} ({})",
                    control.opcode,
                    control_opcode_name(control.opcode)
                ));
                record.data = hex::encode(&control.parameters);
            }
            MeshEvent::Access(access) => {
                record.layer = "access";
                record.src = addr(access.src);
                record.dst = addr(access.dst);
                record.seq_auth = seq(access.seq_auth);
                record.net_key_index = Some(access.net_key_index);
                record.key = Some(access.key.to_string());
                record.data = hex::encode(&access.plaintext);
            }
            MeshEvent::UpperTransportStalled { message, .. } => {
                record.layer = "upper-transport";
                record.src = addr(message.src);
                record.dst = addr(message.dst);
                record.seq_auth = seq(message.seq_auth);
                record.net_key_index = Some(message.net_key_index);
                record.data = hex::encode(&message.payload);
            }
            MeshEvent::Incomplete(message) => {
                record.layer = "reassembly";
                record.src = addr(message.src);
                record.dst = addr(message.dst);
                record.seq_auth = seq(message.seq_auth);
                record.missing = Some(format!("{:08x}", message.missing));
            }
        }
        record
    }
}

/// Render one event in the requested format
pub fn render(format: OutputFormat, timestamp: DateTime<Utc>, event: &MeshEvent) -> anyhow::Result<String> {
    match format {
        OutputFormat::Text => Ok(format!(
            "[{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event
        )),
        OutputFormat::Json => Ok(serde_json::to_string(&OutputRecord::new(timestamp, event))?),
    }
}
