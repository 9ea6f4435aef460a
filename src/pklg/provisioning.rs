//! In-band provisioning lines logged by the stack under test
//!
//! ```text
//! mesh-iv-index: <hex>
//! mesh-devkey: <hex>
//! mesh-appkey-<hex index>: <hex key>
//! mesh-netkey-<hex index>: <hex key>
//! ```

use anyhow::{anyhow, Context};
use tracing::{debug, info, warn};

use crate::mesh::keys::KeyStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    IvIndex(u32),
    DeviceKey(Vec<u8>),
    AppKey { index: u16, key: Vec<u8> },
    NetKey { index: u16, key: Vec<u8> },
}

fn parse_hex_u32(value: &str) -> anyhow::Result<u32> {
    let value = value.trim();
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid hex number {:?}", value))
}

fn parse_index(value: &str) -> anyhow::Result<u16> {
    let index = parse_hex_u32(value)?;
    u16::try_from(index).map_err(|_| anyhow!("key index {:#x} out of range", index))
}

fn parse_key(value: &str) -> anyhow::Result<Vec<u8>> {
    let value = value.trim();
    hex::decode(value).with_context(|| format!("invalid hex key {:?}", value))
}

impl ProvisioningEvent {
    /// Parse one note line.
    ///
    /// Lines outside the grammar yield `Ok(None)`; a recognized line with a
    /// bad value is an error.
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let Some((tag, value)) = line.split_once(':') else {
            return Ok(None);
        };

        let event = if tag == "mesh-iv-index" {
            ProvisioningEvent::IvIndex(parse_hex_u32(value)?)
        } else if tag == "mesh-devkey" {
            ProvisioningEvent::DeviceKey(parse_key(value)?)
        } else if let Some(index) = tag.strip_prefix("mesh-appkey-") {
            ProvisioningEvent::AppKey {
                index: parse_index(index)?,
                key: parse_key(value)?,
            }
        } else if let Some(index) = tag.strip_prefix("mesh-netkey-") {
            ProvisioningEvent::NetKey {
                index: parse_index(index)?,
                key: parse_key(value)?,
            }
        } else {
            return Ok(None);
        };
        Ok(Some(event))
    }

    /// Apply to the key store; takes effect for every later decode
    pub fn apply(&self, keys: &mut KeyStore) -> anyhow::Result<()> {
        match self {
            ProvisioningEvent::IvIndex(iv_index) => {
                keys.set_iv_index(*iv_index);
            }
            ProvisioningEvent::DeviceKey(key) => keys.set_device_key(key)?,
            ProvisioningEvent::AppKey { index, key } => {
                keys.add_application_key(*index, key)?;
            }
            ProvisioningEvent::NetKey { index, key } => {
                keys.add_network_key(*index, key)?;
            }
        }
        Ok(())
    }
}

/// Parse and apply every provisioning line in a note.
///
/// Returns how many lines were applied; bad lines are skipped with a warning.
pub fn apply_note(note: &str, keys: &mut KeyStore) -> usize {
    let mut applied = 0;
    for line in note.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let result = ProvisioningEvent::parse(line)
            .and_then(|event| event.map(|e| e.apply(keys)).transpose());
        match result {
            Ok(Some(())) => applied += 1,
            Ok(None) => debug!("Ignoring note: {}", line),
            Err(e) => warn!("Skipping provisioning line {:?}: {:#}", line, e),
        }
    }
    if applied > 0 {
        info!("Applied {} provisioning line(s)", applied);
    }
    applied
}
