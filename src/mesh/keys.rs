//! Mesh key management
//!
//! Holds the provisioned network keys, application keys, device key and the
//! current IV Index. Derived identifiers (NID, AID) and the network
//! encryption/privacy keys are computed once at insertion.
//!
//! Keys are never removed. Lookups return candidates in insertion order; a
//! NID or AID is only a hint, so callers trial-decrypt each candidate and keep
//! the first one that authenticates.

use std::fmt;

use tracing::info;

use super::crypto::{self, Key, KEY_LEN};

fn to_key(kind: &str, raw: &[u8]) -> anyhow::Result<Key> {
    raw.try_into().map_err(|_| {
        anyhow::anyhow!("{} must be {} bytes, got {}", kind, KEY_LEN, raw.len())
    })
}

/// A network key with its derived master credentials
#[derive(Clone)]
pub struct NetworkKey {
    pub index: u16,
    pub key: Key,
    pub nid: u8,
    pub encryption_key: Key,
    pub privacy_key: Key,
}

impl NetworkKey {
    pub fn new(index: u16, raw: &[u8]) -> anyhow::Result<Self> {
        let key = to_key("network key", raw)?;
        let (nid, encryption_key, privacy_key) = crypto::k2(&key, &[0x00]);
        Ok(Self {
            index,
            key,
            nid,
            encryption_key,
            privacy_key,
        })
    }
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NetKey-{:04x} {}: NID {:02x} Encryption {} Privacy {}",
            self.index,
            hex::encode(self.key),
            self.nid,
            hex::encode(self.encryption_key),
            hex::encode(self.privacy_key),
        )
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkKey(index={:04x}, nid={:02x})", self.index, self.nid)
    }
}

/// An application key with its 6-bit AID
#[derive(Clone)]
pub struct ApplicationKey {
    pub index: u16,
    pub key: Key,
    pub aid: u8,
}

impl ApplicationKey {
    pub fn new(index: u16, raw: &[u8]) -> anyhow::Result<Self> {
        let key = to_key("application key", raw)?;
        Ok(Self {
            index,
            key,
            aid: crypto::k4(&key),
        })
    }
}

impl fmt::Display for ApplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AppKey-{:04x} {}: AID {:02x}",
            self.index,
            hex::encode(self.key),
            self.aid
        )
    }
}

impl fmt::Debug for ApplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApplicationKey(index={:04x}, aid={:02x})", self.index, self.aid)
    }
}

#[derive(Default)]
pub struct KeyStore {
    network_keys: Vec<NetworkKey>,
    application_keys: Vec<ApplicationKey>,
    device_key: Option<Key>,
    iv_index: u32,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a network key. Re-adding an index replaces that key in place.
    pub fn add_network_key(&mut self, index: u16, raw: &[u8]) -> anyhow::Result<&NetworkKey> {
        let key = NetworkKey::new(index, raw)?;
        info!("{}", key);
        let slot = match self.network_keys.iter().position(|k| k.index == index) {
            Some(pos) => {
                self.network_keys[pos] = key;
                pos
            }
            None => {
                self.network_keys.push(key);
                self.network_keys.len() - 1
            }
        };
        Ok(&self.network_keys[slot])
    }

    /// Add an application key. Re-adding an index replaces that key in place.
    pub fn add_application_key(
        &mut self,
        index: u16,
        raw: &[u8],
    ) -> anyhow::Result<&ApplicationKey> {
        let key = ApplicationKey::new(index, raw)?;
        info!("{}", key);
        let slot = match self.application_keys.iter().position(|k| k.index == index) {
            Some(pos) => {
                self.application_keys[pos] = key;
                pos
            }
            None => {
                self.application_keys.push(key);
                self.application_keys.len() - 1
            }
        };
        Ok(&self.application_keys[slot])
    }

    pub fn set_device_key(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        let key = to_key("device key", raw)?;
        info!("DevKey: {}", hex::encode(key));
        self.device_key = Some(key);
        Ok(())
    }

    pub fn set_iv_index(&mut self, iv_index: u32) {
        info!("IV-Index: {:08x}", iv_index);
        self.iv_index = iv_index;
    }

    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    pub fn device_key(&self) -> Option<&Key> {
        self.device_key.as_ref()
    }

    /// Network keys whose NID matches, in insertion order
    pub fn network_keys_matching(&self, nid: u8) -> Vec<&NetworkKey> {
        self.network_keys.iter().filter(|k| k.nid == nid).collect()
    }

    /// Application keys whose AID matches, in insertion order
    pub fn application_keys_matching(&self, aid: u8) -> Vec<&ApplicationKey> {
        self.application_keys.iter().filter(|k| k.aid == aid).collect()
    }
}
