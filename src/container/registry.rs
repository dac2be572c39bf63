// Block Registry: maps namespaced block names to file extents.
//
// Names are namespaced by convention (`sys:metadata`, `table:<name>`,
// `idx:<table>:<col>`, `wal`, `blob:<uuid>`) but the registry itself treats
// them as opaque strings; namespacing is enforced by callers.

use crate::error::{DbError, Result};
use crate::storage::checksum::hardware_crc32c;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub checksum: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockRegistry {
    blocks: BTreeMap<String, Extent>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Extent> {
        self.blocks.get(name).copied()
    }

    pub fn reserve(&mut self, name: impl Into<String>, extent: Extent) -> Result<()> {
        let name = name.into();
        if self.blocks.contains_key(&name) {
            return Err(DbError::RegistryCorrupt(format!(
                "block '{name}' already registered"
            )));
        }
        self.blocks.insert(name, extent);
        Ok(())
    }

    pub fn rewrite(&mut self, name: &str, extent: Extent) -> Result<()> {
        if !self.blocks.contains_key(name) {
            return Err(DbError::RegistryCorrupt(format!("block '{name}' not found")));
        }
        self.blocks.insert(name.to_string(), extent);
        Ok(())
    }

    pub fn release(&mut self, name: &str) -> Option<Extent> {
        self.blocks.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(|s| s.as_str())
    }

    pub fn names_in_namespace<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.blocks.keys().filter(move |n| n.starts_with(prefix)).map(|s| s.as_str())
    }

    /// Serialize with a trailing CRC-32C so a torn registry write is
    /// detectable on the next open.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        let mut body = bincode::serde::encode_to_vec(&self.blocks, config)?;
        let crc = hardware_crc32c(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        Ok(body)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(DbError::RegistryCorrupt("registry block too short".into()));
        }
        let (body, crc_bytes) = buf.split_at(buf.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let actual_crc = hardware_crc32c(body);
        if stored_crc != actual_crc {
            return Err(DbError::RegistryCorrupt(format!(
                "checksum mismatch: expected {stored_crc:#010x}, found {actual_crc:#010x}"
            )));
        }
        let config = bincode::config::standard();
        let (blocks, _): (BTreeMap<String, Extent>, usize) =
            bincode::serde::decode_from_slice(body, config)?;
        Ok(Self { blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(offset: u64, length: u64) -> Extent {
        Extent { offset, length, checksum: 0, flags: 0 }
    }

    #[test]
    fn reserve_then_lookup() {
        let mut reg = BlockRegistry::new();
        reg.reserve("wal", extent(96, 1_048_576)).unwrap();
        assert_eq!(reg.lookup("wal"), Some(extent(96, 1_048_576)));
    }

    #[test]
    fn reserve_duplicate_name_fails() {
        let mut reg = BlockRegistry::new();
        reg.reserve("wal", extent(0, 10)).unwrap();
        assert!(reg.reserve("wal", extent(10, 10)).is_err());
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut reg = BlockRegistry::new();
        reg.reserve("table:users", extent(1000, 4096)).unwrap();
        reg.reserve("idx:users:id", extent(5096, 4096)).unwrap();
        let bytes = reg.encode().unwrap();
        let decoded = BlockRegistry::decode(&bytes).unwrap();
        assert_eq!(decoded.lookup("table:users"), Some(extent(1000, 4096)));
        assert_eq!(decoded.names().count(), 2);
    }

    #[test]
    fn detects_torn_write() {
        let mut reg = BlockRegistry::new();
        reg.reserve("wal", extent(0, 10)).unwrap();
        let mut bytes = reg.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(BlockRegistry::decode(&bytes).is_err());
    }

    #[test]
    fn namespace_filter() {
        let mut reg = BlockRegistry::new();
        reg.reserve("idx:users:id", extent(0, 10)).unwrap();
        reg.reserve("idx:users:email", extent(10, 10)).unwrap();
        reg.reserve("table:users", extent(20, 10)).unwrap();
        let idx_blocks: Vec<_> = reg.names_in_namespace("idx:users:").collect();
        assert_eq!(idx_blocks.len(), 2);
    }
}
