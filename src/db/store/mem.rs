use std::io;

use crate::db::ptr::{Ptr, Void};

use super::{checked_range, Storage};

/// Storage kept entirely in memory.
///
/// Used for tests and for throwaway indices. A capacity limit can be set to
/// simulate a full disk.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    backing: Vec<u8>,
    limit: Option<u64>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// a store that refuses to grow past `limit` bytes
    pub fn with_limit(limit: u64) -> Self {
        Self {
            backing: vec![],
            limit: Some(limit),
        }
    }

    /// a store holding a copy of `bytes` (e.g. a raw image of a database file)
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            backing: bytes,
            limit: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.backing
    }
}

impl Storage for MemStore {
    fn read_buf(&self, at: Ptr<Void>, into: &mut [u8]) -> io::Result<()> {
        let range = checked_range(at, into.len(), self.backing.len() as u64)?;
        into.copy_from_slice(&self.backing[range]);
        Ok(())
    }

    fn write_buf(&mut self, at: Ptr<Void>, from: &[u8]) -> io::Result<()> {
        let range = checked_range(at, from.len(), self.backing.len() as u64)?;
        self.backing[range].copy_from_slice(from);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.backing.len() as u64)
    }

    fn expand_by(&mut self, amnt: u64) -> io::Result<()> {
        let new_len = self.backing.len() as u64 + amnt;
        if let Some(limit) = self.limit {
            if new_len > limit {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("store is limited to {limit} bytes, cannot grow to {new_len}"),
                ));
            }
        }
        self.backing.resize(new_len as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn resizeable(&self) -> bool {
        true
    }
}
