use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

use memmap2::MmapMut;

use crate::db::ptr::{Ptr, Void};

use super::{checked_range, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskMode {
    /// normal mode.
    /// use with normal files, to allocate space as needed.
    Dynamic,
    /// the file has been pre-allocated and must not change size
    Fixed,
}

/// A database file, accessed through a writable memory map.
///
/// The map is recreated every time the file grows, so callers should grow in
/// large steps (see `database.grow_by` in the config).
pub struct DiskStore {
    file: File,
    /// `None` while the file is empty (zero length files cannot be mapped)
    map: Option<MmapMut>,
    mode: DiskMode,
}

impl DiskStore {
    #[instrument(level = "debug")]
    pub fn open(path: &Path, mode: DiskMode) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let map = Self::map(&file)?;
        debug!(
            "opened {path:?} ({} bytes)",
            map.as_ref().map_or(0, |m| m.len())
        );
        Ok(Self { file, map, mode })
    }

    fn map(file: &File) -> io::Result<Option<MmapMut>> {
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        // Safety: the file is opened read/write by this process only. the index
        // directory is private to the owning session, and modifying it externally
        // while it is open is not supported
        Ok(Some(unsafe { MmapMut::map_mut(file) }?))
    }
}

impl Storage for DiskStore {
    fn read_buf(&self, at: Ptr<Void>, into: &mut [u8]) -> io::Result<()> {
        let map = self.map.as_deref().unwrap_or(&[]);
        let range = checked_range(at, into.len(), map.len() as u64)?;
        into.copy_from_slice(&map[range]);
        Ok(())
    }

    fn write_buf(&mut self, at: Ptr<Void>, from: &[u8]) -> io::Result<()> {
        let map = self.map.as_deref_mut().unwrap_or(&mut []);
        let range = checked_range(at, from.len(), map.len() as u64)?;
        map[range].copy_from_slice(from);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.map.as_ref().map_or(0, |m| m.len() as u64))
    }

    #[instrument(skip(self))]
    fn expand_by(&mut self, amnt: u64) -> io::Result<()> {
        if self.mode == DiskMode::Fixed {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "database file is fixed size, and is full",
            ));
        }
        let size = self.size()?;
        if let Some(map) = &self.map {
            map.flush()?;
        }
        self.map = None;
        let resized = self.file.set_len(size + amnt);
        // remap even if resizing failed, the old contents are still valid
        self.map = Self::map(&self.file)?;
        resized
    }

    fn sync(&mut self) -> io::Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        self.file.sync_all()
    }

    fn resizeable(&self) -> bool {
        self.mode == DiskMode::Dynamic
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            error!("failed to sync database file on close: {e}");
        }
    }
}
