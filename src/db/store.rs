use std::io;

use super::ptr::{Ptr, Void};

pub mod disk;
pub mod mem;

pub use disk::DiskStore;
pub use mem::MemStore;

/// trait that all storage backings for the database must implement.
///
/// reads take `&self` so that any number of readers can share a database,
/// everything that modifies the store takes `&mut self`.
pub trait Storage: Send + Sync + 'static {
    /// fill `into` with the bytes starting at `at`.
    /// reading past the end of the store is an error (`UnexpectedEof`), never a panic
    fn read_buf(&self, at: Ptr<Void>, into: &mut [u8]) -> io::Result<()>;
    fn write_buf(&mut self, at: Ptr<Void>, from: &[u8]) -> io::Result<()>;
    fn size(&self) -> io::Result<u64>;
    /// grow the store by `amnt` zeroed bytes.
    /// if growing is not possible, this must fail without changing the current contents
    fn expand_by(&mut self, amnt: u64) -> io::Result<()>;
    /// make sure everything written so far has reached the backing medium
    fn sync(&mut self) -> io::Result<()>;
    /// is resizing this store permitted.
    fn resizeable(&self) -> bool;
}

pub(crate) fn out_of_bounds(at: Ptr<Void>, len: usize, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "access of {len} bytes at {:#X} is past the end of the store ({size} bytes)",
            at.addr
        ),
    )
}

/// range of `len` bytes at `at`, if it fits inside a store of `size` bytes
pub(crate) fn checked_range(at: Ptr<Void>, len: usize, size: u64) -> io::Result<std::ops::Range<usize>> {
    match at.addr.checked_add(len as u64) {
        Some(end) if end <= size => Ok(at.addr as usize..end as usize),
        _ => Err(out_of_bounds(at, len, size)),
    }
}
