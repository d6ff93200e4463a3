//! # Database
//!
//! A single growable store (usually a memory mapped file) that hands out fixed size
//! chunks, malloc/free style.
//!
//! ## layout
//! - header: magic bytes, format version, number of bytes in use, root table and
//!   the free list heads (one per size class)
//! - chunks, back to back: a 16 byte `ChunkHeader` followed by the payload
//!
//! every payload size is rounded up to a multiple of 8 bytes, and each of those
//! size classes has its own singly linked free list. freed chunks are pushed onto
//! the list for their class and handed out again by the next allocation of the
//! same class. the store never shrinks.
//!
//! nothing here is synchronized. reads go through `&self`, anything that changes
//! the store needs `&mut self`, and it is up to the owner (see `Session`) to make
//! sure there is only ever one writer.

use std::{fmt::Write as _, io, mem::size_of};

use derivative::Derivative;
use zerocopy::{AsBytes, FromBytes};

use self::{
    error::{DbError, FormatError, Result},
    ptr::{Ptr, Void},
    repr::{ChunkFlags, ChunkHeader, DbHeader},
    store::{MemStore, Storage},
};

pub mod error;
pub mod ptr;
pub mod repr;
pub mod store;
mod string;
#[cfg(test)]
mod test;

pub use string::DbString;

pub mod tuning {
    /// allocation granularity, every chunk payload is a multiple of this
    pub const GRANULE: usize = 8;
    /// the largest single allocation. bigger things (long strings) are split up
    pub const MAX_MALLOC_SIZE: u32 = 4096;
    pub const NUM_SIZE_CLASSES: usize = MAX_MALLOC_SIZE as usize / GRANULE;
    /// number of slots in the root record table
    pub const NUM_ROOTS: usize = 16;
    /// default minimum step to grow the store by
    pub const DEFAULT_GROW_BY: u64 = 64 * 1024;
}

const CHUNK_HEADER_SIZE: u64 = size_of::<ChunkHeader>() as u64;

/// Information about a single chunk, as found by [`Database::chunks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// the address handed out by malloc (first byte of the payload)
    pub addr: Ptr<Void>,
    /// payload length
    pub len: u32,
    pub free: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// bytes tracked by the allocator (header included)
    pub used: u64,
    /// total size of the store
    pub size: u64,
    pub live_chunks: usize,
    pub live_bytes: u64,
    pub free_chunks: usize,
    pub free_bytes: u64,
}

/// the database
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Database {
    #[derivative(Debug = "ignore")]
    store: Box<dyn Storage>,
    grow_by: u64,
}

impl Database {
    /// Initialize a new database in `store`, discarding anything it contains.
    #[instrument(skip(store))]
    pub fn create(store: impl Storage) -> Result<Self> {
        let mut db = Self::wrap(store);
        db.init()?;
        Ok(db)
    }

    /// Open the database contained in `store`.
    ///
    /// An empty store is initialized. Anything that is not a database of the current
    /// format version is refused with [`DbError::Format`], and left untouched.
    #[instrument(skip(store))]
    pub fn open(store: impl Storage) -> Result<Self> {
        let mut db = Self::wrap(store);
        if db.store.size()? == 0 {
            info!("store is empty, initializing a new database");
            db.init()?;
        } else {
            db.verify()?;
            debug!("found and opened existing database");
        }
        Ok(db)
    }

    /// Like [`open`](Self::open), but an unusable store is re-initialized instead of refused.
    ///
    /// The returned flag is true when the previous content was thrown away (or there was none),
    /// meaning that the caller has to rebuild whatever it keeps in the database.
    #[instrument(skip(store))]
    pub fn open_or_rebuild(store: impl Storage) -> Result<(Self, bool)> {
        let mut db = Self::wrap(store);
        if db.store.size()? == 0 {
            info!("store is empty, initializing a new database");
            db.init()?;
            return Ok((db, true));
        }
        match db.verify() {
            Ok(()) => Ok((db, false)),
            Err(err) => {
                warn!("existing database is unusable ({err}), rebuilding it from scratch");
                db.init()?;
                Ok((db, true))
            }
        }
    }

    /// A fresh database that lives only in memory
    pub fn new_in_ram() -> Result<Self> {
        Self::create(MemStore::new())
    }

    /// set the minimum amount the store is grown by when it runs out of space
    pub fn with_grow_by(mut self, grow_by: u64) -> Self {
        self.grow_by = grow_by.max(CHUNK_HEADER_SIZE);
        self
    }

    fn wrap(store: impl Storage) -> Self {
        Self {
            store: Box::new(store),
            grow_by: tuning::DEFAULT_GROW_BY,
        }
    }

    fn init(&mut self) -> Result<()> {
        let size = self.store.size()?;
        if size < DbHeader::SIZE {
            self.store.expand_by(DbHeader::SIZE - size)?;
        }
        self.write_typed(Ptr::<DbHeader>::null(), &DbHeader::new())
    }

    fn verify(&self) -> Result<(), FormatError> {
        let size = self
            .store
            .size()
            .map_err(|_| FormatError::Corrupt)?;
        if size < DbHeader::SIZE {
            return Err(FormatError::Truncated {
                used: DbHeader::SIZE,
                size,
            });
        }
        let header = self
            .read_typed(Ptr::<DbHeader>::null())
            .map_err(|_| FormatError::Corrupt)?;
        if !header.verify_magic() {
            error!("store contains data that is NOT a symdex database (magic bytes are missing)");
            return Err(FormatError::NotADatabase);
        }
        if header.version != repr::FORMAT_VERSION {
            return Err(FormatError::Version {
                found: header.version,
                expected: repr::FORMAT_VERSION,
            });
        }
        if header.used > size {
            return Err(FormatError::Truncated {
                used: header.used,
                size,
            });
        }
        if header.used < DbHeader::SIZE || header.used % tuning::GRANULE as u64 != 0 {
            return Err(FormatError::Corrupt);
        }
        Ok(())
    }

    /// number of bytes handed out so far (header included)
    pub fn used(&self) -> Result<u64> {
        self.read_typed(Ptr::<u64>::with(DbHeader::USED_OFFSET))
    }

    fn set_used(&mut self, used: u64) -> Result<()> {
        self.write_typed(Ptr::<u64>::with(DbHeader::USED_OFFSET), &used)
    }

    /// total size of the backing store
    pub fn size(&self) -> Result<u64> {
        Ok(self.store.size()?)
    }

    /// Allocate a chunk of at least `size` bytes.
    ///
    /// The content of the chunk is unspecified (recycled chunks are not cleared).
    /// The returned pointer is never null.
    #[instrument(level = "trace", skip(self))]
    pub fn malloc(&mut self, size: u32) -> Result<Ptr<Void>> {
        if size == 0 {
            return Err(DbError::ZeroSized);
        }
        if size > tuning::MAX_MALLOC_SIZE {
            return Err(DbError::TooLarge {
                size,
                max: tuning::MAX_MALLOC_SIZE,
            });
        }
        let class = repr::size_class(size);
        let len = repr::class_size(class);
        let slot = DbHeader::free_list_slot(class);
        let head = self.read_typed(slot)?;
        let chunk = if !head.is_null() {
            trace!("reusing free chunk {head:?}");
            let mut header = self.read_typed(head)?;
            if !header.flags().is_some_and(|f| f.contains(ChunkFlags::FREE)) {
                error!("corrupt data: in-use chunk {head:?} on free list");
                return Err(DbError::Corrupt("in-use chunk on free list"));
            }
            if header.len != len {
                error!("corrupt data: chunk {head:?} of size {} on the free list for size {len}", header.len);
                return Err(DbError::Corrupt("chunk on the wrong free list"));
            }
            // pop it
            self.write_typed(slot, &header.next)?;
            header.flags = ChunkFlags::IN_USE.bits();
            header.next = Ptr::null();
            self.write_typed(head, &header)?;
            head
        } else {
            trace!("no free chunk of size {len} - expanding");
            let used = self.used()?;
            let needed = CHUNK_HEADER_SIZE + len as u64;
            self.reserve(used + needed)?;
            let chunk = Ptr::<ChunkHeader>::with(used);
            self.write_typed(
                chunk,
                &ChunkHeader {
                    flags: ChunkFlags::IN_USE.bits(),
                    len,
                    next: Ptr::null(),
                },
            )?;
            self.set_used(used + needed)?;
            chunk
        };
        Ok(chunk.offset(CHUNK_HEADER_SIZE as i64).cast())
    }

    /// make sure the store is at least `end` bytes long
    fn reserve(&mut self, end: u64) -> Result<()> {
        let size = self.store.size()?;
        if end <= size {
            return Ok(());
        }
        let delta = end - size;
        if !self.store.resizeable() {
            error!("out of space: the store is full, and can not be resized");
            return Err(DbError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "store is full and fixed size",
            )));
        }
        if self.grow_by > delta {
            match self.store.expand_by(self.grow_by) {
                Ok(()) => return Ok(()),
                // a full step may not fit, the exact amount might
                Err(e) => debug!("failed to grow store by {}: {e}", self.grow_by),
            }
        }
        self.store.expand_by(delta).map_err(|e| {
            error!("out of space: failed to grow the store by {delta} bytes: {e}");
            DbError::Io(e)
        })
    }

    /// find and check the header of the chunk `ptr` was allocated as
    fn chunk_of<T>(&self, ptr: Ptr<T>) -> Result<(Ptr<ChunkHeader>, ChunkHeader)> {
        let invalid = || DbError::PointerInvalid(ptr.cast());
        if ptr.addr < DbHeader::SIZE + CHUNK_HEADER_SIZE
            || (ptr.addr - DbHeader::SIZE) % tuning::GRANULE as u64 != 0
            || ptr.addr >= self.used()?
        {
            return Err(invalid());
        }
        let chunk = ptr.cast::<ChunkHeader>().offset(-(CHUNK_HEADER_SIZE as i64));
        let header = self.read_typed(chunk)?;
        if header.len == 0
            || header.len > tuning::MAX_MALLOC_SIZE
            || header.len as usize % tuning::GRANULE != 0
            || header.flags().is_none()
        {
            return Err(invalid());
        }
        Ok((chunk, header))
    }

    /// payload size of the chunk at `ptr`
    pub fn allocation_size<T>(&self, ptr: Ptr<T>) -> Result<u32> {
        Ok(self.chunk_of(ptr)?.1.len)
    }

    /// Return the chunk at `ptr` to the allocator.
    ///
    /// The pointer (and every copy of it) must not be used afterwards.
    #[instrument(level = "trace", skip(self))]
    pub fn free<T>(&mut self, ptr: Ptr<T>) -> Result<()> {
        let (chunk, mut header) = self.chunk_of(ptr)?;
        if header.flags().is_some_and(|f| f.contains(ChunkFlags::FREE)) {
            error!("double free of {ptr:?}");
            return Err(DbError::DoubleFree(ptr.cast()));
        }
        let slot = DbHeader::free_list_slot(repr::size_class(header.len));
        header.flags = ChunkFlags::FREE.bits();
        header.next = self.read_typed(slot)?;
        self.write_typed(chunk, &header)?;
        self.write_typed(slot, &chunk)?;
        Ok(())
    }

    fn map_io(at: Ptr<Void>, len: usize) -> impl FnOnce(io::Error) -> DbError {
        move |e| match e.kind() {
            io::ErrorKind::UnexpectedEof => DbError::OutOfBounds {
                at: at.addr,
                len: len as u64,
            },
            _ => DbError::Io(e),
        }
    }

    pub fn read_bytes(&self, at: Ptr<Void>, into: &mut [u8]) -> Result<()> {
        self.store
            .read_buf(at, into)
            .map_err(Self::map_io(at, into.len()))
    }

    pub fn write_bytes(&mut self, at: Ptr<Void>, from: &[u8]) -> Result<()> {
        self.store
            .write_buf(at, from)
            .map_err(Self::map_io(at, from.len()))
    }

    /// overwrite `len` bytes at `at` with zeros
    pub fn zero(&mut self, at: Ptr<Void>, len: u32) -> Result<()> {
        self.write_bytes(at, &vec![0; len as usize])
    }

    pub fn read_typed<T: FromBytes>(&self, at: Ptr<T>) -> Result<T> {
        let mut buf = vec![0; size_of::<T>()];
        self.read_bytes(at.cast(), &mut buf)?;
        T::read_from(buf.as_slice()).ok_or(DbError::Corrupt("short read"))
    }

    pub fn write_typed<T: AsBytes>(&mut self, at: Ptr<T>, from: &T) -> Result<()> {
        self.write_bytes(at.cast(), from.as_bytes())
    }

    fn read_array<const N: usize>(&self, at: Ptr<Void>) -> Result<[u8; N]> {
        let mut buf = [0; N];
        self.read_bytes(at, &mut buf)?;
        Ok(buf)
    }

    pub fn get_byte(&self, at: Ptr<Void>) -> Result<u8> {
        Ok(u8::from_ne_bytes(self.read_array(at)?))
    }

    pub fn put_byte(&mut self, at: Ptr<Void>, value: u8) -> Result<()> {
        self.write_bytes(at, &value.to_ne_bytes())
    }

    pub fn get_char(&self, at: Ptr<Void>) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.read_array(at)?))
    }

    pub fn put_char(&mut self, at: Ptr<Void>, value: u16) -> Result<()> {
        self.write_bytes(at, &value.to_ne_bytes())
    }

    pub fn get_short(&self, at: Ptr<Void>) -> Result<i16> {
        Ok(i16::from_ne_bytes(self.read_array(at)?))
    }

    pub fn put_short(&mut self, at: Ptr<Void>, value: i16) -> Result<()> {
        self.write_bytes(at, &value.to_ne_bytes())
    }

    pub fn get_int(&self, at: Ptr<Void>) -> Result<i32> {
        Ok(i32::from_ne_bytes(self.read_array(at)?))
    }

    pub fn put_int(&mut self, at: Ptr<Void>, value: i32) -> Result<()> {
        self.write_bytes(at, &value.to_ne_bytes())
    }

    pub fn get_long(&self, at: Ptr<Void>) -> Result<i64> {
        Ok(i64::from_ne_bytes(self.read_array(at)?))
    }

    pub fn put_long(&mut self, at: Ptr<Void>, value: i64) -> Result<()> {
        self.write_bytes(at, &value.to_ne_bytes())
    }

    /// read a stored address (8 bytes)
    pub fn get_ptr<T>(&self, at: Ptr<Void>) -> Result<Ptr<T>> {
        Ok(Ptr::with(u64::from_ne_bytes(self.read_array(at)?)))
    }

    pub fn put_ptr<T>(&mut self, at: Ptr<Void>, value: Ptr<T>) -> Result<()> {
        self.write_bytes(at, &value.addr.to_ne_bytes())
    }

    /// address of root slot `idx`, so that it can be used as the root of an index
    pub fn root_slot(&self, idx: usize) -> Result<Ptr<Void>> {
        if idx >= tuning::NUM_ROOTS {
            return Err(DbError::RootIndex(idx));
        }
        Ok(DbHeader::root_slot(idx).cast())
    }

    pub fn root(&self, idx: usize) -> Result<Ptr<Void>> {
        self.get_ptr(self.root_slot(idx)?)
    }

    pub fn set_root(&mut self, idx: usize, to: Ptr<Void>) -> Result<()> {
        let slot = self.root_slot(idx)?;
        self.put_ptr(slot, to)
    }

    /// Walk every chunk between the header and the end of the used space.
    pub fn chunks(&self) -> Result<Vec<ChunkInfo>> {
        let used = self.used()?;
        let mut chunks = vec![];
        let mut at = Ptr::<ChunkHeader>::with(DbHeader::SIZE);
        while at.addr < used {
            let header = self.read_typed(at)?;
            let Some(flags) = header.flags() else {
                error!("corrupt data: chunk at {at:?} has invalid flags {:#b}", header.flags);
                return Err(DbError::Corrupt("chunk flags contain invalid bits"));
            };
            if header.len == 0 || at.addr + CHUNK_HEADER_SIZE + header.len as u64 > used {
                error!("corrupt data: chunk at {at:?} has invalid length {}", header.len);
                return Err(DbError::Corrupt("chunk length is invalid"));
            }
            chunks.push(ChunkInfo {
                addr: at.offset(CHUNK_HEADER_SIZE as i64).cast(),
                len: header.len,
                free: flags.contains(ChunkFlags::FREE),
            });
            at = at.offset((CHUNK_HEADER_SIZE + header.len as u64) as i64);
        }
        Ok(chunks)
    }

    pub fn usage(&self) -> Result<Usage> {
        let mut usage = Usage {
            used: self.used()?,
            size: self.size()?,
            ..Default::default()
        };
        for chunk in self.chunks()? {
            if chunk.free {
                usage.free_chunks += 1;
                usage.free_bytes += chunk.len as u64;
            } else {
                usage.live_chunks += 1;
                usage.live_bytes += chunk.len as u64;
            }
        }
        Ok(usage)
    }

    #[instrument(skip(self))]
    pub fn infodump(&self) -> Result<()> {
        let usage = self.usage()?;
        info!(
            "Database tracking {} / {} ({:.2}% of the store)",
            fmt_size(usage.used),
            fmt_size(usage.size),
            usage.used as f64 / usage.size.max(1) as f64 * 100.0
        );
        info!(
            "{} live chunks ({}), {} free chunks ({})",
            usage.live_chunks,
            fmt_size(usage.live_bytes),
            usage.free_chunks,
            fmt_size(usage.free_bytes)
        );
        let mut classes = String::new();
        for class in 0..tuning::NUM_SIZE_CLASSES {
            if !self.read_typed(DbHeader::free_list_slot(class))?.is_null() {
                let _ = write!(classes, "{} ", repr::class_size(class));
            }
        }
        debug!("free lists exist for sizes [{}]", classes.trim());
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.store.sync()?)
    }

    #[instrument(skip(self))]
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

/// human readable byte count
pub fn fmt_size(nbytes: u64) -> String {
    const PRECISION: usize = 2;
    let (unit, pow): (_, u32) = match () {
        _ if nbytes >= 10u64.pow(12) => ("TB", 12),
        _ if nbytes >= 10u64.pow(9) => ("GB", 9),
        _ if nbytes >= 10u64.pow(6) => ("MB", 6),
        _ if nbytes >= 10u64.pow(3) => ("KB", 3),
        _ => ("B", 0),
    };
    format!("{:.*}{unit}", PRECISION, nbytes as f64 / 10u64.pow(pow) as f64)
}
