//! String storage
//!
//! short strings (up to `SHORT_MAX` bytes of UTF-8) live in a single chunk:
//! `[len: u32][bytes]`
//!
//! anything longer is split over a chain of maximum size chunks:
//! - first chunk: `[len: u32][pad: u32][next: Ptr][bytes]`
//! - continuation chunks: `[next: Ptr][bytes]`

use std::cmp::Ordering;

use super::{
    error::{DbError, Result},
    ptr::{Ptr, Void},
    tuning::MAX_MALLOC_SIZE,
    Database,
};

/// Marker type for handles returned by [`Database::new_string`]
pub enum DbString {}

const LEN_SIZE: u32 = 4;
const SHORT_MAX: usize = (MAX_MALLOC_SIZE - LEN_SIZE) as usize;
const LONG_NEXT_OFFSET: u32 = 8;
const LONG_DATA_OFFSET: u32 = 16;
const LONG_FIRST_CAP: usize = (MAX_MALLOC_SIZE - LONG_DATA_OFFSET) as usize;
const CONT_DATA_OFFSET: u32 = 8;
const CONT_CAP: usize = (MAX_MALLOC_SIZE - CONT_DATA_OFFSET) as usize;

impl Database {
    /// Store `text`, returning a handle to it
    pub fn new_string(&mut self, text: &str) -> Result<Ptr<DbString>> {
        let bytes = text.as_bytes();
        let len = u32::try_from(bytes.len()).map_err(|_| DbError::TooLarge {
            size: u32::MAX,
            max: u32::MAX,
        })?;
        if bytes.len() <= SHORT_MAX {
            let ptr = self.malloc(LEN_SIZE + len)?;
            self.write_typed(ptr.cast::<u32>(), &len)?;
            self.write_bytes(ptr.field(LEN_SIZE), bytes)?;
            return Ok(ptr.cast());
        }
        let mut allocated = vec![];
        match self.write_long_string(bytes, &mut allocated) {
            Ok(ptr) => Ok(ptr),
            Err(e) => {
                // hand back whatever was already taken, the string is unusable
                for chunk in allocated {
                    if let Err(e) = self.free(chunk) {
                        warn!("failed to release partial string chunk {chunk:?}: {e}");
                    }
                }
                Err(e)
            }
        }
    }

    fn write_long_string(
        &mut self,
        bytes: &[u8],
        allocated: &mut Vec<Ptr<Void>>,
    ) -> Result<Ptr<DbString>> {
        let (first, rest) = bytes.split_at(LONG_FIRST_CAP);
        // build the chain back to front, so every chunk can be written in one go
        let mut next = Ptr::<Void>::null();
        let parts = rest.chunks(CONT_CAP).collect::<Vec<_>>();
        for part in parts.into_iter().rev() {
            let chunk = self.malloc(CONT_DATA_OFFSET + part.len() as u32)?;
            allocated.push(chunk);
            self.put_ptr(chunk, next)?;
            self.write_bytes(chunk.field(CONT_DATA_OFFSET), part)?;
            next = chunk;
        }
        let head = self.malloc(MAX_MALLOC_SIZE)?;
        allocated.push(head);
        self.write_typed(head.cast::<u32>(), &(bytes.len() as u32))?;
        self.write_typed(head.field::<u32>(LEN_SIZE), &0)?;
        self.put_ptr(head.field(LONG_NEXT_OFFSET), next)?;
        self.write_bytes(head.field(LONG_DATA_OFFSET), first)?;
        Ok(head.cast())
    }

    /// length of the string in bytes
    pub fn string_len(&self, ptr: Ptr<DbString>) -> Result<usize> {
        if ptr.is_null() {
            return Err(DbError::PointerInvalid(ptr.cast()));
        }
        Ok(self.read_typed(ptr.cast::<u32>())? as usize)
    }

    fn string_bytes(&self, ptr: Ptr<DbString>) -> Result<Vec<u8>> {
        let len = self.string_len(ptr)?;
        let ptr = ptr.cast::<Void>();
        if len as u64 > self.used()? {
            error!("corrupt data: string {ptr:?} claims to be {len} bytes long");
            return Err(DbError::Corrupt("string is longer than the store"));
        }
        if len <= SHORT_MAX {
            let mut buf = vec![0; len];
            self.read_bytes(ptr.field(LEN_SIZE), &mut buf)?;
            return Ok(buf);
        }
        let mut buf = vec![0; len];
        let (first, mut rest) = buf.split_at_mut(LONG_FIRST_CAP);
        self.read_bytes(ptr.field(LONG_DATA_OFFSET), first)?;
        let mut next = self.get_ptr::<Void>(ptr.field(LONG_NEXT_OFFSET))?;
        while !rest.is_empty() {
            if next.is_null() {
                error!("corrupt data: string {ptr:?} ends before its length");
                return Err(DbError::Corrupt("string chain ends early"));
            }
            let n = rest.len().min(CONT_CAP);
            let (part, tail) = std::mem::take(&mut rest).split_at_mut(n);
            let Some(data) = next.checked_field(CONT_DATA_OFFSET) else {
                error!("corrupt data: string {ptr:?} links to {next:?}");
                return Err(DbError::Corrupt("string chain points outside of the store"));
            };
            self.read_bytes(data, part)?;
            next = self.get_ptr(next)?;
            rest = tail;
        }
        Ok(buf)
    }

    pub fn get_string(&self, ptr: Ptr<DbString>) -> Result<String> {
        Ok(String::from_utf8(self.string_bytes(ptr)?)?)
    }

    /// Release the storage of a string. The handle must not be used again.
    pub fn free_string(&mut self, ptr: Ptr<DbString>) -> Result<()> {
        if self.string_len(ptr)? > SHORT_MAX {
            let mut next = self.get_ptr::<Void>(ptr.cast::<Void>().field(LONG_NEXT_OFFSET))?;
            while !next.is_null() {
                let after = self.get_ptr(next)?;
                self.free(next)?;
                next = after;
            }
        }
        self.free(ptr)
    }

    /// byte-wise comparison of two stored strings
    pub fn compare_strings(&self, a: Ptr<DbString>, b: Ptr<DbString>) -> Result<Ordering> {
        Ok(self.string_bytes(a)?.cmp(&self.string_bytes(b)?))
    }

    /// byte-wise comparison of a stored string with `other`
    pub fn compare_string_to(&self, a: Ptr<DbString>, other: &str) -> Result<Ordering> {
        Ok(self.string_bytes(a)?.as_slice().cmp(other.as_bytes()))
    }
}
