use std::mem::{offset_of, size_of};

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::{
    ptr::{Ptr, Void},
    tuning,
};

pub const MAGIC_BYTES: [u8; 12] = *b"symdex index";

/// bumped whenever the layout of anything stored in the file changes.
/// files written with a different version are rebuilt, never migrated
pub const FORMAT_VERSION: u32 = 3;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    pub struct ChunkFlags: u32 {
        const IN_USE = 0b00000000_00000000_00000000_00000001;
        const FREE   = 0b10000000_00000000_00000000_00000000;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct ChunkHeader {
    /// (ChunkFlags)
    pub flags: u32,
    /// payload length of the chunk (always a whole size class)
    pub len: u32,
    /// next free chunk of the same size class (null if last)
    /// - dangling if in use
    pub next: Ptr<ChunkHeader>,
}

static_assertions::const_assert_eq!(size_of::<ChunkHeader>(), 16);

impl ChunkHeader {
    pub fn flags(&self) -> Option<ChunkFlags> {
        let flags = ChunkFlags::from_bits(self.flags)?;
        // exactly one of the two state bits must be set
        (flags.contains(ChunkFlags::IN_USE) != flags.contains(ChunkFlags::FREE)).then_some(flags)
    }
}

#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct DbHeader {
    pub magic_bytes: [u8; 12],
    pub version: u32,
    /// number of bytes (from the start of the store) that have been handed out as chunks,
    /// including this header. everything past this is unused
    pub used: u64,
    /// addresses of the records everything else is reachable from
    pub roots: [Ptr<Void>; tuning::NUM_ROOTS],
    /// head of the free list for every size class (null when empty)
    pub free_list: [Ptr<ChunkHeader>; tuning::NUM_SIZE_CLASSES],
}

static_assertions::const_assert_eq!(size_of::<DbHeader>() % 8, 0);

impl DbHeader {
    pub const SIZE: u64 = size_of::<Self>() as u64;
    pub const USED_OFFSET: u64 = offset_of!(Self, used) as u64;
    pub const ROOTS_OFFSET: u64 = offset_of!(Self, roots) as u64;
    pub const FREE_LIST_OFFSET: u64 = offset_of!(Self, free_list) as u64;

    pub fn new() -> Self {
        Self {
            magic_bytes: MAGIC_BYTES,
            version: FORMAT_VERSION,
            used: Self::SIZE,
            ..Self::new_zeroed()
        }
    }

    pub fn verify_magic(&self) -> bool {
        self.magic_bytes == MAGIC_BYTES
    }

    /// address of the free list head for `class`
    pub fn free_list_slot(class: usize) -> Ptr<Ptr<ChunkHeader>> {
        debug_assert!(class < tuning::NUM_SIZE_CLASSES);
        Ptr::with(Self::FREE_LIST_OFFSET + (class * size_of::<Ptr<ChunkHeader>>()) as u64)
    }

    /// address of root slot `idx`
    pub fn root_slot(idx: usize) -> Ptr<Ptr<Void>> {
        debug_assert!(idx < tuning::NUM_ROOTS);
        Ptr::with(Self::ROOTS_OFFSET + (idx * size_of::<Ptr<Void>>()) as u64)
    }
}

/// the size class that a payload of `size` bytes is served from
pub fn size_class(size: u32) -> usize {
    debug_assert!(size > 0);
    ((size as usize + tuning::GRANULE - 1) / tuning::GRANULE) - 1
}

/// payload size of chunks in `class`
pub fn class_size(class: usize) -> u32 {
    ((class + 1) * tuning::GRANULE) as u32
}

#[test]
fn size_classes_round_up() {
    assert_eq!(size_class(1), 0);
    assert_eq!(size_class(8), 0);
    assert_eq!(size_class(9), 1);
    assert_eq!(class_size(size_class(13)), 16);
    assert_eq!(
        size_class(tuning::MAX_MALLOC_SIZE),
        tuning::NUM_SIZE_CLASSES - 1
    );
}
