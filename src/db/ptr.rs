use std::{fmt, hash::Hash, marker::PhantomData};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Untyped target, for addresses of records whose layout is only known to a `StructDef`
pub enum Void {}

/// An address inside the database.
///
/// Address zero is never handed out by the allocator (the file header lives there),
/// so it doubles as the "no value" marker everywhere a pointer is stored.
#[repr(transparent)]
pub struct Ptr<T> {
    pub addr: u64,
    _ph: PhantomData<T>,
}

impl<T> Ptr<T> {
    pub const NULL: Self = Self::with(0);

    pub const fn with(addr: u64) -> Self {
        Self {
            addr,
            _ph: PhantomData,
        }
    }

    pub const fn null() -> Self {
        Self::NULL
    }

    pub fn cast<U>(self) -> Ptr<U> {
        Ptr::with(self.addr)
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// `None` for the null pointer
    pub fn non_null(self) -> Option<Self> {
        (!self.is_null()).then_some(self)
    }

    pub fn offset(self, by: i64) -> Self {
        Self::with(self.addr.checked_add_signed(by).unwrap_or_else(|| {
            panic!("offsetting pointer {:#X} by {by} overflowed", self.addr)
        }))
    }

    /// address of the byte `offset` bytes into the pointee (used by field descriptors)
    pub fn field<U>(self, offset: u32) -> Ptr<U> {
        self.offset(offset as i64).cast()
    }

    /// [`Ptr::field`] for addresses read back from the store, `None` on overflow
    pub fn checked_field<U>(self, offset: u32) -> Option<Ptr<U>> {
        self.addr.checked_add(offset as u64).map(Ptr::with)
    }
}

impl<T> Copy for Ptr<T> {}
impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptr({:#X})", self.addr)
    }
}
impl<T> fmt::Display for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.addr)
    }
}
impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl<T> Eq for Ptr<T> {}
impl<T> PartialOrd for Ptr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Ptr<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr.cmp(&other.addr)
    }
}
impl<T> Hash for Ptr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state)
    }
}
impl<T> Default for Ptr<T> {
    fn default() -> Self {
        Self::NULL
    }
}
impl<T> From<Ptr<T>> for u64 {
    fn from(value: Ptr<T>) -> Self {
        value.addr
    }
}

// Ptr is a plain u64 on disk, the type parameter is only a compile time tag
unsafe impl<T> FromZeroes for Ptr<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
unsafe impl<T> FromBytes for Ptr<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
unsafe impl<T> AsBytes for Ptr<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
unsafe impl<T> Sync for Ptr<T> {}
unsafe impl<T> Send for Ptr<T> {}
