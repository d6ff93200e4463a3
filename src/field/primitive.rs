use std::marker::PhantomData;

use super::Field;
use crate::db::{
    error::Result,
    ptr::{Ptr, Void},
    Database,
};

macro_rules! primitive_field {
    ($(#[$meta:meta])* $name:ident, $ty:ty, $get:ident, $put:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name {
            offset: u32,
        }

        impl $name {
            pub const fn new() -> Self {
                Self { offset: 0 }
            }

            pub fn get(&self, db: &Database, record: Ptr<Void>) -> Result<$ty> {
                db.$get(self.at(record))
            }

            pub fn put(&self, db: &mut Database, record: Ptr<Void>, value: $ty) -> Result<()> {
                db.$put(self.at(record), value)
            }
        }

        impl Field for $name {
            const KIND: &'static str = $kind;

            fn width(&self) -> u32 {
                std::mem::size_of::<$ty>() as u32
            }

            fn offset(&self) -> u32 {
                self.offset
            }

            fn set_offset(&mut self, offset: u32) {
                self.offset = offset;
            }
        }
    };
}

primitive_field!(
    /// unsigned 8 bit value
    FieldByte, u8, get_byte, put_byte, "byte"
);
primitive_field!(
    /// 16 bit code unit
    FieldChar, u16, get_char, put_char, "char"
);
primitive_field!(FieldShort, i16, get_short, put_short, "short");
primitive_field!(FieldInt, i32, get_int, put_int, "int");
primitive_field!(FieldLong, i64, get_long, put_long, "long");

/// Address of another record (or null)
pub struct FieldPtr<T> {
    offset: u32,
    _ph: PhantomData<fn() -> T>,
}

impl<T> FieldPtr<T> {
    pub const fn new() -> Self {
        Self {
            offset: 0,
            _ph: PhantomData,
        }
    }

    pub fn get(&self, db: &Database, record: Ptr<Void>) -> Result<Ptr<T>> {
        db.get_ptr(record.field(self.offset))
    }

    pub fn put(&self, db: &mut Database, record: Ptr<Void>, value: Ptr<T>) -> Result<()> {
        db.put_ptr(record.field(self.offset), value)
    }
}

impl<T> Clone for FieldPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for FieldPtr<T> {}
impl<T> Default for FieldPtr<T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<T> std::fmt::Debug for FieldPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldPtr")
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T: 'static> Field for FieldPtr<T> {
    const KIND: &'static str = "ptr";

    fn width(&self) -> u32 {
        8
    }

    fn offset(&self) -> u32 {
        self.offset
    }

    fn set_offset(&mut self, offset: u32) {
        self.offset = offset;
    }
}
