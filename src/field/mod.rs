//! # Record layout
//!
//! Records are plain chunks of the [`Database`], their layout is described by field
//! descriptors. A descriptor knows its width and (once added to a
//! [`StructBuilder`]) its offset, and reads or writes its value in any record of the
//! shape it belongs to. Descriptors are `Copy` and hold no per-record state.
//!
//! ```ignore
//! let mut shape = StructBuilder::new();
//! let name = shape.add(FieldString::new());
//! let line = shape.add(FieldInt::new());
//! let shape = shape.seal();
//!
//! let record = shape.alloc(&mut db)?;
//! name.put(&mut db, record, "main")?;
//! line.put(&mut db, record, 12)?;
//! ```
//!
//! Fields that own other storage (strings, index entries, tree nodes) are
//! [`Destructable`]. `StructDef::destruct` tears them down before the record is freed.

use std::sync::Arc;

use crate::db::{
    error::Result,
    ptr::{Ptr, Void},
    Database,
};

pub mod builder;
pub mod primitive;
pub mod string;

pub use builder::{FieldInfo, StructBuilder, StructDef};
pub use primitive::{FieldByte, FieldChar, FieldInt, FieldLong, FieldPtr, FieldShort};
pub use string::{FieldBTree, FieldSearchKey, FieldString, KeyOrder};

/// A fixed width slot in a record
pub trait Field: Copy + Send + Sync + 'static {
    /// short name of the field type, for debugging output
    const KIND: &'static str;

    /// bytes taken up in the record
    fn width(&self) -> u32;
    fn offset(&self) -> u32;
    /// only called by [`StructBuilder::add`]
    fn set_offset(&mut self, offset: u32);

    /// teardown for this field, if it owns anything outside of the record
    fn destructor(&self) -> Option<Arc<dyn Destructable>> {
        None
    }

    /// address of this field in `record`
    fn at(&self, record: Ptr<Void>) -> Ptr<Void> {
        record.field(self.offset())
    }
}

/// Releases whatever a field owns in a record that is about to be freed
pub trait Destructable: Send + Sync {
    fn destruct(&self, db: &mut Database, record: Ptr<Void>) -> Result<()>;
}
