use std::sync::Arc;

use derivative::Derivative;

use super::{Destructable, Field};
use crate::db::{
    error::Result,
    ptr::{Ptr, Void},
    Database,
};

/// Position of one field in a record shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub offset: u32,
    pub width: u32,
    pub kind: &'static str,
}

/// Lays out fields one after another, in the order they are added.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct StructBuilder {
    size: u32,
    fields: Vec<FieldInfo>,
    #[derivative(Debug = "ignore")]
    destructables: Vec<Arc<dyn Destructable>>,
}

impl StructBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a shape that begins with every field of `parent`.
    ///
    /// Records of the new shape can be used through the parent's descriptors as well.
    pub fn extending(parent: &StructDef) -> Self {
        Self {
            size: parent.size,
            fields: parent.fields.to_vec(),
            destructables: parent.destructables.to_vec(),
        }
    }

    /// Register `field` at the end of the record, returning it with its offset assigned
    pub fn add<F: Field>(&mut self, mut field: F) -> F {
        field.set_offset(self.size);
        let width = field.width();
        self.fields.push(FieldInfo {
            offset: self.size,
            width,
            kind: F::KIND,
        });
        if let Some(destructor) = field.destructor() {
            self.destructables.push(destructor);
        }
        self.size += width;
        field
    }

    /// current size of the record
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Freeze the layout
    pub fn seal(self) -> StructDef {
        trace!("sealed record shape of {} bytes: {:?}", self.size, self.fields);
        StructDef {
            size: self.size,
            fields: self.fields.into(),
            destructables: self.destructables.into(),
        }
    }
}

/// A sealed record shape
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct StructDef {
    size: u32,
    fields: Arc<[FieldInfo]>,
    #[derivative(Debug = "ignore")]
    destructables: Arc<[Arc<dyn Destructable>]>,
}

impl StructDef {
    pub fn record_size(&self) -> u32 {
        self.size
    }

    /// every field, in declaration order
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Allocate a zeroed record of this shape
    pub fn alloc(&self, db: &mut Database) -> Result<Ptr<Void>> {
        let record = db.malloc(self.size)?;
        db.zero(record, self.size)?;
        Ok(record)
    }

    /// Tear down every field that owns something, in declaration order, then free
    /// the record itself.
    pub fn destruct(&self, db: &mut Database, record: Ptr<Void>) -> Result<()> {
        for field in self.destructables.iter() {
            field.destruct(db, record)?;
        }
        db.free(record)
    }
}
