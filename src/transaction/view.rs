//! Read access shared by read and write transactions

use crate::catalog::{Catalog, EntityType};
use crate::error::Result;
use crate::storage::record::{decode_record, Entity, EntityId};
use crate::storage::record_store::RecordLocation;

use super::version::Version;

mod sealed {
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;

/// A consistent view of the store: a snapshot, plus the transaction's own
/// writes for write transactions
pub trait ReadView: Sealed {
    /// The version this view reads
    fn version(&self) -> &Version;

    /// Raw record bytes at a location
    fn read_record(&self, location: RecordLocation) -> Result<Vec<u8>>;

    fn catalog(&self) -> &Catalog {
        &self.version().catalog
    }

    /// Load one entity
    fn load(&self, ty: &EntityType, id: EntityId) -> Result<Option<Entity>> {
        match self.version().location(ty.id, id) {
            Some(location) => {
                let record = self.read_record(location)?;
                decode_record(ty, &record).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Whether an entity exists
    fn contains(&self, ty: &EntityType, id: EntityId) -> bool {
        self.version().location(ty.id, id).is_some()
    }
}
