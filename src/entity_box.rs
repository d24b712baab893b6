//! Entity boxes for boxdb
//!
//! A box is the per-type entry point for reading and writing entities.
//! `EntityBox` is standalone: every call runs in its own transaction, and
//! writes retry on conflicts. `TxnBox` and `ReadBox` are bound to an explicit
//! transaction and see exactly what that transaction sees.
//!
//! `TypedBox<T>` wraps an `EntityBox` for structs implementing `Persistable`.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::catalog::{EntityDef, EntityType};
use crate::error::Result;
use crate::query::{Predicate, Query, Source};
use crate::storage::record::{Entity, EntityId};
use crate::transaction::{ReadTxn, ReadView, TransactionManager, WriteTxn};

// ========== Shared read helpers ==========

fn get_in(view: &dyn ReadView, ty: &EntityType, id: EntityId) -> Result<Option<Entity>> {
    view.load(ty, id)
}

fn get_many_in(view: &dyn ReadView, ty: &EntityType, ids: &[EntityId]) -> Result<Vec<Option<Entity>>> {
    ids.iter().map(|id| view.load(ty, *id)).collect()
}

fn all_in(view: &dyn ReadView, ty: &EntityType) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();
    for (id, _) in view.version().directory(ty.id)?.iter() {
        if let Some(entity) = view.load(ty, *id)? {
            entities.push(entity);
        }
    }
    Ok(entities)
}

fn count_in(view: &dyn ReadView, ty: &EntityType) -> usize {
    view.version().entity_count(ty.id)
}

fn ids_in(view: &dyn ReadView, ty: &EntityType) -> Result<Vec<EntityId>> {
    Ok(view
        .version()
        .directory(ty.id)?
        .iter()
        .map(|(id, _)| *id)
        .collect())
}

// ========== Standalone box ==========

/// Box of one entity type, one transaction per call
#[derive(Debug, Clone)]
pub struct EntityBox {
    manager: Arc<TransactionManager>,
    ty: EntityType,
}

impl EntityBox {
    pub(crate) fn new(manager: Arc<TransactionManager>, type_name: &str) -> Result<Self> {
        let ty = manager.current().catalog.get_type(type_name)?.clone();
        Ok(Self { manager, ty })
    }

    /// Entity type of this box
    pub fn entity_type(&self) -> &EntityType {
        &self.ty
    }

    /// Insert or replace an entity, returning its id
    pub fn put(&self, entity: &Entity) -> Result<EntityId> {
        self.manager
            .run_in_write(|txn| txn.put_entity(&self.ty, entity))
    }

    /// Put several entities in one transaction
    pub fn put_many(&self, entities: &[Entity]) -> Result<Vec<EntityId>> {
        self.manager.run_in_write(|txn| {
            entities
                .iter()
                .map(|entity| txn.put_entity(&self.ty, entity))
                .collect()
        })
    }

    pub fn get(&self, id: EntityId) -> Result<Option<Entity>> {
        get_in(&self.manager.begin_read(), &self.ty, id)
    }

    /// Get several entities from one snapshot, `None` for missing ids
    pub fn get_many(&self, ids: &[EntityId]) -> Result<Vec<Option<Entity>>> {
        get_many_in(&self.manager.begin_read(), &self.ty, ids)
    }

    pub fn contains(&self, id: EntityId) -> Result<bool> {
        Ok(self.manager.begin_read().contains(&self.ty, id))
    }

    /// Remove an entity; false if it did not exist
    pub fn remove(&self, id: EntityId) -> Result<bool> {
        self.manager
            .run_in_write(|txn| txn.remove_entity(&self.ty, id))
    }

    /// Remove every entity of this type
    pub fn remove_all(&self) -> Result<usize> {
        self.manager.run_in_write(|txn| {
            let ids = ids_in(&*txn, &self.ty)?;
            for id in &ids {
                txn.remove_entity(&self.ty, *id)?;
            }
            Ok(ids.len())
        })
    }

    /// All entities in id order
    pub fn all(&self) -> Result<Vec<Entity>> {
        all_in(&self.manager.begin_read(), &self.ty)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(count_in(&self.manager.begin_read(), &self.ty))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Query entities matching `predicate`
    pub fn query(&self, predicate: Predicate) -> Result<Query<'static>> {
        Query::new(
            Source::Store(Arc::clone(&self.manager)),
            &self.ty.name,
            Some(predicate),
        )
    }

    /// Query every entity of this type
    pub fn query_all(&self) -> Result<Query<'static>> {
        Query::new(Source::Store(Arc::clone(&self.manager)), &self.ty.name, None)
    }
}

// ========== Transaction-bound boxes ==========

/// Box bound to a write transaction
pub struct TxnBox<'t> {
    txn: &'t mut WriteTxn,
    ty: EntityType,
}

impl WriteTxn {
    /// Box of one entity type inside this transaction
    pub fn entity_box(&mut self, type_name: &str) -> Result<TxnBox<'_>> {
        let ty = self.catalog().get_type(type_name)?.clone();
        Ok(TxnBox { txn: self, ty })
    }
}

impl TxnBox<'_> {
    pub fn put(&mut self, entity: &Entity) -> Result<EntityId> {
        self.txn.put_entity(&self.ty, entity)
    }

    pub fn put_many(&mut self, entities: &[Entity]) -> Result<Vec<EntityId>> {
        entities
            .iter()
            .map(|entity| self.txn.put_entity(&self.ty, entity))
            .collect()
    }

    pub fn get(&self, id: EntityId) -> Result<Option<Entity>> {
        get_in(&*self.txn, &self.ty, id)
    }

    pub fn get_many(&self, ids: &[EntityId]) -> Result<Vec<Option<Entity>>> {
        get_many_in(&*self.txn, &self.ty, ids)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.txn.contains(&self.ty, id)
    }

    pub fn remove(&mut self, id: EntityId) -> Result<bool> {
        self.txn.remove_entity(&self.ty, id)
    }

    pub fn remove_all(&mut self) -> Result<usize> {
        let ids = ids_in(&*self.txn, &self.ty)?;
        for id in &ids {
            self.txn.remove_entity(&self.ty, *id)?;
        }
        Ok(ids.len())
    }

    pub fn all(&self) -> Result<Vec<Entity>> {
        all_in(&*self.txn, &self.ty)
    }

    pub fn count(&self) -> usize {
        count_in(&*self.txn, &self.ty)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Query that sees this transaction's own writes
    pub fn query(&mut self, predicate: Predicate) -> Result<Query<'_>> {
        Query::new(Source::Write(&mut *self.txn), &self.ty.name, Some(predicate))
    }

    pub fn query_all(&mut self) -> Result<Query<'_>> {
        Query::new(Source::Write(&mut *self.txn), &self.ty.name, None)
    }
}

/// Box bound to a read transaction
pub struct ReadBox<'t> {
    txn: &'t ReadTxn,
    ty: EntityType,
}

impl ReadTxn {
    /// Box of one entity type inside this transaction
    pub fn entity_box(&self, type_name: &str) -> Result<ReadBox<'_>> {
        let ty = self.catalog().get_type(type_name)?.clone();
        Ok(ReadBox { txn: self, ty })
    }
}

impl<'t> ReadBox<'t> {
    pub fn get(&self, id: EntityId) -> Result<Option<Entity>> {
        get_in(self.txn, &self.ty, id)
    }

    pub fn get_many(&self, ids: &[EntityId]) -> Result<Vec<Option<Entity>>> {
        get_many_in(self.txn, &self.ty, ids)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.txn.contains(&self.ty, id)
    }

    pub fn all(&self) -> Result<Vec<Entity>> {
        all_in(self.txn, &self.ty)
    }

    pub fn count(&self) -> usize {
        count_in(self.txn, &self.ty)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn query(&self, predicate: Predicate) -> Result<Query<'t>> {
        Query::new(Source::Read(self.txn), &self.ty.name, Some(predicate))
    }

    pub fn query_all(&self) -> Result<Query<'t>> {
        Query::new(Source::Read(self.txn), &self.ty.name, None)
    }
}

// ========== Typed boxes ==========

/// A struct stored as an entity
pub trait Persistable: Sized {
    /// Entity type name
    const ENTITY_NAME: &'static str;

    /// Definition of the entity type, for building a schema
    fn entity_def() -> EntityDef;

    /// Current id; unassigned before the first put
    fn id(&self) -> EntityId;

    fn set_id(&mut self, id: EntityId);

    fn to_entity(&self) -> Entity;

    fn from_entity(entity: &Entity) -> Result<Self>;
}

/// Box of a `Persistable` type, one transaction per call
#[derive(Debug, Clone)]
pub struct TypedBox<T> {
    inner: EntityBox,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persistable> TypedBox<T> {
    pub(crate) fn new(manager: Arc<TransactionManager>) -> Result<Self> {
        Ok(Self {
            inner: EntityBox::new(manager, T::ENTITY_NAME)?,
            _marker: PhantomData,
        })
    }

    /// Untyped box of the same entity type
    pub fn untyped(&self) -> &EntityBox {
        &self.inner
    }

    /// Put an object and store its assigned id back into it
    pub fn put(&self, object: &mut T) -> Result<EntityId> {
        let mut entity = object.to_entity();
        entity.id = object.id();
        let id = self.inner.put(&entity)?;
        object.set_id(id);
        Ok(id)
    }

    /// Put several objects in one transaction
    pub fn put_many(&self, objects: &mut [T]) -> Result<Vec<EntityId>> {
        let entities: Vec<Entity> = objects
            .iter()
            .map(|object| {
                let mut entity = object.to_entity();
                entity.id = object.id();
                entity
            })
            .collect();
        let ids = self.inner.put_many(&entities)?;
        for (object, id) in objects.iter_mut().zip(&ids) {
            object.set_id(*id);
        }
        Ok(ids)
    }

    pub fn get(&self, id: EntityId) -> Result<Option<T>> {
        self.inner
            .get(id)?
            .map(|entity| T::from_entity(&entity))
            .transpose()
    }

    pub fn remove(&self, id: EntityId) -> Result<bool> {
        self.inner.remove(id)
    }

    pub fn all(&self) -> Result<Vec<T>> {
        self.inner.all()?.iter().map(T::from_entity).collect()
    }

    pub fn count(&self) -> Result<usize> {
        self.inner.count()
    }

    /// Objects matching `predicate`, in id order
    pub fn find(&self, predicate: Predicate) -> Result<Vec<T>> {
        self.inner
            .query(predicate)?
            .find()?
            .iter()
            .map(T::from_entity)
            .collect()
    }
}
