//! Query Executor for boxdb
//!
//! A `Query` is bound to one entity type and runs against a read view: a
//! read transaction, a write transaction (seeing its own writes), or a fresh
//! read transaction per call when built from a standalone box. The planner
//! narrows the candidate ids, every candidate is decoded and checked against
//! the full predicate, and the survivors are ordered and paged.
//!
//! Unordered queries stream: a full scan walks the directory lazily and an
//! indexed plan walks its candidate list. Ordered queries have to see every
//! match before the first one can be returned.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::EntityType;
use crate::error::{Error, Result};
use crate::storage::record::{Entity, EntityId};
use crate::storage::value::Value;
use crate::transaction::{ReadTxn, ReadView, TransactionManager, WriteTxn};

use super::planner::{self, Plan};
use super::predicate::{property_value, CancellationToken, OrderKey, Predicate};

/// Where a query reads from
pub(crate) enum Source<'a> {
    /// A new read transaction for every execution
    Store(Arc<TransactionManager>),
    Read(&'a ReadTxn),
    Write(&'a mut WriteTxn),
}

/// A query over one entity type
pub struct Query<'a> {
    source: Source<'a>,
    spec: Spec,
}

/// Everything that shapes the result, independent of the source
#[derive(Debug, Clone)]
struct Spec {
    ty: EntityType,
    predicate: Option<Predicate>,
    order: Vec<OrderKey>,
    limit: Option<usize>,
    offset: usize,
    cancel: Option<CancellationToken>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(
        source: Source<'a>,
        type_name: &str,
        predicate: Option<Predicate>,
    ) -> Result<Self> {
        let ty = match &source {
            Source::Store(manager) => manager.current().catalog.get_type(type_name)?.clone(),
            Source::Read(txn) => txn.catalog().get_type(type_name)?.clone(),
            Source::Write(txn) => txn.catalog().get_type(type_name)?.clone(),
        };
        let predicate = predicate.map(|p| p.bind(&ty)).transpose()?;
        Ok(Self {
            source,
            spec: Spec {
                ty,
                predicate,
                order: Vec::new(),
                limit: None,
                offset: 0,
                cancel: None,
            },
        })
    }

    /// Order by a property, ascending (nulls first)
    pub fn order_by(mut self, property: impl Into<String>) -> Self {
        self.spec.order.push(OrderKey::asc(property));
        self
    }

    /// Order by a property, descending (nulls last)
    pub fn order_by_desc(mut self, property: impl Into<String>) -> Self {
        self.spec.order.push(OrderKey::desc(property));
        self
    }

    pub fn order(mut self, key: OrderKey) -> Self {
        self.spec.order.push(key);
        self
    }

    /// Return at most `limit` results
    pub fn limit(mut self, limit: usize) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    /// Skip the first `offset` results
    pub fn offset(mut self, offset: usize) -> Self {
        self.spec.offset = offset;
        self
    }

    /// Stop with `Cancelled` once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.spec.cancel = Some(token);
        self
    }

    /// Entity type this query reads
    pub fn entity_type(&self) -> &EntityType {
        &self.spec.ty
    }

    /// The candidate plan the query would run
    pub fn explain(&self) -> Plan {
        self.spec.plan()
    }

    /// Lazy result sequence; `QueryIter::restart` replays it on the same view
    pub fn iter(&self) -> Result<QueryIter<'_>> {
        let view = match &self.source {
            Source::Store(manager) => ViewHandle::Owned(manager.begin_read()),
            Source::Read(txn) => ViewHandle::Borrowed(*txn),
            Source::Write(txn) => ViewHandle::Borrowed(&**txn),
        };
        QueryIter::new(&self.spec, view)
    }

    /// All matching entities
    pub fn find(&self) -> Result<Vec<Entity>> {
        self.iter()?.collect()
    }

    /// Ids of all matching entities
    pub fn find_ids(&self) -> Result<Vec<EntityId>> {
        self.iter()?.map(|entity| entity.map(|e| e.id)).collect()
    }

    /// The first result, if any
    pub fn find_first(&self) -> Result<Option<Entity>> {
        self.iter()?.next().transpose()
    }

    /// The only result; `NotUnique` if there is more than one
    pub fn find_unique(&self) -> Result<Option<Entity>> {
        let mut found = self.find()?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(Error::NotUnique(n)),
        }
    }

    /// Number of matching entities, ignoring limit and offset
    pub fn count(&self) -> Result<usize> {
        match &self.source {
            Source::Store(manager) => self.spec.count(&manager.begin_read()),
            Source::Read(txn) => self.spec.count(*txn),
            Source::Write(txn) => self.spec.count(&**txn),
        }
    }

    /// Values of one property over the results, in result order
    pub fn property_values(&self, property: &str) -> Result<Vec<Value>> {
        if self.spec.ty.property(property).is_none() {
            return Err(Error::InvalidPredicate(format!(
                "unknown property '{}' on '{}'",
                property, self.spec.ty.name
            )));
        }
        self.iter()?
            .map(|entity| entity.map(|e| property_value(&self.spec.ty, &e, property)))
            .collect()
    }

    /// Remove every result, returning how many were removed.
    ///
    /// On a standalone box this runs in its own write transaction.
    pub fn remove(&mut self) -> Result<usize> {
        let spec = &self.spec;
        match &mut self.source {
            Source::Read(_) => Err(Error::ReadOnlyTransaction),
            Source::Write(txn) => spec.remove_in(txn),
            Source::Store(manager) => manager.run_in_write(|txn| spec.remove_in(txn)),
        }
    }
}

impl Spec {
    fn plan(&self) -> Plan {
        planner::plan(&self.ty, self.predicate.as_ref())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            debug!(entity = %self.ty.name, "query cancelled");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn validate_order(&self) -> Result<()> {
        for key in &self.order {
            if self.ty.property(&key.property).is_none() {
                return Err(Error::InvalidPredicate(format!(
                    "cannot order by unknown property '{}' on '{}'",
                    key.property, self.ty.name
                )));
            }
        }
        Ok(())
    }

    /// Candidate ids of an indexed plan, ascending and distinct
    fn candidates(&self, view: &dyn ReadView, plan: &Plan) -> Result<Vec<EntityId>> {
        self.check_cancelled()?;
        let indexes = &view.version().indexes;
        let mut ids = match plan {
            Plan::Empty => Vec::new(),
            Plan::FullScan => view
                .version()
                .directory(self.ty.id)?
                .iter()
                .map(|(id, _)| *id)
                .collect(),
            Plan::IdRange { lower, upper } => view
                .version()
                .directory(self.ty.id)?
                .range(lower.as_ref(), upper.as_ref())
                .map(|(id, _)| *id)
                .collect(),
            Plan::IndexEq { index, value, .. } => indexes.lookup(*index, value)?,
            Plan::IndexIn { index, values, .. } => {
                let mut ids = Vec::new();
                for value in values {
                    ids.extend(indexes.lookup(*index, value)?);
                }
                ids
            }
            Plan::IndexRange {
                index,
                lower,
                upper,
                ..
            } => indexes.range_lookup(*index, lower.as_ref(), upper.as_ref())?,
            Plan::Intersect(children) => {
                let mut sets = children
                    .iter()
                    .map(|child| self.candidates(view, child))
                    .collect::<Result<Vec<_>>>()?;
                sets.sort_by_key(Vec::len);
                let mut sets = sets.into_iter();
                let mut acc = sets.next().unwrap_or_default();
                for set in sets {
                    if acc.is_empty() {
                        break;
                    }
                    acc.retain(|id| set.binary_search(id).is_ok());
                }
                return Ok(acc);
            }
            Plan::Union(children) => {
                let mut ids = Vec::new();
                for child in children {
                    ids.extend(self.candidates(view, child)?);
                }
                ids
            }
        };
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Decode an entity and keep it if it satisfies the predicate
    fn load_match(&self, view: &dyn ReadView, id: EntityId) -> Result<Option<Entity>> {
        let Some(entity) = view.load(&self.ty, id)? else {
            return Ok(None);
        };
        let keep = self
            .predicate
            .as_ref()
            .map_or(true, |p| p.matches(&self.ty, &entity));
        Ok(keep.then_some(entity))
    }

    fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        for key in &self.order {
            let left = property_value(&self.ty, a, &key.property);
            let right = property_value(&self.ty, b, &key.property);
            let ord = if key.descending {
                right.total_cmp(&left)
            } else {
                left.total_cmp(&right)
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    }

    /// Every match, ordered, then paged
    fn sorted(&self, view: &dyn ReadView, plan: &Plan) -> Result<Vec<Entity>> {
        let mut matches = Vec::new();
        for id in self.candidates(view, plan)? {
            self.check_cancelled()?;
            if let Some(entity) = self.load_match(view, id)? {
                matches.push(entity);
            }
        }
        matches.sort_by(|a, b| self.compare(a, b));
        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(matches.into_iter().skip(self.offset).take(limit).collect())
    }

    fn count(&self, view: &dyn ReadView) -> Result<usize> {
        if self.predicate.is_none() {
            return Ok(view.version().entity_count(self.ty.id));
        }
        let plan = self.plan();
        let mut count = 0;
        for id in self.candidates(view, &plan)? {
            self.check_cancelled()?;
            if self.load_match(view, id)?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn remove_in(&self, txn: &mut WriteTxn) -> Result<usize> {
        let ids = QueryIter::new(self, ViewHandle::Borrowed(&*txn))?
            .map(|entity| entity.map(|e| e.id))
            .collect::<Result<Vec<_>>>()?;
        let mut removed = 0;
        for id in ids {
            if txn.remove_entity(&self.ty, id)? {
                removed += 1;
            }
        }
        debug!(entity = %self.ty.name, removed, "removed query results");
        Ok(removed)
    }
}

enum ViewHandle<'q> {
    Owned(ReadTxn),
    Borrowed(&'q dyn ReadView),
}

impl ViewHandle<'_> {
    fn get(&self) -> &dyn ReadView {
        match self {
            ViewHandle::Owned(txn) => txn,
            ViewHandle::Borrowed(view) => *view,
        }
    }
}

enum Cursor {
    /// Lazy walk of the directory, resuming after the last id seen
    Scan { last: Option<EntityId> },
    /// Candidate ids of an indexed plan
    Ids { ids: Vec<EntityId>, pos: usize },
    /// Ordered and paged results
    Sorted { entities: Vec<Entity>, pos: usize },
}

/// Lazy, restartable sequence of query results
pub struct QueryIter<'q> {
    view: ViewHandle<'q>,
    spec: &'q Spec,
    plan: Plan,
    cursor: Cursor,
    skipped: usize,
    yielded: usize,
    done: bool,
}

impl<'q> QueryIter<'q> {
    fn new(spec: &'q Spec, view: ViewHandle<'q>) -> Result<Self> {
        spec.validate_order()?;
        let plan = spec.plan();
        debug!(
            entity = %spec.ty.name,
            version = view.get().version().number,
            %plan,
            "running query"
        );
        let cursor = Self::start(spec, view.get(), &plan)?;
        Ok(Self {
            view,
            spec,
            plan,
            cursor,
            skipped: 0,
            yielded: 0,
            done: false,
        })
    }

    fn start(spec: &Spec, view: &dyn ReadView, plan: &Plan) -> Result<Cursor> {
        Ok(if !spec.order.is_empty() {
            Cursor::Sorted {
                entities: spec.sorted(view, plan)?,
                pos: 0,
            }
        } else if plan.is_full_scan() {
            Cursor::Scan { last: None }
        } else {
            Cursor::Ids {
                ids: spec.candidates(view, plan)?,
                pos: 0,
            }
        })
    }

    /// Start over from the first result, on the same snapshot
    pub fn restart(&mut self) {
        match &mut self.cursor {
            Cursor::Scan { last } => *last = None,
            Cursor::Ids { pos, .. } | Cursor::Sorted { pos, .. } => *pos = 0,
        }
        self.skipped = 0;
        self.yielded = 0;
        self.done = false;
    }

    /// Version the results are read from
    pub fn version(&self) -> u64 {
        self.view.get().version().number
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    fn next_candidate(&mut self) -> Result<Option<EntityId>> {
        match &mut self.cursor {
            Cursor::Scan { last } => {
                let directory = self.view.get().version().directory(self.spec.ty.id)?;
                let lower = last.as_ref().map_or(Bound::Unbounded, Bound::Excluded);
                let next = directory.first_from(lower).map(|(id, _)| id);
                if next.is_some() {
                    *last = next;
                }
                Ok(next)
            }
            Cursor::Ids { ids, pos } => {
                let next = ids.get(*pos).copied();
                *pos += 1;
                Ok(next)
            }
            Cursor::Sorted { .. } => Ok(None),
        }
    }

    fn advance(&mut self) -> Result<Option<Entity>> {
        if let Cursor::Sorted { entities, pos } = &mut self.cursor {
            self.spec.check_cancelled()?;
            let next = entities.get(*pos).cloned();
            *pos += 1;
            return Ok(next);
        }
        if self.spec.limit.is_some_and(|limit| self.yielded >= limit) {
            return Ok(None);
        }
        loop {
            self.spec.check_cancelled()?;
            let Some(id) = self.next_candidate()? else {
                return Ok(None);
            };
            let Some(entity) = self.spec.load_match(self.view.get(), id)? else {
                continue;
            };
            if self.skipped < self.spec.offset {
                self.skipped += 1;
                continue;
            }
            self.yielded += 1;
            return Ok(Some(entity));
        }
    }
}

impl Iterator for QueryIter<'_> {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entity)) => Some(Ok(entity)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityDef, PropertyDef, Schema, TypeTag};
    use crate::config::StoreConfig;
    use crate::storage::pager::Pager;

    fn manager() -> Arc<TransactionManager> {
        let schema = Schema::new().entity(
            EntityDef::new("Person")
                .id("id")
                .property(PropertyDef::new("name", TypeTag::String))
                .property(PropertyDef::new("age", TypeTag::Int).indexed()),
        );
        let manager = TransactionManager::open(
            Pager::memory(1024),
            StoreConfig::new().page_size(1024),
            Some(&schema),
        )
        .unwrap();
        manager
            .run_in_write(|txn| {
                for (name, age) in [("ann", 20), ("bob", 5), ("cid", 15), ("dan", 10)] {
                    txn.put("Person", &Entity::new().set("name", name).set("age", age))?;
                }
                txn.put("Person", &Entity::new().set("name", Value::Null).set("age", 15))?;
                Ok(())
            })
            .unwrap();
        manager
    }

    fn query(manager: &Arc<TransactionManager>, predicate: Option<Predicate>) -> Query<'static> {
        Query::new(Source::Store(Arc::clone(manager)), "Person", predicate).unwrap()
    }

    fn ages(entities: &[Entity]) -> Vec<Value> {
        entities.iter().map(|e| e.get("age").clone()).collect()
    }

    #[test]
    fn test_indexed_range_in_id_order() {
        let manager = manager();
        let q = query(
            &manager,
            Some(Predicate::ge("age", 10).and(Predicate::lt("age", 20))),
        );
        assert!(matches!(q.explain(), Plan::Intersect(_)));
        let found = q.find().unwrap();
        assert_eq!(ages(&found), vec![Value::Int(15), Value::Int(10), Value::Int(15)]);
        assert_eq!(q.count().unwrap(), 3);
    }

    #[test]
    fn test_order_offset_limit() {
        let manager = manager();
        let q = query(&manager, None).order_by_desc("age").order_by("name");
        let names: Vec<Value> = q.property_values("name").unwrap();
        assert_eq!(
            names,
            vec![
                Value::from("ann"),
                Value::Null,
                Value::from("cid"),
                Value::from("dan"),
                Value::from("bob"),
            ]
        );

        let paged = query(&manager, None).order_by("age").offset(1).limit(2);
        assert_eq!(ages(&paged.find().unwrap()), vec![Value::Int(10), Value::Int(15)]);
    }

    #[test]
    fn test_unknown_order_key() {
        let manager = manager();
        let q = query(&manager, None).order_by("height");
        assert!(matches!(q.find(), Err(Error::InvalidPredicate(_))));
    }

    #[test]
    fn test_iter_is_lazy_and_restartable() {
        let manager = manager();
        let q = query(&manager, Some(Predicate::is_not_null("name"))).limit(3);
        let mut iter = q.iter().unwrap();
        let first: Vec<EntityId> = iter.by_ref().map(|e| e.unwrap().id).collect();
        assert_eq!(first.len(), 3);
        assert!(iter.next().is_none());

        iter.restart();
        let again: Vec<EntityId> = iter.map(|e| e.unwrap().id).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_cancellation() {
        let manager = manager();
        let token = CancellationToken::new();
        let q = query(&manager, None).with_cancellation(token.clone());
        let mut iter = q.iter().unwrap();
        assert!(iter.next().unwrap().is_ok());
        token.cancel();
        assert!(matches!(iter.next(), Some(Err(Error::Cancelled))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_find_unique() {
        let manager = manager();
        let one = query(&manager, Some(Predicate::eq("name", "bob")));
        assert_eq!(one.find_unique().unwrap().unwrap().get("age"), &Value::Int(5));

        let two = query(&manager, Some(Predicate::eq("age", 15)));
        assert!(matches!(two.find_unique(), Err(Error::NotUnique(2))));
    }

    #[test]
    fn test_remove_matches() {
        let manager = manager();
        let mut q = query(&manager, Some(Predicate::lt("age", 12)));
        assert_eq!(q.remove().unwrap(), 2);
        assert_eq!(query(&manager, None).count().unwrap(), 3);

        let read = manager.begin_read();
        let mut q = Query::new(Source::Read(&read), "Person", None).unwrap();
        assert!(matches!(q.remove(), Err(Error::ReadOnlyTransaction)));
    }

    #[test]
    fn test_write_source_sees_own_writes() {
        let manager = manager();
        let mut txn = manager.begin_write().unwrap();
        txn.put("Person", &Entity::new().set("name", "eve").set("age", 12))
            .unwrap();
        {
            let q = Query::new(Source::Write(&mut txn), "Person", Some(Predicate::eq("age", 12)))
                .unwrap();
            assert_eq!(q.count().unwrap(), 1);
        }
        txn.abort();
        assert_eq!(query(&manager, Some(Predicate::eq("age", 12))).count().unwrap(), 0);
    }
}
