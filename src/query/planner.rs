//! Query Planner for boxdb
//!
//! This module turns a bound predicate into a candidate plan. Leaves on an
//! indexed property (or on the id property) become index or id-range
//! lookups; a conjunction intersects the lookups of its indexed children;
//! a disjunction is only indexed when every branch is. Anything else falls
//! back to a full scan of the type's directory. The plan only narrows the
//! candidates: the executor evaluates the whole predicate on every record.

use std::fmt;
use std::ops::Bound;

use crate::catalog::{EntityType, IndexId};
use crate::storage::record::EntityId;
use crate::storage::value::Value;

use super::predicate::{CompareOp, Predicate};

/// Candidate plan
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// No entity can match
    Empty,
    /// Walk the whole directory
    FullScan,
    /// Entities with ids in a range
    IdRange {
        lower: Bound<EntityId>,
        upper: Bound<EntityId>,
    },
    /// Index lookup of one value
    IndexEq {
        index: IndexId,
        property: String,
        value: Value,
    },
    /// Index lookup of several values
    IndexIn {
        index: IndexId,
        property: String,
        values: Vec<Value>,
    },
    /// Index range lookup
    IndexRange {
        index: IndexId,
        property: String,
        lower: Bound<Value>,
        upper: Bound<Value>,
    },
    /// Candidates present in every input
    Intersect(Vec<Plan>),
    /// Candidates present in any input
    Union(Vec<Plan>),
}

impl Plan {
    pub fn is_full_scan(&self) -> bool {
        matches!(self, Plan::FullScan)
    }
}

/// Choose a plan for a bound predicate over `ty`
pub fn plan(ty: &EntityType, predicate: Option<&Predicate>) -> Plan {
    predicate
        .and_then(|p| plan_node(ty, p))
        .unwrap_or(Plan::FullScan)
}

enum Access {
    Id,
    Index(IndexId),
}

fn access(ty: &EntityType, property: &str) -> Option<Access> {
    let prop = ty.property(property)?;
    if prop.is_id {
        Some(Access::Id)
    } else {
        prop.index.map(Access::Index)
    }
}

fn range(
    ty: &EntityType,
    property: &str,
    lower: Bound<&Value>,
    upper: Bound<&Value>,
) -> Option<Plan> {
    Some(match access(ty, property)? {
        Access::Id => id_range(lower, upper),
        Access::Index(index) => Plan::IndexRange {
            index,
            property: property.to_string(),
            lower: lower.cloned(),
            upper: upper.cloned(),
        },
    })
}

/// Id range for bounds over `Long` values; ids start at 1
fn id_range(lower: Bound<&Value>, upper: Bound<&Value>) -> Plan {
    let as_id = |v: &Value| v.as_i64().filter(|n| *n >= 1).map(|n| EntityId::new(n as u64));
    let lower = match lower {
        Bound::Included(v) => as_id(v).map_or(Bound::Unbounded, Bound::Included),
        Bound::Excluded(v) => as_id(v).map_or(Bound::Unbounded, Bound::Excluded),
        Bound::Unbounded => Bound::Unbounded,
    };
    let upper = match upper {
        Bound::Included(v) => match as_id(v) {
            Some(id) => Bound::Included(id),
            None => return Plan::Empty,
        },
        Bound::Excluded(v) => match as_id(v) {
            Some(id) if id.get() > 1 => Bound::Excluded(id),
            _ => return Plan::Empty,
        },
        Bound::Unbounded => Bound::Unbounded,
    };
    Plan::IdRange { lower, upper }
}

fn plan_node(ty: &EntityType, predicate: &Predicate) -> Option<Plan> {
    match predicate {
        Predicate::Compare {
            property,
            op,
            value,
        } => match op {
            CompareOp::Eq => match access(ty, property)? {
                Access::Id => Some(id_range(Bound::Included(value), Bound::Included(value))),
                Access::Index(index) => Some(Plan::IndexEq {
                    index,
                    property: property.clone(),
                    value: value.clone(),
                }),
            },
            CompareOp::Lt => range(ty, property, Bound::Unbounded, Bound::Excluded(value)),
            CompareOp::Le => range(ty, property, Bound::Unbounded, Bound::Included(value)),
            CompareOp::Gt => range(ty, property, Bound::Excluded(value), Bound::Unbounded),
            CompareOp::Ge => range(ty, property, Bound::Included(value), Bound::Unbounded),
            CompareOp::NotEq => None,
        },
        Predicate::Between {
            property,
            lower,
            upper,
        } => range(ty, property, Bound::Included(lower), Bound::Included(upper)),
        Predicate::In { property, values } => match access(ty, property)? {
            Access::Id => Some(Plan::Union(
                values
                    .iter()
                    .map(|v| id_range(Bound::Included(v), Bound::Included(v)))
                    .collect(),
            )),
            Access::Index(index) => Some(Plan::IndexIn {
                index,
                property: property.clone(),
                values: values.clone(),
            }),
        },
        // Null values are never indexed, so the whole index holds the non-null ones.
        Predicate::IsNotNull(property) => match access(ty, property)? {
            Access::Index(_) => range(ty, property, Bound::Unbounded, Bound::Unbounded),
            Access::Id => None,
        },
        Predicate::And(items) => {
            let mut indexed: Vec<Plan> = items.iter().filter_map(|p| plan_node(ty, p)).collect();
            match indexed.len() {
                0 => None,
                1 => indexed.pop(),
                _ => Some(Plan::Intersect(indexed)),
            }
        }
        Predicate::Or(items) => {
            let branches: Option<Vec<Plan>> = items.iter().map(|p| plan_node(ty, p)).collect();
            let mut branches = branches?;
            match branches.len() {
                0 => Some(Plan::Empty),
                1 => branches.pop(),
                _ => Some(Plan::Union(branches)),
            }
        }
        Predicate::Not(_)
        | Predicate::Text { .. }
        | Predicate::IsNull(_) => None,
    }
}

fn fmt_bound(f: &mut fmt::Formatter<'_>, bound: &Bound<impl fmt::Display>, lower: bool) -> fmt::Result {
    match (bound, lower) {
        (Bound::Included(v), true) => write!(f, "[{}", v),
        (Bound::Excluded(v), true) => write!(f, "({}", v),
        (Bound::Unbounded, true) => write!(f, "(-inf"),
        (Bound::Included(v), false) => write!(f, "{}]", v),
        (Bound::Excluded(v), false) => write!(f, "{})", v),
        (Bound::Unbounded, false) => write!(f, "+inf)"),
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Empty => write!(f, "Empty"),
            Plan::FullScan => write!(f, "FullScan"),
            Plan::IdRange { lower, upper } => {
                write!(f, "IdRange ")?;
                fmt_bound(f, lower, true)?;
                write!(f, ", ")?;
                fmt_bound(f, upper, false)
            }
            Plan::IndexEq {
                index,
                property,
                value,
            } => write!(f, "IndexEq {}({}) = {}", index, property, value),
            Plan::IndexIn {
                index,
                property,
                values,
            } => write!(f, "IndexIn {}({}) x{}", index, property, values.len()),
            Plan::IndexRange {
                index,
                property,
                lower,
                upper,
            } => {
                write!(f, "IndexRange {}({}) ", index, property)?;
                fmt_bound(f, lower, true)?;
                write!(f, ", ")?;
                fmt_bound(f, upper, false)
            }
            Plan::Intersect(items) | Plan::Union(items) => {
                let name = if matches!(self, Plan::Intersect(_)) {
                    "Intersect"
                } else {
                    "Union"
                };
                write!(f, "{}(", name)?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}
