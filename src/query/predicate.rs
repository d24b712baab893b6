//! Query predicates
//!
//! A [`Predicate`] is a tree of per-property conditions. Before it runs it is
//! bound to an entity type: property names are checked and comparison values
//! are converted to the property's type, so evaluation compares like with
//! like. Any comparison against a null property value is false.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::catalog::{EntityType, PropertyMeta, TypeTag};
use crate::error::{Error, Result};
use crate::storage::record::Entity;
use crate::storage::value::Value;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// String matching operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    Contains,
    StartsWith,
    EndsWith,
}

impl TextOp {
    fn keyword(&self) -> &'static str {
        match self {
            TextOp::Contains => "contains",
            TextOp::StartsWith => "startswith",
            TextOp::EndsWith => "endswith",
        }
    }
}

/// A query condition
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        property: String,
        op: CompareOp,
        value: Value,
    },
    /// Inclusive range
    Between {
        property: String,
        lower: Value,
        upper: Value,
    },
    In {
        property: String,
        values: Vec<Value>,
    },
    Text {
        property: String,
        op: TextOp,
        pattern: String,
        case_insensitive: bool,
    },
    IsNull(String),
    IsNotNull(String),
}

impl Predicate {
    fn compare(property: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            property: property.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Eq, value)
    }

    pub fn not_eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::NotEq, value)
    }

    pub fn lt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Lt, value)
    }

    pub fn le(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Le, value)
    }

    pub fn gt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Gt, value)
    }

    pub fn ge(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Ge, value)
    }

    /// `lower <= property <= upper`
    pub fn between(
        property: impl Into<String>,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> Self {
        Predicate::Between {
            property: property.into(),
            lower: lower.into(),
            upper: upper.into(),
        }
    }

    pub fn in_values<V: Into<Value>>(property: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In {
            property: property.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn text(property: impl Into<String>, op: TextOp, pattern: impl Into<String>) -> Self {
        Predicate::Text {
            property: property.into(),
            op,
            pattern: pattern.into(),
            case_insensitive: false,
        }
    }

    pub fn contains(property: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::text(property, TextOp::Contains, pattern)
    }

    pub fn starts_with(property: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::text(property, TextOp::StartsWith, pattern)
    }

    pub fn ends_with(property: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::text(property, TextOp::EndsWith, pattern)
    }

    pub fn is_null(property: impl Into<String>) -> Self {
        Predicate::IsNull(property.into())
    }

    pub fn is_not_null(property: impl Into<String>) -> Self {
        Predicate::IsNotNull(property.into())
    }

    /// Make a string condition ignore case; other conditions are unchanged
    pub fn case_insensitive(self) -> Self {
        match self {
            Predicate::Text {
                property,
                op,
                pattern,
                ..
            } => Predicate::Text {
                property,
                op,
                pattern,
                case_insensitive: true,
            },
            other => other,
        }
    }

    /// Both conditions
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut items) => {
                items.push(other);
                Predicate::And(items)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Either condition
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut items) => {
                items.push(other);
                Predicate::Or(items)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Check properties and convert values to the declared property types
    pub fn bind(&self, ty: &EntityType) -> Result<Predicate> {
        Ok(match self {
            Predicate::And(items) => Predicate::And(
                items.iter().map(|p| p.bind(ty)).collect::<Result<_>>()?,
            ),
            Predicate::Or(items) => Predicate::Or(
                items.iter().map(|p| p.bind(ty)).collect::<Result<_>>()?,
            ),
            Predicate::Not(inner) => Predicate::Not(Box::new(inner.bind(ty)?)),
            Predicate::Compare {
                property,
                op,
                value,
            } => {
                let prop = lookup(ty, property)?;
                Predicate::Compare {
                    property: property.clone(),
                    op: *op,
                    value: coerce(prop, value)?,
                }
            }
            Predicate::Between {
                property,
                lower,
                upper,
            } => {
                let prop = lookup(ty, property)?;
                Predicate::Between {
                    property: property.clone(),
                    lower: coerce(prop, lower)?,
                    upper: coerce(prop, upper)?,
                }
            }
            Predicate::In { property, values } => {
                let prop = lookup(ty, property)?;
                Predicate::In {
                    property: property.clone(),
                    values: values
                        .iter()
                        .map(|v| coerce(prop, v))
                        .collect::<Result<_>>()?,
                }
            }
            Predicate::Text {
                property,
                op,
                pattern,
                case_insensitive,
            } => {
                let prop = lookup(ty, property)?;
                if prop.type_tag != TypeTag::String {
                    return Err(Error::InvalidPredicate(format!(
                        "'{}' needs a STRING property, '{}' is {}",
                        op.keyword(),
                        property,
                        prop.type_tag
                    )));
                }
                Predicate::Text {
                    property: property.clone(),
                    op: *op,
                    pattern: pattern.clone(),
                    case_insensitive: *case_insensitive,
                }
            }
            Predicate::IsNull(property) => {
                lookup(ty, property)?;
                Predicate::IsNull(property.clone())
            }
            Predicate::IsNotNull(property) => {
                lookup(ty, property)?;
                Predicate::IsNotNull(property.clone())
            }
        })
    }

    /// Evaluate a bound predicate against an entity of `ty`
    pub fn matches(&self, ty: &EntityType, entity: &Entity) -> bool {
        match self {
            Predicate::And(items) => items.iter().all(|p| p.matches(ty, entity)),
            Predicate::Or(items) => items.iter().any(|p| p.matches(ty, entity)),
            Predicate::Not(inner) => !inner.matches(ty, entity),
            Predicate::Compare {
                property,
                op,
                value,
            } => {
                let Some(ord) = property_value(ty, entity, property).compare(value) else {
                    return false;
                };
                match op {
                    CompareOp::Eq => ord.is_eq(),
                    CompareOp::NotEq => ord.is_ne(),
                    CompareOp::Lt => ord.is_lt(),
                    CompareOp::Le => ord.is_le(),
                    CompareOp::Gt => ord.is_gt(),
                    CompareOp::Ge => ord.is_ge(),
                }
            }
            Predicate::Between {
                property,
                lower,
                upper,
            } => {
                let actual = property_value(ty, entity, property);
                matches!(actual.compare(lower), Some(ord) if ord.is_ge())
                    && matches!(actual.compare(upper), Some(ord) if ord.is_le())
            }
            Predicate::In { property, values } => {
                let actual = property_value(ty, entity, property);
                values
                    .iter()
                    .any(|v| matches!(actual.compare(v), Some(ord) if ord.is_eq()))
            }
            Predicate::Text {
                property,
                op,
                pattern,
                case_insensitive,
            } => {
                let actual = property_value(ty, entity, property);
                let Some(text) = actual.as_str() else {
                    return false;
                };
                if *case_insensitive {
                    text_matches(*op, &text.to_lowercase(), &pattern.to_lowercase())
                } else {
                    text_matches(*op, text, pattern)
                }
            }
            Predicate::IsNull(property) => property_value(ty, entity, property).is_null(),
            Predicate::IsNotNull(property) => !property_value(ty, entity, property).is_null(),
        }
    }
}

fn text_matches(op: TextOp, text: &str, pattern: &str) -> bool {
    match op {
        TextOp::Contains => text.contains(pattern),
        TextOp::StartsWith => text.starts_with(pattern),
        TextOp::EndsWith => text.ends_with(pattern),
    }
}

fn lookup<'a>(ty: &'a EntityType, property: &str) -> Result<&'a PropertyMeta> {
    ty.property(property).ok_or_else(|| {
        Error::InvalidPredicate(format!(
            "unknown property '{}' on entity type '{}'",
            property, ty.name
        ))
    })
}

fn coerce(prop: &PropertyMeta, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Err(Error::InvalidPredicate(format!(
            "cannot compare '{}' with null, use 'is null'",
            prop.name
        )));
    }
    value.coerce_to(prop.type_tag).ok_or_else(|| {
        Error::InvalidPredicate(format!(
            "{} is not a valid {} value for '{}'",
            value, prop.type_tag, prop.name
        ))
    })
}

/// Value of a property, reading the id property from the entity id
pub(crate) fn property_value(ty: &EntityType, entity: &Entity, property: &str) -> Value {
    match ty.property(property) {
        Some(prop) if prop.is_id => Value::Long(entity.id.get() as i64),
        _ => entity.get(property).clone(),
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Predicate], sep: &str) -> fmt::Result {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", sep)?;
                }
                write!(f, "{}", item)?;
            }
            write!(f, ")")
        }

        match self {
            Predicate::And(items) => join(f, items, "and"),
            Predicate::Or(items) => join(f, items, "or"),
            Predicate::Not(inner) => write!(f, "not {}", inner),
            Predicate::Compare {
                property,
                op,
                value,
            } => write!(f, "{} {} {}", property, op.symbol(), value),
            Predicate::Between {
                property,
                lower,
                upper,
            } => write!(f, "{} between {} and {}", property, lower, upper),
            Predicate::In { property, values } => {
                write!(f, "{} in (", property)?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            Predicate::Text {
                property,
                op,
                pattern,
                case_insensitive,
            } => {
                let nocase = if *case_insensitive { " nocase" } else { "" };
                write!(f, "{} {}{} {:?}", property, op.keyword(), nocase, pattern)
            }
            Predicate::IsNull(property) => write!(f, "{} is null", property),
            Predicate::IsNotNull(property) => write!(f, "{} is not null", property),
        }
    }
}

/// Sort key of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub property: String,
    pub descending: bool,
}

impl OrderKey {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            descending: false,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            descending: true,
        }
    }
}

/// Cooperative cancellation flag shared between a query and its caller
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every query holding this token to stop
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, EntityDef, PropertyDef, Schema};

    fn person() -> EntityType {
        let catalog = Catalog::create(
            &Schema::new().entity(
                EntityDef::new("Person")
                    .id("id")
                    .property(PropertyDef::new("name", TypeTag::String))
                    .property(PropertyDef::new("age", TypeTag::Int)),
            ),
        )
        .unwrap();
        catalog.get_type("Person").unwrap().clone()
    }

    #[test]
    fn test_bind_coerces_values() {
        let ty = person();
        let bound = Predicate::ge("age", 10i64).bind(&ty).unwrap();
        assert_eq!(bound, Predicate::ge("age", 10i32));

        assert!(matches!(
            Predicate::eq("height", 1).bind(&ty),
            Err(Error::InvalidPredicate(_))
        ));
        assert!(matches!(
            Predicate::eq("age", "ten").bind(&ty),
            Err(Error::InvalidPredicate(_))
        ));
        assert!(matches!(
            Predicate::eq("age", 5_000_000_000i64).bind(&ty),
            Err(Error::InvalidPredicate(_))
        ));
        assert!(matches!(
            Predicate::contains("age", "1").bind(&ty),
            Err(Error::InvalidPredicate(_))
        ));
    }

    #[test]
    fn test_null_comparisons_are_false() {
        let ty = person();
        let nameless = Entity::with_id(1).set("age", 30);
        assert!(!Predicate::eq("name", "x").matches(&ty, &nameless));
        assert!(!Predicate::not_eq("name", "x").matches(&ty, &nameless));
        assert!(Predicate::is_null("name").matches(&ty, &nameless));
        assert!(Predicate::eq("name", "x").not().matches(&ty, &nameless));
    }

    #[test]
    fn test_matching() {
        let ty = person();
        let ann = Entity::with_id(7).set("name", "Annabel").set("age", 31);

        let adult = Predicate::between("age", 18, 65).bind(&ty).unwrap();
        assert!(adult.matches(&ty, &ann));
        assert!(Predicate::starts_with("name", "ann")
            .case_insensitive()
            .matches(&ty, &ann));
        assert!(!Predicate::starts_with("name", "ann").matches(&ty, &ann));
        assert!(Predicate::ends_with("name", "bel").matches(&ty, &ann));
        assert!(Predicate::in_values("age", [30, 31]).matches(&ty, &ann));
        assert!(Predicate::eq("id", 7i64).matches(&ty, &ann));
        assert!(Predicate::gt("age", 40)
            .or(Predicate::contains("name", "nab"))
            .matches(&ty, &ann));
    }

    #[test]
    fn test_display() {
        let p = Predicate::ge("age", 10)
            .and(Predicate::starts_with("name", "a").case_insensitive().or(Predicate::is_null("name")));
        assert_eq!(
            p.to_string(),
            "(age >= 10 and (name startswith nocase \"a\" or name is null))"
        );
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let copy = token.clone();
        copy.cancel();
        assert!(token.is_cancelled());
    }
}
