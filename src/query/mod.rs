//! Query module
//!
//! Predicates, the candidate planner, the executor and the textual
//! predicate parser.

pub mod executor;
pub mod parser;
pub mod planner;
pub mod predicate;

pub(crate) use executor::Source;
pub use executor::{Query, QueryIter};
pub use parser::{parse_query, ParsedQuery};
pub use planner::Plan;
pub use predicate::{CancellationToken, CompareOp, OrderKey, Predicate, TextOp};
