//! Database module: query shapes and SQL repositories.
//!
//! - `model`: page/filter inputs and insert payloads.
//! - `repo`: SQL-only functions that map rows into `crate::model` entities.
//!
//! Callers import from `oppsync::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{NewCandidate, NewOpportunity, OpportunityStatus, Page};
