//! Hierarchical, schemaless document database stored in a single paged
//! binary file.
//!
//! Every path in the value tree is stored either inline in its parent's
//! record or as its own (possibly fragmented) record; records with many
//! children carry an embedded B+tree instead of a linear child list. All
//! reads and writes funnel through [`TreeDB`].

pub mod db;
pub mod error;
pub mod model;
pub mod path;
pub mod pager;
pub mod storage;

pub use crate::db::{Config, EngineStats, NodeChange, QueryCriterion, QueryOp, SubscriptionId, TreeDB, ValueFilter};
pub use crate::error::{Result, TreeError};
pub use crate::model::{NodeAddress, NodeInfo, PathReference, RecordAddress, Value, ValueType};
pub use crate::path::PathKey;
