mod config;
mod core;
mod subscriptions;


pub use config::Config;
pub use core::{EngineStats, QueryCriterion, QueryOp, TreeDB, ValueFilter};
pub use subscriptions::{NodeChange, SubscriptionId};
