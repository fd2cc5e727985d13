//! The on-disk record manager: allocation, interning, caching, locking and
//! the binary record format.

pub mod btree;
pub mod cache;
pub mod fst;
pub mod header;
pub mod kit;
pub mod locks;
pub mod reader;
pub mod record;
