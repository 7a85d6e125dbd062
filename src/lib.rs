//! Media store with a relational index, perceptual-hash deduplication and
//! reconciliation against a remote replica.

pub mod config;
pub mod core;
pub mod database;
pub mod error;
pub mod services;
pub mod store;

pub use config::{ConfigError, StoreConfig};
pub use database::models::{Item, ItemId};
pub use error::{Error, Result};
pub use store::{Store, StoreLayout, StoreLock};
