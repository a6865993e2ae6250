//! Durable change log and snapshot store (spec §4.4).

pub mod connection;
pub mod error;
pub mod migrations;
pub mod store;

pub use error::{Result, StoreError};
pub use store::Store;
