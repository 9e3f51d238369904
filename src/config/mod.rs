//! Client configuration: schema and JSON-file store

mod schema;
mod store;

pub use schema::{AuthConfig, TimingConfig, WhepConfig, DEFAULT_ORIGIN};
pub use store::ConfigStore;
