mod config;
mod error;
mod types;

pub use config::{Config, DEFAULT_SCHEMA_PLACEHOLDER};
pub use error::{ConfigError, Result};
pub use types::{
    Action, CreateResults, DBMigration, Migration, MigrationType, SourceFilters, Summary, Tenant,
    Version,
};
