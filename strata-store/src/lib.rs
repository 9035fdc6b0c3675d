//! Storage engines for the strata migration coordinator.
//!
//! A [`Connector`] executes migration plans atomically against a concrete
//! store and owns the applied-migration history. SQL drivers share one
//! generic engine parameterised over the sqlx database type; SQL Server and
//! MongoDB get dedicated engines. The SQL text itself comes from the
//! per-driver [`Dialect`] registry.

use async_trait::async_trait;

use strata_core::{Action, Config, DBMigration, Migration, Summary, Tenant, Version};

mod dialect;
mod error;
mod mongo;
mod mssql;
mod sql;

pub use dialect::{validate_identifier, Dialect};
pub use error::{Result, StoreError};
pub use mongo::MongoConnector;
pub use mssql::MssqlConnector;
pub use sql::SqlConnector;

pub(crate) const MIGRATOR_SCHEMA: &str = "migrator";
pub(crate) const MIGRATOR_TENANTS_TABLE: &str = "migrator_tenants";
pub(crate) const MIGRATOR_MIGRATIONS_TABLE: &str = "migrator_migrations";
pub(crate) const MIGRATOR_VERSIONS_TABLE: &str = "migrator_versions";

/// Capability interface over a migration store.
///
/// All writes of a single `create_version`/`create_tenant` call are
/// transactionally atomic on SQL stores; the document store records each
/// migration immediately after successful execution instead.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn get_tenants(&self) -> Result<Vec<Tenant>>;

    /// Applied history ordered by `(name, source_dir)`.
    async fn get_applied_migrations(&self) -> Result<Vec<DBMigration>>;

    async fn get_versions(&self) -> Result<Vec<Version>>;

    async fn get_versions_by_file(&self, file: &str) -> Result<Vec<Version>>;

    async fn get_version_by_id(&self, id: i32) -> Result<Version>;

    async fn get_db_migration_by_id(&self, id: i32) -> Result<DBMigration>;

    async fn create_version(
        &self,
        version_name: &str,
        action: Action,
        migrations: &[Migration],
        dry_run: bool,
    ) -> Result<(Summary, Option<Version>)>;

    async fn create_tenant(
        &self,
        tenant: &str,
        version_name: &str,
        action: Action,
        migrations: &[Migration],
        dry_run: bool,
    ) -> Result<(Summary, Option<Version>)>;

    /// A nil return means the store is UP.
    async fn health_check(&self) -> Result<()>;

    async fn dispose(&self);
}

/// Opens the connector matching `config.driver`.
pub async fn connect(config: &Config) -> Result<Box<dyn Connector>> {
    match config.driver.as_str() {
        "postgres" => Ok(Box::new(
            SqlConnector::<sqlx::Postgres>::connect(config).await?,
        )),
        "mysql" => Ok(Box::new(SqlConnector::<sqlx::MySql>::connect(config).await?)),
        "sqlserver" => Ok(Box::new(MssqlConnector::connect(config).await?)),
        "mongodb" => Ok(Box::new(MongoConnector::connect(config).await?)),
        other => Err(StoreError::UnknownDriver(other.to_owned())),
    }
}

/// Target schema for a Single* migration: the last path segment of its
/// source directory.
pub(crate) fn single_schema(source_dir: &str) -> String {
    source_dir
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(source_dir)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::single_schema;

    #[test]
    fn single_schema_is_the_last_path_segment() {
        assert_eq!(single_schema("public"), "public");
        assert_eq!(single_schema("test/migrations/public"), "public");
        assert_eq!(single_schema("s3://bucket/prod/config/"), "config");
    }
}
