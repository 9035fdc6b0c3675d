//! Generic SQL engine over a sqlx database type.
//!
//! One implementation serves the postgres and mysql drivers; the dialect
//! supplies driver-native SQL text. Bootstrap DDL and migration bodies run
//! through the text protocol (`raw_sql`) so multi-statement batches and
//! procedural blocks execute as the server receives them; everything
//! parameterised goes through prepared statements.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolOptions;
use sqlx::{Connection as _, Database, Pool, Row as _, Transaction};
use tokio::sync::OnceCell;

use strata_core::{Action, Config, DBMigration, Migration, Summary, Tenant, Version};

use crate::dialect::Dialect;
use crate::error::{Result, StoreError};
use crate::{single_schema, Connector, MIGRATOR_SCHEMA};

pub struct SqlConnector<DB: Database> {
    pool: Pool<DB>,
    dialect: Dialect,
    config: Config,
    init: OnceCell<()>,
}

impl<DB> SqlConnector<DB>
where
    DB: Database,
    for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i32: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    DateTime<Utc>: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    usize: sqlx::ColumnIndex<DB::Row>,
{
    /// Opens a pool and pings the server; fails fast when unreachable.
    pub async fn connect(config: &Config) -> Result<Self> {
        let dialect = Dialect::from_driver(&config.driver)?;
        let pool = PoolOptions::<DB>::new()
            .connect(&config.data_source)
            .await
            .map_err(|e| StoreError::Init {
                stage: "open connection to database",
                cause: e.to_string(),
            })?;
        let mut conn = pool.acquire().await.map_err(|e| StoreError::Init {
            stage: "connect to database",
            cause: e.to_string(),
        })?;
        conn.ping().await.map_err(|e| StoreError::Init {
            stage: "connect to database",
            cause: e.to_string(),
        })?;

        Ok(Self {
            pool,
            dialect,
            config: config.clone(),
            init: OnceCell::new(),
        })
    }

    /// Lazy schema bootstrap, once per process: migrator schema, migrations
    /// table, default tenants table (unless the tenant query is overridden)
    /// and the versions table with its back-fill, in one transaction.
    async fn ensure_init(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                let mut tx = self.pool.begin().await.map_err(|e| StoreError::Init {
                    stage: "start DB transaction",
                    cause: e.to_string(),
                })?;

                let create_schema = self.dialect.create_schema_sql(MIGRATOR_SCHEMA)?;
                Self::raw_exec(&mut tx, &create_schema, "create migrator schema").await?;
                Self::raw_exec(
                    &mut tx,
                    self.dialect.create_migrations_table_sql(),
                    "create migrations table",
                )
                .await?;
                if self.config.tenant_select_sql.is_none() {
                    Self::raw_exec(
                        &mut tx,
                        self.dialect.create_tenants_table_sql(),
                        "create default tenants table",
                    )
                    .await?;
                }
                for statement in self.dialect.create_versions_table_sql() {
                    Self::raw_exec(&mut tx, statement, "create versions table").await?;
                }

                tx.commit().await.map_err(|e| StoreError::Init {
                    stage: "commit transaction",
                    cause: e.to_string(),
                })
            })
            .await
            .map(|_| ())
    }

    async fn raw_exec(
        tx: &mut Transaction<'_, DB>,
        sql: &str,
        stage: &'static str,
    ) -> Result<()> {
        sqlx::raw_sql(sql)
            .execute(&mut **tx)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Init {
                stage,
                cause: e.to_string(),
            })
    }

    fn tenant_select_sql(&self) -> String {
        self.config
            .tenant_select_sql
            .clone()
            .unwrap_or_else(|| self.dialect.tenant_select_sql().to_owned())
    }

    fn tenant_insert_sql(&self) -> String {
        self.config
            .tenant_insert_sql
            .clone()
            .unwrap_or_else(|| self.dialect.tenant_insert_sql().to_owned())
    }

    fn row_to_db_migration(row: &DB::Row) -> Result<DBMigration> {
        let type_tag: i32 = row.try_get(4)?;
        Ok(DBMigration {
            id: row.try_get(0)?,
            migration: Migration {
                name: row.try_get(1)?,
                source_dir: row.try_get(2)?,
                file: row.try_get(3)?,
                migration_type: type_tag
                    .try_into()
                    .map_err(StoreError::UnknownMigrationType)?,
                contents: row.try_get::<Option<String>, _>(7)?.unwrap_or_default(),
                check_sum: row.try_get::<Option<String>, _>(8)?.unwrap_or_default(),
            },
            schema: row.try_get(5)?,
            created: row.try_get(6)?,
            version_id: row.try_get::<Option<i32>, _>(9)?.unwrap_or_default(),
        })
    }

    /// Collapses join rows (version columns repeated per migration) into
    /// `Version { db_migrations }`, preserving the row order of versions.
    fn read_versions(rows: Vec<DB::Row>) -> Result<Vec<Version>> {
        let mut versions: Vec<Version> = Vec::new();
        let mut by_id: HashMap<i32, usize> = HashMap::new();

        for row in rows {
            let version_id: i32 = row.try_get(0)?;
            let slot = match by_id.get(&version_id) {
                Some(&slot) => slot,
                None => {
                    versions.push(Version {
                        id: version_id,
                        name: row.try_get(1)?,
                        created: row.try_get(2)?,
                        db_migrations: Vec::new(),
                    });
                    by_id.insert(version_id, versions.len() - 1);
                    versions.len() - 1
                }
            };

            // left join: a version with no migrations yields null columns
            let migration_id: Option<i32> = row.try_get(3)?;
            if let Some(migration_id) = migration_id {
                let type_tag: i32 = row.try_get(7)?;
                versions[slot].db_migrations.push(DBMigration {
                    id: migration_id,
                    migration: Migration {
                        name: row.try_get(4)?,
                        source_dir: row.try_get(5)?,
                        file: row.try_get(6)?,
                        migration_type: type_tag
                            .try_into()
                            .map_err(StoreError::UnknownMigrationType)?,
                        contents: row.try_get::<Option<String>, _>(10)?.unwrap_or_default(),
                        check_sum: row.try_get::<Option<String>, _>(11)?.unwrap_or_default(),
                    },
                    schema: row.try_get(8)?,
                    created: row.try_get(9)?,
                    version_id: row.try_get::<Option<i32>, _>(12)?.unwrap_or_default(),
                });
            }
        }

        Ok(versions)
    }

    async fn insert_version(
        &self,
        tx: &mut Transaction<'_, DB>,
        version_name: &str,
    ) -> Result<i32> {
        if self.dialect.last_insert_id_supported() {
            sqlx::query(self.dialect.version_insert_sql())
                .bind(version_name.to_owned())
                .execute(&mut **tx)
                .await?;
            let id: i64 = sqlx::query_scalar(self.dialect.last_insert_id_sql())
                .fetch_one(&mut **tx)
                .await?;
            Ok(id as i32)
        } else {
            let id: i32 = sqlx::query_scalar(self.dialect.version_insert_sql())
                .bind(version_name.to_owned())
                .fetch_one(&mut **tx)
                .await?;
            Ok(id)
        }
    }

    async fn version_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, DB>,
        id: i32,
    ) -> Result<Version> {
        let rows = sqlx::query(self.dialect.version_by_id_sql())
            .bind(id)
            .fetch_all(&mut **tx)
            .await?;
        Self::read_versions(rows)?
            .into_iter()
            .next()
            .ok_or(StoreError::VersionNotFound(id))
    }

    /// The substitute-execute-record sequence shared by both writers.
    async fn apply_migrations_in_tx(
        &self,
        tx: &mut Transaction<'_, DB>,
        version_id: i32,
        action: Action,
        tenants: &[String],
        migrations: &[&Migration],
        summary: &mut Summary,
    ) -> Result<()> {
        let placeholder = self.config.schema_placeholder();

        for m in migrations {
            let schemas: Vec<String> = if m.migration_type.is_tenant() {
                tenants.to_vec()
            } else {
                vec![single_schema(&m.source_dir)]
            };

            for schema in &schemas {
                tracing::debug!(
                    migration_type = ?m.migration_type,
                    schema = %schema,
                    file = %m.file,
                    "applying migration"
                );

                if action == Action::Apply {
                    let contents = m.contents.replace(placeholder, schema);
                    sqlx::raw_sql(&contents)
                        .execute(&mut **tx)
                        .await
                        .map_err(|e| StoreError::MigrationFailed {
                            file: m.file.clone(),
                            cause: e.to_string(),
                        })?;
                }

                sqlx::query(self.dialect.migration_insert_sql())
                    .bind(m.name.clone())
                    .bind(m.source_dir.clone())
                    .bind(m.file.clone())
                    .bind(m.migration_type.as_i32())
                    .bind(schema.clone())
                    .bind(m.contents.clone())
                    .bind(m.check_sum.clone())
                    .bind(version_id)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| StoreError::MigrationInsert(e.to_string()))?;
            }

            summary.count(m.migration_type, schemas.len() as i32);
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl<DB> Connector for SqlConnector<DB>
where
    DB: Database,
    for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i32: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    DateTime<Utc>: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    usize: sqlx::ColumnIndex<DB::Row>,
{
    async fn get_tenants(&self) -> Result<Vec<Tenant>> {
        self.ensure_init().await?;

        let sql = self.tenant_select_sql();
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(Tenant {
                    name: row.try_get(0)?,
                })
            })
            .collect()
    }

    async fn get_applied_migrations(&self) -> Result<Vec<DBMigration>> {
        self.ensure_init().await?;

        let rows = sqlx::query(self.dialect.migration_select_sql())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_db_migration).collect()
    }

    async fn get_versions(&self) -> Result<Vec<Version>> {
        self.ensure_init().await?;

        let rows = sqlx::query(self.dialect.versions_select_sql())
            .fetch_all(&self.pool)
            .await?;
        Self::read_versions(rows)
    }

    async fn get_versions_by_file(&self, file: &str) -> Result<Vec<Version>> {
        self.ensure_init().await?;

        let rows = sqlx::query(self.dialect.versions_by_file_sql())
            .bind(file.to_owned())
            .fetch_all(&self.pool)
            .await?;
        Self::read_versions(rows)
    }

    async fn get_version_by_id(&self, id: i32) -> Result<Version> {
        self.ensure_init().await?;

        let rows = sqlx::query(self.dialect.version_by_id_sql())
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Self::read_versions(rows)?
            .into_iter()
            .next()
            .ok_or(StoreError::VersionNotFound(id))
    }

    async fn get_db_migration_by_id(&self, id: i32) -> Result<DBMigration> {
        self.ensure_init().await?;

        let row = sqlx::query(self.dialect.migration_by_id_sql())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::DBMigrationNotFound(id))?;
        Self::row_to_db_migration(&row)
    }

    async fn create_version(
        &self,
        version_name: &str,
        action: Action,
        migrations: &[Migration],
        dry_run: bool,
    ) -> Result<(Summary, Option<Version>)> {
        let started_at = Utc::now();

        // read-only, before the write transaction
        let tenants = self.get_tenants().await?;

        if dry_run {
            return Ok((
                Summary::classified(started_at, migrations, tenants.len() as i32),
                None,
            ));
        }

        if migrations.is_empty() {
            return Ok((
                Summary {
                    started_at,
                    ..Summary::default()
                },
                None,
            ));
        }

        let tenant_names: Vec<String> = tenants.into_iter().map(|t| t.name).collect();
        let refs: Vec<&Migration> = migrations.iter().collect();

        let mut tx = self.pool.begin().await?;
        let version_id = self.insert_version(&mut tx, version_name).await?;

        let mut summary = Summary::started(started_at, tenant_names.len() as i32);
        self.apply_migrations_in_tx(&mut tx, version_id, action, &tenant_names, &refs, &mut summary)
            .await?;

        let version = self.version_by_id_in_tx(&mut tx, version_id).await?;
        tracing::info!(action = %action, version_id, "committing transaction");
        tx.commit().await?;

        summary.version_id = version_id;
        summary.finish();

        Ok((summary, Some(version)))
    }

    async fn create_tenant(
        &self,
        tenant: &str,
        version_name: &str,
        action: Action,
        migrations: &[Migration],
        dry_run: bool,
    ) -> Result<(Summary, Option<Version>)> {
        self.ensure_init().await?;

        let started_at = Utc::now();
        let tenant_migrations: Vec<&Migration> = migrations
            .iter()
            .filter(|m| m.migration_type.is_tenant())
            .collect();

        if dry_run {
            let classified: Vec<Migration> =
                tenant_migrations.iter().map(|m| (*m).clone()).collect();
            return Ok((Summary::classified(started_at, &classified, 1), None));
        }

        // identifier validation happens here, before any write
        let create_schema = self.dialect.create_schema_sql(tenant)?;
        let insert_tenant = self.tenant_insert_sql();

        let mut tx = self.pool.begin().await?;

        sqlx::raw_sql(&create_schema)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::CreateSchema(e.to_string()))?;

        sqlx::query(&insert_tenant)
            .bind(tenant.to_owned())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::TenantInsert(e.to_string()))?;

        let version_id = self.insert_version(&mut tx, version_name).await?;

        let mut summary = Summary::started(started_at, 1);
        let schemas = [tenant.to_owned()];
        self.apply_migrations_in_tx(
            &mut tx,
            version_id,
            action,
            &schemas,
            &tenant_migrations,
            &mut summary,
        )
        .await?;

        let version = self.version_by_id_in_tx(&mut tx, version_id).await?;
        tracing::info!(action = %action, version_id, tenant, "committing transaction");
        tx.commit().await?;

        summary.version_id = version_id;
        summary.finish();

        Ok((summary, Some(version)))
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_init().await?;
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    async fn dispose(&self) {
        self.pool.close().await;
    }
}
