//! SQL Server engine.
//!
//! sqlx carries no TDS driver, so this engine talks to the server through
//! tiberius over a tokio TCP stream. Semantics are identical to the generic
//! SQL engine: one transaction per writer call, rollback on any failure.
//! Parameter markers are `@P1..@Pn`; the version insert returns its id via
//! `OUTPUT inserted.id`. The `dataSource` for this driver is an ADO-style
//! connection string.

use chrono::{DateTime, NaiveDateTime, Utc};
use tiberius::{Client, Config as TdsConfig, Row};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use strata_core::{Action, Config, DBMigration, Migration, Summary, Tenant, Version};

use crate::dialect::Dialect;
use crate::error::{Result, StoreError};
use crate::{single_schema, Connector, MIGRATOR_SCHEMA};

type TdsClient = Client<Compat<TcpStream>>;

pub struct MssqlConnector {
    client: Mutex<TdsClient>,
    dialect: Dialect,
    config: Config,
    init: OnceCell<()>,
}

impl MssqlConnector {
    pub async fn connect(config: &Config) -> Result<Self> {
        let tds_config =
            TdsConfig::from_ado_string(&config.data_source).map_err(|e| StoreError::Init {
                stage: "open connection to database",
                cause: e.to_string(),
            })?;

        let tcp = TcpStream::connect(tds_config.get_addr())
            .await
            .map_err(|e| StoreError::Init {
                stage: "connect to database",
                cause: e.to_string(),
            })?;
        tcp.set_nodelay(true).map_err(|e| StoreError::Init {
            stage: "connect to database",
            cause: e.to_string(),
        })?;

        let client =
            Client::connect(tds_config, tcp.compat_write())
                .await
                .map_err(|e| StoreError::Init {
                    stage: "connect to database",
                    cause: e.to_string(),
                })?;

        Ok(Self {
            client: Mutex::new(client),
            dialect: Dialect::SqlServer,
            config: config.clone(),
            init: OnceCell::new(),
        })
    }

    async fn batch(client: &mut TdsClient, sql: &str) -> Result<()> {
        client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn ensure_init(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                let mut client = self.client.lock().await;

                Self::batch(&mut client, "begin transaction")
                    .await
                    .map_err(|e| StoreError::Init {
                        stage: "start DB transaction",
                        cause: e.to_string(),
                    })?;

                let bootstrap = self.bootstrap(&mut client).await;
                match bootstrap {
                    Ok(()) => Self::batch(&mut client, "commit transaction")
                        .await
                        .map_err(|e| StoreError::Init {
                            stage: "commit transaction",
                            cause: e.to_string(),
                        }),
                    Err(e) => {
                        let _ = Self::batch(&mut client, "rollback transaction").await;
                        Err(e)
                    }
                }
            })
            .await
            .map(|_| ())
    }

    async fn bootstrap(&self, client: &mut TdsClient) -> Result<()> {
        let create_schema = self.dialect.create_schema_sql(MIGRATOR_SCHEMA)?;
        Self::batch(client, &create_schema)
            .await
            .map_err(|e| StoreError::Init {
                stage: "create migrator schema",
                cause: e.to_string(),
            })?;
        Self::batch(client, self.dialect.create_migrations_table_sql())
            .await
            .map_err(|e| StoreError::Init {
                stage: "create migrations table",
                cause: e.to_string(),
            })?;
        if self.config.tenant_select_sql.is_none() {
            Self::batch(client, self.dialect.create_tenants_table_sql())
                .await
                .map_err(|e| StoreError::Init {
                    stage: "create default tenants table",
                    cause: e.to_string(),
                })?;
        }
        for statement in self.dialect.create_versions_table_sql() {
            Self::batch(client, statement)
                .await
                .map_err(|e| StoreError::Init {
                    stage: "create versions table",
                    cause: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn get_i32(row: &Row, idx: usize) -> Result<i32> {
        row.get::<i32, _>(idx)
            .ok_or_else(|| anyhow::anyhow!("null int column {idx}").into())
    }

    fn get_string(row: &Row, idx: usize) -> Result<String> {
        row.get::<&str, _>(idx)
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("null string column {idx}").into())
    }

    fn get_created(row: &Row, idx: usize) -> Result<DateTime<Utc>> {
        let naive: NaiveDateTime = row
            .get(idx)
            .ok_or_else(|| anyhow::anyhow!("null datetime column {idx}"))?;
        Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
    }

    fn row_to_db_migration(row: &Row) -> Result<DBMigration> {
        let type_tag = Self::get_i32(row, 4)?;
        Ok(DBMigration {
            id: Self::get_i32(row, 0)?,
            migration: Migration {
                name: Self::get_string(row, 1)?,
                source_dir: Self::get_string(row, 2)?,
                file: Self::get_string(row, 3)?,
                migration_type: type_tag
                    .try_into()
                    .map_err(StoreError::UnknownMigrationType)?,
                contents: Self::get_string(row, 7).unwrap_or_default(),
                check_sum: Self::get_string(row, 8).unwrap_or_default(),
            },
            schema: Self::get_string(row, 5)?,
            created: Self::get_created(row, 6)?,
            version_id: Self::get_i32(row, 9).unwrap_or_default(),
        })
    }

    fn read_versions(rows: Vec<Row>) -> Result<Vec<Version>> {
        let mut versions: Vec<Version> = Vec::new();

        for row in rows {
            let version_id = Self::get_i32(&row, 0)?;
            if versions.last().map(|v| v.id) != Some(version_id) {
                versions.push(Version {
                    id: version_id,
                    name: Self::get_string(&row, 1)?,
                    created: Self::get_created(&row, 2)?,
                    db_migrations: Vec::new(),
                });
            }

            if let Some(migration_id) = row.get::<i32, _>(3) {
                let type_tag = Self::get_i32(&row, 7)?;
                let version = versions.last_mut().unwrap();
                version.db_migrations.push(DBMigration {
                    id: migration_id,
                    migration: Migration {
                        name: Self::get_string(&row, 4)?,
                        source_dir: Self::get_string(&row, 5)?,
                        file: Self::get_string(&row, 6)?,
                        migration_type: type_tag
                            .try_into()
                            .map_err(StoreError::UnknownMigrationType)?,
                        contents: Self::get_string(&row, 10).unwrap_or_default(),
                        check_sum: Self::get_string(&row, 11).unwrap_or_default(),
                    },
                    schema: Self::get_string(&row, 8)?,
                    created: Self::get_created(&row, 9)?,
                    version_id: Self::get_i32(&row, 12).unwrap_or_default(),
                });
            }
        }

        Ok(versions)
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

    async fn tenants_with(&self, client: &mut TdsClient) -> Result<Vec<Tenant>> {
        let sql = self.tenant_select_sql();
        let rows = client
            .query(sql.as_str(), &[])
            .await?
            .into_first_result()
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Tenant {
                    name: Self::get_string(row, 0)?,
                })
            })
            .collect()
    }

    async fn insert_version(client: &mut TdsClient, sql: &str, name: &str) -> Result<i32> {
        let rows = client.query(sql, &[&name]).await?.into_first_result().await?;
        let row = rows
            .first()
            .ok_or_else(|| anyhow::anyhow!("version insert returned no id"))?;
        Self::get_i32(row, 0)
    }

    async fn version_by_id_with(&self, client: &mut TdsClient, id: i32) -> Result<Version> {
        let rows = client
            .query(self.dialect.version_by_id_sql(), &[&id])
            .await?
            .into_first_result()
            .await?;
        Self::read_versions(rows)?
            .into_iter()
            .next()
            .ok_or(StoreError::VersionNotFound(id))
    }

    async fn apply_migrations_in_tx(
        &self,
        client: &mut TdsClient,
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
                    Self::batch(client, &contents).await.map_err(|e| {
                        StoreError::MigrationFailed {
                            file: m.file.clone(),
                            cause: e.to_string(),
                        }
                    })?;
                }

                let type_tag = m.migration_type.as_i32();
                client
                    .execute(
                        self.dialect.migration_insert_sql(),
                        &[
                            &m.name.as_str(),
                            &m.source_dir.as_str(),
                            &m.file.as_str(),
                            &type_tag,
                            &schema.as_str(),
                            &m.contents.as_str(),
                            &m.check_sum.as_str(),
                            &version_id,
                        ],
                    )
                    .await
                    .map_err(|e| StoreError::MigrationInsert(e.to_string()))?;
            }

            summary.count(m.migration_type, schemas.len() as i32);
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Connector for MssqlConnector {
    async fn get_tenants(&self) -> Result<Vec<Tenant>> {
        self.ensure_init().await?;
        let mut client = self.client.lock().await;
        self.tenants_with(&mut client).await
    }

    async fn get_applied_migrations(&self) -> Result<Vec<DBMigration>> {
        self.ensure_init().await?;
        let mut client = self.client.lock().await;
        let rows = client
            .query(self.dialect.migration_select_sql(), &[])
            .await?
            .into_first_result()
            .await?;
        rows.iter().map(Self::row_to_db_migration).collect()
    }

    async fn get_versions(&self) -> Result<Vec<Version>> {
        self.ensure_init().await?;
        let mut client = self.client.lock().await;
        let rows = client
            .query(self.dialect.versions_select_sql(), &[])
            .await?
            .into_first_result()
            .await?;
        Self::read_versions(rows)
    }

    async fn get_versions_by_file(&self, file: &str) -> Result<Vec<Version>> {
        self.ensure_init().await?;
        let mut client = self.client.lock().await;
        let rows = client
            .query(self.dialect.versions_by_file_sql(), &[&file])
            .await?
            .into_first_result()
            .await?;
        Self::read_versions(rows)
    }

    async fn get_version_by_id(&self, id: i32) -> Result<Version> {
        self.ensure_init().await?;
        let mut client = self.client.lock().await;
        self.version_by_id_with(&mut client, id).await
    }

    async fn get_db_migration_by_id(&self, id: i32) -> Result<DBMigration> {
        self.ensure_init().await?;
        let mut client = self.client.lock().await;
        let rows = client
            .query(self.dialect.migration_by_id_sql(), &[&id])
            .await?
            .into_first_result()
            .await?;
        let row = rows.first().ok_or(StoreError::DBMigrationNotFound(id))?;
        Self::row_to_db_migration(row)
    }

    async fn create_version(
        &self,
        version_name: &str,
        action: Action,
        migrations: &[Migration],
        dry_run: bool,
    ) -> Result<(Summary, Option<Version>)> {
        self.ensure_init().await?;

        let started_at = Utc::now();
        let mut client = self.client.lock().await;

        let tenants = self.tenants_with(&mut client).await?;

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

        Self::batch(&mut client, "begin transaction").await?;

        let mut summary = Summary::started(started_at, tenant_names.len() as i32);
        let outcome = async {
            let version_id =
                Self::insert_version(&mut client, self.dialect.version_insert_sql(), version_name)
                    .await?;
            self.apply_migrations_in_tx(
                &mut client,
                version_id,
                action,
                &tenant_names,
                &refs,
                &mut summary,
            )
            .await?;
            let version = self.version_by_id_with(&mut client, version_id).await?;
            Ok::<_, StoreError>((version_id, version))
        }
        .await;

        match outcome {
            Ok((version_id, version)) => {
                tracing::info!(action = %action, version_id, "committing transaction");
                Self::batch(&mut client, "commit transaction").await?;
                summary.version_id = version_id;
                summary.finish();
                Ok((summary, Some(version)))
            }
            Err(e) => {
                let _ = Self::batch(&mut client, "rollback transaction").await;
                Err(e)
            }
        }
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

        let mut client = self.client.lock().await;
        Self::batch(&mut client, "begin transaction").await?;

        let mut summary = Summary::started(started_at, 1);
        let schemas = [tenant.to_owned()];
        let outcome = async {
            Self::batch(&mut client, &create_schema)
                .await
                .map_err(|e| StoreError::CreateSchema(e.to_string()))?;

            client
                .execute(insert_tenant.as_str(), &[&tenant])
                .await
                .map_err(|e| StoreError::TenantInsert(e.to_string()))?;

            let version_id =
                Self::insert_version(&mut client, self.dialect.version_insert_sql(), version_name)
                    .await?;
            self.apply_migrations_in_tx(
                &mut client,
                version_id,
                action,
                &schemas,
                &tenant_migrations,
                &mut summary,
            )
            .await?;
            let version = self.version_by_id_with(&mut client, version_id).await?;
            Ok::<_, StoreError>((version_id, version))
        }
        .await;

        match outcome {
            Ok((version_id, version)) => {
                tracing::info!(action = %action, version_id, tenant, "committing transaction");
                Self::batch(&mut client, "commit transaction").await?;
                summary.version_id = version_id;
                summary.finish();
                Ok((summary, Some(version)))
            }
            Err(e) => {
                let _ = Self::batch(&mut client, "rollback transaction").await;
                Err(e)
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_init().await?;
        let mut client = self.client.lock().await;
        Self::batch(&mut client, "select 1").await
    }

    async fn dispose(&self) {
        // tiberius closes the connection when the client drops
    }
}
