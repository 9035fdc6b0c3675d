//! Document-store engine.
//!
//! Stores the same entities as the SQL engines in collections under the
//! `migrator` database, with a `counters` collection providing monotonic
//! `version_id`/`migration_id` sequences via atomic find-and-update
//! upserts. Multi-document transactions are not assumed: each migration
//! record is written immediately after its body executes, and a body
//! failure aborts the loop — the partial version stays visible and a re-run
//! is safe because non-script migrations are keyed by `(file, schema)`.

use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Client, Database, IndexModel};
use tokio::sync::OnceCell;

use strata_core::{Action, Config, DBMigration, Migration, Summary, Tenant, Version};

use crate::dialect::validate_identifier;
use crate::error::{Result, StoreError};
use crate::{
    single_schema, Connector, MIGRATOR_MIGRATIONS_TABLE, MIGRATOR_SCHEMA, MIGRATOR_TENANTS_TABLE,
    MIGRATOR_VERSIONS_TABLE,
};

const COUNTERS_COLLECTION: &str = "counters";

pub struct MongoConnector {
    client: Client,
    db: Database,
    config: Config,
    init: OnceCell<()>,
}

fn bson_i32(doc: &Document, key: &str) -> Result<i32> {
    match doc.get(key) {
        Some(Bson::Int32(v)) => Ok(*v),
        Some(Bson::Int64(v)) => Ok(*v as i32),
        Some(Bson::Double(v)) => Ok(*v as i32),
        other => Err(anyhow::anyhow!("field `{key}` is not numeric: {other:?}").into()),
    }
}

fn bson_str(doc: &Document, key: &str) -> Result<String> {
    doc.get_str(key)
        .map(str::to_owned)
        .map_err(|e| anyhow::anyhow!("field `{key}`: {e}").into())
}

fn bson_created(doc: &Document, key: &str) -> Result<DateTime<Utc>> {
    doc.get_datetime(key)
        .map(|dt| dt.to_chrono())
        .map_err(|e| anyhow::anyhow!("field `{key}`: {e}").into())
}

fn doc_to_db_migration(doc: &Document) -> Result<DBMigration> {
    let type_tag = bson_i32(doc, "type")?;
    Ok(DBMigration {
        id: bson_i32(doc, "_id")?,
        migration: Migration {
            name: bson_str(doc, "name")?,
            source_dir: bson_str(doc, "source_dir")?,
            file: bson_str(doc, "filename")?,
            migration_type: type_tag
                .try_into()
                .map_err(StoreError::UnknownMigrationType)?,
            contents: bson_str(doc, "contents").unwrap_or_default(),
            check_sum: bson_str(doc, "checksum").unwrap_or_default(),
        },
        schema: bson_str(doc, "db_schema")?,
        created: bson_created(doc, "created")?,
        version_id: bson_i32(doc, "version_id")?,
    })
}

impl MongoConnector {
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Client::with_uri_str(&config.data_source)
            .await
            .map_err(|e| StoreError::Init {
                stage: "open connection to database",
                cause: e.to_string(),
            })?;
        let db = client.database(MIGRATOR_SCHEMA);

        db.run_command(doc! {"ping": 1})
            .await
            .map_err(|e| StoreError::Init {
                stage: "connect to database",
                cause: e.to_string(),
            })?;

        Ok(Self {
            client,
            db,
            config: config.clone(),
            init: OnceCell::new(),
        })
    }

    async fn ensure_init(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                let tenants = self.db.collection::<Document>(MIGRATOR_TENANTS_TABLE);
                tenants
                    .create_index(
                        IndexModel::builder()
                            .keys(doc! {"name": 1})
                            .options(IndexOptions::builder().unique(true).build())
                            .build(),
                    )
                    .await
                    .map_err(|e| StoreError::Init {
                        stage: "create tenants index",
                        cause: e.to_string(),
                    })?;

                let versions = self.db.collection::<Document>(MIGRATOR_VERSIONS_TABLE);
                versions
                    .create_index(IndexModel::builder().keys(doc! {"created": -1}).build())
                    .await
                    .map_err(|e| StoreError::Init {
                        stage: "create versions index",
                        cause: e.to_string(),
                    })?;

                let migrations = self.db.collection::<Document>(MIGRATOR_MIGRATIONS_TABLE);
                migrations
                    .create_index(IndexModel::builder().keys(doc! {"version_id": 1}).build())
                    .await
                    .map_err(|e| StoreError::Init {
                        stage: "create migrations index",
                        cause: e.to_string(),
                    })?;

                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Custom tenant source: `collection` or `collection.field`.
    fn tenant_collection(&self) -> (String, String) {
        match &self.config.tenant_select_sql {
            Some(selector) => {
                let mut parts = selector.splitn(2, '.');
                let collection = parts.next().unwrap_or(MIGRATOR_TENANTS_TABLE);
                let field = parts.next().unwrap_or("name");
                (collection.to_owned(), field.to_owned())
            }
            None => (MIGRATOR_TENANTS_TABLE.to_owned(), "name".to_owned()),
        }
    }

    async fn next_seq(&self, name: &str) -> Result<i32> {
        let counters = self.db.collection::<Document>(COUNTERS_COLLECTION);
        let counter = counters
            .find_one_and_update(doc! {"_id": name}, doc! {"$inc": {"seq": 1}})
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| anyhow::anyhow!("counter `{name}` not returned"))?;
        bson_i32(&counter, "seq")
    }

    async fn execute_body(&self, m: &Migration, db_name: &str) -> Result<()> {
        let contents = m.contents.replace(self.config.schema_placeholder(), db_name);
        self.client
            .database(db_name)
            .run_command(doc! {"eval": contents})
            .await
            .map_err(|e| StoreError::MigrationFailed {
                file: m.file.clone(),
                cause: e.to_string(),
            })?;
        Ok(())
    }

    async fn record_migration(
        &self,
        version_id: i32,
        m: &Migration,
        schema: &str,
    ) -> Result<DBMigration> {
        let id = self.next_seq("migration_id").await?;
        let created = Utc::now();
        let migrations = self.db.collection::<Document>(MIGRATOR_MIGRATIONS_TABLE);
        migrations
            .insert_one(doc! {
                "_id": id,
                "name": m.name.clone(),
                "source_dir": m.source_dir.clone(),
                "filename": m.file.clone(),
                "type": m.migration_type.as_i32(),
                "db_schema": schema,
                "created": mongodb::bson::DateTime::from_chrono(created),
                "contents": m.contents.clone(),
                "checksum": m.check_sum.clone(),
                "version_id": version_id,
            })
            .await
            .map_err(|e| StoreError::MigrationInsert(e.to_string()))?;

        Ok(DBMigration {
            id,
            migration: m.clone(),
            schema: schema.to_owned(),
            created,
            version_id,
        })
    }

    async fn insert_version(&self, version_name: &str) -> Result<Version> {
        let id = self.next_seq("version_id").await?;
        let created = Utc::now();
        let versions = self.db.collection::<Document>(MIGRATOR_VERSIONS_TABLE);
        versions
            .insert_one(doc! {
                "_id": id,
                "name": version_name,
                "created": mongodb::bson::DateTime::from_chrono(created),
            })
            .await?;
        Ok(Version {
            id,
            name: version_name.to_owned(),
            created,
            db_migrations: Vec::new(),
        })
    }

    async fn migrations_for_version(&self, version_id: i32) -> Result<Vec<DBMigration>> {
        let migrations = self.db.collection::<Document>(MIGRATOR_MIGRATIONS_TABLE);
        let mut cursor = migrations
            .find(doc! {"version_id": version_id})
            .sort(doc! {"_id": 1})
            .await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(doc_to_db_migration(&doc)?);
        }
        Ok(out)
    }

    fn version_from_doc(doc: &Document) -> Result<Version> {
        Ok(Version {
            id: bson_i32(doc, "_id")?,
            name: bson_str(doc, "name")?,
            created: bson_created(doc, "created")?,
            db_migrations: Vec::new(),
        })
    }

    /// The per-migration execute-then-record loop; aborts on the first
    /// failed body, leaving the already-written records in place.
    async fn apply_migrations(
        &self,
        version: &mut Version,
        action: Action,
        tenants: &[String],
        migrations: &[&Migration],
        summary: &mut Summary,
    ) -> Result<()> {
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
                    self.execute_body(m, schema).await?;
                }
                let recorded = self.record_migration(version.id, m, schema).await?;
                version.db_migrations.push(recorded);
            }

            summary.count(m.migration_type, schemas.len() as i32);
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Connector for MongoConnector {
    async fn get_tenants(&self) -> Result<Vec<Tenant>> {
        self.ensure_init().await?;

        let (collection, field) = self.tenant_collection();
        let tenants = self.db.collection::<Document>(&collection);
        let mut cursor = tenants.find(doc! {}).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            if let Ok(name) = doc.get_str(&field) {
                out.push(Tenant {
                    name: name.to_owned(),
                });
            }
        }
        Ok(out)
    }

    async fn get_applied_migrations(&self) -> Result<Vec<DBMigration>> {
        self.ensure_init().await?;

        let migrations = self.db.collection::<Document>(MIGRATOR_MIGRATIONS_TABLE);
        let mut cursor = migrations
            .find(doc! {})
            .sort(doc! {"name": 1, "source_dir": 1})
            .await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(doc_to_db_migration(&doc)?);
        }
        Ok(out)
    }

    async fn get_versions(&self) -> Result<Vec<Version>> {
        self.ensure_init().await?;

        let versions = self.db.collection::<Document>(MIGRATOR_VERSIONS_TABLE);
        let mut cursor = versions.find(doc! {}).sort(doc! {"_id": -1}).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let mut version = Self::version_from_doc(&doc)?;
            version.db_migrations = self.migrations_for_version(version.id).await?;
            out.push(version);
        }
        Ok(out)
    }

    async fn get_versions_by_file(&self, file: &str) -> Result<Vec<Version>> {
        self.ensure_init().await?;

        let migrations = self.db.collection::<Document>(MIGRATOR_MIGRATIONS_TABLE);
        let mut cursor = migrations.find(doc! {"filename": file}).await?;
        let mut version_ids = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let version_id = bson_i32(&doc, "version_id")?;
            if !version_ids.contains(&version_id) {
                version_ids.push(version_id);
            }
        }
        version_ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut out = Vec::new();
        for version_id in version_ids {
            out.push(self.get_version_by_id(version_id).await?);
        }
        Ok(out)
    }

    async fn get_version_by_id(&self, id: i32) -> Result<Version> {
        self.ensure_init().await?;

        let versions = self.db.collection::<Document>(MIGRATOR_VERSIONS_TABLE);
        let doc = versions
            .find_one(doc! {"_id": id})
            .await?
            .ok_or(StoreError::VersionNotFound(id))?;
        let mut version = Self::version_from_doc(&doc)?;
        version.db_migrations = self.migrations_for_version(id).await?;
        Ok(version)
    }

    async fn get_db_migration_by_id(&self, id: i32) -> Result<DBMigration> {
        self.ensure_init().await?;

        let migrations = self.db.collection::<Document>(MIGRATOR_MIGRATIONS_TABLE);
        let doc = migrations
            .find_one(doc! {"_id": id})
            .await?
            .ok_or(StoreError::DBMigrationNotFound(id))?;
        doc_to_db_migration(&doc)
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

        let mut version = self.insert_version(version_name).await?;
        let mut summary = Summary::started(started_at, tenant_names.len() as i32);
        self.apply_migrations(&mut version, action, &tenant_names, &refs, &mut summary)
            .await?;

        summary.version_id = version.id;
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

        // the tenant name becomes a database name, same validation rules
        validate_identifier(tenant)?;

        let (collection, field) = self.tenant_collection();
        let tenants = self.db.collection::<Document>(&collection);
        let mut tenant_doc = Document::new();
        tenant_doc.insert(field, tenant);
        tenant_doc.insert(
            "created",
            mongodb::bson::DateTime::from_chrono(Utc::now()),
        );
        tenants
            .insert_one(tenant_doc)
            .await
            .map_err(|e| StoreError::TenantInsert(e.to_string()))?;

        let mut version = self.insert_version(version_name).await?;
        let mut summary = Summary::started(started_at, 1);
        let schemas = [tenant.to_owned()];
        self.apply_migrations(
            &mut version,
            action,
            &schemas,
            &tenant_migrations,
            &mut summary,
        )
        .await?;

        summary.version_id = version.id;
        summary.finish();

        Ok((summary, Some(version)))
    }

    async fn health_check(&self) -> Result<()> {
        self.db.run_command(doc! {"ping": 1}).await?;
        Ok(())
    }

    async fn dispose(&self) {
        self.client.clone().shutdown().await;
    }
}
