use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use strata::{
    compute_migrations_to_apply, flatten_applied_migrations, Action, Config, Coordinator,
    GaugeRegistry, HealthState, Migration, MigrationType, Notifier, NotifierError, SourceFilters,
    Summary, Tenant, Version,
};
use strata_core::DBMigration;
use strata_loader::{Loader, LoaderError, Result as LoaderResult};
use strata_store::{Connector, Result as StoreResult};

fn migration(file: &str, migration_type: MigrationType) -> Migration {
    migration_with_checksum(file, migration_type, "11aa")
}

fn migration_with_checksum(file: &str, migration_type: MigrationType, checksum: &str) -> Migration {
    let (source_dir, name) = match file.rfind('/') {
        Some(at) => (file[..at].to_owned(), file[at + 1..].to_owned()),
        None => (String::new(), file.to_owned()),
    };
    Migration {
        name,
        source_dir,
        file: file.to_owned(),
        migration_type,
        contents: "create table {schema}.t (id int)".to_owned(),
        check_sum: checksum.to_owned(),
    }
}

fn applied(migration: &Migration, schema: &str) -> DBMigration {
    DBMigration {
        id: 0,
        migration: migration.clone(),
        schema: schema.to_owned(),
        created: Utc::now(),
        version_id: 1,
    }
}

struct MockLoader {
    migrations: Vec<Migration>,
}

#[async_trait]
impl Loader for MockLoader {
    async fn get_source_migrations(&self) -> LoaderResult<Vec<Migration>> {
        Ok(self.migrations.clone())
    }

    async fn health_check(&self) -> LoaderResult<()> {
        Err(LoaderError::List {
            location: "mock".to_owned(),
            cause: "unreachable".to_owned(),
        })
    }
}

#[derive(Default)]
struct MockConnector {
    tenants: Vec<Tenant>,
    applied: Vec<DBMigration>,
    version_plans: Arc<Mutex<Vec<Vec<Migration>>>>,
    tenant_plans: Arc<Mutex<Vec<(String, Vec<Migration>)>>>,
}

impl MockConnector {
    fn with_tenants(names: &[&str]) -> Self {
        Self {
            tenants: names
                .iter()
                .map(|n| Tenant {
                    name: (*n).to_owned(),
                })
                .collect(),
            ..Self::default()
        }
    }

    fn apply(
        &self,
        version_name: &str,
        migrations: &[Migration],
        schemas_for_tenant: &[String],
    ) -> (Summary, Option<Version>) {
        let started_at = Utc::now();
        let mut summary = Summary::started(started_at, schemas_for_tenant.len() as i32);
        let mut version = Version {
            id: 1,
            name: version_name.to_owned(),
            created: started_at,
            db_migrations: Vec::new(),
        };

        let mut next_id = 1;
        for m in migrations {
            let schemas: Vec<String> = if m.migration_type.is_tenant() {
                schemas_for_tenant.to_vec()
            } else {
                vec![m
                    .source_dir
                    .rsplit('/')
                    .next()
                    .unwrap_or(&m.source_dir)
                    .to_owned()]
            };
            for schema in &schemas {
                version.db_migrations.push(DBMigration {
                    id: next_id,
                    migration: m.clone(),
                    schema: schema.clone(),
                    created: started_at,
                    version_id: 1,
                });
                next_id += 1;
            }
            summary.count(m.migration_type, schemas.len() as i32);
        }

        summary.version_id = 1;
        summary.finish();
        (summary, Some(version))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn get_tenants(&self) -> StoreResult<Vec<Tenant>> {
        Ok(self.tenants.clone())
    }

    async fn get_applied_migrations(&self) -> StoreResult<Vec<DBMigration>> {
        Ok(self.applied.clone())
    }

    async fn get_versions(&self) -> StoreResult<Vec<Version>> {
        Ok(Vec::new())
    }

    async fn get_versions_by_file(&self, _file: &str) -> StoreResult<Vec<Version>> {
        Ok(Vec::new())
    }

    async fn get_version_by_id(&self, id: i32) -> StoreResult<Version> {
        Err(strata_store::StoreError::VersionNotFound(id))
    }

    async fn get_db_migration_by_id(&self, id: i32) -> StoreResult<DBMigration> {
        Err(strata_store::StoreError::DBMigrationNotFound(id))
    }

    async fn create_version(
        &self,
        version_name: &str,
        _action: Action,
        migrations: &[Migration],
        dry_run: bool,
    ) -> StoreResult<(Summary, Option<Version>)> {
        self.version_plans
            .lock()
            .unwrap()
            .push(migrations.to_vec());

        let started_at = Utc::now();
        let tenant_names: Vec<String> = self.tenants.iter().map(|t| t.name.clone()).collect();

        if dry_run {
            return Ok((
                Summary::classified(started_at, migrations, tenant_names.len() as i32),
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

        Ok(self.apply(version_name, migrations, &tenant_names))
    }

    async fn create_tenant(
        &self,
        tenant: &str,
        version_name: &str,
        _action: Action,
        migrations: &[Migration],
        dry_run: bool,
    ) -> StoreResult<(Summary, Option<Version>)> {
        let tenant_migrations: Vec<Migration> = migrations
            .iter()
            .filter(|m| m.migration_type.is_tenant())
            .cloned()
            .collect();
        self.tenant_plans
            .lock()
            .unwrap()
            .push((tenant.to_owned(), tenant_migrations.clone()));

        if dry_run {
            return Ok((Summary::classified(Utc::now(), &tenant_migrations, 1), None));
        }

        Ok(self.apply(version_name, &tenant_migrations, &[tenant.to_owned()]))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn dispose(&self) {}
}

struct RecordingNotifier {
    notified: Mutex<Vec<Summary>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, summary: &Summary) -> Result<String, NotifierError> {
        self.notified.lock().unwrap().push(summary.clone());
        Ok("ok".to_owned())
    }
}

fn config() -> Config {
    Config::from_yaml(
        r#"
baseLocation: migrations
driver: postgres
dataSource: postgres://localhost/app
singleMigrations:
  - public
tenantMigrations:
  - tenants
"#,
    )
    .unwrap()
}

fn coordinator(connector: MockConnector, source: Vec<Migration>) -> (Coordinator, Arc<GaugeRegistry>) {
    let metrics = Arc::new(GaugeRegistry::default());
    let coordinator = Coordinator::new(
        Box::new(connector),
        Box::new(MockLoader { migrations: source }),
        Box::new(RecordingNotifier {
            notified: Mutex::new(Vec::new()),
        }),
        metrics.clone(),
        config(),
    );
    (coordinator, metrics)
}

#[tokio::test]
async fn empty_plan_creates_no_version() {
    let connector = MockConnector::default();
    let version_plans = connector.version_plans.clone();
    let (coordinator, _) = coordinator(connector, Vec::new());

    let results = coordinator
        .create_version("v2025.1", Action::Apply, false)
        .await
        .unwrap();

    assert!(results.version.is_none());
    assert_eq!(results.summary.tenants, 0);
    assert_eq!(results.summary.migrations_grand_total, 0);
    assert_eq!(results.summary.scripts_grand_total, 0);
    assert_eq!(results.summary.version_id, 0);

    // the engine saw the empty plan, nothing else
    assert_eq!(version_plans.lock().unwrap().as_slice(), &[Vec::new()]);
}

#[tokio::test]
async fn mixed_first_time_apply_fans_out_over_tenants() {
    let source = vec![
        migration("public/a.sql", MigrationType::SingleMigration),
        migration("tenants/b.sql", MigrationType::TenantMigration),
        migration("public/s1.sql", MigrationType::SingleScript),
        migration("tenants/s2.sql", MigrationType::TenantScript),
    ];
    let connector = MockConnector::with_tenants(&["t1", "t2", "t3"]);
    let (coordinator, _) = coordinator(connector, source);

    let results = coordinator
        .create_version("commit-sha", Action::Apply, false)
        .await
        .unwrap();

    let summary = &results.summary;
    assert_eq!(summary.single_migrations, 1);
    assert_eq!(summary.tenant_migrations, 1);
    assert_eq!(summary.single_scripts, 1);
    assert_eq!(summary.tenant_scripts, 1);
    assert_eq!(summary.tenants, 3);
    assert_eq!(summary.tenant_migrations_total, 3);
    assert_eq!(summary.tenant_scripts_total, 3);
    assert_eq!(summary.migrations_grand_total, 4);
    assert_eq!(summary.scripts_grand_total, 4);

    let version = results.version.expect("version created");
    assert_eq!(version.db_migrations.len(), 8);
}

#[tokio::test]
async fn parallel_development_order_is_preserved() {
    let source = vec![
        migration("t/2018-11-11", MigrationType::TenantMigration),
        migration("p/2018-11-11", MigrationType::SingleMigration),
        migration("p/2018-11-12", MigrationType::SingleMigration),
        migration("t/2018-11-19", MigrationType::TenantMigration),
        migration("p/2018-11-19-0", MigrationType::SingleMigration),
        migration("p/2018-11-19-1", MigrationType::SingleMigration),
        migration("t/2018-11-20", MigrationType::TenantMigration),
        migration("p/2018-11-20", MigrationType::SingleMigration),
    ];
    let history = vec![
        applied(&source[0], "abc"),
        applied(&source[0], "def"),
        applied(&source[1], "p"),
        applied(&source[2], "p"),
        applied(&source[6], "abc"),
        applied(&source[6], "def"),
        applied(&source[7], "p"),
    ];

    let to_apply = compute_migrations_to_apply(&source, &history);

    let files: Vec<&str> = to_apply.iter().map(|m| m.file.as_str()).collect();
    assert_eq!(
        files,
        vec!["t/2018-11-19", "p/2018-11-19-0", "p/2018-11-19-1"]
    );
}

#[tokio::test]
async fn scripts_always_reapply() {
    let script = migration("tenants-scripts/recreate.sql", MigrationType::TenantScript);
    let history = vec![applied(&script, "abc"), applied(&script, "def")];

    let to_apply = compute_migrations_to_apply(std::slice::from_ref(&script), &history);
    assert_eq!(to_apply, vec![script.clone()]);

    let connector = MockConnector {
        applied: history,
        ..MockConnector::with_tenants(&["abc", "def"])
    };
    let (coordinator, _) = coordinator(connector, vec![script]);
    let results = coordinator
        .create_version("rerun", Action::Apply, false)
        .await
        .unwrap();

    assert_eq!(results.summary.tenant_scripts, 1);
    assert_eq!(results.summary.tenant_scripts_total, 2);
}

#[tokio::test]
async fn checksum_drift_is_reported_per_migration() {
    let source = vec![migration_with_checksum(
        "src/001",
        MigrationType::SingleMigration,
        "xxx",
    )];
    let drifted = migration_with_checksum("src/001", MigrationType::SingleMigration, "abc");
    let connector = MockConnector {
        applied: vec![applied(&drifted, "src")],
        ..MockConnector::default()
    };
    let (coordinator, _) = coordinator(connector, source.clone());

    let (ok, offending) = coordinator
        .verify_source_migrations_check_sums()
        .await
        .unwrap();

    assert!(!ok);
    assert_eq!(offending, source);
}

#[tokio::test]
async fn script_checksums_are_exempt_from_verification() {
    let source = vec![migration_with_checksum(
        "scripts/views.sql",
        MigrationType::SingleScript,
        "new",
    )];
    let old = migration_with_checksum("scripts/views.sql", MigrationType::SingleScript, "old");
    let connector = MockConnector {
        applied: vec![applied(&old, "scripts")],
        ..MockConnector::default()
    };
    let (coordinator, _) = coordinator(connector, source);

    let (ok, offending) = coordinator
        .verify_source_migrations_check_sums()
        .await
        .unwrap();

    assert!(ok);
    assert!(offending.is_empty());
}

#[tokio::test]
async fn create_tenant_applies_only_tenant_migrations() {
    let source = vec![
        migration("tenants/001", MigrationType::TenantMigration),
        migration("public/001", MigrationType::SingleMigration),
    ];
    let connector = MockConnector::with_tenants(&["a", "b", "c"]);
    let tenant_plans = connector.tenant_plans.clone();
    let (coordinator, _) = coordinator(connector, source);

    let results = coordinator
        .create_tenant("v-tenant", Action::Apply, false, "newco")
        .await
        .unwrap();

    let plans = tenant_plans.lock().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].0, "newco");
    assert_eq!(plans[0].1.len(), 1);
    assert_eq!(plans[0].1[0].file, "tenants/001");
    drop(plans);

    let summary = &results.summary;
    assert_eq!(summary.tenants, 1);
    assert_eq!(summary.tenant_migrations, 1);
    assert_eq!(summary.tenant_migrations_total, 1);
    assert_eq!(summary.single_migrations, 0);

    let version = results.version.expect("version created");
    assert_eq!(version.db_migrations.len(), 1);
    assert_eq!(version.db_migrations[0].schema, "newco");
    assert_eq!(version.db_migrations[0].migration.file, "tenants/001");
}

#[tokio::test]
async fn flattening_collapses_tenant_fan_out() {
    let tenant_migration = migration("tenants/001", MigrationType::TenantMigration);
    let single_migration = migration("public/001", MigrationType::SingleMigration);
    let history = vec![
        applied(&tenant_migration, "abc"),
        applied(&tenant_migration, "def"),
        applied(&tenant_migration, "ghi"),
        applied(&single_migration, "public"),
    ];

    let flattened = flatten_applied_migrations(&history);
    assert_eq!(flattened, vec![tenant_migration, single_migration]);
}

#[tokio::test]
async fn source_filters_are_wildcards_when_unset() {
    let source = vec![
        migration("public/a.sql", MigrationType::SingleMigration),
        migration("tenants/b.sql", MigrationType::TenantMigration),
    ];
    let (coordinator, _) = coordinator(MockConnector::default(), source);

    let all = coordinator.get_source_migrations(None).await.unwrap();
    assert_eq!(all.len(), 2);

    let filters = SourceFilters {
        migration_type: Some(MigrationType::TenantMigration),
        ..SourceFilters::default()
    };
    let filtered = coordinator
        .get_source_migrations(Some(&filters))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].file, "tenants/b.sql");

    let err = coordinator
        .get_source_migration_by_file("nope/missing.sql")
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("Source migration not found: nope/missing.sql"));
}

#[tokio::test]
async fn metrics_record_versions_and_applied_migrations() {
    let source = vec![
        migration("public/a.sql", MigrationType::SingleMigration),
        migration("tenants/b.sql", MigrationType::TenantMigration),
    ];
    let connector = MockConnector::with_tenants(&["t1", "t2"]);
    let (coordinator, metrics) = coordinator(connector, source);

    coordinator
        .create_version("v1", Action::Apply, false)
        .await
        .unwrap();

    let rendered = metrics.render();
    assert!(rendered.contains("strata_versions_created 1"));
    assert!(rendered.contains("strata_migrations_applied{type=\"single_migrations\"} 1"));
    assert!(rendered.contains("strata_migrations_applied{type=\"tenant_migrations_total\"} 2"));
}

#[tokio::test]
async fn health_aggregates_downstream_checks() {
    let (coordinator, _) = coordinator(MockConnector::default(), Vec::new());

    let health = coordinator.health_check().await;
    // the mock loader reports DOWN, the db reports UP
    assert_eq!(health.status, HealthState::DOWN);
    assert_eq!(health.checks.len(), 2);
    assert_eq!(health.checks[0].name, "db");
    assert_eq!(health.checks[0].status, HealthState::UP);
    assert_eq!(health.checks[1].name, "loader");
    assert_eq!(health.checks[1].status, HealthState::DOWN);
}

#[tokio::test]
async fn dry_run_returns_classification_without_a_version() {
    let source = vec![
        migration("public/a.sql", MigrationType::SingleMigration),
        migration("tenants/b.sql", MigrationType::TenantMigration),
    ];
    let connector = MockConnector::with_tenants(&["t1", "t2"]);
    let (coordinator, _) = coordinator(connector, source);

    let results = coordinator
        .create_version("dry", Action::Apply, true)
        .await
        .unwrap();

    assert!(results.version.is_none());
    assert_eq!(results.summary.single_migrations, 1);
    assert_eq!(results.summary.tenant_migrations_total, 2);
}
