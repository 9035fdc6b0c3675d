use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a source migration.
///
/// Migrations are applied once and never again; scripts are reapplied on
/// every run. Tenant variants fan out over all tenant schemas, single
/// variants run in a fixed schema. Persisted as ints `1..=4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(async_graphql::Enum))]
#[cfg_attr(feature = "graphql", graphql(rename_items = "PascalCase"))]
pub enum MigrationType {
    SingleMigration,
    TenantMigration,
    SingleScript,
    TenantScript,
}

impl MigrationType {
    pub fn as_i32(&self) -> i32 {
        match self {
            MigrationType::SingleMigration => 1,
            MigrationType::TenantMigration => 2,
            MigrationType::SingleScript => 3,
            MigrationType::TenantScript => 4,
        }
    }

    pub fn is_tenant(&self) -> bool {
        matches!(
            self,
            MigrationType::TenantMigration | MigrationType::TenantScript
        )
    }

    pub fn is_script(&self) -> bool {
        matches!(
            self,
            MigrationType::SingleScript | MigrationType::TenantScript
        )
    }
}

impl TryFrom<i32> for MigrationType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MigrationType::SingleMigration),
            2 => Ok(MigrationType::TenantMigration),
            3 => Ok(MigrationType::SingleScript),
            4 => Ok(MigrationType::TenantScript),
            other => Err(other),
        }
    }
}

/// Operating mode of an apply call.
///
/// `Apply` executes migration bodies and records them, `Sync` records
/// without executing (marks externally applied migrations as done).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(async_graphql::Enum))]
#[cfg_attr(feature = "graphql", graphql(rename_items = "PascalCase"))]
pub enum Action {
    Apply,
    Sync,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Apply => write!(f, "Apply"),
            Action::Sync => write!(f, "Sync"),
        }
    }
}

/// An immutable source migration produced by the loader.
///
/// `file` is the unique identity of a migration within a plan. `check_sum`
/// is the lowercase hex SHA-256 of `contents`. Two migrations are equal iff
/// all six fields match; the coordinator's flattening step relies on this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(async_graphql::SimpleObject))]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    pub name: String,
    pub source_dir: String,
    pub file: String,
    pub migration_type: MigrationType,
    pub contents: String,
    pub check_sum: String,
}

/// A persisted application record: one row per `(migration, schema)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(async_graphql::SimpleObject))]
#[serde(rename_all = "camelCase")]
pub struct DBMigration {
    pub id: i32,
    #[serde(flatten)]
    #[cfg_attr(feature = "graphql", graphql(flatten))]
    pub migration: Migration,
    pub schema: String,
    pub created: DateTime<Utc>,
    #[cfg_attr(feature = "graphql", graphql(skip))]
    pub version_id: i32,
}

/// A named grouping of DB migrations created atomically by one apply call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(async_graphql::SimpleObject))]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: i32,
    pub name: String,
    pub created: DateTime<Utc>,
    pub db_migrations: Vec<DBMigration>,
}

/// A schema/database receiving tenant migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(async_graphql::SimpleObject))]
pub struct Tenant {
    pub name: String,
}

/// Per-call statistics returned alongside every apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(async_graphql::SimpleObject))]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[serde(default = "now")]
    pub started_at: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub tenants: i32,
    pub single_migrations: i32,
    pub single_scripts: i32,
    pub tenant_migrations: i32,
    pub tenant_scripts: i32,
    pub tenant_migrations_total: i32,
    pub tenant_scripts_total: i32,
    pub migrations_grand_total: i32,
    pub scripts_grand_total: i32,
    pub version_id: i32,
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

impl Summary {
    pub fn started(started_at: DateTime<Utc>, tenants: i32) -> Self {
        Summary {
            started_at,
            tenants,
            ..Summary::default()
        }
    }

    /// Counts one migration of the given type against `schema_count` target
    /// schemas.
    pub fn count(&mut self, migration_type: MigrationType, schema_count: i32) {
        match migration_type {
            MigrationType::SingleMigration => self.single_migrations += 1,
            MigrationType::SingleScript => self.single_scripts += 1,
            MigrationType::TenantMigration => {
                self.tenant_migrations += 1;
                self.tenant_migrations_total += schema_count;
            }
            MigrationType::TenantScript => {
                self.tenant_scripts += 1;
                self.tenant_scripts_total += schema_count;
            }
        }
    }

    /// Fills the grand totals and the wall-clock duration.
    pub fn finish(&mut self) {
        self.migrations_grand_total = self.single_migrations + self.tenant_migrations_total;
        self.scripts_grand_total = self.single_scripts + self.tenant_scripts_total;
        self.duration = (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0;
    }

    /// Summary computed by classification alone, used by dry runs.
    pub fn classified(
        started_at: DateTime<Utc>,
        migrations: &[Migration],
        tenant_count: i32,
    ) -> Self {
        let mut summary = Summary::started(started_at, tenant_count);
        for m in migrations {
            let schema_count = if m.migration_type.is_tenant() {
                tenant_count
            } else {
                1
            };
            summary.count(m.migration_type, schema_count);
        }
        summary.finish();
        summary
    }
}

/// Result of `create_version` / `create_tenant`: the summary plus the
/// version produced, absent when the plan was empty or the call was a dry
/// run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(async_graphql::SimpleObject))]
#[serde(rename_all = "camelCase")]
pub struct CreateResults {
    pub summary: Summary,
    pub version: Option<Version>,
}

/// Filters for source migration queries; `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFilters {
    pub name: Option<String>,
    pub source_dir: Option<String>,
    pub file: Option<String>,
    pub migration_type: Option<MigrationType>,
}

impl SourceFilters {
    /// Explicit per-field match; there are only four fields so no dynamic
    /// dispatch is involved.
    pub fn matches(&self, m: &Migration) -> bool {
        if let Some(name) = &self.name {
            if *name != m.name {
                return false;
            }
        }
        if let Some(source_dir) = &self.source_dir {
            if *source_dir != m.source_dir {
                return false;
            }
        }
        if let Some(file) = &self.file {
            if *file != m.file {
                return false;
            }
        }
        if let Some(migration_type) = &self.migration_type {
            if *migration_type != m.migration_type {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(file: &str) -> Migration {
        Migration {
            name: "201602160001.sql".to_owned(),
            source_dir: "tenants".to_owned(),
            file: file.to_owned(),
            migration_type: MigrationType::TenantMigration,
            contents: "create table {schema}.orders (id int)".to_owned(),
            check_sum: "aa".to_owned(),
        }
    }

    #[test]
    fn migration_equality_covers_all_fields() {
        let a = migration("tenants/201602160001.sql");
        let mut b = a.clone();
        assert_eq!(a, b);

        b.contents = "drop table {schema}.orders".to_owned();
        assert_ne!(a, b);
    }

    #[test]
    fn migration_type_round_trips_through_i32() {
        for t in [
            MigrationType::SingleMigration,
            MigrationType::TenantMigration,
            MigrationType::SingleScript,
            MigrationType::TenantScript,
        ] {
            assert_eq!(MigrationType::try_from(t.as_i32()), Ok(t));
        }
        assert_eq!(MigrationType::try_from(9), Err(9));
    }

    #[test]
    fn classified_summary_computes_totals() {
        let mut migrations = vec![migration("tenants/201602160001.sql")];
        migrations.push(Migration {
            migration_type: MigrationType::SingleMigration,
            file: "public/201602160002.sql".to_owned(),
            source_dir: "public".to_owned(),
            ..migration("public/201602160002.sql")
        });
        migrations.push(Migration {
            migration_type: MigrationType::TenantScript,
            file: "tenants-scripts/recreate.sql".to_owned(),
            ..migration("tenants-scripts/recreate.sql")
        });

        let summary = Summary::classified(Utc::now(), &migrations, 3);
        assert_eq!(summary.tenants, 3);
        assert_eq!(summary.single_migrations, 1);
        assert_eq!(summary.tenant_migrations, 1);
        assert_eq!(summary.tenant_scripts, 1);
        assert_eq!(summary.tenant_migrations_total, 3);
        assert_eq!(summary.tenant_scripts_total, 3);
        assert_eq!(summary.migrations_grand_total, 4);
        assert_eq!(summary.scripts_grand_total, 4);
    }

    #[test]
    fn filters_match_per_field() {
        let m = migration("tenants/201602160001.sql");

        assert!(SourceFilters::default().matches(&m));
        assert!(SourceFilters {
            file: Some("tenants/201602160001.sql".to_owned()),
            ..SourceFilters::default()
        }
        .matches(&m));
        assert!(!SourceFilters {
            migration_type: Some(MigrationType::SingleScript),
            ..SourceFilters::default()
        }
        .matches(&m));
        assert!(!SourceFilters {
            name: Some("201602160001.sql".to_owned()),
            source_dir: Some("public".to_owned()),
            ..SourceFilters::default()
        }
        .matches(&m));
    }

    #[test]
    fn summary_serializes_with_camel_case_keys() {
        let summary = Summary::classified(Utc::now(), &[migration("tenants/a.sql")], 2);
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["tenantMigrationsTotal"], 2);
        assert_eq!(value["migrationsGrandTotal"], 2);
        assert!(value.get("startedAt").is_some());
    }
}
