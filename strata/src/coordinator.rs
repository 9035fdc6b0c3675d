//! The migration coordinator.
//!
//! Computes the exact set of migrations to apply given the loader's source
//! inventory and the store's prior history, enforces checksum invariants,
//! and dispatches plans to the storage engine with telemetry and
//! notifications around each apply.

use std::sync::Arc;

use serde::Serialize;

use strata_core::{
    Action, Config, CreateResults, DBMigration, Migration, SourceFilters, Summary, Tenant, Version,
};
use strata_loader::Loader;
use strata_store::Connector;

use crate::error::{CoordinatorError, Result};
use crate::metrics::Metrics;
use crate::notifier::Notifier;

/// Collapses tenant fan-out duplicates of the applied history into one
/// entry per unique migration.
///
/// Applied rows repeat the same migration once per tenant schema, back to
/// back; value equality over all fields collapses them. Script entries are
/// kept for checksum verification even though they always re-apply.
pub fn flatten_applied_migrations(applied: &[DBMigration]) -> Vec<Migration> {
    let mut flattened: Vec<Migration> = Vec::new();
    for db_migration in applied {
        if flattened.last() != Some(&db_migration.migration) {
            flattened.push(db_migration.migration.clone());
        }
    }
    flattened
}

/// The diff: every source migration whose `file` has not been applied, in
/// source order, plus every script migration unconditionally.
pub fn compute_migrations_to_apply(
    source: &[Migration],
    applied: &[DBMigration],
) -> Vec<Migration> {
    let flattened = flatten_applied_migrations(applied);
    tracing::info!(count = flattened.len(), "flattened applied migrations");
    difference(source, &flattened)
}

fn difference(source: &[Migration], flattened_applied: &[Migration]) -> Vec<Migration> {
    let applied_files: std::collections::HashSet<&str> = flattened_applied
        .iter()
        .filter(|m| !m.migration_type.is_script())
        .map(|m| m.file.as_str())
        .collect();

    source
        .iter()
        .filter(|m| !applied_files.contains(m.file.as_str()))
        .cloned()
        .collect()
}

fn intersect<'a>(
    source: &'a [Migration],
    flattened_applied: &'a [Migration],
) -> Vec<(&'a Migration, &'a Migration)> {
    let applied_by_file: std::collections::HashMap<&str, &Migration> = flattened_applied
        .iter()
        .map(|m| (m.file.as_str(), m))
        .collect();

    source
        .iter()
        .filter_map(|m| applied_by_file.get(m.file.as_str()).map(|a| (m, *a)))
        .collect()
}

/// Retains only tenant migrations and tenant scripts, preserving order.
pub fn filter_tenant_migrations(source: &[Migration]) -> Vec<Migration> {
    source
        .iter()
        .filter(|m| m.migration_type.is_tenant())
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
    UP,
    DOWN,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: Vec<HealthCheck>,
}

pub struct Coordinator {
    connector: Box<dyn Connector>,
    loader: Box<dyn Loader>,
    notifier: Box<dyn Notifier>,
    metrics: Arc<dyn Metrics>,
    config: Config,
}

impl Coordinator {
    pub fn new(
        connector: Box<dyn Connector>,
        loader: Box<dyn Loader>,
        notifier: Box<dyn Notifier>,
        metrics: Arc<dyn Metrics>,
        config: Config,
    ) -> Self {
        Self {
            connector,
            loader,
            notifier,
            metrics,
            config,
        }
    }

    /// Builds the coordinator with the store, loader and notifier resolved
    /// from the configuration.
    pub async fn from_config(config: &Config, metrics: Arc<dyn Metrics>) -> Result<Self> {
        let connector = strata_store::connect(config).await?;
        let loader = strata_loader::new_loader(config);
        let notifier = crate::notifier::new_notifier(config);
        Ok(Self::new(
            connector,
            loader,
            notifier,
            metrics,
            config.clone(),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn get_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.connector.get_tenants().await?)
    }

    pub async fn get_versions(&self) -> Result<Vec<Version>> {
        Ok(self.connector.get_versions().await?)
    }

    pub async fn get_versions_by_file(&self, file: &str) -> Result<Vec<Version>> {
        Ok(self.connector.get_versions_by_file(file).await?)
    }

    pub async fn get_version_by_id(&self, id: i32) -> Result<Version> {
        Ok(self.connector.get_version_by_id(id).await?)
    }

    pub async fn get_db_migration_by_id(&self, id: i32) -> Result<DBMigration> {
        Ok(self.connector.get_db_migration_by_id(id).await?)
    }

    pub async fn get_applied_migrations(&self) -> Result<Vec<DBMigration>> {
        Ok(self.connector.get_applied_migrations().await?)
    }

    /// One loader call per request, filtered by any subset of the four
    /// migration fields.
    pub async fn get_source_migrations(
        &self,
        filters: Option<&SourceFilters>,
    ) -> Result<Vec<Migration>> {
        let source = self.loader.get_source_migrations().await?;
        Ok(match filters {
            Some(filters) => source.into_iter().filter(|m| filters.matches(m)).collect(),
            None => source,
        })
    }

    pub async fn get_source_migration_by_file(&self, file: &str) -> Result<Migration> {
        let filters = SourceFilters {
            file: Some(file.to_owned()),
            ..SourceFilters::default()
        };
        self.get_source_migrations(Some(&filters))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoordinatorError::SourceMigrationNotFound(file.to_owned()))
    }

    /// Compares source and applied checksums for every non-script pair
    /// sharing a `file`. Scripts are exempt — they are expected to change.
    ///
    /// Verification is advisory: a subsequent `Apply` still proceeds, the
    /// caller decides what to do with the offending list.
    pub async fn verify_source_migrations_check_sums(&self) -> Result<(bool, Vec<Migration>)> {
        let source = self.get_source_migrations(None).await?;
        let applied = self.connector.get_applied_migrations().await?;
        let flattened = flatten_applied_migrations(&applied);

        let mut offending = Vec::new();
        for (source_migration, applied_migration) in intersect(&source, &flattened) {
            if source_migration.migration_type.is_script() {
                continue;
            }
            if source_migration.check_sum != applied_migration.check_sum {
                offending.push(source_migration.clone());
            }
        }

        Ok((offending.is_empty(), offending))
    }

    pub async fn create_version(
        &self,
        version_name: &str,
        action: Action,
        dry_run: bool,
    ) -> Result<CreateResults> {
        let source = self.loader.get_source_migrations().await?;
        let applied = self.connector.get_applied_migrations().await?;

        let to_apply = compute_migrations_to_apply(&source, &applied);
        tracing::info!(count = to_apply.len(), "found migrations to apply");

        let (summary, version) = self
            .connector
            .create_version(version_name, action, &to_apply, dry_run)
            .await?;

        let _ = self.metrics.increment_gauge("versions_created", &[]);
        self.record_apply_metrics(&summary);
        self.send_notification(&summary).await;

        Ok(CreateResults { summary, version })
    }

    pub async fn create_tenant(
        &self,
        version_name: &str,
        action: Action,
        dry_run: bool,
        tenant: &str,
    ) -> Result<CreateResults> {
        let source = self.loader.get_source_migrations().await?;

        let to_apply = filter_tenant_migrations(&source);
        tracing::info!(
            count = to_apply.len(),
            tenant,
            "migrations to apply for new tenant"
        );

        let (summary, version) = self
            .connector
            .create_tenant(tenant, version_name, action, &to_apply, dry_run)
            .await?;

        let _ = self.metrics.increment_gauge("tenants_created", &[]);
        let _ = self.metrics.increment_gauge("versions_created", &[]);
        self.record_apply_metrics(&summary);
        self.send_notification(&summary).await;

        Ok(CreateResults { summary, version })
    }

    /// Aggregated downstream health. A DOWN database flips the overall
    /// status DOWN; further checks can be added without breaking callers.
    pub async fn health_check(&self) -> HealthStatus {
        let mut checks = Vec::new();
        let mut status = HealthState::UP;

        match self.connector.health_check().await {
            Ok(()) => checks.push(HealthCheck {
                name: "db".to_owned(),
                status: HealthState::UP,
                data: None,
            }),
            Err(e) => {
                status = HealthState::DOWN;
                checks.push(HealthCheck {
                    name: "db".to_owned(),
                    status: HealthState::DOWN,
                    data: Some(e.to_string()),
                });
            }
        }

        match self.loader.health_check().await {
            Ok(()) => checks.push(HealthCheck {
                name: "loader".to_owned(),
                status: HealthState::UP,
                data: None,
            }),
            Err(e) => {
                status = HealthState::DOWN;
                checks.push(HealthCheck {
                    name: "loader".to_owned(),
                    status: HealthState::DOWN,
                    data: Some(e.to_string()),
                });
            }
        }

        HealthStatus { status, checks }
    }

    pub async fn dispose(&self) {
        self.connector.dispose().await;
    }

    fn record_apply_metrics(&self, summary: &Summary) {
        for (label, value) in [
            ("single_migrations", summary.single_migrations),
            ("tenant_migrations_total", summary.tenant_migrations_total),
            ("single_scripts", summary.single_scripts),
            ("tenant_scripts_total", summary.tenant_scripts_total),
        ] {
            let _ = self
                .metrics
                .add_gauge("migrations_applied", &[("type", label)], value as f64);
        }
    }

    /// Notifier failures must never roll back a successful migration:
    /// errors are logged and swallowed.
    async fn send_notification(&self, summary: &Summary) {
        match self.notifier.notify(summary).await {
            Ok(response) => tracing::info!(%response, "notifier response"),
            Err(e) => tracing::error!(error = %e, "notifier error"),
        }
    }
}
