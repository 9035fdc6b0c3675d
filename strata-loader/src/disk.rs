//! Local filesystem loader.
//!
//! Directory reads are non-recursive by design: each configured prefix is
//! one flat directory of migration files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use strata_core::{Config, Migration, MigrationType};

use crate::error::{LoaderError, Result};
use crate::{build_migration, Loader, MigrationGroups};

pub struct DiskLoader {
    config: Config,
}

impl DiskLoader {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn base_dir(&self) -> Result<PathBuf> {
        std::path::absolute(&self.config.base_location).map_err(|e| LoaderError::BaseLocation {
            location: self.config.base_location.clone(),
            cause: e.to_string(),
        })
    }

    async fn read_from_dirs(
        &self,
        groups: &mut MigrationGroups,
        base_dir: &Path,
        prefixes: &[String],
        migration_type: MigrationType,
    ) -> Result<()> {
        for prefix in prefixes {
            let source_dir = base_dir.join(prefix);
            let mut entries =
                tokio::fs::read_dir(&source_dir)
                    .await
                    .map_err(|e| LoaderError::List {
                        location: source_dir.display().to_string(),
                        cause: e.to_string(),
                    })?;

            // read_dir order is platform-defined; the name-keyed buckets
            // give the plan its deterministic order
            loop {
                let entry = entries.next_entry().await.map_err(|e| LoaderError::List {
                    location: source_dir.display().to_string(),
                    cause: e.to_string(),
                })?;
                let Some(entry) = entry else {
                    break;
                };
                let path = entry.path();
                if path.is_dir() {
                    continue;
                }

                let contents =
                    tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|e| LoaderError::Read {
                            location: path.display().to_string(),
                            cause: e.to_string(),
                        })?;

                groups.add(build_migration(
                    path.to_string_lossy().into_owned(),
                    contents,
                    migration_type,
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Loader for DiskLoader {
    async fn get_source_migrations(&self) -> Result<Vec<Migration>> {
        let base_dir = self.base_dir()?;
        let mut migrations = Vec::new();

        let mut groups = MigrationGroups::default();
        self.read_from_dirs(
            &mut groups,
            &base_dir,
            &self.config.single_migrations,
            MigrationType::SingleMigration,
        )
        .await?;
        self.read_from_dirs(
            &mut groups,
            &base_dir,
            &self.config.tenant_migrations,
            MigrationType::TenantMigration,
        )
        .await?;
        groups.drain_into(&mut migrations, false);

        let mut groups = MigrationGroups::default();
        self.read_from_dirs(
            &mut groups,
            &base_dir,
            &self.config.single_scripts,
            MigrationType::SingleScript,
        )
        .await?;
        groups.drain_into(&mut migrations, true);

        let mut groups = MigrationGroups::default();
        self.read_from_dirs(
            &mut groups,
            &base_dir,
            &self.config.tenant_scripts,
            MigrationType::TenantScript,
        )
        .await?;
        groups.drain_into(&mut migrations, true);

        tracing::debug!(count = migrations.len(), "loaded source migrations");
        Ok(migrations)
    }

    async fn health_check(&self) -> Result<()> {
        let base_dir = self.base_dir()?;
        let metadata =
            tokio::fs::metadata(&base_dir)
                .await
                .map_err(|e| LoaderError::BaseLocation {
                    location: base_dir.display().to_string(),
                    cause: e.to_string(),
                })?;
        if !metadata.is_dir() {
            return Err(LoaderError::BaseLocation {
                location: base_dir.display().to_string(),
                cause: "not a directory".to_owned(),
            });
        }
        Ok(())
    }
}
