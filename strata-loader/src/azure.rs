//! Azure Blob Storage loader.
//!
//! The container is part of the service URL, optionally followed by key
//! prefixes: `https://<account>.blob.core.windows.net/<container>[/p...]`.
//! Credentials come from the `AZURE_STORAGE_ACCOUNT` /
//! `AZURE_STORAGE_ACCESS_KEY` pair when set, anonymous access otherwise.

use async_trait::async_trait;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use futures_util::StreamExt;

use strata_core::{Config, Migration, MigrationType};

use crate::error::{LoaderError, Result};
use crate::{build_migration, Loader, MigrationGroups};

pub struct AzureBlobLoader {
    config: Config,
}

/// `(account, container, optional_prefix)` from the base location URL.
pub(crate) fn parse_base_location(base_location: &str) -> Result<(String, String, String)> {
    let trimmed = base_location
        .trim_end_matches('/')
        .trim_start_matches("https://");
    let mut segments = trimmed.split('/');

    let host = segments.next().unwrap_or_default();
    let account = host.split('.').next().unwrap_or_default();
    let container = segments.next().unwrap_or_default();
    if account.is_empty() || container.is_empty() {
        return Err(LoaderError::BaseLocation {
            location: base_location.to_owned(),
            cause: "expected https://<account>.blob.core.windows.net/<container>".to_owned(),
        });
    }
    let optional_prefix = segments.collect::<Vec<_>>().join("/");

    Ok((account.to_owned(), container.to_owned(), optional_prefix))
}

fn full_prefix(optional_prefix: &str, prefix: &str) -> String {
    if optional_prefix.is_empty() {
        format!("{prefix}/")
    } else {
        format!("{optional_prefix}/{prefix}/")
    }
}

impl AzureBlobLoader {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn container_client(&self) -> Result<ContainerClient> {
        let (account, container, _) = parse_base_location(&self.config.base_location)?;

        let credentials = match (
            std::env::var("AZURE_STORAGE_ACCOUNT"),
            std::env::var("AZURE_STORAGE_ACCESS_KEY"),
        ) {
            (Ok(env_account), Ok(key)) if !env_account.is_empty() && !key.is_empty() => {
                StorageCredentials::access_key(env_account, key)
            }
            _ => StorageCredentials::anonymous(),
        };

        let service = BlobServiceClient::new(account, credentials);
        Ok(service.container_client(container))
    }

    async fn blob_list(
        &self,
        client: &ContainerClient,
        optional_prefix: &str,
        prefixes: &[String],
    ) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for prefix in prefixes {
            let full = full_prefix(optional_prefix, prefix);
            let mut pages = client.list_blobs().prefix(full.clone()).into_stream();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| LoaderError::List {
                    location: format!("{}/{full}", self.config.base_location),
                    cause: e.to_string(),
                })?;
                for blob in page.blobs.blobs() {
                    names.push(blob.name.clone());
                }
            }
        }

        Ok(names)
    }

    async fn read_blobs(
        &self,
        client: &ContainerClient,
        groups: &mut MigrationGroups,
        names: &[String],
        migration_type: MigrationType,
    ) -> Result<()> {
        for name in names {
            let bytes = client
                .blob_client(name)
                .get_content()
                .await
                .map_err(|e| LoaderError::Read {
                    location: name.clone(),
                    cause: e.to_string(),
                })?;
            let contents = String::from_utf8_lossy(&bytes).into_owned();

            let file = format!("{}/{name}", self.config.base_location.trim_end_matches('/'));
            groups.add(build_migration(file, contents, migration_type));
        }
        Ok(())
    }
}

#[async_trait]
impl Loader for AzureBlobLoader {
    async fn get_source_migrations(&self) -> Result<Vec<Migration>> {
        let (_, _, optional_prefix) = parse_base_location(&self.config.base_location)?;
        let client = self.container_client()?;
        let mut migrations = Vec::new();

        let singles = self
            .blob_list(&client, &optional_prefix, &self.config.single_migrations)
            .await?;
        let tenants = self
            .blob_list(&client, &optional_prefix, &self.config.tenant_migrations)
            .await?;
        let mut groups = MigrationGroups::default();
        self.read_blobs(&client, &mut groups, &singles, MigrationType::SingleMigration)
            .await?;
        self.read_blobs(&client, &mut groups, &tenants, MigrationType::TenantMigration)
            .await?;
        groups.drain_into(&mut migrations, false);

        let single_scripts = self
            .blob_list(&client, &optional_prefix, &self.config.single_scripts)
            .await?;
        let mut groups = MigrationGroups::default();
        self.read_blobs(
            &client,
            &mut groups,
            &single_scripts,
            MigrationType::SingleScript,
        )
        .await?;
        groups.drain_into(&mut migrations, true);

        let tenant_scripts = self
            .blob_list(&client, &optional_prefix, &self.config.tenant_scripts)
            .await?;
        let mut groups = MigrationGroups::default();
        self.read_blobs(
            &client,
            &mut groups,
            &tenant_scripts,
            MigrationType::TenantScript,
        )
        .await?;
        groups.drain_into(&mut migrations, true);

        tracing::debug!(count = migrations.len(), "loaded source migrations");
        Ok(migrations)
    }

    async fn health_check(&self) -> Result<()> {
        let client = self.container_client()?;
        let mut pages = client
            .list_blobs()
            .max_results(std::num::NonZeroU32::new(1).unwrap())
            .into_stream();
        if let Some(page) = pages.next().await {
            page.map_err(|e| LoaderError::List {
                location: self.config.base_location.clone(),
                cause: e.to_string(),
            })?;
        }
        Ok(())
    }
}
