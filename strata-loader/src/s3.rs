//! AWS S3 loader.
//!
//! Uses the default AWS credential chain. Listings are recursive under
//! each configured prefix and paginated at 1000 keys.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;

use strata_core::{Config, Migration, MigrationType};

use crate::error::{LoaderError, Result};
use crate::{build_migration, Loader, MigrationGroups};

pub struct S3Loader {
    config: Config,
}

/// Splits `s3://bucket[/optional/prefix]` into bucket and prefix.
pub(crate) fn bucket_and_prefix(base_location: &str) -> (String, String) {
    let trimmed = base_location
        .trim_end_matches('/')
        .trim_start_matches("s3://");
    match trimmed.split_once('/') {
        Some((bucket, prefix)) => (bucket.to_owned(), prefix.to_owned()),
        None => (trimmed.to_owned(), String::new()),
    }
}

fn full_prefix(optional_prefix: &str, prefix: &str) -> String {
    if optional_prefix.is_empty() {
        prefix.to_owned()
    } else {
        format!("{optional_prefix}/{prefix}")
    }
}

impl S3Loader {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    async fn client(&self) -> Client {
        let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Client::new(&sdk_config)
    }

    async fn object_list(
        &self,
        client: &Client,
        bucket: &str,
        optional_prefix: &str,
        prefixes: &[String],
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for prefix in prefixes {
            let full = full_prefix(optional_prefix, prefix);
            let mut pages = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(&full)
                .max_keys(1000)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| LoaderError::List {
                    location: format!("s3://{bucket}/{full}"),
                    cause: e.to_string(),
                })?;
                for object in page.contents() {
                    if let Some(key) = object.key() {
                        keys.push(key.to_owned());
                    }
                }
            }
        }

        Ok(keys)
    }

    async fn read_objects(
        &self,
        client: &Client,
        bucket: &str,
        groups: &mut MigrationGroups,
        keys: &[String],
        migration_type: MigrationType,
    ) -> Result<()> {
        for key in keys {
            let object = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| LoaderError::Read {
                    location: format!("s3://{bucket}/{key}"),
                    cause: e.to_string(),
                })?;
            let bytes = object
                .body
                .collect()
                .await
                .map_err(|e| LoaderError::Read {
                    location: format!("s3://{bucket}/{key}"),
                    cause: e.to_string(),
                })?
                .into_bytes();
            let contents = String::from_utf8_lossy(&bytes).into_owned();

            let file = format!("{}/{key}", self.config.base_location.trim_end_matches('/'));
            groups.add(build_migration(file, contents, migration_type));
        }
        Ok(())
    }
}

#[async_trait]
impl Loader for S3Loader {
    async fn get_source_migrations(&self) -> Result<Vec<Migration>> {
        let (bucket, optional_prefix) = bucket_and_prefix(&self.config.base_location);
        let client = self.client().await;
        let mut migrations = Vec::new();

        let singles = self
            .object_list(&client, &bucket, &optional_prefix, &self.config.single_migrations)
            .await?;
        let tenants = self
            .object_list(&client, &bucket, &optional_prefix, &self.config.tenant_migrations)
            .await?;
        let mut groups = MigrationGroups::default();
        self.read_objects(&client, &bucket, &mut groups, &singles, MigrationType::SingleMigration)
            .await?;
        self.read_objects(&client, &bucket, &mut groups, &tenants, MigrationType::TenantMigration)
            .await?;
        groups.drain_into(&mut migrations, false);

        let single_scripts = self
            .object_list(&client, &bucket, &optional_prefix, &self.config.single_scripts)
            .await?;
        let mut groups = MigrationGroups::default();
        self.read_objects(
            &client,
            &bucket,
            &mut groups,
            &single_scripts,
            MigrationType::SingleScript,
        )
        .await?;
        groups.drain_into(&mut migrations, true);

        let tenant_scripts = self
            .object_list(&client, &bucket, &optional_prefix, &self.config.tenant_scripts)
            .await?;
        let mut groups = MigrationGroups::default();
        self.read_objects(
            &client,
            &bucket,
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
        let (bucket, optional_prefix) = bucket_and_prefix(&self.config.base_location);
        let client = self.client().await;
        client
            .list_objects_v2()
            .bucket(&bucket)
            .prefix(&optional_prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| LoaderError::List {
                location: self.config.base_location.clone(),
                cause: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::bucket_and_prefix;

    #[test]
    fn splits_bucket_and_optional_prefix() {
        assert_eq!(
            bucket_and_prefix("s3://my-bucket"),
            ("my-bucket".to_owned(), String::new())
        );
        assert_eq!(
            bucket_and_prefix("s3://my-bucket/"),
            ("my-bucket".to_owned(), String::new())
        );
        assert_eq!(
            bucket_and_prefix("s3://my-bucket/prod/artefacts"),
            ("my-bucket".to_owned(), "prod/artefacts".to_owned())
        );
    }
}
