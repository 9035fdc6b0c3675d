//! Source migration loaders.
//!
//! A [`Loader`] assembles the configured migration prefixes into one
//! deterministic ordered plan with strong content identity (SHA-256). The
//! backend is chosen by the `baseLocation` scheme: `s3://bucket[/prefix]`
//! for S3, an `https://<account>.blob.core.windows.net/<container>` URL for
//! Azure Blob, anything else for the local filesystem.

use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};

use strata_core::{Config, Migration, MigrationType};

mod azure;
mod disk;
mod error;
mod s3;

pub use azure::AzureBlobLoader;
pub use disk::DiskLoader;
pub use error::{LoaderError, Result};
pub use s3::S3Loader;

/// Capability interface over a migration source.
#[async_trait]
pub trait Loader: Send + Sync {
    /// The full ordered plan. Any listing or read error is fatal — a plan
    /// is only meaningful when complete.
    async fn get_source_migrations(&self) -> Result<Vec<Migration>>;

    async fn health_check(&self) -> Result<()>;
}

/// Picks the loader backend for `config.baseLocation`.
pub fn new_loader(config: &Config) -> Box<dyn Loader> {
    if config.base_location.starts_with("s3://") {
        return Box::new(S3Loader::new(config));
    }
    let azure = Regex::new(r"^https://[^/]+\.blob\.core\.windows\.net/.+").unwrap();
    if azure.is_match(&config.base_location) {
        return Box::new(AzureBlobLoader::new(config));
    }
    Box::new(DiskLoader::new(config))
}

/// Builds a migration from its full key and raw contents.
///
/// `name` is the basename, `source_dir` the directory portion, and the
/// checksum the lowercase hex SHA-256 of the contents.
pub(crate) fn build_migration(
    file: String,
    contents: String,
    migration_type: MigrationType,
) -> Migration {
    let (source_dir, name) = match file.rfind('/') {
        Some(at) => (file[..at].to_owned(), file[at + 1..].to_owned()),
        None => (String::new(), file.clone()),
    };
    let check_sum = hex::encode(Sha256::digest(contents.as_bytes()));
    Migration {
        name,
        source_dir,
        file,
        migration_type,
        contents,
        check_sum,
    }
}

/// Name-keyed buckets used to assemble one ordered group of the plan.
///
/// Keys drain in sorted order; within a bucket migrations keep insertion
/// order, which lets two source dirs contribute same-named migrations
/// adjacently (parallel development across teams).
#[derive(Default)]
pub(crate) struct MigrationGroups {
    buckets: BTreeMap<String, Vec<Migration>>,
}

impl MigrationGroups {
    pub(crate) fn add(&mut self, migration: Migration) {
        self.buckets
            .entry(migration.name.clone())
            .or_default()
            .push(migration);
    }

    /// Drains into `out`; script groups additionally order same-named
    /// entries by `source_dir` so the plan has a total order.
    pub(crate) fn drain_into(self, out: &mut Vec<Migration>, by_source_dir: bool) {
        for (_, mut group) in self.buckets {
            if by_source_dir {
                group.sort_by(|a, b| a.source_dir.cmp(&b.source_dir));
            }
            out.extend(group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(file: &str, migration_type: MigrationType) -> Migration {
        build_migration(file.to_owned(), format!("-- {file}"), migration_type)
    }

    #[test]
    fn build_migration_splits_key_and_hashes_contents() {
        let m = build_migration(
            "base/tenants/201602160001.sql".to_owned(),
            "abc".to_owned(),
            MigrationType::TenantMigration,
        );
        assert_eq!(m.name, "201602160001.sql");
        assert_eq!(m.source_dir, "base/tenants");
        assert_eq!(m.file, "base/tenants/201602160001.sql");
        assert_eq!(
            m.check_sum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn groups_drain_sorted_by_name_keeping_insertion_order_inside_buckets() {
        let mut groups = MigrationGroups::default();
        groups.add(migration("t/2018-11-19", MigrationType::TenantMigration));
        groups.add(migration("p/2018-11-11", MigrationType::SingleMigration));
        groups.add(migration("t/2018-11-11", MigrationType::TenantMigration));

        let mut out = Vec::new();
        groups.drain_into(&mut out, false);

        let files: Vec<&str> = out.iter().map(|m| m.file.as_str()).collect();
        // 2018-11-11 bucket keeps insertion order: p before t
        assert_eq!(files, vec!["p/2018-11-11", "t/2018-11-11", "t/2018-11-19"]);
    }

    #[test]
    fn script_groups_order_same_named_entries_by_source_dir() {
        let mut groups = MigrationGroups::default();
        groups.add(migration("z-scripts/views.sql", MigrationType::SingleScript));
        groups.add(migration("a-scripts/views.sql", MigrationType::SingleScript));

        let mut out = Vec::new();
        groups.drain_into(&mut out, true);

        let files: Vec<&str> = out.iter().map(|m| m.file.as_str()).collect();
        assert_eq!(files, vec!["a-scripts/views.sql", "z-scripts/views.sql"]);
    }
}
