//! GraphQL schema; every resolver delegates 1-to-1 to the coordinator.

use std::sync::Arc;

use async_graphql::{Context, EmptySubscription, InputObject, Object, Schema};

use strata::{
    Action, Coordinator, CreateResults, DBMigration, Migration, MigrationType, SourceFilters,
    Tenant, Version,
};

pub type StrataSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub fn build_schema(coordinator: Arc<Coordinator>) -> StrataSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(coordinator)
        .finish()
}

fn coordinator<'a>(ctx: &'a Context<'_>) -> &'a Arc<Coordinator> {
    ctx.data_unchecked::<Arc<Coordinator>>()
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn source_migrations(
        &self,
        ctx: &Context<'_>,
        name: Option<String>,
        source_dir: Option<String>,
        file: Option<String>,
        migration_type: Option<MigrationType>,
    ) -> async_graphql::Result<Vec<Migration>> {
        let filters = SourceFilters {
            name,
            source_dir,
            file,
            migration_type,
        };
        Ok(coordinator(ctx)
            .get_source_migrations(Some(&filters))
            .await?)
    }

    async fn source_migration(
        &self,
        ctx: &Context<'_>,
        file: String,
    ) -> async_graphql::Result<Migration> {
        Ok(coordinator(ctx).get_source_migration_by_file(&file).await?)
    }

    async fn versions(
        &self,
        ctx: &Context<'_>,
        file: Option<String>,
    ) -> async_graphql::Result<Vec<Version>> {
        let coordinator = coordinator(ctx);
        Ok(match file {
            Some(file) => coordinator.get_versions_by_file(&file).await?,
            None => coordinator.get_versions().await?,
        })
    }

    async fn version(&self, ctx: &Context<'_>, id: i32) -> async_graphql::Result<Version> {
        Ok(coordinator(ctx).get_version_by_id(id).await?)
    }

    async fn db_migration(
        &self,
        ctx: &Context<'_>,
        id: i32,
    ) -> async_graphql::Result<DBMigration> {
        Ok(coordinator(ctx).get_db_migration_by_id(id).await?)
    }

    async fn tenants(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Tenant>> {
        Ok(coordinator(ctx).get_tenants().await?)
    }
}

#[derive(InputObject)]
pub struct VersionInput {
    pub version_name: String,
    pub action: Action,
    #[graphql(default = false)]
    pub dry_run: bool,
}

#[derive(InputObject)]
pub struct TenantInput {
    pub version_name: String,
    pub action: Action,
    #[graphql(default = false)]
    pub dry_run: bool,
    pub tenant_name: String,
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    async fn create_version(
        &self,
        ctx: &Context<'_>,
        input: VersionInput,
    ) -> async_graphql::Result<CreateResults> {
        Ok(coordinator(ctx)
            .create_version(&input.version_name, input.action, input.dry_run)
            .await?)
    }

    async fn create_tenant(
        &self,
        ctx: &Context<'_>,
        input: TenantInput,
    ) -> async_graphql::Result<CreateResults> {
        Ok(coordinator(ctx)
            .create_tenant(
                &input.version_name,
                input.action,
                input.dry_run,
                &input.tenant_name,
            )
            .await?)
    }
}
