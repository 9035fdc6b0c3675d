use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;

use strata::{
    Action, Config, Coordinator, GaugeRegistry, Migration, MigrationType, NoopNotifier, Summary,
    Tenant, Version,
};
use strata_core::DBMigration;
use strata_loader::{Loader, Result as LoaderResult};
use strata_server::{build_schema, router, AppState};
use strata_store::{Connector, Result as StoreResult};

struct MockLoader;

#[async_trait]
impl Loader for MockLoader {
    async fn get_source_migrations(&self) -> LoaderResult<Vec<Migration>> {
        Ok(vec![Migration {
            name: "001.sql".to_owned(),
            source_dir: "tenants".to_owned(),
            file: "tenants/001.sql".to_owned(),
            migration_type: MigrationType::TenantMigration,
            contents: "create table {schema}.orders (id int)".to_owned(),
            check_sum: "aa11".to_owned(),
        }])
    }

    async fn health_check(&self) -> LoaderResult<()> {
        Ok(())
    }
}

struct MockConnector;

#[async_trait]
impl Connector for MockConnector {
    async fn get_tenants(&self) -> StoreResult<Vec<Tenant>> {
        Ok(vec![
            Tenant {
                name: "abc".to_owned(),
            },
            Tenant {
                name: "def".to_owned(),
            },
        ])
    }

    async fn get_applied_migrations(&self) -> StoreResult<Vec<DBMigration>> {
        Ok(Vec::new())
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
        _dry_run: bool,
    ) -> StoreResult<(Summary, Option<Version>)> {
        let started_at = Utc::now();
        let summary = Summary::classified(started_at, migrations, 2);
        let version = Version {
            id: 1,
            name: version_name.to_owned(),
            created: started_at,
            db_migrations: Vec::new(),
        };
        Ok((summary, Some(version)))
    }

    async fn create_tenant(
        &self,
        _tenant: &str,
        version_name: &str,
        _action: Action,
        migrations: &[Migration],
        _dry_run: bool,
    ) -> StoreResult<(Summary, Option<Version>)> {
        let started_at = Utc::now();
        let summary = Summary::classified(started_at, migrations, 1);
        let version = Version {
            id: 2,
            name: version_name.to_owned(),
            created: started_at,
            db_migrations: Vec::new(),
        };
        Ok((summary, Some(version)))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn dispose(&self) {}
}

fn config(jwt_secret: Option<&str>) -> Config {
    let mut yaml = String::from(
        r#"
baseLocation: migrations
driver: postgres
dataSource: postgres://localhost/app
singleMigrations:
  - public
"#,
    );
    if let Some(secret) = jwt_secret {
        yaml.push_str(&format!("jwtSecret: {secret}\n"));
    }
    Config::from_yaml(&yaml).unwrap()
}

fn app(jwt_secret: Option<&str>) -> axum::Router {
    let registry = Arc::new(GaugeRegistry::default());
    let coordinator = Arc::new(Coordinator::new(
        Box::new(MockConnector),
        Box::new(MockLoader),
        Box::new(NoopNotifier),
        registry.clone(),
        config(jwt_secret),
    ));
    let schema = build_schema(coordinator.clone());
    router(AppState {
        coordinator,
        registry,
        schema,
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn root_reports_release_and_api_versions() {
    let response = app(None)
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["apiVersions"], serde_json::json!(["v2"]));
    assert!(body["release"].as_str().unwrap().starts_with("strata v"));
}

#[tokio::test]
async fn health_reports_up_with_checks() {
    let response = app(None)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["checks"][0]["name"], "db");
    assert_eq!(body["checks"][0]["status"], "UP");
}

#[tokio::test]
async fn metrics_render_in_prometheus_text_format() {
    let response = app(None)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

#[tokio::test]
async fn schema_serves_the_graphql_sdl() {
    let response = app(None)
        .oneshot(Request::get("/v2/schema").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let sdl = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(sdl.contains("sourceMigrations"));
    assert!(sdl.contains("createTenant"));
    assert!(sdl.contains("enum MigrationType"));
}

#[tokio::test]
async fn graphql_queries_delegate_to_the_coordinator() {
    let request = serde_json::json!({"query": "{ tenants { name } }"});
    let response = app(None)
        .oneshot(
            Request::post("/v2/service")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(
        body["data"]["tenants"],
        serde_json::json!([{"name": "abc"}, {"name": "def"}])
    );
}

#[tokio::test]
async fn graphql_mutation_returns_create_results() {
    let request = serde_json::json!({
        "query": r#"mutation {
            createVersion(input: {versionName: "v1", action: Apply, dryRun: false}) {
                summary { tenantMigrations tenantMigrationsTotal versionId }
                version { id name }
            }
        }"#
    });
    let response = app(None)
        .oneshot(
            Request::post("/v2/service")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let body = body_json(response).await;
    let results = &body["data"]["createVersion"];
    assert_eq!(results["summary"]["tenantMigrations"], 1);
    assert_eq!(results["summary"]["tenantMigrationsTotal"], 2);
    assert_eq!(results["version"]["name"], "v1");
}

#[tokio::test]
async fn config_is_served_as_yaml() {
    let response = app(None)
        .oneshot(Request::get("/v2/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-yaml"
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let yaml = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(yaml.contains("baseLocation: migrations"));
    assert!(yaml.contains("driver: postgres"));
}

#[tokio::test]
async fn responses_carry_the_request_correlation_id() {
    let response = app(None)
        .oneshot(
            Request::get("/health")
                .header("X-Request-ID", "pipeline-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("X-Request-ID").unwrap(),
        "pipeline-42"
    );

    // a fresh id is generated when the caller sends none
    let response = app(None)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(!response
        .headers()
        .get("X-Request-ID")
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn v2_requires_a_bearer_token_when_a_secret_is_configured() {
    let response = app(Some("super-secret"))
        .oneshot(Request::get("/v2/schema").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // health stays open
    let response = app(Some("super-secret"))
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn a_valid_bearer_token_is_accepted() {
    let claims = serde_json::json!({
        "sub": "deploy-pipeline",
        "exp": (Utc::now().timestamp() + 3600),
    });
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(b"super-secret"),
    )
    .unwrap();

    let response = app(Some("super-secret"))
        .oneshot(
            Request::get("/v2/schema")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
