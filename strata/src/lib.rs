//! strata applies ordered, content-addressed schema changes to
//! multi-tenant relational and document databases, tracks what has been
//! applied and groups every application into an auditable version.
//!
//! The [`Coordinator`] is the entry point: it diffs the loader's source
//! inventory against the store's applied history, verifies checksums, and
//! delegates the resulting plan to the storage engine.

mod coordinator;
mod error;
mod metrics;
mod notifier;

pub use coordinator::{
    compute_migrations_to_apply, filter_tenant_migrations, flatten_applied_migrations,
    Coordinator, HealthCheck, HealthState, HealthStatus,
};
pub use error::{CoordinatorError, Result};
pub use metrics::{GaugeRegistry, Metrics, MetricsError};
pub use notifier::{new_notifier, NoopNotifier, Notifier, NotifierError, WebHookNotifier};

pub use strata_core::{
    Action, Config, CreateResults, DBMigration, Migration, MigrationType, SourceFilters, Summary,
    Tenant, Version,
};
pub use strata_loader::Loader;
pub use strata_store::Connector;
