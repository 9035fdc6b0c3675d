#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown driver `{0}`")]
    UnknownDriver(String),

    #[error("invalid schema identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("Could not {stage}: {cause}")]
    Init { stage: &'static str, cause: String },

    #[error("Create schema failed, transaction rollback was called: {0}")]
    CreateSchema(String),

    #[error("Failed to add tenant entry: {0}")]
    TenantInsert(String),

    #[error("SQL migration {file} failed: {cause}")]
    MigrationFailed { file: String, cause: String },

    #[error("Failed to add migration entry: {0}")]
    MigrationInsert(String),

    #[error("Version not found ID: {0}")]
    VersionNotFound(i32),

    #[error("DB migration not found ID: {0}")]
    DBMigrationNotFound(i32),

    #[error("unexpected migration type `{0}` in history")]
    UnknownMigrationType(i32),

    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("mssql `{0}`")]
    Mssql(#[from] tiberius::error::Error),

    #[error("mongodb `{0}`")]
    Mongo(#[from] mongodb::error::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
