#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Source migration not found: {0}")]
    SourceMigrationNotFound(String),

    #[error(transparent)]
    Store(#[from] strata_store::StoreError),

    #[error(transparent)]
    Loader(#[from] strata_loader::LoaderError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
