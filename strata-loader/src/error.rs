#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("could not resolve base location `{location}`: {cause}")]
    BaseLocation { location: String, cause: String },

    #[error("could not list `{location}`: {cause}")]
    List { location: String, cause: String },

    #[error("could not read `{location}`: {cause}")]
    Read { location: String, cause: String },
}

pub type Result<T> = std::result::Result<T, LoaderError>;
