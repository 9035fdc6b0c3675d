#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("environment variable `{0}` referenced in config is not set")]
    MissingEnv(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
