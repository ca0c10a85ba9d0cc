use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Vector has only bad values; cannot fit a distribution")]
    AllValuesMissing,
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Numeric domain error: {0}")]
    NumericDomain(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse {what}: {value}")]
    Parse { what: &'static str, value: String },
    #[error("Unknown row label: {0}")]
    UnknownLabel(String),
}
