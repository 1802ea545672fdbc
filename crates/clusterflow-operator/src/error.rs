use clusterflow_cloud::{CloudError, ErrorKind};
use clusterflow_config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),

    #[error("malformed event: {0}")]
    Event(String),

    #[error("TLS asset missing: {0}")]
    MissingAsset(PathBuf),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("type registration failed: {0}")]
    Registration(String),

    #[error("provider '{0}' is not compiled in")]
    ProviderUnavailable(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OperatorError {
    /// Programmatic class, shared with [`CloudError::kind`]
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperatorError::Cloud(e) => e.kind(),
            OperatorError::Config(_)
            | OperatorError::InvalidSpec(_)
            | OperatorError::Event(_)
            | OperatorError::MissingAsset(_)
            | OperatorError::Template(_)
            | OperatorError::ProviderUnavailable(_) => ErrorKind::Invalid,
            OperatorError::Registration(_)
            | OperatorError::Io(_)
            | OperatorError::Json(_) => ErrorKind::Provider,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, OperatorError>;
