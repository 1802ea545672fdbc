use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config directory not found")]
    ConfigDirNotFound,

    #[error(
        "config file not found. Looked for:\n\
        - the --config flag\n\
        - the CLUSTERFLOW_CONFIG environment variable\n\
        - ./clusterflow.kdl\n\
        - <config dir>/clusterflow/clusterflow.kdl"
    )]
    ConfigFileNotFound,

    #[error("config file does not exist: {0}")]
    MissingFile(PathBuf),

    #[error("KDL parse error: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
