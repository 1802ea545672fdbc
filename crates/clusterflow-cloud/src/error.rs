//! Error taxonomy for resource provisioning

use crate::resource::ResourceKind;
use std::time::Duration;
use thiserror::Error;

/// Classification of a provider API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    /// The resource the call tried to create is already there
    AlreadyExists,
    /// The addressed resource does not exist
    NotFound,
    /// The call was rejected because a just-created dependency is not usable yet
    NotReady,
    /// Anything else
    Other,
}

impl std::fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiErrorKind::AlreadyExists => write!(f, "already-exists"),
            ApiErrorKind::NotFound => write!(f, "not-found"),
            ApiErrorKind::NotReady => write!(f, "not-ready"),
            ApiErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Error returned by a single provider API call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    /// Provider error code, e.g. `InvalidGroup.Duplicate`
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn already_exists(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::AlreadyExists, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, code, message)
    }

    pub fn not_ready(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotReady, code, message)
    }

    pub fn other(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Other, code, message)
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == ApiErrorKind::AlreadyExists
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    pub fn is_not_ready(&self) -> bool {
        self.kind == ApiErrorKind::NotReady
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Programmatic class of a [`CloudError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotReusable,
    DependencyUnresolved,
    Provider,
    Inconsistent,
    Invalid,
}

/// Resource provisioning errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("{kind} cannot be reused")]
    NotReusable { kind: ResourceKind },

    #[error("unresolved dependency: {0} is not set")]
    DependencyUnresolved(String),

    #[error("{operation} {kind} '{name}' failed: {source}")]
    Provider {
        kind: ResourceKind,
        name: String,
        operation: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("{operation} {kind} '{name}' did not succeed within {elapsed:?}: {source}")]
    Timeout {
        kind: ResourceKind,
        name: String,
        operation: &'static str,
        elapsed: Duration,
        #[source]
        source: ApiError,
    },

    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("cluster is inconsistent: {0}")]
    Inconsistent(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Wrap a provider failure, promoting not-found and already-exists
    /// responses to their dedicated variants.
    pub fn api(
        kind: ResourceKind,
        name: impl Into<String>,
        operation: &'static str,
        source: ApiError,
    ) -> Self {
        let name = name.into();
        match source.kind {
            ApiErrorKind::NotFound => CloudError::NotFound { kind, name },
            ApiErrorKind::AlreadyExists => CloudError::AlreadyExists { kind, name },
            ApiErrorKind::NotReady | ApiErrorKind::Other => CloudError::Provider {
                kind,
                name,
                operation,
                source,
            },
        }
    }

    /// Wrap a provider failure without reclassifying it
    pub fn provider(
        kind: ResourceKind,
        name: impl Into<String>,
        operation: &'static str,
        source: ApiError,
    ) -> Self {
        CloudError::Provider {
            kind,
            name: name.into(),
            operation,
            source,
        }
    }

    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        CloudError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CloudError::NotFound { .. } => ErrorKind::NotFound,
            CloudError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            CloudError::NotReusable { .. } => ErrorKind::NotReusable,
            CloudError::DependencyUnresolved(_) => ErrorKind::DependencyUnresolved,
            CloudError::Provider { .. } | CloudError::Timeout { .. } => ErrorKind::Provider,
            CloudError::Inconsistent(_) => ErrorKind::Inconsistent,
            CloudError::MalformedKey(_)
            | CloudError::InvalidConfig(_)
            | CloudError::Io(_)
            | CloudError::Json(_) => ErrorKind::Invalid,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Fail with `DependencyUnresolved` when an upstream id or arn is still empty.
pub fn require<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(CloudError::DependencyUnresolved(what.to_string()));
    }
    Ok(value)
}
