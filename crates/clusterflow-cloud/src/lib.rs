//! ClusterFlow Cloud Resources
//!
//! Provider-agnostic building blocks for idempotent provisioning.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               clusterflow-operator               │
//! │        (create / delete reconciliation)          │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               clusterflow-cloud                  │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │   Capability traits                       │   │
//! │  │   Resource / Reusable / HasArn / HasId    │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │ Error kinds  │  │ Retry/backoff│            │
//! │  └──────────────┘  └──────────────┘            │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//!           ┌───────▼───────┐
//!           │ cloud-aws     │
//!           │ provisioners  │
//!           └───────────────┘
//! ```

pub mod action;
pub mod error;
pub mod resource;
pub mod retry;

// Re-exports
pub use action::{ActionResult, ActionType, ApplyResult, ApplySummary};
pub use error::{ApiError, ApiErrorKind, ApiResult, CloudError, ErrorKind, Result, require};
pub use resource::{
    Fetchable, HasArn, HasDnsName, HasId, HasName, Resource, ResourceKind, Reusable, ensure,
};
pub use retry::{RetryConfig, retry_until, wait_until};
