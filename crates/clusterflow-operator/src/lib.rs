//! ClusterFlow operator
//!
//! Turns cluster events into AWS infrastructure. One [`Reconciler`] run per
//! event walks a fixed stage sequence, creating or tearing down every
//! resource of the cluster, and reports what happened per stage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ EventSource  │──▶│  Reconciler  │──▶ CreateReport / DeleteReport
//! └──────────────┘   └──────┬───────┘
//!                           │
//!        ┌──────────────────┼──────────────────┐
//!        ▼                  ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Composer   │   │  TLS assets  │   │   Renderer   │
//! │ provisioners │   │  KMS encrypt │   │ cloud-config │
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```

pub mod clients;
pub mod composer;
pub mod error;
pub mod event;
pub mod namespace;
pub mod naming;
pub mod reconciler;
pub mod registration;
pub mod render;
pub mod spec;
pub mod stage;
pub mod tls;

// Re-exports
pub use clients::{ClientFactory, SdkClientFactory};
#[cfg(feature = "memory")]
pub use clients::MemoryClientFactory;
pub use composer::Composer;
pub use error::{OperatorError, Result};
pub use event::{ClusterEvent, EventSource, JsonLinesSource, decode_event};
pub use namespace::{DirNamespaceStore, NamespaceStore};
pub use naming::{ClusterNames, MachineRole};
pub use reconciler::{
    Consistency, ReconcileOutcome, Reconciler, ReconcilerSettings, check_consistency,
};
pub use registration::{FileRegistrar, TypeDescriptor, TypeRegistrar, ensure_registered};
pub use render::{CloudConfigRenderer, TeraRenderer};
pub use spec::{ClusterSpec, DomainSpec, MachineSpec, NetworkSpec};
pub use stage::{CreateReport, CreateStage, DeleteReport, DeleteStage, RunReport, StageReport};
pub use tls::{CompactTlsAssets, RawTlsAssets, TlsAsset, TlsAssetType, TlsComponent};
