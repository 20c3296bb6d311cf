//! Storage Reconciler - Provisioning & Reconciliation Engine
//!
//! A control loop keeping the real-world state of block-storage volumes,
//! filesystems, and their machine attachments in sync with a declared,
//! centrally-stored desired state. One engine runs per provisioning scope:
//! model-wide for resources created directly against a backend, or bound to
//! one machine for resources provisioned from that machine's perspective.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Reconciler Engine                       │
//! │                                                              │
//! │   watchers ──► pending sets ──► classifier ──► dispatch      │
//! │      ▲                             │               │         │
//! │      │                       retry queue      bounded        │
//! │      │                      (backoff)         fan-out        │
//! ├──────┴───────────────────────────────────┬──────────┴────────┤
//! │        Batched Facade Client             │  Backend Registry │
//! │  (ordered N-in / N-out, per-element      │  loop / tmpfs /   │
//! │   results over a raw transport)          │  custom adapters  │
//! └──────────────────────────────────────────┴───────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`engine`]: The reconciliation loop, classifier, pending sets, retry
//! - [`facade`]: Batched controller client and change watchers
//! - [`backends`]: Provisioning adapters and their registry
//! - [`domain`]: Identifiers, lifecycle, records, the backend port
//! - [`error`]: Error taxonomy and transient/terminal classification

pub mod backends;
pub mod domain;
pub mod engine;
pub mod error;
pub mod facade;

// Re-export commonly used types
pub use backends::{BackendRegistry, LoopBackend, TmpfsBackend};

pub use domain::model::{
    AttachmentInfo, AttachmentParams, BlockDevice, StorageInfo, StorageParams,
};
pub use domain::ports::{BackendRef, StorageBackend};
pub use domain::tags::{AttachmentId, Life, Scope, StorageKind, Tag};

pub use engine::{Engine, EngineConfig, RetryPolicy};

pub use error::{ApiError, Error, ProvisionError, Result};

pub use facade::{Caller, StorageClient, WatchConnection};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
