//! Reconciliation engine for cloud control APIs
//!
//! Drives create, read, update and delete of remote objects against an
//! eventually-consistent provider API: classified retries with backoff,
//! polling of asynchronous operations, partial updates that report what
//! committed, and composite identities for objects without a natural key.
//!
//! # Module Structure
//!
//! - [`reconciler`] - create/read/update/delete/drift for one resource kind
//! - [`retry`] - error classification and the backoff controller
//! - [`poller`] - waits for asynchronous remote operations
//! - [`router`] - one cached client per region/account scope
//! - [`diff`] - attribute diffs and update partitions
//! - [`identity`] - composite identity codec
//! - [`remote`] - the [`RemoteApi`] trait adapters implement
//! - [`deadline`] - deadlines and cancellation
//! - [`config`] - engine tuning, loaded from the user config dir
//!
//! # Example
//!
//! ```ignore
//! use cloudrecon::{Deadline, EngineConfig, Reconciler, RegionalClientRouter};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn example(
//!     factory: MyFactory,
//!     kind: ResourceKind,
//!     desired: ResourceDescriptor,
//! ) -> cloudrecon::Result<()> {
//!     let router = Arc::new(RegionalClientRouter::new(factory));
//!     let reconciler = Reconciler::new(kind, router, &EngineConfig::load());
//!     let deadline = Deadline::after(Duration::from_secs(600));
//!     let created = reconciler.create(&desired, &deadline).await?;
//!     println!("stored identity: {}", created.identity);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod deadline;
pub mod diff;
pub mod error;
pub mod identity;
pub mod poller;
pub mod reconciler;
pub mod remote;
pub mod retry;
pub mod router;
pub mod state;

pub use config::{EngineConfig, PollConfig, RetryConfig};
pub use deadline::{Deadline, Interrupt};
pub use diff::{diff, AttributeDiff, Partition, PartitionChange, UpdatePlan};
pub use error::{ErrorKind, ReconcileError, Result, Step};
pub use identity::{CompositeIdentity, IdentityPart};
pub use poller::{OperationPoller, PollState};
pub use reconciler::{Created, Deletion, Drift, Lookup, Reconciler, ResourceKind};
pub use remote::{
    Attributes, CallOutcome, OperationHandle, OperationStatus, RemoteApi, RemoteFailure,
    RemoteObject, Scope,
};
pub use retry::{
    BackoffPolicy, CallClass, ErrorClass, ErrorClassifier, RateLimitConfig, Retrier,
};
pub use router::{ClientFactory, RegionalClientRouter};
pub use state::{ObservedState, Reference, ResourceDescriptor};
