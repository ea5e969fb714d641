//! Remote API collaborator
//!
//! The engine never speaks a transport itself. Adapters implement
//! [`RemoteApi`] for a client bound to one [`Scope`], and the engine drives
//! it: retries, operation polling, partial updates.

use crate::diff::PartitionChange;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute bag keyed by attribute name
pub type Attributes = BTreeMap<String, Value>;

/// Administrative scope a client is bound to (region, optionally account)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub region: String,
    #[serde(default)]
    pub account: Option<String>,
}

impl Scope {
    pub fn region(region: &str) -> Self {
        Self {
            region: region.to_string(),
            account: None,
        }
    }

    pub fn with_account(mut self, account: &str) -> Self {
        self.account = Some(account.to_string());
        self
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.account {
            Some(account) => write!(f, "{}/{}", account, self.region),
            None => f.write_str(&self.region),
        }
    }
}

/// A raw failure reported by the remote side, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    /// Provider error code, e.g. `ResourceInUse.InstanceStatus`
    pub code: String,
    pub message: String,
    /// HTTP-like status, when the transport exposes one
    pub status: Option<u16>,
    pub request_id: Option<String>,
}

impl RemoteFailure {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            status: None,
            request_id: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(status) = self.status {
            write!(f, " (status {})", status)?;
        }
        if let Some(request_id) = &self.request_id {
            write!(f, " (request {})", request_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteFailure {}

/// Object state as returned by the remote side
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteObject {
    pub attributes: Attributes,
    pub tags: Attributes,
}

impl RemoteObject {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            tags: Attributes::new(),
        }
    }

    pub fn with_tags(mut self, tags: Attributes) -> Self {
        self.tags = tags;
        self
    }
}

/// Reference to an in-flight asynchronous remote operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    /// Opaque provider token (task id, flow id, operation name)
    pub token: String,
    /// Resource kind the operation belongs to
    pub kind: String,
    pub scope: Scope,
}

impl OperationHandle {
    pub fn new(token: &str, kind: &str, scope: Scope) -> Self {
        Self {
            token: token.to_string(),
            kind: kind.to_string(),
            scope,
        }
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation {} in {}", self.kind, self.token, self.scope)
    }
}

/// Result of a mutating call
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The call finished synchronously
    Completed(RemoteObject),
    /// The call was accepted and continues server-side
    Accepted(OperationHandle),
}

/// Answer of a status check against an [`OperationHandle`]
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Running,
    Succeeded(RemoteObject),
    Failed(String),
}

/// Calls the engine issues against one scope-bound client.
///
/// `id` is always the decoded composite identity of the object.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(
        &self,
        kind: &str,
        attributes: &Attributes,
    ) -> Result<CallOutcome, RemoteFailure>;

    async fn read(&self, kind: &str, id: &[String]) -> Result<RemoteObject, RemoteFailure>;

    /// Apply one partition of an update (tag removal, attribute modify, ...)
    async fn apply(
        &self,
        kind: &str,
        id: &[String],
        change: &PartitionChange,
    ) -> Result<CallOutcome, RemoteFailure>;

    async fn delete(&self, kind: &str, id: &[String]) -> Result<CallOutcome, RemoteFailure>;

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, RemoteFailure>;

    /// Whether a cancel endpoint exists for this operation kind.
    /// Most provider operations cannot be aborted once submitted.
    fn can_cancel(&self, _handle: &OperationHandle) -> bool {
        false
    }

    async fn cancel_operation(&self, _handle: &OperationHandle) -> Result<(), RemoteFailure> {
        Ok(())
    }
}
