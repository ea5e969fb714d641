//! Scripted in-memory remote API shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cloudrecon::retry::Jitter;
use cloudrecon::{
    Attributes, CallOutcome, ClientFactory, EngineConfig, OperationHandle, OperationStatus,
    Partition, PartitionChange, RemoteApi, RemoteFailure, RemoteObject, Scope,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One call received by a [`ScriptedApi`]
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Create(Attributes),
    Read(Vec<String>),
    Apply(Partition, PartitionChange),
    Delete(Vec<String>),
    Status(String),
    Cancel(String),
}

#[derive(Default)]
struct Script {
    create: VecDeque<Result<CallOutcome, RemoteFailure>>,
    read: VecDeque<Result<RemoteObject, RemoteFailure>>,
    apply: VecDeque<Result<CallOutcome, RemoteFailure>>,
    delete: VecDeque<Result<CallOutcome, RemoteFailure>>,
    status: VecDeque<Result<OperationStatus, RemoteFailure>>,
    /// Returned once the read queue is drained; None means NotFound
    object: Option<RemoteObject>,
    /// Returned once the status queue is drained
    status_default: Option<OperationStatus>,
    cancellable: bool,
    calls: Vec<Recorded>,
}

/// Answers each method from its own queue and records every call.
/// Clones share the same script.
#[derive(Clone, Default)]
pub struct ScriptedApi {
    script: Arc<Mutex<Script>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut script = self.script.lock().unwrap();
        f(&mut script)
    }

    pub fn on_create(&self, answer: Result<CallOutcome, RemoteFailure>) -> &Self {
        self.with(|s| s.create.push_back(answer));
        self
    }

    pub fn on_read(&self, answer: Result<RemoteObject, RemoteFailure>) -> &Self {
        self.with(|s| s.read.push_back(answer));
        self
    }

    pub fn on_apply(&self, answer: Result<CallOutcome, RemoteFailure>) -> &Self {
        self.with(|s| s.apply.push_back(answer));
        self
    }

    pub fn on_delete(&self, answer: Result<CallOutcome, RemoteFailure>) -> &Self {
        self.with(|s| s.delete.push_back(answer));
        self
    }

    pub fn on_status(&self, answer: Result<OperationStatus, RemoteFailure>) -> &Self {
        self.with(|s| s.status.push_back(answer));
        self
    }

    /// Object returned by reads once the read queue is empty
    pub fn holding(&self, object: RemoteObject) -> &Self {
        self.with(|s| s.object = Some(object));
        self
    }

    pub fn status_default(&self, status: OperationStatus) -> &Self {
        self.with(|s| s.status_default = Some(status));
        self
    }

    pub fn cancellable(&self) -> &Self {
        self.with(|s| s.cancellable = true);
        self
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.with(|s| s.calls.clone())
    }

    pub fn writes(&self) -> Vec<Recorded> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(c, Recorded::Create(_) | Recorded::Apply(..) | Recorded::Delete(_))
            })
            .collect()
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn create(
        &self,
        _kind: &str,
        attributes: &Attributes,
    ) -> Result<CallOutcome, RemoteFailure> {
        self.with(|s| {
            s.calls.push(Recorded::Create(attributes.clone()));
            s.create
                .pop_front()
                .unwrap_or_else(|| Ok(CallOutcome::Completed(RemoteObject::default())))
        })
    }

    async fn read(&self, _kind: &str, id: &[String]) -> Result<RemoteObject, RemoteFailure> {
        self.with(|s| {
            s.calls.push(Recorded::Read(id.to_vec()));
            match s.read.pop_front() {
                Some(answer) => answer,
                None => s.object.clone().ok_or_else(not_found),
            }
        })
    }

    async fn apply(
        &self,
        _kind: &str,
        _id: &[String],
        change: &PartitionChange,
    ) -> Result<CallOutcome, RemoteFailure> {
        self.with(|s| {
            s.calls.push(Recorded::Apply(change.partition, change.clone()));
            s.apply
                .pop_front()
                .unwrap_or_else(|| Ok(CallOutcome::Completed(RemoteObject::default())))
        })
    }

    async fn delete(&self, _kind: &str, id: &[String]) -> Result<CallOutcome, RemoteFailure> {
        self.with(|s| {
            s.calls.push(Recorded::Delete(id.to_vec()));
            s.delete
                .pop_front()
                .unwrap_or_else(|| Ok(CallOutcome::Completed(RemoteObject::default())))
        })
    }

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, RemoteFailure> {
        self.with(|s| {
            s.calls.push(Recorded::Status(handle.token.clone()));
            match s.status.pop_front() {
                Some(answer) => answer,
                None => Ok(s
                    .status_default
                    .clone()
                    .unwrap_or_else(|| OperationStatus::Succeeded(RemoteObject::default()))),
            }
        })
    }

    fn can_cancel(&self, _handle: &OperationHandle) -> bool {
        self.with(|s| s.cancellable)
    }

    async fn cancel_operation(&self, handle: &OperationHandle) -> Result<(), RemoteFailure> {
        self.with(|s| s.calls.push(Recorded::Cancel(handle.token.clone())));
        Ok(())
    }
}

/// Hands out the registered [`ScriptedApi`] for a scope and counts constructions
#[derive(Default)]
pub struct ScriptedFactory {
    apis: Mutex<HashMap<Scope, ScriptedApi>>,
    pub connects: AtomicUsize,
    /// How long each construction takes
    connect_delay: Duration,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// The API serving `scope`, created on first use
    pub fn api(&self, scope: &Scope) -> ScriptedApi {
        let mut apis = self.apis.lock().unwrap();
        apis.entry(scope.clone()).or_default().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for ScriptedFactory {
    type Client = ScriptedApi;

    async fn connect(&self, scope: &Scope) -> anyhow::Result<ScriptedApi> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        // Suspend so concurrent resolvers reach the slot while this one is in flight
        tokio::task::yield_now().await;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        Ok(self.api(scope))
    }
}

pub fn attrs(pairs: &[(&str, Value)]) -> Attributes {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn transient() -> RemoteFailure {
    RemoteFailure::new("InternalError", "backend hiccup").with_status(500)
}

pub fn not_found() -> RemoteFailure {
    RemoteFailure::new("ResourceNotFound.InstanceNotExist", "instance does not exist")
}

pub fn conflict() -> RemoteFailure {
    RemoteFailure::new("ResourceInUse", "instance is being modified")
}

/// Default tuning with deterministic waits
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.read.jitter = Jitter::None;
    config.retry.write.jitter = Jitter::None;
    config
}
