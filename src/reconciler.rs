//! Reconciler
//!
//! Create, read, update, delete and drift detection for one resource kind.
//! Every remote call goes through the [`Retrier`]; accepted asynchronous
//! operations are driven to completion by the [`OperationPoller`]. Steps
//! that already committed are never rolled back: later failures surface as
//! [`ReconcileError::PartialFailure`].

use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::diff::{Partition, PartitionChange, UpdatePlan};
use crate::error::{ErrorKind, ReconcileError, Result, Step};
use crate::identity::{self, CompositeIdentity, IdentityPart};
use crate::poller::OperationPoller;
use crate::remote::{Attributes, CallOutcome, RemoteApi, RemoteObject, Scope};
use crate::retry::{self, Call, ErrorClassifier, Retrier};
use crate::router::{ClientFactory, RegionalClientRouter};
use crate::state::{ObservedState, Reference, ResourceDescriptor};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// A resource kind and how its stored identity is derived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKind {
    pub name: String,
    pub identity: Vec<IdentityPart>,
}

impl ResourceKind {
    pub fn new(name: &str, identity: Vec<IdentityPart>) -> Self {
        Self {
            name: name.to_string(),
            identity,
        }
    }

    /// Number of components in this kind's identity
    pub fn arity(&self) -> usize {
        self.identity.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub identity: CompositeIdentity,
    pub observed: ObservedState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Present(ObservedState),
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    /// The object was gone before any delete call was issued
    AlreadyAbsent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Drift {
    InSync,
    Drifted(UpdatePlan),
    Absent,
}

pub struct Reconciler<F: ClientFactory> {
    kind: ResourceKind,
    router: Arc<RegionalClientRouter<F>>,
    retrier: Retrier,
    poller: OperationPoller,
}

impl<F> Reconciler<F>
where
    F: ClientFactory,
    F::Client: RemoteApi,
{
    pub fn new(
        kind: ResourceKind,
        router: Arc<RegionalClientRouter<F>>,
        config: &EngineConfig,
    ) -> Self {
        let retrier = Retrier::new(&config.retry, ErrorClassifier::new());
        let poller = OperationPoller::new(config.poll.clone(), retrier.clone());
        Self {
            kind,
            router,
            retrier,
            poller,
        }
    }

    /// Use a classifier with provider-specific rules
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.retrier = self.retrier.with_classifier(classifier);
        self.poller = OperationPoller::new(self.poller.config().clone(), self.retrier.clone());
        self
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn router(&self) -> &Arc<RegionalClientRouter<F>> {
        &self.router
    }

    /// Create the object described by `desired`, tag it, and read it back
    pub async fn create(
        &self,
        desired: &ResourceDescriptor,
        deadline: &Deadline,
    ) -> Result<Created> {
        self.traced("create", self.create_inner(desired, deadline)).await
    }

    /// Current state of `identity`, or `Absent` if the remote side has no such object
    pub async fn read(
        &self,
        scope: &Scope,
        identity: &str,
        deadline: &Deadline,
    ) -> Result<Lookup> {
        self.traced("read", self.read_inner(scope, identity, deadline)).await
    }

    /// Bring `identity` to `desired`, one call per changed partition
    pub async fn update(
        &self,
        identity: &str,
        desired: &ResourceDescriptor,
        deadline: &Deadline,
    ) -> Result<ObservedState> {
        self.traced("update", self.update_inner(identity, desired, deadline)).await
    }

    pub async fn delete(
        &self,
        scope: &Scope,
        identity: &str,
        deadline: &Deadline,
    ) -> Result<Deletion> {
        self.traced("delete", self.delete_inner(scope, identity, deadline)).await
    }

    /// Compare `desired` with a fresh read without changing anything
    pub async fn detect_drift(
        &self,
        identity: &str,
        desired: &ResourceDescriptor,
        deadline: &Deadline,
    ) -> Result<Drift> {
        self.traced("detect_drift", self.drift_inner(identity, desired, deadline)).await
    }

    async fn traced<T, Fut>(&self, op: &'static str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let span = tracing::info_span!(
            "reconcile",
            invocation = %Uuid::new_v4(),
            kind = %self.kind.name,
            op
        );
        async move {
            let started = Instant::now();
            let result = fut.await;
            let kind = &self.kind.name;
            let elapsed = started.elapsed();
            match &result {
                Ok(_) => tracing::info!("{} {} finished in {:?}", op, kind, elapsed),
                Err(e) if e.kind() == ErrorKind::PartialFailure => {
                    tracing::warn!("{} {} partially applied after {:?}: {}", op, kind, elapsed, e)
                },
                Err(e) => tracing::error!("{} {} failed after {:?}: {}", op, kind, elapsed, e),
            }
            result
        }
        .instrument(span)
        .await
    }

    fn check_kind(&self, op: &str, desired: &ResourceDescriptor) -> Result<()> {
        if desired.kind() != self.kind.name {
            return Err(ReconcileError::invalid_input(
                op,
                format!(
                    "descriptor is a {}, reconciler handles {}",
                    desired.kind(),
                    self.kind.name
                ),
            ));
        }
        Ok(())
    }

    fn decode(&self, identity: &str) -> Result<CompositeIdentity> {
        Ok(CompositeIdentity::decode(identity, self.kind.arity())?)
    }

    /// Rate limit key for `method` on this kind
    fn action(&self, method: &str) -> String {
        format!("{}.{}", self.kind.name, method)
    }

    /// Resolve the client for `scope`; a slow first connect is bounded by
    /// the caller's deadline and cancellation like any remote call
    async fn client(
        &self,
        op: &str,
        scope: &Scope,
        deadline: &Deadline,
    ) -> Result<Arc<F::Client>> {
        let started = Instant::now();
        match deadline.run(self.router.resolve(scope)).await {
            Ok(client) => client,
            Err(interrupt) => Err(retry::interrupted(interrupt, op, started, 0, None)),
        }
    }

    async fn create_inner(
        &self,
        desired: &ResourceDescriptor,
        deadline: &Deadline,
    ) -> Result<Created> {
        let op = format!("create {}", self.kind.name);
        self.check_kind(&op, desired)?;

        let mut payload = desired.attributes().clone();
        for reference in desired.references() {
            self.import_reference(reference, &mut payload, deadline).await?;
        }

        let client = self.client(&op, desired.scope(), deadline).await?;
        let api = &*client;
        let kind = self.kind.name.as_str();
        let attributes = &payload;
        let action = self.action("create");
        let outcome = self
            .retrier
            .run(Call::write(&op).for_action(&action), deadline, move || {
                api.create(kind, attributes)
            })
            .await?;
        let created = self.settle(api, outcome, deadline).await?;

        let identity = identity::derive(
            &self.kind.identity,
            &payload,
            &created.attributes,
            desired.scope(),
        )
        .map_err(|e| ReconcileError::partial(None, vec![Step::Create], Step::Identity, e))?;
        tracing::debug!("Created {} {}", kind, identity);

        let mut committed = vec![Step::Create];
        let tags = desired.managed_tags();
        if !tags.is_empty() {
            let change = PartitionChange::set(Partition::TAG_ADD, tags);
            if let Err(e) = self.apply_change(api, &identity, &change, deadline).await {
                return Err(ReconcileError::partial(
                    Some(identity.to_string()),
                    committed,
                    Step::Apply(Partition::TAG_ADD),
                    e,
                ));
            }
            committed.push(Step::Apply(Partition::TAG_ADD));
        }

        // A new object may not be visible to reads right away
        let read_op = format!("read {} {}", kind, identity);
        let object = match self
            .fetch(api, &identity, Call::read(&read_op).retry_not_found(), deadline)
            .await
        {
            Ok(object) => object,
            Err(e) => {
                let id = Some(identity.to_string());
                return Err(ReconcileError::partial(id, committed, Step::Refresh, e));
            },
        };

        Ok(Created {
            observed: ObservedState::from_remote(identity.as_str(), object),
            identity,
        })
    }

    /// Read a referenced object (possibly in another scope) and copy the
    /// imported attributes into the create payload
    async fn import_reference(
        &self,
        reference: &Reference,
        payload: &mut Attributes,
        deadline: &Deadline,
    ) -> Result<()> {
        let op = format!(
            "read referenced {} {} in {}",
            reference.kind, reference.identity, reference.scope
        );
        let id = CompositeIdentity::decode(&reference.identity, reference.arity)?;
        let client = self.client(&op, &reference.scope, deadline).await?;
        let api = &*client;
        let kind = reference.kind.as_str();
        let components = id.components();
        let action = format!("{}.read", kind);

        let object = match self
            .retrier
            .run(Call::read(&op).for_action(&action), deadline, move || {
                api.read(kind, components)
            })
            .await
        {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                return Err(ReconcileError::invalid_input(&op, "referenced object does not exist"));
            },
            Err(e) => return Err(e),
        };

        for (from, to) in &reference.imports {
            let value = object.attributes.get(from).ok_or_else(|| {
                ReconcileError::invalid_input(&op, format!("referenced object has no `{}`", from))
            })?;
            payload.insert(to.clone(), value.clone());
        }
        tracing::debug!(
            "Imported {} attribute(s) from {}",
            reference.imports.len(),
            reference.scope
        );
        Ok(())
    }

    async fn read_inner(
        &self,
        scope: &Scope,
        identity: &str,
        deadline: &Deadline,
    ) -> Result<Lookup> {
        let id = self.decode(identity)?;
        let op = format!("read {} {}", self.kind.name, id);
        let client = self.client(&op, scope, deadline).await?;
        match self.fetch(&*client, &id, Call::read(&op), deadline).await {
            Ok(object) => {
                let observed = ObservedState::from_remote(id.as_str(), object);
                Ok(Lookup::Present(observed))
            },
            Err(e) if e.is_not_found() => {
                tracing::debug!("{} {} is absent", self.kind.name, id);
                Ok(Lookup::Absent)
            },
            Err(e) => Err(e),
        }
    }

    async fn update_inner(
        &self,
        identity: &str,
        desired: &ResourceDescriptor,
        deadline: &Deadline,
    ) -> Result<ObservedState> {
        let id = self.decode(identity)?;
        let op = format!("update {} {}", self.kind.name, id);
        self.check_kind(&op, desired)?;

        let client = self.client(&op, desired.scope(), deadline).await?;
        let api = &*client;
        let read_op = format!("read {} {}", self.kind.name, id);
        let object = self.fetch(api, &id, Call::read(&read_op), deadline).await?;
        let observed = ObservedState::from_remote(id.as_str(), object);

        let plan = UpdatePlan::between(desired, &observed);
        if plan.is_noop() {
            tracing::debug!("{} {} already matches desired state", self.kind.name, id);
            return Ok(observed);
        }

        let violations = plan.create_only_violations(desired.create_only());
        if !violations.is_empty() {
            return Err(ReconcileError::invalid_input(
                &op,
                format!("argument(s) cannot be changed: {}", violations.join(", ")),
            ));
        }

        let mut committed = Vec::new();
        for change in plan.partitions() {
            let step = Step::Apply(change.partition);
            if let Err(e) = self.apply_change(api, &id, &change, deadline).await {
                if committed.is_empty() {
                    return Err(e);
                }
                return Err(ReconcileError::partial(Some(id.to_string()), committed, step, e));
            }
            tracing::debug!("{} {}: {} committed", self.kind.name, id, step);
            committed.push(step);
        }

        match self.fetch(api, &id, Call::read(&read_op), deadline).await {
            Ok(object) => Ok(ObservedState::from_remote(id.as_str(), object)),
            Err(e) => {
                let id = Some(id.to_string());
                Err(ReconcileError::partial(id, committed, Step::Refresh, e))
            },
        }
    }

    async fn delete_inner(
        &self,
        scope: &Scope,
        identity: &str,
        deadline: &Deadline,
    ) -> Result<Deletion> {
        let id = self.decode(identity)?;
        let op = format!("delete {} {}", self.kind.name, id);
        let client = self.client(&op, scope, deadline).await?;
        let api = &*client;

        let read_op = format!("read {} {}", self.kind.name, id);
        match self.fetch(api, &id, Call::read(&read_op), deadline).await {
            Ok(_) => {},
            Err(e) if e.is_not_found() => {
                tracing::debug!("{} {} already absent, nothing to delete", self.kind.name, id);
                return Ok(Deletion::AlreadyAbsent);
            },
            Err(e) => return Err(e),
        }

        let kind = self.kind.name.as_str();
        let components = id.components();
        let action = self.action("delete");
        let settled = match self
            .retrier
            .run(Call::write(&op).for_action(&action), deadline, move || {
                api.delete(kind, components)
            })
            .await
        {
            Ok(outcome) => self.settle(api, outcome, deadline).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match settled {
            Ok(()) => Ok(Deletion::Deleted),
            Err(e) if e.is_not_found() => Ok(Deletion::Deleted),
            Err(e) => {
                if e.kind() == ErrorKind::Conflict {
                    tracing::error!(
                        "{} {} is in a state that forbids deletion",
                        self.kind.name,
                        id
                    );
                }
                Err(e)
            },
        }
    }

    async fn drift_inner(
        &self,
        identity: &str,
        desired: &ResourceDescriptor,
        deadline: &Deadline,
    ) -> Result<Drift> {
        let id = self.decode(identity)?;
        let op = format!("detect drift of {} {}", self.kind.name, id);
        self.check_kind(&op, desired)?;

        let observed = match self.read_inner(desired.scope(), identity, deadline).await? {
            Lookup::Present(observed) => observed,
            Lookup::Absent => return Ok(Drift::Absent),
        };
        let plan = UpdatePlan::between(desired, &observed);
        if plan.is_noop() {
            Ok(Drift::InSync)
        } else {
            tracing::debug!(
                "{} {} drifted: {} attribute(s), {} tag(s)",
                self.kind.name,
                id,
                plan.attributes.len(),
                plan.tags.len()
            );
            Ok(Drift::Drifted(plan))
        }
    }

    async fn fetch(
        &self,
        api: &F::Client,
        id: &CompositeIdentity,
        call: Call<'_>,
        deadline: &Deadline,
    ) -> Result<RemoteObject> {
        let kind = self.kind.name.as_str();
        let components = id.components();
        let action = self.action("read");
        self.retrier
            .run(call.for_action(&action), deadline, move || api.read(kind, components))
            .await
    }

    async fn apply_change(
        &self,
        api: &F::Client,
        id: &CompositeIdentity,
        change: &PartitionChange,
        deadline: &Deadline,
    ) -> Result<()> {
        let op = format!("{} on {} {}", change.partition, self.kind.name, id);
        let kind = self.kind.name.as_str();
        let components = id.components();
        let action = self.action(&change.partition.to_string());
        let outcome = self
            .retrier
            .run(Call::write(&op).for_action(&action), deadline, move || {
                api.apply(kind, components, change)
            })
            .await?;
        self.settle(api, outcome, deadline).await?;
        Ok(())
    }

    /// Wait for an accepted call to finish; completed calls pass through
    async fn settle(
        &self,
        api: &F::Client,
        outcome: CallOutcome,
        deadline: &Deadline,
    ) -> Result<RemoteObject> {
        match outcome {
            CallOutcome::Completed(object) => Ok(object),
            CallOutcome::Accepted(handle) => {
                tracing::debug!("Waiting for {}", handle);
                self.poller.wait(api, &handle, deadline).await
            },
        }
    }
}
