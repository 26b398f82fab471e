use crate::dispatch::{DispatchOutcome, MessageDispatcher};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::reconciler::StartEventReconciler;
use crate::registry::DefinitionRegistry;
use crate::runtime::RuntimeSubscriptionManager;
use crate::store::SubscriptionStore;
use crate::types::*;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use uuid::Uuid;

/// Parses a deployment artifact into per-key definition specs. External
/// collaborator seam: the engine never looks inside an artifact itself.
pub trait TriggerExtractor: Send + Sync {
    fn extract(&self, artifact: &DeploymentArtifact) -> anyhow::Result<Vec<DefinitionSpec>>;
}

/// Extractor for artifacts whose payload is the JSON encoding of the
/// definition specs. The test-suite backend, paired with `MemoryStore`.
pub struct JsonArtifactExtractor;

impl TriggerExtractor for JsonArtifactExtractor {
    fn extract(&self, artifact: &DeploymentArtifact) -> anyhow::Result<Vec<DefinitionSpec>> {
        Ok(serde_json::from_value(artifact.payload.clone())?)
    }
}

/// The external interface of the reconciliation core.
///
/// Deploy/delete flow through the registry and the start-event reconciler;
/// instance lifecycle flows through the runtime subscription manager;
/// inbound triggers flow through the dispatcher. Mutations for one call are
/// serialized per definition key, so same-key deploys see monotonic version
/// assignment while different keys proceed in parallel.
pub struct ProcessEngine {
    registry: Arc<DefinitionRegistry>,
    store: Arc<dyn SubscriptionStore>,
    reconciler: StartEventReconciler,
    runtime: Arc<RuntimeSubscriptionManager>,
    dispatcher: MessageDispatcher,
    extractor: Arc<dyn TriggerExtractor>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn SubscriptionStore>, extractor: Arc<dyn TriggerExtractor>) -> Self {
        let registry = Arc::new(DefinitionRegistry::new());
        let runtime = Arc::new(RuntimeSubscriptionManager::new(
            registry.clone(),
            store.clone(),
        ));
        let reconciler = StartEventReconciler::new(registry.clone(), store.clone());
        let dispatcher = MessageDispatcher::new(registry.clone(), store.clone(), runtime.clone());
        Self {
            registry,
            store,
            reconciler,
            runtime,
            dispatcher,
            extractor,
            key_locks: DashMap::new(),
        }
    }

    /// Acquire the per-key locks for one atomic unit. Keys are locked in
    /// sorted order (BTreeSet iteration) so multi-key operations cannot
    /// deadlock each other.
    async fn lock_keys(&self, keys: &BTreeSet<String>) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self.key_locks.entry(key.clone()).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    // ── Deployment ──

    /// Parse an artifact, record its definitions (one new version per key)
    /// and reconcile start subscriptions for every affected key.
    pub async fn deploy(&self, artifact: &DeploymentArtifact) -> Result<Uuid, EngineError> {
        let specs = self.extractor.extract(artifact)?;
        let keys: BTreeSet<String> = specs.iter().map(|s| s.key.clone()).collect();
        let _guards = self.lock_keys(&keys).await;

        let deployment_id = Uuid::now_v7();
        let definitions = self.registry.record_deployment(deployment_id, &specs)?;
        self.store
            .append_event(&RuntimeEvent::DeploymentRecorded {
                deployment_id,
                definition_ids: definitions.iter().map(|d| d.definition_id).collect(),
            })
            .await?;
        self.reconciler.on_deploy(&keys).await?;
        info!(
            %deployment_id,
            artifact = %artifact.name,
            definitions = definitions.len(),
            "deployment recorded"
        );
        Ok(deployment_id)
    }

    /// Delete a deployment and its definitions. Without `cascade` the call
    /// fails if any of its instances is still live; with `cascade` those
    /// instances and their subscriptions are torn down first. Affected keys
    /// are reconciled afterwards.
    pub async fn delete_deployment(
        &self,
        deployment_id: Uuid,
        cascade: bool,
    ) -> Result<(), EngineError> {
        let definitions = self.registry.definitions_for_deployment(deployment_id)?;
        let keys: BTreeSet<String> = definitions.iter().map(|d| d.key.clone()).collect();
        let _guards = self.lock_keys(&keys).await;

        let mut live_instances = 0usize;
        for definition in &definitions {
            live_instances += self
                .store
                .instances_for_definition(definition.definition_id)
                .await?
                .iter()
                .filter(|i| i.state == InstanceState::Running)
                .count();
        }
        if live_instances > 0 && !cascade {
            return Err(EngineError::CascadeRequired {
                deployment_id,
                live_instances,
            });
        }

        if cascade {
            self.runtime
                .on_deployment_cascade_deleted(&definitions)
                .await?;
        }
        let removed = self.registry.record_deletion(deployment_id)?;
        self.reconciler.on_delete(&removed).await?;
        self.store
            .append_event(&RuntimeEvent::DeploymentDeleted {
                deployment_id,
                cascade,
            })
            .await?;
        info!(%deployment_id, cascade, "deployment deleted");
        Ok(())
    }

    // ── Instance lifecycle ──

    /// Start the latest version for a key unconditionally, independent of
    /// any trigger subscription.
    pub async fn start_instance_by_key(&self, key: &str) -> Result<Uuid, EngineError> {
        let latest = self
            .registry
            .latest_version(key)?
            .ok_or_else(|| EngineError::UnknownKey(key.to_string()))?;
        let instance = self.runtime.start_instance(&latest).await?;
        Ok(instance.instance_id)
    }

    pub async fn start_instance_by_message(&self, name: &str) -> Result<Uuid, EngineError> {
        self.start_by_trigger(TriggerKind::Message, name).await
    }

    pub async fn start_instance_by_signal(&self, name: &str) -> Result<Uuid, EngineError> {
        self.start_by_trigger(TriggerKind::Signal, name).await
    }

    /// Start via the dispatcher. Fails before any side effect when no
    /// `Start` subscription is active for the trigger; otherwise performs
    /// the full dispatch fan-out (boundary matches included) and returns
    /// the first started instance.
    async fn start_by_trigger(&self, kind: TriggerKind, name: &str) -> Result<Uuid, EngineError> {
        let no_match = || EngineError::NoMatchingSubscription {
            kind,
            name: name.to_string(),
        };
        let matches = self.dispatcher.resolve(kind, name).await?;
        if !matches.iter().any(|s| s.is_start()) {
            return Err(no_match());
        }
        let outcome = self.dispatcher.dispatch(kind, name).await?;
        let started = outcome.started_instances().next();
        started.ok_or_else(no_match)
    }

    /// Mark the instance terminated and remove everything it owns.
    pub async fn delete_process_instance(
        &self,
        instance_id: Uuid,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.runtime.on_instance_deleted(instance_id, reason).await
    }

    /// Execution reached a boundary-guarded activity scope (reported by the
    /// external execution engine).
    pub async fn scope_reached(
        &self,
        instance_id: Uuid,
        execution_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<EventSubscription>, EngineError> {
        self.runtime
            .on_scope_reached(instance_id, execution_id, activity_id)
            .await
    }

    // ── Dispatch ──

    /// Broad dispatch: act on every subscription matching (kind, name).
    pub async fn dispatch(
        &self,
        kind: TriggerKind,
        name: &str,
    ) -> Result<DispatchOutcome, EngineError> {
        self.dispatcher.dispatch(kind, name).await
    }

    /// Ordered execution references currently waiting on (kind, name).
    pub async fn resolve_executions_for(
        &self,
        kind: TriggerKind,
        name: &str,
    ) -> Result<Vec<Uuid>, EngineError> {
        Ok(self
            .dispatcher
            .resolve(kind, name)
            .await?
            .iter()
            .filter_map(|s| match &s.scope {
                SubscriptionScope::Boundary { execution_id, .. } => Some(*execution_id),
                SubscriptionScope::Start { .. } => None,
            })
            .collect())
    }

    /// Resume one boundary-scoped execution directly by reference.
    pub async fn message_received(
        &self,
        name: &str,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        self.dispatcher
            .resume_execution(TriggerKind::Message, name, execution_id)
            .await
            .map(|_| ())
    }

    /// Signal counterpart of [`Self::message_received`].
    pub async fn signal_received(&self, name: &str, execution_id: Uuid) -> Result<(), EngineError> {
        self.dispatcher
            .resume_execution(TriggerKind::Signal, name, execution_id)
            .await
            .map(|_| ())
    }

    // ── Queries ──

    /// Read-only query surface, most recently created first.
    pub async fn list_event_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<EventSubscription>, EngineError> {
        Ok(self.store.list_subscriptions(filter).await?)
    }

    pub async fn running_instance_count(&self) -> Result<usize, EngineError> {
        Ok(self.store.running_instance_count().await?)
    }

    pub async fn instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>, EngineError> {
        Ok(self.store.load_instance(instance_id).await?)
    }

    pub fn latest_definition(
        &self,
        key: &str,
    ) -> Result<Option<Arc<ProcessDefinition>>, EngineError> {
        self.registry.latest_version(key)
    }

    pub fn definitions_for_key(
        &self,
        key: &str,
    ) -> Result<Vec<Arc<ProcessDefinition>>, EngineError> {
        self.registry.definitions_for_key(key)
    }

    pub fn definitions_for_deployment(
        &self,
        deployment_id: Uuid,
    ) -> Result<Vec<Arc<ProcessDefinition>>, EngineError> {
        self.registry.definitions_for_deployment(deployment_id)
    }
}
