use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::registry::DefinitionRegistry;
use crate::store::{NewSubscription, SubscriptionStore};
use crate::types::*;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Owns the instance-scoped half of the subscription lifecycle: boundary
/// subscriptions are created when an instance reaches a guarded activity
/// scope and removed when the instance ends, is deleted, or its deployment
/// is cascade-deleted. Redeployment of sibling versions never touches them.
pub struct RuntimeSubscriptionManager {
    registry: Arc<DefinitionRegistry>,
    store: Arc<dyn SubscriptionStore>,
}

impl RuntimeSubscriptionManager {
    pub fn new(registry: Arc<DefinitionRegistry>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { registry, store }
    }

    /// Create an instance of the given definition version and enter every
    /// boundary-guarded scope it declares (one execution each).
    ///
    /// The definition is bound at start time; it stays authoritative for
    /// this instance even after later deployments change which version is
    /// latest for the key.
    pub async fn start_instance(
        &self,
        definition: &ProcessDefinition,
    ) -> Result<ProcessInstance, EngineError> {
        let instance = ProcessInstance {
            instance_id: Uuid::now_v7(),
            definition_id: definition.definition_id,
            state: InstanceState::Running,
            created_at: now_ms(),
        };
        self.store.save_instance(&instance).await?;
        self.store
            .append_event(&RuntimeEvent::InstanceStarted {
                instance_id: instance.instance_id,
                definition_id: definition.definition_id,
            })
            .await?;
        info!(
            instance_id = %instance.instance_id,
            key = %definition.key,
            version = definition.version,
            "instance started"
        );

        for activity_id in definition.boundary_triggers.keys() {
            let execution = Execution {
                execution_id: Uuid::now_v7(),
                instance_id: instance.instance_id,
                activity_id: activity_id.clone(),
            };
            self.store.save_execution(&execution).await?;
            self.on_scope_reached(
                instance.instance_id,
                execution.execution_id,
                activity_id,
            )
            .await?;
        }
        Ok(instance)
    }

    /// Execution reached an activity scope: subscribe to the boundary
    /// trigger declared on that activity in the instance's own definition
    /// version. Returns `None` if the activity declares no boundary trigger.
    pub async fn on_scope_reached(
        &self,
        instance_id: Uuid,
        execution_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<EventSubscription>, EngineError> {
        let instance = self
            .store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::UnknownInstance(instance_id))?;
        let definition = self
            .registry
            .definition(instance.definition_id)?
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "instance {instance_id} references missing definition {}",
                    instance.definition_id
                ))
            })?;

        let Some(trigger) = definition.boundary_triggers.get(activity_id) else {
            return Ok(None);
        };

        let sub = self
            .store
            .insert_subscription(NewSubscription {
                kind: trigger.kind,
                name: trigger.name.clone(),
                scope: SubscriptionScope::Boundary {
                    instance_id,
                    execution_id,
                    activity_id: activity_id.to_string(),
                },
            })
            .await?;
        self.store
            .append_event(&RuntimeEvent::SubscriptionCreated {
                subscription_id: sub.subscription_id,
                kind: sub.kind,
                name: sub.name.clone(),
                scope: sub.scope.clone(),
            })
            .await?;
        debug!(
            %instance_id,
            activity_id,
            kind = %sub.kind,
            name = %sub.name,
            "boundary subscription created"
        );
        Ok(Some(sub))
    }

    /// Tear down one instance: terminal state, executions gone, every
    /// boundary subscription it owns deleted. Idempotent — repeating the
    /// call for an already-ended instance only re-runs the cleanup.
    pub async fn on_instance_deleted(
        &self,
        instance_id: Uuid,
        reason: &str,
    ) -> Result<(), EngineError> {
        let instance = self
            .store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::UnknownInstance(instance_id))?;

        if !instance.state.is_terminal() {
            let state = InstanceState::Terminated {
                reason: reason.to_string(),
                at: now_ms(),
            };
            self.store
                .update_instance_state(instance_id, state.clone())
                .await?;
            self.store
                .append_event(&RuntimeEvent::InstanceEnded {
                    instance_id,
                    state,
                })
                .await?;
        }

        self.store.delete_executions_for_instance(instance_id).await?;
        let deleted = self
            .store
            .delete_subscriptions_for_instance(instance_id)
            .await?;
        for sub in deleted {
            self.store
                .append_event(&RuntimeEvent::SubscriptionDeleted {
                    subscription_id: sub.subscription_id,
                    kind: sub.kind,
                    name: sub.name,
                })
                .await?;
        }
        info!(%instance_id, reason, "instance deleted");
        Ok(())
    }

    /// Cascade path for deployment deletion: end every live instance of
    /// every definition the deployment introduced. The caller reconciles
    /// the affected keys afterwards.
    pub async fn on_deployment_cascade_deleted(
        &self,
        definitions: &[Arc<ProcessDefinition>],
    ) -> Result<(), EngineError> {
        for definition in definitions {
            for instance in self
                .store
                .instances_for_definition(definition.definition_id)
                .await?
            {
                if instance.state == InstanceState::Running {
                    self.on_instance_deleted(instance.instance_id, "deployment cascade delete")
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use std::collections::BTreeMap;

    fn boundary_spec(key: &str) -> DefinitionSpec {
        DefinitionSpec {
            key: key.to_string(),
            start_triggers: Vec::new(),
            boundary_triggers: BTreeMap::from([(
                "wait-for-payment".to_string(),
                TriggerRef::message("payment"),
            )]),
        }
    }

    struct Fixture {
        registry: Arc<DefinitionRegistry>,
        store: Arc<MemoryStore>,
        runtime: RuntimeSubscriptionManager,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(DefinitionRegistry::new());
            let store = Arc::new(MemoryStore::new());
            let runtime = RuntimeSubscriptionManager::new(registry.clone(), store.clone());
            Self {
                registry,
                store,
                runtime,
            }
        }

        fn record(&self, spec: DefinitionSpec) -> Arc<ProcessDefinition> {
            self.registry
                .record_deployment(Uuid::now_v7(), &[spec])
                .unwrap()
                .remove(0)
        }

        async fn boundary_subs(&self) -> Vec<EventSubscription> {
            self.store
                .list_subscriptions(&SubscriptionFilter {
                    scope: Some(ScopeKind::Boundary),
                    ..Default::default()
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn starting_an_instance_subscribes_its_boundary_triggers() {
        let fx = Fixture::new();
        let def = fx.record(boundary_spec("invoice"));
        let instance = fx.runtime.start_instance(&def).await.unwrap();

        let subs = fx.boundary_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].instance_id(), Some(instance.instance_id));
        assert_eq!(subs[0].name, "payment");
    }

    #[tokio::test]
    async fn boundary_subscriptions_are_bound_to_the_starting_version() {
        let fx = Fixture::new();
        let v1 = fx.record(boundary_spec("invoice"));
        let instance = fx.runtime.start_instance(&v1).await.unwrap();

        // A newer version with a different boundary name changes nothing
        // for the running instance.
        let mut spec = boundary_spec("invoice");
        spec.boundary_triggers =
            BTreeMap::from([("wait-for-payment".to_string(), TriggerRef::message("renamed"))]);
        fx.record(spec);

        let subs = fx.boundary_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "payment");
        assert_eq!(subs[0].instance_id(), Some(instance.instance_id));
    }

    #[tokio::test]
    async fn unguarded_scope_creates_no_subscription() {
        let fx = Fixture::new();
        let def = fx.record(boundary_spec("invoice"));
        let instance = fx.runtime.start_instance(&def).await.unwrap();

        let sub = fx
            .runtime
            .on_scope_reached(instance.instance_id, Uuid::now_v7(), "plain-task")
            .await
            .unwrap();
        assert!(sub.is_none());
        assert_eq!(fx.boundary_subs().await.len(), 1);
    }

    #[tokio::test]
    async fn instance_delete_removes_all_its_boundary_subscriptions() {
        let fx = Fixture::new();
        let def = fx.record(boundary_spec("invoice"));
        let kept = fx.runtime.start_instance(&def).await.unwrap();
        let deleted = fx.runtime.start_instance(&def).await.unwrap();
        assert_eq!(fx.boundary_subs().await.len(), 2);

        fx.runtime
            .on_instance_deleted(deleted.instance_id, "testing")
            .await
            .unwrap();

        let subs = fx.boundary_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].instance_id(), Some(kept.instance_id));

        let ended = fx
            .store
            .load_instance(deleted.instance_id)
            .await
            .unwrap()
            .unwrap();
        assert!(ended.state.is_terminal());
    }

    #[tokio::test]
    async fn cascade_ends_only_the_deployments_own_instances() {
        let fx = Fixture::new();
        let doomed = fx.record(boundary_spec("invoice"));
        let surviving = fx.record(boundary_spec("refund"));
        fx.runtime.start_instance(&doomed).await.unwrap();
        fx.runtime.start_instance(&doomed).await.unwrap();
        let other = fx.runtime.start_instance(&surviving).await.unwrap();

        fx.runtime
            .on_deployment_cascade_deleted(std::slice::from_ref(&doomed))
            .await
            .unwrap();

        let subs = fx.boundary_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].instance_id(), Some(other.instance_id));
        assert_eq!(fx.store.running_instance_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn multiple_boundary_triggers_coexist_on_one_instance() {
        let fx = Fixture::new();
        let spec = DefinitionSpec {
            key: "invoice".to_string(),
            start_triggers: Vec::new(),
            boundary_triggers: BTreeMap::from([
                ("wait-for-payment".to_string(), TriggerRef::message("payment")),
                ("escalation".to_string(), TriggerRef::signal("escalate")),
            ]),
        };
        let def = fx.record(spec);
        let instance = fx.runtime.start_instance(&def).await.unwrap();

        let subs = fx.boundary_subs().await;
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|s| s.instance_id() == Some(instance.instance_id)));
    }
}
