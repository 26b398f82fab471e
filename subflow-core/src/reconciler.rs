use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::registry::DefinitionRegistry;
use crate::store::{NewSubscription, SubscriptionStore};
use crate::types::*;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Synchronizes `Start` subscriptions with the latest surviving version of
/// each definition key.
///
/// Reconciliation is unconditional replacement: every `Start` subscription
/// not owned by the current latest version is deleted, then the latest
/// version's declared triggers are installed. Running it twice for the same
/// deploy/delete event yields the same subscription set.
pub struct StartEventReconciler {
    registry: Arc<DefinitionRegistry>,
    store: Arc<dyn SubscriptionStore>,
}

impl StartEventReconciler {
    pub fn new(registry: Arc<DefinitionRegistry>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { registry, store }
    }

    /// Reconcile every key touched by a deployment.
    pub async fn on_deploy(&self, keys: &BTreeSet<String>) -> Result<(), EngineError> {
        for key in keys {
            self.reconcile_key(key).await?;
        }
        Ok(())
    }

    /// Drop the `Start` subscriptions of deleted definitions, then
    /// re-derive the latest version for each affected key.
    pub async fn on_delete(&self, removed: &[Arc<ProcessDefinition>]) -> Result<(), EngineError> {
        for definition in removed {
            self.clear_definition(definition.definition_id).await?;
        }
        let keys: BTreeSet<&str> = removed.iter().map(|d| d.key.as_str()).collect();
        for key in keys {
            self.reconcile_key(key).await?;
        }
        Ok(())
    }

    /// Re-derive the active start subscriptions for one key.
    pub async fn reconcile_key(&self, key: &str) -> Result<(), EngineError> {
        let latest = self.registry.latest_version(key)?;
        let latest_id = latest.as_ref().map(|d| d.definition_id);

        // Step 1: clear every surviving version that is not the latest.
        // Deleted versions were cleared by on_delete before they left the
        // registry.
        for definition in self.registry.definitions_for_key(key)? {
            if Some(definition.definition_id) != latest_id {
                self.clear_definition(definition.definition_id).await?;
            }
        }

        // Steps 2-4: install the latest version's declared triggers, if any.
        // No fallback to older versions when the latest declares none.
        let Some(latest) = latest else {
            debug!(key, "no surviving version, no start subscriptions");
            return Ok(());
        };

        let existing = self
            .store
            .start_subscriptions_for_definition(latest.definition_id)
            .await?;
        let existing_triggers: HashSet<(TriggerKind, &str)> = existing
            .iter()
            .map(|s| (s.kind, s.name.as_str()))
            .collect();

        for trigger in &latest.start_triggers {
            if existing_triggers.contains(&(trigger.kind, trigger.name.as_str())) {
                continue; // idempotent re-reconciliation
            }
            let sub = self
                .store
                .insert_subscription(NewSubscription {
                    kind: trigger.kind,
                    name: trigger.name.clone(),
                    scope: SubscriptionScope::Start {
                        definition_id: latest.definition_id,
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
                key,
                version = latest.version,
                kind = %sub.kind,
                name = %sub.name,
                "start subscription installed"
            );
        }

        self.check_single_owner(key, &latest).await
    }

    /// Delete all `Start` subscriptions owned by one definition.
    async fn clear_definition(&self, definition_id: Uuid) -> Result<(), EngineError> {
        let deleted = self
            .store
            .delete_start_subscriptions_for_definition(definition_id)
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
        Ok(())
    }

    /// Post-condition: after reconciliation, each declared trigger of the
    /// latest version owns exactly one subscription, and no other version
    /// of the key owns any.
    async fn check_single_owner(
        &self,
        key: &str,
        latest: &ProcessDefinition,
    ) -> Result<(), EngineError> {
        let owned = self
            .store
            .start_subscriptions_for_definition(latest.definition_id)
            .await?;
        let mut seen: HashSet<(TriggerKind, &str)> = HashSet::new();
        for sub in &owned {
            if !seen.insert((sub.kind, sub.name.as_str())) {
                warn!(key, name = %sub.name, "duplicate start subscription after reconcile");
                return Err(EngineError::InvariantViolation(format!(
                    "key '{key}': more than one start subscription for {} '{}'",
                    sub.kind, sub.name
                )));
            }
        }
        for definition in self.registry.definitions_for_key(key)? {
            if definition.definition_id == latest.definition_id {
                continue;
            }
            let stale = self
                .store
                .start_subscriptions_for_definition(definition.definition_id)
                .await?;
            if !stale.is_empty() {
                return Err(EngineError::InvariantViolation(format!(
                    "key '{key}': version {} still owns start subscriptions after reconcile",
                    definition.version
                )));
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

    fn with_start(key: &str, trigger: TriggerRef) -> DefinitionSpec {
        DefinitionSpec {
            key: key.to_string(),
            start_triggers: vec![trigger],
            boundary_triggers: BTreeMap::new(),
        }
    }

    fn without_events(key: &str) -> DefinitionSpec {
        DefinitionSpec {
            key: key.to_string(),
            start_triggers: Vec::new(),
            boundary_triggers: BTreeMap::new(),
        }
    }

    struct Fixture {
        registry: Arc<DefinitionRegistry>,
        store: Arc<MemoryStore>,
        reconciler: StartEventReconciler,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(DefinitionRegistry::new());
            let store = Arc::new(MemoryStore::new());
            let reconciler = StartEventReconciler::new(registry.clone(), store.clone());
            Self {
                registry,
                store,
                reconciler,
            }
        }

        async fn deploy(&self, spec: DefinitionSpec) -> (Uuid, Arc<ProcessDefinition>) {
            let deployment_id = Uuid::now_v7();
            let defs = self
                .registry
                .record_deployment(deployment_id, &[spec])
                .unwrap();
            let keys: BTreeSet<String> = defs.iter().map(|d| d.key.clone()).collect();
            self.reconciler.on_deploy(&keys).await.unwrap();
            (deployment_id, defs[0].clone())
        }

        async fn delete(&self, deployment_id: Uuid) {
            let removed = self.registry.record_deletion(deployment_id).unwrap();
            self.reconciler.on_delete(&removed).await.unwrap();
        }

        async fn start_subs(&self) -> Vec<EventSubscription> {
            self.store
                .list_subscriptions(&SubscriptionFilter {
                    scope: Some(ScopeKind::Start),
                    ..Default::default()
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn redeploy_moves_the_subscription_to_the_new_version() {
        let fx = Fixture::new();
        let (_, v1) = fx.deploy(with_start("invoice", TriggerRef::message("open"))).await;
        let subs = fx.start_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].definition_id(), Some(v1.definition_id));

        let (dep2, v2) = fx.deploy(with_start("invoice", TriggerRef::message("open"))).await;
        let subs = fx.start_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].definition_id(), Some(v2.definition_id));

        // Deleting v2 hands the subscription back to v1.
        fx.delete(dep2).await;
        let subs = fx.start_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].definition_id(), Some(v1.definition_id));
    }

    #[tokio::test]
    async fn latest_without_trigger_suppresses_the_key() {
        let fx = Fixture::new();
        fx.deploy(with_start("invoice", TriggerRef::message("open"))).await;
        let (dep2, _) = fx.deploy(without_events("invoice")).await;
        assert!(fx.start_subs().await.is_empty());

        // Deleting the trigger-less v2 restores v1's subscription.
        fx.delete(dep2).await;
        let subs = fx.start_subs().await;
        assert_eq!(subs.len(), 1);
    }

    #[tokio::test]
    async fn intermediate_version_without_trigger() {
        let fx = Fixture::new();
        let (dep1, v1) = fx.deploy(with_start("invoice", TriggerRef::message("open"))).await;
        let (dep2, _) = fx.deploy(without_events("invoice")).await;
        let (dep3, v3) = fx.deploy(with_start("invoice", TriggerRef::message("open"))).await;

        let subs = fx.start_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].definition_id(), Some(v3.definition_id));

        // v2 becomes latest: it declares nothing, so the key goes dark.
        fx.delete(dep3).await;
        assert!(fx.start_subs().await.is_empty());

        // v1 becomes latest again.
        fx.delete(dep2).await;
        let subs = fx.start_subs().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].definition_id(), Some(v1.definition_id));

        fx.delete(dep1).await;
        assert!(fx.start_subs().await.is_empty());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let fx = Fixture::new();
        fx.deploy(with_start("invoice", TriggerRef::message("open"))).await;

        let before: Vec<Uuid> = fx.start_subs().await.iter().map(|s| s.subscription_id).collect();
        let events_before = fx.store.read_events(1).await.unwrap().len();
        fx.reconciler.reconcile_key("invoice").await.unwrap();
        fx.reconciler.reconcile_key("invoice").await.unwrap();
        let after: Vec<Uuid> = fx.start_subs().await.iter().map(|s| s.subscription_id).collect();

        // Same records, not merely the same count, and no create/delete
        // traffic in the audit log.
        assert_eq!(before, after);
        assert_eq!(fx.store.read_events(1).await.unwrap().len(), events_before);
    }

    #[tokio::test]
    async fn multiple_declared_triggers_each_get_one_subscription() {
        let fx = Fixture::new();
        let spec = DefinitionSpec {
            key: "invoice".to_string(),
            start_triggers: vec![TriggerRef::message("open"), TriggerRef::signal("reopen")],
            boundary_triggers: BTreeMap::new(),
        };
        fx.deploy(spec).await;

        let subs = fx.start_subs().await;
        assert_eq!(subs.len(), 2);
        let kinds: HashSet<TriggerKind> = subs.iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&TriggerKind::Message));
        assert!(kinds.contains(&TriggerKind::Signal));
    }

    #[tokio::test]
    async fn signal_and_message_triggers_do_not_collide() {
        let fx = Fixture::new();
        fx.deploy(with_start("invoice", TriggerRef::message("go"))).await;
        fx.deploy(with_start("refund", TriggerRef::signal("go"))).await;

        let subs = fx.start_subs().await;
        assert_eq!(subs.len(), 2);
        let messages = fx
            .store
            .find_by_trigger(TriggerKind::Message, "go")
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_never_touches_boundary_subscriptions() {
        let fx = Fixture::new();
        let instance_id = Uuid::now_v7();
        fx.store
            .insert_subscription(NewSubscription {
                kind: TriggerKind::Message,
                name: "open".to_string(),
                scope: SubscriptionScope::Boundary {
                    instance_id,
                    execution_id: Uuid::now_v7(),
                    activity_id: "review".to_string(),
                },
            })
            .await
            .unwrap();

        // Deploy and redeploy a version sharing the boundary trigger's name.
        fx.deploy(with_start("invoice", TriggerRef::message("open"))).await;
        let (dep2, _) = fx.deploy(without_events("invoice")).await;
        fx.delete(dep2).await;

        let boundary = fx
            .store
            .list_subscriptions(&SubscriptionFilter {
                scope: Some(ScopeKind::Boundary),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(boundary.len(), 1);
        assert_eq!(boundary[0].instance_id(), Some(instance_id));
    }
}
