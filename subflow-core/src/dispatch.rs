use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::registry::DefinitionRegistry;
use crate::runtime::RuntimeSubscriptionManager;
use crate::store::SubscriptionStore;
use crate::types::*;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// One action produced by dispatching an inbound trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchAction {
    /// A `Start` subscription matched: a fresh instance was created. The
    /// subscription itself survives — only redeployment reconciles it away.
    InstanceStarted {
        instance_id: Uuid,
        definition_id: Uuid,
    },
    /// A `Boundary` subscription matched: the owning execution was resumed
    /// and the subscription consumed.
    ExecutionResumed {
        execution_id: Uuid,
        instance_id: Uuid,
        subscription_id: Uuid,
    },
}

/// The fan-out a single inbound trigger produced, in resolution order.
#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    pub kind: TriggerKind,
    pub name: String,
    pub actions: Vec<DispatchAction>,
}

impl DispatchOutcome {
    pub fn started_instances(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.actions.iter().filter_map(|a| match a {
            DispatchAction::InstanceStarted { instance_id, .. } => Some(*instance_id),
            DispatchAction::ExecutionResumed { .. } => None,
        })
    }
}

/// Resolves inbound triggers against the subscription store and issues the
/// corresponding actions: instance creation for start matches, execution
/// resumption (with consumption) for boundary matches. One name may do both
/// in a single dispatch.
pub struct MessageDispatcher {
    registry: Arc<DefinitionRegistry>,
    store: Arc<dyn SubscriptionStore>,
    runtime: Arc<RuntimeSubscriptionManager>,
}

impl MessageDispatcher {
    pub fn new(
        registry: Arc<DefinitionRegistry>,
        store: Arc<dyn SubscriptionStore>,
        runtime: Arc<RuntimeSubscriptionManager>,
    ) -> Self {
        Self {
            registry,
            store,
            runtime,
        }
    }

    /// All subscriptions matching (kind, name), most recently created first.
    /// The ordering is an observable contract: callers acting on a subset
    /// rely on it being deterministic.
    pub async fn resolve(
        &self,
        kind: TriggerKind,
        name: &str,
    ) -> Result<Vec<EventSubscription>, EngineError> {
        Ok(self.store.find_by_trigger(kind, name).await?)
    }

    /// Dispatch an inbound trigger: act on every outstanding match at call
    /// time, across both start and boundary scopes.
    pub async fn dispatch(
        &self,
        kind: TriggerKind,
        name: &str,
    ) -> Result<DispatchOutcome, EngineError> {
        let matches = self.resolve(kind, name).await?;
        if matches.is_empty() {
            return Err(EngineError::NoMatchingSubscription {
                kind,
                name: name.to_string(),
            });
        }

        let mut actions = Vec::new();
        for sub in matches {
            match sub.scope.clone() {
                SubscriptionScope::Start { definition_id } => {
                    // A concurrent deployment delete can remove the owning
                    // definition between our snapshot and this point; its
                    // reconciliation deletes the subscription right after.
                    // Stale entry — skip it, like a consumed boundary match.
                    let Some(definition) = self.registry.definition(definition_id)? else {
                        debug!(name, %definition_id, "start subscription owner already deleted");
                        continue;
                    };
                    let instance = self.runtime.start_instance(&definition).await?;
                    actions.push(DispatchAction::InstanceStarted {
                        instance_id: instance.instance_id,
                        definition_id,
                    });
                }
                SubscriptionScope::Boundary {
                    instance_id,
                    execution_id,
                    ..
                } => {
                    // Consume before resuming. A concurrent dispatch that
                    // raced us here sees `false` and skips — at-most-once.
                    if !self.store.delete_subscription(sub.subscription_id).await? {
                        debug!(name, %execution_id, "boundary subscription already consumed");
                        continue;
                    }
                    self.record_resumption(&sub, instance_id, execution_id).await?;
                    actions.push(DispatchAction::ExecutionResumed {
                        execution_id,
                        instance_id,
                        subscription_id: sub.subscription_id,
                    });
                }
            }
        }

        if actions.is_empty() {
            // Every snapshot entry was raced away before we acted on it —
            // same outcome as an empty match set.
            return Err(EngineError::NoMatchingSubscription {
                kind,
                name: name.to_string(),
            });
        }

        let outcome = DispatchOutcome {
            kind,
            name: name.to_string(),
            actions,
        };
        let started = outcome.started_instances().count();
        let resumed = outcome.actions.len() - started;
        self.store
            .append_event(&RuntimeEvent::TriggerDispatched {
                kind,
                name: name.to_string(),
                started,
                resumed,
            })
            .await?;
        info!(%kind, name, started, resumed, "trigger dispatched");
        Ok(outcome)
    }

    /// Resume one specific boundary-scoped execution by reference,
    /// bypassing broad resolution. Consumes exactly its subscription.
    pub async fn resume_execution(
        &self,
        kind: TriggerKind,
        name: &str,
        execution_id: Uuid,
    ) -> Result<DispatchAction, EngineError> {
        let not_matching = || EngineError::NoMatchingSubscription {
            kind,
            name: name.to_string(),
        };
        let sub = self
            .store
            .find_by_execution(kind, name, execution_id)
            .await?
            .ok_or_else(not_matching)?;
        if !self.store.delete_subscription(sub.subscription_id).await? {
            // Raced away between find and delete.
            return Err(not_matching());
        }
        let instance_id = sub.instance_id().ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "execution-scoped subscription {} has no owning instance",
                sub.subscription_id
            ))
        })?;
        self.record_resumption(&sub, instance_id, execution_id).await?;
        Ok(DispatchAction::ExecutionResumed {
            execution_id,
            instance_id,
            subscription_id: sub.subscription_id,
        })
    }

    async fn record_resumption(
        &self,
        sub: &EventSubscription,
        instance_id: Uuid,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        self.store
            .append_event(&RuntimeEvent::SubscriptionDeleted {
                subscription_id: sub.subscription_id,
                kind: sub.kind,
                name: sub.name.clone(),
            })
            .await?;
        self.store
            .append_event(&RuntimeEvent::ExecutionResumed {
                execution_id,
                instance_id,
                kind: sub.kind,
                name: sub.name.clone(),
            })
            .await?;
        Ok(())
    }
}
