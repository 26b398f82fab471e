use crate::events::RuntimeEvent;
use crate::store::{NewSubscription, SubscriptionStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    subscriptions: Vec<EventSubscription>,
    /// Monotonic insert counter; never reused after deletion.
    next_seq: u64,
    instances: HashMap<Uuid, ProcessInstance>,
    executions: HashMap<Uuid, Execution>,
    events: Vec<RuntimeEvent>,
}

/// In-memory SubscriptionStore for tests and POC.
///
/// Every trait method takes the interior lock once, so each call is atomic
/// with respect to concurrent callers; the engine composes calls into larger
/// atomic units under its per-key locks.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(sub: &EventSubscription, filter: &SubscriptionFilter) -> bool {
    if let Some(kind) = filter.kind {
        if sub.kind != kind {
            return false;
        }
    }
    if let Some(ref name) = filter.name {
        if &sub.name != name {
            return false;
        }
    }
    if let Some(scope) = filter.scope {
        let matches = match scope {
            ScopeKind::Start => sub.is_start(),
            ScopeKind::Boundary => sub.is_boundary(),
        };
        if !matches {
            return false;
        }
    }
    if let Some(definition_id) = filter.definition_id {
        if sub.definition_id() != Some(definition_id) {
            return false;
        }
    }
    if let Some(instance_id) = filter.instance_id {
        if sub.instance_id() != Some(instance_id) {
            return false;
        }
    }
    true
}

/// Most recently created first; `seq` breaks `created_at` ties.
fn order_recent_first(subs: &mut [EventSubscription]) {
    subs.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    // ── Subscriptions ──

    async fn insert_subscription(&self, sub: NewSubscription) -> Result<EventSubscription> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        inner.next_seq += 1;
        let record = EventSubscription {
            subscription_id: Uuid::now_v7(),
            kind: sub.kind,
            name: sub.name,
            scope: sub.scope,
            created_at: now_ms(),
            seq: inner.next_seq,
        };
        inner.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn delete_subscription(&self, subscription_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        let before = inner.subscriptions.len();
        inner
            .subscriptions
            .retain(|s| s.subscription_id != subscription_id);
        Ok(inner.subscriptions.len() < before)
    }

    async fn delete_start_subscriptions_for_definition(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<EventSubscription>> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        let (deleted, kept): (Vec<_>, Vec<_>) = inner
            .subscriptions
            .drain(..)
            .partition(|s| s.definition_id() == Some(definition_id));
        inner.subscriptions = kept;
        Ok(deleted)
    }

    async fn delete_subscriptions_for_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<EventSubscription>> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        let (deleted, kept): (Vec<_>, Vec<_>) = inner
            .subscriptions
            .drain(..)
            .partition(|s| s.instance_id() == Some(instance_id));
        inner.subscriptions = kept;
        Ok(deleted)
    }

    async fn find_by_trigger(
        &self,
        kind: TriggerKind,
        name: &str,
    ) -> Result<Vec<EventSubscription>> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        let mut found: Vec<_> = inner
            .subscriptions
            .iter()
            .filter(|s| s.kind == kind && s.name == name)
            .cloned()
            .collect();
        order_recent_first(&mut found);
        Ok(found)
    }

    async fn find_by_execution(
        &self,
        kind: TriggerKind,
        name: &str,
        execution_id: Uuid,
    ) -> Result<Option<EventSubscription>> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        Ok(inner
            .subscriptions
            .iter()
            .find(|s| {
                s.kind == kind
                    && s.name == name
                    && matches!(
                        s.scope,
                        SubscriptionScope::Boundary { execution_id: e, .. } if e == execution_id
                    )
            })
            .cloned())
    }

    async fn start_subscriptions_for_definition(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<EventSubscription>> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        let mut found: Vec<_> = inner
            .subscriptions
            .iter()
            .filter(|s| s.definition_id() == Some(definition_id))
            .cloned()
            .collect();
        order_recent_first(&mut found);
        Ok(found)
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<EventSubscription>> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        let mut found: Vec<_> = inner
            .subscriptions
            .iter()
            .filter(|s| matches_filter(s, filter))
            .cloned()
            .collect();
        order_recent_first(&mut found);
        Ok(found)
    }

    // ── Instances ──

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        inner
            .instances
            .insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        Ok(inner.instances.get(&instance_id).cloned())
    }

    async fn update_instance_state(&self, instance_id: Uuid, state: InstanceState) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| anyhow!("instance not found: {instance_id}"))?;
        instance.state = state;
        Ok(())
    }

    async fn instances_for_definition(&self, definition_id: Uuid) -> Result<Vec<ProcessInstance>> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        let mut found: Vec<_> = inner
            .instances
            .values()
            .filter(|i| i.definition_id == definition_id)
            .cloned()
            .collect();
        found.sort_by_key(|i| (i.created_at, i.instance_id));
        Ok(found)
    }

    async fn running_instance_count(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        Ok(inner
            .instances
            .values()
            .filter(|i| i.state == InstanceState::Running)
            .count())
    }

    // ── Executions ──

    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        inner
            .executions
            .insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        Ok(inner.executions.get(&execution_id).cloned())
    }

    async fn delete_executions_for_instance(&self, instance_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        inner.executions.retain(|_, e| e.instance_id != instance_id);
        Ok(())
    }

    // ── Event log ──

    async fn append_event(&self, event: &RuntimeEvent) -> Result<u64> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        inner.events.push(event.clone());
        Ok(inner.events.len() as u64)
    }

    async fn read_events(&self, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        Ok(inner
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as u64 + 1, e.clone()))
            .filter(|(seq, _)| *seq >= from_seq)
            .collect())
    }
}
