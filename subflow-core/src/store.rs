use crate::events::RuntimeEvent;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// A subscription to be inserted. The store assigns identity, `created_at`
/// and the monotonic `seq` tiebreak.
#[derive(Clone, Debug)]
pub struct NewSubscription {
    pub kind: TriggerKind,
    pub name: String,
    pub scope: SubscriptionScope,
}

/// Persistence trait for subscription-reconciliation state.
///
/// Methods organized by concern. The reconciler, runtime manager and
/// dispatcher operate exclusively through this trait, enabling pluggable
/// backends (MemoryStore for tests and POC, a database for production).
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // ── Subscriptions ──

    async fn insert_subscription(&self, sub: NewSubscription) -> Result<EventSubscription>;

    /// Delete by id. Returns whether the subscription was still present —
    /// the losing side of a consumption race sees `false`.
    async fn delete_subscription(&self, subscription_id: Uuid) -> Result<bool>;

    /// Delete every `Start` subscription owned by a definition. Returns the
    /// deleted records.
    async fn delete_start_subscriptions_for_definition(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<EventSubscription>>;

    /// Delete every `Boundary` subscription owned by an instance. Returns
    /// the deleted records.
    async fn delete_subscriptions_for_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<EventSubscription>>;

    /// All subscriptions matching (kind, name), most recently created first.
    async fn find_by_trigger(
        &self,
        kind: TriggerKind,
        name: &str,
    ) -> Result<Vec<EventSubscription>>;

    /// The `Boundary` subscription binding (kind, name) to one execution.
    async fn find_by_execution(
        &self,
        kind: TriggerKind,
        name: &str,
        execution_id: Uuid,
    ) -> Result<Option<EventSubscription>>;

    /// `Start` subscriptions owned by a definition.
    async fn start_subscriptions_for_definition(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<EventSubscription>>;

    /// Filtered query surface, most recently created first.
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<EventSubscription>>;

    // ── Instances ──

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()>;
    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn update_instance_state(&self, instance_id: Uuid, state: InstanceState) -> Result<()>;
    async fn instances_for_definition(&self, definition_id: Uuid) -> Result<Vec<ProcessInstance>>;
    async fn running_instance_count(&self) -> Result<usize>;

    // ── Executions ──

    async fn save_execution(&self, execution: &Execution) -> Result<()>;
    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<Execution>>;
    async fn delete_executions_for_instance(&self, instance_id: Uuid) -> Result<()>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(&self, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>>;
}
