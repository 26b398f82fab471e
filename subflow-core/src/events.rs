use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events — the durable audit trail for every subscription-affecting
/// state change. Appended through the store, read back by observability
/// tooling and by tests asserting reconciliation traffic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    DeploymentRecorded {
        deployment_id: Uuid,
        definition_ids: Vec<Uuid>,
    },
    DeploymentDeleted {
        deployment_id: Uuid,
        cascade: bool,
    },
    SubscriptionCreated {
        subscription_id: Uuid,
        kind: TriggerKind,
        name: String,
        scope: SubscriptionScope,
    },
    SubscriptionDeleted {
        subscription_id: Uuid,
        kind: TriggerKind,
        name: String,
    },
    InstanceStarted {
        instance_id: Uuid,
        definition_id: Uuid,
    },
    InstanceEnded {
        instance_id: Uuid,
        state: InstanceState,
    },
    ExecutionResumed {
        execution_id: Uuid,
        instance_id: Uuid,
        kind: TriggerKind,
        name: String,
    },
    /// One inbound trigger, with the fan-out it produced.
    TriggerDispatched {
        kind: TriggerKind,
        name: String,
        started: usize,
        resumed: usize,
    },
}
