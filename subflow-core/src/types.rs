use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Definition version number. Positive, strictly increasing per key.
pub type Version = u32;

pub(crate) fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ─── Triggers ─────────────────────────────────────────────────

/// The two external trigger channels a process can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    Message,
    Signal,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Message => write!(f, "message"),
            TriggerKind::Signal => write!(f, "signal"),
        }
    }
}

/// A named trigger as declared on a definition or an activity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerRef {
    pub kind: TriggerKind,
    pub name: String,
}

impl TriggerRef {
    pub fn message(name: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Message,
            name: name.into(),
        }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Signal,
            name: name.into(),
        }
    }
}

// ─── Definitions and deployments ──────────────────────────────

/// One deployed version of a process definition. Immutable once recorded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub definition_id: Uuid,
    /// Stable logical name shared by all versions.
    pub key: String,
    pub version: Version,
    pub deployment_id: Uuid,
    /// Triggers that start a fresh instance of this version.
    pub start_triggers: Vec<TriggerRef>,
    /// Activity id → the boundary trigger guarding that activity scope.
    pub boundary_triggers: BTreeMap<String, TriggerRef>,
}

/// A deployment groups the definitions that shipped together.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: Uuid,
    pub created_at: Timestamp,
    pub definition_ids: Vec<Uuid>,
}

/// What the trigger extractor yields per process in a deployment artifact.
/// Version numbers and ids are assigned by the registry, not the extractor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefinitionSpec {
    pub key: String,
    #[serde(default)]
    pub start_triggers: Vec<TriggerRef>,
    #[serde(default)]
    pub boundary_triggers: BTreeMap<String, TriggerRef>,
}

/// Opaque deployment payload handed to the trigger extractor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentArtifact {
    pub name: String,
    pub payload: serde_json::Value,
}

// ─── Instances and executions ─────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Running,
    Completed { at: Timestamp },
    Terminated { reason: String, at: Timestamp },
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceState::Running)
    }
}

/// A running (or finished) instance of one definition version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub definition_id: Uuid,
    pub state: InstanceState,
    pub created_at: Timestamp,
}

/// Opaque handle to the point inside an instance where a boundary trigger
/// can resume work. Referenced by id only — the instance may be destroyed
/// out of band by a cascade delete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub instance_id: Uuid,
    pub activity_id: String,
}

// ─── Event subscriptions ──────────────────────────────────────

/// Who owns a subscription and what firing it means.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionScope {
    /// Owned by the latest version of a key; firing starts a new instance.
    Start { definition_id: Uuid },
    /// Owned by one running instance; firing resumes its execution and
    /// consumes the subscription.
    Boundary {
        instance_id: Uuid,
        execution_id: Uuid,
        activity_id: String,
    },
}

/// A persisted binding from a trigger to a definition or execution.
/// Created and deleted, never updated in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventSubscription {
    pub subscription_id: Uuid,
    pub kind: TriggerKind,
    pub name: String,
    pub scope: SubscriptionScope,
    pub created_at: Timestamp,
    /// Store-assigned monotonic counter. Breaks `created_at` ties so the
    /// most-recent-first ordering contract is total.
    pub seq: u64,
}

impl EventSubscription {
    pub fn is_start(&self) -> bool {
        matches!(self.scope, SubscriptionScope::Start { .. })
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self.scope, SubscriptionScope::Boundary { .. })
    }

    /// Owning definition, for `Start`-scoped subscriptions.
    pub fn definition_id(&self) -> Option<Uuid> {
        match self.scope {
            SubscriptionScope::Start { definition_id } => Some(definition_id),
            SubscriptionScope::Boundary { .. } => None,
        }
    }

    /// Owning instance, for `Boundary`-scoped subscriptions.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self.scope {
            SubscriptionScope::Start { .. } => None,
            SubscriptionScope::Boundary { instance_id, .. } => Some(instance_id),
        }
    }
}

/// Scope discriminant for queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Start,
    Boundary,
}

/// Filter for the read-only subscription query surface. Empty filter
/// matches everything.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    pub kind: Option<TriggerKind>,
    pub name: Option<String>,
    pub scope: Option<ScopeKind>,
    pub definition_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
}
