use crate::types::TriggerKind;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine facade. Storage faults abort the whole
/// operation; every deploy/delete/dispatch call is safe to retry because
/// reconciliation is idempotent.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The trigger is not currently active. A normal outcome, not a fault.
    #[error("no subscription matches {kind} trigger '{name}'")]
    NoMatchingSubscription { kind: TriggerKind, name: String },

    /// Recoverable: re-issue the delete with the cascade flag.
    #[error("deployment {deployment_id} has {live_instances} live instance(s); delete requires cascade")]
    CascadeRequired {
        deployment_id: Uuid,
        live_instances: usize,
    },

    /// Consistency bug, never user-recoverable. Aborts the enclosing unit.
    #[error("subscription invariant violated: {0}")]
    InvariantViolation(String),

    #[error("deployment artifact declares key '{0}' more than once")]
    DuplicateKey(String),

    #[error("unknown deployment {0}")]
    UnknownDeployment(Uuid),

    #[error("no deployed process definition for key '{0}'")]
    UnknownKey(String),

    #[error("unknown process instance {0}")]
    UnknownInstance(Uuid),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
