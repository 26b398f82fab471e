//! Event-subscription reconciliation core for a business-process
//! orchestration engine.
//!
//! Process definitions are deployed in monotonically versioned sequences
//! under a shared key. Only the latest surviving version of a key owns
//! `Start` subscriptions for its declared triggers; every running instance
//! owns `Boundary` subscriptions bound to the version it was started from.
//! This crate keeps exactly the correct set of active subscriptions visible
//! to the inbound-trigger dispatcher as versions are deployed and deleted
//! and as instances come and go.
//!
//! Entry point is [`engine::ProcessEngine`]; persistence is pluggable via
//! [`store::SubscriptionStore`], with [`store_memory::MemoryStore`] as the
//! in-memory backend.

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod store_memory;
pub mod types;

pub use dispatch::{DispatchAction, DispatchOutcome, MessageDispatcher};
pub use engine::{JsonArtifactExtractor, ProcessEngine, TriggerExtractor};
pub use error::EngineError;
pub use events::RuntimeEvent;
pub use reconciler::StartEventReconciler;
pub use registry::DefinitionRegistry;
pub use runtime::RuntimeSubscriptionManager;
pub use store::{NewSubscription, SubscriptionStore};
pub use store_memory::MemoryStore;
pub use types::{
    DefinitionSpec, Deployment, DeploymentArtifact, EventSubscription, Execution, InstanceState,
    ProcessDefinition, ProcessInstance, ScopeKind, SubscriptionFilter, SubscriptionScope,
    Timestamp, TriggerKind, TriggerRef, Version,
};
