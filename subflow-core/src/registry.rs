use crate::error::EngineError;
use crate::types::*;
use anyhow::anyhow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Per-key version index: surviving versions plus a high-water mark that
/// outlives deletion, so version numbers are monotonic and never reused.
#[derive(Default)]
struct KeyIndex {
    /// Surviving versions, ordered. The last entry is the latest.
    versions: BTreeMap<Version, Uuid>,
    high_water: Version,
}

#[derive(Default)]
struct RegistryInner {
    /// Arena of definitions by id.
    definitions: HashMap<Uuid, Arc<ProcessDefinition>>,
    by_key: HashMap<String, KeyIndex>,
    deployments: HashMap<Uuid, Deployment>,
}

/// Stores the ordered set of deployed versions per definition key and
/// resolves "latest" — strictly the maximum surviving version number,
/// whether or not that version declares any start trigger.
pub struct DefinitionRegistry {
    inner: RwLock<RegistryInner>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Record one deployment. Mints definition ids, assigns the next version
    /// number per key, and returns the recorded definitions.
    pub fn record_deployment(
        &self,
        deployment_id: Uuid,
        specs: &[DefinitionSpec],
    ) -> Result<Vec<Arc<ProcessDefinition>>, EngineError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for spec in specs {
            if !seen.insert(spec.key.as_str()) {
                return Err(EngineError::DuplicateKey(spec.key.clone()));
            }
        }

        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        let mut recorded = Vec::with_capacity(specs.len());
        for spec in specs {
            let index = inner.by_key.entry(spec.key.clone()).or_default();
            index.high_water += 1;
            let version = index.high_water;
            let definition = Arc::new(ProcessDefinition {
                definition_id: Uuid::now_v7(),
                key: spec.key.clone(),
                version,
                deployment_id,
                start_triggers: spec.start_triggers.clone(),
                boundary_triggers: spec.boundary_triggers.clone(),
            });
            index.versions.insert(version, definition.definition_id);
            inner
                .definitions
                .insert(definition.definition_id, definition.clone());
            recorded.push(definition);
        }

        inner.deployments.insert(
            deployment_id,
            Deployment {
                deployment_id,
                created_at: now_ms(),
                definition_ids: recorded.iter().map(|d| d.definition_id).collect(),
            },
        );
        Ok(recorded)
    }

    /// Remove a deployment and all definitions it introduced. Returns the
    /// removed definitions so the caller can reconcile their keys. Version
    /// high-water marks survive.
    pub fn record_deletion(
        &self,
        deployment_id: Uuid,
    ) -> Result<Vec<Arc<ProcessDefinition>>, EngineError> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("lock: {e}"))?;
        let deployment = inner
            .deployments
            .remove(&deployment_id)
            .ok_or(EngineError::UnknownDeployment(deployment_id))?;

        let mut removed = Vec::with_capacity(deployment.definition_ids.len());
        for definition_id in &deployment.definition_ids {
            if let Some(definition) = inner.definitions.remove(definition_id) {
                if let Some(index) = inner.by_key.get_mut(&definition.key) {
                    index.versions.remove(&definition.version);
                }
                removed.push(definition);
            }
        }
        Ok(removed)
    }

    /// The surviving definition with the highest version number for a key.
    pub fn latest_version(&self, key: &str) -> Result<Option<Arc<ProcessDefinition>>, EngineError> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        let Some(index) = inner.by_key.get(key) else {
            return Ok(None);
        };
        Ok(index
            .versions
            .values()
            .next_back()
            .and_then(|id| inner.definitions.get(id).cloned()))
    }

    pub fn definition(&self, definition_id: Uuid) -> Result<Option<Arc<ProcessDefinition>>, EngineError> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        Ok(inner.definitions.get(&definition_id).cloned())
    }

    /// All surviving versions for a key, ascending by version.
    pub fn definitions_for_key(&self, key: &str) -> Result<Vec<Arc<ProcessDefinition>>, EngineError> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        let Some(index) = inner.by_key.get(key) else {
            return Ok(Vec::new());
        };
        Ok(index
            .versions
            .values()
            .filter_map(|id| inner.definitions.get(id).cloned())
            .collect())
    }

    pub fn deployment(&self, deployment_id: Uuid) -> Result<Option<Deployment>, EngineError> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        Ok(inner.deployments.get(&deployment_id).cloned())
    }

    /// Definitions introduced by one deployment.
    pub fn definitions_for_deployment(
        &self,
        deployment_id: Uuid,
    ) -> Result<Vec<Arc<ProcessDefinition>>, EngineError> {
        let inner = self.inner.read().map_err(|e| anyhow!("lock: {e}"))?;
        let deployment = inner
            .deployments
            .get(&deployment_id)
            .ok_or(EngineError::UnknownDeployment(deployment_id))?;
        Ok(deployment
            .definition_ids
            .iter()
            .filter_map(|id| inner.definitions.get(id).cloned())
            .collect())
    }
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: &str) -> DefinitionSpec {
        DefinitionSpec {
            key: key.to_string(),
            start_triggers: vec![TriggerRef::message("open")],
            boundary_triggers: BTreeMap::new(),
        }
    }

    #[test]
    fn versions_increase_per_key() {
        let registry = DefinitionRegistry::new();
        let d1 = registry
            .record_deployment(Uuid::now_v7(), &[spec("invoice")])
            .unwrap();
        let d2 = registry
            .record_deployment(Uuid::now_v7(), &[spec("invoice")])
            .unwrap();
        assert_eq!(d1[0].version, 1);
        assert_eq!(d2[0].version, 2);

        let latest = registry.latest_version("invoice").unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.definition_id, d2[0].definition_id);
    }

    #[test]
    fn keys_are_versioned_independently() {
        let registry = DefinitionRegistry::new();
        registry
            .record_deployment(Uuid::now_v7(), &[spec("invoice"), spec("refund")])
            .unwrap();
        let second = registry
            .record_deployment(Uuid::now_v7(), &[spec("refund")])
            .unwrap();
        assert_eq!(second[0].version, 2);
        assert_eq!(registry.latest_version("invoice").unwrap().unwrap().version, 1);
        assert_eq!(registry.latest_version("refund").unwrap().unwrap().version, 2);
    }

    #[test]
    fn deleting_the_max_version_restores_the_previous_one() {
        let registry = DefinitionRegistry::new();
        let dep1 = Uuid::now_v7();
        let dep2 = Uuid::now_v7();
        registry.record_deployment(dep1, &[spec("invoice")]).unwrap();
        registry.record_deployment(dep2, &[spec("invoice")]).unwrap();

        let removed = registry.record_deletion(dep2).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].version, 2);

        let latest = registry.latest_version("invoice").unwrap().unwrap();
        assert_eq!(latest.version, 1);
    }

    #[test]
    fn version_numbers_are_never_reused() {
        let registry = DefinitionRegistry::new();
        let dep2 = Uuid::now_v7();
        registry
            .record_deployment(Uuid::now_v7(), &[spec("invoice")])
            .unwrap();
        registry.record_deployment(dep2, &[spec("invoice")]).unwrap();
        registry.record_deletion(dep2).unwrap();

        // Redeploy after deleting v2: the key's high-water mark survives.
        let third = registry
            .record_deployment(Uuid::now_v7(), &[spec("invoice")])
            .unwrap();
        assert_eq!(third[0].version, 3);
    }

    #[test]
    fn duplicate_key_in_one_deployment_is_rejected() {
        let registry = DefinitionRegistry::new();
        let result = registry.record_deployment(Uuid::now_v7(), &[spec("invoice"), spec("invoice")]);
        assert!(matches!(result, Err(EngineError::DuplicateKey(_))));
        // Nothing was recorded.
        assert!(registry.latest_version("invoice").unwrap().is_none());
    }

    #[test]
    fn unknown_deployment_deletion_fails() {
        let registry = DefinitionRegistry::new();
        let result = registry.record_deletion(Uuid::now_v7());
        assert!(matches!(result, Err(EngineError::UnknownDeployment(_))));
    }

    #[test]
    fn deleting_all_versions_leaves_no_latest() {
        let registry = DefinitionRegistry::new();
        let dep = Uuid::now_v7();
        registry.record_deployment(dep, &[spec("invoice")]).unwrap();
        registry.record_deletion(dep).unwrap();
        assert!(registry.latest_version("invoice").unwrap().is_none());
        assert!(registry.definitions_for_key("invoice").unwrap().is_empty());
    }
}
