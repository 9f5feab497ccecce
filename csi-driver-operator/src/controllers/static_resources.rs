use std::sync::Arc;

use async_trait::async_trait;

use super::ClusterAccess;
use crate::{
    assets::{AssetLoader, Substitutions, render},
    controller_set::{Controller, ReconcileOutcome, SyncContext},
    errors::OperatorError,
    predicates::{Constant, Predicate},
    store::ObjectKey,
};

/// A manifest installed while `install` holds and deleted while `remove` holds.
pub(crate) struct ConditionalResourceEntry {
    pub asset: String,
    pub install: Arc<dyn Predicate>,
    pub remove: Arc<dyn Predicate>,
}

/// Keeps a list of static manifests installed (or removed).
pub(crate) struct StaticResourceController {
    name: String,
    cluster: ClusterAccess,
    assets: Arc<dyn AssetLoader>,
    substitutions: Substitutions,
    entries: Vec<ConditionalResourceEntry>,
    ignore_not_found_on_create: bool,
}

impl StaticResourceController {
    pub fn new(
        name: &str,
        cluster: ClusterAccess,
        assets: Arc<dyn AssetLoader>,
        substitutions: Substitutions,
    ) -> Self {
        Self {
            name: name.to_string(),
            cluster,
            assets,
            substitutions,
            entries: vec![],
            ignore_not_found_on_create: false,
        }
    }

    /// Manifests which are always installed.
    pub fn with_resources(self, assets: &[&str]) -> Self {
        self.with_conditional_resources(assets, Arc::new(Constant(true)), Arc::new(Constant(false)))
    }

    pub fn with_conditional_resources(
        mut self,
        assets: &[&str],
        install: Arc<dyn Predicate>,
        remove: Arc<dyn Predicate>,
    ) -> Self {
        self.entries.extend(assets.iter().map(|asset| ConditionalResourceEntry {
            asset: asset.to_string(),
            install: install.clone(),
            remove: remove.clone(),
        }));
        self
    }

    /// Skip manifests whose kind is not served (yet), e.g. a missing CRD.
    pub fn with_ignore_not_found_on_create(mut self) -> Self {
        self.ignore_not_found_on_create = true;
        self
    }

    async fn install(&self, entry: &ConditionalResourceEntry) -> Result<bool, OperatorError> {
        let manifest = render(self.assets.as_ref(), &entry.asset, &self.substitutions)?;
        match self.cluster.apply_if_changed(manifest, &self.name).await {
            Err(e) if self.ignore_not_found_on_create && e.is_not_found() => {
                debug!("{}: skipped {}: {}", self.name, entry.asset, e);
                Ok(false)
            }
            result => result,
        }
    }

    async fn remove(&self, entry: &ConditionalResourceEntry) -> Result<bool, OperatorError> {
        let manifest = render(self.assets.as_ref(), &entry.asset, &self.substitutions)?;
        let key = ObjectKey::of(&manifest)?;
        let deleted = self.cluster.store.delete(&key).await?;
        if deleted {
            info!("{}: deleted {}", self.name, key);
        }
        Ok(deleted)
    }

    async fn reconcile(&self) -> Result<bool, OperatorError> {
        // Decide everything before touching anything.
        let mut decisions = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            decisions.push((entry.install.evaluate().await, entry.remove.evaluate().await));
        }
        let conflicts: Vec<&str> = self
            .entries
            .iter()
            .zip(decisions.iter())
            .filter(|(_, (install, remove))| *install && *remove)
            .map(|(entry, _)| entry.asset.as_str())
            .collect();
        if !conflicts.is_empty() {
            return Err(OperatorError::PredicateConflict(format!(
                "install and remove predicates both hold for {}",
                conflicts.join(", ")
            )));
        }

        let mut changed = false;
        let mut errors = vec![];
        for (entry, (install, remove)) in self.entries.iter().zip(decisions) {
            let result = if install {
                self.install(entry).await
            } else if remove {
                self.remove(entry).await
            } else {
                Ok(false)
            };
            match result {
                Ok(c) => changed |= c,
                Err(e) => {
                    warn!("{}: {}: {}", self.name, entry.asset, e);
                    errors.push(e);
                }
            }
        }
        match OperatorError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }
}

#[async_trait]
impl Controller for StaticResourceController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync(&self, _: &SyncContext) -> ReconcileOutcome {
        ReconcileOutcome::from_result(self.reconcile().await)
    }
}
