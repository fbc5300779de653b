//! Facade that owns the stores and wires the interceptor into a frame.

use crate::compiler::Compiler;
use crate::config::{EngineConfig, PatchManifest};
use crate::error::ConfigError;
use crate::interceptor::{ChunkInterceptor, FrameContext};
use crate::module::Exports;
use crate::patcher::ModulePatcher;
use crate::registry::{Patch, PatchId, PatchRegistry, Retired};
use crate::subscription::{self, ModuleCache, SubscriptionId, SubscriptionTable};
use std::rc::Rc;

pub struct Engine {
    config: EngineConfig,
    registry: PatchRegistry,
    subscriptions: SubscriptionTable,
    compiler: Rc<dyn Compiler>,
}

impl Engine {
    pub fn new(config: EngineConfig, compiler: Rc<dyn Compiler>) -> Self {
        Self {
            config,
            registry: PatchRegistry::new(),
            subscriptions: SubscriptionTable::new(),
            compiler,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &PatchRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn register_patch(&self, owner: &str, patch: Patch) -> Vec<PatchId> {
        self.registry.register_patch(owner, patch)
    }

    pub fn register_manifest(&self, manifest: &PatchManifest) -> Result<Vec<PatchId>, ConfigError> {
        let patches = manifest.patches()?;
        let ids: Vec<PatchId> = patches
            .into_iter()
            .flat_map(|patch| self.registry.register_patch(&manifest.plugin, patch))
            .collect();
        tracing::debug!(plugin = %manifest.plugin, count = ids.len(), "manifest registered");
        Ok(ids)
    }

    pub fn subscribe<P, C>(&self, predicate: P, callback: C) -> SubscriptionId
    where
        P: Fn(&Exports) -> bool + 'static,
        C: FnOnce(&Exports) -> anyhow::Result<()> + 'static,
    {
        self.subscriptions.subscribe(predicate, callback)
    }

    /// Like [`Engine::subscribe`], but a module already loaded in `cache`
    /// satisfies it immediately. Returns `None` in that case.
    pub fn wait_for<P, C>(
        &self,
        cache: &dyn ModuleCache,
        predicate: P,
        callback: C,
    ) -> Option<SubscriptionId>
    where
        P: Fn(&Exports) -> bool + 'static,
        C: FnOnce(&Exports) -> anyhow::Result<()> + 'static,
    {
        let found = subscription::find(cache, &predicate);
        match found {
            Some(exports) => {
                if let Err(err) = callback(&exports) {
                    let error = format!("{err:#}");
                    tracing::error!(%error, "wait_for callback failed");
                }
                None
            }
            None => Some(self.subscriptions.subscribe(predicate, callback)),
        }
    }

    pub fn patcher(&self) -> ModulePatcher {
        ModulePatcher::new(
            self.registry.clone(),
            self.subscriptions.clone(),
            Rc::clone(&self.compiler),
        )
        .label_modules(self.config.label_patched_modules)
    }

    /// Hook the configured loader global of `context`. Call before the host
    /// bootstraps so no chunk slips past.
    pub fn install(&self, context: &FrameContext) -> ChunkInterceptor {
        let interceptor = ChunkInterceptor::new(&self.config.chunk_global, self.patcher());
        interceptor.install(context);
        interceptor
    }

    /// Log patches that never found their target, and the ones that failed.
    /// Returns the owners with unapplied patches.
    pub fn report(&self) -> Vec<String> {
        let pending = self.registry.pending_owners();
        for owner in &pending {
            tracing::warn!(%owner, "patch never matched any module");
        }
        for Retired { descriptor, module, outcome, .. } in self.registry.retired() {
            tracing::debug!(owner = %descriptor.owner, %module, ?outcome, "patch retired");
        }
        pending
    }
}
