//! Rewrites module sources with registered patches and recompiles them.

use crate::broadcaster::BroadcastShim;
use crate::chunk::Chunk;
use crate::compiler::Compiler;
use crate::error::PatchError;
use crate::module::{Factory, ModuleId};
use crate::registry::{rewrite, PatchDescriptor, PatchOutcome, PatchRegistry};
use crate::subscription::SubscriptionTable;
use std::rc::Rc;

#[derive(Clone)]
pub struct ModulePatcher {
    registry: PatchRegistry,
    subscriptions: SubscriptionTable,
    compiler: Rc<dyn Compiler>,
    label_modules: bool,
}

impl ModulePatcher {
    pub fn new(
        registry: PatchRegistry,
        subscriptions: SubscriptionTable,
        compiler: Rc<dyn Compiler>,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            compiler,
            label_modules: true,
        }
    }

    /// Prefix compiled sources with a comment naming the patch owners.
    pub fn label_modules(mut self, enabled: bool) -> Self {
        self.label_modules = enabled;
        self
    }

    /// Patch and wrap every module of `chunk` in place, in delivery order.
    pub fn patch_chunk(&self, chunk: &mut Chunk) {
        for (id, factory) in chunk.modules.iter_mut() {
            *factory = self.patch_module(id, factory.clone());
        }
    }

    /// Returns the broadcaster-wrapped factory for one module.
    ///
    /// Every still-active patch whose find-string occurs in the source is
    /// applied, in registration order, each one on top of the previous
    /// one's output. A patch is retired after its first attempt whatever the
    /// outcome; a failed attempt leaves the module as it was before it.
    pub fn patch_module(&self, id: &ModuleId, original: Factory) -> Factory {
        let shim = Rc::new(BroadcastShim::new(
            id.clone(),
            original.clone(),
            self.subscriptions.clone(),
        ));

        let mut code = original.source().to_string();
        let mut owners: Vec<String> = Vec::new();

        for (patch_id, patch) in self.registry.snapshot() {
            if !code.contains(patch.find.as_str()) || !self.registry.is_active(patch_id) {
                continue;
            }

            match self.apply(id, &code, &patch, &owners) {
                Ok((patched, factory)) => {
                    shim.install(factory, &patch.owner);
                    if !owners.contains(&patch.owner) {
                        owners.push(patch.owner.clone());
                    }
                    code = patched;
                    self.registry
                        .retire(patch_id, id.as_str(), PatchOutcome::Applied);
                    tracing::debug!(module = %id, owner = %patch.owner, find = %patch.find, "patch applied");
                }
                Err(err) => {
                    let outcome = if err.is_no_match() {
                        PatchOutcome::NoMatch
                    } else {
                        PatchOutcome::Failed
                    };
                    self.registry.retire(patch_id, id.as_str(), outcome);
                    tracing::warn!(
                        module = %id,
                        owner = %patch.owner,
                        find = %patch.find,
                        error = %err,
                        "patch abandoned"
                    );
                }
            }
        }

        Factory::from_rc(code, shim)
    }

    fn apply(
        &self,
        id: &ModuleId,
        code: &str,
        patch: &PatchDescriptor,
        owners: &[String],
    ) -> Result<(String, Factory), PatchError> {
        let patched = rewrite(code, &patch.replacement)?;

        let factory = if self.label_modules {
            let mut by: Vec<&str> = owners.iter().map(String::as_str).collect();
            if !by.contains(&patch.owner.as_str()) {
                by.push(&patch.owner);
            }
            let labelled = format!("// Module {id} - Patched by {}\n{patched}", by.join(", "));
            self.compiler.compile(id, &labelled)?
        } else {
            self.compiler.compile(id, &patched)?
        };

        Ok((patched, factory))
    }
}
