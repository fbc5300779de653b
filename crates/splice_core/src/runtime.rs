//! Reference host runtime: module registry, module cache and `require`.
//!
//! Behaves like a bundler's bootstrap. Chunks arrive through the loader's
//! `push`, their factories are registered (first registration of an id
//! wins), and modules execute lazily on `require`, once, with the result
//! cached.

use crate::chunk::{Chunk, ChunkId};
use crate::error::ModuleError;
use crate::interceptor::{FrameContext, LoaderHandle, PushFn};
use crate::module::{Exports, Factory, Module, ModuleId, Require, RequireHandle};
use crate::subscription::ModuleCache;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

#[derive(Default)]
struct RuntimeState {
    factories: HashMap<ModuleId, Factory>,
    cache: HashMap<ModuleId, Exports>,
    /// Execution order, for cache walks.
    loaded: Vec<ModuleId>,
    installed_chunks: HashSet<ChunkId>,
}

#[derive(Clone, Default)]
pub struct HostRuntime {
    state: Rc<RefCell<RuntimeState>>,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already registered.
    pub fn register(&self, id: ModuleId, factory: Factory) -> bool {
        let mut state = self.state.borrow_mut();
        if state.factories.contains_key(&id) {
            return false;
        }
        state.factories.insert(id, factory);
        true
    }

    pub fn factory(&self, id: &ModuleId) -> Option<Factory> {
        self.state.borrow().factories.get(id).cloned()
    }

    pub fn is_registered(&self, id: &ModuleId) -> bool {
        self.state.borrow().factories.contains_key(id)
    }

    pub fn is_loaded(&self, id: &ModuleId) -> bool {
        self.state.borrow().cache.contains_key(id)
    }

    pub fn installed_chunks(&self) -> Vec<ChunkId> {
        self.state.borrow().installed_chunks.iter().cloned().collect()
    }

    /// Run a module (once) and return its exports.
    pub fn require(&self, id: &ModuleId) -> Result<Exports, ModuleError> {
        let factory = {
            let mut state = self.state.borrow_mut();
            if let Some(exports) = state.cache.get(id) {
                return Ok(exports.clone());
            }
            let factory = state
                .factories
                .get(id)
                .cloned()
                .ok_or_else(|| ModuleError::NotFound(id.clone()))?;
            // Circular requires see an empty exports object.
            state.cache.insert(id.clone(), Module::new(id.clone()).exports);
            factory
        };

        let mut module = Module::new(id.clone());
        let require = RequireHandle::new(Rc::new(self.clone()));
        let result = factory.call(&mut module, &require);

        let mut state = self.state.borrow_mut();
        match result {
            Ok(()) => {
                state.cache.insert(id.clone(), module.exports.clone());
                state.loaded.push(id.clone());
                Ok(module.exports)
            }
            Err(err) => {
                state.cache.remove(id);
                Err(err)
            }
        }
    }

    /// Register a chunk's modules and run its entry, if any. Chunks already
    /// installed are ignored.
    pub fn install_chunk(&self, chunk: Chunk) -> Result<(), ModuleError> {
        {
            let state = self.state.borrow();
            if !chunk.ids.is_empty() && chunk.ids.iter().all(|c| state.installed_chunks.contains(c)) {
                tracing::debug!(chunk = %chunk.label(), "chunk already installed");
                return Ok(());
            }
        }

        for (id, factory) in chunk.modules {
            if !self.register(id.clone(), factory) {
                tracing::trace!(module = %id, "duplicate module id ignored");
            }
        }
        self.state
            .borrow_mut()
            .installed_chunks
            .extend(chunk.ids.iter().cloned());

        if let Some(entry) = chunk.entry {
            self.require(&entry)?;
        }
        Ok(())
    }

    /// The chunk callback the runtime installs as the loader's `push`.
    pub fn chunk_callback(&self) -> PushFn {
        let runtime = self.clone();
        PushFn::chunk_callback(move |chunk| {
            runtime.install_chunk(chunk)?;
            Ok(runtime.state.borrow().installed_chunks.len())
        })
    }

    /// Bootstrap against `context[global]`: reuse the array already there
    /// (or start one), take over its `push`, publish it, then install the
    /// chunks that were queued before the runtime arrived.
    pub fn attach(&self, context: &FrameContext, global: &str) -> Result<LoaderHandle, ModuleError> {
        let loader = context.get(global).unwrap_or_default();
        loader.set_push(self.chunk_callback());
        context.assign(global, loader.clone());

        for chunk in loader.take_queued() {
            self.install_chunk(chunk)?;
        }
        Ok(loader)
    }
}

impl Require for HostRuntime {
    fn require(&self, id: &ModuleId) -> Result<Exports, ModuleError> {
        HostRuntime::require(self, id)
    }
}

impl ModuleCache for HostRuntime {
    fn loaded(&self) -> Vec<(ModuleId, Exports)> {
        let state = self.state.borrow();
        state
            .loaded
            .iter()
            .filter_map(|id| state.cache.get(id).map(|e| (id.clone(), e.clone())))
            .collect()
    }
}
