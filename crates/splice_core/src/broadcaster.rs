//! Shim installed around every delivered module factory.
//!
//! Runs the current (possibly patched) factory, falls back to the original
//! when a patched one fails, then offers the exports to pending
//! subscriptions.

use crate::error::ModuleError;
use crate::module::{Factory, Module, ModuleFn, ModuleId, RequireHandle};
use crate::subscription::SubscriptionTable;
use std::cell::RefCell;

pub struct BroadcastShim {
    id: ModuleId,
    original: Factory,
    current: RefCell<Factory>,
    patched_by: RefCell<Vec<String>>,
    subscriptions: SubscriptionTable,
}

impl BroadcastShim {
    pub fn new(id: ModuleId, original: Factory, subscriptions: SubscriptionTable) -> Self {
        Self {
            id,
            current: RefCell::new(original.clone()),
            original,
            patched_by: RefCell::new(Vec::new()),
            subscriptions,
        }
    }

    /// Swap in a factory compiled from patched source.
    pub fn install(&self, factory: Factory, owner: &str) {
        *self.current.borrow_mut() = factory;
        let mut owners = self.patched_by.borrow_mut();
        if !owners.iter().any(|o| o == owner) {
            owners.push(owner.to_string());
        }
    }

    pub fn is_patched(&self) -> bool {
        !self.current.borrow().same_as(&self.original)
    }

    pub fn patched_by(&self) -> Vec<String> {
        self.patched_by.borrow().clone()
    }

    pub fn original(&self) -> &Factory {
        &self.original
    }
}

impl ModuleFn for BroadcastShim {
    fn call(&self, module: &mut Module, require: &RequireHandle) -> Result<(), ModuleError> {
        let current = self.current.borrow().clone();

        if let Err(err) = current.call(module, require) {
            if current.same_as(&self.original) {
                return Err(err);
            }
            tracing::error!(
                module = %self.id,
                patched_by = ?self.patched_by.borrow(),
                error = %err,
                "patched factory failed, running original"
            );
            module.reset_exports();
            self.original.call(module, require)?;
        }

        self.subscriptions.dispatch(&self.id, &module.exports);
        Ok(())
    }
}
