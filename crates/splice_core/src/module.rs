//! Module ids, module objects and factories

use crate::error::ModuleError;
use rhai::{Dynamic, Map};
use std::fmt;
use std::rc::Rc;

/// Value a module publishes. Normally an object map.
pub type Exports = Dynamic;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ModuleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for ModuleId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// The `module` object handed to a factory.
#[derive(Clone, Debug)]
pub struct Module {
    pub id: ModuleId,
    pub exports: Exports,
}

impl Module {
    pub fn new(id: ModuleId) -> Self {
        Self {
            id,
            exports: Dynamic::from_map(Map::new()),
        }
    }

    /// Drop whatever a failed factory left behind.
    pub fn reset_exports(&mut self) {
        self.exports = Dynamic::from_map(Map::new());
    }
}

/// Resolves other module ids within the same runtime.
pub trait Require {
    fn require(&self, id: &ModuleId) -> Result<Exports, ModuleError>;
}

/// Owned `require` handle. Factories may hold on to it for nested requires.
#[derive(Clone)]
pub struct RequireHandle(Rc<dyn Require>);

impl RequireHandle {
    pub fn new(require: Rc<dyn Require>) -> Self {
        Self(require)
    }

    pub fn require(&self, id: &ModuleId) -> Result<Exports, ModuleError> {
        self.0.require(id)
    }
}

impl fmt::Debug for RequireHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequireHandle")
    }
}

/// Body of a module factory: `(module, require) -> ()`.
pub trait ModuleFn {
    fn call(&self, module: &mut Module, require: &RequireHandle) -> Result<(), ModuleError>;
}

impl<F> ModuleFn for F
where
    F: Fn(&mut Module, &RequireHandle) -> Result<(), ModuleError>,
{
    fn call(&self, module: &mut Module, require: &RequireHandle) -> Result<(), ModuleError> {
        self(module, require)
    }
}

/// A callable module factory together with its source text.
///
/// The source is what patches are matched against; it is the factory's
/// stringified form and never changes for a given factory value.
#[derive(Clone)]
pub struct Factory {
    source: Rc<str>,
    body: Rc<dyn ModuleFn>,
}

impl Factory {
    pub fn new(source: impl Into<Rc<str>>, body: impl ModuleFn + 'static) -> Self {
        Self {
            source: source.into(),
            body: Rc::new(body),
        }
    }

    /// Factory backed by a native closure.
    pub fn from_fn<F>(source: impl Into<Rc<str>>, body: F) -> Self
    where
        F: Fn(&mut Module, &RequireHandle) -> Result<(), ModuleError> + 'static,
    {
        Self::new(source, body)
    }

    pub fn from_rc(source: impl Into<Rc<str>>, body: Rc<dyn ModuleFn>) -> Self {
        Self {
            source: source.into(),
            body,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn call(&self, module: &mut Module, require: &RequireHandle) -> Result<(), ModuleError> {
        self.body.call(module, require)
    }

    /// Identity of the callable, ignoring the source text.
    pub fn same_as(&self, other: &Factory) -> bool {
        std::ptr::eq(
            Rc::as_ptr(&self.body) as *const (),
            Rc::as_ptr(&other.body) as *const (),
        )
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("source_len", &self.source.len())
            .finish_non_exhaustive()
    }
}
